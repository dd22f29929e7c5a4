//! SQLite service store implementation.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::{ControlError, ControlResult};
use crate::types::{
    DatabaseBinding, HistoryAction, HistoryEntry, RepoRef, Route, RouteKind, ServiceName,
    ServiceRecord,
};

use super::ServiceStore;

const SERVICE_COLUMNS: &str = "name, repo, version, prev_version, port, route_type, route_value, \
                               db_name, db_user, extra_env, deployed_at, updated_at";

/// SQLite-backed service store.
///
/// The pool holds a single connection, so every statement is serialised and
/// there is exactly one writer at a time.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the state database at `path`.
    ///
    /// The required tables are created if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> ControlResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ControlError::Config(format!(
                    "failed to create state directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        Self::connect(options).await
    }

    /// Create a store backed by a private in-memory database.
    pub async fn in_memory() -> ControlResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> ControlResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                name TEXT PRIMARY KEY,
                repo TEXT NOT NULL,
                version TEXT NOT NULL,
                prev_version TEXT,
                port INTEGER NOT NULL UNIQUE,
                route_type TEXT,
                route_value TEXT,
                db_name TEXT,
                db_user TEXT,
                extra_env TEXT,
                deployed_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service TEXT NOT NULL,
                action TEXT NOT NULL,
                version TEXT,
                timestamp TEXT NOT NULL,
                detail TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_service ON history (service, id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Parse a row into a ServiceRecord.
    fn row_to_record(row: &SqliteRow) -> ControlResult<ServiceRecord> {
        let name: String = row.try_get("name")?;
        let repo: String = row.try_get("repo")?;
        let port: i64 = row.try_get("port")?;
        let route_type: Option<String> = row.try_get("route_type")?;
        let route_value: Option<String> = row.try_get("route_value")?;
        let db_name: Option<String> = row.try_get("db_name")?;
        let db_user: Option<String> = row.try_get("db_user")?;
        let extra_env: Option<String> = row.try_get("extra_env")?;

        let route = match (route_type, route_value) {
            (Some(kind), Some(value)) => {
                let kind: RouteKind = kind.parse().map_err(|e| {
                    ControlError::Serialisation(format!("service {name}: {e}"))
                })?;
                Some(Route { kind, value })
            }
            _ => None,
        };

        let database = match (db_name, db_user) {
            (Some(name), Some(user)) => Some(DatabaseBinding { name, user }),
            _ => None,
        };

        Ok(ServiceRecord {
            name: ServiceName::new(name.clone())?,
            repo: RepoRef::new(repo)?,
            version: row.try_get("version")?,
            previous_version: row.try_get("prev_version")?,
            port: u16::try_from(port).map_err(|_| {
                ControlError::Serialisation(format!("service {name}: port {port} out of range"))
            })?,
            route,
            database,
            extra_env: decode_map(extra_env.as_deref(), "extra_env")?,
            deployed_at: row.try_get::<DateTime<Utc>, _>("deployed_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }

    fn row_to_history(row: &SqliteRow) -> ControlResult<HistoryEntry> {
        let action: String = row.try_get("action")?;
        let detail: Option<String> = row.try_get("detail")?;

        Ok(HistoryEntry {
            id: Some(row.try_get("id")?),
            service: row.try_get("service")?,
            action: HistoryAction::from_str(&action).map_err(ControlError::Serialisation)?,
            version: row.try_get("version")?,
            timestamp: row.try_get("timestamp")?,
            detail: decode_map(detail.as_deref(), "detail")?,
        })
    }

    /// Translate a constraint violation into a conflict naming the owner.
    async fn conflict(&self, record: &ServiceRecord, err: sqlx::Error) -> ControlError {
        let Some(db_err) = err.as_database_error() else {
            return err.into();
        };
        if !db_err.is_unique_violation() {
            return err.into();
        }

        if db_err.message().contains("services.port") {
            match self.port_owner(record.port).await {
                Ok(Some(owner)) => ControlError::PortInUse {
                    port: record.port,
                    owner,
                },
                Ok(None) => err.into(),
                Err(lookup) => lookup,
            }
        } else {
            ControlError::ServiceExists(record.name.to_string())
        }
    }
}

/// Empty maps are stored as NULL so "absent" and "empty" never diverge.
fn encode_map(map: &BTreeMap<String, String>) -> ControlResult<Option<String>> {
    if map.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(map)
        .map(Some)
        .map_err(|e| ControlError::Serialisation(format!("failed to serialise map: {e}")))
}

fn decode_map(raw: Option<&str>, column: &str) -> ControlResult<BTreeMap<String, String>> {
    match raw {
        None | Some("") => Ok(BTreeMap::new()),
        Some(json) => serde_json::from_str(json).map_err(|e| {
            ControlError::Serialisation(format!("failed to deserialise {column}: {e}"))
        }),
    }
}

#[async_trait]
impl ServiceStore for SqliteStore {
    async fn insert(&self, record: &ServiceRecord) -> ControlResult<()> {
        let extra_env = encode_map(&record.extra_env)?;

        let result = sqlx::query(&format!(
            "INSERT INTO services ({SERVICE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(record.name.as_str())
        .bind(record.repo.as_str())
        .bind(&record.version)
        .bind(&record.previous_version)
        .bind(i64::from(record.port))
        .bind(record.route.as_ref().map(|r| r.kind.as_str()))
        .bind(record.route.as_ref().map(|r| r.value.as_str()))
        .bind(record.database.as_ref().map(|d| d.name.as_str()))
        .bind(record.database.as_ref().map(|d| d.user.as_str()))
        .bind(extra_env)
        .bind(record.deployed_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.conflict(record, e).await),
        }
    }

    async fn get(&self, name: &ServiceName) -> ControlResult<Option<ServiceRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE name = ?"
        ))
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list(&self) -> ControlResult<Vec<ServiceRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn update(&self, record: &ServiceRecord) -> ControlResult<()> {
        let extra_env = encode_map(&record.extra_env)?;

        let result = sqlx::query(
            r#"
            UPDATE services
            SET repo = ?, version = ?, prev_version = ?, port = ?, route_type = ?,
                route_value = ?, db_name = ?, db_user = ?, extra_env = ?, updated_at = ?
            WHERE name = ?
            "#,
        )
        .bind(record.repo.as_str())
        .bind(&record.version)
        .bind(&record.previous_version)
        .bind(i64::from(record.port))
        .bind(record.route.as_ref().map(|r| r.kind.as_str()))
        .bind(record.route.as_ref().map(|r| r.value.as_str()))
        .bind(record.database.as_ref().map(|d| d.name.as_str()))
        .bind(record.database.as_ref().map(|d| d.user.as_str()))
        .bind(extra_env)
        .bind(record.updated_at)
        .bind(record.name.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                Err(ControlError::ServiceNotFound(record.name.to_string()))
            }
            Ok(_) => Ok(()),
            Err(e) => Err(self.conflict(record, e).await),
        }
    }

    async fn delete(&self, name: &ServiceName) -> ControlResult<()> {
        let result = sqlx::query("DELETE FROM services WHERE name = ?")
            .bind(name.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::ServiceNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn used_ports(&self) -> ControlResult<Vec<u16>> {
        let rows = sqlx::query("SELECT port FROM services ORDER BY port")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let port: i64 = row.try_get("port")?;
                u16::try_from(port).map_err(|_| {
                    ControlError::Serialisation(format!("port {port} out of range"))
                })
            })
            .collect()
    }

    async fn port_owner(&self, port: u16) -> ControlResult<Option<String>> {
        let owner = sqlx::query_scalar::<_, String>("SELECT name FROM services WHERE port = ?")
            .bind(i64::from(port))
            .fetch_optional(&self.pool)
            .await?;
        Ok(owner)
    }

    async fn append_history(&self, entry: &HistoryEntry) -> ControlResult<()> {
        let detail = encode_map(&entry.detail)?;

        sqlx::query(
            r#"
            INSERT INTO history (service, action, version, timestamp, detail)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.service)
        .bind(entry.action.as_str())
        .bind(&entry.version)
        .bind(entry.timestamp)
        .bind(detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn history(&self, service: &str) -> ControlResult<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, service, action, version, timestamp, detail
            FROM history
            WHERE service = ?
            ORDER BY id DESC
            "#,
        )
        .bind(service)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_history).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::SubsecRound;

    use super::*;

    fn record(name: &str, port: u16) -> ServiceRecord {
        let now = Utc::now().trunc_subsecs(0);
        ServiceRecord {
            name: ServiceName::new(name).unwrap(),
            repo: RepoRef::new(format!("owner/{name}")).unwrap(),
            version: "v1.0.0".to_owned(),
            previous_version: None,
            port,
            route: None,
            database: None,
            extra_env: BTreeMap::new(),
            deployed_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_get_full_record() {
        let store = SqliteStore::in_memory().await.unwrap();

        let mut svc = record("api", 3000);
        svc.route = Some(Route::new("api.example.com", None).unwrap());
        svc.database = Some(DatabaseBinding {
            name: "dh_api".to_owned(),
            user: "dh_api".to_owned(),
        });
        svc.extra_env.insert("LOG_LEVEL".to_owned(), "debug".to_owned());
        svc.extra_env.insert("FEATURE_X".to_owned(), "on".to_owned());

        store.insert(&svc).await.unwrap();

        let fetched = store.get(&svc.name).await.unwrap().expect("not found");
        assert_eq!(fetched, svc);
    }

    #[tokio::test]
    async fn empty_extra_env_is_stored_as_null() {
        let store = SqliteStore::in_memory().await.unwrap();
        let svc = record("api", 3000);
        store.insert(&svc).await.unwrap();

        let raw: Option<String> =
            sqlx::query_scalar("SELECT extra_env FROM services WHERE name = 'api'")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert!(raw.is_none());

        let fetched = store.get(&svc.name).await.unwrap().unwrap();
        assert!(fetched.extra_env.is_empty());
    }

    #[tokio::test]
    async fn unique_constraints_name_the_conflict() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.insert(&record("api", 3000)).await.unwrap();

        let dup_name = store.insert(&record("api", 3001)).await.unwrap_err();
        assert!(matches!(dup_name, ControlError::ServiceExists(ref n) if n == "api"));

        let dup_port = store.insert(&record("web", 3000)).await.unwrap_err();
        assert!(matches!(
            dup_port,
            ControlError::PortInUse { port: 3000, ref owner } if owner == "api"
        ));
        assert!(store.get(&ServiceName::new("web").unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_swaps_versions() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut svc = record("api", 3000);
        store.insert(&svc).await.unwrap();

        svc.previous_version = Some(svc.version.clone());
        svc.version = "v1.1.0".to_owned();
        store.update(&svc).await.unwrap();

        let fetched = store.get(&svc.name).await.unwrap().unwrap();
        assert_eq!(fetched.version, "v1.1.0");
        assert_eq!(fetched.previous_version.as_deref(), Some("v1.0.0"));
    }

    #[tokio::test]
    async fn missing_names_are_not_found() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ghost = ServiceName::new("ghost").unwrap();

        assert!(store.get(&ghost).await.unwrap().is_none());
        assert!(store.get(&ghost).await.unwrap().is_none());
        assert!(store.update(&record("ghost", 3000)).await.unwrap_err().is_not_found());
        assert!(store.delete(&ghost).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn ports_and_owners() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.insert(&record("web", 3005)).await.unwrap();
        store.insert(&record("api", 3000)).await.unwrap();

        assert_eq!(store.used_ports().await.unwrap(), vec![3000, 3005]);
        assert_eq!(store.port_owner(3005).await.unwrap().as_deref(), Some("web"));
        assert_eq!(store.port_owner(3001).await.unwrap(), None);

        store.delete(&ServiceName::new("web").unwrap()).await.unwrap();
        assert_eq!(store.used_ports().await.unwrap(), vec![3000]);
    }

    #[tokio::test]
    async fn history_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let api = ServiceName::new("api").unwrap();

        store
            .append_history(&HistoryEntry::now(&api, HistoryAction::Deploy, Some("v1")))
            .await
            .unwrap();
        store
            .append_history(
                &HistoryEntry::now(&api, HistoryAction::Upgrade, Some("v2"))
                    .with_detail("from", "v1"),
            )
            .await
            .unwrap();
        store
            .append_history(&HistoryEntry::now(&api, HistoryAction::Remove, None))
            .await
            .unwrap();

        let history = store.history("api").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].action, HistoryAction::Remove);
        assert_eq!(history[0].version, None);
        assert!(history[0].detail.is_empty());
        assert_eq!(history[1].detail.get("from").map(String::as_str), Some("v1"));
        assert!(history[0].id > history[1].id);

        assert!(store.history("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        let store = SqliteStore::open(&path).await.unwrap();
        store.insert(&record("api", 3000)).await.unwrap();
        store.close().await;

        let reopened = SqliteStore::open(&path).await.unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 1);
    }
}
