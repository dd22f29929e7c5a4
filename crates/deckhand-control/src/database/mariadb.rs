//! MariaDB database manager.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use tracing::{info, warn};

use crate::config::MariaDbConfig;
use crate::credentials::generate_password;
use crate::error::{ControlError, ControlResult};
use crate::types::{Isolation, ServiceName};

use super::{DatabaseCredentials, DatabaseManager};

/// Principals are only reachable from the local host.
const USER_HOST: &str = "localhost";

/// Read the administrative password from `path`, trimmed.
pub fn read_admin_password(path: &Path) -> ControlResult<SecretString> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ControlError::Config(format!(
            "reading MariaDB admin password from {}: {e}",
            path.display()
        ))
    })?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ControlError::Config(format!(
            "MariaDB admin password file {} is empty",
            path.display()
        )));
    }
    Ok(SecretString::from(trimmed.to_owned()))
}

/// Provisions databases on a MariaDB server.
///
/// Identifiers are derived from validated service names, so they are safe to
/// splice into DDL. Generated passwords are alphanumeric for the same reason.
#[derive(Debug, Clone)]
pub struct MariaDbManager {
    pool: MySqlPool,
}

impl MariaDbManager {
    /// Create a manager from configuration.
    ///
    /// The pool connects lazily, so workflows that never touch the database
    /// never need the server.
    pub fn connect(config: &MariaDbConfig) -> ControlResult<Self> {
        let password = read_admin_password(&config.admin_password_file)?;
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.admin_user)
            .password(password.expose_secret());

        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    /// Check the server is reachable with the admin credentials.
    pub async fn ping(&self) -> ControlResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| {
                ControlError::database(format!(
                    "MariaDB connection failed: {e}; check that MariaDB is running \
                     (systemctl status mariadb) and the admin credentials are correct"
                ))
            })
    }

    async fn schema_exists(&self, schema: &str) -> ControlResult<bool> {
        let found = sqlx::query_scalar::<_, String>(
            "SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = ?",
        )
        .bind(schema)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ControlError::database(format!("checking for database {schema}: {e}")))?;
        Ok(found.is_some())
    }

    async fn exec(&self, statement: &str, what: &str) -> ControlResult<()> {
        sqlx::raw_sql(statement)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| ControlError::database(format!("{what}: {e}")))
    }

    async fn drop_quietly(&self, iso: &Isolation) {
        for statement in drop_statements(iso) {
            if let Err(e) = sqlx::raw_sql(&statement).execute(&self.pool).await {
                warn!(database = %iso.database, error = %e, "cleanup after failed create");
            }
        }
    }
}

fn create_database_sql(iso: &Isolation) -> String {
    format!("CREATE DATABASE `{}`", iso.database)
}

fn create_user_sql(iso: &Isolation, password: &SecretString) -> String {
    format!(
        "CREATE USER '{}'@'{USER_HOST}' IDENTIFIED BY '{}'",
        iso.database_user,
        password.expose_secret()
    )
}

fn grant_sql(iso: &Isolation) -> String {
    format!(
        "GRANT ALL PRIVILEGES ON `{}`.* TO '{}'@'{USER_HOST}'",
        iso.database, iso.database_user
    )
}

fn drop_statements(iso: &Isolation) -> [String; 2] {
    [
        format!("DROP USER IF EXISTS '{}'@'{USER_HOST}'", iso.database_user),
        format!("DROP DATABASE IF EXISTS `{}`", iso.database),
    ]
}

#[async_trait]
impl DatabaseManager for MariaDbManager {
    async fn create_database(&self, name: &ServiceName) -> ControlResult<DatabaseCredentials> {
        let iso = Isolation::for_service(name);

        if self.schema_exists(&iso.database).await? {
            return Err(ControlError::database(format!(
                "database {:?} already exists; choose a different service name",
                iso.database
            )));
        }

        let password = generate_password();

        self.exec(
            &create_database_sql(&iso),
            &format!("creating database {}", iso.database),
        )
        .await?;

        let provisioned = async {
            self.exec(
                &create_user_sql(&iso, &password),
                &format!("creating user {}", iso.database_user),
            )
            .await?;
            self.exec(
                &grant_sql(&iso),
                &format!("granting privileges on {}", iso.database),
            )
            .await?;
            self.exec("FLUSH PRIVILEGES", "flushing privileges").await
        }
        .await;

        if let Err(e) = provisioned {
            self.drop_quietly(&iso).await;
            return Err(e);
        }

        info!(service = %name, database = %iso.database, "database created");
        Ok(DatabaseCredentials {
            name: iso.database,
            user: iso.database_user,
            password,
        })
    }

    async fn drop_database(&self, name: &ServiceName) -> ControlResult<()> {
        let iso = Isolation::for_service(name);
        let [drop_user, drop_schema] = drop_statements(&iso);

        self.exec(&drop_user, &format!("dropping user {}", iso.database_user))
            .await?;
        self.exec(&drop_schema, &format!("dropping database {}", iso.database))
            .await?;

        info!(service = %name, database = %iso.database, "database dropped");
        Ok(())
    }
}
