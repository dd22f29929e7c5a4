//! In-memory service store for testing.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::types::{HistoryEntry, ServiceName, ServiceRecord};

use super::ServiceStore;

#[derive(Debug, Default)]
struct Inner {
    services: BTreeMap<String, ServiceRecord>,
    history: Vec<HistoryEntry>,
}

/// In-memory service store for testing.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits. A single lock guards both tables so every write
/// is serialised.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceStore for MemoryStore {
    async fn insert(&self, record: &ServiceRecord) -> ControlResult<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let key = record.name.as_str();
        if inner.services.contains_key(key) {
            return Err(ControlError::ServiceExists(key.to_owned()));
        }
        if let Some(owner) = inner.services.values().find(|s| s.port == record.port) {
            return Err(ControlError::PortInUse {
                port: record.port,
                owner: owner.name.to_string(),
            });
        }

        inner.services.insert(key.to_owned(), record.clone());
        Ok(())
    }

    async fn get(&self, name: &ServiceName) -> ControlResult<Option<ServiceRecord>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(inner.services.get(name.as_str()).cloned())
    }

    async fn list(&self) -> ControlResult<Vec<ServiceRecord>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(inner.services.values().cloned().collect())
    }

    async fn update(&self, record: &ServiceRecord) -> ControlResult<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        if let Some(owner) = inner
            .services
            .values()
            .find(|s| s.port == record.port && s.name != record.name)
        {
            return Err(ControlError::PortInUse {
                port: record.port,
                owner: owner.name.to_string(),
            });
        }

        let existing = inner
            .services
            .get_mut(record.name.as_str())
            .ok_or_else(|| ControlError::ServiceNotFound(record.name.to_string()))?;
        *existing = record.clone();

        Ok(())
    }

    async fn delete(&self, name: &ServiceName) -> ControlResult<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        if inner.services.remove(name.as_str()).is_none() {
            return Err(ControlError::ServiceNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn used_ports(&self) -> ControlResult<Vec<u16>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let mut ports: Vec<u16> = inner.services.values().map(|s| s.port).collect();
        ports.sort_unstable();
        Ok(ports)
    }

    async fn port_owner(&self, port: u16) -> ControlResult<Option<String>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(inner
            .services
            .values()
            .find(|s| s.port == port)
            .map(|s| s.name.to_string()))
    }

    async fn append_history(&self, entry: &HistoryEntry) -> ControlResult<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let mut entry = entry.clone();
        #[allow(clippy::as_conversions, clippy::cast_possible_wrap)]
        let id = inner.history.len() as i64 + 1;
        entry.id = Some(id);
        inner.history.push(entry);
        Ok(())
    }

    async fn history(&self, service: &str) -> ControlResult<Vec<HistoryEntry>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(inner
            .history
            .iter()
            .rev()
            .filter(|e| e.service == service)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::types::{HistoryAction, RepoRef};

    fn record(name: &str, port: u16) -> ServiceRecord {
        let now = Utc::now();
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
    async fn insert_and_get() {
        let store = MemoryStore::new();
        let svc = record("api", 3000);
        store.insert(&svc).await.expect("insert failed");

        let fetched = store
            .get(&svc.name)
            .await
            .expect("get failed")
            .expect("service not found");
        assert_eq!(fetched, svc);
    }

    #[tokio::test]
    async fn insert_enforces_name_and_port_uniqueness() {
        let store = MemoryStore::new();
        store.insert(&record("api", 3000)).await.unwrap();

        let dup_name = store.insert(&record("api", 3001)).await.unwrap_err();
        assert!(matches!(dup_name, ControlError::ServiceExists(n) if n == "api"));

        let dup_port = store.insert(&record("web", 3000)).await.unwrap_err();
        assert!(matches!(
            dup_port,
            ControlError::PortInUse { port: 3000, ref owner } if owner == "api"
        ));
    }

    #[tokio::test]
    async fn missing_names_are_not_found() {
        let store = MemoryStore::new();
        let missing = ServiceName::new("ghost").unwrap();

        assert!(store.get(&missing).await.unwrap().is_none());
        assert!(store.update(&record("ghost", 3000)).await.unwrap_err().is_not_found());
        assert!(store.delete(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn port_queries() {
        let store = MemoryStore::new();
        store.insert(&record("b", 3002)).await.unwrap();
        store.insert(&record("a", 3000)).await.unwrap();

        assert_eq!(store.used_ports().await.unwrap(), vec![3000, 3002]);
        assert_eq!(store.port_owner(3002).await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.port_owner(3001).await.unwrap(), None);

        let names: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name.to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn history_is_newest_first_per_service() {
        let store = MemoryStore::new();
        let api = ServiceName::new("api").unwrap();
        let web = ServiceName::new("web").unwrap();

        store
            .append_history(&HistoryEntry::now(&api, HistoryAction::Deploy, Some("v1")))
            .await
            .unwrap();
        store
            .append_history(&HistoryEntry::now(&web, HistoryAction::Deploy, Some("v1")))
            .await
            .unwrap();
        store
            .append_history(&HistoryEntry::now(&api, HistoryAction::Upgrade, Some("v2")))
            .await
            .unwrap();

        let history = store.history("api").await.unwrap();
        let actions: Vec<_> = history.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![HistoryAction::Upgrade, HistoryAction::Deploy]);
        assert_eq!(history[0].id, Some(3));
    }
}
