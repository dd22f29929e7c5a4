//! Common test utilities for orchestrator workflow tests.
//!
//! Every external subsystem is replaced by an in-memory fake that records
//! what it was asked to do into one shared event log, so tests can assert on
//! cross-component ordering. Failures are injected per operation name.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deckhand_control::config::PortsConfig;
use deckhand_control::{
    ArtifactFetcher, ArtifactLayout, Components, ControlError, ControlResult, DatabaseCredentials,
    DatabaseManager, HealthCheck, MemoryStore, Orchestrator, PortAllocator, ProcessSupervisor,
    HistoryEntry, ProxyManager, RepoRef, Route, SecretsWriter, ServiceName, ServiceRecord,
    ServiceStore,
};
use secrecy::SecretString;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Ordered log of operations across all fakes, e.g. `"supervisor.start api"`.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == event)
    }

    /// Position of the first occurrence of `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == event)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Injected failures and cancellations keyed by operation name.
#[derive(Debug, Default)]
pub struct Faults {
    failures: Mutex<HashMap<String, usize>>,
    cancel_after: Mutex<BTreeSet<String>>,
}

impl Faults {
    /// Make the next `times` calls of `op` fail.
    pub fn fail(&self, op: &str, times: usize) {
        self.failures.lock().unwrap().insert(op.to_owned(), times);
    }

    /// Make every call of `op` fail.
    pub fn fail_always(&self, op: &str) {
        self.fail(op, usize::MAX);
    }

    /// Cancel the workflow right after `op` succeeds.
    pub fn cancel_after(&self, op: &str) {
        self.cancel_after.lock().unwrap().insert(op.to_owned());
    }

    fn trip(&self, op: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(op) {
            Some(0) | None => false,
            Some(remaining) => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                true
            }
        }
    }

    fn should_cancel(&self, op: &str) -> bool {
        self.cancel_after.lock().unwrap().contains(op)
    }
}

/// Shared plumbing every fake carries.
#[derive(Debug, Clone)]
pub struct Probe {
    pub log: EventLog,
    pub faults: Arc<Faults>,
    pub cancel: CancellationToken,
}

impl Probe {
    /// Log the call, then apply any injected failure.
    fn call(
        &self,
        op: &str,
        subject: &str,
        error: fn(String) -> ControlError,
    ) -> ControlResult<()> {
        if subject.is_empty() {
            self.log.push(op);
        } else {
            self.log.push(format!("{op} {subject}"));
        }
        if self.faults.trip(op) {
            return Err(error(format!("{op} {subject}: injected failure")));
        }
        Ok(())
    }

    fn done(&self, op: &str) {
        if self.faults.should_cancel(op) {
            self.cancel.cancel();
        }
    }
}

// ----------------------------------------------------------------------
// Fetcher
// ----------------------------------------------------------------------

/// Release source serving a fixed set of tags.
#[derive(Debug)]
pub struct FakeFetcher {
    probe: Probe,
    latest: Mutex<String>,
}

impl FakeFetcher {
    pub fn set_latest(&self, version: &str) {
        *self.latest.lock().unwrap() = version.to_owned();
    }
}

#[async_trait]
impl ArtifactFetcher for FakeFetcher {
    async fn resolve_version(&self, repo: &RepoRef, requested: &str) -> ControlResult<String> {
        self.probe.call("fetcher.resolve", repo.as_str(), ControlError::Fetch)?;
        if requested.is_empty() || requested == "latest" {
            Ok(self.latest.lock().unwrap().clone())
        } else {
            Ok(requested.to_owned())
        }
    }

    async fn download(
        &self,
        _repo: &RepoRef,
        version: &str,
        service: &ServiceName,
    ) -> ControlResult<Vec<u8>> {
        self.probe
            .call("fetcher.download", &format!("{service} {version}"), ControlError::Fetch)?;
        self.probe.done("fetcher.download");
        Ok(format!("#!/bin/sh\n# {service} {version}\n").into_bytes())
    }
}

// ----------------------------------------------------------------------
// Supervisor
// ----------------------------------------------------------------------

#[derive(Debug, Default)]
struct SupervisorState {
    accounts: BTreeSet<String>,
    units: BTreeSet<String>,
    enabled: BTreeSet<String>,
    active: BTreeSet<String>,
}

/// Process supervisor keeping units and accounts in memory.
#[derive(Debug)]
pub struct FakeSupervisor {
    probe: Probe,
    state: Mutex<SupervisorState>,
}

impl FakeSupervisor {
    pub fn has_account(&self, name: &str) -> bool {
        self.state.lock().unwrap().accounts.contains(name)
    }

    pub fn has_unit(&self, name: &str) -> bool {
        self.state.lock().unwrap().units.contains(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state.lock().unwrap().active.contains(name)
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn create_account(&self, name: &ServiceName) -> ControlResult<()> {
        self.probe
            .call("supervisor.create_account", name.as_str(), ControlError::Supervisor)?;
        self.state.lock().unwrap().accounts.insert(name.to_string());
        self.probe.done("supervisor.create_account");
        Ok(())
    }

    async fn remove_account(&self, name: &ServiceName) -> ControlResult<()> {
        self.probe
            .call("supervisor.remove_account", name.as_str(), ControlError::Supervisor)?;
        self.state.lock().unwrap().accounts.remove(name.as_str());
        Ok(())
    }

    async fn write_unit(&self, name: &ServiceName) -> ControlResult<()> {
        self.probe
            .call("supervisor.write_unit", name.as_str(), ControlError::Supervisor)?;
        self.state.lock().unwrap().units.insert(name.to_string());
        Ok(())
    }

    async fn remove_unit(&self, name: &ServiceName) -> ControlResult<()> {
        self.probe
            .call("supervisor.remove_unit", name.as_str(), ControlError::Supervisor)?;
        let mut state = self.state.lock().unwrap();
        state.units.remove(name.as_str());
        state.enabled.remove(name.as_str());
        Ok(())
    }

    async fn reload(&self) -> ControlResult<()> {
        self.probe.call("supervisor.reload", "", ControlError::Supervisor)
    }

    async fn enable(&self, name: &ServiceName) -> ControlResult<()> {
        self.probe
            .call("supervisor.enable", name.as_str(), ControlError::Supervisor)?;
        self.state.lock().unwrap().enabled.insert(name.to_string());
        Ok(())
    }

    async fn disable(&self, name: &ServiceName) -> ControlResult<()> {
        self.probe
            .call("supervisor.disable", name.as_str(), ControlError::Supervisor)?;
        self.state.lock().unwrap().enabled.remove(name.as_str());
        Ok(())
    }

    async fn start(&self, name: &ServiceName, _cancel: &CancellationToken) -> ControlResult<()> {
        self.probe
            .call("supervisor.start", name.as_str(), |m| {
                ControlError::Supervisor(format!("{m}\nrecent logs:\npanic: bad config"))
            })?;
        self.state.lock().unwrap().active.insert(name.to_string());
        self.probe.done("supervisor.start");
        Ok(())
    }

    async fn stop(&self, name: &ServiceName) -> ControlResult<()> {
        self.probe
            .call("supervisor.stop", name.as_str(), ControlError::Supervisor)?;
        self.state.lock().unwrap().active.remove(name.as_str());
        self.probe.done("supervisor.stop");
        Ok(())
    }

    async fn is_active(&self, name: &ServiceName) -> ControlResult<bool> {
        Ok(self.is_running(name.as_str()))
    }
}

// ----------------------------------------------------------------------
// Proxy
// ----------------------------------------------------------------------

/// Reverse proxy keeping live routes in memory.
#[derive(Debug)]
pub struct FakeProxy {
    probe: Probe,
    routes: Mutex<BTreeMap<String, (Route, u16)>>,
}

impl FakeProxy {
    pub fn route(&self, name: &str) -> Option<(Route, u16)> {
        self.routes.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl ProxyManager for FakeProxy {
    async fn activate_route(&self, name: &ServiceName, route: &Route, port: u16) -> ControlResult<()> {
        self.probe
            .call("proxy.activate_route", name.as_str(), ControlError::Proxy)?;
        self.routes
            .lock()
            .unwrap()
            .insert(name.to_string(), (route.clone(), port));
        Ok(())
    }

    async fn deactivate_route(&self, name: &ServiceName) -> ControlResult<()> {
        self.probe
            .call("proxy.deactivate_route", name.as_str(), ControlError::Proxy)?;
        self.routes.lock().unwrap().remove(name.as_str());
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Database
// ----------------------------------------------------------------------

/// Database server tracking which schemas exist.
#[derive(Debug)]
pub struct FakeDatabase {
    probe: Probe,
    schemas: Mutex<BTreeSet<String>>,
}

impl FakeDatabase {
    pub fn exists(&self, schema: &str) -> bool {
        self.schemas.lock().unwrap().contains(schema)
    }
}

#[async_trait]
impl DatabaseManager for FakeDatabase {
    async fn create_database(&self, name: &ServiceName) -> ControlResult<DatabaseCredentials> {
        self.probe
            .call("database.create", name.as_str(), ControlError::Database)?;
        let schema = format!("dh_{name}");
        self.schemas.lock().unwrap().insert(schema.clone());
        self.probe.done("database.create");
        Ok(DatabaseCredentials {
            name: schema.clone(),
            user: schema,
            password: SecretString::from(format!("pw{name}0123456789")),
        })
    }

    async fn drop_database(&self, name: &ServiceName) -> ControlResult<()> {
        self.probe
            .call("database.drop", name.as_str(), ControlError::Database)?;
        self.schemas.lock().unwrap().remove(&format!("dh_{name}"));
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Health
// ----------------------------------------------------------------------

/// Health checker whose verdict is injected.
#[derive(Debug)]
pub struct FakeHealth {
    probe: Probe,
}

#[async_trait]
impl HealthCheck for FakeHealth {
    async fn wait_for_port(&self, port: u16, _cancel: &CancellationToken) -> ControlResult<()> {
        self.probe.call("health.wait", &port.to_string(), |m| {
            ControlError::Health(format!("port did not accept connections: {m}"))
        })
    }
}

// ----------------------------------------------------------------------
// Store
// ----------------------------------------------------------------------

/// Memory store whose record inserts can be made to fail via `store.insert`.
#[derive(Debug)]
pub struct FaultyStore {
    inner: Arc<MemoryStore>,
    faults: Arc<Faults>,
}

#[async_trait]
impl ServiceStore for FaultyStore {
    async fn insert(&self, record: &ServiceRecord) -> ControlResult<()> {
        if self.faults.trip("store.insert") {
            return Err(ControlError::internal(format!(
                "store.insert {}: injected failure",
                record.name
            )));
        }
        self.inner.insert(record).await
    }

    async fn get(&self, name: &ServiceName) -> ControlResult<Option<ServiceRecord>> {
        self.inner.get(name).await
    }

    async fn list(&self) -> ControlResult<Vec<ServiceRecord>> {
        self.inner.list().await
    }

    async fn update(&self, record: &ServiceRecord) -> ControlResult<()> {
        self.inner.update(record).await
    }

    async fn delete(&self, name: &ServiceName) -> ControlResult<()> {
        self.inner.delete(name).await
    }

    async fn used_ports(&self) -> ControlResult<Vec<u16>> {
        self.inner.used_ports().await
    }

    async fn port_owner(&self, port: u16) -> ControlResult<Option<String>> {
        self.inner.port_owner(port).await
    }

    async fn append_history(&self, entry: &HistoryEntry) -> ControlResult<()> {
        self.inner.append_history(entry).await
    }

    async fn history(&self, service: &str) -> ControlResult<Vec<HistoryEntry>> {
        self.inner.history(service).await
    }
}

// ----------------------------------------------------------------------
// Wiring
// ----------------------------------------------------------------------

/// Complete test host with every component wired into an orchestrator.
pub struct TestHost {
    pub dir: TempDir,
    pub log: EventLog,
    pub faults: Arc<Faults>,
    pub cancel: CancellationToken,
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<FakeFetcher>,
    pub supervisor: Arc<FakeSupervisor>,
    pub proxy: Arc<FakeProxy>,
    pub database: Arc<FakeDatabase>,
    pub layout: ArtifactLayout,
    pub secrets: SecretsWriter,
    pub orchestrator: Orchestrator,
}

impl TestHost {
    /// Creates a host with ports 3000-4000 and `v1.0.0` as the latest release.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let log = EventLog::default();
        let faults = Arc::new(Faults::default());
        let cancel = CancellationToken::new();
        let probe = Probe {
            log: log.clone(),
            faults: Arc::clone(&faults),
            cancel: cancel.clone(),
        };

        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn ServiceStore> = Arc::new(FaultyStore {
            inner: Arc::clone(&store),
            faults: Arc::clone(&faults),
        });
        let fetcher = Arc::new(FakeFetcher {
            probe: probe.clone(),
            latest: Mutex::new("v1.0.0".to_owned()),
        });
        let supervisor = Arc::new(FakeSupervisor {
            probe: probe.clone(),
            state: Mutex::default(),
        });
        let proxy = Arc::new(FakeProxy {
            probe: probe.clone(),
            routes: Mutex::default(),
        });
        let database = Arc::new(FakeDatabase {
            probe: probe.clone(),
            schemas: Mutex::default(),
        });
        let health = Arc::new(FakeHealth { probe });

        let layout = ArtifactLayout::new(dir.path().join("bin"));
        let secrets = SecretsWriter::new(dir.path().join("etc"));
        let ports = PortAllocator::new(
            &PortsConfig {
                range_start: 3000,
                range_end: 4000,
            },
            Arc::clone(&shared),
        );

        let orchestrator = Orchestrator::new(
            Components {
                store: shared,
                fetcher: Arc::clone(&fetcher) as Arc<dyn ArtifactFetcher>,
                supervisor: Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
                proxy: Arc::clone(&proxy) as Arc<dyn ProxyManager>,
                database: Arc::clone(&database) as Arc<dyn DatabaseManager>,
                health: health as Arc<dyn HealthCheck>,
                ports,
                layout: layout.clone(),
                secrets: secrets.clone(),
                database_host: "127.0.0.1".to_owned(),
                database_port: 3306,
            },
            cancel.clone(),
        );

        Self {
            dir,
            log,
            faults,
            cancel,
            store,
            fetcher,
            supervisor,
            proxy,
            database,
            layout,
            secrets,
            orchestrator,
        }
    }

    pub fn name(name: &str) -> ServiceName {
        ServiceName::new(name).unwrap()
    }
}

impl Default for TestHost {
    fn default() -> Self {
        Self::new()
    }
}
