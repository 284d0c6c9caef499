//! The server façade: scope lifecycle (add/enable/disable/rename/delete),
//! listener activation, and `start`/`stop` service-state transitions.
//! Grounded on the teacher's `ReservationDb` swap-on-reload idiom
//! (`src/mgmt.rs`) for the hot-swappable zone store, and its
//! dedicated-thread SIGHUP pattern (`src/signal.rs`) for the lifecycle
//! this module now owns instead.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use tracing::{info, warn};

use crate::codec::scope_file;
use crate::dispatch::{TaskDispatcher, ThreadPoolDispatcher};
use crate::dns::ZoneStore;
use crate::listener::{self, ListenerHandle};
use crate::maintenance::{self, MaintenanceHandle};
use crate::registry::{RegistryError, ScopeRegistry};
use crate::scope::Scope;
use crate::state::{ServerState, ServerStateCell};

const DEFAULT_WORKER_THREADS: usize = 8;

#[derive(Debug)]
pub enum ServerError {
    AlreadyRunning,
    NotRunning,
    NotFound,
    DuplicateScope(RegistryError),
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::AlreadyRunning => write!(f, "server is already running"),
            ServerError::NotRunning => write!(f, "server is not running"),
            ServerError::NotFound => write!(f, "no scope with that name exists"),
            ServerError::DuplicateScope(err) => write!(f, "{err}"),
            ServerError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        ServerError::Io(err)
    }
}

/// Tracks how many active scopes are bound to one non-`0.0.0.0` address
/// so the last one to deactivate is the one that tears the socket down.
/// The any-address case reuses `ScopeRegistry`'s own refcount instead,
/// since multiple scopes sharing `0.0.0.0` is the case the distilled spec
/// calls out explicitly.
struct BoundListener {
    handle: ListenerHandle,
    refcount: u32,
}

pub struct Server {
    config_dir: PathBuf,
    registry: Arc<ScopeRegistry>,
    state: Arc<ServerStateCell>,
    dispatcher: Arc<dyn TaskDispatcher>,
    authoritative_zone_root: ArcSwapOption<dyn ZoneStore>,
    listeners: Mutex<HashMap<Ipv4Addr, BoundListener>>,
    any_listener: Mutex<Option<ListenerHandle>>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl Server {
    pub fn new(config_dir: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_worker_threads(config_dir, DEFAULT_WORKER_THREADS)
    }

    /// Same as `new`, but sizes the shared dispatch pool from
    /// `Config::worker_threads` instead of the built-in default.
    pub fn with_worker_threads(config_dir: impl Into<PathBuf>, worker_threads: usize) -> io::Result<Self> {
        let config_dir = config_dir.into();
        std::fs::create_dir_all(&config_dir)?;
        Ok(Server {
            config_dir,
            registry: Arc::new(ScopeRegistry::new()),
            state: Arc::new(ServerStateCell::default()),
            dispatcher: Arc::new(ThreadPoolDispatcher::new(worker_threads)),
            authoritative_zone_root: ArcSwapOption::empty(),
            listeners: Mutex::new(HashMap::new()),
            any_listener: Mutex::new(None),
            maintenance: Mutex::new(None),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn state(&self) -> ServerState {
        self.state.load()
    }

    /// Read-only snapshot of every registered scope, enabled or not.
    pub fn scopes(&self) -> Vec<Arc<Scope>> {
        self.registry.snapshot()
    }

    pub fn get_scope(&self, name: &str) -> Option<Arc<Scope>> {
        self.registry.get(name)
    }

    pub fn authoritative_zone_root(&self) -> Option<Arc<dyn ZoneStore>> {
        self.authoritative_zone_root.load_full()
    }

    pub fn set_authoritative_zone_root(&self, store: Option<Arc<dyn ZoneStore>>) {
        self.authoritative_zone_root.store(store);
    }

    /// Loads every `*.scope` file in `config_dir`, activates listeners
    /// for enabled scopes, and starts the maintenance sweep. Fails if the
    /// server is already running.
    pub fn start(&self) -> Result<(), ServerError> {
        if !self.state.compare_and_swap(ServerState::Stopped, ServerState::Starting) {
            return Err(ServerError::AlreadyRunning);
        }

        for entry in std::fs::read_dir(&self.config_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("scope") {
                continue;
            }
            match scope_file::load(&path) {
                Ok(scope) => {
                    let scope = Arc::new(scope);
                    let enabled = scope.is_enabled();
                    match self.registry.insert(Arc::clone(&scope)) {
                        Ok(()) => {
                            if enabled {
                                if let Err(err) = self.activate_listener(&scope) {
                                    warn!(%err, scope = %scope.name(), "failed to activate listener on startup");
                                }
                            }
                        }
                        Err(err) => warn!(%err, path = %path.display(), "skipping scope file"),
                    }
                }
                Err(err) => warn!(%err, path = %path.display(), "failed to load scope file"),
            }
        }

        let zone_store = self.authoritative_zone_root();
        let maintenance = maintenance::spawn(
            Arc::clone(&self.registry),
            self.config_dir.clone(),
            zone_store,
            Arc::clone(&self.state),
        );
        *self.maintenance.lock().expect("maintenance mutex poisoned") = Some(maintenance);

        self.state.store(ServerState::Running);
        info!(scopes = self.registry.len(), "server started");
        Ok(())
    }

    /// Stops the maintenance sweep, then tears down every listener.
    pub fn stop(&self) -> Result<(), ServerError> {
        if self.state.load() != ServerState::Running {
            return Err(ServerError::NotRunning);
        }
        self.state.store(ServerState::Stopping);

        if let Some(handle) = self.maintenance.lock().expect("maintenance mutex poisoned").take() {
            handle.join();
        }

        self.listeners.lock().expect("listeners mutex poisoned").clear();
        *self.any_listener.lock().expect("any-listener mutex poisoned") = None;

        self.state.store(ServerState::Stopped);
        info!("server stopped");
        Ok(())
    }

    fn activate_listener(&self, scope: &Arc<Scope>) -> io::Result<()> {
        let interface = scope.config().interface_address;
        let zone_store = self.authoritative_zone_root();

        if interface.is_unspecified() {
            let mut guard = self.any_listener.lock().expect("any-listener mutex poisoned");
            if self.registry.acquire_any_address_listener() == 1 {
                let handle = listener::activate(interface, Arc::clone(&self.registry), Arc::clone(&self.dispatcher), zone_store)?;
                *guard = Some(handle);
            }
            return Ok(());
        }

        let mut guard = self.listeners.lock().expect("listeners mutex poisoned");
        if let Some(bound) = guard.get_mut(&interface) {
            bound.refcount += 1;
            return Ok(());
        }
        let handle = listener::activate(interface, Arc::clone(&self.registry), Arc::clone(&self.dispatcher), zone_store)?;
        guard.insert(interface, BoundListener { handle, refcount: 1 });
        Ok(())
    }

    fn deactivate_listener(&self, interface: Ipv4Addr) {
        if interface.is_unspecified() {
            let mut guard = self.any_listener.lock().expect("any-listener mutex poisoned");
            if self.registry.release_any_address_listener() == 0 {
                *guard = None;
            }
            return;
        }
        let mut guard = self.listeners.lock().expect("listeners mutex poisoned");
        if let Some(bound) = guard.get_mut(&interface) {
            bound.refcount = bound.refcount.saturating_sub(1);
            if bound.refcount == 0 {
                guard.remove(&interface);
            }
        }
    }

    fn persist(&self, scope: &Scope) {
        let path = self.config_dir.join(format!("{}.scope", scope.name()));
        if let Err(err) = scope_file::save(scope, &path) {
            warn!(%err, scope = %scope.name(), "failed to persist scope");
        }
    }

    pub fn add_scope(&self, scope: Scope) -> Result<Arc<Scope>, ServerError> {
        let scope = Arc::new(scope);
        self.registry.insert(Arc::clone(&scope)).map_err(ServerError::DuplicateScope)?;
        if scope.is_enabled() && self.state.is_running() {
            self.activate_listener(&scope)?;
        }
        self.persist(&scope);
        Ok(scope)
    }

    pub fn rename_scope(&self, name: &str, new_name: &str) -> Result<(), ServerError> {
        self.registry.rename(name, new_name).map_err(|err| match err {
            RegistryError::NotFound => ServerError::NotFound,
            other => ServerError::DuplicateScope(other),
        })?;
        let old_path = self.config_dir.join(format!("{name}.scope"));
        let _ = std::fs::remove_file(&old_path);
        if let Some(scope) = self.registry.get(new_name) {
            self.persist(&scope);
        }
        Ok(())
    }

    pub fn delete_scope(&self, name: &str) -> Result<(), ServerError> {
        let scope = self.registry.remove(name).ok_or(ServerError::NotFound)?;
        if scope.is_enabled() {
            self.deactivate_listener(scope.config().interface_address);
        }
        let path = self.config_dir.join(format!("{name}.scope"));
        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    pub fn enable_scope(&self, name: &str) -> Result<(), ServerError> {
        let scope = self.registry.get(name).ok_or(ServerError::NotFound)?;
        if !scope.is_enabled() {
            scope.set_enabled(true);
            if self.state.is_running() {
                self.activate_listener(&scope)?;
            }
        }
        self.persist(&scope);
        Ok(())
    }

    pub fn disable_scope(&self, name: &str) -> Result<(), ServerError> {
        let scope = self.registry.get(name).ok_or(ServerError::NotFound)?;
        if scope.is_enabled() {
            scope.set_enabled(false);
            self.deactivate_listener(scope.config().interface_address);
        }
        self.persist(&scope);
        Ok(())
    }

    /// Every committed lease with a host name, across every scope,
    /// keyed by its dotted-decimal address.
    pub fn get_address_client_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for scope in self.registry.snapshot() {
            for lease in scope.snapshot_leases() {
                if let Some(host) = lease.host_name {
                    map.insert(lease.address.to_string(), host.to_string());
                }
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeConfig;
    use std::collections::HashMap as StdHashMap;

    fn config(start: u8, end: u8) -> ScopeConfig {
        ScopeConfig {
            interface_address: Ipv4Addr::new(10, 0, 0, 1),
            start: Ipv4Addr::new(10, 0, 0, start),
            end: Ipv4Addr::new(10, 0, 0, end),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: Ipv4Addr::UNSPECIFIED,
            dns_servers: vec![],
            ntp_servers: vec![],
            domain_name: None,
            dns_ttl: 300,
            lease_time_secs: 3600,
            offer_delay_ms: 0,
            ping_check_timeout_ms: 0,
            exclusions: Vec::new(),
            reservations: StdHashMap::new(),
            vendor_class_allowlist: Vec::new(),
        }
    }

    #[test]
    fn add_scope_persists_a_scope_file() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(dir.path()).unwrap();
        server.add_scope(Scope::new("a", false, config(100, 150))).unwrap();
        assert!(dir.path().join("a.scope").exists());
        assert!(server.get_scope("a").is_some());
    }

    #[test]
    fn rename_scope_fails_when_source_missing() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(dir.path()).unwrap();
        let err = server.rename_scope("nope", "also-nope").unwrap_err();
        assert!(matches!(err, ServerError::NotFound));
    }

    #[test]
    fn rename_scope_moves_the_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(dir.path()).unwrap();
        server.add_scope(Scope::new("a", false, config(100, 150))).unwrap();
        server.rename_scope("a", "b").unwrap();
        assert!(!dir.path().join("a.scope").exists());
        assert!(dir.path().join("b.scope").exists());
        assert!(server.get_scope("b").is_some());
    }

    #[test]
    fn delete_scope_removes_registry_entry_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(dir.path()).unwrap();
        server.add_scope(Scope::new("a", false, config(100, 150))).unwrap();
        server.delete_scope("a").unwrap();
        assert!(server.get_scope("a").is_none());
        assert!(!dir.path().join("a.scope").exists());
    }

    #[test]
    fn stop_without_start_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(dir.path()).unwrap();
        let err = server.stop().unwrap_err();
        assert!(matches!(err, ServerError::NotRunning));
    }

    #[test]
    fn get_address_client_map_only_includes_hosts_with_names() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(dir.path()).unwrap();
        let scope = server.add_scope(Scope::new("a", false, config(100, 150))).unwrap();
        let hw = crate::identity::HardwareAddress::new(1, &[0, 1, 2, 3, 4, 5]);
        let identity = crate::identity::ClientIdentity::from_request(None, &hw);
        scope.find_offer(&identity, &hw, None, Some("laptop")).unwrap();
        scope.commit_lease(&identity, None).unwrap();
        let map = server.get_address_client_map();
        assert_eq!(map.get("10.0.0.100").map(String::as_str), Some("laptop"));
    }
}
