//! Self-rescheduling sweep timer: expires offers/leases and persists
//! dirty scopes every tick. Grounded on the teacher's dedicated-thread,
//! `tracing`-instrumented pattern in `src/signal.rs`, generalized from a
//! reload-on-signal callback into a periodic sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::codec::scope_file;
use crate::dns::{self, ZoneStore};
use crate::registry::ScopeRegistry;
use crate::state::{ServerState, ServerStateCell};

pub const SWEEP_PERIOD: Duration = Duration::from_secs(10);

pub struct MaintenanceHandle {
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    registry: Arc<ScopeRegistry>,
    config_dir: std::path::PathBuf,
    zone_store: Option<Arc<dyn ZoneStore>>,
    state: Arc<ServerStateCell>,
) -> MaintenanceHandle {
    let watermark = Arc::new(AtomicU64::new(0));
    let thread = thread::Builder::new()
        .name("dhcp4d-maintenance".to_string())
        .spawn(move || run(registry, config_dir, zone_store, state, watermark))
        .expect("failed to spawn maintenance thread");
    MaintenanceHandle { thread: Some(thread) }
}

fn run(
    registry: Arc<ScopeRegistry>,
    config_dir: std::path::PathBuf,
    zone_store: Option<Arc<dyn ZoneStore>>,
    state: Arc<ServerStateCell>,
    watermark: Arc<AtomicU64>,
) {
    loop {
        thread::sleep(SWEEP_PERIOD);
        if state.is_stopping_or_stopped() {
            return;
        }
        tick(&registry, &config_dir, zone_store.as_ref(), &watermark);
        if state.load() == ServerState::Stopping {
            return;
        }
    }
}

fn tick(
    registry: &ScopeRegistry,
    config_dir: &std::path::Path,
    zone_store: Option<&Arc<dyn ZoneStore>>,
    watermark: &AtomicU64,
) {
    let scan_started_at = now_secs();
    let previous_watermark = watermark.load(Ordering::SeqCst);

    for scope in registry.snapshot() {
        scope.remove_expired_offers();
        let expired_leases = scope.remove_expired_leases();
        for lease in expired_leases {
            if let (Some(store), Some(domain)) = (zone_store, scope.config().domain_name.as_ref()) {
                if let Some(host) = lease.host_name.as_ref() {
                    if let Err(err) = dns::apply_lease_remove(store, domain, &scope.reverse_zone(), host, lease.address) {
                        warn!(%err, scope = %scope.name(), "failed to tear down DNS records for expired lease");
                    }
                }
            }
        }

        if scope.last_modified_secs() > previous_watermark {
            let path = config_dir.join(format!("{}.scope", scope.name()));
            match scope_file::save(&scope, &path) {
                Ok(()) => debug!(scope = %scope.name(), path = %path.display(), "persisted scope"),
                Err(err) => warn!(%err, scope = %scope.name(), "failed to persist scope; will retry next tick"),
            }
        }
    }

    watermark.store(scan_started_at, Ordering::SeqCst);
    info!(scopes = registry.len(), "maintenance sweep complete");
}
