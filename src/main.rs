// src/main.rs

use std::path::PathBuf;

use tracing::{error, info};

use dhcp4d::config::Config;
use dhcp4d::server::Server;

fn config_dir() -> PathBuf {
    std::env::var("DHCP4D_CONFIG_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/etc/dhcp4d"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = config_dir();
    let config = match Config::load_from_files(&config_dir) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load {}/config.json: {err}; falling back to defaults", config_dir.display());
            Config::default()
        }
    };

    dhcp4d::logging::init_stdout(config.log_level);
    info!(config_dir = %config_dir.display(), worker_threads = config.worker_threads, "starting dhcp4d");

    let server = Server::with_worker_threads(config_dir, config.worker_threads)?;
    server.start()?;
    info!(scopes = server.scopes().len(), "dhcp4d running");

    wait_for_shutdown_signal();

    info!("shutting down");
    if let Err(err) = server.stop() {
        error!(%err, "error while stopping server");
    }
    Ok(())
}

#[cfg(unix)]
fn wait_for_shutdown_signal() {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).expect("failed to register shutdown signal handler");
    if let Some(sig) = signals.forever().next() {
        info!(signal = sig, "received shutdown signal");
    }
}

#[cfg(not(unix))]
fn wait_for_shutdown_signal() {
    // No signal-hook support off unix; block forever so an operator can
    // still stop the process (Ctrl+C terminates the whole process there).
    loop {
        std::thread::park();
    }
}
