//! `dhcp4d-ctl`: a local admin CLI operating directly on the `.scope`
//! files in the server's config directory. Grounded on the teacher's
//! `mgmt.rs` admin surface (list/reload/replace), reshaped from a TCP
//! JSON protocol into an offline CLI since this crate's management plane
//! is the scope-file directory itself rather than a running socket.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use compact_str::CompactString;
use serde::Deserialize;

use dhcp4d::codec::scope_file;
use dhcp4d::identity::ClientIdentity;
use dhcp4d::scope::{Reservation, Scope, ScopeConfig};

fn default_config_dir() -> PathBuf {
    std::env::var("DHCP4D_CONFIG_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/etc/dhcp4d"))
}

const USAGE: &str = "\
dhcp4d-ctl [--config-dir <path>] <command>

Commands:
  list-scopes                 list every scope's name, range, and enabled state
  show-scope <name>           show one scope's full configuration and leases
  add-scope <spec.json>       create a new scope from a JSON spec

Options:
  --config-dir <path>         overrides DHCP4D_CONFIG_DIR (default /etc/dhcp4d)
";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = pico_args::Arguments::from_env();

    if args.contains(["-h", "--help"]) {
        print!("{USAGE}");
        return Ok(());
    }

    let config_dir: PathBuf = args
        .opt_value_from_str::<_, String>("--config-dir")?
        .map(PathBuf::from)
        .unwrap_or_else(default_config_dir);

    let command = match args.subcommand()? {
        Some(command) => command,
        None => {
            print!("{USAGE}");
            return Ok(());
        }
    };

    match command.as_str() {
        "list-scopes" => list_scopes(&config_dir),
        "show-scope" => {
            let name: String = args.free_from_str()?;
            show_scope(&config_dir, &name)
        }
        "add-scope" => {
            let spec_path = PathBuf::from(args.free_from_str::<String>()?);
            add_scope(&config_dir, &spec_path)
        }
        other => Err(format!("unknown command `{other}`; see --help").into()),
    }
}

fn scope_files(config_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(config_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("scope") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn list_scopes(config_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    for path in scope_files(config_dir)? {
        let scope = scope_file::load(&path)?;
        let config = scope.config();
        println!(
            "{:<20} {:<8} {}-{} leases={}",
            scope.name(),
            if scope.is_enabled() { "enabled" } else { "disabled" },
            config.start,
            config.end,
            scope.snapshot_leases().len(),
        );
    }
    Ok(())
}

fn show_scope(config_dir: &Path, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let scope = load_named(config_dir, name)?;
    let config = scope.config();
    println!("name: {}", scope.name());
    println!("enabled: {}", scope.is_enabled());
    println!("interface_address: {}", config.interface_address);
    println!("range: {} - {}", config.start, config.end);
    println!("subnet_mask: {}", config.subnet_mask);
    println!("router: {}", config.router);
    println!("dns_servers: {:?}", config.dns_servers);
    println!("ntp_servers: {:?}", config.ntp_servers);
    println!("domain_name: {:?}", config.domain_name);
    println!("lease_time_secs: {}", config.lease_time_secs);
    println!("reservations: {}", config.reservations.len());
    println!("exclusions: {:?}", config.exclusions);
    println!("leases:");
    for lease in scope.snapshot_leases() {
        println!(
            "  {:<15} {:<20} host={:<20} expires_utc={:?}",
            lease.address,
            lease.client_identity,
            lease.host_name.as_deref().unwrap_or("-"),
            lease.expires_utc,
        );
    }
    Ok(())
}

fn load_named(config_dir: &Path, name: &str) -> std::io::Result<Scope> {
    scope_file::load(&config_dir.join(format!("{name}.scope")))
}

/// Wire format for `add-scope`'s JSON argument. Kept separate from
/// `ScopeConfig` itself: `serde_json` cannot deserialize a map keyed by
/// `ClientIdentity` directly, since its keys aren't plain strings, so
/// reservations travel as a list here and get folded into a map once
/// parsed.
#[derive(Deserialize)]
struct NewScopeSpec {
    name: String,
    #[serde(default)]
    enabled: bool,
    interface_address: Ipv4Addr,
    start: Ipv4Addr,
    end: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    #[serde(default)]
    router: Ipv4Addr,
    #[serde(default)]
    dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    ntp_servers: Vec<Ipv4Addr>,
    domain_name: Option<String>,
    #[serde(default = "default_dns_ttl")]
    dns_ttl: u32,
    lease_time_secs: u32,
    #[serde(default)]
    offer_delay_ms: u64,
    #[serde(default)]
    ping_check_timeout_ms: u64,
    #[serde(default)]
    exclusions: Vec<(Ipv4Addr, Ipv4Addr)>,
    #[serde(default)]
    reservations: Vec<ReservationSpec>,
    #[serde(default)]
    vendor_class_allowlist: Vec<String>,
}

fn default_dns_ttl() -> u32 {
    300
}

#[derive(Deserialize)]
struct ReservationSpec {
    identity: ClientIdentity,
    address: Ipv4Addr,
    host_name: Option<String>,
}

fn add_scope(config_dir: &Path, spec_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let spec: NewScopeSpec = serde_json::from_reader(std::fs::File::open(spec_path)?)?;

    let mut reservations = HashMap::with_capacity(spec.reservations.len());
    for r in spec.reservations {
        reservations.insert(r.identity, Reservation { address: r.address, host_name: r.host_name.map(CompactString::from) });
    }

    let config = ScopeConfig {
        interface_address: spec.interface_address,
        start: spec.start,
        end: spec.end,
        subnet_mask: spec.subnet_mask,
        router: spec.router,
        dns_servers: spec.dns_servers,
        ntp_servers: spec.ntp_servers,
        domain_name: spec.domain_name.map(CompactString::from),
        dns_ttl: spec.dns_ttl,
        lease_time_secs: spec.lease_time_secs,
        offer_delay_ms: spec.offer_delay_ms,
        ping_check_timeout_ms: spec.ping_check_timeout_ms,
        exclusions: spec.exclusions,
        reservations,
        vendor_class_allowlist: spec.vendor_class_allowlist.into_iter().map(String::into_bytes).collect(),
    };

    let scope = Scope::new(spec.name.as_str(), spec.enabled, config);
    let out_path = config_dir.join(format!("{}.scope", spec.name));
    scope_file::save(&scope, &out_path)?;
    println!("wrote {}", out_path.display());
    Ok(())
}
