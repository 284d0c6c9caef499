//! Little-endian binary scope persistence, §6 of SPEC_FULL.md.
//!
//! Deliberately *not* `serde`-derived: the on-disk field order is a fixed
//! external contract this crate must stay byte-compatible with across
//! upgrades, the same reasoning that keeps `crate::wire` hand-rolled
//! rather than delegated to a derive macro. Every multi-byte integer and
//! IPv4 address is little-endian, the opposite of the wire codec's
//! network byte order — that asymmetry is spec-fixed, not an oversight.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use compact_str::CompactString;

use crate::identity::{ClientIdentity, HardwareAddress};
use crate::scope::lease::{Lease, LeaseType};
use crate::scope::{Reservation, Scope, ScopeConfig};

fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_ipv4(out: &mut Vec<u8>, v: Ipv4Addr) {
    out.extend_from_slice(&v.octets());
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_optional_string(out: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            write_u8(out, 1);
            write_string(out, s);
        }
        None => write_u8(out, 0),
    }
}

fn write_ipv4_list(out: &mut Vec<u8>, ips: &[Ipv4Addr]) {
    write_u32(out, ips.len() as u32);
    for ip in ips {
        write_ipv4(out, *ip);
    }
}

fn write_systemtime(out: &mut Vec<u8>, t: SystemTime) {
    let secs = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    write_u64(out, secs);
}

fn write_client_identity(out: &mut Vec<u8>, id: &ClientIdentity) {
    match id {
        ClientIdentity::ClientId(bytes) => {
            write_u8(out, 0);
            write_bytes(out, bytes);
        }
        ClientIdentity::Hardware { htype, chaddr } => {
            write_u8(out, 1);
            write_u8(out, *htype);
            write_bytes(out, chaddr);
        }
    }
}

fn write_hardware_address(out: &mut Vec<u8>, hw: &HardwareAddress) {
    write_u8(out, hw.htype());
    write_bytes(out, &hw.as_bytes());
}

/// Serializes `scope` to its on-disk representation and writes it to
/// `path`, replacing any existing file.
pub fn save(scope: &Scope, path: &Path) -> io::Result<()> {
    let config = scope.config();
    let mut out = Vec::with_capacity(512);

    write_string(&mut out, &scope.name());
    write_u8(&mut out, scope.is_enabled() as u8);
    write_ipv4(&mut out, config.start);
    write_ipv4(&mut out, config.end);
    write_ipv4(&mut out, config.subnet_mask);
    write_ipv4(&mut out, config.router);
    write_ipv4(&mut out, config.interface_address);
    write_u32(&mut out, config.lease_time_secs);
    write_u64(&mut out, config.offer_delay_ms);
    write_u8(&mut out, (config.ping_check_timeout_ms > 0) as u8);
    write_u64(&mut out, config.ping_check_timeout_ms);
    write_optional_string(&mut out, config.domain_name.as_deref());
    write_u32(&mut out, config.dns_ttl);
    write_ipv4_list(&mut out, &config.dns_servers);
    write_ipv4_list(&mut out, &config.ntp_servers);

    write_u32(&mut out, config.exclusions.len() as u32);
    for (a, b) in &config.exclusions {
        write_ipv4(&mut out, *a);
        write_ipv4(&mut out, *b);
    }

    write_u32(&mut out, config.reservations.len() as u32);
    for (identity, reservation) in &config.reservations {
        write_client_identity(&mut out, identity);
        write_ipv4(&mut out, reservation.address);
        write_optional_string(&mut out, reservation.host_name.as_deref());
    }

    let leases = scope.snapshot_leases();
    write_u32(&mut out, leases.len() as u32);
    for lease in &leases {
        write_client_identity(&mut out, &lease.client_identity);
        write_hardware_address(&mut out, &lease.hardware_address);
        write_ipv4(&mut out, lease.address);
        write_optional_string(&mut out, lease.host_name.as_deref());
        write_systemtime(&mut out, lease.obtained_utc);
        write_systemtime(&mut out, lease.expires_utc);
        write_u8(&mut out, matches!(lease.lease_type, LeaseType::Reserved) as u8);
    }

    // Extension beyond the legacy field set: this crate's vendor/user-
    // class allowlist, appended after everything the original format
    // requires so older readers that stop at the lease list still parse
    // a valid prefix.
    write_u32(&mut out, config.vendor_class_allowlist.len() as u32);
    for prefix in &config.vendor_class_allowlist {
        write_bytes(&mut out, prefix);
    }

    let tmp_path = path.with_extension("scope.tmp");
    let mut file = File::create(&tmp_path)?;
    file.write_all(&out)?;
    file.flush()?;
    file.sync_all()?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated scope file"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn ipv4(&mut self) -> io::Result<Ipv4Addr> {
        let b = self.take(4)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    fn bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = u16::from_le_bytes(self.take(2)?.try_into().unwrap()) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> io::Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn optional_string(&mut self) -> io::Result<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.string()?)),
        }
    }

    fn ipv4_list(&mut self) -> io::Result<Vec<Ipv4Addr>> {
        let count = self.u32()? as usize;
        (0..count).map(|_| self.ipv4()).collect()
    }

    fn client_identity(&mut self) -> io::Result<ClientIdentity> {
        match self.u8()? {
            0 => Ok(ClientIdentity::ClientId(self.bytes()?)),
            _ => {
                let htype = self.u8()?;
                let chaddr = self.bytes()?;
                Ok(ClientIdentity::Hardware { htype, chaddr })
            }
        }
    }

    fn hardware_address(&mut self) -> io::Result<HardwareAddress> {
        let htype = self.u8()?;
        let bytes = self.bytes()?;
        Ok(HardwareAddress::new(htype, &bytes))
    }

    fn systemtime(&mut self) -> io::Result<SystemTime> {
        Ok(UNIX_EPOCH + Duration::from_secs(self.u64()?))
    }
}

/// Parses a persisted scope, reconstructing its configuration and
/// replaying its committed leases. Reservations carry no `enabled` bit
/// of their own; the scope-wide flag read here is `Scope::set_enabled`'s
/// initial value.
pub fn load(path: &Path) -> io::Result<Scope> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    let mut cursor = Cursor::new(&data);

    let name = cursor.string()?;
    let enabled = cursor.u8()? != 0;
    let start = cursor.ipv4()?;
    let end = cursor.ipv4()?;
    let subnet_mask = cursor.ipv4()?;
    let router = cursor.ipv4()?;
    let interface_address = cursor.ipv4()?;
    let lease_time_secs = cursor.u32()?;
    let offer_delay_ms = cursor.u64()?;
    let _ping_check_enabled = cursor.u8()?;
    let ping_check_timeout_ms = cursor.u64()?;
    let domain_name = cursor.optional_string()?.map(CompactString::from);
    let dns_ttl = cursor.u32()?;
    let dns_servers = cursor.ipv4_list()?;
    let ntp_servers = cursor.ipv4_list()?;

    let exclusion_count = cursor.u32()? as usize;
    let mut exclusions = Vec::with_capacity(exclusion_count);
    for _ in 0..exclusion_count {
        exclusions.push((cursor.ipv4()?, cursor.ipv4()?));
    }

    let reservation_count = cursor.u32()? as usize;
    let mut reservations = std::collections::HashMap::with_capacity(reservation_count);
    for _ in 0..reservation_count {
        let identity = cursor.client_identity()?;
        let address = cursor.ipv4()?;
        let host_name = cursor.optional_string()?.map(CompactString::from);
        reservations.insert(identity, Reservation { address, host_name });
    }

    let lease_count = cursor.u32()? as usize;
    let mut leases = Vec::with_capacity(lease_count);
    for _ in 0..lease_count {
        let client_identity = cursor.client_identity()?;
        let hardware_address = cursor.hardware_address()?;
        let address = cursor.ipv4()?;
        let host_name = cursor.optional_string()?.map(CompactString::from);
        let obtained_utc = cursor.systemtime()?;
        let expires_utc = cursor.systemtime()?;
        let lease_type = if cursor.u8()? != 0 { LeaseType::Reserved } else { LeaseType::Dynamic };
        leases.push(Lease {
            client_identity,
            hardware_address,
            address,
            host_name,
            obtained_utc,
            expires_utc,
            lease_type,
        });
    }

    // The vendor/user-class allowlist extension is only present in files
    // this crate itself wrote; files produced by the legacy format this
    // crate must stay byte-compatible with simply end here.
    let vendor_class_allowlist = match cursor.u32() {
        Ok(count) => {
            let mut prefixes = Vec::with_capacity(count as usize);
            for _ in 0..count {
                prefixes.push(cursor.bytes()?);
            }
            prefixes
        }
        Err(_) => Vec::new(),
    };

    let config = ScopeConfig {
        interface_address,
        start,
        end,
        subnet_mask,
        router,
        dns_servers,
        ntp_servers,
        domain_name,
        dns_ttl,
        lease_time_secs,
        offer_delay_ms,
        ping_check_timeout_ms,
        exclusions,
        reservations,
        vendor_class_allowlist,
    };

    let scope = Scope::new(name, enabled, config);
    scope.load_leases(leases);
    Ok(scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeConfig;
    use std::collections::HashMap;

    fn sample_config() -> ScopeConfig {
        ScopeConfig {
            interface_address: Ipv4Addr::new(10, 0, 0, 1),
            start: Ipv4Addr::new(10, 0, 0, 100),
            end: Ipv4Addr::new(10, 0, 0, 200),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: Ipv4Addr::new(10, 0, 0, 1),
            dns_servers: vec![Ipv4Addr::new(10, 0, 0, 53)],
            ntp_servers: vec![],
            domain_name: Some(CompactString::from("example.com")),
            dns_ttl: 300,
            lease_time_secs: 3600,
            offer_delay_ms: 250,
            ping_check_timeout_ms: 0,
            exclusions: vec![(Ipv4Addr::new(10, 0, 0, 105), Ipv4Addr::new(10, 0, 0, 110))],
            reservations: HashMap::new(),
            vendor_class_allowlist: vec![b"ACME-".to_vec()],
        }
    }

    #[test]
    fn round_trips_configuration_and_leases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.scope");

        let scope = Scope::new("default", true, sample_config());
        let (identity, hwaddr) = {
            let hw = HardwareAddress::new(1, &[0, 1, 2, 3, 4, 5]);
            (ClientIdentity::from_request(None, &hw), hw)
        };
        scope.find_offer(&identity, &hwaddr, None, Some("laptop")).unwrap();
        scope.commit_lease(&identity, None).unwrap();

        save(&scope, &path).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.name(), "default");
        assert!(loaded.is_enabled());
        assert_eq!(loaded.config().start, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(loaded.config().domain_name.as_deref(), Some("example.com"));
        assert_eq!(loaded.config().vendor_class_allowlist, vec![b"ACME-".to_vec()]);

        let leases = loaded.snapshot_leases();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].client_identity, identity);
        assert_eq!(leases[0].address, Ipv4Addr::new(10, 0, 0, 100));
    }

    #[test]
    fn disabled_scope_round_trips_its_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disabled.scope");
        let scope = Scope::new("disabled", false, sample_config());
        save(&scope, &path).unwrap();
        let loaded = load(&path).unwrap();
        assert!(!loaded.is_enabled());
    }
}
