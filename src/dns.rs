//! Dynamic DNS integration: forward A and reverse PTR records follow the
//! lease lifecycle. The zone store itself is a true external collaborator
//! — expressed only as a trait — matching the spec's treatment of it as
//! the one boundary this crate does not own an implementation of beyond
//! a reference store for its own tests.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Soa {
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

impl Soa {
    /// `serial` in `YYYYMMDDHH` decimal form, with the refresh/retry/
    /// expire/minimum defaults this crate bootstraps every zone with.
    pub fn bootstrap_at(now: SystemTime) -> Soa {
        Soa {
            serial: serial_for(now),
            refresh: 28_800,
            retry: 7_200,
            expire: 604_800,
            minimum: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneRecord {
    A { name: String, address: Ipv4Addr, ttl: u32 },
    Ptr { name: String, target: String, ttl: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ZoneRecordKey {
    A(String),
    Ptr(String),
}

pub trait ZoneStore: Send + Sync {
    fn zone_exists(&self, zone: &str) -> bool;
    fn set_records(&self, zone: &str, records: &[ZoneRecord]) -> std::io::Result<()>;
    fn delete_records(&self, zone: &str, records: &[ZoneRecordKey]) -> std::io::Result<()>;
    fn make_zone_internal(&self, zone: &str, soa: Soa, ns_host: &str) -> std::io::Result<()>;
}

#[derive(Debug, Default)]
struct ZoneData {
    soa: Option<Soa>,
    ns_host: String,
    records: Vec<ZoneRecord>,
}

/// `dashmap`-backed reference `ZoneStore`, suitable for embedding a DNS
/// authority in the same process and for this crate's own tests.
/// Production deployments are expected to supply their own.
#[derive(Default)]
pub struct InMemoryZoneStore {
    zones: DashMap<String, ZoneData>,
}

impl InMemoryZoneStore {
    pub fn new() -> Self {
        InMemoryZoneStore {
            zones: DashMap::new(),
        }
    }

    pub fn records(&self, zone: &str) -> Vec<ZoneRecord> {
        self.zones
            .get(zone)
            .map(|z| z.records.clone())
            .unwrap_or_default()
    }

    pub fn soa(&self, zone: &str) -> Option<Soa> {
        self.zones.get(zone).and_then(|z| z.soa.clone())
    }
}

fn record_key(record: &ZoneRecord) -> ZoneRecordKey {
    match record {
        ZoneRecord::A { name, .. } => ZoneRecordKey::A(name.clone()),
        ZoneRecord::Ptr { name, .. } => ZoneRecordKey::Ptr(name.clone()),
    }
}

impl ZoneStore for InMemoryZoneStore {
    fn zone_exists(&self, zone: &str) -> bool {
        self.zones.contains_key(zone)
    }

    fn set_records(&self, zone: &str, records: &[ZoneRecord]) -> std::io::Result<()> {
        let mut entry = self.zones.entry(zone.to_string()).or_default();
        for record in records {
            let key = record_key(record);
            entry.records.retain(|r| record_key(r) != key);
            entry.records.push(record.clone());
        }
        Ok(())
    }

    fn delete_records(&self, zone: &str, keys: &[ZoneRecordKey]) -> std::io::Result<()> {
        if let Some(mut entry) = self.zones.get_mut(zone) {
            entry.records.retain(|r| !keys.contains(&record_key(r)));
        }
        Ok(())
    }

    fn make_zone_internal(&self, zone: &str, soa: Soa, ns_host: &str) -> std::io::Result<()> {
        let mut entry = self.zones.entry(zone.to_string()).or_default();
        entry.soa = Some(soa);
        entry.ns_host = ns_host.to_string();
        Ok(())
    }
}

/// Forward name for an A record and reverse `/32` name for a PTR record,
/// derived once per lease event.
fn reverse_name(address: Ipv4Addr) -> String {
    let [a, b, c, d] = address.octets();
    format!("{d}.{c}.{b}.{a}.in-addr.arpa")
}

/// Ensures both zones exist, then upserts the A and PTR pair for `host`.
pub fn apply_lease_add(
    store: &Arc<dyn ZoneStore>,
    forward_zone: &str,
    reverse_zone: &str,
    ns_host: &str,
    host: &str,
    address: Ipv4Addr,
    ttl: u32,
) -> std::io::Result<()> {
    let now = SystemTime::now();
    if !store.zone_exists(forward_zone) {
        store.make_zone_internal(forward_zone, Soa::bootstrap_at(now), ns_host)?;
    }
    if !store.zone_exists(reverse_zone) {
        store.make_zone_internal(reverse_zone, Soa::bootstrap_at(now), ns_host)?;
    }
    store.set_records(
        forward_zone,
        &[ZoneRecord::A {
            name: host.to_string(),
            address,
            ttl,
        }],
    )?;
    store.set_records(
        reverse_zone,
        &[ZoneRecord::Ptr {
            name: reverse_name(address),
            target: host.to_string(),
            ttl,
        }],
    )?;
    Ok(())
}

/// Removes the A and PTR pair for `host`/`address`. A no-op if either
/// zone was never bootstrapped.
pub fn apply_lease_remove(
    store: &Arc<dyn ZoneStore>,
    forward_zone: &str,
    reverse_zone: &str,
    host: &str,
    address: Ipv4Addr,
) -> std::io::Result<()> {
    store.delete_records(forward_zone, &[ZoneRecordKey::A(host.to_string())])?;
    store.delete_records(reverse_zone, &[ZoneRecordKey::Ptr(reverse_name(address))])?;
    Ok(())
}

/// Days since the Unix epoch to a civil `(year, month, day)` triple,
/// using Howard Hinnant's `civil_from_days` algorithm — avoids pulling in
/// a date/time crate for the one place this server needs calendar math.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

fn serial_for(now: SystemTime) -> u32 {
    let secs = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let days = (secs / 86_400) as i64;
    let hour = (secs % 86_400) / 3_600;
    let (year, month, day) = civil_from_days(days);
    (year as u32) * 1_000_000 + month * 10_000 + day * 100 + hour as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_name_is_octet_reversed() {
        assert_eq!(
            reverse_name(Ipv4Addr::new(10, 0, 0, 100)),
            "100.0.0.10.in-addr.arpa"
        );
    }

    #[test]
    fn civil_date_matches_a_known_epoch_offset() {
        // 2024-01-01 is day 19723 since the Unix epoch.
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
    }

    #[test]
    fn apply_lease_add_bootstraps_both_zones_then_upserts_records() {
        let store = Arc::new(InMemoryZoneStore::new());
        let dyn_store: Arc<dyn ZoneStore> = store.clone();
        apply_lease_add(
            &dyn_store,
            "example.com",
            "0.0.10.in-addr.arpa",
            "ns1.example.com",
            "host1.example.com",
            Ipv4Addr::new(10, 0, 0, 100),
            300,
        )
        .unwrap();
        assert!(dyn_store.zone_exists("example.com"));
        assert!(dyn_store.zone_exists("0.0.10.in-addr.arpa"));
        assert!(store
            .records("example.com")
            .iter()
            .any(|r| matches!(r, ZoneRecord::A { .. })));
    }

    #[test]
    fn apply_lease_remove_deletes_both_records() {
        let store = Arc::new(InMemoryZoneStore::new());
        let dyn_store: Arc<dyn ZoneStore> = store.clone();
        apply_lease_add(
            &dyn_store,
            "example.com",
            "0.0.10.in-addr.arpa",
            "ns1.example.com",
            "host1.example.com",
            Ipv4Addr::new(10, 0, 0, 100),
            300,
        )
        .unwrap();
        apply_lease_remove(
            &dyn_store,
            "example.com",
            "0.0.10.in-addr.arpa",
            "host1.example.com",
            Ipv4Addr::new(10, 0, 0, 100),
        )
        .unwrap();
        assert!(store.records("example.com").is_empty());
        assert!(store.records("0.0.10.in-addr.arpa").is_empty());
    }
}
