//! Per-interface address pool: reservations, exclusions, offers, leases,
//! and the option set handed back to clients.

pub mod lease;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use compact_str::CompactString;
use dashmap::DashSet;
use ipnet::Ipv4Net;

use crate::identity::{ClientIdentity, HardwareAddress};
use crate::wire::{self, ClientFqdn, DhcpOption, MessageType};

pub use lease::{Lease, LeaseType};

const DEFAULT_OFFER_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub address: Ipv4Addr,
    pub host_name: Option<CompactString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    AddressUnavailable,
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeError::AddressUnavailable => write!(f, "no address available in scope"),
        }
    }
}

impl std::error::Error for ScopeError {}

/// Configuration fields, effectively immutable while the scope is live:
/// read without locking per the concurrency model. Renaming and
/// enabling/disabling go through `Scope`'s own atomics/`ArcSwap`, not
/// through this struct.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeConfig {
    pub interface_address: Ipv4Addr,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub ntp_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<CompactString>,
    pub dns_ttl: u32,
    pub lease_time_secs: u32,
    pub offer_delay_ms: u64,
    pub ping_check_timeout_ms: u64,
    pub exclusions: Vec<(Ipv4Addr, Ipv4Addr)>,
    pub reservations: HashMap<ClientIdentity, Reservation>,
    /// Option-60 prefixes this scope accepts; empty means "accept anyone".
    pub vendor_class_allowlist: Vec<Vec<u8>>,
}

/// Tells a scope whether an address currently answers on the wire. The
/// distilled spec calls for an ICMP echo probe before handing out a pool
/// address; this crate has no raw-socket dependency in its stack to back
/// that with, so the shipped `NullProbe` always answers "not in use" and
/// a caller that needs a real probe supplies its own implementation.
pub trait AddressProbe: Send + Sync {
    fn is_in_use(&self, addr: Ipv4Addr, timeout: Duration) -> bool;
}

pub struct NullProbe;

impl AddressProbe for NullProbe {
    fn is_in_use(&self, _addr: Ipv4Addr, _timeout: Duration) -> bool {
        false
    }
}

struct MutableState {
    offers: HashMap<ClientIdentity, Lease>,
    leases: HashMap<ClientIdentity, Lease>,
}

pub struct Scope {
    name: ArcSwap<CompactString>,
    enabled: AtomicBool,
    last_modified: AtomicU64,
    config: ScopeConfig,
    state: Mutex<MutableState>,
    bad_addresses: DashSet<Ipv4Addr>,
    probe: Box<dyn AddressProbe>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name())
            .field("enabled", &self.is_enabled())
            .field("config", &self.config)
            .finish()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Scope {
    pub fn new(name: impl Into<CompactString>, enabled: bool, config: ScopeConfig) -> Self {
        Scope {
            name: ArcSwap::from_pointee(name.into()),
            enabled: AtomicBool::new(enabled),
            last_modified: AtomicU64::new(now_secs()),
            config,
            state: Mutex::new(MutableState {
                offers: HashMap::new(),
                leases: HashMap::new(),
            }),
            bad_addresses: DashSet::new(),
            probe: Box::new(NullProbe),
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn AddressProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn name(&self) -> CompactString {
        (**self.name.load()).clone()
    }

    pub fn set_name(&self, name: impl Into<CompactString>) {
        self.name.store(std::sync::Arc::new(name.into()));
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        self.touch();
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    pub fn last_modified_secs(&self) -> u64 {
        self.last_modified.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        self.last_modified.store(now_secs(), Ordering::SeqCst);
    }

    /// Two scopes cover "the same range" iff these four fields match.
    pub fn same_range(&self, other: &ScopeConfig) -> bool {
        self.config.interface_address == other.interface_address
            && self.config.start == other.start
            && self.config.end == other.end
            && self.config.subnet_mask == other.subnet_mask
    }

    fn prefix_len(&self) -> u8 {
        u32::from(self.config.subnet_mask).count_ones() as u8
    }

    fn net(&self) -> Ipv4Net {
        Ipv4Net::new(self.config.interface_address, self.prefix_len())
            .unwrap_or_else(|_| Ipv4Net::new(self.config.interface_address, 32).unwrap())
            .trunc()
    }

    pub fn network_address(&self) -> Ipv4Addr {
        self.net().network()
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        self.net().broadcast()
    }

    /// The `in-addr.arpa` zone covering this scope's subnet. Assumes a
    /// byte-aligned prefix (the common /8, /16, /24 cases); finer splits
    /// fall back to a /24-style zone rooted at the network address.
    pub fn reverse_zone(&self) -> String {
        let octets = self.network_address().octets();
        let whole_octets = (self.prefix_len() / 8).clamp(1, 3) as usize;
        let mut labels: Vec<String> = octets[..whole_octets]
            .iter()
            .rev()
            .map(|o| o.to_string())
            .collect();
        labels.push("in-addr".to_string());
        labels.push("arpa".to_string());
        labels.join(".")
    }

    pub fn is_address_in_range(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        u32::from(self.config.start) <= ip && ip <= u32::from(self.config.end)
    }

    fn is_excluded(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        self.config
            .exclusions
            .iter()
            .any(|(a, b)| u32::from(*a) <= ip && ip <= u32::from(*b))
    }

    /// Lookup only; never allocates.
    pub fn existing_lease_or_offer(&self, client_identity: &ClientIdentity) -> Option<Lease> {
        let guard = self.state.lock().expect("scope mutex poisoned");
        guard
            .leases
            .get(client_identity)
            .or_else(|| guard.offers.get(client_identity))
            .cloned()
    }

    pub fn find_offer(
        &self,
        client_identity: &ClientIdentity,
        hardware_address: &HardwareAddress,
        client_fqdn: Option<&ClientFqdn>,
        host_name: Option<&str>,
    ) -> Result<Lease, ScopeError> {
        let now = SystemTime::now();
        let resolved_host_name = self.resolve_host_name(client_fqdn, host_name);
        let mut guard = self.state.lock().expect("scope mutex poisoned");

        if let Some(reservation) = self.config.reservations.get(client_identity) {
            let lease = Lease {
                client_identity: client_identity.clone(),
                hardware_address: hardware_address.clone(),
                address: reservation.address,
                host_name: reservation
                    .host_name
                    .clone()
                    .or_else(|| resolved_host_name.clone().map(CompactString::from)),
                obtained_utc: now,
                expires_utc: now + DEFAULT_OFFER_TTL,
                lease_type: LeaseType::Reserved,
            };
            guard.offers.insert(client_identity.clone(), lease.clone());
            drop(guard);
            self.touch();
            return Ok(lease);
        }

        if let Some(existing) = guard.leases.get(client_identity).cloned() {
            return Ok(existing);
        }
        if let Some(offer) = guard.offers.get_mut(client_identity) {
            if !offer.is_expired(now) {
                offer.expires_utc = now + DEFAULT_OFFER_TTL;
                let lease = offer.clone();
                drop(guard);
                self.touch();
                return Ok(lease);
            }
        }

        let mut used: HashSet<Ipv4Addr> = HashSet::new();
        for lease in guard.leases.values() {
            used.insert(lease.address);
        }
        for offer in guard.offers.values() {
            if !offer.is_expired(now) {
                used.insert(offer.address);
            }
        }
        for reservation in self.config.reservations.values() {
            used.insert(reservation.address);
        }
        for addr in self.bad_addresses.iter() {
            used.insert(*addr);
        }

        let network = self.network_address();
        let broadcast = self.broadcast_address();
        let start = u32::from(self.config.start);
        let end = u32::from(self.config.end);
        let timeout = Duration::from_millis(self.config.ping_check_timeout_ms);

        for raw in start..=end {
            let candidate = Ipv4Addr::from(raw);
            if candidate == network
                || candidate == broadcast
                || candidate == self.config.interface_address
                || self.config.router == candidate
                || self.is_excluded(candidate)
                || used.contains(&candidate)
            {
                continue;
            }
            if self.config.ping_check_timeout_ms > 0 && self.probe.is_in_use(candidate, timeout) {
                continue;
            }
            let lease = Lease {
                client_identity: client_identity.clone(),
                hardware_address: hardware_address.clone(),
                address: candidate,
                host_name: resolved_host_name.clone().map(CompactString::from),
                obtained_utc: now,
                expires_utc: now + DEFAULT_OFFER_TTL,
                lease_type: LeaseType::Dynamic,
            };
            guard.offers.insert(client_identity.clone(), lease.clone());
            drop(guard);
            self.touch();
            return Ok(lease);
        }

        Err(ScopeError::AddressUnavailable)
    }

    /// Promotes an offer (or refreshes an existing lease) to a committed
    /// lease with a freshly computed expiry.
    pub fn commit_lease(
        &self,
        client_identity: &ClientIdentity,
        requested_lease_secs: Option<u32>,
    ) -> Option<Lease> {
        let now = SystemTime::now();
        let lease_secs = match requested_lease_secs {
            Some(req) if req > 0 => req.min(self.config.lease_time_secs),
            _ => self.config.lease_time_secs,
        };
        let mut guard = self.state.lock().expect("scope mutex poisoned");
        let mut lease = guard
            .offers
            .remove(client_identity)
            .or_else(|| guard.leases.get(client_identity).cloned())?;
        lease.expires_utc = now + Duration::from_secs(lease_secs as u64);
        guard.leases.insert(client_identity.clone(), lease.clone());
        drop(guard);
        self.touch();
        Some(lease)
    }

    /// Removes any lease/offer for this client. Used on RELEASE and
    /// DECLINE; callers add the address to the bad set on DECLINE.
    pub fn release_lease(&self, client_identity: &ClientIdentity) -> Option<Lease> {
        let mut guard = self.state.lock().expect("scope mutex poisoned");
        let removed = guard
            .leases
            .remove(client_identity)
            .or_else(|| guard.offers.remove(client_identity));
        drop(guard);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn mark_address_bad(&self, addr: Ipv4Addr) {
        self.bad_addresses.insert(addr);
    }

    pub fn remove_expired_offers(&self) {
        let now = SystemTime::now();
        let mut guard = self.state.lock().expect("scope mutex poisoned");
        let before = guard.offers.len();
        guard.offers.retain(|_, offer| !offer.is_expired(now));
        if guard.offers.len() != before {
            drop(guard);
            self.touch();
        }
    }

    pub fn remove_expired_leases(&self) -> Vec<Lease> {
        let now = SystemTime::now();
        let mut guard = self.state.lock().expect("scope mutex poisoned");
        let mut expired = Vec::new();
        guard.leases.retain(|_, lease| {
            if lease.is_expired(now) {
                expired.push(lease.clone());
                false
            } else {
                true
            }
        });
        drop(guard);
        if !expired.is_empty() {
            self.touch();
        }
        expired
    }

    pub fn snapshot_leases(&self) -> Vec<Lease> {
        self.state
            .lock()
            .expect("scope mutex poisoned")
            .leases
            .values()
            .cloned()
            .collect()
    }

    /// Bulk-inserts leases recovered from the scope file. Intended for
    /// use while constructing a `Scope` before it is shared, not as a
    /// runtime API.
    pub fn load_leases(&self, leases: Vec<Lease>) {
        let mut guard = self.state.lock().expect("scope mutex poisoned");
        for lease in leases {
            guard.leases.insert(lease.client_identity.clone(), lease);
        }
    }

    pub fn snapshot_offers(&self) -> Vec<Lease> {
        self.state
            .lock()
            .expect("scope mutex poisoned")
            .offers
            .values()
            .cloned()
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_options(
        &self,
        requested: &[u8],
        vendor_class: Option<&[u8]>,
        client_fqdn: Option<&ClientFqdn>,
        host_name: Option<&str>,
        message_type: MessageType,
        lease_time_secs: u32,
        interface_address: Ipv4Addr,
    ) -> Option<Vec<DhcpOption>> {
        if !self.config.vendor_class_allowlist.is_empty() {
            let accepted = vendor_class
                .map(|vc| {
                    self.config
                        .vendor_class_allowlist
                        .iter()
                        .any(|prefix| vc.starts_with(prefix.as_slice()))
                })
                .unwrap_or(false);
            if !accepted {
                return None;
            }
        }

        let mut candidates: HashMap<u8, DhcpOption> = HashMap::new();
        candidates.insert(
            wire::OPT_DHCP_MESSAGE_TYPE,
            DhcpOption::MessageType(message_type),
        );
        candidates.insert(
            wire::OPT_SERVER_IDENTIFIER,
            DhcpOption::ServerIdentifier(interface_address),
        );
        candidates.insert(
            wire::OPT_ADDRESS_LEASE_TIME,
            DhcpOption::AddressLeaseTime(lease_time_secs),
        );
        candidates.insert(
            wire::OPT_SUBNET_MASK,
            DhcpOption::SubnetMask(self.config.subnet_mask),
        );
        candidates.insert(
            wire::OPT_BROADCAST_ADDRESS,
            DhcpOption::BroadcastAddress(self.broadcast_address()),
        );
        if !self.config.router.is_unspecified() {
            candidates.insert(wire::OPT_ROUTER, DhcpOption::Router(vec![self.config.router]));
        }
        if !self.config.dns_servers.is_empty() {
            candidates.insert(
                wire::OPT_DOMAIN_NAME_SERVER,
                DhcpOption::DomainNameServer(self.config.dns_servers.clone()),
            );
        }
        if let Some(domain) = &self.config.domain_name {
            candidates.insert(wire::OPT_DOMAIN_NAME, DhcpOption::DomainName(domain.to_string()));
        }
        if !self.config.ntp_servers.is_empty() {
            candidates.insert(
                wire::OPT_NTP_SERVERS,
                DhcpOption::NtpServers(self.config.ntp_servers.clone()),
            );
        }
        if client_fqdn.is_some() {
            let domain = match (&self.config.domain_name, host_name) {
                (Some(d), Some(h)) => format!("{}.{}", h.to_ascii_lowercase(), d),
                (None, Some(h)) => h.to_ascii_lowercase(),
                (Some(d), None) => d.to_string(),
                (None, None) => String::new(),
            };
            candidates.insert(wire::OPT_CLIENT_FQDN, DhcpOption::ClientFqdn(ClientFqdn::server_reply(domain)));
        }

        let mandatory = [
            wire::OPT_DHCP_MESSAGE_TYPE,
            wire::OPT_SERVER_IDENTIFIER,
            wire::OPT_ADDRESS_LEASE_TIME,
            wire::OPT_SUBNET_MASK,
            wire::OPT_BROADCAST_ADDRESS,
        ];

        let mut result = Vec::new();
        for &code in requested {
            if let Some(opt) = candidates.remove(&code) {
                result.push(opt);
            }
        }
        for &code in mandatory.iter() {
            if let Some(opt) = candidates.remove(&code) {
                result.push(opt);
            }
        }
        // Router/DNS/domain/NTP are configured on the scope, not gated on
        // the client having asked for them by code; whatever the two
        // loops above didn't already place still goes out.
        for &code in &[
            wire::OPT_ROUTER,
            wire::OPT_DOMAIN_NAME_SERVER,
            wire::OPT_DOMAIN_NAME,
            wire::OPT_NTP_SERVERS,
        ] {
            if let Some(opt) = candidates.remove(&code) {
                result.push(opt);
            }
        }
        if let Some(opt) = candidates.remove(&wire::OPT_CLIENT_FQDN) {
            result.push(opt);
        }
        result.push(DhcpOption::End);
        Some(result)
    }

    /// Resolved host name a lease should carry: the client FQDN's domain
    /// label if present, else `host_name + "." + domain_name` when both
    /// the option and the scope's domain are set, else the bare host name.
    pub fn resolve_host_name(&self, client_fqdn: Option<&ClientFqdn>, host_name: Option<&str>) -> Option<String> {
        if let Some(fqdn) = client_fqdn {
            if !fqdn.domain.is_empty() {
                return Some(fqdn.domain.to_ascii_lowercase());
            }
        }
        match (host_name, &self.config.domain_name) {
            (Some(h), Some(d)) => Some(format!("{}.{}", h.to_ascii_lowercase(), d)),
            (Some(h), None) => Some(h.to_ascii_lowercase()),
            (None, _) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::HardwareAddress;

    fn basic_config() -> ScopeConfig {
        ScopeConfig {
            interface_address: Ipv4Addr::new(10, 0, 0, 1),
            start: Ipv4Addr::new(10, 0, 0, 100),
            end: Ipv4Addr::new(10, 0, 0, 102),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: Ipv4Addr::new(10, 0, 0, 1),
            dns_servers: vec![],
            ntp_servers: vec![],
            domain_name: None,
            dns_ttl: 300,
            lease_time_secs: 3600,
            offer_delay_ms: 0,
            ping_check_timeout_ms: 0,
            exclusions: Vec::new(),
            reservations: HashMap::new(),
            vendor_class_allowlist: Vec::new(),
        }
    }

    fn identity(byte: u8) -> (ClientIdentity, HardwareAddress) {
        let hw = HardwareAddress::new(1, &[0, 0, 0, 0, 0, byte]);
        (ClientIdentity::from_request(None, &hw), hw)
    }

    #[test]
    fn allocates_first_free_address_in_ascending_order() {
        let scope = Scope::new("test", true, basic_config());
        let (id, hw) = identity(1);
        let lease = scope.find_offer(&id, &hw, None, None).unwrap();
        assert_eq!(lease.address, Ipv4Addr::new(10, 0, 0, 100));
    }

    #[test]
    fn skips_addresses_already_offered() {
        let scope = Scope::new("test", true, basic_config());
        let (id1, hw1) = identity(1);
        let (id2, hw2) = identity(2);
        let first = scope.find_offer(&id1, &hw1, None, None).unwrap();
        let second = scope.find_offer(&id2, &hw2, None, None).unwrap();
        assert_ne!(first.address, second.address);
    }

    #[test]
    fn reservation_takes_precedence_over_pool_scan() {
        let mut config = basic_config();
        let (id, hw) = identity(9);
        config.reservations.insert(
            id.clone(),
            Reservation {
                address: Ipv4Addr::new(10, 0, 0, 102),
                host_name: None,
            },
        );
        let scope = Scope::new("test", true, config);
        let lease = scope.find_offer(&id, &hw, None, None).unwrap();
        assert_eq!(lease.address, Ipv4Addr::new(10, 0, 0, 102));
        assert_eq!(lease.lease_type, LeaseType::Reserved);
    }

    #[test]
    fn exhausted_pool_is_address_unavailable() {
        let mut config = basic_config();
        config.start = Ipv4Addr::new(10, 0, 0, 100);
        config.end = Ipv4Addr::new(10, 0, 0, 100);
        let scope = Scope::new("test", true, config);
        let (id1, hw1) = identity(1);
        let (id2, hw2) = identity(2);
        scope.find_offer(&id1, &hw1, None, None).unwrap();
        let err = scope.find_offer(&id2, &hw2, None, None).unwrap_err();
        assert_eq!(err, ScopeError::AddressUnavailable);
    }

    #[test]
    fn commit_then_release_frees_the_address_for_reallocation() {
        let scope = Scope::new("test", true, basic_config());
        let (id1, hw1) = identity(1);
        let offer = scope.find_offer(&id1, &hw1, None, None).unwrap();
        let lease = scope.commit_lease(&id1, None).unwrap();
        assert_eq!(lease.address, offer.address);
        assert!(scope.existing_lease_or_offer(&id1).is_some());
        scope.release_lease(&id1);
        assert!(scope.existing_lease_or_offer(&id1).is_none());
    }

    #[test]
    fn decline_marks_address_bad_and_scanner_skips_it() {
        let scope = Scope::new("test", true, basic_config());
        let (id1, hw1) = identity(1);
        let offer = scope.find_offer(&id1, &hw1, None, None).unwrap();
        scope.release_lease(&id1);
        scope.mark_address_bad(offer.address);

        let (id2, hw2) = identity(2);
        let next = scope.find_offer(&id2, &hw2, None, None).unwrap();
        assert_ne!(next.address, offer.address);
    }

    #[test]
    fn vendor_class_allowlist_rejects_unmatched_clients() {
        let mut config = basic_config();
        config.vendor_class_allowlist = vec![b"ACME-".to_vec()];
        let scope = Scope::new("test", true, config);
        let opts = scope.get_options(
            &[],
            Some(b"OTHER-vendor"),
            None,
            None,
            MessageType::Offer,
            3600,
            Ipv4Addr::new(10, 0, 0, 1),
        );
        assert!(opts.is_none());
    }

    #[test]
    fn get_options_always_includes_mandatory_set() {
        let scope = Scope::new("test", true, basic_config());
        let opts = scope
            .get_options(&[], None, None, None, MessageType::Offer, 3600, Ipv4Addr::new(10, 0, 0, 1))
            .unwrap();
        let codes: Vec<u8> = opts.iter().map(|o| o.code()).collect();
        assert!(codes.contains(&wire::OPT_DHCP_MESSAGE_TYPE));
        assert!(codes.contains(&wire::OPT_SERVER_IDENTIFIER));
        assert!(codes.contains(&wire::OPT_ADDRESS_LEASE_TIME));
        assert!(codes.contains(&wire::OPT_SUBNET_MASK));
        assert!(codes.contains(&wire::OPT_BROADCAST_ADDRESS));
        assert_eq!(codes.last(), Some(&wire::OPT_END));
    }

    #[test]
    fn same_range_checks_the_four_defining_fields() {
        let scope = Scope::new("test", true, basic_config());
        assert!(scope.same_range(&basic_config()));
        let mut other = basic_config();
        other.end = Ipv4Addr::new(10, 0, 0, 200);
        assert!(!scope.same_range(&other));
    }
}
