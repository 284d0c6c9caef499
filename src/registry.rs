//! Concurrent `name -> Scope` map plus the "any address" listener refcount.
//!
//! The refcount lives here, next to the map, so that activating or
//! deactivating a scope bound to `0.0.0.0` and updating the shared
//! listener's reference count happen under one critical section — see
//! SPEC_FULL.md §9 on the any-address refcount race in the original.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use compact_str::CompactString;
use dashmap::DashMap;

use crate::scope::Scope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateName,
    DuplicateRange,
    NotFound,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateName => write!(f, "a scope with that name already exists"),
            RegistryError::DuplicateRange => write!(f, "a scope with that address range already exists"),
            RegistryError::NotFound => write!(f, "no scope with that name exists"),
        }
    }
}

impl std::error::Error for RegistryError {}

pub struct ScopeRegistry {
    scopes: DashMap<CompactString, Arc<Scope>>,
    any_address_refcount: AtomicU32,
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeRegistry {
    pub fn new() -> Self {
        ScopeRegistry {
            scopes: DashMap::new(),
            any_address_refcount: AtomicU32::new(0),
        }
    }

    /// Fails with `DuplicateName`/`DuplicateRange` per §3's uniqueness
    /// invariant (checked against every existing scope, not just enabled
    /// ones).
    pub fn insert(&self, scope: Arc<Scope>) -> Result<(), RegistryError> {
        let name = scope.name();
        if self.scopes.contains_key(&name) {
            return Err(RegistryError::DuplicateName);
        }
        for existing in self.scopes.iter() {
            if existing.value().same_range(scope.config()) {
                return Err(RegistryError::DuplicateRange);
            }
        }
        self.scopes.insert(name, scope);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Scope>> {
        self.scopes.get(name).map(|r| r.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Scope>> {
        self.scopes.remove(name).map(|(_, scope)| scope)
    }

    pub fn rename(&self, name: &str, new_name: &str) -> Result<(), RegistryError> {
        if self.scopes.contains_key(new_name) {
            return Err(RegistryError::DuplicateName);
        }
        let (_, scope) = self.scopes.remove(name).ok_or(RegistryError::NotFound)?;
        scope.set_name(new_name);
        self.scopes.insert(CompactString::from(new_name), scope);
        Ok(())
    }

    /// Snapshot of all scopes at the instant of the call; safe to iterate
    /// while other threads insert/remove concurrently.
    pub fn snapshot(&self) -> Vec<Arc<Scope>> {
        self.scopes.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// The scope whose configured interface matches `interface_addr` and
    /// whose range contains `candidate`, per §4.5.
    pub fn find_scope(&self, interface_addr: Ipv4Addr, candidate: Ipv4Addr) -> Option<Arc<Scope>> {
        self.scopes
            .iter()
            .map(|r| r.value().clone())
            .find(|scope| scope.config().interface_address == interface_addr && scope.is_address_in_range(candidate))
    }

    /// Called while activating a scope bound to `0.0.0.0`; returns the
    /// refcount after incrementing, so the caller knows whether it owns
    /// the listener bind (count transitioned 0 -> 1).
    pub fn acquire_any_address_listener(&self) -> u32 {
        self.any_address_refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Called while deactivating; returns the refcount after
    /// decrementing, so the caller knows whether it owns the teardown
    /// (count transitioned 1 -> 0).
    pub fn release_any_address_listener(&self) -> u32 {
        self.any_address_refcount
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0)
            .saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeConfig;
    use std::collections::HashMap;

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
            reservations: HashMap::new(),
            vendor_class_allowlist: Vec::new(),
        }
    }

    #[test]
    fn rejects_duplicate_name() {
        let registry = ScopeRegistry::new();
        registry
            .insert(Arc::new(Scope::new("a", true, config(100, 150))))
            .unwrap();
        let err = registry
            .insert(Arc::new(Scope::new("a", true, config(200, 250))))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName);
    }

    #[test]
    fn rejects_duplicate_range() {
        let registry = ScopeRegistry::new();
        registry
            .insert(Arc::new(Scope::new("a", true, config(100, 150))))
            .unwrap();
        let err = registry
            .insert(Arc::new(Scope::new("b", true, config(100, 150))))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateRange);
    }

    #[test]
    fn rename_fails_when_source_missing() {
        let registry = ScopeRegistry::new();
        let err = registry.rename("nope", "also-nope").unwrap_err();
        assert_eq!(err, RegistryError::NotFound);
    }

    #[test]
    fn rename_succeeds_and_updates_lookup_key() {
        let registry = ScopeRegistry::new();
        registry
            .insert(Arc::new(Scope::new("a", true, config(100, 150))))
            .unwrap();
        registry.rename("a", "b").unwrap();
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
    }

    #[test]
    fn find_scope_matches_interface_and_range() {
        let registry = ScopeRegistry::new();
        registry
            .insert(Arc::new(Scope::new("a", true, config(100, 150))))
            .unwrap();
        let found = registry.find_scope(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 120));
        assert!(found.is_some());
        assert!(registry
            .find_scope(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 200))
            .is_none());
    }

    #[test]
    fn any_address_refcount_tracks_first_and_last_activation() {
        let registry = ScopeRegistry::new();
        assert_eq!(registry.acquire_any_address_listener(), 1);
        assert_eq!(registry.acquire_any_address_listener(), 2);
        assert_eq!(registry.release_any_address_listener(), 1);
        assert_eq!(registry.release_any_address_listener(), 0);
    }
}
