//! The per-client record shared by a scope's offer and lease maps.

use std::net::Ipv4Addr;
use std::time::SystemTime;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::identity::{ClientIdentity, HardwareAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseType {
    Dynamic,
    Reserved,
}

/// One address assignment. The same shape is used for both the tentative
/// (offer) and committed (lease) states; which map it lives in is what
/// distinguishes the two, not a field on this struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub client_identity: ClientIdentity,
    pub hardware_address: HardwareAddress,
    pub address: Ipv4Addr,
    pub host_name: Option<CompactString>,
    pub obtained_utc: SystemTime,
    pub expires_utc: SystemTime,
    pub lease_type: LeaseType,
}

impl Lease {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_utc <= now
    }
}
