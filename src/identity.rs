//! The canonical per-client key used for offers, leases, and reservations.
//!
//! Per RFC 2132 §9.14, option 61 (Client Identifier) overrides hardware
//! address as the handle a server uses to track a client. When a request
//! carries it, every map in this crate keys on it instead of `chaddr`.

use std::fmt;

use advmac::MacAddr6;
use serde::{Deserialize, Serialize};

/// Hardware address as carried in `chaddr`, truncated to `hlen` bytes.
///
/// Most deployments are Ethernet (`htype == 1`, 6 bytes), which is the
/// only case `advmac::MacAddr6` can represent directly; anything else is
/// kept as a raw byte vector so the wire codec never has to reject an
/// otherwise well-formed packet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HardwareAddress {
    Ethernet(MacAddr6),
    Other { htype: u8, bytes: Vec<u8> },
}

impl HardwareAddress {
    pub fn new(htype: u8, bytes: &[u8]) -> Self {
        if htype == 1 {
            if let Ok(arr) = <[u8; 6]>::try_from(bytes) {
                return HardwareAddress::Ethernet(MacAddr6::new(arr));
            }
        }
        HardwareAddress::Other {
            htype,
            bytes: bytes.to_vec(),
        }
    }

    pub fn htype(&self) -> u8 {
        match self {
            HardwareAddress::Ethernet(_) => 1,
            HardwareAddress::Other { htype, .. } => *htype,
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            HardwareAddress::Ethernet(mac) => mac.to_array().to_vec(),
            HardwareAddress::Other { bytes, .. } => bytes.clone(),
        }
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareAddress::Ethernet(mac) => write!(f, "{mac}"),
            HardwareAddress::Other { htype, bytes } => {
                write!(f, "htype={htype}:")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Option 61 if present, else `(htype, chaddr[0..hlen])`.
///
/// All lease and offer maps key on this, never on hardware address alone
/// when option 61 is supplied — a client that sends a client-id on one
/// request and not another would otherwise silently fork into two
/// identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientIdentity {
    ClientId(Vec<u8>),
    Hardware { htype: u8, chaddr: Vec<u8> },
}

impl ClientIdentity {
    pub fn from_request(client_id: Option<&[u8]>, hwaddr: &HardwareAddress) -> Self {
        match client_id {
            Some(id) if !id.is_empty() => ClientIdentity::ClientId(id.to_vec()),
            _ => ClientIdentity::Hardware {
                htype: hwaddr.htype(),
                chaddr: hwaddr.as_bytes(),
            },
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientIdentity::ClientId(bytes) => {
                f.write_str("cid:")?;
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            ClientIdentity::Hardware { htype, chaddr } => {
                write!(f, "hw:{htype}:")?;
                for (i, b) in chaddr.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_client_id_over_hardware() {
        let hw = HardwareAddress::new(1, &[0, 1, 2, 3, 4, 5]);
        let a = ClientIdentity::from_request(Some(&[9, 9, 9]), &hw);
        let b = ClientIdentity::from_request(Some(&[9, 9, 9]), &hw);
        assert_eq!(a, b);
        assert_eq!(a, ClientIdentity::ClientId(vec![9, 9, 9]));
    }

    #[test]
    fn falls_back_to_hardware_when_no_client_id() {
        let hw = HardwareAddress::new(1, &[0, 1, 2, 3, 4, 5]);
        let id = ClientIdentity::from_request(None, &hw);
        assert_eq!(
            id,
            ClientIdentity::Hardware {
                htype: 1,
                chaddr: vec![0, 1, 2, 3, 4, 5],
            }
        );
    }

    #[test]
    fn empty_client_id_option_falls_back_to_hardware() {
        let hw = HardwareAddress::new(1, &[0xaa; 6]);
        let id = ClientIdentity::from_request(Some(&[]), &hw);
        assert_eq!(
            id,
            ClientIdentity::Hardware {
                htype: 1,
                chaddr: vec![0xaa; 6],
            }
        );
    }

    #[test]
    fn display_is_stable() {
        let hw = HardwareAddress::new(1, &[0, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let id = ClientIdentity::from_request(None, &hw);
        assert_eq!(id.to_string(), "hw:1:00:11:22:33:44:55");
    }
}
