//! Per-message dispatch: classifies a decoded `DhcpMessage` by RFC 2131
//! §4 semantics and produces an optional reply plus where to send it.
//!
//! Grounded on the variant-detection idiom in the teacher's
//! `handle_discover`/`handle_request` (`(server_id, ciaddr, requested_ip)`
//! tuple match), generalized from static-reservation lookups to full
//! scope-backed allocation.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::dns;
use crate::identity::{ClientIdentity, HardwareAddress};
use crate::registry::ScopeRegistry;
use crate::scope::Scope;
use crate::wire::{DhcpMessage, DhcpOption, MessageType, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDestination {
    Broadcast,
    Unicast(SocketAddrV4),
}

/// Entry point: one decoded datagram in, at most one reply out.
#[instrument(skip(request, registry, zone_store), fields(xid = request.xid))]
pub fn handle_message(
    request: &DhcpMessage,
    remote_addr: SocketAddrV4,
    interface_addr: Ipv4Addr,
    registry: &ScopeRegistry,
    zone_store: Option<&Arc<dyn dns::ZoneStore>>,
) -> Option<(DhcpMessage, ReplyDestination)> {
    if request.op != Opcode::BootRequest {
        return None;
    }
    match request.message_type()? {
        MessageType::Discover => handle_discover(request, remote_addr, interface_addr, registry),
        MessageType::Request => handle_request(request, remote_addr, interface_addr, registry, zone_store),
        MessageType::Decline => {
            handle_decline(request, remote_addr, interface_addr, registry, zone_store);
            None
        }
        MessageType::Release => {
            handle_release(request, remote_addr, interface_addr, registry, zone_store);
            None
        }
        MessageType::Inform => handle_inform(request, remote_addr, interface_addr, registry),
        _ => None,
    }
}

fn find_scope_for(
    request: &DhcpMessage,
    remote_addr: SocketAddrV4,
    interface_addr: Ipv4Addr,
    registry: &ScopeRegistry,
) -> Option<Arc<Scope>> {
    let candidate = if request.giaddr.is_unspecified() {
        if request.ciaddr.is_unspecified() {
            interface_addr
        } else {
            if *remote_addr.ip() != request.ciaddr {
                return None;
            }
            request.ciaddr
        }
    } else {
        if *remote_addr.ip() != request.giaddr {
            return None;
        }
        request.giaddr
    };
    registry.find_scope(interface_addr, candidate)
}

/// RFC 2131 §4.1 ACK/OFFER destination routing, followed literally (see
/// SPEC_FULL.md §9: no pre-ARP unicast-to-yiaddr fallback).
fn ack_destination(request: &DhcpMessage) -> ReplyDestination {
    if !request.giaddr.is_unspecified() {
        ReplyDestination::Unicast(SocketAddrV4::new(request.giaddr, 67))
    } else if !request.ciaddr.is_unspecified() {
        ReplyDestination::Unicast(SocketAddrV4::new(request.ciaddr, 68))
    } else {
        ReplyDestination::Broadcast
    }
}

fn nak_destination(request: &DhcpMessage) -> ReplyDestination {
    if !request.giaddr.is_unspecified() {
        ReplyDestination::Unicast(SocketAddrV4::new(request.giaddr, 67))
    } else {
        ReplyDestination::Broadcast
    }
}

fn client_identity_of(request: &DhcpMessage) -> (ClientIdentity, HardwareAddress) {
    let hwaddr = HardwareAddress::new(request.htype, &request.chaddr);
    let identity = ClientIdentity::from_request(request.client_identifier(), &hwaddr);
    (identity, hwaddr)
}

fn build_nak(request: &DhcpMessage, interface_addr: Ipv4Addr) -> DhcpMessage {
    let mut reply = DhcpMessage::new_reply(request);
    reply.yiaddr = Ipv4Addr::UNSPECIFIED;
    reply.options = vec![
        DhcpOption::MessageType(MessageType::Nak),
        DhcpOption::ServerIdentifier(interface_addr),
        DhcpOption::End,
    ];
    reply
}

#[allow(clippy::too_many_arguments)]
fn build_options_reply(
    request: &DhcpMessage,
    scope: &Scope,
    interface_addr: Ipv4Addr,
    message_type: MessageType,
    yiaddr: Ipv4Addr,
    lease_time_secs: u32,
    resolved_host_name: Option<&str>,
) -> Option<DhcpMessage> {
    let requested = request.parameter_request_list().unwrap_or(&[]);
    let options = scope.get_options(
        requested,
        request.vendor_class_identifier(),
        request.client_fqdn(),
        resolved_host_name,
        message_type,
        lease_time_secs,
        interface_addr,
    )?;
    let mut reply = DhcpMessage::new_reply(request);
    reply.yiaddr = yiaddr;
    reply.options = options;
    Some(reply)
}

fn notify_dns_add(scope: &Scope, zone_store: Option<&Arc<dyn dns::ZoneStore>>, host: Option<&str>, address: Ipv4Addr) {
    let (Some(store), Some(domain), Some(host)) = (zone_store, scope.config().domain_name.as_ref(), host) else {
        return;
    };
    let ns_host = format!("ns1.{domain}");
    if let Err(err) = dns::apply_lease_add(store, domain, &scope.reverse_zone(), &ns_host, host, address, scope.config().dns_ttl) {
        warn!(%err, "failed to update DNS records for lease");
    }
}

fn notify_dns_remove(scope: &Scope, zone_store: Option<&Arc<dyn dns::ZoneStore>>, host: Option<&str>, address: Ipv4Addr) {
    let (Some(store), Some(domain), Some(host)) = (zone_store, scope.config().domain_name.as_ref(), host) else {
        return;
    };
    if let Err(err) = dns::apply_lease_remove(store, domain, &scope.reverse_zone(), host, address) {
        warn!(%err, "failed to remove DNS records for lease");
    }
}

#[instrument(skip(request, registry), fields(xid = request.xid))]
fn handle_discover(
    request: &DhcpMessage,
    remote_addr: SocketAddrV4,
    interface_addr: Ipv4Addr,
    registry: &ScopeRegistry,
) -> Option<(DhcpMessage, ReplyDestination)> {
    let scope = find_scope_for(request, remote_addr, interface_addr, registry)?;
    let delay = scope.config().offer_delay_ms;
    if delay > 0 {
        thread::sleep(Duration::from_millis(delay));
    }
    let (client_identity, hwaddr) = client_identity_of(request);
    let host_name = request.host_name();

    let lease = match scope.find_offer(&client_identity, &hwaddr, request.client_fqdn(), host_name) {
        Ok(lease) => lease,
        Err(err) => {
            warn!(%err, scope = %scope.name(), "no address available for DISCOVER");
            return None;
        }
    };

    let resolved_host = scope.resolve_host_name(request.client_fqdn(), host_name);
    let reply = build_options_reply(
        request,
        &scope,
        interface_addr,
        MessageType::Offer,
        lease.address,
        scope.config().lease_time_secs,
        resolved_host.as_deref(),
    )?;
    Some((reply, ack_destination(request)))
}

#[instrument(skip(request, registry, zone_store), fields(xid = request.xid))]
fn handle_request(
    request: &DhcpMessage,
    remote_addr: SocketAddrV4,
    interface_addr: Ipv4Addr,
    registry: &ScopeRegistry,
    zone_store: Option<&Arc<dyn dns::ZoneStore>>,
) -> Option<(DhcpMessage, ReplyDestination)> {
    let scope = find_scope_for(request, remote_addr, interface_addr, registry)?;
    let (client_identity, _hwaddr) = client_identity_of(request);

    let server_id = request.server_identifier();
    let requested_ip = request.requested_ip_address();
    let ciaddr_set = !request.ciaddr.is_unspecified();

    let matches = match (server_id, ciaddr_set, requested_ip) {
        (None, true, _) => {
            // RENEWING / REBINDING: ciaddr must match the existing bind.
            matches!(scope.existing_lease_or_offer(&client_identity), Some(lease) if lease.address == request.ciaddr)
        }
        (None, false, Some(req_ip)) => {
            // INIT-REBOOT.
            matches!(scope.existing_lease_or_offer(&client_identity), Some(lease) if lease.address == req_ip)
        }
        (Some(sid), _, Some(req_ip)) => {
            // SELECTING: a server-id naming someone else means our offer
            // was declined; stay silent rather than contest it.
            if sid != interface_addr {
                return None;
            }
            matches!(scope.existing_lease_or_offer(&client_identity), Some(lease) if lease.address == req_ip)
        }
        _ => {
            debug!("malformed REQUEST: no server-id, no ciaddr, no requested-ip");
            return None;
        }
    };

    if !matches {
        return Some((build_nak(request, interface_addr), nak_destination(request)));
    }

    let requested_lease = request.address_lease_time();
    let lease = match scope.commit_lease(&client_identity, requested_lease) {
        Some(lease) => lease,
        None => return Some((build_nak(request, interface_addr), nak_destination(request))),
    };

    // Mirrors the clamp `commit_lease` applied, so option 51 in the ACK
    // matches the expiry the lease was actually committed with.
    let granted_lease_secs = match requested_lease {
        Some(req) if req > 0 => req.min(scope.config().lease_time_secs),
        _ => scope.config().lease_time_secs,
    };

    let resolved_host = scope.resolve_host_name(request.client_fqdn(), request.host_name());
    let reply = build_options_reply(
        request,
        &scope,
        interface_addr,
        MessageType::Ack,
        lease.address,
        granted_lease_secs,
        resolved_host.as_deref(),
    )?;

    notify_dns_add(&scope, zone_store, resolved_host.as_deref(), lease.address);

    Some((reply, ack_destination(request)))
}

#[instrument(skip(request, registry, zone_store), fields(xid = request.xid))]
fn handle_decline(
    request: &DhcpMessage,
    remote_addr: SocketAddrV4,
    interface_addr: Ipv4Addr,
    registry: &ScopeRegistry,
    zone_store: Option<&Arc<dyn dns::ZoneStore>>,
) -> Option<()> {
    let scope = find_scope_for(request, remote_addr, interface_addr, registry)?;
    let server_id = request.server_identifier()?;
    if server_id != interface_addr {
        return None;
    }
    let requested_ip = request.requested_ip_address()?;
    let (client_identity, _) = client_identity_of(request);
    let existing = scope.existing_lease_or_offer(&client_identity)?;
    if existing.address != requested_ip {
        return None;
    }
    scope.release_lease(&client_identity);
    scope.mark_address_bad(requested_ip);
    notify_dns_remove(&scope, zone_store, existing.host_name.as_deref(), existing.address);
    Some(())
}

#[instrument(skip(request, registry, zone_store), fields(xid = request.xid))]
fn handle_release(
    request: &DhcpMessage,
    remote_addr: SocketAddrV4,
    interface_addr: Ipv4Addr,
    registry: &ScopeRegistry,
    zone_store: Option<&Arc<dyn dns::ZoneStore>>,
) -> Option<()> {
    let scope = find_scope_for(request, remote_addr, interface_addr, registry)?;
    let server_id = request.server_identifier()?;
    if server_id != interface_addr {
        return None;
    }
    if request.ciaddr.is_unspecified() {
        return None;
    }
    let (client_identity, _) = client_identity_of(request);
    let existing = scope.existing_lease_or_offer(&client_identity)?;
    if existing.address != request.ciaddr {
        return None;
    }
    scope.release_lease(&client_identity);
    notify_dns_remove(&scope, zone_store, existing.host_name.as_deref(), existing.address);
    Some(())
}

#[instrument(skip(request, registry), fields(xid = request.xid))]
fn handle_inform(
    request: &DhcpMessage,
    remote_addr: SocketAddrV4,
    interface_addr: Ipv4Addr,
    registry: &ScopeRegistry,
) -> Option<(DhcpMessage, ReplyDestination)> {
    let scope = find_scope_for(request, remote_addr, interface_addr, registry)?;
    let resolved_host = scope.resolve_host_name(request.client_fqdn(), request.host_name());
    let reply = build_options_reply(
        request,
        &scope,
        interface_addr,
        MessageType::Ack,
        Ipv4Addr::UNSPECIFIED,
        scope.config().lease_time_secs,
        resolved_host.as_deref(),
    )?;
    Some((reply, ack_destination(request)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{Scope, ScopeConfig};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn scope_config() -> ScopeConfig {
        ScopeConfig {
            interface_address: Ipv4Addr::new(10, 0, 0, 1),
            start: Ipv4Addr::new(10, 0, 0, 100),
            end: Ipv4Addr::new(10, 0, 0, 200),
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

    fn registry_with_scope() -> ScopeRegistry {
        let registry = ScopeRegistry::new();
        registry
            .insert(Arc::new(Scope::new("default", true, scope_config())))
            .unwrap();
        registry
    }

    fn discover(chaddr: [u8; 6], xid: u32) -> DhcpMessage {
        DhcpMessage {
            op: Opcode::BootRequest,
            htype: 1,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: chaddr.to_vec(),
            sname: Vec::new(),
            file: Vec::new(),
            options: vec![DhcpOption::MessageType(MessageType::Discover), DhcpOption::End],
        }
    }

    #[test]
    fn discover_on_free_pool_offers_first_address() {
        let registry = registry_with_scope();
        let request = discover([0, 0x11, 0x22, 0x33, 0x44, 0x55], 0xAABBCCDD);
        let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 68);
        let (reply, dest) = handle_message(&request, remote, Ipv4Addr::new(10, 0, 0, 1), &registry, None).unwrap();
        assert_eq!(reply.yiaddr, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(reply.message_type(), Some(MessageType::Offer));
        assert_eq!(reply.server_identifier(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(dest, ReplyDestination::Broadcast);
    }

    #[test]
    fn selecting_request_with_matching_offer_yields_ack() {
        let registry = registry_with_scope();
        let discover_req = discover([0, 0x11, 0x22, 0x33, 0x44, 0x55], 1);
        let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 68);
        let (offer, _) = handle_message(&discover_req, remote, Ipv4Addr::new(10, 0, 0, 1), &registry, None).unwrap();

        let mut request = discover_req.clone();
        request.options = vec![
            DhcpOption::MessageType(MessageType::Request),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
            DhcpOption::RequestedIpAddress(offer.yiaddr),
            DhcpOption::End,
        ];
        let (ack, _) = handle_message(&request, remote, Ipv4Addr::new(10, 0, 0, 1), &registry, None).unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, offer.yiaddr);
    }

    #[test]
    fn selecting_request_with_wrong_server_id_is_silently_dropped() {
        let registry = registry_with_scope();
        let discover_req = discover([0, 0x11, 0x22, 0x33, 0x44, 0x55], 1);
        let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 68);
        let (offer, _) = handle_message(&discover_req, remote, Ipv4Addr::new(10, 0, 0, 1), &registry, None).unwrap();

        let mut request = discover_req.clone();
        request.options = vec![
            DhcpOption::MessageType(MessageType::Request),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 2)),
            DhcpOption::RequestedIpAddress(offer.yiaddr),
            DhcpOption::End,
        ];
        let reply = handle_message(&request, remote, Ipv4Addr::new(10, 0, 0, 1), &registry, None);
        assert!(reply.is_none());
    }

    #[test]
    fn init_reboot_with_unknown_address_yields_nak() {
        let registry = registry_with_scope();
        let mut request = discover([0, 0x11, 0x22, 0x33, 0x44, 0x55], 1);
        request.options = vec![
            DhcpOption::MessageType(MessageType::Request),
            DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 250)),
            DhcpOption::End,
        ];
        let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 68);
        let (reply, dest) = handle_message(&request, remote, Ipv4Addr::new(10, 0, 0, 1), &registry, None).unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Nak));
        assert_eq!(dest, ReplyDestination::Broadcast);
    }

    #[test]
    fn relayed_discover_replies_unicast_to_giaddr() {
        let registry = ScopeRegistry::new();
        let mut config = scope_config();
        config.interface_address = Ipv4Addr::new(192, 168, 5, 1);
        config.start = Ipv4Addr::new(192, 168, 5, 100);
        config.end = Ipv4Addr::new(192, 168, 5, 200);
        registry.insert(Arc::new(Scope::new("relayed", true, config))).unwrap();

        let mut request = discover([0, 0x11, 0x22, 0x33, 0x44, 0x55], 1);
        request.giaddr = Ipv4Addr::new(192, 168, 5, 1);
        let remote = SocketAddrV4::new(Ipv4Addr::new(192, 168, 5, 1), 67);
        let (reply, dest) = handle_message(&request, remote, Ipv4Addr::new(192, 168, 5, 1), &registry, None).unwrap();
        assert_eq!(reply.yiaddr, Ipv4Addr::new(192, 168, 5, 100));
        assert_eq!(dest, ReplyDestination::Unicast(SocketAddrV4::new(Ipv4Addr::new(192, 168, 5, 1), 67)));
    }

    #[test]
    fn decline_releases_lease_and_marks_address_bad() {
        let registry = registry_with_scope();
        let discover_req = discover([0, 0x11, 0x22, 0x33, 0x44, 0x55], 1);
        let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 68);
        let (offer, _) = handle_message(&discover_req, remote, Ipv4Addr::new(10, 0, 0, 1), &registry, None).unwrap();
        let mut request_msg = discover_req.clone();
        request_msg.options = vec![
            DhcpOption::MessageType(MessageType::Request),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
            DhcpOption::RequestedIpAddress(offer.yiaddr),
            DhcpOption::End,
        ];
        handle_message(&request_msg, remote, Ipv4Addr::new(10, 0, 0, 1), &registry, None).unwrap();

        let mut decline = discover_req.clone();
        decline.options = vec![
            DhcpOption::MessageType(MessageType::Decline),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
            DhcpOption::RequestedIpAddress(offer.yiaddr),
            DhcpOption::End,
        ];
        let reply = handle_message(&decline, remote, Ipv4Addr::new(10, 0, 0, 1), &registry, None);
        assert!(reply.is_none());

        let mut next_discover = discover([0, 0x11, 0x22, 0x33, 0x44, 0x99], 2);
        next_discover.chaddr = vec![0, 0x11, 0x22, 0x33, 0x44, 0x99];
        let (next_offer, _) = handle_message(&next_discover, remote, Ipv4Addr::new(10, 0, 0, 1), &registry, None).unwrap();
        assert_ne!(next_offer.yiaddr, offer.yiaddr);
    }
}
