//! `dhcp4d-probe`: sends one DISCOVER and prints whatever comes back.
//! Grounded on the teacher's `src/client.rs` throwaway protocol
//! exerciser (construct a message, bind a socket, send, decode the
//! reply) carried over to the DHCPv4 DISCOVER/OFFER exchange.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use dhcp4d::wire::{DhcpMessage, DhcpOption, MessageType, Opcode};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        println!("dhcp4d-probe [--server <addr>] [--chaddr <aa:bb:cc:dd:ee:ff>]");
        return Ok(());
    }
    let server: Ipv4Addr = args
        .opt_value_from_str::<_, String>("--server")?
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(Ipv4Addr::BROADCAST);
    let chaddr = args
        .opt_value_from_str::<_, String>("--chaddr")?
        .map(|s| parse_mac(&s))
        .transpose()?
        .unwrap_or([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 68))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(Duration::from_secs(5)))?;

    let xid = 0x1234_5678;
    let discover = build_discover(xid, &chaddr);
    let bytes = discover.encode();
    socket.send_to(&bytes, SocketAddrV4::new(server, 67))?;
    println!("sent DISCOVER (xid={xid:#x}) to {server}:67");

    let mut buf = [0u8; 576];
    let (n, from) = socket.recv_from(&mut buf)?;
    let reply = DhcpMessage::decode(&buf[..n])?;
    println!("received {n} bytes from {from}");
    println!("yiaddr: {}", reply.yiaddr);
    for opt in &reply.options {
        if let DhcpOption::MessageType(mt) = opt {
            println!("message type: {mt:?}");
        }
    }
    Ok(())
}

fn build_discover(xid: u32, chaddr: &[u8; 6]) -> DhcpMessage {
    DhcpMessage {
        op: Opcode::BootRequest,
        htype: 1,
        hops: 0,
        xid,
        secs: 0,
        flags: 0x8000,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        siaddr: Ipv4Addr::UNSPECIFIED,
        giaddr: Ipv4Addr::UNSPECIFIED,
        chaddr: chaddr.to_vec(),
        sname: Vec::new(),
        file: Vec::new(),
        options: vec![
            DhcpOption::MessageType(MessageType::Discover),
            DhcpOption::ParameterRequestList(vec![1, 3, 6, 15, 51, 54]),
            DhcpOption::End,
        ],
    }
}

fn parse_mac(s: &str) -> Result<[u8; 6], Box<dyn std::error::Error>> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(format!("expected 6 colon-separated hex octets, got `{s}`").into());
    }
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16)?;
    }
    Ok(out)
}
