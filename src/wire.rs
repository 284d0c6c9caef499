//! RFC 2131/2132/3396/4702 message codec.
//!
//! This is a from-scratch implementation rather than a wrapper around an
//! external DHCP crate: the wire format is itself a core deliverable of
//! this server (see DESIGN.md), so the exact byte layout has to live here
//! where it can be tested against the RFCs directly.

use std::fmt;
use std::net::Ipv4Addr;

pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
/// Fixed header (236 bytes) + magic cookie (4 bytes).
pub const MIN_MESSAGE_LEN: usize = 240;
const CHADDR_LEN: usize = 16;
const SNAME_LEN: usize = 64;
const FILE_LEN: usize = 128;
const BROADCAST_FLAG: u16 = 0x8000;

pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DOMAIN_NAME_SERVER: u8 = 6;
pub const OPT_HOST_NAME: u8 = 12;
pub const OPT_DOMAIN_NAME: u8 = 15;
pub const OPT_BROADCAST_ADDRESS: u8 = 28;
pub const OPT_NTP_SERVERS: u8 = 42;
pub const OPT_REQUESTED_IP_ADDRESS: u8 = 50;
pub const OPT_ADDRESS_LEASE_TIME: u8 = 51;
pub const OPT_OPTION_OVERLOAD: u8 = 52;
pub const OPT_DHCP_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_IDENTIFIER: u8 = 54;
pub const OPT_PARAMETER_REQUEST_LIST: u8 = 55;
pub const OPT_MAX_MESSAGE_SIZE: u8 = 57;
pub const OPT_VENDOR_CLASS_IDENTIFIER: u8 = 60;
pub const OPT_CLIENT_IDENTIFIER: u8 = 61;
pub const OPT_CLIENT_FQDN: u8 = 81;
pub const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    BootRequest,
    BootReply,
    Unknown(u8),
}

impl From<u8> for Opcode {
    fn from(v: u8) -> Self {
        match v {
            1 => Opcode::BootRequest,
            2 => Opcode::BootReply,
            other => Opcode::Unknown(other),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(v: Opcode) -> Self {
        match v {
            Opcode::BootRequest => 1,
            Opcode::BootReply => 2,
            Opcode::Unknown(o) => o,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(v: u8) -> Self {
        use MessageType::*;
        match v {
            1 => Discover,
            2 => Offer,
            3 => Request,
            4 => Decline,
            5 => Ack,
            6 => Nak,
            7 => Release,
            8 => Inform,
            other => Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(v: MessageType) -> Self {
        use MessageType::*;
        match v {
            Discover => 1,
            Offer => 2,
            Request => 3,
            Decline => 4,
            Ack => 5,
            Nak => 6,
            Release => 7,
            Inform => 8,
            Unknown(o) => o,
        }
    }
}

/// RFC 4702 Client FQDN option (81).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFqdn {
    pub flags: u8,
    pub domain: String,
}

impl ClientFqdn {
    const FLAG_S: u8 = 0x01;
    const FLAG_O: u8 = 0x02;
    const FLAG_E: u8 = 0x04;
    const FLAG_N: u8 = 0x08;

    pub fn server_should_update_a(&self) -> bool {
        self.flags & Self::FLAG_S != 0
    }

    pub fn no_update_requested(&self) -> bool {
        self.flags & Self::FLAG_N != 0
    }

    /// The option to echo back: clears S, sets O, leaves E/N alone.
    pub fn server_reply(domain: String) -> Self {
        ClientFqdn {
            flags: Self::FLAG_O,
            domain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    Pad,
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DomainNameServer(Vec<Ipv4Addr>),
    HostName(String),
    DomainName(String),
    BroadcastAddress(Ipv4Addr),
    NtpServers(Vec<Ipv4Addr>),
    RequestedIpAddress(Ipv4Addr),
    AddressLeaseTime(u32),
    OptionOverload(u8),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    MaxMessageSize(u16),
    VendorClassIdentifier(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    ClientFqdn(ClientFqdn),
    End,
    /// Anything this server doesn't interpret, kept verbatim so it can be
    /// echoed or at least not silently destroyed.
    Unknown(u8, Vec<u8>),
}

impl DhcpOption {
    pub fn code(&self) -> u8 {
        match self {
            DhcpOption::Pad => OPT_PAD,
            DhcpOption::SubnetMask(_) => OPT_SUBNET_MASK,
            DhcpOption::Router(_) => OPT_ROUTER,
            DhcpOption::DomainNameServer(_) => OPT_DOMAIN_NAME_SERVER,
            DhcpOption::HostName(_) => OPT_HOST_NAME,
            DhcpOption::DomainName(_) => OPT_DOMAIN_NAME,
            DhcpOption::BroadcastAddress(_) => OPT_BROADCAST_ADDRESS,
            DhcpOption::NtpServers(_) => OPT_NTP_SERVERS,
            DhcpOption::RequestedIpAddress(_) => OPT_REQUESTED_IP_ADDRESS,
            DhcpOption::AddressLeaseTime(_) => OPT_ADDRESS_LEASE_TIME,
            DhcpOption::OptionOverload(_) => OPT_OPTION_OVERLOAD,
            DhcpOption::MessageType(_) => OPT_DHCP_MESSAGE_TYPE,
            DhcpOption::ServerIdentifier(_) => OPT_SERVER_IDENTIFIER,
            DhcpOption::ParameterRequestList(_) => OPT_PARAMETER_REQUEST_LIST,
            DhcpOption::MaxMessageSize(_) => OPT_MAX_MESSAGE_SIZE,
            DhcpOption::VendorClassIdentifier(_) => OPT_VENDOR_CLASS_IDENTIFIER,
            DhcpOption::ClientIdentifier(_) => OPT_CLIENT_IDENTIFIER,
            DhcpOption::ClientFqdn(_) => OPT_CLIENT_FQDN,
            DhcpOption::End => OPT_END,
            DhcpOption::Unknown(code, _) => *code,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            DhcpOption::Pad | DhcpOption::End => {}
            DhcpOption::SubnetMask(ip)
            | DhcpOption::BroadcastAddress(ip)
            | DhcpOption::RequestedIpAddress(ip)
            | DhcpOption::ServerIdentifier(ip) => out.extend_from_slice(&ip.octets()),
            DhcpOption::Router(ips) | DhcpOption::DomainNameServer(ips) | DhcpOption::NtpServers(ips) => {
                for ip in ips {
                    out.extend_from_slice(&ip.octets());
                }
            }
            DhcpOption::HostName(s) | DhcpOption::DomainName(s) => out.extend_from_slice(s.as_bytes()),
            DhcpOption::AddressLeaseTime(v) => out.extend_from_slice(&v.to_be_bytes()),
            DhcpOption::OptionOverload(v) => out.push(*v),
            DhcpOption::MessageType(mt) => out.push(u8::from(*mt)),
            DhcpOption::ParameterRequestList(codes) => out.extend_from_slice(codes),
            DhcpOption::MaxMessageSize(v) => out.extend_from_slice(&v.to_be_bytes()),
            DhcpOption::VendorClassIdentifier(bytes) | DhcpOption::ClientIdentifier(bytes) => {
                out.extend_from_slice(bytes)
            }
            DhcpOption::ClientFqdn(fqdn) => {
                out.push(fqdn.flags);
                out.push(0xff); // deprecated rcode1
                out.push(0xff); // deprecated rcode2
                out.extend_from_slice(fqdn.domain.as_bytes());
            }
            DhcpOption::Unknown(_, bytes) => out.extend_from_slice(bytes),
        }
    }

    /// Encode as one or more TLVs, splitting the payload into 255-byte
    /// chunks per RFC 3396 when it would not otherwise fit.
    fn encode(&self, out: &mut Vec<u8>) {
        if matches!(self, DhcpOption::Pad) {
            out.push(OPT_PAD);
            return;
        }
        if matches!(self, DhcpOption::End) {
            out.push(OPT_END);
            return;
        }
        let mut payload = Vec::new();
        self.encode_payload(&mut payload);
        if payload.is_empty() {
            out.push(self.code());
            out.push(0);
            return;
        }
        for chunk in payload.chunks(255) {
            out.push(self.code());
            out.push(chunk.len() as u8);
            out.extend_from_slice(chunk);
        }
    }

    fn from_code_and_bytes(code: u8, bytes: &[u8]) -> DhcpOption {
        match code {
            OPT_SUBNET_MASK if bytes.len() == 4 => DhcpOption::SubnetMask(ipv4(bytes)),
            OPT_ROUTER if !bytes.is_empty() && bytes.len() % 4 == 0 => DhcpOption::Router(ipv4_list(bytes)),
            OPT_DOMAIN_NAME_SERVER if !bytes.is_empty() && bytes.len() % 4 == 0 => {
                DhcpOption::DomainNameServer(ipv4_list(bytes))
            }
            OPT_HOST_NAME => DhcpOption::HostName(lossy_string(bytes)),
            OPT_DOMAIN_NAME => DhcpOption::DomainName(lossy_string(bytes)),
            OPT_BROADCAST_ADDRESS if bytes.len() == 4 => DhcpOption::BroadcastAddress(ipv4(bytes)),
            OPT_NTP_SERVERS if !bytes.is_empty() && bytes.len() % 4 == 0 => {
                DhcpOption::NtpServers(ipv4_list(bytes))
            }
            OPT_REQUESTED_IP_ADDRESS if bytes.len() == 4 => DhcpOption::RequestedIpAddress(ipv4(bytes)),
            OPT_ADDRESS_LEASE_TIME if bytes.len() == 4 => {
                DhcpOption::AddressLeaseTime(u32::from_be_bytes(bytes.try_into().unwrap()))
            }
            OPT_OPTION_OVERLOAD if bytes.len() == 1 => DhcpOption::OptionOverload(bytes[0]),
            OPT_DHCP_MESSAGE_TYPE if bytes.len() == 1 => DhcpOption::MessageType(MessageType::from(bytes[0])),
            OPT_SERVER_IDENTIFIER if bytes.len() == 4 => DhcpOption::ServerIdentifier(ipv4(bytes)),
            OPT_PARAMETER_REQUEST_LIST => DhcpOption::ParameterRequestList(bytes.to_vec()),
            OPT_MAX_MESSAGE_SIZE if bytes.len() == 2 => {
                DhcpOption::MaxMessageSize(u16::from_be_bytes(bytes.try_into().unwrap()))
            }
            OPT_VENDOR_CLASS_IDENTIFIER => DhcpOption::VendorClassIdentifier(bytes.to_vec()),
            OPT_CLIENT_IDENTIFIER => DhcpOption::ClientIdentifier(bytes.to_vec()),
            OPT_CLIENT_FQDN if bytes.len() >= 3 => DhcpOption::ClientFqdn(ClientFqdn {
                flags: bytes[0],
                domain: lossy_string(&bytes[3..]),
            }),
            other => DhcpOption::Unknown(other, bytes.to_vec()),
        }
    }
}

fn ipv4(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

fn ipv4_list(bytes: &[u8]) -> Vec<Ipv4Addr> {
    bytes.chunks_exact(4).map(ipv4).collect()
}

fn lossy_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: Opcode,
    pub htype: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    /// Truncated to `hlen` on decode; `hlen` itself is `chaddr.len()`.
    pub chaddr: Vec<u8>,
    pub sname: Vec<u8>,
    pub file: Vec<u8>,
    pub options: Vec<DhcpOption>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    TooShort { got: usize, need: usize },
    BadMagicCookie,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::TooShort { got, need } => {
                write!(f, "message too short: got {got} bytes, need at least {need}")
            }
            WireError::BadMagicCookie => write!(f, "missing or invalid DHCP magic cookie"),
        }
    }
}

impl std::error::Error for WireError {}

impl DhcpMessage {
    pub fn hlen(&self) -> u8 {
        self.chaddr.len() as u8
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    pub fn set_broadcast(&mut self, broadcast: bool) {
        if broadcast {
            self.flags |= BROADCAST_FLAG;
        } else {
            self.flags &= !BROADCAST_FLAG;
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|o| match o {
            DhcpOption::MessageType(mt) => Some(*mt),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|o| match o {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn requested_ip_address(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|o| match o {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|o| match o {
            DhcpOption::ClientIdentifier(bytes) => Some(bytes.as_slice()),
            _ => None,
        })
    }

    pub fn host_name(&self) -> Option<&str> {
        self.options.iter().find_map(|o| match o {
            DhcpOption::HostName(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn client_fqdn(&self) -> Option<&ClientFqdn> {
        self.options.iter().find_map(|o| match o {
            DhcpOption::ClientFqdn(f) => Some(f),
            _ => None,
        })
    }

    pub fn vendor_class_identifier(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|o| match o {
            DhcpOption::VendorClassIdentifier(bytes) => Some(bytes.as_slice()),
            _ => None,
        })
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|o| match o {
            DhcpOption::ParameterRequestList(codes) => Some(codes.as_slice()),
            _ => None,
        })
    }

    pub fn address_lease_time(&self) -> Option<u32> {
        self.options.iter().find_map(|o| match o {
            DhcpOption::AddressLeaseTime(secs) => Some(*secs),
            _ => None,
        })
    }

    /// Build a reply shell with the fixed fields RFC 2131 prescribes for
    /// server responses, leaving `yiaddr` and `options` for the caller.
    pub fn new_reply(request: &DhcpMessage) -> DhcpMessage {
        DhcpMessage {
            op: Opcode::BootReply,
            htype: request.htype,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: request.giaddr,
            chaddr: request.chaddr.clone(),
            sname: Vec::new(),
            file: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<DhcpMessage, WireError> {
        if buf.len() < MIN_MESSAGE_LEN {
            return Err(WireError::TooShort {
                got: buf.len(),
                need: MIN_MESSAGE_LEN,
            });
        }
        let mut pos = 0usize;
        let read_u8 = |pos: &mut usize| -> u8 {
            let v = buf[*pos];
            *pos += 1;
            v
        };
        let read_u16 = |pos: &mut usize| -> u16 {
            let v = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]);
            *pos += 2;
            v
        };
        let read_u32 = |pos: &mut usize| -> u32 {
            let v = u32::from_be_bytes(buf[*pos..*pos + 4].try_into().unwrap());
            *pos += 4;
            v
        };
        let read_ipv4 = |pos: &mut usize| -> Ipv4Addr {
            let v = Ipv4Addr::new(buf[*pos], buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]);
            *pos += 4;
            v
        };
        let read_slice = |pos: &mut usize, n: usize| -> Vec<u8> {
            let v = buf[*pos..*pos + n].to_vec();
            *pos += n;
            v
        };

        let op = Opcode::from(read_u8(&mut pos));
        let htype = read_u8(&mut pos);
        let hlen = read_u8(&mut pos) as usize;
        let hops = read_u8(&mut pos);
        let xid = read_u32(&mut pos);
        let secs = read_u16(&mut pos);
        let flags = read_u16(&mut pos);
        let ciaddr = read_ipv4(&mut pos);
        let yiaddr = read_ipv4(&mut pos);
        let siaddr = read_ipv4(&mut pos);
        let giaddr = read_ipv4(&mut pos);
        let chaddr_raw = read_slice(&mut pos, CHADDR_LEN);
        let chaddr = chaddr_raw[..hlen.min(CHADDR_LEN)].to_vec();
        let sname = read_slice(&mut pos, SNAME_LEN);
        let file = read_slice(&mut pos, FILE_LEN);

        if buf[pos..pos + 4] != MAGIC_COOKIE {
            return Err(WireError::BadMagicCookie);
        }
        pos += 4;

        let mut raw = decode_option_area(&buf[pos..]);
        let overload = raw.iter().find_map(|(code, bytes)| {
            if *code == OPT_OPTION_OVERLOAD && bytes.len() == 1 {
                Some(bytes[0])
            } else {
                None
            }
        });
        if let Some(overload) = overload {
            if overload & 0x1 != 0 {
                raw.extend(decode_option_area(&file));
            }
            if overload & 0x2 != 0 {
                raw.extend(decode_option_area(&sname));
            }
        }

        let options = reassemble_long_options(raw);

        Ok(DhcpMessage {
            op,
            htype,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname: if overload.is_some() { Vec::new() } else { sname },
            file: if overload.is_some() { Vec::new() } else { file },
            options,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(300);
        out.push(u8::from(self.op));
        out.push(self.htype);
        out.push(self.hlen());
        out.push(self.hops);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.ciaddr.octets());
        out.extend_from_slice(&self.yiaddr.octets());
        out.extend_from_slice(&self.siaddr.octets());
        out.extend_from_slice(&self.giaddr.octets());
        let mut chaddr_field = [0u8; CHADDR_LEN];
        let n = self.chaddr.len().min(CHADDR_LEN);
        chaddr_field[..n].copy_from_slice(&self.chaddr[..n]);
        out.extend_from_slice(&chaddr_field);
        pad_to(&mut out, &self.sname, SNAME_LEN);
        pad_to(&mut out, &self.file, FILE_LEN);
        out.extend_from_slice(&MAGIC_COOKIE);
        for opt in &self.options {
            opt.encode(&mut out);
        }
        if !matches!(self.options.last(), Some(DhcpOption::End)) {
            out.push(OPT_END);
        }
        out
    }
}

fn pad_to(out: &mut Vec<u8>, field: &[u8], len: usize) {
    let n = field.len().min(len);
    out.extend_from_slice(&field[..n]);
    out.resize(out.len() + (len - n), 0);
}

/// First decode pass: raw `(code, bytes)` TLVs in wire order. Option 0
/// (pad) is dropped; decoding stops at option 255 (end) or end of buffer.
fn decode_option_area(buf: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let code = buf[pos];
        pos += 1;
        if code == OPT_PAD {
            continue;
        }
        if code == OPT_END {
            break;
        }
        if pos >= buf.len() {
            break;
        }
        let len = buf[pos] as usize;
        pos += 1;
        if pos + len > buf.len() {
            break;
        }
        out.push((code, buf[pos..pos + len].to_vec()));
        pos += len;
    }
    out
}

/// RFC 3396: options that appear more than once with the same code are
/// concatenated in order of appearance before being interpreted.
fn reassemble_long_options(raw: Vec<(u8, Vec<u8>)>) -> Vec<DhcpOption> {
    let mut order: Vec<u8> = Vec::new();
    let mut merged: std::collections::HashMap<u8, Vec<u8>> = std::collections::HashMap::new();
    for (code, bytes) in raw {
        if code == OPT_OPTION_OVERLOAD {
            // handled by the caller separately; still echo it through.
        }
        if !merged.contains_key(&code) {
            order.push(code);
        }
        merged.entry(code).or_default().extend(bytes);
    }
    order
        .into_iter()
        .map(|code| {
            let bytes = merged.remove(&code).unwrap_or_default();
            DhcpOption::from_code_and_bytes(code, &bytes)
        })
        .collect()
}
