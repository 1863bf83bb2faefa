use std::net::Ipv4Addr;

use advmac::MacAddr6;
use compact_str::{format_compact, CompactString};
use dhcproto::v4::{self, DhcpOption, Flags};
use dhcproto::{Decodable, Encodable};
use thiserror::Error;

/// Fixed DHCPv4 header plus the magic cookie.
const MIN_PACKET_LEN: usize = 240;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const HLEN_OFFSET: usize = 2;
const COOKIE_OFFSET: usize = 236;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet of {0} bytes is too short to be DHCP")]
    TooShort(usize),

    #[error("hardware address length {0} exceeds 16")]
    HlenTooLarge(u8),

    #[error("magic cookie mismatch")]
    BadCookie,

    #[error("message type option missing")]
    MissingMessageType,

    #[error("message type {0} outside DISCOVER..INFORM")]
    BadMessageType(u8),

    #[error("decode failed: {0}")]
    Decode(#[from] dhcproto::error::DecodeError),
}

/// Canonical lowercase colon form used for cache keys, logs, and the API.
pub fn mac_str(mac: MacAddr6) -> CompactString {
    let b = mac.to_array();
    format_compact!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0],
        b[1],
        b[2],
        b[3],
        b[4],
        b[5]
    )
}

/// Validate a raw datagram and decode it. Enforces the minimum length, the
/// hardware-address length bound, the magic cookie, and that option 53 is
/// present with a client-to-server value. Anything else is a drop.
pub fn decode_request(buf: &[u8]) -> Result<(v4::Message, v4::MessageType), CodecError> {
    if buf.len() < MIN_PACKET_LEN {
        return Err(CodecError::TooShort(buf.len()));
    }
    if buf[HLEN_OFFSET] > 16 {
        return Err(CodecError::HlenTooLarge(buf[HLEN_OFFSET]));
    }
    if buf[COOKIE_OFFSET..COOKIE_OFFSET + 4] != MAGIC_COOKIE {
        return Err(CodecError::BadCookie);
    }

    let message = v4::Message::from_bytes(buf)?;
    let msg_type = match message.opts().get(v4::OptionCode::MessageType) {
        Some(DhcpOption::MessageType(t)) => *t,
        _ => return Err(CodecError::MissingMessageType),
    };
    let raw: u8 = u8::from(msg_type);
    if !(1..=8).contains(&raw) {
        return Err(CodecError::BadMessageType(raw));
    }
    Ok((message, msg_type))
}

pub fn encode(message: &v4::Message) -> Result<Vec<u8>, dhcproto::error::EncodeError> {
    message.to_vec()
}

/// Accessors for the request options the state machines care about.
pub trait MessageExt {
    fn client_mac(&self) -> Option<MacAddr6>;
    fn server_id(&self) -> Option<Ipv4Addr>;
    fn requested_ip(&self) -> Option<Ipv4Addr>;
    fn hostname(&self) -> Option<&str>;
    fn param_request_list(&self) -> Option<&Vec<v4::OptionCode>>;
    fn requested_lease_time(&self) -> Option<u32>;
}

impl MessageExt for v4::Message {
    fn client_mac(&self) -> Option<MacAddr6> {
        MacAddr6::try_from(self.chaddr()).ok()
    }

    fn server_id(&self) -> Option<Ipv4Addr> {
        match self.opts().get(v4::OptionCode::ServerIdentifier) {
            Some(DhcpOption::ServerIdentifier(addr)) => Some(*addr),
            _ => None,
        }
    }

    fn requested_ip(&self) -> Option<Ipv4Addr> {
        match self.opts().get(v4::OptionCode::RequestedIpAddress) {
            Some(DhcpOption::RequestedIpAddress(addr)) => Some(*addr),
            _ => None,
        }
    }

    fn hostname(&self) -> Option<&str> {
        match self.opts().get(v4::OptionCode::Hostname) {
            Some(DhcpOption::Hostname(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    fn param_request_list(&self) -> Option<&Vec<v4::OptionCode>> {
        match self.opts().get(v4::OptionCode::ParameterRequestList) {
            Some(DhcpOption::ParameterRequestList(list)) => Some(list),
            _ => None,
        }
    }

    fn requested_lease_time(&self) -> Option<u32> {
        match self.opts().get(v4::OptionCode::AddressLeaseTime) {
            Some(DhcpOption::AddressLeaseTime(secs)) => Some(*secs),
            _ => None,
        }
    }
}

/// Reply skeleton: same transaction, flags, and client identity as the
/// request, opcode flipped to BootReply.
pub fn reply_skeleton(request: &v4::Message, yiaddr: Ipv4Addr, server_ip: Ipv4Addr) -> v4::Message {
    let mut reply = v4::Message::new_with_id(
        request.xid(),
        Ipv4Addr::UNSPECIFIED,
        yiaddr,
        server_ip,
        request.giaddr(),
        request.chaddr(),
    );
    reply.set_opcode(v4::Opcode::BootReply);
    reply.set_secs(0);
    reply.set_flags(request.flags());
    reply
}

pub fn build_reply(
    request: &v4::Message,
    msg_type: v4::MessageType,
    server_ip: Ipv4Addr,
    yiaddr: Ipv4Addr,
    lease_secs: u32,
    options: Vec<DhcpOption>,
) -> v4::Message {
    let mut reply = reply_skeleton(request, yiaddr, server_ip);
    let opts = reply.opts_mut();
    opts.insert(DhcpOption::MessageType(msg_type));
    opts.insert(DhcpOption::ServerIdentifier(server_ip));
    opts.insert(DhcpOption::AddressLeaseTime(lease_secs));
    for option in options {
        opts.insert(option);
    }
    opts.insert(DhcpOption::End);
    reply
}

/// RFC 2131 table 3: yiaddr in a NAK is zero, and a relayed NAK must set
/// the broadcast bit so the relay floods it.
pub fn build_nak(request: &v4::Message, server_ip: Ipv4Addr) -> v4::Message {
    let mut reply = reply_skeleton(request, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED);
    if request.giaddr() != Ipv4Addr::UNSPECIFIED {
        let flags = reply.flags();
        reply.set_flags(Flags::set_broadcast(flags));
    }
    let opts = reply.opts_mut();
    opts.insert(DhcpOption::MessageType(v4::MessageType::Nak));
    opts.insert(DhcpOption::ServerIdentifier(server_ip));
    opts.insert(DhcpOption::End);
    reply
}
