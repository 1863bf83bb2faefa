use std::net::Ipv4Addr;

use dhcproto::v4;
use tracing::info;

use crate::codec::mac_str;
use crate::codec::MessageExt;

/// Where a rewritten relay packet must go next.
pub enum RelayAction {
    /// Forward a client message to the configured upstream server.
    ToUpstream(v4::Message),
    /// Deliver a server reply toward the client; `dst_ip` is the address the
    /// frame is addressed to (the offered address, or broadcast for a NAK).
    ToClient { message: v4::Message, dst_ip: Ipv4Addr },
    Drop,
}

fn copy_options(from: &v4::Message, to: &mut v4::Message) {
    for (_, option) in from.opts().iter() {
        to.opts_mut().insert(option.clone());
    }
}

/// Client-to-server rewrite: fresh BootRequest carrying the client's
/// identity and transaction with our address as the gateway.
fn toward_upstream(iface_ip: Ipv4Addr, msg: &v4::Message) -> v4::Message {
    let mut out = v4::Message::new_with_id(
        msg.xid(),
        msg.ciaddr(),
        Ipv4Addr::UNSPECIFIED,
        msg.siaddr(),
        iface_ip,
        msg.chaddr(),
    );
    out.set_opcode(v4::Opcode::BootRequest);
    out.set_fname(msg.fname().unwrap_or(&[]));
    copy_options(msg, &mut out);
    out
}

/// Server-to-client rewrite: fresh BootReply preserving everything the
/// client needs to recognize the transaction.
fn toward_client(msg: &v4::Message) -> v4::Message {
    let mut out = v4::Message::new_with_id(
        msg.xid(),
        Ipv4Addr::UNSPECIFIED,
        msg.yiaddr(),
        msg.siaddr(),
        msg.giaddr(),
        msg.chaddr(),
    );
    out.set_opcode(v4::Opcode::BootReply);
    out.set_flags(msg.flags());
    out.set_secs(msg.secs());
    out.set_fname(msg.fname().unwrap_or(&[]));
    copy_options(msg, &mut out);
    out
}

/// Relay-mode state machine. No allocation happens here: client messages
/// are rewritten and pushed upstream, server replies are rewritten and
/// pushed back toward the client.
pub fn relay_message(
    iface_ip: Ipv4Addr,
    msg: &v4::Message,
    msg_type: v4::MessageType,
) -> RelayAction {
    let mac = msg
        .client_mac()
        .map(mac_str)
        .unwrap_or_else(|| "??".into());

    match msg_type {
        v4::MessageType::Discover
        | v4::MessageType::Request
        | v4::MessageType::Release
        | v4::MessageType::Decline => {
            info!(?msg_type, %mac, "relaying client message upstream");
            RelayAction::ToUpstream(toward_upstream(iface_ip, msg))
        }
        v4::MessageType::Offer | v4::MessageType::Ack => {
            info!(?msg_type, %mac, ip = %msg.yiaddr(),
                server = %msg.server_id().unwrap_or(Ipv4Addr::UNSPECIFIED),
                "relaying server reply to client");
            RelayAction::ToClient {
                message: toward_client(msg),
                dst_ip: msg.yiaddr(),
            }
        }
        v4::MessageType::Nak => {
            info!(%mac, "relaying DHCPNAK to client");
            RelayAction::ToClient {
                message: toward_client(msg),
                dst_ip: Ipv4Addr::BROADCAST,
            }
        }
        _ => RelayAction::Drop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use advmac::MacAddr6;
    use dhcproto::v4::{DhcpOption, Opcode};

    const CLIENT: MacAddr6 = MacAddr6::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
    const IFACE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn client_msg(msg_type: v4::MessageType) -> v4::Message {
        let mut msg = v4::Message::new_with_id(
            0x4242,
            Ipv4Addr::new(192, 168, 1, 30),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &CLIENT.to_array(),
        );
        msg.set_opcode(Opcode::BootRequest);
        msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
        msg.opts_mut()
            .insert(DhcpOption::Hostname("printer".into()));
        msg
    }

    fn server_msg(msg_type: v4::MessageType) -> v4::Message {
        let mut msg = v4::Message::new_with_id(
            0x4242,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(192, 168, 1, 31),
            Ipv4Addr::new(192, 168, 1, 1),
            IFACE_IP,
            &CLIENT.to_array(),
        );
        msg.set_opcode(Opcode::BootReply);
        msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
        msg.opts_mut()
            .insert(DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 168, 1, 1)));
        msg
    }

    #[test]
    fn discover_goes_upstream_with_giaddr_set() {
        let action = relay_message(IFACE_IP, &client_msg(v4::MessageType::Discover), v4::MessageType::Discover);
        let out = match action {
            RelayAction::ToUpstream(out) => out,
            _ => panic!("expected upstream forward"),
        };
        assert_eq!(out.opcode(), Opcode::BootRequest);
        assert_eq!(out.giaddr(), IFACE_IP);
        assert_eq!(out.xid(), 0x4242);
        assert_eq!(out.chaddr(), &CLIENT.to_array());
        // options survive the rewrite
        assert!(matches!(
            out.opts().get(v4::OptionCode::Hostname),
            Some(DhcpOption::Hostname(h)) if h == "printer"
        ));
    }

    #[test]
    fn offer_goes_back_to_client() {
        let action = relay_message(IFACE_IP, &server_msg(v4::MessageType::Offer), v4::MessageType::Offer);
        let (out, dst) = match action {
            RelayAction::ToClient { message, dst_ip } => (message, dst_ip),
            _ => panic!("expected client forward"),
        };
        assert_eq!(out.opcode(), Opcode::BootReply);
        assert_eq!(out.yiaddr(), Ipv4Addr::new(192, 168, 1, 31));
        assert_eq!(out.giaddr(), IFACE_IP);
        assert_eq!(dst, Ipv4Addr::new(192, 168, 1, 31));
    }

    #[test]
    fn nak_broadcasts_to_client() {
        let action = relay_message(IFACE_IP, &server_msg(v4::MessageType::Nak), v4::MessageType::Nak);
        match action {
            RelayAction::ToClient { dst_ip, .. } => assert_eq!(dst_ip, Ipv4Addr::BROADCAST),
            _ => panic!("expected client forward"),
        }
    }

    #[test]
    fn unexpected_types_are_dropped() {
        let action = relay_message(IFACE_IP, &client_msg(v4::MessageType::Inform), v4::MessageType::Inform);
        assert!(matches!(action, RelayAction::Drop));
    }
}
