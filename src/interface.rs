use std::net::Ipv4Addr;
use std::sync::Arc;

use dhcproto::v4;
use tracing::debug;

use crate::context::ServerContext;
use crate::relay::{self, RelayAction};
use crate::scope::NetworkScope;
use crate::server;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    Server,
    Relay { upstream: Ipv4Addr },
}

/// A bound NIC with the networks it serves. Relay interfaces carry no
/// scopes; everything they see is rewritten and forwarded.
pub struct Interface {
    pub name: String,
    pub ipv4: Ipv4Addr,
    pub kind: InterfaceKind,
    pub scopes: Vec<Arc<NetworkScope>>,
}

/// A reply and how the dispatcher must deliver it.
pub enum Answer {
    /// Server-mode reply; `src_ip` is the serving address for raw L2 sends.
    Reply { message: v4::Message, src_ip: Ipv4Addr },
    RelayUpstream { message: v4::Message, upstream: Ipv4Addr },
    RelayClient { message: v4::Message, dst_ip: Ipv4Addr },
}

impl Interface {
    pub fn new(
        name: impl Into<String>,
        ipv4: Ipv4Addr,
        kind: InterfaceKind,
        scopes: Vec<Arc<NetworkScope>>,
    ) -> Self {
        Self {
            name: name.into(),
            ipv4,
            kind,
            scopes,
        }
    }

    pub fn is_relay(&self) -> bool {
        matches!(self.kind, InterfaceKind::Relay { .. })
    }

    /// Pick the network a packet belongs to, in priority order:
    /// an L2 request with no gateway, a renewal in place, then a relayed
    /// (L3) request. No match means the packet is not ours.
    pub fn select_scope(&self, giaddr: Ipv4Addr, ciaddr: Ipv4Addr) -> Option<&Arc<NetworkScope>> {
        for scope in &self.scopes {
            if scope.layer2 && (giaddr == Ipv4Addr::UNSPECIFIED || scope.contains(ciaddr)) {
                if ciaddr != Ipv4Addr::UNSPECIFIED && !scope.contains(ciaddr) {
                    continue;
                }
                return Some(scope);
            }
            if giaddr == Ipv4Addr::UNSPECIFIED && scope.contains(ciaddr) {
                return Some(scope);
            }
            if (giaddr != Ipv4Addr::UNSPECIFIED && scope.contains(giaddr)) || scope.contains(ciaddr)
            {
                return Some(scope);
            }
        }
        None
    }

    /// Route one validated packet through the relay or server machinery.
    pub fn serve(
        &self,
        ctx: &ServerContext,
        msg: &v4::Message,
        msg_type: v4::MessageType,
    ) -> Option<Answer> {
        if let InterfaceKind::Relay { upstream } = self.kind {
            return match relay::relay_message(self.ipv4, msg, msg_type) {
                RelayAction::ToUpstream(message) => Some(Answer::RelayUpstream { message, upstream }),
                RelayAction::ToClient { message, dst_ip } => {
                    Some(Answer::RelayClient { message, dst_ip })
                }
                RelayAction::Drop => None,
            };
        }

        let scope = match self.select_scope(msg.giaddr(), msg.ciaddr()) {
            Some(scope) => scope,
            None => {
                debug!(iface = %self.name, "no network matches this packet");
                return None;
            }
        };

        server::handle_message(ctx, &self.name, scope, msg, msg_type).map(|message| {
            Answer::Reply {
                message,
                src_ip: scope.server_ip,
            }
        })
    }
}
