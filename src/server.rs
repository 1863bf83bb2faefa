use std::net::Ipv4Addr;
use std::time::Duration;

use advmac::MacAddr6;
use dhcproto::v4;
use tracing::{debug, error, field, info, instrument, warn, Span};

use crate::codec::{build_nak, build_reply, mac_str, MessageExt};
use crate::context::{ServerContext, LEASE_GRACE};
use crate::dedup::transaction_key;
use crate::options;
use crate::pool::{PoolError, FREE_MAC};
use crate::scope::{NetworkScope, XidPhase};

/// How long a client gets to convert an OFFER into a REQUEST.
const OFFER_TTL: Duration = Duration::from_secs(5);
const XID_TTL: Duration = Duration::from_secs(5);

fn xid_key(xid: u32) -> String {
    format!("{xid:08x}")
}

/// Entry point for server-mode traffic on a selected network scope.
/// Returns the reply to dispatch, or nothing for a silent drop.
pub fn handle_message(
    ctx: &ServerContext,
    iface_name: &str,
    scope: &NetworkScope,
    msg: &v4::Message,
    msg_type: v4::MessageType,
) -> Option<v4::Message> {
    // servers act on BootRequest only
    match msg.opcode() {
        v4::Opcode::BootRequest => {}
        _ => return None,
    }
    let mac = msg.client_mac()?;

    match msg_type {
        v4::MessageType::Discover => handle_discover(ctx, iface_name, scope, msg, mac),
        v4::MessageType::Request | v4::MessageType::Inform => {
            handle_request(ctx, scope, msg, msg_type, mac)
        }
        v4::MessageType::Release | v4::MessageType::Decline => {
            handle_release_decline(ctx, scope, msg, msg_type, mac)
        }
        _ => Some(build_nak(msg, scope.server_ip)),
    }
}

/// Pick an address for the client and OFFER it.
///
/// <https://datatracker.ietf.org/doc/html/rfc2131#section-4.3.1>
#[instrument(skip(ctx, iface_name, scope, msg, mac),
fields(mac = field::Empty, xid = %msg.xid()))]
fn handle_discover(
    ctx: &ServerContext,
    iface_name: &str,
    scope: &NetworkScope,
    msg: &v4::Message,
    mac: MacAddr6,
) -> Option<v4::Message> {
    let key = mac_str(mac);
    Span::current().record("mac", field::display(&key));
    info!(hostname = msg.hostname().unwrap_or(""), "DHCPDISCOVER");

    if !ctx
        .in_progress
        .begin(&transaction_key(mac, v4::MessageType::Discover, msg.xid()))
    {
        debug!("not answering, transaction already in progress");
        return None;
    }

    // statically bound clients always get their address, nothing else
    if let Some(&slot) = scope.statics.get(&mac) {
        scope.leases.set(&key, slot, OFFER_TTL);
        scope
            .xids
            .set(&xid_key(msg.xid()), XidPhase::OfferSent, XID_TTL);
        return Some(build_offer(ctx, scope, msg, mac, slot));
    }

    let mut candidate: Option<usize> = None;

    // a recent assignment for this MAC is reused when the pool agrees
    if let Some(slot) = scope.leases.get(&key) {
        debug!("client already has a cached assignment");
        match scope.pool.get_mac(slot) {
            Ok(owner) if owner == mac => {
                if scope.leases.replace(&key, slot, OFFER_TTL).is_err() {
                    return None;
                }
                scope
                    .xids
                    .set(&xid_key(msg.xid()), XidPhase::OfferSent, XID_TTL);
                return Some(build_offer(ctx, scope, msg, mac, slot));
            }
            Ok(owner) if owner == FREE_MAC => {
                scope.leases.delete(&key);
                if scope.pool.reserve(slot, mac).is_ok() {
                    candidate = Some(slot);
                }
            }
            _ => {
                // the slot moved on to someone else
                scope.leases.delete(&key);
            }
        }
    }

    let mut first_try = true;
    let slot = loop {
        if candidate.is_none() {
            if scope.pool.free_remaining() == 0 {
                info!("pool exhausted, not answering");
                return None;
            }

            // honor option 50 on the first pass
            if first_try {
                if let Some(requested) = msg.requested_ip() {
                    first_try = false;
                    if let Some(index) = scope.slot_of(requested) {
                        match scope.pool.get_mac(index) {
                            Ok(owner) if owner == mac => {
                                debug!(%requested, "requested address already reserved to client");
                                candidate = Some(index);
                            }
                            Ok(owner) if owner == FREE_MAC => {
                                if scope.pool.reserve(index, mac).is_ok() {
                                    debug!(%requested, "requested address is available");
                                    candidate = Some(index);
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            if candidate.is_none() {
                match scope.pool.next_free(mac) {
                    Ok(index) => candidate = Some(index),
                    Err(PoolError::Exhausted) => {
                        error!("unable to get a free address, pool is full");
                        return None;
                    }
                    Err(err) => {
                        error!(%err, "pool refused allocation");
                        return None;
                    }
                }
            }
        }

        let slot = candidate.take()?;
        scope.leases.set(&key, slot, OFFER_TTL);
        scope
            .xids
            .set(&xid_key(msg.xid()), XidPhase::PendingOffer, XID_TTL);

        let addr = scope.addr_of(slot);
        if scope.probe_enabled && ctx.prober.in_use(addr, mac, iface_name, scope.layer2) {
            info!(%addr, "address already in use on the wire, trying the next one");
            scope.leases.delete(&key);
            scope.quarantine(slot, &ctx.scheduler);
            first_try = false;
            continue;
        }

        // client has five seconds to come back with a REQUEST
        scope.leases.set(&key, slot, OFFER_TTL);
        let _ = scope
            .xids
            .replace(&xid_key(msg.xid()), XidPhase::OfferSent, XID_TTL);
        break slot;
    };

    Some(build_offer(ctx, scope, msg, mac, slot))
}

fn build_offer(
    ctx: &ServerContext,
    scope: &NetworkScope,
    msg: &v4::Message,
    mac: MacAddr6,
    slot: usize,
) -> v4::Message {
    let addr = scope.addr_of(slot);
    info!(ip = %addr, "DHCPOFFER");
    let composed = options::compose(ctx, scope, mac);
    let composed = options::select_requested(composed, msg.param_request_list());
    build_reply(
        msg,
        v4::MessageType::Offer,
        scope.server_ip,
        addr,
        lease_secs(scope, msg),
        composed,
    )
}

fn lease_secs(scope: &NetworkScope, msg: &v4::Message) -> u32 {
    let granted = match msg.requested_lease_time() {
        Some(requested) => Duration::from_secs(u64::from(requested)).min(scope.max_lease_duration),
        None => scope.lease_duration,
    };
    granted.as_secs().min(u64::from(u32::MAX)) as u32
}

/// Commit or refuse a client's REQUEST; INFORM follows the same path.
///
/// <https://datatracker.ietf.org/doc/html/rfc2131#section-4.3.2>
#[instrument(skip(ctx, scope, msg, msg_type, mac),
fields(mac = field::Empty, xid = %msg.xid()))]
fn handle_request(
    ctx: &ServerContext,
    scope: &NetworkScope,
    msg: &v4::Message,
    msg_type: v4::MessageType,
    mac: MacAddr6,
) -> Option<v4::Message> {
    let key = mac_str(mac);
    Span::current().record("mac", field::display(&key));

    let requested = msg.requested_ip().unwrap_or_else(|| msg.ciaddr());
    info!(?msg_type, ip = %requested, hostname = msg.hostname().unwrap_or(""), "request");

    // another server won the transaction
    if let Some(server_id) = msg.server_id() {
        if server_id != scope.server_ip {
            debug!(%server_id, "not replying, this server did not perform the offer");
            return None;
        }
    }

    if requested == Ipv4Addr::UNSPECIFIED {
        return Some(build_nak(msg, scope.server_ip));
    }
    let Some(index) = scope.slot_of(requested) else {
        return Some(build_nak(msg, scope.server_ip));
    };

    let Some(cached) = scope.leases.get(&key) else {
        debug!("not replying, no offer on record for this client");
        return None;
    };

    if cached != index {
        info!(offered = %scope.addr_of(cached), requested = %requested,
            "client asked for an address that was not offered");
        if scope.xids.get(&xid_key(msg.xid())) == Some(XidPhase::OfferSent) {
            scope.leases.delete(&key);
        }
        return None;
    }

    if !ctx
        .request_seen
        .begin(&transaction_key(mac, msg_type, msg.xid()))
    {
        debug!("not answering REQUEST, already processed");
        return None;
    }

    // compound verify-and-commit across the pool and the caches
    let committed = {
        let _guard = ctx.txn_lock.lock();
        match scope.pool.get_mac(index) {
            Ok(owner) if owner == mac => {
                let ttl = scope.lease_duration + LEASE_GRACE;
                scope.leases.set(&key, index, ttl);
                let _ = scope.pool.reserve(index, mac);
                true
            }
            _ => false,
        }
    };

    if !committed {
        info!(ip = %requested, "DHCPNAK");
        return Some(build_nak(msg, scope.server_ip));
    }

    let ttl = scope.lease_duration + LEASE_GRACE;
    ctx.directory.record(&key, &requested.to_string(), ttl);

    info!(ip = %requested, "DHCPACK");
    let composed = options::compose(ctx, scope, mac);
    let composed = options::select_requested(composed, msg.param_request_list());
    Some(build_reply(
        msg,
        v4::MessageType::Ack,
        scope.server_ip,
        requested,
        lease_secs(scope, msg),
        composed,
    ))
}

/// A client giving an address back (RELEASE) or refusing it (DECLINE).
/// Either way the slot sits out the conflict backoff before re-use; a
/// decline additionally means the address may be squatted on the wire.
#[instrument(skip(ctx, scope, msg, msg_type, mac),
fields(mac = field::Empty, xid = %msg.xid()))]
fn handle_release_decline(
    ctx: &ServerContext,
    scope: &NetworkScope,
    msg: &v4::Message,
    msg_type: v4::MessageType,
    mac: MacAddr6,
) -> Option<v4::Message> {
    let key = mac_str(mac);
    Span::current().record("mac", field::display(&key));

    let requested = msg.requested_ip().unwrap_or_else(|| msg.ciaddr());
    info!(?msg_type, ip = %requested, "release or decline");

    let Some(index) = scope.slot_of(requested) else {
        return None;
    };
    let Some(cached) = scope.leases.get(&key) else {
        return None;
    };
    if cached != index {
        debug!("cached assignment does not match the released address");
        return None;
    }
    match scope.pool.get_mac(index) {
        Ok(owner) if owner == mac => {
            info!(ip = %requested, "temporarily declaring address unusable");
            scope.quarantine(index, &ctx.scheduler);
            scope.leases.delete(&key);
        }
        Ok(_) | Err(_) => {
            warn!(ip = %requested, "pool does not show this client on the released slot");
        }
    }
    None
}
