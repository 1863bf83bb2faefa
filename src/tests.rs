#![cfg(test)]

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use advmac::MacAddr6;
use dhcproto::v4::{self, DhcpOption, Opcode};

use crate::cache::ManualClock;
use crate::codec::{mac_str, MessageExt};
use crate::config::NetworkConf;
use crate::context::ServerContext;
use crate::interface::{Answer, Interface, InterfaceKind};
use crate::overrides::{OverrideKind, OverrideOption, OverrideStore};
use crate::pool::{Algorithm, EVICTED_MAC, FREE_MAC};
use crate::probe::LivenessProbe;
use crate::rawlink::NoopLink;
use crate::sched::Scheduler;
use crate::scope::NetworkScope;
use crate::server::handle_message;

const CLIENT_1: MacAddr6 = MacAddr6::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
const CLIENT_2: MacAddr6 = MacAddr6::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);
const STATIC_MAC: MacAddr6 = MacAddr6::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

const SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
const POOL_START: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const POOL_END: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

/// Probe answering "in use" for a scripted set of addresses.
struct ScriptedProbe {
    busy: Mutex<HashSet<Ipv4Addr>>,
}

impl ScriptedProbe {
    fn new(busy: &[Ipv4Addr]) -> Self {
        Self {
            busy: Mutex::new(busy.iter().copied().collect()),
        }
    }
}

impl LivenessProbe for ScriptedProbe {
    fn in_use(&self, ip: Ipv4Addr, _client: MacAddr6, _iface: &str, _layer2: bool) -> bool {
        self.busy.lock().unwrap().contains(&ip)
    }
}

struct TestEnv {
    ctx: ServerContext,
    scope: NetworkScope,
    clock: Arc<ManualClock>,
    scheduler: Arc<Scheduler>,
}

fn base_conf() -> NetworkConf {
    NetworkConf {
        network: Ipv4Addr::new(192, 168, 1, 0),
        enabled: true,
        start: POOL_START,
        end: POOL_END,
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        gateway: vec![SERVER_IP],
        dns: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
        domain_name: Some("lan.example.org".to_string()),
        default_lease: Duration::from_secs(3600),
        max_lease: Duration::from_secs(86400),
        reserved: vec![],
        assigned: vec![],
        next_hop: None,
        algorithm: Algorithm::FirstFit,
        evict_delay: Duration::from_secs(30),
        conflict_delay: Duration::from_secs(600),
        probe: false,
    }
}

fn env_with(conf: NetworkConf, prober: Arc<dyn LivenessProbe>) -> TestEnv {
    let clock = Arc::new(ManualClock::new());
    let scheduler = Scheduler::new(clock.clone());
    let overrides = Arc::new(OverrideStore::open_in_memory().unwrap());
    let ctx = ServerContext::new(
        clock.clone(),
        scheduler.clone(),
        overrides,
        prober,
        Arc::new(NoopLink),
    );
    let scope = NetworkScope::from_conf(&conf, SERVER_IP, clock.clone(), scheduler.clone());
    TestEnv {
        ctx,
        scope,
        clock,
        scheduler,
    }
}

fn test_env() -> TestEnv {
    env_with(base_conf(), Arc::new(crate::probe::NoProbe))
}

fn create_discover(mac: MacAddr6, xid: u32) -> v4::Message {
    let mut msg = v4::Message::new_with_id(
        xid,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        &mac.to_array(),
    );
    msg.set_opcode(Opcode::BootRequest);
    msg.opts_mut()
        .insert(DhcpOption::MessageType(v4::MessageType::Discover));
    msg
}

fn create_discover_with_requested(mac: MacAddr6, xid: u32, requested: Ipv4Addr) -> v4::Message {
    let mut msg = create_discover(mac, xid);
    msg.opts_mut()
        .insert(DhcpOption::RequestedIpAddress(requested));
    msg
}

fn create_request(
    mac: MacAddr6,
    xid: u32,
    requested: Ipv4Addr,
    server_id: Option<Ipv4Addr>,
) -> v4::Message {
    let mut msg = v4::Message::new_with_id(
        xid,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        &mac.to_array(),
    );
    msg.set_opcode(Opcode::BootRequest);
    let opts = msg.opts_mut();
    opts.insert(DhcpOption::MessageType(v4::MessageType::Request));
    opts.insert(DhcpOption::RequestedIpAddress(requested));
    if let Some(server_id) = server_id {
        opts.insert(DhcpOption::ServerIdentifier(server_id));
    }
    msg
}

fn create_release(mac: MacAddr6, xid: u32, addr: Ipv4Addr, decline: bool) -> v4::Message {
    let mut msg = v4::Message::new_with_id(
        xid,
        addr,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        &mac.to_array(),
    );
    msg.set_opcode(Opcode::BootRequest);
    let msg_type = if decline {
        v4::MessageType::Decline
    } else {
        v4::MessageType::Release
    };
    msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
    msg
}

fn serve(env: &TestEnv, msg: &v4::Message) -> Option<v4::Message> {
    let msg_type = match msg.opts().get(v4::OptionCode::MessageType) {
        Some(DhcpOption::MessageType(t)) => *t,
        _ => panic!("test message lacks a message type"),
    };
    handle_message(&env.ctx, "eth0", &env.scope, msg, msg_type)
}

fn reply_type(reply: &v4::Message) -> v4::MessageType {
    match reply.opts().get(v4::OptionCode::MessageType) {
        Some(DhcpOption::MessageType(t)) => *t,
        _ => panic!("reply lacks a message type"),
    }
}

fn lease_time(reply: &v4::Message) -> u32 {
    match reply.opts().get(v4::OptionCode::AddressLeaseTime) {
        Some(DhcpOption::AddressLeaseTime(secs)) => *secs,
        _ => panic!("reply lacks a lease time"),
    }
}

// ============================================================================
// DISCOVER / REQUEST happy path
// ============================================================================

#[test]
fn discover_then_request_acks_first_address() {
    let env = test_env();

    let offer = serve(&env, &create_discover(CLIENT_1, 0x1234)).expect("expected an OFFER");
    assert_eq!(reply_type(&offer), v4::MessageType::Offer);
    assert_eq!(offer.yiaddr(), POOL_START);
    assert_eq!(offer.opcode(), Opcode::BootReply);
    assert_eq!(lease_time(&offer), 3600);
    assert_eq!(offer.server_id(), Some(SERVER_IP));

    let ack = serve(
        &env,
        &create_request(CLIENT_1, 0x1234, POOL_START, Some(SERVER_IP)),
    )
    .expect("expected an ACK");
    assert_eq!(reply_type(&ack), v4::MessageType::Ack);
    assert_eq!(ack.yiaddr(), POOL_START);
    assert_eq!(lease_time(&ack), 3600);

    // the directory answers for the committed binding
    let (mac, _ends_at) = env.ctx.directory.mac_for("192.168.1.10").unwrap();
    assert_eq!(mac, "aa:bb:cc:dd:ee:01");
    let (ip, _) = env.ctx.directory.ip_for("aa:bb:cc:dd:ee:01").unwrap();
    assert_eq!(ip, "192.168.1.10");

    // pool and cache agree on the holder
    assert_eq!(env.scope.pool.get_mac(0).unwrap(), CLIENT_1);
    assert_eq!(env.scope.leases.get(&mac_str(CLIENT_1)), Some(0));
}

#[test]
fn offer_reuses_cached_assignment_for_repeat_discover() {
    let env = test_env();

    let first = serve(&env, &create_discover(CLIENT_1, 0x1111)).unwrap();
    let second = serve(&env, &create_discover(CLIENT_1, 0x2222)).unwrap();
    assert_eq!(first.yiaddr(), second.yiaddr());
    assert_eq!(env.scope.pool.free_remaining(), env.scope.size - 1);
}

#[test]
fn distinct_clients_get_distinct_addresses() {
    let env = test_env();

    let a = serve(&env, &create_discover(CLIENT_1, 1)).unwrap();
    let b = serve(&env, &create_discover(CLIENT_2, 2)).unwrap();
    assert_ne!(a.yiaddr(), b.yiaddr());
}

// ============================================================================
// Duplicate suppression
// ============================================================================

#[test]
fn duplicate_discover_produces_one_offer() {
    let env = test_env();
    let msg = create_discover(CLIENT_1, 0x1234);

    assert!(serve(&env, &msg).is_some());
    // same broadcast delivered again within the dedup window
    assert!(serve(&env, &msg).is_none());

    // after the window, the transaction may run again
    env.clock.advance(Duration::from_secs(2));
    assert!(serve(&env, &msg).is_some());
}

#[test]
fn duplicate_request_is_not_re_acked() {
    let env = test_env();

    serve(&env, &create_discover(CLIENT_1, 0x77)).unwrap();
    let request = create_request(CLIENT_1, 0x77, POOL_START, Some(SERVER_IP));
    assert!(serve(&env, &request).is_some());
    assert!(serve(&env, &request).is_none());
}

// ============================================================================
// Probe conflicts
// ============================================================================

#[test]
fn probed_address_is_quarantined_and_next_offered() {
    let mut conf = base_conf();
    conf.probe = true;
    let env = env_with(conf, Arc::new(ScriptedProbe::new(&[POOL_START])));

    let offer = serve(&env, &create_discover(CLIENT_1, 0x1234)).expect("expected an OFFER");
    assert_eq!(offer.yiaddr(), Ipv4Addr::new(192, 168, 1, 11));

    // slot 0 sits out the conflict backoff
    assert_eq!(env.scope.pool.get_mac(0).unwrap(), EVICTED_MAC);
    env.clock.advance(Duration::from_secs(599));
    env.scheduler.run_due();
    assert_eq!(env.scope.pool.get_mac(0).unwrap(), EVICTED_MAC);
    env.clock.advance(Duration::from_secs(2));
    env.scheduler.run_due();
    assert_eq!(env.scope.pool.get_mac(0).unwrap(), FREE_MAC);
}

// ============================================================================
// Requested address (option 50)
// ============================================================================

#[test]
fn requested_free_address_is_honored() {
    let env = test_env();
    let wanted = Ipv4Addr::new(192, 168, 1, 15);

    let offer = serve(&env, &create_discover_with_requested(CLIENT_1, 0x55, wanted)).unwrap();
    assert_eq!(offer.yiaddr(), wanted);
}

#[test]
fn requested_taken_address_falls_back_to_next_free() {
    let env = test_env();
    let wanted = Ipv4Addr::new(192, 168, 1, 15);
    env.scope.pool.reserve(5, CLIENT_2).unwrap();

    let offer = serve(&env, &create_discover_with_requested(CLIENT_1, 0x56, wanted)).unwrap();
    assert_ne!(offer.yiaddr(), wanted);
}

#[test]
fn requested_address_outside_pool_falls_back() {
    let env = test_env();

    let offer = serve(
        &env,
        &create_discover_with_requested(CLIENT_1, 0x57, Ipv4Addr::new(10, 0, 0, 5)),
    )
    .unwrap();
    assert_eq!(offer.yiaddr(), POOL_START);
}

// ============================================================================
// REQUEST edge cases
// ============================================================================

#[test]
fn request_for_other_servers_offer_is_dropped() {
    let env = test_env();

    serve(&env, &create_discover(CLIENT_1, 0x99)).unwrap();
    let request = create_request(CLIENT_1, 0x99, POOL_START, Some(Ipv4Addr::new(10, 0, 0, 1)));
    assert!(serve(&env, &request).is_none());
    // and the assignment survives for the real transaction
    assert_eq!(env.scope.leases.get(&mac_str(CLIENT_1)), Some(0));
}

#[test]
fn request_without_prior_offer_is_dropped() {
    let env = test_env();
    let request = create_request(CLIENT_1, 0x42, POOL_START, Some(SERVER_IP));
    assert!(serve(&env, &request).is_none());
}

#[test]
fn request_for_unoffered_address_clears_sent_offer() {
    let env = test_env();

    serve(&env, &create_discover(CLIENT_1, 0x31)).unwrap();
    // client asks for a different in-pool address on the same transaction
    let request = create_request(
        CLIENT_1,
        0x31,
        Ipv4Addr::new(192, 168, 1, 18),
        Some(SERVER_IP),
    );
    assert!(serve(&env, &request).is_none());
    assert_eq!(env.scope.leases.get(&mac_str(CLIENT_1)), None);
}

#[test]
fn request_outside_pool_is_nakked() {
    let env = test_env();

    serve(&env, &create_discover(CLIENT_1, 0x32)).unwrap();
    let request = create_request(CLIENT_1, 0x32, Ipv4Addr::new(10, 9, 9, 9), Some(SERVER_IP));
    let reply = serve(&env, &request).expect("expected a NAK");
    assert_eq!(reply_type(&reply), v4::MessageType::Nak);
    assert_eq!(reply.yiaddr(), Ipv4Addr::UNSPECIFIED);
}

#[test]
fn request_for_slot_lost_to_another_client_is_nakked() {
    let env = test_env();

    serve(&env, &create_discover(CLIENT_1, 0x33)).unwrap();
    // the slot changes hands behind the client's back
    env.scope.pool.free(0).unwrap();
    env.scope.pool.reserve(0, CLIENT_2).unwrap();

    let request = create_request(CLIENT_1, 0x33, POOL_START, Some(SERVER_IP));
    let reply = serve(&env, &request).expect("expected a NAK");
    assert_eq!(reply_type(&reply), v4::MessageType::Nak);
}

#[test]
fn stray_boot_request_types_are_nakked() {
    let env = test_env();

    // a confused peer sending OFFER as a BootRequest clears codec
    // validation but matches no handler
    let mut msg = create_discover(CLIENT_1, 0x35);
    msg.opts_mut()
        .insert(DhcpOption::MessageType(v4::MessageType::Offer));

    let reply = serve(&env, &msg).expect("expected a NAK");
    assert_eq!(reply_type(&reply), v4::MessageType::Nak);
    assert_eq!(reply.yiaddr(), Ipv4Addr::UNSPECIFIED);
}

// ============================================================================
// RELEASE / DECLINE
// ============================================================================

#[test]
fn decline_quarantines_the_address() {
    let env = test_env();

    serve(&env, &create_discover(CLIENT_1, 0x61)).unwrap();
    serve(
        &env,
        &create_request(CLIENT_1, 0x61, POOL_START, Some(SERVER_IP)),
    )
    .unwrap();

    assert!(serve(&env, &create_release(CLIENT_1, 0x62, POOL_START, true)).is_none());
    assert_eq!(env.scope.pool.get_mac(0).unwrap(), EVICTED_MAC);
    assert_eq!(env.scope.leases.get(&mac_str(CLIENT_1)), None);

    env.clock.advance(Duration::from_secs(601));
    env.scheduler.run_due();
    assert_eq!(env.scope.pool.get_mac(0).unwrap(), FREE_MAC);
}

#[test]
fn release_from_wrong_client_leaves_slot_alone() {
    let env = test_env();

    serve(&env, &create_discover(CLIENT_1, 0x63)).unwrap();
    serve(
        &env,
        &create_request(CLIENT_1, 0x63, POOL_START, Some(SERVER_IP)),
    )
    .unwrap();

    assert!(serve(&env, &create_release(CLIENT_2, 0x64, POOL_START, false)).is_none());
    assert_eq!(env.scope.pool.get_mac(0).unwrap(), CLIENT_1);
}

// ============================================================================
// Pool exhaustion
// ============================================================================

#[test]
fn exhausted_pool_means_silent_drop() {
    let mut conf = base_conf();
    conf.end = Ipv4Addr::new(192, 168, 1, 11); // two slots
    let env = env_with(conf, Arc::new(crate::probe::NoProbe));

    assert!(serve(&env, &create_discover(CLIENT_1, 1)).is_some());
    assert!(serve(&env, &create_discover(CLIENT_2, 2)).is_some());
    let third = MacAddr6::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x03]);
    assert!(serve(&env, &create_discover(third, 3)).is_none());
}

// ============================================================================
// Static bindings
// ============================================================================

#[test]
fn static_binding_always_offers_the_bound_address() {
    let mut conf = base_conf();
    let bound = Ipv4Addr::new(192, 168, 1, 14);
    conf.assigned = vec![(STATIC_MAC, bound)];
    let env = env_with(conf, Arc::new(crate::probe::NoProbe));

    let offer = serve(&env, &create_discover(STATIC_MAC, 0x71)).unwrap();
    assert_eq!(offer.yiaddr(), bound);

    let ack = serve(&env, &create_request(STATIC_MAC, 0x71, bound, Some(SERVER_IP))).unwrap();
    assert_eq!(reply_type(&ack), v4::MessageType::Ack);

    // nobody else is ever offered the bound address
    for i in 0..20u8 {
        let other = MacAddr6::new([0x02, 0, 0, 0, 0, i]);
        if let Some(offer) = serve(&env, &create_discover(other, 0x1000 + u32::from(i))) {
            assert_ne!(offer.yiaddr(), bound);
        }
    }
}

#[test]
fn static_slot_survives_admin_style_eviction() {
    let mut conf = base_conf();
    let bound = Ipv4Addr::new(192, 168, 1, 14);
    conf.assigned = vec![(STATIC_MAC, bound)];
    let env = env_with(conf, Arc::new(crate::probe::NoProbe));

    serve(&env, &create_discover(STATIC_MAC, 0x72)).unwrap();
    env.clock.advance(Duration::from_secs(6));
    env.scope.leases.sweep();
    env.clock.advance(Duration::from_secs(120));
    env.scheduler.run_due();
    assert_eq!(env.scope.pool.get_mac(4).unwrap(), STATIC_MAC);
}

// ============================================================================
// Lease lifecycle
// ============================================================================

#[test]
fn expired_lease_returns_to_pool_after_grace() {
    let env = test_env();

    serve(&env, &create_discover(CLIENT_1, 0x81)).unwrap();
    serve(
        &env,
        &create_request(CLIENT_1, 0x81, POOL_START, Some(SERVER_IP)),
    )
    .unwrap();

    // lease 3600s + 15s grace expires, sweeper fires the delayed return
    env.clock.advance(Duration::from_secs(3616));
    env.scope.leases.sweep();
    assert_eq!(env.scope.pool.get_mac(0).unwrap(), CLIENT_1);

    env.clock.advance(Duration::from_secs(31));
    env.scheduler.run_due();
    assert_eq!(env.scope.pool.get_mac(0).unwrap(), FREE_MAC);
}

#[test]
fn cache_and_pool_stay_consistent() {
    let env = test_env();

    for (i, xid) in [(1u8, 0x91u32), (2, 0x92), (3, 0x93)] {
        let mac = MacAddr6::new([0x02, 0, 0, 0, 0, i]);
        serve(&env, &create_discover(mac, xid)).unwrap();
    }

    for (key, slot, _) in env.scope.leases.items() {
        let owner = env.scope.pool.get_mac(slot).unwrap();
        assert!(
            mac_str(owner) == key || owner == EVICTED_MAC,
            "cache entry {key} points at slot {slot} owned by {owner}"
        );
    }
}

// ============================================================================
// Interface routing and option overrides
// ============================================================================

#[test]
fn interface_routes_discover_to_server_machinery() {
    let env = test_env();
    let conf = base_conf();
    let scope = Arc::new(NetworkScope::from_conf(
        &conf,
        SERVER_IP,
        env.clock.clone(),
        env.scheduler.clone(),
    ));
    let iface = Interface::new("eth0", SERVER_IP, InterfaceKind::Server, vec![scope]);

    let msg = create_discover(CLIENT_1, 0xa1);
    let answer = iface.serve(&env.ctx, &msg, v4::MessageType::Discover);
    match answer {
        Some(Answer::Reply { message, src_ip }) => {
            assert_eq!(reply_type(&message), v4::MessageType::Offer);
            assert_eq!(src_ip, SERVER_IP);
        }
        _ => panic!("expected a server reply"),
    }
}

#[test]
fn mac_override_beats_network_override_beats_defaults() {
    let env = test_env();

    env.ctx
        .overrides
        .save(
            OverrideKind::Network,
            "192.168.1.0",
            &[OverrideOption {
                option_code: 15,
                option_value: "net.example.org".to_string(),
                option_type: "string".to_string(),
            }],
        )
        .unwrap();

    let offer = serve(&env, &create_discover(CLIENT_1, 0xb1)).unwrap();
    assert!(matches!(
        offer.opts().get(v4::OptionCode::DomainName),
        Some(DhcpOption::DomainName(d)) if d == "net.example.org"
    ));

    env.ctx
        .overrides
        .save(
            OverrideKind::Mac,
            &mac_str(CLIENT_1),
            &[OverrideOption {
                option_code: 15,
                option_value: "mac.example.org".to_string(),
                option_type: "string".to_string(),
            }],
        )
        .unwrap();

    env.clock.advance(Duration::from_secs(2));
    let offer = serve(&env, &create_discover(CLIENT_1, 0xb2)).unwrap();
    assert!(matches!(
        offer.opts().get(v4::OptionCode::DomainName),
        Some(DhcpOption::DomainName(d)) if d == "mac.example.org"
    ));
}

#[test]
fn dns_ordering_is_stable_per_client() {
    let env = test_env();

    let offer_a = serve(&env, &create_discover(CLIENT_1, 0xc1)).unwrap();
    env.clock.advance(Duration::from_secs(2));
    let offer_b = serve(&env, &create_discover(CLIENT_1, 0xc2)).unwrap();

    let dns = |offer: &v4::Message| match offer.opts().get(v4::OptionCode::DomainNameServer) {
        Some(DhcpOption::DomainNameServer(list)) => list.clone(),
        _ => panic!("offer lacks DNS"),
    };
    assert_eq!(dns(&offer_a), dns(&offer_b));
}
