use std::net::Ipv4Addr;

use advmac::MacAddr6;
use dhcproto::v4::{self, DhcpOption};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::warn;

use crate::context::ServerContext;
use crate::overrides::{to_dhcp_option, OverrideKind};
use crate::scope::NetworkScope;

/// Shuffle an address list with the client MAC's last byte as the seed: a
/// given client always sees the same ordering while load spreads across
/// clients.
pub fn shuffle_addrs(addrs: &[Ipv4Addr], seed: u8) -> Vec<Ipv4Addr> {
    let mut shuffled = addrs.to_vec();
    let mut rng = StdRng::seed_from_u64(u64::from(seed));
    shuffled.shuffle(&mut rng);
    shuffled
}

fn option_code(option: &DhcpOption) -> v4::OptionCode {
    option.into()
}

/// Effective reply options: network defaults, then the network-level
/// override, then the MAC-level override, later layers winning per code.
/// Router and DNS lists are deterministically shuffled per client.
pub fn compose(ctx: &ServerContext, scope: &NetworkScope, mac: MacAddr6) -> Vec<DhcpOption> {
    let seed = mac.to_array()[5];
    let mut layered: Vec<DhcpOption> = Vec::new();

    layered.push(DhcpOption::SubnetMask(scope.defaults.subnet_mask));
    if !scope.defaults.routers.is_empty() {
        layered.push(DhcpOption::Router(shuffle_addrs(
            &scope.defaults.routers,
            seed,
        )));
    }
    if !scope.defaults.dns.is_empty() {
        layered.push(DhcpOption::DomainNameServer(shuffle_addrs(
            &scope.defaults.dns,
            seed,
        )));
    }
    if let Some(domain) = &scope.defaults.domain_name {
        layered.push(DhcpOption::DomainName(domain.clone()));
    }

    let network_key = scope.net.addr().to_string();
    if let Some(options) = ctx.overrides.options_for(OverrideKind::Network, &network_key) {
        for option in options.iter() {
            match to_dhcp_option(option) {
                Ok(converted) => upsert(&mut layered, converted, seed),
                Err(err) => {
                    warn!(%err, code = option.option_code, network = %network_key,
                        "skipping unconvertible network override");
                }
            }
        }
    }

    let mac_key = crate::codec::mac_str(mac);
    if let Some(options) = ctx.overrides.options_for(OverrideKind::Mac, &mac_key) {
        for option in options.iter() {
            match to_dhcp_option(option) {
                Ok(converted) => upsert(&mut layered, converted, seed),
                Err(err) => {
                    warn!(%err, code = option.option_code, mac = %mac_key,
                        "skipping unconvertible MAC override");
                }
            }
        }
    }

    layered
}

fn upsert(layered: &mut Vec<DhcpOption>, option: DhcpOption, seed: u8) {
    let option = match option {
        DhcpOption::Router(addrs) => DhcpOption::Router(shuffle_addrs(&addrs, seed)),
        DhcpOption::DomainNameServer(addrs) => {
            DhcpOption::DomainNameServer(shuffle_addrs(&addrs, seed))
        }
        other => other,
    };
    let code = option_code(&option);
    match layered.iter_mut().find(|o| option_code(o) == code) {
        Some(existing) => *existing = option,
        None => layered.push(option),
    }
}

/// Honor the parameter request list when the client sent one: emit matching
/// options in the client's order, everything otherwise.
pub fn select_requested(
    options: Vec<DhcpOption>,
    requested: Option<&Vec<v4::OptionCode>>,
) -> Vec<DhcpOption> {
    match requested {
        None => options,
        Some(order) => {
            let mut picked = Vec::with_capacity(order.len());
            for code in order {
                if let Some(option) = options.iter().find(|o| option_code(o) == *code) {
                    picked.push(option.clone());
                }
            }
            picked
        }
    }
}
