use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use advmac::MacAddr6;
use ipnet::Ipv4Net;
use tracing::{info, warn};

use crate::cache::{Clock, TimedCache};
use crate::codec::mac_str;
use crate::config::NetworkConf;
use crate::pool::DhcpPool;
use crate::sched::Scheduler;

/// Where a transaction stands in the xid cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidPhase {
    PendingOffer,
    OfferSent,
}

/// Default reply options sourced from the network's configuration section.
#[derive(Debug, Clone)]
pub struct ScopeDefaults {
    pub subnet_mask: Ipv4Addr,
    pub routers: Vec<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
}

/// One served network: the address pool, the per-MAC lease cache, the xid
/// cache, and everything the state machine needs to answer for it. Owned
/// by the interface it is attached to; handlers borrow it per packet.
pub struct NetworkScope {
    pub net: Ipv4Net,
    pub server_ip: Ipv4Addr,
    pub start: Ipv4Addr,
    pub size: usize,
    pub layer2: bool,
    pub next_hop: Option<Ipv4Addr>,
    pub probe_enabled: bool,
    pub lease_duration: Duration,
    pub max_lease_duration: Duration,
    pub evict_delay: Duration,
    pub conflict_delay: Duration,
    pub pool: Arc<DhcpPool>,
    pub leases: Arc<TimedCache<usize>>,
    pub xids: Arc<TimedCache<XidPhase>>,
    pub statics: HashMap<MacAddr6, usize>,
    pub static_slots: HashSet<usize>,
    pub reserved_count: usize,
    pub defaults: ScopeDefaults,
}

impl NetworkScope {
    /// Build a scope from its configuration section. Static bindings become
    /// permanent reservations, excluded addresses become sentinel slots, and
    /// the lease cache's eviction hook schedules the delayed slot return.
    pub fn from_conf(
        conf: &NetworkConf,
        server_ip: Ipv4Addr,
        clock: Arc<dyn Clock>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let size = ip_range(conf.start, conf.end);
        let pool = Arc::new(DhcpPool::new(size, conf.algorithm));
        let net = Ipv4Net::with_netmask(conf.network, conf.netmask)
            .unwrap_or_else(|_| Ipv4Net::new(conf.network, 24).expect("/24 is a valid prefix"));

        let mut reserved_count = 0;
        for addr in &conf.reserved {
            if let Some(index) = slot_of(conf.start, size, *addr) {
                if pool.evict(index).is_ok() {
                    reserved_count += 1;
                }
            } else {
                warn!(%addr, network = %net, "excluded address outside the pool range");
            }
        }

        let mut statics = HashMap::new();
        let mut static_slots = HashSet::new();
        for (mac, addr) in &conf.assigned {
            match slot_of(conf.start, size, *addr) {
                Some(index) => match pool.reserve(index, *mac) {
                    Ok(()) => {
                        statics.insert(*mac, index);
                        static_slots.insert(index);
                    }
                    Err(err) => {
                        warn!(%err, mac = %mac_str(*mac), %addr, "static binding conflicts, skipped")
                    }
                },
                None => {
                    warn!(mac = %mac_str(*mac), %addr, network = %net,
                        "static binding outside the pool range, skipped")
                }
            }
        }

        let leases = {
            let pool = Arc::clone(&pool);
            let scheduler = Arc::clone(&scheduler);
            let static_slots = static_slots.clone();
            let start = conf.start;
            let delay = conf.evict_delay;
            Arc::new(TimedCache::with_eviction(
                Arc::clone(&clock),
                move |mac: &str, slot: &usize| {
                    if static_slots.contains(slot) {
                        return;
                    }
                    let pool = Arc::clone(&pool);
                    let slot = *slot;
                    let addr = addr_at(start, slot);
                    let mac = mac.to_string();
                    scheduler.schedule_in(delay, move || {
                        info!(%addr, %mac, "returning expired lease to the pool");
                        let _ = pool.free(slot);
                    });
                },
            ))
        };

        let xids = Arc::new(TimedCache::new(clock));

        Self {
            net,
            server_ip,
            start: conf.start,
            size,
            layer2: conf.next_hop.is_none(),
            next_hop: conf.next_hop,
            probe_enabled: conf.probe,
            lease_duration: conf.default_lease,
            max_lease_duration: conf.max_lease,
            evict_delay: conf.evict_delay,
            conflict_delay: conf.conflict_delay,
            pool,
            leases,
            xids,
            statics,
            static_slots,
            reserved_count,
            defaults: ScopeDefaults {
                subnet_mask: conf.netmask,
                routers: conf.gateway.clone(),
                dns: conf.dns.clone(),
                domain_name: conf.domain_name.clone(),
            },
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.net.contains(&addr)
    }

    pub fn addr_of(&self, slot: usize) -> Ipv4Addr {
        addr_at(self.start, slot)
    }

    pub fn slot_of(&self, addr: Ipv4Addr) -> Option<usize> {
        slot_of(self.start, self.size, addr)
    }

    /// Withdraw a slot after a DECLINE or a probe conflict and schedule its
    /// return once the backoff elapses.
    pub fn quarantine(&self, slot: usize, scheduler: &Scheduler) {
        let addr = self.addr_of(slot);
        if self.static_slots.contains(&slot) {
            warn!(%addr, "refusing to quarantine a statically bound address");
            return;
        }
        let _ = self.pool.evict(slot);
        let pool = Arc::clone(&self.pool);
        scheduler.schedule_in(self.conflict_delay, move || {
            info!(%addr, "releasing previously unusable address back into the pool");
            let _ = pool.free(slot);
        });
    }

    /// Lease-cache entries on dynamically allocated slots.
    pub fn leased_count(&self) -> usize {
        self.leases
            .items()
            .iter()
            .filter(|(_, slot, _)| !self.static_slots.contains(slot))
            .count()
    }

    pub fn permanently_reserved(&self) -> usize {
        self.reserved_count + self.static_slots.len()
    }
}

/// Number of addresses in `start..=end`, zero when reversed.
pub fn ip_range(start: Ipv4Addr, end: Ipv4Addr) -> usize {
    let start = u32::from(start);
    let end = u32::from(end);
    if end < start {
        0
    } else {
        (end - start + 1) as usize
    }
}

fn addr_at(start: Ipv4Addr, slot: usize) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(start).wrapping_add(slot as u32))
}

fn slot_of(start: Ipv4Addr, size: usize, addr: Ipv4Addr) -> Option<usize> {
    let offset = u32::from(addr).checked_sub(u32::from(start))? as usize;
    (offset < size).then_some(offset)
}
