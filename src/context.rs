use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use dashmap::DashMap;

use crate::cache::{Clock, TimedCache};
use crate::dedup::{DedupCache, TransactionLock};
use crate::overrides::OverrideStore;
use crate::probe::LivenessProbe;
use crate::rawlink::L2Sender;
use crate::sched::Scheduler;

pub const IN_PROGRESS_TTL: Duration = Duration::from_secs(1);
pub const REQUEST_SEEN_TTL: Duration = Duration::from_secs(1);
/// Renew jitter absorbed past the nominal lease duration.
pub const LEASE_GRACE: Duration = Duration::from_secs(15);

/// Process-wide IP↔MAC lookup populated on ACK, consumed by the admin API.
/// Both directions share one TTL so the pair stays consistent.
pub struct Directory {
    ip_to_mac: TimedCache<CompactString>,
    mac_to_ip: TimedCache<CompactString>,
    clock: Arc<dyn Clock>,
}

impl Directory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            ip_to_mac: TimedCache::new(Arc::clone(&clock)),
            mac_to_ip: TimedCache::new(Arc::clone(&clock)),
            clock,
        }
    }

    pub fn record(&self, mac: &str, ip: &str, ttl: Duration) {
        self.ip_to_mac.set(ip, CompactString::from(mac), ttl);
        self.mac_to_ip.set(mac, CompactString::from(ip), ttl);
    }

    pub fn mac_for(&self, ip: &str) -> Option<(CompactString, DateTime<Utc>)> {
        let (mac, expires_at) = self.ip_to_mac.get_with_expiry(ip)?;
        Some((mac, self.to_wall(expires_at)))
    }

    pub fn ip_for(&self, mac: &str) -> Option<(CompactString, DateTime<Utc>)> {
        let (ip, expires_at) = self.mac_to_ip.get_with_expiry(mac)?;
        Some((ip, self.to_wall(expires_at)))
    }

    pub fn sweep(&self) {
        self.ip_to_mac.sweep();
        self.mac_to_ip.sweep();
    }

    fn to_wall(&self, deadline: Instant) -> DateTime<Utc> {
        let remaining = deadline.saturating_duration_since(self.clock.now());
        Utc::now() + chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::zero())
    }
}

/// Everything the packet handlers share across networks: the transaction
/// guards, the global directory, the override store, and the probing and
/// raw-send capabilities. Threaded explicitly so tests can assemble a
/// server with a synthetic clock and scripted collaborators.
pub struct ServerContext {
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<Scheduler>,
    pub in_progress: DedupCache,
    pub request_seen: DedupCache,
    pub txn_lock: TransactionLock,
    pub directory: Directory,
    pub overrides: Arc<OverrideStore>,
    pub prober: Arc<dyn LivenessProbe>,
    pub link: Arc<dyn L2Sender>,
    /// Socket replies are unicast from (bound to the server port); absent in
    /// tests that never dispatch.
    pub reply_socket: Option<Arc<UdpSocket>>,
    /// Per-relay-interface sockets used both to receive upstream replies and
    /// to forward client messages upstream.
    pub relay_sockets: DashMap<String, Arc<UdpSocket>>,
}

impl ServerContext {
    pub fn new(
        clock: Arc<dyn Clock>,
        scheduler: Arc<Scheduler>,
        overrides: Arc<OverrideStore>,
        prober: Arc<dyn LivenessProbe>,
        link: Arc<dyn L2Sender>,
    ) -> Self {
        Self {
            in_progress: DedupCache::new(Arc::clone(&clock), IN_PROGRESS_TTL),
            request_seen: DedupCache::new(Arc::clone(&clock), REQUEST_SEEN_TTL),
            txn_lock: TransactionLock::new(),
            directory: Directory::new(Arc::clone(&clock)),
            clock,
            scheduler,
            overrides,
            prober,
            link,
            reply_socket: None,
            relay_sockets: DashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;

    #[test]
    fn directory_is_consistent_both_ways() {
        let clock = Arc::new(ManualClock::new());
        let directory = Directory::new(clock.clone());

        directory.record("aa:bb:cc:dd:ee:01", "192.168.1.10", Duration::from_secs(60));

        let (mac, _) = directory.mac_for("192.168.1.10").unwrap();
        assert_eq!(mac, "aa:bb:cc:dd:ee:01");
        let (ip, _) = directory.ip_for("aa:bb:cc:dd:ee:01").unwrap();
        assert_eq!(ip, "192.168.1.10");

        clock.advance(Duration::from_secs(61));
        assert!(directory.mac_for("192.168.1.10").is_none());
        assert!(directory.ip_for("aa:bb:cc:dd:ee:01").is_none());
    }
}
