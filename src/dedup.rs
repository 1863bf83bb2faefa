use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use advmac::MacAddr6;
use compact_str::{format_compact, CompactString};
use dashmap::DashMap;
use dhcproto::v4;

use crate::cache::Clock;

/// Key identifying one client transaction: `MAC|msgType|xid`.
pub fn transaction_key(mac: MacAddr6, msg_type: v4::MessageType, xid: u32) -> CompactString {
    format_compact!("{}|{:?}|{:08x}", crate::codec::mac_str(mac), msg_type, xid)
}

/// Short-TTL guard that admits the first caller for a key and turns away
/// everyone else until the entry ages out. Broadcast DHCP lands on every
/// socket bound to the wildcard address, so the same packet reaches several
/// workers; only one may process it.
pub struct DedupCache {
    seen: DashMap<CompactString, Instant>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl DedupCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Atomic insert-if-absent. Returns false when the key is already live.
    pub fn begin(&self, key: &str) -> bool {
        let now = self.clock.now();
        match self.seen.entry(CompactString::from(key)) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if *occupied.get() <= now {
                    occupied.insert(now + self.ttl);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(now + self.ttl);
                true
            }
        }
    }

    /// Drop aged-out keys so the map stays small.
    pub fn sweep(&self) {
        let now = self.clock.now();
        self.seen.retain(|_, expires_at| *expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Narrow critical section around compound read-modify-write sequences that
/// touch both a per-network cache and the pool. Must never be held across
/// probing, sending, or any other I/O.
pub struct TransactionLock {
    inner: Mutex<()>,
}

pub struct TransactionGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl TransactionLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    pub fn lock(&self) -> TransactionGuard<'_> {
        TransactionGuard {
            _guard: self.inner.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

impl Default for TransactionLock {
    fn default() -> Self {
        Self::new()
    }
}
