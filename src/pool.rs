use std::sync::Mutex;

use advmac::MacAddr6;
use thiserror::Error;

/// Holder of a slot nobody owns.
pub const FREE_MAC: MacAddr6 = MacAddr6::new([0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
/// Holder of a slot temporarily withdrawn from circulation (declined by a
/// client or answering probes on the wire).
pub const EVICTED_MAC: MacAddr6 = MacAddr6::new([0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("slot {index} out of range for pool of {size}")]
    OutOfRange { index: usize, size: usize },

    #[error("slot {index} already held by {holder}")]
    Held { index: usize, holder: MacAddr6 },

    #[error("no free addresses remain in the pool")]
    Exhausted,
}

/// Slot selection strategy for `next_free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Scan forward from a cursor so addresses wear evenly.
    #[default]
    RoundRobin,
    /// Always hand out the lowest free slot.
    FirstFit,
}

impl Algorithm {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "round-robin" => Some(Algorithm::RoundRobin),
            "first-fit" => Some(Algorithm::FirstFit),
            _ => None,
        }
    }
}

struct Slots {
    slots: Vec<MacAddr6>,
    free: usize,
    cursor: usize,
}

/// Fixed-size pool of address slots. Slot `i` maps to the address
/// `range_start + i`; the holder is the all-zero MAC when free. All
/// operations take the internal lock briefly and never block on I/O.
pub struct DhcpPool {
    inner: Mutex<Slots>,
    algorithm: Algorithm,
}

impl DhcpPool {
    pub fn new(size: usize, algorithm: Algorithm) -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: vec![FREE_MAC; size],
                free: size,
                cursor: 0,
            }),
            algorithm,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn size(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn free_remaining(&self) -> usize {
        self.lock().free
    }

    pub fn reserved_slots(&self) -> usize {
        let inner = self.lock();
        inner.slots.len() - inner.free
    }

    pub fn get_mac(&self, index: usize) -> Result<MacAddr6, PoolError> {
        let inner = self.lock();
        inner
            .slots
            .get(index)
            .copied()
            .ok_or(PoolError::OutOfRange {
                index,
                size: inner.slots.len(),
            })
    }

    /// Claim a specific slot for `mac`. Re-reserving a slot the same MAC
    /// already holds succeeds; anyone else's slot reports the holder.
    pub fn reserve(&self, index: usize, mac: MacAddr6) -> Result<(), PoolError> {
        let mut inner = self.lock();
        let size = inner.slots.len();
        let slot = inner
            .slots
            .get_mut(index)
            .ok_or(PoolError::OutOfRange { index, size })?;
        if *slot == mac {
            return Ok(());
        }
        if *slot != FREE_MAC {
            return Err(PoolError::Held {
                index,
                holder: *slot,
            });
        }
        *slot = mac;
        inner.free -= 1;
        Ok(())
    }

    /// Withdraw a slot from circulation regardless of its current holder.
    pub fn evict(&self, index: usize) -> Result<(), PoolError> {
        let mut inner = self.lock();
        let size = inner.slots.len();
        if index >= size {
            return Err(PoolError::OutOfRange { index, size });
        }
        if inner.slots[index] == FREE_MAC {
            inner.free -= 1;
        }
        inner.slots[index] = EVICTED_MAC;
        Ok(())
    }

    /// Return a slot to the pool. Freeing an already-free slot is a no-op.
    pub fn free(&self, index: usize) -> Result<(), PoolError> {
        let mut inner = self.lock();
        let size = inner.slots.len();
        let slot = inner
            .slots
            .get_mut(index)
            .ok_or(PoolError::OutOfRange { index, size })?;
        if *slot != FREE_MAC {
            *slot = FREE_MAC;
            inner.free += 1;
        }
        Ok(())
    }

    /// Find a free slot, claim it for `mac`, and return its index.
    pub fn next_free(&self, mac: MacAddr6) -> Result<usize, PoolError> {
        let mut inner = self.lock();
        if inner.free == 0 {
            return Err(PoolError::Exhausted);
        }
        let len = inner.slots.len();
        let start = match self.algorithm {
            Algorithm::RoundRobin => inner.cursor,
            Algorithm::FirstFit => 0,
        };
        for offset in 0..len {
            let index = (start + offset) % len;
            if inner.slots[index] == FREE_MAC {
                inner.slots[index] = mac;
                inner.free -= 1;
                if self.algorithm == Algorithm::RoundRobin {
                    inner.cursor = (index + 1) % len;
                }
                return Ok(index);
            }
        }
        // free count said otherwise; treat as exhausted rather than spin
        Err(PoolError::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC_A: MacAddr6 = MacAddr6::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x01]);
    const MAC_B: MacAddr6 = MacAddr6::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x02]);

    fn assert_invariant(pool: &DhcpPool) {
        assert_eq!(pool.free_remaining() + pool.reserved_slots(), pool.size());
    }

    #[test]
    fn reserve_and_free() {
        let pool = DhcpPool::new(4, Algorithm::RoundRobin);
        assert_eq!(pool.free_remaining(), 4);

        pool.reserve(2, MAC_A).unwrap();
        assert_eq!(pool.get_mac(2).unwrap(), MAC_A);
        assert_eq!(pool.free_remaining(), 3);
        assert_invariant(&pool);

        // same MAC may re-reserve, another may not
        pool.reserve(2, MAC_A).unwrap();
        assert_eq!(
            pool.reserve(2, MAC_B),
            Err(PoolError::Held {
                index: 2,
                holder: MAC_A
            })
        );

        pool.free(2).unwrap();
        assert_eq!(pool.get_mac(2).unwrap(), FREE_MAC);
        assert_eq!(pool.free_remaining(), 4);
        // idempotent on a free slot
        pool.free(2).unwrap();
        assert_eq!(pool.free_remaining(), 4);
        assert_invariant(&pool);
    }

    #[test]
    fn round_robin_rotates() {
        let pool = DhcpPool::new(3, Algorithm::RoundRobin);
        assert_eq!(pool.next_free(MAC_A).unwrap(), 0);
        assert_eq!(pool.next_free(MAC_A).unwrap(), 1);
        pool.free(0).unwrap();
        // cursor has moved past 0, so 2 is handed out before wrapping
        assert_eq!(pool.next_free(MAC_B).unwrap(), 2);
        assert_eq!(pool.next_free(MAC_B).unwrap(), 0);
        assert_eq!(pool.next_free(MAC_B), Err(PoolError::Exhausted));
        assert_invariant(&pool);
    }

    #[test]
    fn first_fit_reuses_lowest() {
        let pool = DhcpPool::new(3, Algorithm::FirstFit);
        assert_eq!(pool.next_free(MAC_A).unwrap(), 0);
        assert_eq!(pool.next_free(MAC_A).unwrap(), 1);
        pool.free(0).unwrap();
        assert_eq!(pool.next_free(MAC_B).unwrap(), 0);
    }

    #[test]
    fn evict_overrides_holder() {
        let pool = DhcpPool::new(2, Algorithm::RoundRobin);
        pool.reserve(0, MAC_A).unwrap();
        pool.evict(0).unwrap();
        assert_eq!(pool.get_mac(0).unwrap(), EVICTED_MAC);
        assert_eq!(pool.free_remaining(), 1);

        // evicting a free slot removes it from circulation too
        pool.evict(1).unwrap();
        assert_eq!(pool.free_remaining(), 0);
        assert_eq!(pool.next_free(MAC_B), Err(PoolError::Exhausted));
        assert_invariant(&pool);
    }

    #[test]
    fn out_of_range_is_reported() {
        let pool = DhcpPool::new(2, Algorithm::RoundRobin);
        assert_eq!(
            pool.get_mac(5),
            Err(PoolError::OutOfRange { index: 5, size: 2 })
        );
        assert!(pool.reserve(5, MAC_A).is_err());
        assert!(pool.free(5).is_err());
    }
}
