use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use compact_str::CompactString;
use dashmap::DashMap;
use thiserror::Error;
use tracing::trace;

/// Time source used by every expiring map and the work scheduler, so tests
/// can advance time without sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock whose time only moves when `advance` is called.
pub struct ManualClock {
    base: Instant,
    offset: std::sync::Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: std::sync::Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        self.base + *offset
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("no live entry for key `{0}`")]
    Missing(CompactString),
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

type EvictFn<V> = Box<dyn Fn(&str, &V) + Send + Sync>;

/// Expiring map keyed by string. Entries past their deadline are invisible
/// to readers and reaped by `sweep`, which fires the eviction hook once per
/// reaped entry. `delete` is silent: only time-based eviction notifies.
pub struct TimedCache<V> {
    entries: DashMap<CompactString, Entry<V>>,
    clock: Arc<dyn Clock>,
    on_evict: Option<EvictFn<V>>,
}

impl<V: Clone + Send + Sync + 'static> TimedCache<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            on_evict: None,
        }
    }

    pub fn with_eviction<F>(clock: Arc<dyn Clock>, hook: F) -> Self
    where
        F: Fn(&str, &V) + Send + Sync + 'static,
    {
        Self {
            entries: DashMap::new(),
            clock,
            on_evict: Some(Box::new(hook)),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_with_expiry(key).map(|(value, _)| value)
    }

    pub fn get_with_expiry(&self, key: &str) -> Option<(V, Instant)> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= self.clock.now() {
            return None;
        }
        Some((entry.value.clone(), entry.expires_at))
    }

    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        self.entries.insert(
            CompactString::from(key),
            Entry {
                value,
                expires_at: self.clock.now() + ttl,
            },
        );
    }

    /// Overwrite an existing live entry, refusing to resurrect absent or
    /// expired ones.
    pub fn replace(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError> {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.expires_at > now => {
                entry.value = value;
                entry.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(CacheError::Missing(CompactString::from(key))),
        }
    }

    pub fn delete(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Snapshot of live entries with their deadlines.
    pub fn items(&self) -> Vec<(CompactString, V, Instant)> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|entry| entry.expires_at > now)
            .map(|entry| (entry.key().clone(), entry.value.clone(), entry.expires_at))
            .collect()
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reap expired entries, firing the eviction hook for each.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<CompactString> = self
            .entries
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for key in expired {
            let removed = self
                .entries
                .remove_if(&key, |_, entry| entry.expires_at <= now);
            if let Some((key, entry)) = removed {
                reaped += 1;
                if let Some(hook) = &self.on_evict {
                    hook(&key, &entry.value);
                }
            }
        }
        if reaped > 0 {
            trace!(reaped, "swept expired cache entries");
        }
        reaped
    }
}

/// Run `sweep` on a fixed interval for the life of the process.
pub fn spawn_sweeper<V: Clone + Send + Sync + 'static>(
    name: &str,
    cache: Arc<TimedCache<V>>,
    interval: Duration,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(format!("sweep-{name}"))
        .spawn(move || loop {
            thread::sleep(interval);
            cache.sweep();
        })
        .expect("failed to spawn sweeper thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn entries_expire() {
        let clock = Arc::new(ManualClock::new());
        let cache: TimedCache<u32> = TimedCache::new(clock.clone());

        cache.set("a", 1, Duration::from_secs(5));
        assert_eq!(cache.get("a"), Some(1));

        clock.advance(Duration::from_secs(4));
        assert_eq!(cache.get("a"), Some(1));

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn replace_requires_live_entry() {
        let clock = Arc::new(ManualClock::new());
        let cache: TimedCache<u32> = TimedCache::new(clock.clone());

        assert!(cache.replace("a", 1, Duration::from_secs(5)).is_err());

        cache.set("a", 1, Duration::from_secs(5));
        assert!(cache.replace("a", 2, Duration::from_secs(5)).is_ok());
        assert_eq!(cache.get("a"), Some(2));

        clock.advance(Duration::from_secs(6));
        assert!(cache.replace("a", 3, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn sweep_fires_eviction_hook_once() {
        let clock = Arc::new(ManualClock::new());
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = evicted.clone();
        let cache: TimedCache<u32> = TimedCache::with_eviction(clock.clone(), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.set("a", 1, Duration::from_secs(1));
        cache.set("b", 2, Duration::from_secs(10));

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn delete_is_silent() {
        let clock = Arc::new(ManualClock::new());
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = evicted.clone();
        let cache: TimedCache<u32> = TimedCache::with_eviction(clock, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.set("a", 1, Duration::from_secs(5));
        assert_eq!(cache.delete("a"), Some(1));
        assert_eq!(evicted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn items_skips_expired() {
        let clock = Arc::new(ManualClock::new());
        let cache: TimedCache<u32> = TimedCache::new(clock.clone());

        cache.set("a", 1, Duration::from_secs(1));
        cache.set("b", 2, Duration::from_secs(10));
        clock.advance(Duration::from_secs(2));

        let items = cache.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, "b");
    }
}
