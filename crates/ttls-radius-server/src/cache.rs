//! TTL cache for per-exchange protocol state
//!
//! Session state, pending fragments, TLS tunnels and the other per-token
//! structures each live in their own `TtlCache`. Entries expire lazily on
//! access and are also swept by a background task when a Tokio runtime is
//! available. Expiry runs on `tokio::time::Instant`, so paused-clock tests
//! can drive it deterministically.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as Slot;
use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::debug;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

pub struct TtlCache<K, V> {
    entries: Arc<DashMap<K, Entry<V>>>,
    ttl: Duration,
    sweeping: Arc<AtomicBool>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a cache whose entries live for `ttl` after their last write.
    ///
    /// When called inside a Tokio runtime a sweep task runs every quarter
    /// TTL (bounded to 1s..=5min); otherwise expiry is purely lazy.
    pub fn new(ttl: Duration) -> Self {
        let cache = Self::without_sweeper(ttl);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            cache.sweeping.store(true, Ordering::Relaxed);
            let entries = Arc::clone(&cache.entries);
            let running = Arc::clone(&cache.sweeping);
            let period = (ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(300));

            handle.spawn(async move {
                let mut interval = time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

                while running.load(Ordering::Relaxed) {
                    interval.tick().await;
                    let removed = purge(&entries, Instant::now());
                    if removed > 0 {
                        debug!(removed, remaining = entries.len(), "TTL cache sweep completed");
                    }
                }
            });
        }
        cache
    }

    /// Creates a cache that only expires entries when they are accessed.
    pub fn without_sweeper(ttl: Duration) -> Self {
        TtlCache {
            entries: Arc::new(DashMap::new()),
            ttl,
            sweeping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let now = Instant::now();
        let live = {
            let entry = self.entries.get(key)?;
            (!entry.is_expired(now)).then(|| entry.value.clone())
        };
        if live.is_none() {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        live
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.ttl);
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Stores `value` only if `admit` accepts the current live value (or
    /// its absence). The check and the write happen under the same shard
    /// lock. Returns whether the value was stored.
    pub fn set_if(&self, key: K, value: V, admit: impl FnOnce(Option<&V>) -> bool) -> bool {
        let now = Instant::now();
        let expires_at = now + self.ttl;
        match self.entries.entry(key) {
            Slot::Occupied(mut occupied) => {
                let current = occupied.get();
                let current = (!current.is_expired(now)).then_some(&current.value);
                if !admit(current) {
                    return false;
                }
                occupied.insert(Entry { value, expires_at });
                true
            }
            Slot::Vacant(vacant) => {
                if !admit(None) {
                    return false;
                }
                vacant.insert(Entry { value, expires_at });
                true
            }
        }
    }

    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key).is_some()
    }

    /// Removes the entry only if `matches` accepts its value.
    pub fn delete_if<Q>(&self, key: &Q, matches: impl FnOnce(&V) -> bool) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove_if(key, |_, entry| matches(&entry.value)).is_some()
    }

    /// Removes and returns a live value.
    pub fn take<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let (_, entry) = self.entries.remove(key)?;
        (!entry.is_expired(now)).then_some(entry.value)
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Drops every entry expired at `now` and reports how many were removed.
fn purge<K: Eq + Hash, V>(entries: &DashMap<K, Entry<V>>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before.saturating_sub(entries.len())
}

impl<K, V> Drop for TtlCache<K, V> {
    fn drop(&mut self) {
        self.sweeping.store(false, Ordering::Relaxed);
    }
}

impl<K: Eq + Hash, V> fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
