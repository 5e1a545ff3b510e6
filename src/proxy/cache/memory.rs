// In-process key/value store with absolute expiry and per-key eviction tasks

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: String,
    /// Absolute expiry in unix milliseconds, `None` = never expires
    pub expires_at: Option<i64>,
    generation: u64,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Map of entries plus one cancellable eviction task per expiring key.
///
/// Every write gets a fresh generation number; an eviction task only removes
/// the entry generation it was scheduled for, so a late timer can never drop a
/// newer value.
#[derive(Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, CacheEntry>>,
    timers: Arc<DashMap<String, (u64, JoinHandle<()>)>>,
    generation: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = now_millis();
        let stale_generation = match self.entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired_at(now) => return Some(entry.value.clone()),
            Some(entry) => entry.generation,
        };

        // Timer has not fired yet (or clock skew): drop the stale entry here
        self.evict_stale(key, stale_generation);
        None
    }

    /// Remove the entry and its timer only while both still belong to `generation`.
    /// A write that lands after the expiry check keeps its value and its timer.
    fn evict_stale(&self, key: &str, generation: u64) {
        if let Some((_, (_, handle))) = self
            .timers
            .remove_if(key, |_, (timer_generation, _)| *timer_generation == generation)
        {
            handle.abort();
        }
        self.entries
            .remove_if(key, |_, entry| entry.generation == generation);
    }

    /// Store `value`. With `expires_at_ms` in the past the key is removed instead.
    pub fn set(&self, key: &str, value: String, expires_at_ms: Option<i64>) {
        self.cancel_timer(key);

        if let Some(at) = expires_at_ms {
            if at <= now_millis() {
                self.entries.remove(key);
                return;
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: expires_at_ms,
                generation,
            },
        );

        if let Some(at) = expires_at_ms {
            self.schedule_eviction(key, at, generation);
        }
    }

    /// Returns the number of live entries removed (0 or 1).
    pub fn delete(&self, key: &str) -> u64 {
        self.cancel_timer(key);
        let now = now_millis();
        match self.entries.remove(key) {
            Some((_, entry)) if !entry.is_expired_at(now) => 1,
            _ => 0,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn schedule_eviction(&self, key: &str, expires_at_ms: i64, generation: u64) {
        let delay = (expires_at_ms - now_millis()).max(0) as u64;
        let entries = self.entries.clone();
        let timers = self.timers.clone();
        let owned_key = key.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            entries.remove_if(&owned_key, |_, entry| entry.generation == generation);
            timers.remove_if(&owned_key, |_, (timer_generation, _)| {
                *timer_generation == generation
            });
        });

        match self.timers.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().0 < generation {
                    let (_, previous) = occupied.insert((generation, handle));
                    previous.abort();
                } else {
                    // A newer write already owns the timer slot
                    handle.abort();
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert((generation, handle));
            }
        }
    }

    fn cancel_timer(&self, key: &str) {
        if let Some((_, (_, handle))) = self.timers.remove(key) {
            handle.abort();
        }
    }
}
