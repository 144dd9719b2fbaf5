//! In-memory object cache keyed by the request hash.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::HeaderBag;

/// Every this many inserts, entries past their stale window are dropped.
pub const SWEEP_EVERY: u64 = 256;

/// Source of "now" for freshness decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderBag,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct CacheEntry {
    pub key: String,
    pub response: CachedResponse,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub stale_until: DateTime<Utc>,
    hits: AtomicU64,
}

impl CacheEntry {
    /// `ttl`, `grace` and `swr` are whole seconds; negatives count as zero.
    pub fn new(
        key: impl Into<String>,
        response: CachedResponse,
        created_at: DateTime<Utc>,
        ttl: i64,
        grace: i64,
        swr: i64,
    ) -> Self {
        let expires_at = created_at + Duration::seconds(ttl.max(0));
        let stale_until = expires_at + Duration::seconds(grace.max(0) + swr.max(0));
        Self {
            key: key.into(),
            response,
            created_at,
            expires_at,
            stale_until,
            hits: AtomicU64::new(0),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Counts one more hit and returns the new total.
    pub fn record_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whole seconds since the entry was stored.
    pub fn age(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_servable(&self, now: DateTime<Utc>) -> bool {
        now < self.stale_until
    }
}

#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(Arc<CacheEntry>),
    Stale(Arc<CacheEntry>),
    Miss,
}

/// Entries are replaced whole, so a reader sees either the old or the new
/// entry and never a mix.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    inserts: AtomicU64,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `entry`, replacing any entry under the same key. Keys that are
    /// never looked up again are dropped by a periodic sweep.
    pub fn insert(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        let mut entries = self.entries.write();
        entries.insert(entry.key.clone(), Arc::clone(&entry));
        if (self.inserts.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            let now = entry.created_at;
            entries.retain(|_, cached| cached.is_servable(now));
        }
        entry
    }

    /// Drops every entry that can no longer be served at `now` and returns
    /// how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, cached| cached.is_servable(now));
        before - entries.len()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.read().get(key).cloned()
    }

    /// Classifies `key` at `now`. Entries past their stale window are
    /// evicted and reported as a miss.
    pub fn lookup(&self, key: &str, now: DateTime<Utc>) -> Lookup {
        let entry = match self.get(key) {
            Some(entry) => entry,
            None => return Lookup::Miss,
        };
        if entry.is_fresh(now) {
            Lookup::Fresh(entry)
        } else if entry.is_servable(now) {
            Lookup::Stale(entry)
        } else {
            self.remove_if_same(&entry);
            Lookup::Miss
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Removes `entry` only if it has not been replaced since it was read.
    pub fn remove_if_same(&self, entry: &Arc<CacheEntry>) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&entry.key) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(&entry.key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
