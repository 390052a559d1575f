//! Near-Cache Consistency Layer.
//!
//! A client-side cache keyed like the grid itself. Each entry remembers the
//! topology version and the primary it was read from or written through.
//!
//! # Entry states
//!
//! ```text
//!            read-through / write-through
//!   Absent ────────────────────────────────▶ Valid
//!     ▲                                        │ owner no longer primary,
//!     │ next access (read-through repeats)     │ or no longer live
//!     └──────────────────────── Stale ◀────────┘
//! ```
//!
//! Before serving anything the cache replays every topology version it has not
//! processed yet, in order, marking entries stale as their owners change. A
//! value is served locally only if its entry is valid and the cache has caught
//! up with the current version; otherwise the read goes through the
//! [`TopologyGuard`] to the current primary.
//!
//! Writes always go through to the primary first. A write whose primary
//! vanished is reported as topology loss, never as success.
//!
//! Entries are inserted under the same lock that serializes refreshes. A
//! result validated at a version older than the cache's own is checked against
//! every version since before it is cached, so a refresh that ran while the
//! call was in flight cannot be skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::error::{ClusterError, ClusterResult};
use super::affinity::Assignment;
use super::metrics;
use super::topology::TopologySnapshot;
use super::topology_guard::TopologyGuard;
use crate::types::{NodeId, PartitionId, TopologyVersion};

/// Observable state of a cached key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Absent,
    Valid,
    Stale,
}

#[derive(Debug, Clone)]
struct NearEntry {
    value: Bytes,
    partition: PartitionId,
    version: TopologyVersion,
    owner: NodeId,
    stale: bool,
}

impl NearEntry {
    fn owned_under(&self, assignment: &Assignment, snapshot: &TopologySnapshot) -> bool {
        assignment.primary(self.partition) == Some(self.owner) && snapshot.contains(&self.owner)
    }
}

/// Client-side cache in front of partition primaries.
pub struct NearCache {
    guard: Arc<TopologyGuard>,
    entries: DashMap<Bytes, NearEntry>,
    /// Latest topology version whose effects were applied to `entries`.
    local_version: AtomicU64,
    refresh_lock: Mutex<()>,
    capacity: usize,
}

impl NearCache {
    pub fn new(guard: Arc<TopologyGuard>) -> Self {
        let capacity = guard.config().near_cache_capacity;
        let local_version = guard.engine().registry().version();
        Self {
            guard,
            entries: DashMap::new(),
            local_version: AtomicU64::new(local_version.value()),
            refresh_lock: Mutex::new(()),
            capacity,
        }
    }

    /// Latest topology version this cache has processed.
    pub fn local_version(&self) -> TopologyVersion {
        TopologyVersion(self.local_version.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read a key, serving it locally only when provably current.
    pub async fn get(&self, key: impl Into<Bytes>) -> ClusterResult<Option<Bytes>> {
        let key = key.into();
        self.refresh();

        let current = self.guard.engine().registry().version();
        let local = self.local_version();
        if let Some(entry) = self.entries.get(&key) {
            if !entry.stale && local == current {
                metrics::record_near_cache("get", "hit");
                return Ok(Some(entry.value.clone()));
            }
            let stale = ClusterError::StaleRead {
                partition: entry.partition,
                entry_version: entry.version,
                current,
            };
            debug!(error = %stale, "Forcing read-through");
        }
        self.remove_entry(&key);

        match self.guard.get(key.clone()).await {
            Ok(read) => {
                metrics::record_near_cache("get", "read_through");
                if let Some(value) = &read.value {
                    self.insert_entry(
                        key.clone(),
                        NearEntry {
                            value: value.clone(),
                            partition: self.guard.engine().partition(&key),
                            version: read.version,
                            owner: read.primary,
                            stale: false,
                        },
                    );
                }
                Ok(read.value)
            }
            Err(e) => {
                metrics::record_near_cache("get", e.as_metric_label());
                Err(e)
            }
        }
    }

    /// Write through to the primary, then cache the value.
    pub async fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> ClusterResult<()> {
        let key = key.into();
        let value = value.into();
        self.refresh();

        match self.guard.put(key.clone(), value.clone()).await {
            Ok(write) => {
                metrics::record_near_cache("put", "write_through");
                self.insert_entry(
                    key.clone(),
                    NearEntry {
                        value,
                        partition: self.guard.engine().partition(&key),
                        version: write.version,
                        owner: write.primary,
                        stale: false,
                    },
                );
                Ok(())
            }
            Err(e) => {
                // The outcome on the primary is unknown; drop the local copy.
                self.remove_entry(&key);
                metrics::record_near_cache("put", e.as_metric_label());
                Err(e)
            }
        }
    }

    /// Non-forwarding read: the cached value if its entry is valid.
    pub fn local_peek(&self, key: &[u8]) -> Option<Bytes> {
        self.refresh();
        let entry = self.entries.get(key)?;
        if entry.stale {
            metrics::record_near_cache("peek", "stale");
            None
        } else {
            metrics::record_near_cache("peek", "hit");
            Some(entry.value.clone())
        }
    }

    /// State of a key after applying every published version.
    pub fn state(&self, key: &[u8]) -> EntryState {
        self.refresh();
        match self.entries.get(key) {
            None => EntryState::Absent,
            Some(e) if e.stale => EntryState::Stale,
            Some(_) => EntryState::Valid,
        }
    }

    /// Drop a single key.
    pub fn invalidate(&self, key: &[u8]) {
        self.remove_entry(key);
    }

    pub fn clear(&self) {
        let removed = self.entries.len();
        self.entries.clear();
        metrics::add_near_cache_entries(-(removed as i64));
    }

    /// Apply every topology version published since the last refresh.
    fn refresh(&self) {
        let registry = self.guard.engine().registry();
        if self.local_version() == registry.version() {
            return;
        }

        let _lock = self
            .refresh_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let local = self.local_version();

        let snapshots = match registry.snapshots_since(local) {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(error = %e, local = %local, "Near cache fell behind topology history, dropping entries");
                self.clear();
                self.local_version
                    .store(registry.version().value(), Ordering::Release);
                return;
            }
        };

        for snapshot in snapshots {
            let assignment = self.guard.engine().assignment_for(&snapshot);
            let mut invalidated = 0usize;
            for mut entry in self.entries.iter_mut() {
                if entry.stale || entry.version >= snapshot.version() {
                    continue;
                }
                if !entry.owned_under(&assignment, &snapshot) {
                    entry.stale = true;
                    invalidated += 1;
                }
            }
            if invalidated > 0 {
                metrics::NEAR_CACHE_OPERATIONS
                    .with_label_values(&["refresh", "invalidated"])
                    .inc_by(invalidated as u64);
                debug!(
                    version = %snapshot.version(),
                    invalidated,
                    "Near cache entries invalidated by topology change"
                );
            }
            self.local_version
                .store(snapshot.version().value(), Ordering::Release);
        }
    }

    fn insert_entry(&self, key: Bytes, entry: NearEntry) {
        let _lock = self
            .refresh_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if entry.version < self.local_version() && !self.still_owned(&entry) {
            debug!(
                partition = %entry.partition,
                version = %entry.version,
                local = %self.local_version(),
                "Dropping result superseded by a processed topology change"
            );
            metrics::record_near_cache("insert", "superseded");
            return;
        }

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_stale();
            if self.entries.len() >= self.capacity {
                metrics::record_near_cache("insert", "full");
                return;
            }
        }
        if self.entries.insert(key, entry).is_none() {
            metrics::add_near_cache_entries(1);
        }
    }

    /// Whether the entry's owner stayed a live primary in every later version.
    fn still_owned(&self, entry: &NearEntry) -> bool {
        let engine = self.guard.engine();
        match engine.registry().snapshots_since(entry.version) {
            Ok(snapshots) => snapshots
                .iter()
                .all(|s| entry.owned_under(&engine.assignment_for(s), s)),
            Err(_) => false,
        }
    }

    fn remove_entry(&self, key: &[u8]) {
        if self.entries.remove(key).is_some() {
            metrics::add_near_cache_entries(-1);
        }
    }

    fn evict_stale(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.stale);
        metrics::add_near_cache_entries(-((before - self.entries.len()) as i64));
    }
}

impl Drop for NearCache {
    fn drop(&mut self) {
        metrics::add_near_cache_entries(-(self.entries.len() as i64));
    }
}

impl std::fmt::Debug for NearCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NearCache")
            .field("entries", &self.entries.len())
            .field("local_version", &self.local_version())
            .field("capacity", &self.capacity)
            .finish()
    }
}
