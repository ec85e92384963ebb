//! Short-term store
//!
//! Capacity-bounded, concurrent cache of recently used records keyed by id.
//! Entries carry a dirty flag (bookkeeping not yet written to LTM) and a pin
//! count (held by in-flight reads). The store itself never talks to LTM:
//! `evict_if_needed` only drops entries that are durable and clean, and the
//! coordinator flushes the rest before removing them.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::StmConfig;
use crate::record::{MemoryId, MemoryRecord, MemoryStatus, Tier};

/// A cached record plus its cache bookkeeping
#[derive(Debug, Clone)]
pub struct StmEntry {
    pub record: MemoryRecord,
    /// STM copy has changes LTM has not seen
    pub dirty: bool,
    /// In-flight reads holding this entry
    pub pins: usize,
}

impl StmEntry {
    /// Must be written to LTM before it can leave STM
    pub fn needs_flush(&self) -> bool {
        self.dirty || !self.record.tier.is_durable()
    }
}

/// Entry chosen for eviction
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub id: MemoryId,
    pub priority: f64,
    pub needs_flush: bool,
}

/// Point-in-time counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StmStats {
    pub count: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub pinned: usize,
    pub dirty: usize,
    pub non_durable: usize,
}

pub struct ShortTermStore {
    config: StmConfig,
    entries: Arc<DashMap<MemoryId, StmEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ShortTermStore {
    pub fn new(config: StmConfig) -> Self {
        let capacity = config.capacity;
        Self {
            config,
            entries: Arc::new(DashMap::with_capacity(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether `id` can be inserted without exceeding capacity
    pub fn has_room_for(&self, id: &MemoryId) -> bool {
        self.contains(id) || self.len() < self.config.capacity
    }

    /// Insert or replace, keeping any existing pins
    pub fn put(&self, record: MemoryRecord, dirty: bool) {
        let id = record.id;
        match self.entries.get_mut(&id) {
            Some(mut entry) => {
                entry.record = record;
                entry.dirty = dirty;
            }
            None => {
                self.entries.insert(
                    id,
                    StmEntry {
                        record,
                        dirty,
                        pins: 0,
                    },
                );
            }
        }
    }

    /// Clone of the cached record, counted as a hit or miss
    pub fn get(&self, id: &MemoryId) -> Option<MemoryRecord> {
        match self.entries.get(id) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.record.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Clone of the cached record without touching statistics
    pub fn peek(&self, id: &MemoryId) -> Option<MemoryRecord> {
        self.entries.get(id).map(|e| e.record.clone())
    }

    /// Clone of the full entry
    pub fn entry(&self, id: &MemoryId) -> Option<StmEntry> {
        self.entries.get(id).map(|e| e.clone())
    }

    /// Bump last access without any other bookkeeping
    pub fn touch(&self, id: &MemoryId, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                if now > entry.record.temporal.last_accessed_at {
                    entry.record.temporal.last_accessed_at = now;
                }
                entry.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Mutate a cached record in place and mark it dirty
    pub fn update<R>(&self, id: &MemoryId, f: impl FnOnce(&mut MemoryRecord) -> R) -> Option<R> {
        self.entries.get_mut(id).map(|mut entry| {
            let out = f(&mut entry.record);
            entry.dirty = true;
            out
        })
    }

    /// Record that LTM now matches the cached copy
    pub fn mark_clean(&self, id: &MemoryId, tier: Tier) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.dirty = false;
            entry.record.tier = tier;
            if tier.is_durable() {
                entry.record.status = MemoryStatus::Active;
            }
        }
    }

    pub fn set_status(&self, id: &MemoryId, status: MemoryStatus) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.record.status = status;
        }
    }

    /// Remove regardless of pins; used by explicit deletes
    pub fn remove(&self, id: &MemoryId) -> Option<MemoryRecord> {
        self.entries.remove(id).map(|(_, e)| e.record)
    }

    /// Remove only if nobody holds a pin
    pub fn remove_unpinned(&self, id: &MemoryId) -> Option<MemoryRecord> {
        self.entries
            .remove_if(id, |_, e| e.pins == 0)
            .map(|(_, e)| e.record)
    }

    /// Remove only if unpinned and already written to LTM; counts as an eviction
    pub fn evict_clean(&self, id: &MemoryId) -> Option<MemoryRecord> {
        let removed = self
            .entries
            .remove_if(id, |_, e| e.pins == 0 && !e.needs_flush())
            .map(|(_, e)| e.record);
        if removed.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Protect an entry from eviction and forgetting while the guard lives
    pub fn pin(&self, id: &MemoryId) -> Option<PinGuard> {
        let mut entry = self.entries.get_mut(id)?;
        entry.pins += 1;
        Some(PinGuard {
            entries: self.entries.clone(),
            id: *id,
        })
    }

    /// Eviction priority: stale, unimportant entries score highest
    pub fn priority(&self, record: &MemoryRecord, now: DateTime<Utc>) -> f64 {
        let age_secs = (now - record.temporal.last_accessed_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let age_factor = 1.0 + age_secs / self.config.age_unit.as_secs_f64();
        age_factor / (1.0 + record.importance as f64)
    }

    /// Up to `limit` evictable entries, highest priority first
    ///
    /// Pinned and degraded entries are never candidates.
    pub fn eviction_candidates(&self, now: DateTime<Utc>, limit: usize) -> Vec<EvictionCandidate> {
        let mut scored: Vec<(EvictionCandidate, DateTime<Utc>)> = self
            .entries
            .iter()
            .filter(|e| e.pins == 0 && e.record.status != MemoryStatus::Degraded)
            .map(|e| {
                (
                    EvictionCandidate {
                        id: *e.key(),
                        priority: self.priority(&e.record, now),
                        needs_flush: e.needs_flush(),
                    },
                    e.record.temporal.last_accessed_at,
                )
            })
            .collect();

        scored.sort_by(|(a, a_seen), (b, b_seen)| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| a_seen.cmp(b_seen))
                .then_with(|| b.id.cmp(&a.id))
        });
        scored.truncate(limit);
        scored.into_iter().map(|(c, _)| c).collect()
    }

    /// Drop clean, durable entries until the store fits its capacity
    ///
    /// Entries that still need a flush are skipped; the caller decides how
    /// to persist them. Returns the evicted records.
    pub fn evict_if_needed(&self, now: DateTime<Utc>) -> Vec<MemoryRecord> {
        let over = self.len().saturating_sub(self.config.capacity);
        if over == 0 {
            return Vec::new();
        }

        let mut evicted = Vec::with_capacity(over);
        for candidate in self.eviction_candidates(now, self.len()) {
            if evicted.len() >= over {
                break;
            }
            if candidate.needs_flush {
                continue;
            }
            if let Some(record) = self.evict_clean(&candidate.id) {
                tracing::debug!(memory_id = %record.id, "evicted from short-term store");
                evicted.push(record);
            }
        }
        evicted
    }

    /// Records with ids strictly after `after`, in id order
    pub fn scan_batch(&self, after: Option<MemoryId>, limit: usize) -> Vec<MemoryRecord> {
        let mut ids: Vec<MemoryId> = self
            .entries
            .iter()
            .map(|e| *e.key())
            .filter(|id| after.map_or(true, |a| *id > a))
            .collect();
        ids.sort();
        ids.truncate(limit);
        ids.iter().filter_map(|id| self.peek(id)).collect()
    }

    /// Clones of every cached record
    pub fn snapshot(&self) -> Vec<MemoryRecord> {
        self.entries.iter().map(|e| e.record.clone()).collect()
    }

    /// Ids whose STM copy has not reached LTM
    pub fn flush_pending(&self) -> Vec<MemoryId> {
        self.entries
            .iter()
            .filter(|e| e.needs_flush())
            .map(|e| *e.key())
            .collect()
    }

    pub fn stats(&self) -> StmStats {
        let mut stats = StmStats {
            count: 0,
            capacity: self.config.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            ..Default::default()
        };
        for entry in self.entries.iter() {
            stats.count += 1;
            if entry.pins > 0 {
                stats.pinned += 1;
            }
            if entry.dirty {
                stats.dirty += 1;
            }
            if !entry.record.tier.is_durable() {
                stats.non_durable += 1;
            }
        }
        stats
    }
}

/// Releases a pin on drop
pub struct PinGuard {
    entries: Arc<DashMap<MemoryId, StmEntry>>,
    id: MemoryId,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entries.get_mut(&self.id) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }
}
