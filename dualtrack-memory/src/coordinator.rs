//! Consistency coordinator
//!
//! Sequences writes (STM, then vector and graph concurrently) and deletes
//! (LTM, then STM), flushes cached records before they leave STM, and owns
//! the repair queue that re-drives long-term writes which failed after the
//! record was already cached.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::MemoryConfig;
use crate::error::{Backend, MemoryError, Result};
use crate::locks::{LockStripes, ReadLeases};
use crate::ltm::LongTermStore;
use crate::record::{
    MemoryId, MemoryPatch, MemoryRecord, MemoryStatus, Relation, RelationKey, Tier,
};
use crate::stm::ShortTermStore;

/// Target used for operator-facing alert events
pub const ALERT_TARGET: &str = "dualtrack_memory::alert";

/// Which long-term writes a record still needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LtmParts {
    pub vector: bool,
    pub graph: bool,
}

impl LtmParts {
    pub const ALL: LtmParts = LtmParts {
        vector: true,
        graph: true,
    };
    pub const GRAPH: LtmParts = LtmParts {
        vector: false,
        graph: true,
    };

    fn union(self, other: LtmParts) -> LtmParts {
        LtmParts {
            vector: self.vector || other.vector,
            graph: self.graph || other.graph,
        }
    }
}

/// Per-backend result of one long-term write
#[derive(Debug, Default)]
pub struct PersistOutcome {
    pub vector: Option<MemoryError>,
    pub graph: Option<MemoryError>,
}

impl PersistOutcome {
    pub fn is_ok(&self) -> bool {
        self.vector.is_none() && self.graph.is_none()
    }

    /// Parts that still need writing
    pub fn failed_parts(&self) -> LtmParts {
        LtmParts {
            vector: self.vector.is_some(),
            graph: self.graph.is_some(),
        }
    }

    pub fn into_error(self) -> Option<MemoryError> {
        self.vector.or(self.graph)
    }
}

/// Acknowledgement returned for an accepted write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteAck {
    pub id: MemoryId,
    pub tier: Tier,
    /// Part of the long-term write failed and is being retried
    pub pending_repair: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[derive(Debug, Clone)]
struct RepairTask {
    missing: LtmParts,
    attempts: u32,
    due: Instant,
}

/// Repair queue counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairStats {
    pub pending: usize,
    pub degraded: u64,
    pub repaired: u64,
}

#[derive(Default)]
struct RepairQueue {
    tasks: Mutex<HashMap<MemoryId, RepairTask>>,
    degraded: AtomicU64,
    repaired: AtomicU64,
}

pub struct Coordinator {
    pub(crate) config: Arc<MemoryConfig>,
    pub(crate) stm: Arc<ShortTermStore>,
    pub(crate) ltm: LongTermStore,
    pub(crate) locks: Arc<LockStripes>,
    pub(crate) reads: Arc<ReadLeases>,
    repairs: RepairQueue,
}

impl Coordinator {
    pub fn new(config: Arc<MemoryConfig>, ltm: LongTermStore) -> Self {
        let stm = Arc::new(ShortTermStore::new(config.stm.clone()));
        let locks = Arc::new(LockStripes::new(config.lock_stripes));
        Self {
            config,
            stm,
            ltm,
            locks,
            reads: Arc::new(ReadLeases::new()),
            repairs: RepairQueue::default(),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn stm(&self) -> &ShortTermStore {
        &self.stm
    }

    pub fn ltm(&self) -> &LongTermStore {
        &self.ltm
    }

    /// Write the requested parts to LTM, vector and graph concurrently
    pub async fn persist(&self, record: &MemoryRecord, parts: LtmParts) -> PersistOutcome {
        let vector = async {
            if parts.vector {
                self.ltm.upsert_vector(record.id, &record.embedding).await
            } else {
                Ok(())
            }
        };
        let graph = async {
            if parts.graph {
                self.ltm.upsert_node(record).await?;
                self.ltm
                    .replace_relations(record.id, &record.relations)
                    .await
            } else {
                Ok(())
            }
        };
        let (vector, graph) = tokio::join!(vector, graph);
        PersistOutcome {
            vector: vector.err(),
            graph: graph.err(),
        }
    }

    /// Synchronous full write to LTM, used before a record leaves STM
    pub async fn flush(&self, record: &MemoryRecord) -> Result<()> {
        let outcome = self.persist(record, LtmParts::ALL).await;
        match outcome.into_error() {
            None => {
                self.stm.mark_clean(&record.id, Tier::Both);
                self.repairs.tasks.lock().remove(&record.id);
                tracing::debug!(memory_id = %record.id, "flushed to long-term store");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    /// Put a record into STM unless STM is full of unevictable entries
    ///
    /// Returns false when the record skipped STM.
    fn admit(&self, record: MemoryRecord, dirty: bool, now: DateTime<Utc>) -> bool {
        let id = record.id;
        if !self.stm.has_room_for(&id) && self.stm.eviction_candidates(now, 1).is_empty() {
            let err = MemoryError::CapacityExceeded {
                capacity: self.stm.capacity(),
            };
            tracing::warn!(memory_id = %id, error = %err, "skipping short-term store");
            return false;
        }
        self.stm.put(record, dirty);
        true
    }

    /// Re-admit a record read from LTM as a cached copy
    pub(crate) fn admit_cached(&self, mut record: MemoryRecord, now: DateTime<Utc>) -> bool {
        record.tier = Tier::Both;
        self.admit(record, true, now)
    }

    /// Accept a new record
    ///
    /// STM is updated first; vector and graph writes follow. A long-term
    /// failure after the record was cached is queued for repair and the write
    /// is still acknowledged.
    pub async fn write(&self, mut record: MemoryRecord) -> Result<WriteAck> {
        record.validate(&self.config)?;
        record.tier = Tier::Stm;
        record.status = MemoryStatus::Active;
        let id = record.id;
        let now = Utc::now();
        let deferred = self.config.deferred_kinds.contains(&record.kind);

        let ack = {
            let _guard = self.locks.lock(&id).await;
            let cached = self.admit(record.clone(), false, now);
            let _pin = if cached { self.stm.pin(&id) } else { None };

            if deferred && cached {
                tracing::debug!(memory_id = %id, kind = %record.kind, "write deferred to promotion");
                WriteAck {
                    id,
                    tier: Tier::Stm,
                    pending_repair: false,
                }
            } else {
                let outcome = self.persist(&record, LtmParts::ALL).await;
                if outcome.is_ok() {
                    if cached {
                        self.stm.mark_clean(&id, Tier::Both);
                    }
                    WriteAck {
                        id,
                        tier: if cached { Tier::Both } else { Tier::Ltm },
                        pending_repair: false,
                    }
                } else if cached {
                    let missing = outcome.failed_parts();
                    tracing::warn!(
                        memory_id = %id,
                        vector_failed = missing.vector,
                        graph_failed = missing.graph,
                        "long-term write failed; queued for repair"
                    );
                    self.enqueue_repair(id, missing);
                    WriteAck {
                        id,
                        tier: Tier::Stm,
                        pending_repair: true,
                    }
                } else {
                    self.rollback(&record, &outcome).await;
                    return Err(outcome
                        .into_error()
                        .unwrap_or_else(|| MemoryError::other("long-term write failed")));
                }
            }
        };

        self.make_room(now).await;
        tracing::info!(memory_id = %id, tier = %ack.tier, pending_repair = ack.pending_repair, "memory written");
        Ok(ack)
    }

    /// Best-effort removal of the half that did land
    async fn rollback(&self, record: &MemoryRecord, outcome: &PersistOutcome) {
        if outcome.vector.is_none() {
            if let Err(e) = self.ltm.delete_vector(record.id).await {
                tracing::warn!(memory_id = %record.id, error = %e, "vector rollback failed");
            }
        }
        if outcome.graph.is_none() {
            if let Err(e) = self.ltm.delete_node(record.id).await {
                tracing::warn!(memory_id = %record.id, error = %e, "graph rollback failed");
            }
        }
    }

    /// Apply a patch to the current copy and propagate it
    pub async fn update(&self, id: MemoryId, patch: MemoryPatch) -> Result<MemoryRecord> {
        patch.validate(id, &self.config)?;
        let _guard = self.locks.lock(&id).await;
        let now = Utc::now();

        let cached = self.stm.peek(&id);
        let in_stm = cached.is_some();
        let mut record = match cached {
            Some(r) => r,
            None => self
                .ltm
                .get_node(id)
                .await?
                .ok_or(MemoryError::NotFound(id))?,
        };

        let parts = if patch.touches_embedding() {
            LtmParts::ALL
        } else {
            LtmParts::GRAPH
        };
        patch.apply(&mut record, now);
        record.validate(&self.config)?;

        if in_stm {
            self.stm.update(&id, |r| *r = record.clone());
        }
        if !record.tier.is_durable() {
            // A pending repair now also owes the patched parts
            if self.repairs.tasks.lock().contains_key(&id) {
                self.enqueue_repair(id, parts);
            }
            return Ok(record);
        }

        let outcome = self.persist(&record, parts).await;
        if outcome.is_ok() {
            if in_stm {
                self.stm.mark_clean(&id, record.tier);
            }
        } else if in_stm {
            self.enqueue_repair(id, outcome.failed_parts());
        } else {
            return Err(outcome
                .into_error()
                .unwrap_or_else(|| MemoryError::other("long-term update failed")));
        }
        tracing::info!(memory_id = %id, "memory updated");
        Ok(record)
    }

    pub async fn add_relations(
        &self,
        id: MemoryId,
        relations: Vec<Relation>,
    ) -> Result<MemoryRecord> {
        self.update(
            id,
            MemoryPatch {
                add_relations: relations,
                ..Default::default()
            },
        )
        .await
    }

    /// Drop out-edges by key; keys the record does not have are ignored
    pub async fn remove_relations(
        &self,
        id: MemoryId,
        keys: Vec<RelationKey>,
    ) -> Result<MemoryRecord> {
        self.update(
            id,
            MemoryPatch {
                remove_relations: keys,
                ..Default::default()
            },
        )
        .await
    }

    /// Remove from LTM first, then STM
    ///
    /// If LTM cannot be reached the cached copy is left in place so the
    /// record stays discoverable.
    pub async fn delete(&self, id: MemoryId) -> Result<DeleteOutcome> {
        let _guard = self.locks.lock(&id).await;
        let in_stm = self.stm.contains(&id);

        let in_ltm = self.ltm.delete(id).await.map_err(|e| {
            tracing::warn!(memory_id = %id, error = %e, "delete failed; memory kept");
            e
        })?;

        self.repairs.tasks.lock().remove(&id);
        self.stm.remove(&id);
        for other in self.stm.snapshot() {
            if other.relations.iter().any(|r| r.target == id) {
                self.stm
                    .update(&other.id, |r| r.relations.retain(|rel| rel.target != id));
            }
        }

        if in_stm || in_ltm {
            tracing::info!(memory_id = %id, "memory deleted");
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::NotFound)
        }
    }

    /// Flush and drop entries until STM is back within capacity
    pub async fn make_room(&self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        loop {
            let over = self.stm.len().saturating_sub(self.stm.capacity());
            if over == 0 {
                break;
            }
            let candidates = self.stm.eviction_candidates(now, over + 8);
            if candidates.is_empty() {
                tracing::warn!(
                    count = self.stm.len(),
                    capacity = self.stm.capacity(),
                    "short-term store over capacity with nothing evictable"
                );
                break;
            }

            let mut progressed = false;
            for candidate in candidates {
                if self.stm.len() <= self.stm.capacity() {
                    break;
                }
                if self.evict(candidate.id).await {
                    evicted += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        evicted
    }

    /// Flush if needed, then drop one entry; false if it had to stay
    async fn evict(&self, id: MemoryId) -> bool {
        let _guard = self.locks.lock(&id).await;
        let Some(entry) = self.stm.entry(&id) else {
            return false;
        };
        if entry.pins > 0 || entry.record.status == MemoryStatus::Degraded {
            return false;
        }
        if entry.needs_flush() {
            if let Err(e) = self.flush(&entry.record).await {
                tracing::warn!(memory_id = %id, error = %e, "eviction flush failed; keeping entry");
                return false;
            }
        }
        match self.stm.evict_clean(&id) {
            Some(_) => {
                tracing::debug!(memory_id = %id, "evicted to long-term store");
                true
            }
            None => false,
        }
    }

    /// Flush every cached record whose changes have not reached LTM
    pub async fn flush_all(&self) -> (usize, usize) {
        let mut flushed = 0;
        let mut failed = 0;
        for id in self.stm.flush_pending() {
            let _guard = self.locks.lock(&id).await;
            let Some(record) = self.stm.peek(&id) else {
                continue;
            };
            match self.flush(&record).await {
                Ok(()) => flushed += 1,
                Err(e) => {
                    tracing::warn!(memory_id = %id, error = %e, "flush failed");
                    failed += 1;
                }
            }
        }
        (flushed, failed)
    }

    fn enqueue_repair(&self, id: MemoryId, missing: LtmParts) {
        let mut tasks = self.repairs.tasks.lock();
        let task = tasks.entry(id).or_insert(RepairTask {
            missing,
            attempts: 0,
            due: Instant::now() + self.config.repair.compute_delay(0),
        });
        task.missing = task.missing.union(missing);
    }

    pub fn pending_repairs(&self) -> usize {
        self.repairs.tasks.lock().len()
    }

    pub fn repair_stats(&self) -> RepairStats {
        RepairStats {
            pending: self.pending_repairs(),
            degraded: self.repairs.degraded.load(Ordering::Relaxed),
            repaired: self.repairs.repaired.load(Ordering::Relaxed),
        }
    }

    /// Retry every repair task that is due; returns how many succeeded
    pub async fn run_repairs(&self) -> usize {
        let now = Instant::now();
        let due: Vec<(MemoryId, RepairTask)> = self
            .repairs
            .tasks
            .lock()
            .iter()
            .filter(|(_, t)| t.due <= now)
            .map(|(id, t)| (*id, t.clone()))
            .collect();

        let mut repaired = 0;
        for (id, task) in due {
            if self.repair_one(id, task).await {
                repaired += 1;
            }
        }
        repaired
    }

    async fn repair_one(&self, id: MemoryId, task: RepairTask) -> bool {
        let _guard = self.locks.lock(&id).await;
        let Some(entry) = self.stm.entry(&id) else {
            // Deleted or already flushed elsewhere
            self.repairs.tasks.lock().remove(&id);
            return false;
        };
        // Changes made since the failed write have not reached either backend
        let parts = if entry.dirty {
            LtmParts::ALL
        } else {
            task.missing
        };
        let record = entry.record;

        let outcome = self.persist(&record, parts).await;
        if outcome.is_ok() {
            self.repairs.tasks.lock().remove(&id);
            self.stm.mark_clean(&id, Tier::Both);
            self.repairs.repaired.fetch_add(1, Ordering::Relaxed);
            tracing::info!(memory_id = %id, attempts = task.attempts + 1, "repair succeeded");
            return true;
        }

        let attempts = task.attempts + 1;
        let still_missing = outcome.failed_parts();
        let error = outcome
            .into_error()
            .map(|e| e.to_string())
            .unwrap_or_default();

        if attempts >= self.config.repair.max_attempts {
            self.repairs.tasks.lock().remove(&id);
            self.stm.set_status(&id, MemoryStatus::Degraded);
            self.repairs.degraded.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                target: ALERT_TARGET,
                memory_id = %id,
                attempts,
                vector_missing = still_missing.vector,
                graph_missing = still_missing.graph,
                error = %error,
                "repair abandoned; memory marked degraded"
            );
        } else {
            let delay = self.config.repair.compute_delay(attempts);
            if let Some(t) = self.repairs.tasks.lock().get_mut(&id) {
                t.attempts = attempts;
                t.missing = still_missing;
                t.due = Instant::now() + delay;
            }
            tracing::debug!(memory_id = %id, attempts, ?delay, error = %error, "repair retry scheduled");
        }
        false
    }

    /// Background loop draining the repair queue until `shutdown` fires
    pub fn spawn_repair_worker(self: Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.repair.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.pending_repairs() > 0 {
                            self.run_repairs().await;
                        }
                    }
                    _ = shutdown.notified() => {
                        tracing::debug!("repair worker stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Backend a repair for `id` is still waiting on, if any
    pub fn repair_missing(&self, id: &MemoryId) -> Option<Vec<Backend>> {
        self.repairs.tasks.lock().get(id).map(|t| {
            let mut out = Vec::new();
            if t.missing.vector {
                out.push(Backend::Vector);
            }
            if t.missing.graph {
                out.push(Backend::Graph);
            }
            out
        })
    }
}
