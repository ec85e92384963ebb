//! Decay, reinforcement, promotion, and forgetting
//!
//! Strength follows `s(t) = s0 * rate^(elapsed / half_life)` from the moment
//! it was last anchored (`temporal.strength_updated_at`). Reading strength
//! never raises it; only an access or explicit reinforcement re-anchors it at
//! a higher value:
//!
//! ```text
//! reinforce(s, gain) = min(1, s + gain * (1 - s))
//! ```
//!
//! The half-life depends on the memory kind and stretches with importance,
//! so important procedural knowledge outlives an unimportant episode.
//!
//! `DecayEngine` applies these rules: on access, and in periodic
//! incremental sweeps over both tiers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::{to_chrono, DecayConfig};
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::record::{MemoryId, MemoryKind, MemoryRecord, Retention, Tier};

/// Strength assigned at creation
pub fn initial_strength(importance: f32) -> f32 {
    (importance / 10.0).clamp(0.0, 1.0)
}

/// Half-life in seconds for a record of `kind` and `importance`
pub fn effective_half_life(kind: MemoryKind, importance: f32, config: &DecayConfig) -> f64 {
    let base = config.half_lives.for_kind(kind).as_secs_f64();
    let norm = ((importance - 1.0) / 9.0).clamp(0.0, 1.0) as f64;
    base * (1.0 + config.importance_scale as f64 * norm)
}

/// Decay `strength` over `elapsed_secs`
#[inline]
pub fn decay(strength: f32, elapsed_secs: f64, half_life_secs: f64, rate: f32) -> f32 {
    if elapsed_secs <= 0.0 || half_life_secs <= 0.0 {
        return strength;
    }
    let factor = (rate as f64).powf(elapsed_secs / half_life_secs);
    (strength as f64 * factor).clamp(0.0, 1.0) as f32
}

/// Move `strength` toward 1 by `gain` of the remaining headroom
#[inline]
pub fn reinforce(strength: f32, gain: f32) -> f32 {
    (strength + gain * (1.0 - strength)).min(1.0)
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Current strength of `record` at `now`
pub fn strength_at(record: &MemoryRecord, now: DateTime<Utc>, config: &DecayConfig) -> f32 {
    let elapsed = seconds_between(record.temporal.strength_updated_at, now);
    let half_life = effective_half_life(record.kind, record.importance, config);
    decay(record.strength, elapsed, half_life, config.decay_rate)
}

/// When strength first fell (or will fall) under the forgetting floor
pub fn floor_crossed_at(record: &MemoryRecord, config: &DecayConfig) -> DateTime<Utc> {
    let anchor = record.temporal.strength_updated_at;
    if record.strength <= config.forget_floor {
        return anchor;
    }
    let half_life = effective_half_life(record.kind, record.importance, config);
    let halvings = (config.forget_floor as f64 / record.strength as f64).ln()
        / (config.decay_rate as f64).ln();
    let secs = half_life * halvings;
    let millis = (secs * 1000.0).min(i64::MAX as f64 / 2.0) as i64;
    anchor + chrono::Duration::milliseconds(millis)
}

/// Whether a non-durable record has earned a long-term copy
pub fn promotion_due(record: &MemoryRecord, now: DateTime<Utc>, config: &DecayConfig) -> bool {
    let weighted = strength_at(record, now, config) * record.importance / 10.0;
    let frequent = record
        .temporal
        .accesses_within(now, config.promotion_window_chrono())
        >= config.promotion_access_count;
    weighted >= config.promotion_threshold || frequent
}

/// Whether a record has been under the floor longer than the retention window
pub fn forget_due(record: &MemoryRecord, now: DateTime<Utc>, config: &DecayConfig) -> bool {
    if strength_at(record, now, config) >= config.forget_floor {
        return false;
    }
    let since = record
        .temporal
        .below_floor_since
        .unwrap_or_else(|| floor_crossed_at(record, config));
    now - since >= to_chrono(config.retention_window)
}

/// Decay to `now`, reinforce, and record the access
pub fn apply_access(record: &mut MemoryRecord, now: DateTime<Utc>, config: &DecayConfig) {
    let current = strength_at(record, now, config);
    record.strength = reinforce(current, config.reinforcement_gain);
    record.temporal.strength_updated_at = now;
    record
        .temporal
        .record_access(now, config.promotion_window_chrono());
}

/// Counters for one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned_stm: usize,
    pub scanned_ltm: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub forgotten: usize,
    pub deleted_from_ltm: usize,
    pub skipped_pinned: usize,
    pub errors: usize,
}

#[derive(Debug, Default)]
struct SweepCursors {
    stm: Option<MemoryId>,
    ltm: Option<MemoryId>,
}

/// Applies decay rules on access and in periodic sweeps
pub struct DecayEngine {
    coord: Arc<Coordinator>,
    cursors: Mutex<SweepCursors>,
    last_report: Mutex<Option<SweepReport>>,
}

impl DecayEngine {
    pub fn new(coord: Arc<Coordinator>) -> Self {
        Self {
            coord,
            cursors: Mutex::new(SweepCursors::default()),
            last_report: Mutex::new(None),
        }
    }

    fn config(&self) -> &DecayConfig {
        &self.coord.config.decay
    }

    pub fn last_report(&self) -> Option<SweepReport> {
        self.last_report.lock().clone()
    }

    /// Access bookkeeping for a record a caller just read
    ///
    /// When the record is not cached, the long-term node is read under the
    /// id lock and re-admitted into STM as a hot copy. Returns the record
    /// after bookkeeping, or `None` if it no longer exists in either tier.
    pub async fn record_access(
        &self,
        id: MemoryId,
        now: DateTime<Utc>,
    ) -> Result<Option<MemoryRecord>> {
        self.reinforce_with(id, now, 0.0).await
    }

    /// Access bookkeeping plus an importance boost
    pub async fn reinforce_with(
        &self,
        id: MemoryId,
        now: DateTime<Utc>,
        importance_boost: f32,
    ) -> Result<Option<MemoryRecord>> {
        let cfg = self.config().clone();
        let mut admitted = false;

        let updated = {
            let _guard = self.coord.locks.lock(&id).await;
            let bump = |r: &mut MemoryRecord| {
                apply_access(r, now, &cfg);
                if importance_boost > 0.0 {
                    r.importance = (r.importance + importance_boost).min(10.0);
                }
                r.clone()
            };

            let record = match self.coord.stm.update(&id, bump) {
                Some(r) => r,
                None => {
                    // Whatever the caller read may predate a delete or
                    // update that ran while we waited for the lock
                    let Some(mut record) = self.coord.ltm.get_node(id).await? else {
                        return Ok(None);
                    };
                    apply_access(&mut record, now, &cfg);
                    if importance_boost > 0.0 {
                        record.importance = (record.importance + importance_boost).min(10.0);
                    }
                    record.tier = Tier::Both;
                    admitted = self.coord.admit_cached(record.clone(), now);
                    if !admitted {
                        self.coord.ltm.upsert_node(&record).await?;
                        record.tier = Tier::Ltm;
                    }
                    record
                }
            };

            if record.tier == Tier::Stm && promotion_due(&record, now, &cfg) {
                self.promote(&record).await;
                self.coord.stm.peek(&id).unwrap_or(record)
            } else {
                record
            }
        };

        if admitted {
            self.coord.make_room(now).await;
        }
        tracing::debug!(memory_id = %id, strength = updated.strength, "access recorded");
        Ok(Some(updated))
    }

    async fn promote(&self, record: &MemoryRecord) -> bool {
        match self.coord.flush(record).await {
            Ok(()) => {
                tracing::info!(memory_id = %record.id, kind = %record.kind, "promoted to long-term store");
                true
            }
            Err(e) => {
                tracing::warn!(memory_id = %record.id, error = %e, "promotion failed");
                false
            }
        }
    }

    /// One bounded sweep at `now`, resuming from the saved cursors
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_stm(now, &mut report).await;
        self.sweep_ltm(now, &mut report).await;

        if report.forgotten + report.promoted + report.demoted + report.deleted_from_ltm > 0 {
            tracing::info!(
                promoted = report.promoted,
                demoted = report.demoted,
                forgotten = report.forgotten,
                deleted_from_ltm = report.deleted_from_ltm,
                "decay sweep"
            );
        }
        *self.last_report.lock() = Some(report.clone());
        report
    }

    pub async fn run_once(&self) -> SweepReport {
        self.run_once_at(Utc::now()).await
    }

    async fn sweep_stm(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let batch_size = self.config().batch_size;
        let after = self.cursors.lock().stm;
        let batch = self.coord.stm.scan_batch(after, batch_size);
        let next = if batch.len() < batch_size {
            None
        } else {
            batch.last().map(|r| r.id)
        };

        for snapshot in batch {
            report.scanned_stm += 1;
            self.sweep_cached(snapshot.id, now, report).await;
            self.cursors.lock().stm = Some(snapshot.id);
        }
        self.cursors.lock().stm = next;
    }

    async fn sweep_cached(&self, id: MemoryId, now: DateTime<Utc>, report: &mut SweepReport) {
        let cfg = self.config().clone();
        let _guard = self.coord.locks.lock(&id).await;
        let Some(entry) = self.coord.stm.entry(&id) else {
            return;
        };
        if entry.pins > 0 {
            report.skipped_pinned += 1;
            return;
        }
        let record = entry.record;
        let strength = strength_at(&record, now, &cfg);

        if strength < cfg.forget_floor {
            if record.temporal.below_floor_since.is_none() {
                let since = floor_crossed_at(&record, &cfg).min(now);
                self.coord
                    .stm
                    .update(&id, |r| r.temporal.below_floor_since = Some(since));
            }
            let Some(record) = self.coord.stm.peek(&id) else {
                return;
            };
            if forget_due(&record, now, &cfg) {
                self.forget_cached(&record, report).await;
            }
            return;
        }

        if record.tier == Tier::Both && strength < cfg.demote_threshold {
            if entry.dirty {
                if let Err(e) = self.coord.flush(&record).await {
                    tracing::warn!(memory_id = %id, error = %e, "demotion flush failed");
                    report.errors += 1;
                    return;
                }
            }
            if self.coord.stm.evict_clean(&id).is_some() {
                tracing::debug!(memory_id = %id, strength, "demoted from short-term store");
                report.demoted += 1;
            }
            return;
        }

        if record.tier == Tier::Stm && promotion_due(&record, now, &cfg) {
            if self.promote(&record).await {
                report.promoted += 1;
            } else {
                report.errors += 1;
            }
        }
    }

    /// Caller holds the id lock
    async fn forget_cached(&self, record: &MemoryRecord, report: &mut SweepReport) {
        let id = record.id;
        match record.retention {
            Retention::Transient => {
                if let Err(e) = self.coord.ltm.delete(id).await {
                    tracing::warn!(memory_id = %id, error = %e, "forget failed; memory kept");
                    report.errors += 1;
                    return;
                }
                report.deleted_from_ltm += 1;
            }
            Retention::Permanent => {
                let needs_flush = self
                    .coord
                    .stm
                    .entry(&id)
                    .map_or(false, |e| e.needs_flush());
                if needs_flush {
                    if let Err(e) = self.coord.flush(record).await {
                        tracing::warn!(memory_id = %id, error = %e, "forget flush failed; memory kept");
                        report.errors += 1;
                        return;
                    }
                }
            }
        }
        if self.coord.stm.remove_unpinned(&id).is_some() {
            tracing::info!(memory_id = %id, retention = ?record.retention, "memory forgotten");
            report.forgotten += 1;
        }
    }

    async fn sweep_ltm(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let cfg = self.config().clone();
        let batch_size = cfg.batch_size;
        let after = self.cursors.lock().ltm;
        let batch = match self.coord.ltm.scan_nodes(after, batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, "long-term sweep skipped");
                report.errors += 1;
                return;
            }
        };
        let next = if batch.len() < batch_size {
            None
        } else {
            batch.last().map(|r| r.id)
        };

        for node in batch {
            report.scanned_ltm += 1;
            if node.retention == Retention::Transient
                && !self.coord.stm.contains(&node.id)
                && forget_due(&node, now, &cfg)
            {
                let _guard = self.coord.locks.lock(&node.id).await;
                if self.coord.stm.contains(&node.id) {
                    continue;
                }
                if self.coord.reads.is_held(&node.id) {
                    report.skipped_pinned += 1;
                    continue;
                }
                match self.coord.ltm.delete(node.id).await {
                    Ok(_) => {
                        tracing::info!(memory_id = %node.id, "transient memory forgotten");
                        report.deleted_from_ltm += 1;
                        report.forgotten += 1;
                    }
                    Err(e) => {
                        tracing::warn!(memory_id = %node.id, error = %e, "forget failed");
                        report.errors += 1;
                    }
                }
            }
            self.cursors.lock().ltm = Some(node.id);
        }
        self.cursors.lock().ltm = next;
    }

    /// Periodic sweep loop until `shutdown` fires
    ///
    /// A sweep interrupted by shutdown resumes from the saved cursor next
    /// time the engine runs.
    pub fn spawn(self: Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config().sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = self.run_once() => {}
                            _ = shutdown.notified() => {
                                tracing::debug!("decay sweep interrupted");
                                break;
                            }
                        }
                    }
                    _ = shutdown.notified() => {
                        tracing::debug!("decay engine stopping");
                        break;
                    }
                }
            }
        })
    }
}
