//! Configuration for the memory core
//!
//! Every tunable lives here with a default. `MemoryConfig::from_env` layers
//! `DUALTRACK_*` environment overrides on top of the defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{MemoryError, Result};
use crate::record::MemoryKind;

/// Short-term store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StmConfig {
    /// Maximum number of cached records
    pub capacity: usize,
    /// Time unit of the eviction age factor
    pub age_unit: Duration,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            age_unit: Duration::from_secs(60),
        }
    }
}

/// Long-term store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LtmConfig {
    /// Timeout applied to every backend call
    pub backend_timeout: Duration,
}

impl Default for LtmConfig {
    fn default() -> Self {
        Self {
            backend_timeout: Duration::from_secs(2),
        }
    }
}

/// Base half-life per memory kind, before importance scaling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HalfLives {
    pub episodic: Duration,
    pub procedural: Duration,
    pub semantic: Duration,
    pub working: Duration,
}

impl HalfLives {
    pub fn for_kind(&self, kind: MemoryKind) -> Duration {
        match kind {
            MemoryKind::Episodic => self.episodic,
            MemoryKind::Procedural => self.procedural,
            MemoryKind::Semantic => self.semantic,
            MemoryKind::Working => self.working,
        }
    }
}

impl Default for HalfLives {
    fn default() -> Self {
        const DAY: u64 = 24 * 60 * 60;
        Self {
            episodic: Duration::from_secs(DAY),
            procedural: Duration::from_secs(14 * DAY),
            semantic: Duration::from_secs(7 * DAY),
            working: Duration::from_secs(60 * 60),
        }
    }
}

/// Decay, promotion, and forgetting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayConfig {
    /// Fraction of strength retained after one half-life
    pub decay_rate: f32,
    pub half_lives: HalfLives,
    /// Importance 10 stretches the half-life by `1 + importance_scale`
    pub importance_scale: f32,
    /// Share of the remaining headroom gained per access
    pub reinforcement_gain: f32,
    /// Minimum `strength * importance / 10` for promotion
    pub promotion_threshold: f32,
    /// Accesses inside `promotion_window` that force promotion
    pub promotion_access_count: usize,
    pub promotion_window: Duration,
    /// Cached copies weaker than this leave STM
    pub demote_threshold: f32,
    /// Strength under which the forgetting clock runs
    pub forget_floor: f32,
    /// How long a record may stay under the floor
    pub retention_window: Duration,
    pub sweep_interval: Duration,
    /// Records examined per tier per sweep
    pub batch_size: usize,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.5,
            half_lives: HalfLives::default(),
            importance_scale: 4.0,
            reinforcement_gain: 0.2,
            promotion_threshold: 0.35,
            promotion_access_count: 3,
            promotion_window: Duration::from_secs(60 * 60),
            demote_threshold: 0.1,
            forget_floor: 0.05,
            retention_window: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            batch_size: 256,
        }
    }
}

impl DecayConfig {
    pub fn promotion_window_chrono(&self) -> chrono::Duration {
        to_chrono(self.promotion_window)
    }
}

/// Composite ranking weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingWeights {
    pub semantic: f32,
    pub relational: f32,
    pub strength: f32,
    pub importance: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            semantic: 0.4,
            relational: 0.25,
            strength: 0.2,
            importance: 0.15,
        }
    }
}

impl RankingWeights {
    /// Weights must be non-negative and sum to 1
    pub fn validate(&self) -> Result<()> {
        let parts = [self.semantic, self.relational, self.strength, self.importance];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(MemoryError::validation("ranking weights must be non-negative"));
        }
        let sum: f32 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-3 {
            return Err(MemoryError::validation(format!(
                "ranking weights must sum to 1, got {sum}"
            )));
        }
        Ok(())
    }
}

/// Retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub weights: RankingWeights,
    /// Vector candidates fetched per requested result
    pub oversample: usize,
    pub default_limit: usize,
    pub default_max_depth: usize,
    /// Edges lighter than this are not traversed
    pub min_edge_weight: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            weights: RankingWeights::default(),
            oversample: 3,
            default_limit: 10,
            default_max_depth: 2,
            min_edge_weight: 0.1,
        }
    }
}

/// Background repair retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Attempts before the record is marked degraded
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// How often the repair worker checks for due tasks
    pub poll_interval: Duration,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl RepairConfig {
    /// Delay before retry number `attempt` (0-based)
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let delay = base * self.backoff_multiplier.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Embedding dimension shared by every record
    pub dimension: usize,
    pub max_content_chars: usize,
    /// Number of per-id lock stripes
    pub lock_stripes: usize,
    /// Kinds that stay STM-only until promoted
    pub deferred_kinds: Vec<MemoryKind>,
    pub stm: StmConfig,
    pub ltm: LtmConfig,
    pub decay: DecayConfig,
    pub retrieval: RetrievalConfig,
    pub repair: RepairConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            max_content_chars: 4000,
            lock_stripes: 64,
            deferred_kinds: vec![MemoryKind::Working],
            stm: StmConfig::default(),
            ltm: LtmConfig::default(),
            decay: DecayConfig::default(),
            retrieval: RetrievalConfig::default(),
            repair: RepairConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Defaults overridden by `DUALTRACK_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse("DUALTRACK_DIMENSION") {
            config.dimension = n;
        }
        if let Some(n) = env_parse("DUALTRACK_MAX_CONTENT_CHARS") {
            config.max_content_chars = n;
        }
        if let Some(n) = env_parse("DUALTRACK_STM_CAPACITY") {
            config.stm.capacity = n;
        }
        if let Some(ms) = env_parse("DUALTRACK_BACKEND_TIMEOUT_MS") {
            config.ltm.backend_timeout = Duration::from_millis(ms);
        }
        if let Some(rate) = env_parse("DUALTRACK_DECAY_RATE") {
            config.decay.decay_rate = rate;
        }
        if let Some(floor) = env_parse("DUALTRACK_FORGET_FLOOR") {
            config.decay.forget_floor = floor;
        }
        if let Some(secs) = env_parse("DUALTRACK_RETENTION_WINDOW_SECS") {
            config.decay.retention_window = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("DUALTRACK_SWEEP_INTERVAL_SECS") {
            config.decay.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse("DUALTRACK_SWEEP_BATCH") {
            config.decay.batch_size = n;
        }
        if let Some(n) = env_parse("DUALTRACK_REPAIR_MAX_ATTEMPTS") {
            config.repair.max_attempts = n;
        }
        if let Ok(kinds) = env::var("DUALTRACK_DEFERRED_KINDS") {
            config.deferred_kinds = kinds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| s.parse().ok())
                .collect();
        }

        config
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(MemoryError::config("dimension must be positive"));
        }
        if self.max_content_chars == 0 {
            return Err(MemoryError::config("max_content_chars must be positive"));
        }
        if self.lock_stripes == 0 {
            return Err(MemoryError::config("lock_stripes must be positive"));
        }
        if self.stm.capacity == 0 {
            return Err(MemoryError::config("stm.capacity must be positive"));
        }
        if self.stm.age_unit.is_zero() {
            return Err(MemoryError::config("stm.age_unit must be positive"));
        }
        if self.ltm.backend_timeout.is_zero() {
            return Err(MemoryError::config("ltm.backend_timeout must be positive"));
        }

        let d = &self.decay;
        if !(d.decay_rate > 0.0 && d.decay_rate < 1.0) {
            return Err(MemoryError::config("decay.decay_rate must be in (0, 1)"));
        }
        if MemoryKind::ALL
            .iter()
            .any(|k| d.half_lives.for_kind(*k).is_zero())
        {
            return Err(MemoryError::config("half-lives must be positive"));
        }
        if d.importance_scale < 0.0 {
            return Err(MemoryError::config("decay.importance_scale must be >= 0"));
        }
        if !(0.0..=1.0).contains(&d.reinforcement_gain) {
            return Err(MemoryError::config("decay.reinforcement_gain must be in [0, 1]"));
        }
        if !(0.0..1.0).contains(&d.forget_floor) {
            return Err(MemoryError::config("decay.forget_floor must be in [0, 1)"));
        }
        if d.demote_threshold < d.forget_floor {
            return Err(MemoryError::config(
                "decay.demote_threshold must not be below decay.forget_floor",
            ));
        }
        if d.batch_size == 0 {
            return Err(MemoryError::config("decay.batch_size must be positive"));
        }
        // Both drive tokio intervals, which reject a zero period
        if d.sweep_interval.is_zero() {
            return Err(MemoryError::config("decay.sweep_interval must be positive"));
        }

        self.retrieval
            .weights
            .validate()
            .map_err(|e| MemoryError::config(e.to_string()))?;
        if self.retrieval.oversample == 0 {
            return Err(MemoryError::config("retrieval.oversample must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_edge_weight) {
            return Err(MemoryError::config("retrieval.min_edge_weight must be in [0, 1]"));
        }

        if self.repair.backoff_multiplier < 1.0 {
            return Err(MemoryError::config("repair.backoff_multiplier must be >= 1"));
        }
        if self.repair.poll_interval.is_zero() {
            return Err(MemoryError::config("repair.poll_interval must be positive"));
        }
        Ok(())
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36500))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => {
            tracing::info!(key, value = %raw, "config override from environment");
            Some(v)
        }
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable config override");
            None
        }
    }
}
