//! Dualtrack Memory Core
//!
//! A two-tier memory store for agents: a bounded short-term cache in front
//! of a long-term layer made of a vector index and a weighted relation graph.
//!
//! ## Features
//!
//! - **Short-term cache** - capacity-bounded, evicts by age and importance, flushes before evicting
//! - **Dual long-term backends** - cosine vector search plus weighted BFS over typed relations
//! - **Composite retrieval** - similarity, relation weight, strength, and importance in one ranking
//! - **Decay and promotion** - half-life decay per kind, reinforcement on access, periodic sweeps
//! - **Repair** - failed long-term writes are retried with exponential backoff
//! - **RocksDB persistence** - with an HNSW index for vector search
//!
//! ## Example
//!
//! ```ignore
//! use dualtrack_memory::{MemoryConfig, MemoryKind, MemorySystem, NewMemory, RetrievalQuery};
//!
//! let system = MemorySystem::open_rocks(&data_dir, MemoryConfig::from_env())?;
//! let background = system.start_background();
//!
//! let id = system
//!     .create_memory(NewMemory::new("Deploy uses blue/green", embedding, MemoryKind::Semantic).importance(8.0))
//!     .await?;
//!
//! let results = system
//!     .search_memories(RetrievalQuery::semantic(query_embedding).with_anchor(id))
//!     .await?;
//!
//! background.shutdown().await;
//! system.flush().await;
//! ```

pub mod config;
pub mod coordinator;
pub mod decay;
pub mod error;
pub mod locks;
pub mod ltm;
pub mod migration;
pub mod record;
pub mod retrieval;
pub mod stm;
pub mod system;
pub mod temporal;

// Re-exports for convenience
pub use config::{
    DecayConfig, HalfLives, LtmConfig, MemoryConfig, RankingWeights, RepairConfig,
    RetrievalConfig, StmConfig,
};
pub use coordinator::{DeleteOutcome, RepairStats, WriteAck, ALERT_TARGET};
pub use decay::SweepReport;
pub use error::{Backend, MemoryError, Result};
pub use ltm::{
    Direction, GraphBackend, GraphHit, GraphStats, InMemoryGraphStore, InMemoryVectorStore,
    RocksStore, TraversalSpec, VectorBackend, VectorStats,
};
pub use record::{
    MemoryId, MemoryKind, MemoryPatch, MemoryRecord, MemoryRecordBuilder, MemoryRecordBuilderError,
    MemoryStatus, Relation, RelationKey, RelationType, Retention, Tier,
};
pub use retrieval::{
    RetrievalFilters, RetrievalQuery, RetrievalResult, ScoreBreakdown, ScoredMemory, SourceStatus,
};
pub use stm::StmStats;
pub use system::{BackgroundHandles, MemorySystem, NewMemory, StorageStats};
pub use temporal::TemporalMetadata;
