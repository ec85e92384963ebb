//! Public facade over the memory core
//!
//! `MemorySystem` owns the coordinator, the decay engine, and the retriever,
//! and is cheap to clone across tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::MemoryConfig;
use crate::coordinator::{Coordinator, DeleteOutcome, RepairStats};
use crate::decay::{DecayEngine, SweepReport};
use crate::error::{MemoryError, Result};
use crate::ltm::{
    GraphBackend, GraphStats, InMemoryGraphStore, InMemoryVectorStore, LongTermStore, RocksStore,
    VectorBackend, VectorStats,
};
use crate::record::{
    MemoryId, MemoryKind, MemoryPatch, MemoryRecord, Relation, RelationKey, RelationType,
    Retention,
};
use crate::retrieval::{RetrievalFilters, RetrievalQuery, RetrievalResult, Retriever};
use crate::stm::StmStats;

/// Input for `create_memory`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub content: String,
    pub embedding: Vec<f32>,
    pub kind: MemoryKind,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub retention: Retention,
}

fn default_importance() -> f32 {
    5.0
}

impl NewMemory {
    pub fn new(content: impl Into<String>, embedding: Vec<f32>, kind: MemoryKind) -> Self {
        Self {
            content: content.into(),
            embedding,
            kind,
            importance: default_importance(),
            metadata: BTreeMap::new(),
            relations: Vec::new(),
            retention: Retention::default(),
        }
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    pub fn relation(mut self, target: MemoryId, relation_type: RelationType, weight: f32) -> Self {
        self.relations.push(Relation::new(target, relation_type, weight));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn transient(mut self) -> Self {
        self.retention = Retention::Transient;
        self
    }

    fn into_record(self) -> Result<MemoryRecord> {
        Ok(MemoryRecord::builder()
            .content(self.content)
            .embedding(self.embedding)
            .kind(self.kind)
            .importance(self.importance)
            .metadata_map(self.metadata)
            .relations(self.relations)
            .retention(self.retention)
            .build()?)
    }
}

/// Snapshot of every store's size and health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub stm: StmStats,
    pub vector: VectorStats,
    pub graph: GraphStats,
    pub repair: RepairStats,
    pub last_sweep: Option<SweepReport>,
}

struct Inner {
    coord: Arc<Coordinator>,
    engine: Arc<DecayEngine>,
    retriever: Retriever,
}

/// Dual-track memory: a bounded STM cache in front of vector and graph LTM
#[derive(Clone)]
pub struct MemorySystem {
    inner: Arc<Inner>,
}

impl MemorySystem {
    /// Assemble the core over caller-supplied backends
    pub fn new(
        config: MemoryConfig,
        vector: Arc<dyn VectorBackend>,
        graph: Arc<dyn GraphBackend>,
    ) -> Result<Self> {
        config.validate()?;
        if vector.dimension() != config.dimension {
            return Err(MemoryError::config(format!(
                "vector backend dimension {} does not match configured {}",
                vector.dimension(),
                config.dimension
            )));
        }
        let ltm = LongTermStore::new(vector, graph, config.ltm.backend_timeout);
        let coord = Arc::new(Coordinator::new(Arc::new(config), ltm));
        let engine = Arc::new(DecayEngine::new(coord.clone()));
        let retriever = Retriever::new(coord.clone(), engine.clone());
        tracing::info!(
            dimension = coord.config().dimension,
            stm_capacity = coord.config().stm.capacity,
            "memory system ready"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                coord,
                engine,
                retriever,
            }),
        })
    }

    /// Volatile backends, for tests and embedding in short-lived processes
    pub fn in_memory(config: MemoryConfig) -> Result<Self> {
        let vector = Arc::new(InMemoryVectorStore::new(config.dimension));
        let graph = Arc::new(InMemoryGraphStore::new());
        Self::new(config, vector, graph)
    }

    /// RocksDB-backed LTM at `path`, serving both vector and graph
    pub fn open_rocks(path: impl AsRef<Path>, config: MemoryConfig) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let store = Arc::new(RocksStore::open(path, config.dimension)?);
        tracing::info!(path = %path.display(), "opened persistent store");
        Self::new(config, store.clone(), store)
    }

    pub fn config(&self) -> &MemoryConfig {
        self.inner.coord.config()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.inner.coord
    }

    pub fn engine(&self) -> &Arc<DecayEngine> {
        &self.inner.engine
    }

    pub async fn create_memory(&self, new: NewMemory) -> Result<MemoryId> {
        let record = new.into_record()?;
        let ack = self.inner.coord.write(record).await?;
        Ok(ack.id)
    }

    /// Fetch one memory and record the access
    pub async fn get_memory(&self, id: MemoryId) -> Result<MemoryRecord> {
        self.access(id, 0.0).await
    }

    pub async fn update_memory(&self, id: MemoryId, patch: MemoryPatch) -> Result<MemoryRecord> {
        self.inner.coord.update(id, patch).await
    }

    pub async fn add_relations(
        &self,
        id: MemoryId,
        relations: Vec<Relation>,
    ) -> Result<MemoryRecord> {
        self.inner.coord.add_relations(id, relations).await
    }

    pub async fn remove_relations(
        &self,
        id: MemoryId,
        keys: Vec<RelationKey>,
    ) -> Result<MemoryRecord> {
        self.inner.coord.remove_relations(id, keys).await
    }

    pub async fn delete_memory(&self, id: MemoryId) -> Result<DeleteOutcome> {
        self.inner.coord.delete(id).await
    }

    pub async fn search_memories(&self, query: RetrievalQuery) -> Result<RetrievalResult> {
        self.inner.retriever.retrieve(query).await
    }

    /// Memories reachable from `id`, ranked without a semantic term
    pub async fn get_related(
        &self,
        id: MemoryId,
        max_depth: Option<usize>,
        relation_types: Vec<RelationType>,
        min_importance: Option<f32>,
    ) -> Result<RetrievalResult> {
        let coord = &self.inner.coord;
        if !coord.stm().contains(&id) {
            match coord.ltm().get_node(id).await {
                Ok(Some(_)) => {}
                Ok(None) => return Err(MemoryError::NotFound(id)),
                // Let retrieval report the outage as degraded
                Err(e) => tracing::debug!(memory_id = %id, error = %e, "anchor lookup failed"),
            }
        }
        let mut query = RetrievalQuery::related_to(id)
            .with_relation_types(relation_types)
            .with_filters(RetrievalFilters {
                min_importance,
                ..Default::default()
            });
        query.max_depth = max_depth;
        self.search_memories(query).await
    }

    /// Reinforce a memory and raise its importance by `importance_boost`
    pub async fn reinforce_memory(
        &self,
        id: MemoryId,
        importance_boost: f32,
    ) -> Result<MemoryRecord> {
        if !importance_boost.is_finite() || importance_boost < 0.0 {
            return Err(MemoryError::validation(
                "importance boost must be a non-negative number",
            ));
        }
        self.access(id, importance_boost).await
    }

    async fn access(&self, id: MemoryId, importance_boost: f32) -> Result<MemoryRecord> {
        // Counts toward the cache hit rate
        let cached = self.inner.coord.stm().get(&id).is_some();
        let record = self
            .inner
            .engine
            .reinforce_with(id, Utc::now(), importance_boost)
            .await?
            .ok_or(MemoryError::NotFound(id))?;
        tracing::trace!(memory_id = %id, cached, "memory read");
        Ok(record)
    }

    pub async fn report_storage_stats(&self) -> StorageStats {
        let coord = &self.inner.coord;
        let (vector, graph) = tokio::join!(coord.ltm().vector_stats(), coord.ltm().graph_stats());
        StorageStats {
            stm: coord.stm().stats(),
            vector,
            graph,
            repair: coord.repair_stats(),
            last_sweep: self.inner.engine.last_report(),
        }
    }

    /// One decay sweep at the current time
    pub async fn run_sweep(&self) -> SweepReport {
        self.inner.engine.run_once().await
    }

    pub async fn run_sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        self.inner.engine.run_once_at(now).await
    }

    /// Retry due repairs now instead of waiting for the worker
    pub async fn run_repairs(&self) -> usize {
        self.inner.coord.run_repairs().await
    }

    /// Start the decay sweep and the repair worker
    pub fn start_background(&self) -> BackgroundHandles {
        let sweep_stop = Arc::new(Notify::new());
        let repair_stop = Arc::new(Notify::new());
        let sweep = self.inner.engine.clone().spawn(sweep_stop.clone());
        let repair = self
            .inner
            .coord
            .clone()
            .spawn_repair_worker(repair_stop.clone());
        tracing::info!("background tasks started");
        BackgroundHandles {
            tasks: vec![(sweep_stop, sweep), (repair_stop, repair)],
        }
    }

    /// Write every dirty or STM-only record through to LTM
    ///
    /// Returns `(flushed, failed)`.
    pub async fn flush(&self) -> (usize, usize) {
        let (flushed, failed) = self.inner.coord.flush_all().await;
        tracing::info!(flushed, failed, "short-term store flushed");
        (flushed, failed)
    }
}

/// Running background tasks
pub struct BackgroundHandles {
    tasks: Vec<(Arc<Notify>, JoinHandle<()>)>,
}

impl BackgroundHandles {
    /// Signal every task and wait for it to stop
    pub async fn shutdown(self) {
        for (stop, handle) in self.tasks {
            stop.notify_one();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MemoryConfig {
        MemoryConfig {
            dimension: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let vector = Arc::new(InMemoryVectorStore::new(4));
        let graph = Arc::new(InMemoryGraphStore::new());
        let result = MemorySystem::new(config(), vector, graph);
        assert!(matches!(result, Err(MemoryError::Config(_))));
    }

    #[tokio::test]
    async fn test_reinforce_raises_importance() {
        let system = MemorySystem::in_memory(config()).unwrap();
        let id = system
            .create_memory(NewMemory::new("fact", vec![1.0, 0.0, 0.0], MemoryKind::Semantic))
            .await
            .unwrap();
        let before = system.get_memory(id).await.unwrap();
        let after = system.reinforce_memory(id, 2.0).await.unwrap();
        assert_eq!(after.importance, 7.0);
        assert!(after.strength >= before.strength);
        assert!(system.reinforce_memory(id, -1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_background_shutdown() {
        let system = MemorySystem::in_memory(config()).unwrap();
        let handles = system.start_background();
        handles.shutdown().await;
    }
}
