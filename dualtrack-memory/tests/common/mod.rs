//! Shared fixtures for the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dualtrack_memory::{
    Backend, GraphBackend, GraphHit, InMemoryGraphStore, InMemoryVectorStore, MemoryConfig,
    MemoryError, MemoryId, MemoryKind, MemoryRecord, MemorySystem, NewMemory, Relation,
    RepairConfig, Result, StmConfig, TraversalSpec, VectorBackend,
};

pub const DIM: usize = 4;

/// Outage switch and artificial latency for a wrapped backend
#[derive(Default)]
pub struct Faults {
    down: AtomicBool,
    delay_ms: AtomicU64,
}

impl Faults {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn check(&self, backend: Backend) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(MemoryError::unavailable(backend, "injected outage"));
        }
        Ok(())
    }
}

pub struct FlakyVector {
    inner: InMemoryVectorStore,
    pub faults: Arc<Faults>,
}

#[async_trait]
impl VectorBackend for FlakyVector {
    async fn upsert(&self, id: MemoryId, vector: &[f32]) -> Result<()> {
        self.faults.check(Backend::Vector).await?;
        self.inner.upsert(id, vector).await
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<(MemoryId, f32)>> {
        self.faults.check(Backend::Vector).await?;
        self.inner.search(query, k).await
    }

    async fn delete(&self, id: MemoryId) -> Result<bool> {
        self.faults.check(Backend::Vector).await?;
        self.inner.delete(id).await
    }

    async fn count(&self) -> Result<usize> {
        self.faults.check(Backend::Vector).await?;
        self.inner.count().await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

pub struct FlakyGraph {
    inner: InMemoryGraphStore,
    pub faults: Arc<Faults>,
}

#[async_trait]
impl GraphBackend for FlakyGraph {
    async fn upsert_node(&self, record: &MemoryRecord) -> Result<()> {
        self.faults.check(Backend::Graph).await?;
        self.inner.upsert_node(record).await
    }

    async fn replace_edges(&self, from: MemoryId, edges: &[Relation]) -> Result<()> {
        self.faults.check(Backend::Graph).await?;
        self.inner.replace_edges(from, edges).await
    }

    async fn get_node(&self, id: MemoryId) -> Result<Option<MemoryRecord>> {
        self.faults.check(Backend::Graph).await?;
        self.inner.get_node(id).await
    }

    async fn delete_node(&self, id: MemoryId) -> Result<bool> {
        self.faults.check(Backend::Graph).await?;
        self.inner.delete_node(id).await
    }

    async fn traverse(&self, start: MemoryId, spec: &TraversalSpec) -> Result<Vec<GraphHit>> {
        self.faults.check(Backend::Graph).await?;
        self.inner.traverse(start, spec).await
    }

    async fn scan_nodes(
        &self,
        after: Option<MemoryId>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.faults.check(Backend::Graph).await?;
        self.inner.scan_nodes(after, limit).await
    }

    async fn node_count(&self) -> Result<usize> {
        self.faults.check(Backend::Graph).await?;
        self.inner.node_count().await
    }

    async fn edge_count(&self) -> Result<usize> {
        self.faults.check(Backend::Graph).await?;
        self.inner.edge_count().await
    }
}

/// A system over fault-injectable in-memory backends
pub struct Harness {
    pub system: MemorySystem,
    pub vector: Arc<Faults>,
    pub graph: Arc<Faults>,
}

pub fn config() -> MemoryConfig {
    MemoryConfig {
        dimension: DIM,
        ltm: dualtrack_memory::LtmConfig {
            backend_timeout: Duration::from_millis(100),
        },
        repair: RepairConfig {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: 3,
            ..RepairConfig::default()
        },
        ..MemoryConfig::default()
    }
}

pub fn config_with_capacity(capacity: usize) -> MemoryConfig {
    MemoryConfig {
        stm: StmConfig {
            capacity,
            ..StmConfig::default()
        },
        ..config()
    }
}

pub fn harness(config: MemoryConfig) -> Harness {
    let vector = Arc::new(Faults::default());
    let graph = Arc::new(Faults::default());
    let system = MemorySystem::new(
        config,
        Arc::new(FlakyVector {
            inner: InMemoryVectorStore::new(DIM),
            faults: vector.clone(),
        }),
        Arc::new(FlakyGraph {
            inner: InMemoryGraphStore::new(),
            faults: graph.clone(),
        }),
    )
    .unwrap();
    Harness {
        system,
        vector,
        graph,
    }
}

/// Unit vector along `axis`, tilted toward the next axis by `tilt`
pub fn embedding(axis: usize, tilt: f32) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[axis % DIM] = 1.0;
    v[(axis + 1) % DIM] = tilt;
    v
}

pub fn memory(content: &str, kind: MemoryKind, importance: f32) -> NewMemory {
    NewMemory::new(content, embedding(0, 0.0), kind).importance(importance)
}

/// Build a test subscriber once per binary so `RUST_LOG` works in tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
