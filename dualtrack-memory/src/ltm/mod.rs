//! Long-term store
//!
//! The durable tier is split over two capability traits: a vector backend
//! (similarity search over embeddings) and a graph backend (record nodes plus
//! weighted, typed relations). `LongTermStore` wraps one of each, applies the
//! configured timeout to every call, and reports failures as
//! `MemoryError::BackendUnavailable` attributed to the backend that failed.

pub mod graph;
pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Backend, MemoryError, Result};
use crate::record::{MemoryId, MemoryRecord, Relation, RelationType, Tier};

pub use graph::{Direction, GraphHit, TraversalSpec};
pub use memory::{InMemoryGraphStore, InMemoryVectorStore};
pub use rocks::RocksStore;

/// Similarity index over record embeddings
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Insert or replace the vector stored for `id`
    async fn upsert(&self, id: MemoryId, vector: &[f32]) -> Result<()>;

    /// Nearest `k` ids by cosine distance (`1 - cos`), closest first
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<(MemoryId, f32)>>;

    /// Returns whether a vector was removed
    async fn delete(&self, id: MemoryId) -> Result<bool>;

    async fn count(&self) -> Result<usize>;

    fn dimension(&self) -> usize;
}

/// Record nodes and weighted relations between them
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Insert or replace the node properties for `record.id`
    async fn upsert_node(&self, record: &MemoryRecord) -> Result<()>;

    /// Make `edges` the complete set of out-edges of `from`; all or nothing
    ///
    /// Existing out-edges missing from `edges` are removed along with their
    /// incoming mirror.
    async fn replace_edges(&self, from: MemoryId, edges: &[Relation]) -> Result<()>;

    async fn get_node(&self, id: MemoryId) -> Result<Option<MemoryRecord>>;

    /// Remove a node and every edge touching it
    async fn delete_node(&self, id: MemoryId) -> Result<bool>;

    /// Weighted, depth-bounded walk from `start`; `start` is never a hit
    async fn traverse(&self, start: MemoryId, spec: &TraversalSpec) -> Result<Vec<GraphHit>>;

    /// Nodes with ids strictly after `after`, in id order
    async fn scan_nodes(&self, after: Option<MemoryId>, limit: usize)
        -> Result<Vec<MemoryRecord>>;

    async fn node_count(&self) -> Result<usize>;

    async fn edge_count(&self) -> Result<usize>;
}

/// Vector backend health and size
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorStats {
    pub available: bool,
    pub count: usize,
    pub dimension: usize,
}

/// Graph backend health and size
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphStats {
    pub available: bool,
    pub node_count: usize,
    pub edge_count: usize,
}

/// Timeout-guarded facade over one vector and one graph backend
#[derive(Clone)]
pub struct LongTermStore {
    vector: Arc<dyn VectorBackend>,
    graph: Arc<dyn GraphBackend>,
    timeout: Duration,
}

impl LongTermStore {
    pub fn new(
        vector: Arc<dyn VectorBackend>,
        graph: Arc<dyn GraphBackend>,
        timeout: Duration,
    ) -> Self {
        Self {
            vector,
            graph,
            timeout,
        }
    }

    pub fn dimension(&self) -> usize {
        self.vector.dimension()
    }

    async fn guarded<T>(
        &self,
        backend: Backend,
        op: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(%backend, op, error = %e, "backend call failed");
                Err(match e {
                    MemoryError::Validation(_) | MemoryError::BackendUnavailable { .. } => e,
                    other => MemoryError::unavailable(backend, other.to_string()),
                })
            }
            Err(_) => {
                tracing::warn!(%backend, op, timeout = ?self.timeout, "backend call timed out");
                Err(MemoryError::unavailable(
                    backend,
                    format!("{op} timed out after {:?}", self.timeout),
                ))
            }
        }
    }

    pub async fn upsert_vector(&self, id: MemoryId, vector: &[f32]) -> Result<()> {
        self.guarded(Backend::Vector, "upsert", self.vector.upsert(id, vector))
            .await
    }

    pub async fn search_vector(&self, query: &[f32], k: usize) -> Result<Vec<(MemoryId, f32)>> {
        self.guarded(Backend::Vector, "search", self.vector.search(query, k))
            .await
    }

    pub async fn delete_vector(&self, id: MemoryId) -> Result<bool> {
        self.guarded(Backend::Vector, "delete", self.vector.delete(id))
            .await
    }

    /// Store the node as the authoritative long-term copy
    pub async fn upsert_node(&self, record: &MemoryRecord) -> Result<()> {
        let mut node = record.clone();
        node.tier = Tier::Ltm;
        self.guarded(Backend::Graph, "upsert_node", self.graph.upsert_node(&node))
            .await
    }

    /// Sync the stored out-edges of `from` to `relations`
    pub async fn replace_relations(&self, from: MemoryId, relations: &[Relation]) -> Result<()> {
        self.guarded(
            Backend::Graph,
            "replace_edges",
            self.graph.replace_edges(from, relations),
        )
        .await
    }

    pub async fn get_node(&self, id: MemoryId) -> Result<Option<MemoryRecord>> {
        self.guarded(Backend::Graph, "get_node", self.graph.get_node(id))
            .await
    }

    pub async fn delete_node(&self, id: MemoryId) -> Result<bool> {
        self.guarded(Backend::Graph, "delete_node", self.graph.delete_node(id))
            .await
    }

    pub async fn traverse(&self, start: MemoryId, spec: &TraversalSpec) -> Result<Vec<GraphHit>> {
        self.guarded(Backend::Graph, "traverse", self.graph.traverse(start, spec))
            .await
    }

    pub async fn scan_nodes(
        &self,
        after: Option<MemoryId>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.guarded(
            Backend::Graph,
            "scan_nodes",
            self.graph.scan_nodes(after, limit),
        )
        .await
    }

    /// Remove from the graph (with incident edges), then from the vector index
    ///
    /// Returns whether anything existed in either backend.
    pub async fn delete(&self, id: MemoryId) -> Result<bool> {
        let node = self.delete_node(id).await?;
        let vector = self.delete_vector(id).await?;
        Ok(node || vector)
    }

    pub async fn vector_stats(&self) -> VectorStats {
        let dimension = self.vector.dimension();
        match self
            .guarded(Backend::Vector, "count", self.vector.count())
            .await
        {
            Ok(count) => VectorStats {
                available: true,
                count,
                dimension,
            },
            Err(_) => VectorStats {
                available: false,
                count: 0,
                dimension,
            },
        }
    }

    pub async fn graph_stats(&self) -> GraphStats {
        let nodes = self
            .guarded(Backend::Graph, "node_count", self.graph.node_count())
            .await;
        let edges = self
            .guarded(Backend::Graph, "edge_count", self.graph.edge_count())
            .await;
        match (nodes, edges) {
            (Ok(node_count), Ok(edge_count)) => GraphStats {
                available: true,
                node_count,
                edge_count,
            },
            _ => GraphStats::default(),
        }
    }
}

/// Relation types accepted by a traversal filter
pub(crate) fn type_allowed(filter: &[RelationType], ty: &RelationType) -> bool {
    filter.is_empty() || filter.contains(ty)
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Similarity in [0, 1] from a cosine distance
pub fn similarity_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemoryKind;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);
    }

    #[test]
    fn test_similarity_from_distance_clamps() {
        assert_eq!(similarity_from_distance(2.0), 0.0);
        assert_eq!(similarity_from_distance(-0.1), 1.0);
        assert!((similarity_from_distance(0.25) - 0.75).abs() < 1e-6);
    }

    struct StalledVector;

    #[async_trait]
    impl VectorBackend for StalledVector {
        async fn upsert(&self, _id: MemoryId, _vector: &[f32]) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
        async fn search(&self, _query: &[f32], _k: usize) -> Result<Vec<(MemoryId, f32)>> {
            Err(MemoryError::other("index corrupted"))
        }
        async fn delete(&self, _id: MemoryId) -> Result<bool> {
            Ok(false)
        }
        async fn count(&self) -> Result<usize> {
            Err(MemoryError::other("down"))
        }
        fn dimension(&self) -> usize {
            2
        }
    }

    fn store() -> LongTermStore {
        LongTermStore::new(
            Arc::new(StalledVector),
            Arc::new(InMemoryGraphStore::new()),
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn test_timeout_maps_to_unavailable() {
        let err = store()
            .upsert_vector(MemoryId::new(), &[1.0, 0.0])
            .await
            .unwrap_err();
        assert_eq!(err.backend(), Some(Backend::Vector));
    }

    #[tokio::test]
    async fn test_backend_error_maps_to_unavailable() {
        let err = store().search_vector(&[1.0, 0.0], 3).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_stats_report_unavailable_backend() {
        let ltm = store();
        assert!(!ltm.vector_stats().await.available);
        assert!(ltm.graph_stats().await.available);
    }

    #[tokio::test]
    async fn test_node_stored_as_ltm_tier() {
        let ltm = store();
        let rec = MemoryRecord::builder()
            .content("x")
            .embedding(vec![1.0, 0.0])
            .kind(MemoryKind::Semantic)
            .build()
            .unwrap();
        ltm.upsert_node(&rec).await.unwrap();
        let node = ltm.get_node(rec.id).await.unwrap().unwrap();
        assert_eq!(node.tier, Tier::Ltm);
    }
}
