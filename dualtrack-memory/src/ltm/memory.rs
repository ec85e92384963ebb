//! In-process reference engines
//!
//! Used by tests and by embedders that do not need persistence.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::error::{MemoryError, Result};
use crate::ltm::graph::{bounded_traverse, Direction, GraphHit, Neighbour, TraversalSpec};
use crate::ltm::{cosine_similarity, GraphBackend, VectorBackend};
use crate::record::{MemoryId, MemoryRecord, Relation, RelationType};

/// Flat cosine scan over a concurrent map
pub struct InMemoryVectorStore {
    dimension: usize,
    vectors: DashMap<MemoryId, Vec<f32>>,
}

impl InMemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: DashMap::new(),
        }
    }
}

#[async_trait]
impl VectorBackend for InMemoryVectorStore {
    async fn upsert(&self, id: MemoryId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(MemoryError::validation(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dimension
            )));
        }
        self.vectors.insert(id, vector.to_vec());
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<(MemoryId, f32)>> {
        if query.len() != self.dimension {
            return Err(MemoryError::validation(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dimension
            )));
        }
        let mut results: Vec<(MemoryId, f32)> = self
            .vectors
            .iter()
            .map(|e| (*e.key(), 1.0 - cosine_similarity(query, e.value())))
            .collect();
        results.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(k);
        Ok(results)
    }

    async fn delete(&self, id: MemoryId) -> Result<bool> {
        Ok(self.vectors.remove(&id).is_some())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.vectors.len())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

type EdgeKey = (MemoryId, RelationType);

#[derive(Default)]
struct GraphState {
    nodes: BTreeMap<MemoryId, MemoryRecord>,
    /// from -> (to, type) -> weight
    out_edges: HashMap<MemoryId, BTreeMap<EdgeKey, f32>>,
    /// to -> (from, type) -> weight
    in_edges: HashMap<MemoryId, BTreeMap<EdgeKey, f32>>,
}

impl GraphState {
    fn neighbours(&self, id: MemoryId, direction: Direction) -> Vec<Neighbour> {
        let mut out = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            if let Some(edges) = self.out_edges.get(&id) {
                out.extend(edges.iter().map(|((to, ty), w)| Neighbour {
                    id: *to,
                    weight: *w,
                    relation_type: ty.clone(),
                }));
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            if let Some(edges) = self.in_edges.get(&id) {
                out.extend(edges.iter().map(|((from, ty), w)| Neighbour {
                    id: *from,
                    weight: *w,
                    relation_type: ty.clone(),
                }));
            }
        }
        out
    }
}

/// Node map plus out/in adjacency under one lock
///
/// Edge batches are applied under a single write guard, so readers never see
/// half of a batch.
#[derive(Default)]
pub struct InMemoryGraphStore {
    state: RwLock<GraphState>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphBackend for InMemoryGraphStore {
    async fn upsert_node(&self, record: &MemoryRecord) -> Result<()> {
        self.state.write().nodes.insert(record.id, record.clone());
        Ok(())
    }

    async fn replace_edges(&self, from: MemoryId, edges: &[Relation]) -> Result<()> {
        let mut state = self.state.write();
        if let Some(outgoing) = state.out_edges.remove(&from) {
            for (to, ty) in outgoing.into_keys() {
                if let Some(incoming) = state.in_edges.get_mut(&to) {
                    incoming.remove(&(from, ty));
                }
            }
        }
        for rel in edges {
            state
                .out_edges
                .entry(from)
                .or_default()
                .insert((rel.target, rel.relation_type.clone()), rel.weight);
            state
                .in_edges
                .entry(rel.target)
                .or_default()
                .insert((from, rel.relation_type.clone()), rel.weight);
        }
        Ok(())
    }

    async fn get_node(&self, id: MemoryId) -> Result<Option<MemoryRecord>> {
        Ok(self.state.read().nodes.get(&id).cloned())
    }

    async fn delete_node(&self, id: MemoryId) -> Result<bool> {
        let mut state = self.state.write();
        let existed = state.nodes.remove(&id).is_some();

        if let Some(outgoing) = state.out_edges.remove(&id) {
            for (to, ty) in outgoing.into_keys() {
                if let Some(incoming) = state.in_edges.get_mut(&to) {
                    incoming.remove(&(id, ty));
                }
            }
        }
        let mut edges_removed = false;
        if let Some(incoming) = state.in_edges.remove(&id) {
            for (from, ty) in incoming.into_keys() {
                edges_removed = true;
                if let Some(outgoing) = state.out_edges.get_mut(&from) {
                    outgoing.remove(&(id, ty));
                }
                if let Some(node) = state.nodes.get_mut(&from) {
                    node.relations.retain(|r| r.target != id);
                }
            }
        }
        Ok(existed || edges_removed)
    }

    async fn traverse(&self, start: MemoryId, spec: &TraversalSpec) -> Result<Vec<GraphHit>> {
        let state = self.state.read();
        Ok(bounded_traverse(
            start,
            spec,
            |id, direction| state.neighbours(id, direction),
            |id| state.nodes.get(&id).map(|n| n.importance),
        ))
    }

    async fn scan_nodes(
        &self,
        after: Option<MemoryId>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let state = self.state.read();
        let records = match after {
            Some(after) => state
                .nodes
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(limit)
                .map(|(_, r)| r.clone())
                .collect(),
            None => state.nodes.values().take(limit).cloned().collect(),
        };
        Ok(records)
    }

    async fn node_count(&self) -> Result<usize> {
        Ok(self.state.read().nodes.len())
    }

    async fn edge_count(&self) -> Result<usize> {
        Ok(self.state.read().out_edges.values().map(|e| e.len()).sum())
    }
}
