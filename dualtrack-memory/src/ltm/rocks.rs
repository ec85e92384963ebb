//! RocksDB storage with HNSW indexing
//!
//! One database backs both long-term capabilities:
//!
//! - `vec:{id}` holds bincode vectors, mirrored into an instant-distance HNSW
//!   index for O(log n) search
//! - `node:{id}` holds the record as JSON (metadata values are schemaless)
//! - `edge:out:{from}:{to}:{type}` and `edge:in:{to}:{from}:{type}` hold each
//!   relation once per direction so reverse traversal is a prefix scan

use async_trait::async_trait;
use dashmap::DashMap;
use instant_distance::{Builder, HnswMap, Point, Search};
use parking_lot::RwLock;
use rocksdb::{Direction as ScanDirection, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MemoryError, Result};
use crate::ltm::graph::{bounded_traverse, Direction, GraphHit, Neighbour, TraversalSpec};
use crate::ltm::{cosine_similarity, GraphBackend, VectorBackend};
use crate::record::{MemoryId, MemoryRecord, Relation, RelationType};

/// HNSW point wrapper for semantic search
#[derive(Clone)]
struct VectorPoint {
    vector: Vec<f32>,
}

impl Point for VectorPoint {
    fn distance(&self, other: &Self) -> f32 {
        // Cosine distance = 1 - similarity (HNSW finds minimum)
        1.0 - cosine_similarity(&self.vector, &other.vector)
    }
}

/// HNSW index wrapper
struct HnswIndex {
    hnsw: HnswMap<VectorPoint, MemoryId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeRecord {
    from: MemoryId,
    to: MemoryId,
    relation_type: RelationType,
    weight: f32,
}

fn vec_key(id: MemoryId) -> String {
    format!("vec:{}", id)
}

fn node_key(id: MemoryId) -> String {
    format!("node:{}", id)
}

fn out_prefix(id: MemoryId) -> String {
    format!("edge:out:{}:", id)
}

fn in_prefix(id: MemoryId) -> String {
    format!("edge:in:{}:", id)
}

fn out_key(from: MemoryId, to: MemoryId, ty: &RelationType) -> String {
    format!("edge:out:{}:{}:{}", from, to, ty)
}

fn in_key(to: MemoryId, from: MemoryId, ty: &RelationType) -> String {
    format!("edge:in:{}:{}:{}", to, from, ty)
}

/// RocksDB-based vector and graph store
pub struct RocksStore {
    db: Arc<DB>,
    dimension: usize,
    vector_cache: DashMap<MemoryId, Vec<f32>>,
    hnsw_index: RwLock<Option<HnswIndex>>,
    index_stale: AtomicBool,
}

impl RocksStore {
    /// Open (or create) a store at the given path
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        crate::migration::ensure_schema(&db)?;

        tracing::info!(path = %path.display(), "RocksStore opened");

        let store = Self {
            db: Arc::new(db),
            dimension,
            vector_cache: DashMap::new(),
            hnsw_index: RwLock::new(None),
            index_stale: AtomicBool::new(false),
        };
        store.load_vectors()?;
        Ok(store)
    }

    /// Load persisted vectors into the in-memory mirror
    fn load_vectors(&self) -> Result<()> {
        let mut skipped = 0;
        for (key, value) in self.scan_prefix("vec:")? {
            let key_str = String::from_utf8_lossy(&key);
            let Some(id) = key_str
                .strip_prefix("vec:")
                .and_then(|s| s.parse::<MemoryId>().ok())
            else {
                skipped += 1;
                continue;
            };
            match bincode::deserialize::<Vec<f32>>(&value) {
                Ok(vector) if vector.len() == self.dimension => {
                    self.vector_cache.insert(id, vector);
                }
                Ok(vector) => {
                    tracing::warn!(
                        memory_id = %id,
                        found = vector.len(),
                        expected = self.dimension,
                        "skipping vector with wrong dimension"
                    );
                    skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(memory_id = %id, error = %e, "failed to deserialize vector");
                    skipped += 1;
                }
            }
        }

        if !self.vector_cache.is_empty() {
            tracing::info!(count = self.vector_cache.len(), "loaded vectors from disk");
            self.rebuild_hnsw_index();
        }
        if skipped > 0 {
            tracing::warn!(skipped, "skipped unreadable vector entries");
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        self.scan_from(prefix, prefix, usize::MAX)
    }

    /// Entries under `prefix` starting at key `start`
    fn scan_from(
        &self,
        prefix: &str,
        start: &str,
        limit: usize,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(start.as_bytes(), ScanDirection::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) || out.len() >= limit {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    fn edges_with_prefix(&self, prefix: &str) -> Result<Vec<EdgeRecord>> {
        self.scan_prefix(prefix)?
            .into_iter()
            .map(|(_, value)| bincode::deserialize::<EdgeRecord>(&value).map_err(Into::into))
            .collect()
    }

    fn read_node(&self, id: MemoryId) -> Result<Option<MemoryRecord>> {
        match self.db.get(node_key(id).as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn neighbours(&self, id: MemoryId, direction: Direction) -> Result<Vec<Neighbour>> {
        let mut out = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            out.extend(self.edges_with_prefix(&out_prefix(id))?.into_iter().map(|e| {
                Neighbour {
                    id: e.to,
                    weight: e.weight,
                    relation_type: e.relation_type,
                }
            }));
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            out.extend(self.edges_with_prefix(&in_prefix(id))?.into_iter().map(|e| {
                Neighbour {
                    id: e.from,
                    weight: e.weight,
                    relation_type: e.relation_type,
                }
            }));
        }
        Ok(out)
    }

    /// Semantic search using HNSW
    fn semantic_search(&self, query: &[f32], limit: usize) -> Vec<(MemoryId, f32)> {
        if self.index_stale.swap(false, Ordering::SeqCst) {
            self.rebuild_hnsw_index();
        }

        let index_guard = self.hnsw_index.read();
        let index = match index_guard.as_ref() {
            Some(idx) if limit < self.vector_cache.len() => idx,
            _ => return self.linear_search(query, limit),
        };

        let query_point = VectorPoint {
            vector: query.to_vec(),
        };
        let mut search = Search::default();
        index
            .hnsw
            .search(&query_point, &mut search)
            .take(limit)
            .map(|item| (*item.value, item.distance))
            .collect()
    }

    /// Linear search fallback
    fn linear_search(&self, query: &[f32], limit: usize) -> Vec<(MemoryId, f32)> {
        let mut results: Vec<(MemoryId, f32)> = self
            .vector_cache
            .iter()
            .map(|entry| (*entry.key(), 1.0 - cosine_similarity(query, entry.value())))
            .collect();

        results.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(limit);
        results
    }

    /// Rebuild HNSW index from the vector mirror
    fn rebuild_hnsw_index(&self) {
        let (points, values): (Vec<VectorPoint>, Vec<MemoryId>) = self
            .vector_cache
            .iter()
            .map(|e| {
                (
                    VectorPoint {
                        vector: e.value().clone(),
                    },
                    *e.key(),
                )
            })
            .unzip();

        if points.is_empty() {
            *self.hnsw_index.write() = None;
            return;
        }

        let hnsw = Builder::default().ef_construction(100).build(points, values);
        *self.hnsw_index.write() = Some(HnswIndex { hnsw });
        tracing::debug!(points = self.vector_cache.len(), "rebuilt HNSW index");
    }

    fn check_dimension(&self, len: usize) -> Result<()> {
        if len != self.dimension {
            return Err(MemoryError::validation(format!(
                "vector dimension {} does not match index dimension {}",
                len, self.dimension
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorBackend for RocksStore {
    async fn upsert(&self, id: MemoryId, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector.len())?;
        self.db
            .put(vec_key(id).as_bytes(), bincode::serialize(vector)?)?;
        self.vector_cache.insert(id, vector.to_vec());
        self.index_stale.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<(MemoryId, f32)>> {
        self.check_dimension(query.len())?;
        Ok(self.semantic_search(query, k))
    }

    async fn delete(&self, id: MemoryId) -> Result<bool> {
        self.db.delete(vec_key(id).as_bytes())?;
        let removed = self.vector_cache.remove(&id).is_some();
        if removed {
            self.index_stale.store(true, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.vector_cache.len())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[async_trait]
impl GraphBackend for RocksStore {
    async fn upsert_node(&self, record: &MemoryRecord) -> Result<()> {
        self.db
            .put(node_key(record.id).as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    async fn replace_edges(&self, from: MemoryId, edges: &[Relation]) -> Result<()> {
        let mut batch = WriteBatch::default();
        // Later puts in the batch win over these deletes
        for edge in self.edges_with_prefix(&out_prefix(from))? {
            batch.delete(out_key(from, edge.to, &edge.relation_type).as_bytes());
            batch.delete(in_key(edge.to, from, &edge.relation_type).as_bytes());
        }
        for rel in edges {
            let edge = EdgeRecord {
                from,
                to: rel.target,
                relation_type: rel.relation_type.clone(),
                weight: rel.weight,
            };
            let bytes = bincode::serialize(&edge)?;
            batch.put(out_key(from, rel.target, &rel.relation_type).as_bytes(), &bytes);
            batch.put(in_key(rel.target, from, &rel.relation_type).as_bytes(), &bytes);
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn get_node(&self, id: MemoryId) -> Result<Option<MemoryRecord>> {
        self.read_node(id)
    }

    async fn delete_node(&self, id: MemoryId) -> Result<bool> {
        let mut batch = WriteBatch::default();
        let mut existed = self.db.get(node_key(id).as_bytes())?.is_some();
        batch.delete(node_key(id).as_bytes());

        for edge in self.edges_with_prefix(&out_prefix(id))? {
            batch.delete(out_key(id, edge.to, &edge.relation_type).as_bytes());
            batch.delete(in_key(edge.to, id, &edge.relation_type).as_bytes());
        }

        let mut sources: HashMap<MemoryId, MemoryRecord> = HashMap::new();
        for edge in self.edges_with_prefix(&in_prefix(id))? {
            existed = true;
            batch.delete(in_key(id, edge.from, &edge.relation_type).as_bytes());
            batch.delete(out_key(edge.from, id, &edge.relation_type).as_bytes());
            if !sources.contains_key(&edge.from) {
                if let Some(node) = self.read_node(edge.from)? {
                    sources.insert(edge.from, node);
                }
            }
        }
        for (source_id, mut node) in sources {
            node.relations.retain(|r| r.target != id);
            batch.put(node_key(source_id).as_bytes(), serde_json::to_vec(&node)?);
        }

        self.db.write(batch)?;
        Ok(existed)
    }

    async fn traverse(&self, start: MemoryId, spec: &TraversalSpec) -> Result<Vec<GraphHit>> {
        let mut failure: Option<MemoryError> = None;
        let hits = bounded_traverse(
            start,
            spec,
            |id, direction| match self.neighbours(id, direction) {
                Ok(n) => n,
                Err(e) => {
                    failure.get_or_insert(e);
                    Vec::new()
                }
            },
            |id| self.read_node(id).ok().flatten().map(|n| n.importance),
        );
        match failure {
            Some(e) => Err(e),
            None => Ok(hits),
        }
    }

    async fn scan_nodes(
        &self,
        after: Option<MemoryId>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let start = match after {
            Some(id) => node_key(id),
            None => "node:".to_string(),
        };
        let mut records = Vec::new();
        for (key, value) in self.scan_from("node:", &start, limit.saturating_add(1))? {
            if after.is_some() && key.as_ref() == start.as_bytes() {
                continue;
            }
            if records.len() >= limit {
                break;
            }
            match serde_json::from_slice::<MemoryRecord>(&value) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %e,
                        "skipping unreadable node"
                    );
                }
            }
        }
        Ok(records)
    }

    async fn node_count(&self) -> Result<usize> {
        Ok(self.scan_prefix("node:")?.len())
    }

    async fn edge_count(&self) -> Result<usize> {
        Ok(self.scan_prefix("edge:out:")?.len())
    }
}
