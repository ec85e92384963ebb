//! Retrieval orchestration
//!
//! Combines three candidate sources into one ranked list:
//!
//! - **Semantic**: oversampled vector search on the query embedding
//! - **Relational**: weighted traversal from the anchor memory
//! - **Cache**: STM copies, preferred over graph nodes when materialising
//!
//! Candidates are merged by id, scored with the composite weights, filtered,
//! sorted deterministically, and truncated. Access bookkeeping runs only for
//! the records actually returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RankingWeights;
use crate::coordinator::Coordinator;
use crate::decay::{strength_at, DecayEngine};
use crate::error::{MemoryError, Result};
use crate::locks::ReadLease;
use crate::ltm::{cosine_similarity, similarity_from_distance, type_allowed, TraversalSpec};
use crate::record::{validate_embedding, MemoryId, MemoryKind, MemoryRecord, RelationType};
use crate::stm::PinGuard;

/// Post-scoring filters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalFilters {
    /// Empty means every kind
    #[serde(default)]
    pub kinds: Vec<MemoryKind>,
    #[serde(default)]
    pub min_importance: Option<f32>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_before: Option<DateTime<Utc>>,
}

impl RetrievalFilters {
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&record.kind) {
            return false;
        }
        if let Some(min) = self.min_importance {
            if record.importance < min {
                return false;
            }
        }
        record
            .temporal
            .created_between(self.created_after, self.created_before)
    }
}

/// A search over the memory core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalQuery {
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub anchor: Option<MemoryId>,
    /// Relation types followed from the anchor; empty means all
    #[serde(default)]
    pub relation_types: Vec<RelationType>,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub filters: RetrievalFilters,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RetrievalQuery {
    pub fn semantic(embedding: Vec<f32>) -> Self {
        Self {
            embedding: Some(embedding),
            ..Default::default()
        }
    }

    pub fn related_to(anchor: MemoryId) -> Self {
        Self {
            anchor: Some(anchor),
            ..Default::default()
        }
    }

    pub fn with_anchor(mut self, anchor: MemoryId) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn with_relation_types(mut self, types: Vec<RelationType>) -> Self {
        self.relation_types = types;
        self
    }

    pub fn with_filters(mut self, filters: RetrievalFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// Per-component contributions before weighting
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub similarity: f32,
    pub relation: f32,
    pub strength: f32,
    pub importance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub record: MemoryRecord,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
}

/// Which source answered, and whether it was healthy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source: String,
    pub available: bool,
    pub candidates: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub memories: Vec<ScoredMemory>,
    /// Assembled from fewer sources than the query asked for
    pub degraded: bool,
    pub sources: Vec<SourceStatus>,
}

/// A merged candidate awaiting scoring
#[derive(Debug, Clone)]
pub struct Candidate {
    pub record: MemoryRecord,
    pub similarity: Option<f32>,
    pub relation: Option<f32>,
}

/// Score, filter, sort, and truncate candidates
///
/// Sorting is by score descending, then more recent access, then smaller
/// id, so equal inputs always rank identically.
pub fn rank_candidates(
    candidates: Vec<Candidate>,
    weights: &RankingWeights,
    filters: &RetrievalFilters,
    strength_of: impl Fn(&MemoryRecord) -> f32,
    limit: usize,
) -> Vec<ScoredMemory> {
    let mut scored: Vec<ScoredMemory> = candidates
        .into_iter()
        .map(|c| {
            let breakdown = ScoreBreakdown {
                similarity: c.similarity.unwrap_or(0.0),
                relation: c.relation.unwrap_or(0.0),
                strength: strength_of(&c.record),
                importance: c.record.normalized_importance(),
            };
            let score = weights.semantic * breakdown.similarity
                + weights.relational * breakdown.relation
                + weights.strength * breakdown.strength
                + weights.importance * breakdown.importance;
            ScoredMemory {
                record: c.record,
                score,
                breakdown,
            }
        })
        .filter(|s| filters.matches(&s.record))
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.record
                    .temporal
                    .last_accessed_at
                    .cmp(&a.record.temporal.last_accessed_at)
            })
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    scored.truncate(limit);
    scored
}

#[derive(Debug, Default, Clone, Copy)]
struct Signals {
    similarity: Option<f32>,
    relation: Option<f32>,
}

/// Candidates plus whatever keeps them alive until ranking is done
///
/// `lost` is set when an id could not be resolved because the graph failed.
#[derive(Default)]
struct Materialised {
    candidates: Vec<Candidate>,
    pins: Vec<PinGuard>,
    leases: Vec<ReadLease>,
    lost: bool,
}

pub struct Retriever {
    coord: Arc<Coordinator>,
    engine: Arc<DecayEngine>,
}

impl Retriever {
    pub fn new(coord: Arc<Coordinator>, engine: Arc<DecayEngine>) -> Self {
        Self { coord, engine }
    }

    pub async fn retrieve(&self, query: RetrievalQuery) -> Result<RetrievalResult> {
        let config = self.coord.config();
        if query.embedding.is_none() && query.anchor.is_none() {
            return Err(MemoryError::validation(
                "query needs an embedding, an anchor, or both",
            ));
        }
        if let Some(embedding) = &query.embedding {
            validate_embedding(embedding, config)?;
        }
        let limit = query.limit.unwrap_or(config.retrieval.default_limit);
        if limit == 0 {
            return Ok(RetrievalResult::default());
        }
        let now = Utc::now();
        let oversampled = limit.saturating_mul(config.retrieval.oversample);
        let spec = TraversalSpec {
            relation_types: query.relation_types.clone(),
            max_depth: query
                .max_depth
                .unwrap_or(config.retrieval.default_max_depth),
            min_weight: config.retrieval.min_edge_weight,
            ..TraversalSpec::default()
        };

        let vector_search = async {
            match &query.embedding {
                Some(e) => Some(self.coord.ltm().search_vector(e, oversampled).await),
                None => None,
            }
        };
        let traversal = async {
            match query.anchor {
                Some(anchor) => Some(self.coord.ltm().traverse(anchor, &spec).await),
                None => None,
            }
        };
        let (vector_result, graph_result) = tokio::join!(vector_search, traversal);

        let mut signals: HashMap<MemoryId, Signals> = HashMap::new();
        let mut sources = Vec::new();
        let mut degraded = false;
        let mut graph_down = false;

        match vector_result {
            Some(Ok(hits)) => {
                sources.push(SourceStatus {
                    source: "vector".into(),
                    available: true,
                    candidates: hits.len(),
                });
                for (id, distance) in hits {
                    signals.entry(id).or_default().similarity =
                        Some(similarity_from_distance(distance));
                }
            }
            Some(Err(e)) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                degraded = true;
                sources.push(SourceStatus {
                    source: "vector".into(),
                    available: false,
                    candidates: 0,
                });
                if query.anchor.is_none() {
                    if let Some(embedding) = &query.embedding {
                        let fallback = self.cache_similarity(embedding, oversampled);
                        sources.push(SourceStatus {
                            source: "cache".into(),
                            available: true,
                            candidates: fallback.len(),
                        });
                        if fallback.is_empty() {
                            return Err(e);
                        }
                        for (id, similarity) in fallback {
                            signals.entry(id).or_default().similarity = Some(similarity);
                        }
                    }
                }
            }
            None => {}
        }

        match graph_result {
            Some(Ok(hits)) => {
                sources.push(SourceStatus {
                    source: "graph".into(),
                    available: true,
                    candidates: hits.len(),
                });
                for hit in hits {
                    let entry = signals.entry(hit.id).or_default();
                    entry.relation = Some(entry.relation.map_or(hit.weight, |w| w.max(hit.weight)));
                }
            }
            Some(Err(e)) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                degraded = true;
                graph_down = true;
                sources.push(SourceStatus {
                    source: "graph".into(),
                    available: false,
                    candidates: 0,
                });
                let fallback = query
                    .anchor
                    .map(|a| self.cached_relations(a, &spec))
                    .unwrap_or_default();
                sources.push(SourceStatus {
                    source: "cache".into(),
                    available: true,
                    candidates: fallback.len(),
                });
                let vector_failed = sources
                    .iter()
                    .any(|s| s.source == "vector" && !s.available);
                let vector_asked = query.embedding.is_some();
                if fallback.is_empty() && (!vector_asked || vector_failed) {
                    return Err(e);
                }
                for (id, weight) in fallback {
                    signals.entry(id).or_default().relation = Some(weight);
                }
            }
            None => {}
        }

        if let Some(anchor) = query.anchor {
            signals.remove(&anchor);
        }

        let Materialised {
            candidates,
            pins,
            leases,
            lost,
        } = self.materialise(signals, graph_down).await;
        if lost && !graph_down {
            degraded = true;
        }

        let decay_config = config.decay.clone();
        let ranked = rank_candidates(
            candidates,
            &config.retrieval.weights,
            &query.filters,
            |r| strength_at(r, now, &decay_config),
            limit,
        );

        let mut memories = Vec::with_capacity(ranked.len());
        for mut scored in ranked {
            match self.engine.record_access(scored.record.id, now).await {
                Ok(Some(updated)) => scored.record = updated,
                Ok(None) => {
                    tracing::debug!(memory_id = %scored.record.id, "deleted during retrieval");
                    continue;
                }
                Err(e) => {
                    tracing::debug!(memory_id = %scored.record.id, error = %e, "access bookkeeping failed");
                }
            }
            memories.push(scored);
        }
        drop(pins);
        drop(leases);

        // Expanding from an anchor counts as touching it
        if let Some(anchor) = query.anchor {
            let _guard = self.coord.locks.lock(&anchor).await;
            self.coord.stm().touch(&anchor, now);
        }

        tracing::debug!(
            results = memories.len(),
            degraded,
            anchor = ?query.anchor,
            "retrieval complete"
        );
        Ok(RetrievalResult {
            memories,
            degraded,
            sources,
        })
    }

    /// Resolve candidate ids to records
    ///
    /// Cached candidates are pinned and long-term ones leased, so neither
    /// eviction nor the decay sweep removes them until the query finishes.
    async fn materialise(
        &self,
        signals: HashMap<MemoryId, Signals>,
        graph_down: bool,
    ) -> Materialised {
        let stm = self.coord.stm();
        let mut ordered: Vec<(MemoryId, Signals)> = signals.into_iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Materialised {
            candidates: Vec::with_capacity(ordered.len()),
            ..Materialised::default()
        };
        for (id, s) in ordered {
            let record = match stm.pin(&id) {
                Some(pin) => {
                    out.pins.push(pin);
                    stm.peek(&id)
                }
                None if graph_down => None,
                None => {
                    let lease = self.coord.reads.acquire(id);
                    match self.coord.ltm().get_node(id).await {
                        Ok(Some(node)) => {
                            out.leases.push(lease);
                            Some(node)
                        }
                        Ok(None) => None,
                        Err(e) => {
                            tracing::debug!(memory_id = %id, error = %e, "candidate dropped");
                            out.lost = true;
                            None
                        }
                    }
                }
            };
            match record {
                Some(record) => out.candidates.push(Candidate {
                    record,
                    similarity: s.similarity,
                    relation: s.relation,
                }),
                None => tracing::debug!(memory_id = %id, "candidate not materialised"),
            }
        }
        out
    }

    /// Cosine scan over cached records, for when the vector backend is down
    fn cache_similarity(&self, query: &[f32], limit: usize) -> Vec<(MemoryId, f32)> {
        let mut scored: Vec<(MemoryId, f32)> = self
            .coord
            .stm()
            .snapshot()
            .into_iter()
            .map(|r| (r.id, cosine_similarity(query, &r.embedding).clamp(0.0, 1.0)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(limit);
        scored
    }

    /// One-hop relations of a cached anchor, for when the graph is down
    fn cached_relations(&self, anchor: MemoryId, spec: &TraversalSpec) -> Vec<(MemoryId, f32)> {
        let Some(record) = self.coord.stm().peek(&anchor) else {
            return Vec::new();
        };
        record
            .relations
            .iter()
            .filter(|r| r.weight >= spec.min_weight)
            .filter(|r| type_allowed(&spec.relation_types, &r.relation_type))
            .map(|r| (r.target, r.weight))
            .collect()
    }
}
