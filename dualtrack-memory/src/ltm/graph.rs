//! Weighted, depth-bounded traversal shared by the graph engines
//!
//! A path scores the product of its edge weights. Since weights never exceed
//! 1, revisiting a node through a cycle cannot beat the path that first
//! reached it, so keeping the best (weight, depth) per node and only
//! expanding nodes that improved at the current depth terminates.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::ltm::type_allowed;
use crate::record::{MemoryId, RelationType};

/// Which stored edges a traversal follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalSpec {
    /// Empty means every relation type
    pub relation_types: Vec<RelationType>,
    pub max_depth: usize,
    /// Edges lighter than this are not followed
    pub min_weight: f32,
    pub direction: Direction,
}

impl Default for TraversalSpec {
    fn default() -> Self {
        Self {
            relation_types: Vec::new(),
            max_depth: 2,
            min_weight: 0.1,
            direction: Direction::Both,
        }
    }
}

/// Best path found to one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphHit {
    pub id: MemoryId,
    /// Product of edge weights along the path
    pub weight: f32,
    /// Number of hops
    pub depth: usize,
    /// Type of the last edge on the path
    pub via: RelationType,
    /// Target importance, used only to break ties
    pub importance: f32,
}

/// One edge as seen from the node being expanded
#[derive(Debug, Clone)]
pub struct Neighbour {
    pub id: MemoryId,
    pub weight: f32,
    pub relation_type: RelationType,
}

/// Run the traversal over any adjacency source
///
/// `neighbours(id, direction)` lists edges of `id` in the requested
/// direction; `importance(id)` is consulted once per hit for ordering.
pub fn bounded_traverse<N, I>(
    start: MemoryId,
    spec: &TraversalSpec,
    mut neighbours: N,
    importance: I,
) -> Vec<GraphHit>
where
    N: FnMut(MemoryId, Direction) -> Vec<Neighbour>,
    I: Fn(MemoryId) -> Option<f32>,
{
    let mut best: HashMap<MemoryId, (f32, usize, RelationType)> = HashMap::new();
    let mut frontier: Vec<(MemoryId, f32)> = vec![(start, 1.0)];

    for depth in 1..=spec.max_depth {
        let mut next = Vec::new();
        for (node, path_weight) in frontier.drain(..) {
            for edge in neighbours(node, spec.direction) {
                if edge.id == start
                    || edge.weight < spec.min_weight
                    || !type_allowed(&spec.relation_types, &edge.relation_type)
                {
                    continue;
                }
                let weight = path_weight * edge.weight;
                let improved = match best.get(&edge.id) {
                    None => true,
                    Some((w, _, _)) => weight > *w,
                };
                if improved {
                    best.insert(edge.id, (weight, depth, edge.relation_type.clone()));
                    next.push((edge.id, weight));
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    let mut hits: Vec<GraphHit> = best
        .into_iter()
        .map(|(id, (weight, depth, via))| GraphHit {
            id,
            weight,
            depth,
            via,
            importance: importance(id).unwrap_or(0.0),
        })
        .collect();
    sort_hits(&mut hits);
    hits
}

/// Weight desc, then fewer hops, then higher importance, then id
pub fn sort_hits(hits: &mut [GraphHit]) {
    hits.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.depth.cmp(&b.depth))
            .then_with(|| {
                b.importance
                    .partial_cmp(&a.importance)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
}
