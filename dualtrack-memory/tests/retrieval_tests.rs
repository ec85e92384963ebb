//! Ranking, anchor queries, and degraded retrieval

mod common;

use std::time::Duration;

use common::{config, embedding, harness, memory};
use dualtrack_memory::{
    Backend, MemoryError, MemoryKind, NewMemory, RelationType, RetrievalFilters, RetrievalQuery,
};

async fn seeded() -> (common::Harness, Vec<dualtrack_memory::MemoryId>) {
    let h = harness(config());
    let mut ids = Vec::new();
    for (i, tilt) in [0.0f32, 0.5, 1.5].into_iter().enumerate() {
        let id = h
            .system
            .create_memory(NewMemory::new(
                format!("axis zero, tilt {i}"),
                embedding(0, tilt),
                MemoryKind::Semantic,
            ))
            .await
            .unwrap();
        ids.push(id);
    }
    let far = h
        .system
        .create_memory(NewMemory::new("orthogonal", embedding(2, 0.0), MemoryKind::Semantic))
        .await
        .unwrap();
    ids.push(far);
    (h, ids)
}

#[tokio::test]
async fn test_semantic_ranking_is_deterministic() {
    let (h, ids) = seeded().await;
    let query = RetrievalQuery::semantic(embedding(0, 0.0)).with_limit(4);

    let first = h.system.search_memories(query.clone()).await.unwrap();
    let second = h.system.search_memories(query).await.unwrap();

    let order = |r: &dualtrack_memory::RetrievalResult| {
        r.memories.iter().map(|m| m.record.id).collect::<Vec<_>>()
    };
    assert_eq!(order(&first), ids);
    assert_eq!(order(&first), order(&second));
    assert!(first.memories.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(!first.degraded);
}

#[tokio::test]
async fn test_limit_truncates() {
    let (h, ids) = seeded().await;
    let result = h
        .system
        .search_memories(RetrievalQuery::semantic(embedding(0, 0.0)).with_limit(2))
        .await
        .unwrap();
    assert_eq!(result.memories.len(), 2);
    assert_eq!(result.memories[0].record.id, ids[0]);
}

#[tokio::test]
async fn test_query_needs_embedding_or_anchor() {
    let h = harness(config());
    assert!(matches!(
        h.system.search_memories(RetrievalQuery::default()).await,
        Err(MemoryError::Validation(_))
    ));
    assert!(matches!(
        h.system
            .search_memories(RetrievalQuery::semantic(vec![1.0]))
            .await,
        Err(MemoryError::Validation(_))
    ));
}

#[tokio::test]
async fn test_filters_apply_after_scoring() {
    let h = harness(config());
    h.system
        .create_memory(memory("minor", MemoryKind::Episodic, 2.0))
        .await
        .unwrap();
    let major = h
        .system
        .create_memory(memory("major", MemoryKind::Semantic, 9.0))
        .await
        .unwrap();

    let query = RetrievalQuery::semantic(embedding(0, 0.0)).with_filters(RetrievalFilters {
        kinds: vec![MemoryKind::Semantic],
        min_importance: Some(5.0),
        ..Default::default()
    });
    let result = h.system.search_memories(query).await.unwrap();
    assert_eq!(result.memories.len(), 1);
    assert_eq!(result.memories[0].record.id, major);
}

#[tokio::test]
async fn test_anchor_only_has_no_semantic_term() {
    let h = harness(config());
    let hub = h
        .system
        .create_memory(memory("hub", MemoryKind::Semantic, 5.0))
        .await
        .unwrap();
    for i in 0..3 {
        h.system
            .create_memory(
                memory(&format!("spoke {i}"), MemoryKind::Semantic, 5.0).relation(
                    hub,
                    RelationType::part_of(),
                    0.3 + 0.2 * i as f32,
                ),
            )
            .await
            .unwrap();
    }

    let result = h.system.get_related(hub, Some(1), vec![], None).await.unwrap();
    assert_eq!(result.memories.len(), 3);
    assert!(result.memories.iter().all(|m| m.breakdown.similarity == 0.0));
    assert!(result.memories.iter().all(|m| m.record.id != hub));
    let weights: Vec<f32> = result.memories.iter().map(|m| m.breakdown.relation).collect();
    assert!(weights.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn test_multi_hop_weight_is_product() {
    let h = harness(config());
    let a = h
        .system
        .create_memory(memory("a", MemoryKind::Procedural, 5.0))
        .await
        .unwrap();
    let b = h
        .system
        .create_memory(
            memory("b", MemoryKind::Procedural, 5.0).relation(a, RelationType::leads_to(), 0.5),
        )
        .await
        .unwrap();
    let c = h
        .system
        .create_memory(
            memory("c", MemoryKind::Procedural, 5.0).relation(b, RelationType::leads_to(), 0.6),
        )
        .await
        .unwrap();

    let shallow = h.system.get_related(c, Some(1), vec![], None).await.unwrap();
    assert_eq!(shallow.memories.len(), 1);

    let deep = h.system.get_related(c, Some(2), vec![], None).await.unwrap();
    let to_a = deep.memories.iter().find(|m| m.record.id == a).unwrap();
    assert!((to_a.breakdown.relation - 0.3).abs() < 1e-6);
}

#[tokio::test]
async fn test_vector_timeout_degrades_to_graph() {
    common::init_tracing();
    let h = harness(config());
    let anchor = h
        .system
        .create_memory(memory("anchor", MemoryKind::Semantic, 5.0))
        .await
        .unwrap();
    let neighbour = h
        .system
        .create_memory(
            memory("neighbour", MemoryKind::Semantic, 5.0).relation(
                anchor,
                RelationType::similar_to(),
                0.8,
            ),
        )
        .await
        .unwrap();

    h.vector.set_delay(Duration::from_millis(400));
    let query = RetrievalQuery::semantic(embedding(0, 0.0)).with_anchor(anchor);
    let result = h.system.search_memories(query).await.unwrap();

    assert!(result.degraded);
    assert_eq!(result.memories.len(), 1);
    assert_eq!(result.memories[0].record.id, neighbour);
    assert_eq!(result.memories[0].breakdown.similarity, 0.0);
    assert!(result
        .sources
        .iter()
        .any(|s| s.source == "vector" && !s.available));
}

#[tokio::test]
async fn test_graph_outage_keeps_vector_results() {
    let (h, ids) = seeded().await;
    h.graph.set_down(true);

    let query = RetrievalQuery::semantic(embedding(0, 0.0)).with_anchor(ids[3]);
    let result = h.system.search_memories(query).await.unwrap();
    assert!(result.degraded);
    assert!(result.memories.iter().any(|m| m.record.id == ids[0]));
    assert!(result.memories.iter().all(|m| m.record.id != ids[3]));
}

#[tokio::test]
async fn test_vector_outage_without_anchor_scans_cache() {
    let (h, ids) = seeded().await;
    h.vector.set_down(true);

    let result = h
        .system
        .search_memories(RetrievalQuery::semantic(embedding(0, 0.0)))
        .await
        .unwrap();
    assert!(result.degraded);
    assert_eq!(result.memories[0].record.id, ids[0]);
}

#[tokio::test]
async fn test_both_backends_down_is_an_error() {
    let h = harness(config());
    let anchor = h
        .system
        .create_memory(memory("lonely", MemoryKind::Semantic, 5.0))
        .await
        .unwrap();
    h.vector.set_down(true);
    h.graph.set_down(true);

    let query = RetrievalQuery::semantic(embedding(0, 0.0)).with_anchor(anchor);
    match h.system.search_memories(query).await {
        Err(MemoryError::BackendUnavailable { backend, .. }) => {
            assert!(matches!(backend, Backend::Vector | Backend::Graph))
        }
        other => panic!("expected BackendUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_retrieval_records_access() {
    let (h, ids) = seeded().await;
    let before = h.system.coordinator().stm().peek(&ids[0]).unwrap();

    h.system
        .search_memories(RetrievalQuery::semantic(embedding(0, 0.0)).with_limit(1))
        .await
        .unwrap();

    let after = h.system.coordinator().stm().peek(&ids[0]).unwrap();
    assert_eq!(after.temporal.access_count, before.temporal.access_count + 1);
    assert!(after.strength > before.strength);

    let untouched = h.system.coordinator().stm().peek(&ids[1]).unwrap();
    assert_eq!(untouched.temporal.access_count, 0);
}
