//! Backend outages: repair, degraded records, and delete ordering

mod common;

use std::time::Duration;

use common::{config, config_with_capacity, harness, memory};
use dualtrack_memory::{
    Backend, DeleteOutcome, LtmConfig, MemoryConfig, MemoryError, MemoryKind, MemoryPatch,
    MemoryStatus, RetrievalQuery, Tier,
};

/// One cache slot and a timeout generous enough for injected latency
fn single_slot() -> MemoryConfig {
    MemoryConfig {
        ltm: LtmConfig {
            backend_timeout: Duration::from_millis(500),
        },
        ..config_with_capacity(1)
    }
}

#[tokio::test]
async fn test_write_during_outage_is_repaired() {
    common::init_tracing();
    let h = harness(config());
    h.graph.set_down(true);

    let id = h
        .system
        .create_memory(memory("written during outage", MemoryKind::Semantic, 6.0))
        .await
        .unwrap();
    let coord = h.system.coordinator();
    assert_eq!(coord.pending_repairs(), 1);
    assert_eq!(coord.repair_missing(&id), Some(vec![Backend::Graph]));
    assert_eq!(coord.stm().peek(&id).unwrap().tier, Tier::Stm);

    h.graph.set_down(false);
    assert_eq!(h.system.run_repairs().await, 1);

    let stats = h.system.report_storage_stats().await;
    assert_eq!(stats.repair.pending, 0);
    assert_eq!(stats.repair.repaired, 1);
    assert_eq!(coord.stm().peek(&id).unwrap().tier, Tier::Both);
    assert!(coord.ltm().get_node(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_repair_gives_up_and_marks_degraded() {
    let h = harness(config());
    h.vector.set_down(true);

    let id = h
        .system
        .create_memory(memory("never indexed", MemoryKind::Semantic, 6.0))
        .await
        .unwrap();

    for _ in 0..h.system.config().repair.max_attempts {
        assert_eq!(h.system.run_repairs().await, 0);
    }

    let coord = h.system.coordinator();
    let stats = coord.repair_stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.degraded, 1);
    let entry = coord.stm().entry(&id).unwrap();
    assert_eq!(entry.record.status, MemoryStatus::Degraded);
    assert!(entry.needs_flush());
}

#[tokio::test]
async fn test_degraded_record_is_not_evicted() {
    let h = harness(config_with_capacity(2));
    h.vector.set_down(true);
    let stuck = h
        .system
        .create_memory(memory("stuck", MemoryKind::Semantic, 1.0))
        .await
        .unwrap();
    for _ in 0..h.system.config().repair.max_attempts {
        h.system.run_repairs().await;
    }
    h.vector.set_down(false);

    for i in 0..3 {
        h.system
            .create_memory(memory(&format!("filler {i}"), MemoryKind::Semantic, 9.0))
            .await
            .unwrap();
    }
    assert!(h.system.coordinator().stm().contains(&stuck));
}

#[tokio::test]
async fn test_write_with_both_down_is_cached_and_queued() {
    let h = harness(config());
    h.vector.set_down(true);
    h.graph.set_down(true);

    let id = h
        .system
        .create_memory(memory("offline note", MemoryKind::Episodic, 5.0))
        .await
        .unwrap();
    assert_eq!(
        h.system.coordinator().repair_missing(&id),
        Some(vec![Backend::Vector, Backend::Graph])
    );
    let record = h.system.get_memory(id).await.unwrap();
    assert_eq!(record.content, "offline note");
}

#[tokio::test]
async fn test_full_cache_write_fails_when_ltm_down() {
    let h = harness(config_with_capacity(1));
    let first = h
        .system
        .create_memory(memory("only slot", MemoryKind::Working, 5.0))
        .await
        .unwrap();
    let _pin = h.system.coordinator().stm().pin(&first).unwrap();

    h.graph.set_down(true);
    let result = h
        .system
        .create_memory(memory("no room", MemoryKind::Semantic, 5.0))
        .await;
    assert!(matches!(
        result,
        Err(MemoryError::BackendUnavailable {
            backend: Backend::Graph,
            ..
        })
    ));
    assert_eq!(h.system.coordinator().stm().len(), 1);
    assert_eq!(h.system.report_storage_stats().await.vector.count, 0);
}

#[tokio::test]
async fn test_full_cache_write_goes_straight_to_ltm() {
    let h = harness(config_with_capacity(1));
    let first = h
        .system
        .create_memory(memory("only slot", MemoryKind::Working, 5.0))
        .await
        .unwrap();
    let _pin = h.system.coordinator().stm().pin(&first).unwrap();

    let second = h
        .system
        .create_memory(memory("overflow", MemoryKind::Semantic, 5.0))
        .await
        .unwrap();
    let coord = h.system.coordinator();
    assert!(!coord.stm().contains(&second));
    assert!(coord.ltm().get_node(second).await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_while_ltm_down_keeps_memory() {
    let h = harness(config());
    let id = h
        .system
        .create_memory(memory("keep me", MemoryKind::Semantic, 5.0))
        .await
        .unwrap();

    h.graph.set_down(true);
    assert!(matches!(
        h.system.delete_memory(id).await,
        Err(MemoryError::BackendUnavailable { .. })
    ));
    assert!(h.system.coordinator().stm().contains(&id));
    assert!(h.system.get_memory(id).await.is_ok());

    h.graph.set_down(false);
    let found = h
        .system
        .search_memories(RetrievalQuery::semantic(common::embedding(0, 0.0)))
        .await
        .unwrap();
    assert!(found.memories.iter().any(|m| m.record.id == id));

    assert_eq!(h.system.delete_memory(id).await.unwrap(), DeleteOutcome::Deleted);
}

#[tokio::test]
async fn test_background_worker_repairs() {
    let h = harness(config());
    h.graph.set_down(true);
    let id = h
        .system
        .create_memory(memory("eventually durable", MemoryKind::Semantic, 6.0))
        .await
        .unwrap();
    let handles = h.system.start_background();
    h.graph.set_down(false);

    let coord = h.system.coordinator();
    for _ in 0..50 {
        if coord.pending_repairs() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    handles.shutdown().await;
    assert_eq!(coord.pending_repairs(), 0);
    assert!(coord.ltm().get_node(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_update_during_partial_outage_survives_repair() {
    let h = harness(config());
    h.vector.set_down(true);
    let id = h
        .system
        .create_memory(memory("old", MemoryKind::Semantic, 5.0))
        .await
        .unwrap();

    let patch = MemoryPatch {
        content: Some("new".into()),
        ..Default::default()
    };
    h.system.update_memory(id, patch).await.unwrap();

    h.vector.set_down(false);
    assert_eq!(h.system.run_repairs().await, 1);

    let coord = h.system.coordinator();
    let entry = coord.stm().entry(&id).unwrap();
    assert!(!entry.needs_flush());
    assert_eq!(coord.ltm().get_node(id).await.unwrap().unwrap().content, "new");

    assert!(coord.stm().evict_clean(&id).is_some());
    assert_eq!(h.system.get_memory(id).await.unwrap().content, "new");
}

#[tokio::test]
async fn test_delete_racing_a_read_stays_deleted() {
    let h = harness(single_slot());
    let victim = h
        .system
        .create_memory(memory("victim", MemoryKind::Semantic, 1.0))
        .await
        .unwrap();
    h.system
        .create_memory(memory("keeper", MemoryKind::Semantic, 9.0))
        .await
        .unwrap();
    assert!(!h.system.coordinator().stm().contains(&victim));

    h.graph.set_delay(Duration::from_millis(50));
    let reader = {
        let system = h.system.clone();
        tokio::spawn(async move { system.get_memory(victim).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.system.delete_memory(victim).await.unwrap(), DeleteOutcome::Deleted);
    let _ = reader.await.unwrap();
    h.graph.set_delay(Duration::ZERO);

    h.system.flush().await;
    assert!(matches!(
        h.system.get_memory(victim).await,
        Err(MemoryError::NotFound(_))
    ));
    assert_eq!(h.system.delete_memory(victim).await.unwrap(), DeleteOutcome::NotFound);
    assert!(h.system.coordinator().ltm().get_node(victim).await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_racing_a_read_is_kept() {
    let h = harness(single_slot());
    let id = h
        .system
        .create_memory(memory("before", MemoryKind::Semantic, 1.0))
        .await
        .unwrap();
    h.system
        .create_memory(memory("keeper", MemoryKind::Semantic, 9.0))
        .await
        .unwrap();
    assert!(!h.system.coordinator().stm().contains(&id));

    h.graph.set_delay(Duration::from_millis(50));
    let reader = {
        let system = h.system.clone();
        tokio::spawn(async move { system.get_memory(id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let patch = MemoryPatch {
        content: Some("after".into()),
        ..Default::default()
    };
    h.system.update_memory(id, patch).await.unwrap();
    reader.await.unwrap().unwrap();
    h.graph.set_delay(Duration::ZERO);

    h.system.flush().await;
    let coord = h.system.coordinator();
    assert_eq!(coord.ltm().get_node(id).await.unwrap().unwrap().content, "after");
    assert_eq!(h.system.get_memory(id).await.unwrap().content, "after");
}
