//! Forgetting, demotion, and decay math properties

mod common;

use chrono::{Duration, Utc};
use proptest::prelude::*;

use common::{config, harness, memory};
use dualtrack_memory::decay::{decay, reinforce};
use dualtrack_memory::{MemoryError, MemoryKind};

#[tokio::test]
async fn test_important_memory_outlives_half_life() {
    let h = harness(config());
    let strong = h
        .system
        .create_memory(memory("release checklist", MemoryKind::Episodic, 9.0).transient())
        .await
        .unwrap();
    let weak = h
        .system
        .create_memory(memory("lunch order", MemoryKind::Episodic, 2.0).transient())
        .await
        .unwrap();

    let later = Utc::now() + Duration::days(5);
    let report = h.system.run_sweep_at(later).await;
    assert_eq!(report.forgotten, 1);
    assert_eq!(report.deleted_from_ltm, 1);

    assert!(h.system.get_memory(strong).await.is_ok());
    assert!(matches!(
        h.system.get_memory(weak).await,
        Err(MemoryError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_permanent_memory_leaves_cache_but_stays_durable() {
    let h = harness(config());
    let id = h
        .system
        .create_memory(memory("old trivia", MemoryKind::Episodic, 2.0))
        .await
        .unwrap();

    let report = h.system.run_sweep_at(Utc::now() + Duration::days(5)).await;
    assert_eq!(report.forgotten, 1);
    assert_eq!(report.deleted_from_ltm, 0);
    assert!(!h.system.coordinator().stm().contains(&id));

    let record = h.system.get_memory(id).await.unwrap();
    assert_eq!(record.content, "old trivia");
}

#[tokio::test]
async fn test_below_floor_within_retention_is_kept() {
    let h = harness(config());
    let id = h
        .system
        .create_memory(memory("fading", MemoryKind::Episodic, 2.0).transient())
        .await
        .unwrap();

    // Floor crossed after ~2.9 days; retention window is one more day
    let report = h.system.run_sweep_at(Utc::now() + Duration::days(3)).await;
    assert_eq!(report.forgotten, 0);
    let entry = h.system.coordinator().stm().peek(&id).unwrap();
    assert!(entry.temporal.below_floor_since.is_some());
}

#[tokio::test]
async fn test_weak_cached_copy_is_demoted() {
    let h = harness(config());
    let id = h
        .system
        .create_memory(memory("stale", MemoryKind::Semantic, 5.0))
        .await
        .unwrap();

    // Semantic importance 5: half-life ~19.4 days, 0.5 falls under 0.1 after ~45 days
    let report = h.system.run_sweep_at(Utc::now() + Duration::days(60)).await;
    assert_eq!(report.demoted, 1);
    assert!(!h.system.coordinator().stm().contains(&id));
    assert!(h
        .system
        .coordinator()
        .ltm()
        .get_node(id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_sweep_skips_pinned_records() {
    let h = harness(config());
    let id = h
        .system
        .create_memory(memory("in use", MemoryKind::Episodic, 2.0).transient())
        .await
        .unwrap();

    let pin = h.system.coordinator().stm().pin(&id).unwrap();
    let report = h.system.run_sweep_at(Utc::now() + Duration::days(10)).await;
    assert_eq!(report.skipped_pinned, 1);
    assert_eq!(report.forgotten, 0);
    drop(pin);

    let report = h.system.run_sweep_at(Utc::now() + Duration::days(10)).await;
    assert_eq!(report.forgotten, 1);
}

#[tokio::test]
async fn test_sweep_promotes_working_memory() {
    let h = harness(config());
    let id = h
        .system
        .create_memory(memory("plan for today", MemoryKind::Working, 9.0))
        .await
        .unwrap();

    let report = h.system.run_sweep_at(Utc::now()).await;
    assert_eq!(report.promoted, 1);
    assert!(h
        .system
        .coordinator()
        .ltm()
        .get_node(id)
        .await
        .unwrap()
        .is_some());
}

proptest! {
    #[test]
    fn prop_decay_never_increases(
        s in 0.0f32..=1.0,
        t1 in 0.0f64..1e7,
        dt in 0.0f64..1e7,
        half in 1.0f64..1e6,
        rate in 0.05f32..0.95,
    ) {
        let earlier = decay(s, t1, half, rate);
        let later = decay(s, t1 + dt, half, rate);
        prop_assert!(later <= earlier);
        prop_assert!(earlier <= s);
        prop_assert!(later >= 0.0);
    }

    #[test]
    fn prop_reinforce_bounded(s in 0.0f32..=1.0, gain in 0.0f32..=1.0) {
        let r = reinforce(s, gain);
        prop_assert!(r >= s);
        prop_assert!(r <= 1.0);
    }
}
