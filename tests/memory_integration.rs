//! Integration tests for the memory store lifecycle.
//!
//! Covers the full public surface: add/retrieve round trips, restart
//! rebuild, decay, pruning, consolidation merges, and concurrent writes.
//!
//! All tests run with the primary model disabled so embeddings come from
//! the deterministic fallback and results are reproducible offline.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serial_test::serial;

use mnemon::{MemoryConfig, MemoryError, MemoryManager};

// =============================================================================
// Test Utilities
// =============================================================================

/// Config pointed at a temp dir, fallback embeddings, small dimension.
fn test_config(dir: &Path) -> MemoryConfig {
    MemoryConfig {
        store_path: dir.to_path_buf(),
        model_enabled: false,
        embedding_dimension: 64,
        ..MemoryConfig::default()
    }
}

async fn open_manager(dir: &Path) -> MemoryManager {
    MemoryManager::open(test_config(dir))
        .await
        .expect("failed to open manager")
}

// =============================================================================
// Add / Retrieve
// =============================================================================

#[tokio::test]
async fn add_then_retrieve_returns_self_with_max_similarity() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(dir.path()).await;

    let added = manager
        .add("the meeting is on thursday", 5.0, vec![], "test")
        .await
        .unwrap();

    let results = manager
        .retrieve("the meeting is on thursday", 1, 0.0)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].entry.id, added.id);
    // Identical text embeds to the identical vector: self-similarity 1.0.
    assert!((results[0].similarity - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn retrieve_example_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(dir.path()).await;

    let added = manager
        .add(
            "Python was created by Guido van Rossum",
            9.0,
            vec!["programming".to_string()],
            "docs",
        )
        .await
        .unwrap();

    let results = manager
        .retrieve("Who created Python?", 1, 5.0)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].entry.id, added.id);
    assert_eq!(results[0].entry.importance, 9.0);
    assert!(results[0].entry.tags.contains("programming"));
}

#[tokio::test]
async fn retrieval_is_ordered_and_filtered_by_importance() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(dir.path()).await;

    manager
        .add("alpha fact about rust", 9.0, vec![], "test")
        .await
        .unwrap();
    manager
        .add("beta fact about cooking", 2.0, vec![], "test")
        .await
        .unwrap();

    let results = manager
        .retrieve("alpha fact about rust", 10, 5.0)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].entry.importance >= 5.0);

    let unfiltered = manager
        .retrieve("alpha fact about rust", 10, 0.0)
        .await
        .unwrap();
    assert_eq!(unfiltered.len(), 2);
    // The query's own text ranks first.
    assert_eq!(unfiltered[0].entry.content, "alpha fact about rust");
    assert!(unfiltered[0].score >= unfiltered[1].score);
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn add_rejects_invalid_input() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(dir.path()).await;

    assert!(matches!(
        manager.add("", 1.0, vec![], "test").await,
        Err(MemoryError::Validation(_))
    ));
    assert!(matches!(
        manager.add("   ", 1.0, vec![], "test").await,
        Err(MemoryError::Validation(_))
    ));

    let oversized = "x".repeat(300 * 1024);
    assert!(matches!(
        manager.add(&oversized, 1.0, vec![], "test").await,
        Err(MemoryError::Validation(_))
    ));

    assert!(matches!(
        manager
            .add("ok", 1.0, vec!["bad\ntag".to_string()], "test")
            .await,
        Err(MemoryError::Validation(_))
    ));
}

#[tokio::test]
async fn retrieve_rejects_zero_top_k() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(dir.path()).await;

    assert!(matches!(
        manager.retrieve("anything", 0, 0.0).await,
        Err(MemoryError::Validation(_))
    ));
}

#[tokio::test]
async fn out_of_range_importance_is_clamped_not_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(dir.path()).await;

    let high = manager.add("too important", 42.0, vec![], "test").await.unwrap();
    assert_eq!(high.importance, 10.0);

    let low = manager.add("negative", -3.0, vec![], "test").await.unwrap();
    assert_eq!(low.importance, 0.0);
}

// =============================================================================
// Durability
// =============================================================================

#[tokio::test]
async fn restart_rebuilds_identical_retrieval_results() {
    let dir = tempfile::tempdir().unwrap();

    let (first_id, first_similarity) = {
        let manager = open_manager(dir.path()).await;
        manager
            .add("the sky is blue today", 6.0, vec!["weather".to_string()], "obs")
            .await
            .unwrap();
        manager
            .add("compilers translate source code", 6.0, vec![], "notes")
            .await
            .unwrap();

        let results = manager
            .retrieve("the sky is blue today", 1, 0.0)
            .await
            .unwrap();
        (results[0].entry.id, results[0].similarity)
    };

    // Reopen: the index must be rebuilt from durable state alone.
    let manager = open_manager(dir.path()).await;
    assert_eq!(manager.stats().total_entries, 2);

    let results = manager
        .retrieve("the sky is blue today", 1, 0.0)
        .await
        .unwrap();
    assert_eq!(results[0].entry.id, first_id);
    assert!((results[0].similarity - first_similarity).abs() < 1e-5);
    assert!(results[0].entry.tags.contains("weather"));
}

#[tokio::test]
async fn access_tracking_creates_durable_versions() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(dir.path()).await;

    let added = manager
        .add("frequently recalled fact", 5.0, vec![], "test")
        .await
        .unwrap();
    assert_eq!(added.version, 1);
    assert_eq!(added.access_count, 0);

    manager
        .retrieve("frequently recalled fact", 1, 0.0)
        .await
        .unwrap();

    let history = manager.history(added.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].entry.version, 2);
    assert_eq!(history[1].entry.access_count, 1);
    assert!(history[1].entry.last_accessed_at >= history[0].entry.last_accessed_at);
}

// =============================================================================
// Decay & Pruning
// =============================================================================

#[tokio::test]
#[serial]
async fn decay_is_monotonic_and_bounded_by_closed_form() {
    let dir = tempfile::tempdir().unwrap();
    let config = MemoryConfig {
        decay_half_life_secs: 1,
        ..test_config(dir.path())
    };
    let manager = MemoryManager::open(config).await.unwrap();

    manager.add("fading memory", 9.0, vec![], "test").await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    manager.consolidate().await.unwrap();
    let after_first = manager.stats().average_importance;
    assert!(after_first < 9.0);
    // elapsed >= 0.6s, so importance <= 9 * 0.5^0.6 (plus float slack).
    assert!(after_first <= 9.0 * 0.5_f64.powf(0.6) + 1e-6);

    tokio::time::sleep(Duration::from_millis(600)).await;
    manager.consolidate().await.unwrap();
    let after_second = manager.stats().average_importance;
    // No access in between: strictly non-increasing, and the two passes
    // compose to at most the closed-form decay over the total elapsed time.
    assert!(after_second <= after_first);
    assert!(after_second <= 9.0 * 0.5_f64.powf(1.2) + 1e-6);
}

#[tokio::test]
#[serial]
async fn entries_below_the_floor_are_pruned_from_retrieval() {
    let dir = tempfile::tempdir().unwrap();
    let config = MemoryConfig {
        decay_half_life_secs: 1,
        ..test_config(dir.path())
    };
    let manager = MemoryManager::open(config).await.unwrap();

    let doomed = manager
        .add("barely relevant", 0.3, vec![], "test")
        .await
        .unwrap();

    // After ~2 half-lives importance is ~0.075, below the 0.1 floor.
    tokio::time::sleep(Duration::from_millis(2100)).await;
    let summary = manager.consolidate().await.unwrap();
    assert_eq!(summary.pruned, 1);

    // Gone from retrieval regardless of similarity.
    let results = manager.retrieve("barely relevant", 5, 0.0).await.unwrap();
    assert!(results.is_empty());

    // But the audit history survives, ending in a deleted version.
    let history = manager.history(doomed.id).await.unwrap();
    assert_eq!(history.last().unwrap().status, mnemon::EntryStatus::Deleted);
}

// =============================================================================
// Consolidation
// =============================================================================

#[tokio::test]
async fn near_duplicates_merge_with_tag_union_and_max_importance() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(dir.path()).await;

    // Identical text embeds identically: cosine distance 0, within eps.
    let first = manager
        .add(
            "the cat sits on the mat",
            5.0,
            vec!["cats".to_string()],
            "a",
        )
        .await
        .unwrap();
    let second = manager
        .add(
            "the cat sits on the mat",
            7.0,
            vec!["pets".to_string()],
            "b",
        )
        .await
        .unwrap();
    manager
        .add("unrelated quarterly revenue numbers", 1.0, vec![], "c")
        .await
        .unwrap();

    let summary = manager.consolidate().await.unwrap();
    assert_eq!(summary.merged, 2);
    assert_eq!(summary.pruned, 0);

    // Two entries remain: the representative and the noise point.
    let stats = manager.stats();
    assert_eq!(stats.total_entries, 2);

    // Only the representative clears an importance bar of 6.5.
    let reps = manager.retrieve("the cat sits on the mat", 10, 6.5).await.unwrap();
    assert_eq!(reps.len(), 1);
    let rep = &reps[0].entry;
    assert_eq!(rep.importance, 7.0);
    assert!(rep.tags.contains("cats") && rep.tags.contains("pets"));
    assert!(rep.source.starts_with("merge of 2 entries"));
    assert!(rep.content.contains("the cat sits on the mat"));

    // Members are superseded, not erased.
    for member in [&first, &second] {
        let history = manager.history(member.id).await.unwrap();
        assert_eq!(
            history.last().unwrap().status,
            mnemon::EntryStatus::Superseded
        );
    }
}

#[tokio::test]
async fn consolidation_is_idempotent_without_new_writes() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(dir.path()).await;

    manager
        .add("remember the wifi password", 5.0, vec![], "a")
        .await
        .unwrap();
    manager
        .add("remember the wifi password", 5.0, vec![], "b")
        .await
        .unwrap();

    let first = manager.consolidate().await.unwrap();
    assert_eq!(first.merged, 2);

    let second = manager.consolidate().await.unwrap();
    assert_eq!(second.merged, 0);
    assert_eq!(second.pruned, 0);
}

// =============================================================================
// Concurrency & Lifecycle
// =============================================================================

#[tokio::test]
async fn concurrent_adds_all_become_durable_and_retrievable() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(open_manager(dir.path()).await);

    let n = 16;
    let adds = (0..n).map(|i| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .add(&format!("concurrent fact number {i}"), 5.0, vec![], "load")
                .await
        })
    });

    for result in join_all(adds).await {
        result.unwrap().unwrap();
    }
    assert_eq!(manager.stats().total_entries, n);

    // Every write is independently retrievable.
    for i in 0..n {
        let query = format!("concurrent fact number {i}");
        let results = manager.retrieve(&query, 1, 0.0).await.unwrap();
        assert_eq!(results[0].entry.content, query);
    }

    // And all of them survive a restart: no commit was lost.
    drop(manager);
    let reopened = open_manager(dir.path()).await;
    assert_eq!(reopened.stats().total_entries, n);
}

#[tokio::test]
async fn background_tasks_start_and_stop_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(dir.path()).await;

    manager.start_background_tasks().await;
    manager.start_background_tasks().await; // no-op

    manager.stop_background_tasks().await;
    manager.stop_background_tasks().await; // no-op

    // Restartable after a stop.
    manager.start_background_tasks().await;
    manager.stop_background_tasks().await;
}

#[tokio::test]
async fn stats_reflect_live_entries_only() {
    let dir = tempfile::tempdir().unwrap();
    let manager = open_manager(dir.path()).await;

    let empty = manager.stats();
    assert_eq!(empty.total_entries, 0);
    assert_eq!(empty.average_importance, 0.0);

    manager.add("one", 4.0, vec![], "test").await.unwrap();
    manager.add("two", 6.0, vec![], "test").await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.total_entries, 2);
    assert_eq!(stats.total_size_bytes, 6);
    assert!((stats.average_importance - 5.0).abs() < 1e-9);
}
