mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use driftwatch::error::DriftError;
use driftwatch::models::{EnqueueOutcome, LinkType, PollCheckpoint, QueueStatus};
use driftwatch::services::{BackfillOptions, ComputeOptions, DivergenceService};

use common::{
    aged_conversation, conversation, init_test_logger, service_from_config, service_with,
    test_config, test_database, test_service, KeywordEmbedder, ASTRONOMY, COOKING, GARDENING,
};

async fn wait_for_analyzed(service: &DivergenceService, expected: u64) -> u64 {
    let mut analyzed = 0;
    for _ in 0..100 {
        analyzed = service.stats().await.unwrap().analyzed_conversations;
        if analyzed >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    analyzed
}

#[tokio::test]
async fn test_ingest_hook_queues_once_and_promotes() {
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    let conv = conversation("queued", &[(COOKING, 6)]);
    assert_eq!(service.ingest(&conv).await.unwrap(), EnqueueOutcome::Queued);
    assert_eq!(service.ingest(&conv).await.unwrap(), EnqueueOutcome::AlreadyQueued);
    assert_eq!(
        service.hooks().on_watcher_change("queued").await.unwrap(),
        EnqueueOutcome::AlreadyQueued
    );
    assert_eq!(service.enqueue("queued", 9).await.unwrap(), EnqueueOutcome::Promoted);

    let entry = db.get_queue_entry("queued").await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Pending);
    assert_eq!(entry.priority, 9);
    assert_eq!(db.queue_stats().await.unwrap().total(), 1);
}

#[tokio::test]
async fn test_enqueue_while_processing_coalesces() {
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    let conv = conversation("busy", &[(COOKING, 6)]);
    service.ingest(&conv).await.unwrap();
    assert!(db.claim("busy").await.unwrap());

    assert_eq!(service.enqueue("busy", 0).await.unwrap(), EnqueueOutcome::Coalesced);

    let err = service
        .compute("busy", &ComputeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DriftError::Conflict(_)));

    // The requested rerun sends the entry back to pending.
    assert_eq!(db.complete("busy").await.unwrap(), QueueStatus::Pending);
    assert_eq!(db.complete("busy").await.unwrap(), QueueStatus::Pending);
    assert!(db.claim("busy").await.unwrap());
    assert_eq!(db.complete("busy").await.unwrap(), QueueStatus::Completed);
}

#[tokio::test]
async fn test_claim_order_follows_priority() {
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    for id in ["low", "high", "mid"] {
        db.upsert_conversation(&conversation(id, &[(COOKING, 4)]))
            .await
            .unwrap();
    }
    service.enqueue("low", 0).await.unwrap();
    service.enqueue("high", 5).await.unwrap();
    service.enqueue("mid", 2).await.unwrap();

    let claimed: Vec<String> = db
        .claim_next(2)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.conversation_id)
        .collect();
    assert_eq!(claimed, vec!["high".to_string(), "mid".to_string()]);

    let stats = db.queue_stats().await.unwrap();
    assert_eq!(stats.processing, 2);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn test_cancel_only_affects_pending() {
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    service
        .ingest(&conversation("cancel-me", &[(COOKING, 4)]))
        .await
        .unwrap();
    assert!(service.cancel("cancel-me").await.unwrap());
    assert!(!service.cancel("cancel-me").await.unwrap());

    assert_eq!(
        service.enqueue("cancel-me", 1).await.unwrap(),
        EnqueueOutcome::Requeued
    );
    assert!(db.claim("cancel-me").await.unwrap());
    assert!(!service.cancel("cancel-me").await.unwrap());
    assert!(!db.has_report("cancel-me").await.unwrap());
}

#[tokio::test]
async fn test_enqueue_unknown_conversation_fails() {
    let (db, _dir) = test_database().await;
    let service = test_service(db);

    let err = service.enqueue("ghost", 1).await.unwrap_err();
    assert!(matches!(err, DriftError::NotFound(_)));
}

#[tokio::test]
async fn test_backfill_is_idempotent() {
    init_test_logger();
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    db.upsert_conversation(&conversation("a", &[(COOKING, 10), (ASTRONOMY, 10)]))
        .await
        .unwrap();
    db.upsert_conversation(&conversation("b", &[(GARDENING, 8)]))
        .await
        .unwrap();
    db.upsert_conversation(&conversation("c", &[(ASTRONOMY, 6)]))
        .await
        .unwrap();
    db.upsert_conversation(&conversation("empty", &[]))
        .await
        .unwrap();

    let options = BackfillOptions {
        batch_size: 2,
        ..BackfillOptions::default()
    };

    let first = service.backfill_all(&options).await.unwrap();
    assert_eq!(first.processed, 3);
    assert_eq!(first.failed, 0);
    assert_eq!(first.skipped, 1);

    let second = service.backfill_all(&options).await.unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(second.failed, 0);

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.total_conversations, 4);
    assert_eq!(stats.analyzed_conversations, 3);
    assert_eq!(stats.stale_segments, 0);

    let forced = service
        .backfill_all(&BackfillOptions {
            force: true,
            ..options
        })
        .await
        .unwrap();
    assert_eq!(forced.processed, 3);
}

#[tokio::test]
async fn test_backfill_respects_max_conversations() {
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    for id in ["m1", "m2", "m3"] {
        db.upsert_conversation(&conversation(id, &[(COOKING, 5)]))
            .await
            .unwrap();
    }

    let stats = service
        .backfill_all(&BackfillOptions {
            batch_size: 10,
            max_conversations: Some(2),
            ..BackfillOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(stats.processed, 2);
    assert_eq!(service.stats().await.unwrap().analyzed_conversations, 2);
}

#[tokio::test]
async fn test_high_divergence_listing() {
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    db.upsert_conversation(&conversation("wild", &[(COOKING, 10), (ASTRONOMY, 10)]))
        .await
        .unwrap();
    db.upsert_conversation(&conversation("calm", &[(GARDENING, 10)]))
        .await
        .unwrap();
    service
        .backfill_all(&BackfillOptions::default())
        .await
        .unwrap();

    let high = service.list_high_divergence(Some(0.5), 10).await.unwrap();
    let ids: Vec<&str> = high.iter().map(|r| r.conversation_id.as_str()).collect();
    assert_eq!(ids, vec!["wild"]);
    assert!(high[0].should_split);

    let all = service.list_high_divergence(Some(0.0), 10).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all[0].overall_score >= all[1].overall_score);

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.should_split, 1);
    assert!(stats.average_score.is_some());
}

#[tokio::test]
async fn test_related_conversations_exclude_self_and_are_ranked() {
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    db.upsert_conversation(&aged_conversation("mixed", &[(COOKING, 10), (ASTRONOMY, 10)], 3))
        .await
        .unwrap();
    db.upsert_conversation(&aged_conversation("stars", &[(ASTRONOMY, 10)], 2))
        .await
        .unwrap();
    db.upsert_conversation(&aged_conversation("garden", &[(GARDENING, 10)], 1))
        .await
        .unwrap();
    service
        .backfill_all(&BackfillOptions::default())
        .await
        .unwrap();

    let related = service
        .related_conversations("stars", 0.5, 10)
        .await
        .unwrap();

    assert!(related.iter().all(|r| r.conversation_id != "stars"));
    assert_eq!(
        related.first().map(|r| r.conversation_id.as_str()),
        Some("mixed")
    );
    assert!(related.iter().all(|r| r.conversation_id != "garden"));
    assert!(related.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    assert!(related[0].similarity > 0.9);

    // Backfill walks ids in order, so only "stars" saw the others' anchors.
    let links = db.get_links("stars").await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].link_type, LinkType::Continues);
    assert_eq!(
        links[0].metadata.get("target_conversation_id"),
        Some(&serde_json::json!("mixed"))
    );
    assert_eq!(service.stats().await.unwrap().total_links, 1);

    let err = service
        .related_conversations("nobody", 0.5, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, DriftError::NotFound(_)));
}

#[tokio::test]
async fn test_embedding_model_change_requeues_stale_conversations() {
    let (db, _dir) = test_database().await;
    let old = test_service(db.clone());

    db.upsert_conversation(&conversation("old", &[(COOKING, 6)]))
        .await
        .unwrap();
    assert_eq!(old.check_embedding_model().await.unwrap(), 0);
    old.backfill_all(&BackfillOptions::default()).await.unwrap();

    let new = service_with(
        db.clone(),
        Arc::new(KeywordEmbedder::with_model("test/keyword-v2")),
        None,
    );
    assert_eq!(new.stats().await.unwrap().stale_segments, 1);
    assert_eq!(new.check_embedding_model().await.unwrap(), 1);
    assert_eq!(new.check_embedding_model().await.unwrap(), 0);

    let entry = db.get_queue_entry("old").await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Pending);

    new.backfill_all(&BackfillOptions {
        force: true,
        ..BackfillOptions::default()
    })
    .await
    .unwrap();
    assert_eq!(new.stats().await.unwrap().stale_segments, 0);
}

#[tokio::test]
async fn test_background_processor_drains_queue() {
    init_test_logger();
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    service
        .ingest(&conversation("bg-1", &[(COOKING, 10), (ASTRONOMY, 10)]))
        .await
        .unwrap();
    service
        .ingest(&conversation("bg-2", &[(GARDENING, 8)]))
        .await
        .unwrap();

    service.start_background_processing(1, 10).await.unwrap();
    assert!(service.is_background_running().await);

    let err = service
        .start_background_processing(1, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, DriftError::Conflict(_)));

    let mut analyzed = 0;
    for _ in 0..100 {
        analyzed = service.stats().await.unwrap().analyzed_conversations;
        if analyzed == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    service.stop_background_processing().await;
    assert!(!service.is_background_running().await);
    assert_eq!(analyzed, 2);

    let queue = db.queue_stats().await.unwrap();
    assert_eq!(queue.processing, 0);
    assert_eq!(queue.completed, 2);
    assert!(db.has_report("bg-1").await.unwrap());
}

#[tokio::test]
async fn test_poller_leaves_cancelled_conversation_alone() {
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    service
        .ingest(&conversation("cancelled", &[(COOKING, 6)]))
        .await
        .unwrap();
    service
        .ingest(&conversation("kept", &[(GARDENING, 6)]))
        .await
        .unwrap();
    assert!(service.cancel("cancelled").await.unwrap());

    service.start_background_processing(1, 10).await.unwrap();
    let analyzed = wait_for_analyzed(&service, 1).await;
    service.stop_background_processing().await;

    assert_eq!(analyzed, 1);
    assert!(db.has_report("kept").await.unwrap());
    assert!(!db.has_report("cancelled").await.unwrap());
    let entry = db.get_queue_entry("cancelled").await.unwrap().unwrap();
    assert_eq!(entry.status, QueueStatus::Cancelled);
}

#[tokio::test]
async fn test_change_after_cancel_requeues() {
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    service
        .ingest(&conversation("edited", &[(COOKING, 6)]))
        .await
        .unwrap();
    assert!(service.cancel("edited").await.unwrap());
    let cancelled_at = db
        .get_queue_entry("edited")
        .await
        .unwrap()
        .unwrap()
        .completed_at
        .unwrap();

    let before = cancelled_at - chrono::Duration::seconds(1);
    assert_eq!(
        db.enqueue_change("edited", 0, before).await.unwrap(),
        EnqueueOutcome::Suppressed
    );
    assert_eq!(
        db.get_queue_entry("edited").await.unwrap().unwrap().status,
        QueueStatus::Cancelled
    );

    let after = cancelled_at + chrono::Duration::seconds(1);
    assert_eq!(
        db.enqueue_change("edited", 0, after).await.unwrap(),
        EnqueueOutcome::Requeued
    );

    // An explicit request always revives the entry.
    assert!(service.cancel("edited").await.unwrap());
    assert_eq!(
        service.enqueue("edited", 1).await.unwrap(),
        EnqueueOutcome::Requeued
    );
}

#[tokio::test]
async fn test_checkpoint_pages_through_shared_timestamps() {
    let (db, _dir) = test_database().await;
    let shared = chrono::Utc::now() - chrono::Duration::hours(1);

    for i in 0..5 {
        let mut conv = conversation(&format!("bulk-{i}"), &[(COOKING, 4)]);
        conv.updated_at = shared;
        db.upsert_conversation(&conv).await.unwrap();
    }

    let mut seen = Vec::new();
    let mut checkpoint: Option<PollCheckpoint> = None;
    loop {
        let page = db
            .list_conversations_updated_since(checkpoint.as_ref(), 2)
            .await
            .unwrap();
        let Some(last) = page.last().cloned() else {
            break;
        };
        seen.extend(page.into_iter().map(|c| c.conversation_id));
        checkpoint = Some(last);
    }

    assert_eq!(
        seen,
        vec!["bulk-0", "bulk-1", "bulk-2", "bulk-3", "bulk-4"]
    );
}

#[tokio::test]
async fn test_poller_enqueues_every_conversation_sharing_a_timestamp() {
    let (db, _dir) = test_database().await;
    let mut config = test_config(None);
    config.processing.poll_page_size = 2;
    let service = service_from_config(&config, db.clone(), Arc::new(KeywordEmbedder::new()));

    let shared = chrono::Utc::now() - chrono::Duration::hours(1);
    for i in 0..5 {
        let mut conv = conversation(&format!("import-{i}"), &[(ASTRONOMY, 4)]);
        conv.updated_at = shared;
        db.upsert_conversation(&conv).await.unwrap();
    }

    service.start_background_processing(1, 10).await.unwrap();
    let analyzed = wait_for_analyzed(&service, 5).await;
    service.stop_background_processing().await;

    assert_eq!(analyzed, 5);
    let checkpoint = db.get_poll_checkpoint().await.unwrap().unwrap();
    assert_eq!(checkpoint.conversation_id, "import-4");
}

#[tokio::test]
async fn test_start_keeps_recent_claims_and_recovers_stale_ones() {
    let (db, _dir) = test_database().await;
    let service = test_service(db.clone());

    service
        .ingest(&conversation("held", &[(COOKING, 6)]))
        .await
        .unwrap();
    service
        .ingest(&conversation("free", &[(GARDENING, 6)]))
        .await
        .unwrap();
    // A live compute holds this claim.
    assert!(db.claim("held").await.unwrap());

    service.start_background_processing(1, 10).await.unwrap();
    let analyzed = wait_for_analyzed(&service, 1).await;
    service.stop_background_processing().await;

    assert_eq!(analyzed, 1);
    assert!(!db.has_report("held").await.unwrap());
    assert_eq!(
        db.get_queue_entry("held").await.unwrap().unwrap().status,
        QueueStatus::Processing
    );

    // With no grace period the same claim counts as orphaned.
    let mut config = test_config(None);
    config.processing.stale_processing_secs = 0;
    let restarted = service_from_config(&config, db.clone(), Arc::new(KeywordEmbedder::new()));
    tokio::time::sleep(Duration::from_millis(20)).await;

    restarted.start_background_processing(1, 10).await.unwrap();
    let analyzed = wait_for_analyzed(&restarted, 2).await;
    restarted.stop_background_processing().await;

    assert_eq!(analyzed, 2);
    assert!(db.has_report("held").await.unwrap());
}
