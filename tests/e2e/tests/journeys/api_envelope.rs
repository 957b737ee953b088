//! Quota/idempotency envelope journeys: replayed writes, payload
//! conflicts, quota exhaustion with clean state, batch debits, and the
//! auth surface.

use engram_core::QuotaKind;
use engram_e2e_tests::{event, TestHarness};
use engram_server::service::{FeedbackRequest, IngestBatchRequest};
use engram_server::ApiError;

#[test]
fn duplicate_ingest_with_same_key_creates_one_memory() {
    let harness = TestHarness::new();
    let service = &harness.service;
    let payload = event("User asked about Python for-loops", "user_question", "alice");

    let (first, _, replayed_first) = service
        .ingest_with_envelope("tenant", payload.clone(), Some("K"))
        .unwrap();
    assert!(!replayed_first);
    let (second, _, replayed_second) = service
        .ingest_with_envelope("tenant", payload, Some("K"))
        .unwrap();
    assert!(replayed_second, "second response must carry the replay marker");

    assert_eq!(first.memory_id, second.memory_id);
    assert_eq!(first.stored, second.stored);
    assert_eq!(first.decision_reason, second.decision_reason);
    assert_eq!(service.engine().memory_count(Some("tenant")).unwrap(), 1);

    // Only one quota debit for the pair
    let usage = service.ledger().read_usage("tenant").unwrap().unwrap();
    assert_eq!(usage.events_today, 1);
}

#[test]
fn key_reuse_with_different_payload_conflicts() {
    let harness = TestHarness::new();
    let service = &harness.service;
    service
        .ingest_with_envelope(
            "tenant",
            event("original payload", "user_fact", "alice"),
            Some("K"),
        )
        .unwrap();
    let error = service
        .ingest_with_envelope(
            "tenant",
            event("tampered payload", "user_fact", "alice"),
            Some("K"),
        )
        .unwrap_err();
    assert!(matches!(error, ApiError::Conflict(_)));
    assert_eq!(service.engine().memory_count(Some("tenant")).unwrap(), 1);
}

#[test]
fn feedback_is_idempotent_too() {
    let harness = TestHarness::new();
    let service = &harness.service;
    let ingested = service
        .ingest("tenant", &event("a fact to rate", "user_fact", "alice"))
        .unwrap();
    let feedback = FeedbackRequest {
        memory_id: ingested.memory_id.clone(),
        helpful: true,
        outcome_value: Some(1.0),
    };
    let (_, _, first_replayed) = service
        .feedback_with_envelope("tenant", feedback.clone(), Some("FB"))
        .unwrap();
    assert!(!first_replayed);
    let (_, _, second_replayed) = service
        .feedback_with_envelope("tenant", feedback, Some("FB"))
        .unwrap();
    assert!(second_replayed);

    // Exactly one outcome applied
    let records = service
        .engine()
        .fetch_memories(&[ingested.memory_id], "tenant")
        .unwrap();
    assert_eq!(records[0].outcome_count, 1);
}

#[test]
fn exhausted_daily_quota_blocks_without_side_effects() {
    let harness = TestHarness::with(
        |_| {},
        |api| {
            api.events_per_day = 3;
        },
    );
    let service = &harness.service;
    for i in 0..3 {
        service
            .ingest_with_envelope(
                "tenant",
                event(&format!("event number {i}"), "user_fact", "alice"),
                None,
            )
            .unwrap();
    }
    let count_before = service.engine().memory_count(Some("tenant")).unwrap();

    let error = service
        .ingest_with_envelope("tenant", event("over the line", "user_fact", "alice"), None)
        .unwrap_err();
    match error {
        ApiError::RateLimited {
            snapshot,
            retry_after_seconds,
        } => {
            assert!(retry_after_seconds > 0);
            assert_eq!(snapshot.remaining, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        service.engine().memory_count(Some("tenant")).unwrap(),
        count_before,
        "memory table must be unchanged"
    );
}

#[test]
fn batch_ingest_debits_item_count() {
    let harness = TestHarness::new();
    let service = &harness.service;
    let batch = IngestBatchRequest {
        events: (0..4)
            .map(|i| event(&format!("batch item {i}"), "user_fact", "alice"))
            .collect(),
    };
    let (response, snapshot, _) = service
        .ingest_batch_with_envelope("tenant", batch, Some("BATCH"))
        .unwrap();
    assert_eq!(response.items.len(), 4);
    let usage = service.ledger().read_usage("tenant").unwrap().unwrap();
    assert_eq!(usage.events_today, 4);
    assert_eq!(snapshot.remaining, harness.service.config().events_per_day - 4);
}

#[test]
fn oversized_batch_rejected_before_any_debit() {
    let harness = TestHarness::with(
        |_| {},
        |api| {
            api.max_batch_items = 2;
        },
    );
    let service = &harness.service;
    let batch = IngestBatchRequest {
        events: (0..3)
            .map(|i| event(&format!("batch item {i}"), "user_fact", "alice"))
            .collect(),
    };
    let error = service
        .ingest_batch_with_envelope("tenant", batch, None)
        .unwrap_err();
    assert!(matches!(error, ApiError::Validation(_)));
    assert!(service.ledger().read_usage("tenant").unwrap().is_none());
}

#[test]
fn bearer_tokens_resolve_to_their_account() {
    let harness = TestHarness::new();
    let service = &harness.service;
    let token = harness.token("acct-42");
    let context = service.authenticate(Some(&token)).unwrap();
    assert_eq!(context.subject, "acct-42");
    assert!(context.scopes.contains(&"memories:write".to_string()));

    assert!(matches!(
        service.authenticate(Some("not-a-registered-key")),
        Err(ApiError::Auth(_))
    ));

    service
        .ledger()
        .register_api_key("acct-77", "ci", "sk-opaque-1", &[])
        .unwrap();
    let api_key_context = service.authenticate(Some("sk-opaque-1")).unwrap();
    assert_eq!(api_key_context.subject, "acct-77");
}

#[test]
fn query_quota_is_separate_from_events() {
    let harness = TestHarness::with(
        |_| {},
        |api| {
            api.events_per_day = 1;
            api.queries_per_day = 2;
        },
    );
    let service = &harness.service;
    service
        .ledger()
        .consume("tenant", QuotaKind::Event, 1)
        .unwrap();
    // Event budget exhausted, query budget still open
    assert!(service.ledger().consume("tenant", QuotaKind::Event, 1).is_err());
    service
        .ledger()
        .consume("tenant", QuotaKind::Query, 1)
        .unwrap();
    service
        .ledger()
        .consume("tenant", QuotaKind::Query, 1)
        .unwrap();
    assert!(service.ledger().consume("tenant", QuotaKind::Query, 1).is_err());
}
