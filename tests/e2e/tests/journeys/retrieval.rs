//! Retrieval journeys: encoding determinism, unit norms, tenant isolation,
//! and the assistant-intent cap.

use engram_core::{DecisionEngine, EngineConfig, Event, RetrieveRequest, SemanticEncoder};
use engram_e2e_tests::{event, TestHarness};
use engram_server::service::RetrieveParams;
use serde_json::json;

fn retrieve_params(query: &str, limit: usize) -> RetrieveParams {
    RetrieveParams {
        query: query.to_string(),
        limit,
        entity_id: None,
        event_type: None,
        start_time: None,
        end_time: None,
    }
}

#[test]
fn encoding_is_deterministic_across_cold_engines() {
    let encoder_one = SemanticEncoder::deterministic(48);
    let encoder_two = SemanticEncoder::deterministic(48);
    let mut context = engram_core::ContextMap::new();
    context.insert("intent".into(), json!("user_question"));
    context.insert("entities".into(), json!(["alice"]));
    context.insert("summary".into(), json!("loops in python"));
    let raw = engram_core::RawEvent::new(chrono::Utc::now(), "How do loops work?", context);

    let first = encoder_one.encode_event(&raw).unwrap();
    let second = encoder_two.encode_event(&raw).unwrap();
    assert_eq!(first.semantic_key, second.semantic_key);
    assert_eq!(first.semantic_embedding, second.semantic_embedding);
    assert_eq!(first.raw_embedding, second.raw_embedding);
}

#[test]
fn stored_embeddings_are_unit_norm() {
    let harness = TestHarness::new();
    let service = &harness.service;
    for i in 0..5 {
        service
            .ingest(
                "tenant",
                &event(&format!("distinct event number {i}"), "user_fact", "alice"),
            )
            .unwrap();
    }
    let records = service.engine().list_memories(None, Some("tenant")).unwrap();
    assert!(!records.is_empty());
    for record in records {
        let semantic_norm: f32 = record
            .semantic_embedding
            .iter()
            .map(|x| x * x)
            .sum::<f32>()
            .sqrt();
        assert!((semantic_norm - 1.0).abs() < 1e-3, "semantic norm {semantic_norm}");
        let raw_norm: f32 = record.raw_embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((raw_norm - 1.0).abs() < 1e-3, "raw norm {raw_norm}");
    }
}

#[test]
fn tenants_never_see_each_other() {
    let harness = TestHarness::new();
    let service = &harness.service;
    service
        .ingest("tenant-a", &event("alpha only fact", "user_fact", "alice"))
        .unwrap();
    service
        .ingest("tenant-b", &event("beta only fact", "user_fact", "bob"))
        .unwrap();

    let from_a = service.retrieve("tenant-a", &retrieve_params("fact", 10)).unwrap();
    assert!(!from_a.memories.is_empty());
    for memory in &from_a.memories {
        let records = service
            .engine()
            .fetch_memories(&[memory.memory_id.clone()], "tenant-a")
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].account_key, "tenant-a");
    }

    let listing = service.list_memories("tenant-b", 100, None).unwrap();
    for memory in &listing.data {
        let records = service
            .engine()
            .fetch_memories(&[memory.memory_id.clone()], "tenant-b")
            .unwrap();
        assert_eq!(records[0].account_key, "tenant-b");
    }

    // Feedback across tenants is a 404, not a write
    let foreign = &from_a.memories[0].memory_id;
    let error = service
        .feedback("tenant-b", &engram_e2e_tests::helpful_feedback(foreign))
        .unwrap_err();
    assert!(matches!(error, engram_server::ApiError::NotFound(_)));
}

#[test]
fn assistant_cap_holds_with_mixed_candidates() {
    // Scenario: 4 assistant + 3 non-assistant candidates, limit 5 with a
    // 0.25 share. The cap admits one assistant; the three non-assistant
    // candidates all land; deferred assistants fill the final slot.
    let engine = DecisionEngine::new(EngineConfig {
        embedding_dim: 32,
        sqlite_path: ":memory:".to_string(),
        metrics_path: String::new(),
        ..Default::default()
    })
    .unwrap();

    for i in 0..4 {
        let event = Event::new("alice", "assistant_response", format!("Assistant reply {i}."))
            .with_metadata("intent", json!("assistant_response"))
            .with_metadata("entities", json!(["alice"]));
        engine.ingest(&event, "t").unwrap();
    }
    for i in 0..3 {
        let event = Event::new("alice", "user_question", format!("Question number {i}?"))
            .with_metadata("intent", json!("user_question"))
            .with_metadata("entities", json!(["alice"]));
        engine.ingest(&event, "t").unwrap();
    }

    let outcome = engine
        .retrieve(&RetrieveRequest::new("replies and questions", 5), "t")
        .unwrap();
    assert_eq!(outcome.memories.len(), 5);
    let non_assistant = outcome
        .memories
        .iter()
        .filter(|item| !item.memory.is_assistant_intent())
        .count();
    assert_eq!(non_assistant, 3, "all non-assistant candidates admitted");
    let assistant = outcome.memories.len() - non_assistant;
    assert_eq!(assistant, 2, "one capped assistant plus one backfill");
}

#[test]
fn retrieval_increments_counts_only_for_returned_memories() {
    let harness = TestHarness::new();
    let service = &harness.service;
    service
        .ingest("tenant", &event("the only fact around", "user_fact", "alice"))
        .unwrap();
    service
        .retrieve("tenant", &retrieve_params("fact", 5))
        .unwrap();
    service
        .retrieve("tenant", &retrieve_params("fact", 5))
        .unwrap();
    let records = service.engine().list_memories(None, Some("tenant")).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].retrieval_count, 2);
}

#[test]
fn time_range_filter_applies() {
    let harness = TestHarness::new();
    let service = &harness.service;
    service
        .ingest("tenant", &event("recent observation", "user_fact", "alice"))
        .unwrap();
    let mut params = retrieve_params("observation", 5);
    params.end_time = Some(chrono::Utc::now() - chrono::Duration::days(1));
    params.start_time = Some(chrono::Utc::now() - chrono::Duration::days(2));
    let outcome = service.retrieve("tenant", &params).unwrap();
    assert!(outcome.memories.is_empty());
}
