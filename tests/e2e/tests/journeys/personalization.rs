//! Personalization journeys: repeat-topic inference, preference inference
//! from feedback, provenance, signature refresh/supersession, and TTL.

use engram_e2e_tests::{backdate_memory, event, helpful_feedback, TestHarness};
use engram_server::service::RetrieveParams;

fn entity_params(query: &str, entity: &str, limit: usize) -> RetrieveParams {
    RetrieveParams {
        query: query.to_string(),
        limit,
        entity_id: Some(entity.to_string()),
        event_type: None,
        start_time: None,
        end_time: None,
    }
}

#[test]
fn repeated_questions_surface_an_inferred_pattern() {
    let harness = TestHarness::new();
    let service = &harness.service;
    for _ in 0..3 {
        service
            .ingest(
                "tenant",
                &event("User asked about Python for-loops", "user_question", "alice"),
            )
            .unwrap();
    }

    let outcome = service
        .retrieve(
            "tenant",
            &entity_params("What does alice struggle with?", "alice", 5),
        )
        .unwrap();

    let inferred: Vec<_> = outcome
        .memories
        .iter()
        .filter(|memory| {
            memory.metadata["intent"]
                .as_str()
                .is_some_and(|intent| intent == "inferred_learning_pattern")
        })
        .collect();
    assert_eq!(inferred.len(), 1, "exactly one inferred pattern in the top-5");
    assert!(inferred[0].content.contains("repeatedly asks"));
    let derived: Vec<_> = inferred[0].metadata["relationships"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|relation| {
            relation
                .as_str()
                .is_some_and(|value| value.starts_with("derived_from:"))
        })
        .collect();
    assert!(derived.len() >= 3, "expected >=3 derived_from, got {}", derived.len());
}

#[test]
fn rewarded_concise_answers_infer_a_preference() {
    let harness = TestHarness::new();
    let service = &harness.service;
    let mut assistant_ids = Vec::new();
    for i in 0..4 {
        let response = service
            .ingest(
                "tenant",
                &event(
                    &format!("Use a simple loop for case {i}. Keep it short."),
                    "assistant_response",
                    "alice",
                ),
            )
            .unwrap();
        assistant_ids.push(response.memory_id.clone());
        service
            .feedback("tenant", &helpful_feedback(&response.memory_id))
            .unwrap();
    }

    let outcome = service
        .retrieve(
            "tenant",
            &entity_params("How should I explain things to alice?", "alice", 5),
        )
        .unwrap();
    let preferences: Vec<_> = outcome
        .memories
        .iter()
        .filter(|memory| {
            memory.metadata["intent"]
                .as_str()
                .is_some_and(|intent| intent == "inferred_preference")
        })
        .collect();
    assert_eq!(preferences.len(), 1, "exactly one inferred preference");
    assert!(preferences[0].content.contains("concise explanations"));

    let relationships = preferences[0].metadata["relationships"].as_array().unwrap();
    let derived: Vec<&str> = relationships
        .iter()
        .filter_map(|relation| relation.as_str())
        .filter_map(|relation| relation.strip_prefix("derived_from:"))
        .collect();
    assert!(!derived.is_empty());
    for memory_id in &derived {
        assert!(
            assistant_ids.iter().any(|id| id == memory_id),
            "derived_from must reference the rewarded assistant memories"
        );
    }
}

#[test]
fn inferred_memories_carry_full_provenance() {
    let harness = TestHarness::new();
    let service = &harness.service;
    for _ in 0..3 {
        service
            .ingest(
                "tenant",
                &event("User asked about recursion basics", "user_question", "alice"),
            )
            .unwrap();
    }
    let records = service.engine().list_memories(None, Some("tenant")).unwrap();
    let inferred: Vec<_> = records
        .iter()
        .filter(|record| record.intent.starts_with("inferred_"))
        .collect();
    assert!(!inferred.is_empty());
    for record in inferred {
        assert!(record.relationships.iter().any(|r| r == "inferred:true"));
        assert_eq!(
            record
                .relationships
                .iter()
                .filter(|r| r.starts_with("inference_type:"))
                .count(),
            1
        );
        assert_eq!(
            record
                .relationships
                .iter()
                .filter(|r| r.starts_with("signature:"))
                .count(),
            1
        );
        assert!(
            record
                .relationships
                .iter()
                .any(|r| r.starts_with("derived_from:")),
            "at least one derived_from relationship"
        );
    }
}

#[test]
fn signatures_refresh_and_supersede_beyond_the_window() {
    let mut harness = TestHarness::new();
    for _ in 0..3 {
        harness
            .service
            .ingest(
                "tenant",
                &event("User asked about Python for-loops", "user_question", "alice"),
            )
            .unwrap();
    }
    let inferred_before: Vec<_> = harness
        .service
        .engine()
        .list_memories(None, Some("tenant"))
        .unwrap()
        .into_iter()
        .filter(|record| record.intent == "inferred_learning_pattern")
        .collect();
    assert_eq!(inferred_before.len(), 1);
    let old_id = inferred_before[0].memory_id.clone();

    // Another trigger inside the refresh window adds nothing
    harness
        .service
        .ingest(
            "tenant",
            &event("User asked about Python for-loops", "user_question", "alice"),
        )
        .unwrap();
    let still_one = harness
        .service
        .engine()
        .list_memories(None, Some("tenant"))
        .unwrap()
        .into_iter()
        .filter(|record| record.intent == "inferred_learning_pattern")
        .count();
    assert_eq!(still_one, 1);

    // Age the inferred memory past the refresh window and restart so the
    // in-memory signature registry starts cold
    backdate_memory(&harness.db_path(), &old_id, 20);
    harness.restart();
    harness
        .service
        .ingest(
            "tenant",
            &event("User asked about Python for-loops", "user_question", "alice"),
        )
        .unwrap();

    let inferred_after: Vec<_> = harness
        .service
        .engine()
        .list_memories(None, Some("tenant"))
        .unwrap()
        .into_iter()
        .filter(|record| record.intent == "inferred_learning_pattern")
        .collect();
    assert_eq!(inferred_after.len(), 1, "superseded memory deleted");
    assert_ne!(inferred_after[0].memory_id, old_id, "fresh memory replaces it");
}

#[test]
fn expired_inferred_memories_are_pruned_on_ingest() {
    let mut harness = TestHarness::new();
    for _ in 0..3 {
        harness
            .service
            .ingest(
                "tenant",
                &event("User asked about Python for-loops", "user_question", "alice"),
            )
            .unwrap();
    }
    let inferred_id = harness
        .service
        .engine()
        .list_memories(None, Some("tenant"))
        .unwrap()
        .into_iter()
        .find(|record| record.intent == "inferred_learning_pattern")
        .map(|record| record.memory_id)
        .expect("inferred memory");

    // Older than the 45-day TTL
    backdate_memory(&harness.db_path(), &inferred_id, 50);
    harness.restart();
    harness
        .service
        .ingest("tenant", &event("fresh unrelated fact", "user_fact", "zoe"))
        .unwrap();

    let remaining = harness
        .service
        .engine()
        .fetch_memories(&[inferred_id], "tenant")
        .unwrap();
    assert!(remaining.is_empty(), "expired inferred memory still present");
}
