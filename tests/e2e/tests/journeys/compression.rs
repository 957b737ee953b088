//! Compression journeys: repetitive clusters collapse to one summary
//! record that keeps absorbing new events at the key.

use engram_core::StorageTier;
use engram_e2e_tests::{event, TestHarness};

fn purchase_harness() -> TestHarness {
    TestHarness::with(
        |engine| {
            engine.compression_min_count = 5;
        },
        |_| {},
    )
}

fn records_at_key(
    harness: &TestHarness,
    account: &str,
    entity: &str,
    intent: &str,
) -> Vec<engram_core::MemoryRecord> {
    harness
        .service
        .engine()
        .list_memories(None, Some(account))
        .unwrap()
        .into_iter()
        .filter(|record| {
            record.intent == intent && record.entities.iter().any(|item| item == entity)
        })
        .collect()
}

#[test]
fn six_repeats_collapse_to_one_summary() {
    let harness = purchase_harness();
    for i in 0..6 {
        harness
            .service
            .ingest(
                "tenant",
                &event(&format!("Bought the weekly groceries, order {i}"), "purchase", "user_repeat"),
            )
            .unwrap();
    }

    let at_key = records_at_key(&harness, "tenant", "user_repeat", "purchase");
    assert_eq!(at_key.len(), 1, "cluster must collapse to a single record");
    let summary = &at_key[0];
    assert!(summary.is_compressed);
    assert_eq!(summary.original_count, 6);
    assert_eq!(summary.storage_tier, StorageTier::Persistent);
    assert!(summary.latest_importance >= 0.8);
    assert!(summary.content.contains("entity=user_repeat"));
    assert!(summary.content.contains("event_type=purchase"));
}

#[test]
fn below_threshold_clusters_stay_uncompressed() {
    let harness = purchase_harness();
    for i in 0..4 {
        harness
            .service
            .ingest(
                "tenant",
                &event(&format!("Bought groceries, order {i}"), "purchase", "user_repeat"),
            )
            .unwrap();
    }
    let at_key = records_at_key(&harness, "tenant", "user_repeat", "purchase");
    assert_eq!(at_key.len(), 4);
    assert!(at_key.iter().all(|record| !record.is_compressed));
}

#[test]
fn compression_is_scoped_to_the_key() {
    let harness = purchase_harness();
    for i in 0..6 {
        harness
            .service
            .ingest(
                "tenant",
                &event(&format!("Bought groceries, order {i}"), "purchase", "user_repeat"),
            )
            .unwrap();
    }
    // Different entity, same intent: untouched
    harness
        .service
        .ingest("tenant", &event("Bought one book", "purchase", "someone_else"))
        .unwrap();
    // Different intent, same entity: untouched
    harness
        .service
        .ingest("tenant", &event("Asked about refunds", "user_question", "user_repeat"))
        .unwrap();

    assert_eq!(records_at_key(&harness, "tenant", "someone_else", "purchase").len(), 1);
    assert_eq!(
        records_at_key(&harness, "tenant", "user_repeat", "user_question").len(),
        1
    );
    let compressed = records_at_key(&harness, "tenant", "user_repeat", "purchase");
    assert_eq!(compressed.len(), 1);
    assert!(compressed[0].is_compressed);
}

#[test]
fn compression_counts_are_tenant_scoped() {
    let harness = purchase_harness();
    // Four events in each tenant: neither crosses the threshold even
    // though the combined count would
    for tenant in ["tenant-a", "tenant-b"] {
        for i in 0..4 {
            harness
                .service
                .ingest(
                    tenant,
                    &event(&format!("Bought groceries, order {i}"), "purchase", "user_repeat"),
                )
                .unwrap();
        }
    }
    for tenant in ["tenant-a", "tenant-b"] {
        let at_key = records_at_key(&harness, tenant, "user_repeat", "purchase");
        assert_eq!(at_key.len(), 4, "{tenant} compressed prematurely");
        assert!(at_key.iter().all(|record| !record.is_compressed));
    }
}
