//! S4: episode ledger spans tile the event history exactly.

use pretty_assertions::assert_eq;
use runstate_core::sealer::SealRequest;
use runstate_protocol::{MemoryChange, MemoryScope, MemoryType};
use tempfile::TempDir;

use super::common;

#[test]
fn first_episode_covers_everything_through_its_seal() {
    let dir = TempDir::new().unwrap();
    let service = common::service(&dir);
    let run_id = common::boot(&service, "span");

    for seq in 0..3 {
        service
            .apply_patch(&run_id, &common::status_patch(seq, "BUSY"))
            .unwrap();
    }
    let receipt = service
        .propose_memory(
            &run_id,
            &[MemoryChange::add(
                MemoryType::Fact,
                MemoryScope::Run,
                "span fact",
            )],
            None,
        )
        .unwrap();

    service
        .milestone(
            &run_id,
            SealRequest {
                reason: "ck".into(),
                memory_batch_id: Some(receipt.batch_id),
                next_entry_point: Some("continue".into()),
            },
        )
        .unwrap();

    // Expected history: BOOT, 3x APPLIED, PROPOSED, COMMITTED, SEALED.
    let types = common::ledger_event_types(&dir, &run_id);
    assert_eq!(
        types,
        vec![
            "BOOT",
            "WS_UPDATE_APPLIED",
            "WS_UPDATE_APPLIED",
            "WS_UPDATE_APPLIED",
            "MEMORY_PROPOSED",
            "MEMORY_COMMITTED",
            "EPISODE_SEALED"
        ]
    );

    let events = common::ledger_events(&dir, &run_id);
    let sealed = events.last().unwrap();
    let payload = &sealed["payload"];
    // No prior seal: the span starts at 0 and ends at the seal itself.
    assert_eq!(payload["ledger_from"], serde_json::json!(0));
    assert_eq!(payload["ledger_to"], sealed["sequence_id"]);
    assert_eq!(payload["ledger_to"], serde_json::json!(6));
}

#[test]
fn successive_spans_are_adjacent_and_inclusive() {
    let dir = TempDir::new().unwrap();
    let service = common::service(&dir);
    let run_id = common::boot(&service, "span");

    service
        .milestone(&run_id, SealRequest { reason: "one".into(), ..SealRequest::default() })
        .unwrap();
    service
        .apply_patch(&run_id, &common::status_patch(0, "BUSY"))
        .unwrap();
    service
        .milestone(&run_id, SealRequest { reason: "two".into(), ..SealRequest::default() })
        .unwrap();

    let spans: Vec<(u64, u64)> = common::ledger_events(&dir, &run_id)
        .iter()
        .filter(|event| event["event_type"] == "EPISODE_SEALED")
        .map(|event| {
            (
                event["payload"]["ledger_from"].as_u64().unwrap(),
                event["payload"]["ledger_to"].as_u64().unwrap(),
            )
        })
        .collect();

    assert_eq!(spans.len(), 2);
    // [0,1] then [2,3]: adjacent, no gap, no overlap.
    assert_eq!(spans[0], (0, 1));
    assert_eq!(spans[1], (spans[0].1 + 1, 3));
}

#[test]
fn episode_snapshots_agree_with_invariants() {
    let dir = TempDir::new().unwrap();
    let service = common::service(&dir);
    let run_id = common::boot(&service, "span");

    service
        .apply_patch(&run_id, &common::status_patch(0, "BUSY"))
        .unwrap();
    service
        .milestone(&run_id, SealRequest { reason: "ck".into(), ..SealRequest::default() })
        .unwrap();

    let episode = service.latest_episode(&run_id).unwrap().unwrap();
    assert!(episode.ws_before.update_seq <= episode.ws_after.update_seq);
    assert!(episode.ledger_span.from_seq <= episode.ledger_span.to_seq);
    // The sealer checkpoints; it does not mutate the working set.
    assert_eq!(episode.ws_before, episode.ws_after);
    // Deterministic summary: counts cover the pre-seal history.
    assert_eq!(episode.summary.event_counts["BOOT"], 1);
    assert_eq!(episode.summary.event_counts["WS_UPDATE_APPLIED"], 1);
    assert!(!episode.summary.tail.is_empty());
}
