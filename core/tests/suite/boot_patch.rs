//! S1/S6: boot, patch, stale-sequence rejection, and concurrent CAS.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use runstate_core::CoreError;
use runstate_core::service::BootRequest;
use runstate_protocol::RunStatus;
use tempfile::TempDir;

use super::common;

#[test]
fn boot_patch_then_reject_stale_seq() {
    let dir = TempDir::new().unwrap();
    let service = common::service(&dir);

    let (run_id, ws) = service
        .boot(BootRequest {
            objective: "A".into(),
            ..BootRequest::default()
        })
        .unwrap();
    assert_eq!(ws.update_seq, 0);

    let outcome = service
        .apply_patch(&run_id, &common::status_patch(0, "BUSY"))
        .unwrap();
    assert_eq!(outcome.ws.update_seq, 1);
    assert_eq!(outcome.ws.status, RunStatus::Busy);
    assert!(outcome.context_brief.contains("## Objective"));

    let err = service
        .apply_patch(&run_id, &common::status_patch(0, "IDLE"))
        .unwrap_err();
    match err {
        CoreError::Conflict { current_seq } => assert_eq!(current_seq, 1),
        other => panic!("expected conflict, got {other:?}"),
    }

    assert_eq!(
        common::ledger_event_types(&dir, &run_id),
        vec!["BOOT", "WS_UPDATE_APPLIED", "WS_UPDATE_REJECTED"]
    );
}

#[test]
fn sequence_ids_are_dense_from_zero() {
    let dir = TempDir::new().unwrap();
    let service = common::service(&dir);
    let run_id = common::boot(&service, "dense");

    for seq in 0..4 {
        service
            .apply_patch(&run_id, &common::status_patch(seq, "BUSY"))
            .unwrap();
    }

    let events = common::ledger_events(&dir, &run_id);
    let seqs: Vec<u64> = events
        .iter()
        .map(|event| event["sequence_id"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, (0..events.len() as u64).collect::<Vec<_>>());
}

#[test]
fn concurrent_patches_one_wins_one_conflicts() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(common::service(&dir));
    let run_id = common::boot(&service, "race");

    // Advance to _update_seq = 5 so both contenders read the same state.
    for seq in 0..5 {
        service
            .apply_patch(&run_id, &common::status_patch(seq, "BUSY"))
            .unwrap();
    }

    let mut threads = Vec::new();
    for status in ["IDLE", "DONE"] {
        let service = Arc::clone(&service);
        let run_id = run_id.clone();
        threads.push(std::thread::spawn(move || {
            service.apply_patch(&run_id, &common::status_patch(5, status))
        }));
    }
    let results: Vec<_> = threads
        .into_iter()
        .map(|thread| thread.join().unwrap())
        .collect();

    let successes = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(successes, 1, "exactly one contender must win");
    let conflict = results
        .iter()
        .find_map(|result| result.as_ref().err())
        .unwrap();
    match conflict {
        CoreError::Conflict { current_seq } => assert_eq!(*current_seq, 6),
        other => panic!("expected conflict, got {other:?}"),
    }

    assert_eq!(service.get_ws(&run_id).unwrap().update_seq, 6);

    let types = common::ledger_event_types(&dir, &run_id);
    assert!(types.contains(&"WS_UPDATE_REJECTED".to_string()));
    assert_eq!(
        types
            .iter()
            .filter(|tag| *tag == "WS_UPDATE_APPLIED")
            .count(),
        6
    );
}
