//! S3: the double-key memory gate (batch id plus one-shot milestone token).

use pretty_assertions::assert_eq;
use runstate_core::CoreError;
use runstate_core::memory::SearchQuery;
use runstate_core::sealer::SealRequest;
use runstate_protocol::{MemoryChange, MemoryScope, MemoryStatus, MemoryType};
use tempfile::TempDir;

use super::common;

fn fact(content: &str) -> MemoryChange {
    MemoryChange::add(MemoryType::Fact, MemoryScope::Run, content)
}

#[test]
fn commit_without_token_gates_then_milestone_commits() {
    let dir = TempDir::new().unwrap();
    let service = common::service(&dir);
    let run_id = common::boot(&service, "gate");

    let receipt = service
        .propose_memory(&run_id, &[fact("the answer is 42")], None)
        .unwrap();
    assert_eq!(receipt.proposed_ids.len(), 1);

    // No token, no commit.
    let err = service
        .commit_memory(&run_id, &receipt.batch_id, None, false)
        .unwrap_err();
    assert!(matches!(err, CoreError::Gate { .. }));

    // Sealing with the batch commits it inline.
    let outcome = service
        .milestone(
            &run_id,
            SealRequest {
                reason: "ck".into(),
                memory_batch_id: Some(receipt.batch_id.clone()),
                next_entry_point: None,
            },
        )
        .unwrap();
    assert_eq!(outcome.committed_ids, receipt.proposed_ids);
    assert!(outcome.milestone_token.is_none());

    // The batch is consumed: even a fresh, valid token cannot replay it.
    let token = service
        .milestone(&run_id, SealRequest { reason: "again".into(), ..SealRequest::default() })
        .unwrap()
        .milestone_token
        .unwrap();
    let err = service
        .commit_memory(&run_id, &receipt.batch_id, Some(&token), false)
        .unwrap_err();
    assert!(matches!(err, CoreError::UnknownBatch { .. }));

    let hits = service
        .search_memory(&run_id, &SearchQuery::keyword("answer", 10))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].status, MemoryStatus::Committed);
}

#[test]
fn deferred_commit_with_returned_token_is_one_shot() {
    let dir = TempDir::new().unwrap();
    let service = common::service(&dir);
    let run_id = common::boot(&service, "gate");

    let receipt = service
        .propose_memory(&run_id, &[fact("tokens are single-use")], None)
        .unwrap();

    // Seal without a batch: the token comes back to the caller.
    let outcome = service
        .milestone(
            &run_id,
            SealRequest {
                reason: "ck".into(),
                memory_batch_id: None,
                next_entry_point: None,
            },
        )
        .unwrap();
    let token = outcome.milestone_token.unwrap();

    // Wrong token is rejected without consuming anything.
    let err = service
        .commit_memory(&run_id, &receipt.batch_id, Some("mtk-forged"), false)
        .unwrap_err();
    assert!(matches!(err, CoreError::Gate { .. }));

    // Right token commits.
    let ids = service
        .commit_memory(&run_id, &receipt.batch_id, Some(&token), false)
        .unwrap();
    assert_eq!(ids, receipt.proposed_ids);

    // Token is consumed: a second batch cannot reuse it.
    let second = service
        .propose_memory(&run_id, &[fact("second batch")], None)
        .unwrap();
    let err = service
        .commit_memory(&run_id, &second.batch_id, Some(&token), false)
        .unwrap_err();
    assert!(matches!(err, CoreError::Gate { .. }));
}

#[test]
fn reseal_invalidates_unconsumed_token() {
    let dir = TempDir::new().unwrap();
    let service = common::service(&dir);
    let run_id = common::boot(&service, "gate");

    let receipt = service
        .propose_memory(&run_id, &[fact("stale tokens die")], None)
        .unwrap();

    let first = service
        .milestone(&run_id, SealRequest { reason: "one".into(), ..SealRequest::default() })
        .unwrap();
    let second = service
        .milestone(&run_id, SealRequest { reason: "two".into(), ..SealRequest::default() })
        .unwrap();

    let stale = first.milestone_token.unwrap();
    let err = service
        .commit_memory(&run_id, &receipt.batch_id, Some(&stale), false)
        .unwrap_err();
    assert!(matches!(err, CoreError::Gate { .. }));

    let fresh = second.milestone_token.unwrap();
    service
        .commit_memory(&run_id, &receipt.batch_id, Some(&fresh), false)
        .unwrap();
}

#[test]
fn test_mode_bypass_is_explicit_opt_in() {
    let dir = TempDir::new().unwrap();
    let service = common::service_with(&dir, |config| config.test_mode = true);
    let run_id = common::boot(&service, "bypass");

    let receipt = service
        .propose_memory(&run_id, &[fact("bypassed")], None)
        .unwrap();

    // The flag only works when the service runs in test mode; here it
    // does, so the commit lands without any token.
    let ids = service
        .commit_memory(&run_id, &receipt.batch_id, None, true)
        .unwrap();
    assert_eq!(ids.len(), 1);

    // But the flag is still required; a bare commit stays gated.
    let second = service
        .propose_memory(&run_id, &[fact("still gated")], None)
        .unwrap();
    let err = service
        .commit_memory(&run_id, &second.batch_id, None, false)
        .unwrap_err();
    assert!(matches!(err, CoreError::Gate { .. }));
}

#[test]
fn retract_is_gated_and_final() {
    let dir = TempDir::new().unwrap();
    let service = common::service(&dir);
    let run_id = common::boot(&service, "retract");

    let receipt = service
        .propose_memory(&run_id, &[fact("to be retracted")], None)
        .unwrap();
    let outcome = service
        .milestone(
            &run_id,
            SealRequest {
                reason: "ck".into(),
                memory_batch_id: Some(receipt.batch_id.clone()),
                next_entry_point: None,
            },
        )
        .unwrap();
    let id = outcome.committed_ids[0].clone();

    // Gated: no token, no retraction.
    let err = service
        .retract_memory(&run_id, &id, "cleanup", None, false)
        .unwrap_err();
    assert!(matches!(err, CoreError::Gate { .. }));

    let token = service
        .milestone(&run_id, SealRequest { reason: "rt".into(), ..SealRequest::default() })
        .unwrap()
        .milestone_token
        .unwrap();
    service
        .retract_memory(&run_id, &id, "cleanup", Some(&token), false)
        .unwrap();

    let hits = service
        .search_memory(&run_id, &SearchQuery::keyword("retracted", 10))
        .unwrap();
    assert!(hits.is_empty());
}
