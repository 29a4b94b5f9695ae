//! Shared fixtures for the integration suite.

use chrono::{TimeZone, Utc};
use runstate_core::config::Config;
use runstate_core::service::{BootRequest, StateService};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Service rooted in a fresh temp directory, with config tweaks applied.
pub fn service_with(dir: &TempDir, tweak: impl FnOnce(&mut Config)) -> StateService {
    let mut config = Config {
        runs_root: dir.path().join("runs"),
        ..Config::default()
    };
    tweak(&mut config);
    StateService::new(config).unwrap()
}

pub fn service(dir: &TempDir) -> StateService {
    service_with(dir, |_| {})
}

pub fn boot(service: &StateService, objective: &str) -> String {
    let (run_id, _) = service
        .boot(BootRequest {
            objective: objective.to_string(),
            ..BootRequest::default()
        })
        .unwrap();
    run_id
}

/// A patch that only sets `status`.
pub fn status_patch(expected_seq: u64, status: &str) -> Value {
    json!({
        "_schema_version": "2.1",
        "expected_seq": expected_seq,
        "set": { "status": status }
    })
}

/// A sliding-context item literal with a deterministic timestamp.
pub fn sliding_item(id: &str, priority: i64, content_len: usize, at_secs: i64) -> Value {
    json!({
        "id": id,
        "content": "x".repeat(content_len),
        "timestamp": Utc.timestamp_opt(at_secs, 0).unwrap().to_rfc3339(),
        "priority": priority
    })
}

/// Raw ledger lines for a run, parsed.
pub fn ledger_events(dir: &TempDir, run_id: &str) -> Vec<Value> {
    let path = dir
        .path()
        .join("runs")
        .join(run_id)
        .join("ledger")
        .join("run.jsonl");
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Event-type tags for a run's ledger, in order.
pub fn ledger_event_types(dir: &TempDir, run_id: &str) -> Vec<String> {
    ledger_events(dir, run_id)
        .iter()
        .map(|event| event["event_type"].as_str().unwrap().to_string())
        .collect()
}
