//! Context brief rendering.
//!
//! A pure function of its inputs: identical working set, ledger tail, and
//! memory results produce byte-identical markdown. No clock reads and no
//! nondeterministic iteration; section order and item order are fixed.

use runstate_protocol::{ContextItem, LedgerEvent, MemoryItem, WorkingSet};

use crate::tokens;

/// Render the brief handed back to the agent after each applied patch.
///
/// Section order is fixed: Objective, Acceptance Criteria, Constraints,
/// Current Stage + Next Action, Pinned Context, Sliding Context, then
/// Recent Events and Long-Term Memory when provided.
pub fn render(
    ws: &WorkingSet,
    recent_ledger_tail: Option<&[LedgerEvent]>,
    memory_results: Option<&[MemoryItem]>,
) -> String {
    let mut out = String::new();

    out.push_str("# Context Brief\n\n");
    out.push_str("## Objective\n\n");
    out.push_str(&ws.objective);
    out.push_str("\n\n## Acceptance Criteria\n\n");
    push_list(&mut out, &ws.acceptance_criteria);
    out.push_str("\n## Constraints\n\n");
    push_list(&mut out, &ws.constraints);
    out.push_str("\n## Stage\n\n");
    out.push_str(&format!(
        "- Status: {}\n- Current stage: {}\n- Next action: {}\n",
        status_label(ws),
        ws.current_stage,
        ws.next_action
    ));
    out.push_str("\n## Pinned Context\n\n");
    push_items(&mut out, &ws.pinned_context);
    out.push_str("\n## Sliding Context\n\n");
    push_items(&mut out, &ws.sliding_context);

    if let Some(tail) = recent_ledger_tail {
        out.push_str("\n## Recent Events\n\n");
        if tail.is_empty() {
            out.push_str("(none)\n");
        }
        for event in tail {
            out.push_str(&format!(
                "- [{}] {}\n",
                event.sequence_id,
                event.event_type.as_str()
            ));
        }
    }

    if let Some(results) = memory_results {
        out.push_str("\n## Long-Term Memory\n\n");
        if results.is_empty() {
            out.push_str("(none)\n");
        }
        for item in results {
            out.push_str(&format!(
                "- ({:.2}) {}: {}\n",
                item.confidence,
                item.id,
                item.content
            ));
        }
    }

    out
}

fn status_label(ws: &WorkingSet) -> String {
    // Reuse the wire tag so the brief matches what the ledger records.
    serde_json::to_value(ws.status)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn push_list(out: &mut String, entries: &[String]) {
    if entries.is_empty() {
        out.push_str("(none)\n");
        return;
    }
    for entry in entries {
        out.push_str(&format!("- {entry}\n"));
    }
}

fn push_items(out: &mut String, items: &[ContextItem]) {
    if items.is_empty() {
        out.push_str("(none)\n");
        return;
    }
    for item in items {
        out.push_str(&format!(
            "- `{}` (priority {}, ~{} tokens): {}\n",
            item.id,
            item.priority,
            tokens::item_tokens(item),
            item.content
        ));
    }
}
