//! JSON Schema validation for persisted and inbound artifacts.
//!
//! Schemas are embedded at build time and compiled once (Draft 7). Every
//! object schema sets `additionalProperties: false`: unknown fields are a
//! hard failure, matching the `deny_unknown_fields` serde layer. Errors
//! report the JSON pointer of the first offending location.

use jsonschema::{Draft, JSONSchema};
use serde_json::{Value, json};

use crate::error::{CoreError, Result};

/// Artifact kinds with an embedded schema.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchemaKind {
    WorkingSet,
    WsPatch,
    LedgerEvent,
    MemoryItem,
    MemoryChange,
    Episode,
    PackManifest,
}

impl SchemaKind {
    fn name(&self) -> &'static str {
        match self {
            Self::WorkingSet => "working_set",
            Self::WsPatch => "ws_patch",
            Self::LedgerEvent => "ledger_event",
            Self::MemoryItem => "memory_item",
            Self::MemoryChange => "memory_change",
            Self::Episode => "episode",
            Self::PackManifest => "pack_manifest",
        }
    }
}

/// Compiled schema registry, built once at service init.
pub struct SchemaSet {
    working_set: JSONSchema,
    ws_patch: JSONSchema,
    ledger_event: JSONSchema,
    memory_item: JSONSchema,
    memory_change: JSONSchema,
    episode: JSONSchema,
    pack_manifest: JSONSchema,
}

impl SchemaSet {
    pub fn new() -> Result<Self> {
        Ok(Self {
            working_set: compile("working_set", &working_set_document())?,
            ws_patch: compile("ws_patch", &ws_patch_document())?,
            ledger_event: compile("ledger_event", &ledger_event_document())?,
            memory_item: compile("memory_item", &memory_item_document())?,
            memory_change: compile("memory_change", &memory_change_document())?,
            episode: compile("episode", &episode_document())?,
            pack_manifest: compile("pack_manifest", &pack_manifest_document())?,
        })
    }

    /// Validate `doc` against the schema for `kind`, reporting the first
    /// violation as a pointer + message.
    pub fn validate(&self, kind: SchemaKind, doc: &Value) -> Result<()> {
        let compiled = match kind {
            SchemaKind::WorkingSet => &self.working_set,
            SchemaKind::WsPatch => &self.ws_patch,
            SchemaKind::LedgerEvent => &self.ledger_event,
            SchemaKind::MemoryItem => &self.memory_item,
            SchemaKind::MemoryChange => &self.memory_change,
            SchemaKind::Episode => &self.episode,
            SchemaKind::PackManifest => &self.pack_manifest,
        };
        if let Err(mut errors) = compiled.validate(doc) {
            if let Some(error) = errors.next() {
                return Err(CoreError::Schema {
                    pointer: error.instance_path.to_string(),
                    message: error.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn compile(name: &str, schema: &Value) -> Result<JSONSchema> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| CoreError::Schema {
            pointer: String::new(),
            message: format!("failed to compile embedded schema {name}: {e}"),
        })
}

// ── Embedded schemas ─────────────────────────────────────────────────────

fn schema_version_property() -> Value {
    json!({ "const": "2.1" })
}

fn context_item_definition() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["id", "content", "timestamp", "priority"],
        "properties": {
            "id": { "type": "string", "minLength": 1 },
            "content": { "type": "string" },
            "timestamp": { "type": "string" },
            "priority": { "type": "integer" },
            "tokens": { "type": "integer", "minimum": 0 }
        }
    })
}

/// Working-set object shape, referencing `#/definitions/context_item`.
fn working_set_shape() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "_schema_version", "run_id", "task_id", "thread_id", "_update_seq",
            "objective", "acceptance_criteria", "constraints", "status",
            "current_stage", "next_action", "pinned_context", "sliding_context"
        ],
        "properties": {
            "_schema_version": schema_version_property(),
            "run_id": { "type": "string", "minLength": 1 },
            "task_id": { "type": "string" },
            "thread_id": { "type": "string" },
            "_update_seq": { "type": "integer", "minimum": 0 },
            "objective": { "type": "string" },
            "acceptance_criteria": { "type": "array", "items": { "type": "string" } },
            "constraints": { "type": "array", "items": { "type": "string" } },
            "status": { "enum": ["BOOT", "BUSY", "IDLE", "DONE", "FAILED"] },
            "current_stage": { "type": "string" },
            "next_action": { "type": "string" },
            "pinned_context": {
                "type": "array",
                "items": { "$ref": "#/definitions/context_item" }
            },
            "sliding_context": {
                "type": "array",
                "items": { "$ref": "#/definitions/context_item" }
            }
        }
    })
}

fn working_set_document() -> Value {
    let mut document = working_set_shape();
    document["definitions"] = json!({ "context_item": context_item_definition() });
    document
}

fn ws_patch_document() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["_schema_version", "expected_seq"],
        "definitions": { "context_item": context_item_definition() },
        "properties": {
            "_schema_version": schema_version_property(),
            "expected_seq": { "type": "integer", "minimum": 0 },
            "set": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "objective": { "type": "string" },
                    "acceptance_criteria": { "type": "array", "items": { "type": "string" } },
                    "constraints": { "type": "array", "items": { "type": "string" } },
                    "status": { "enum": ["BOOT", "BUSY", "IDLE", "DONE", "FAILED"] },
                    "current_stage": { "type": "string" },
                    "next_action": { "type": "string" }
                }
            },
            "pinned_append": {
                "type": "array",
                "items": { "$ref": "#/definitions/context_item" }
            },
            "pinned_remove": { "type": "array", "items": { "type": "string" } },
            "sliding_append": {
                "type": "array",
                "items": { "$ref": "#/definitions/context_item" }
            },
            "sliding_remove": { "type": "array", "items": { "type": "string" } },
            "status": { "enum": ["BOOT", "BUSY", "IDLE", "DONE", "FAILED"] }
        }
    })
}

fn ledger_event_document() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "_schema_version", "sequence_id", "event_id", "event_type",
            "timestamp", "payload"
        ],
        "properties": {
            "_schema_version": schema_version_property(),
            "sequence_id": { "type": "integer", "minimum": 0 },
            "event_id": { "type": "string", "minLength": 1 },
            "event_type": {
                "enum": [
                    "BOOT", "WS_UPDATE_APPLIED", "WS_UPDATE_REJECTED",
                    "MEMORY_PROPOSED", "MEMORY_COMMITTED", "EPISODE_SEALED",
                    "RESUME_SNAPSHOT", "RESUME_LOADED"
                ]
            },
            "timestamp": { "type": "string" },
            "payload": { "type": "object" }
        }
    })
}

fn memory_item_document() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "_schema_version", "id", "type", "scope", "content", "confidence",
            "rationale", "status", "batch_id", "created_at"
        ],
        "properties": {
            "_schema_version": schema_version_property(),
            "id": { "type": "string", "minLength": 1 },
            "type": { "enum": ["fact", "preference", "skill", "other"] },
            "scope": { "enum": ["global", "run", "task", "thread"] },
            "content": { "type": "string" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "rationale": { "type": "string" },
            "source_refs": { "type": "array", "items": { "type": "string" } },
            "status": { "enum": ["proposed", "committed", "retracted"] },
            "batch_id": { "type": "string", "minLength": 1 },
            "created_at": { "type": "string" },
            "committed_at": { "type": "string" }
        }
    })
}

fn memory_change_document() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["op"],
        "properties": {
            "op": { "enum": ["add", "update", "retract"] },
            "target_id": { "type": "string", "minLength": 1 },
            "type": { "enum": ["fact", "preference", "skill", "other"] },
            "scope": { "enum": ["global", "run", "task", "thread"] },
            "content": { "type": "string" },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "rationale": { "type": "string" },
            "source_refs": { "type": "array", "items": { "type": "string" } }
        }
    })
}

fn episode_document() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": [
            "_schema_version", "episode_id", "run_id", "reason", "created_at",
            "ws_before", "ws_after", "ledger_span", "committed_memory_ids",
            "next_entry_point", "summary"
        ],
        "definitions": {
            "context_item": context_item_definition(),
            "working_set": working_set_shape()
        },
        "properties": {
            "_schema_version": schema_version_property(),
            "episode_id": { "type": "string", "minLength": 1 },
            "run_id": { "type": "string", "minLength": 1 },
            "reason": { "type": "string" },
            "created_at": { "type": "string" },
            "ws_before": { "$ref": "#/definitions/working_set" },
            "ws_after": { "$ref": "#/definitions/working_set" },
            "ledger_span": {
                "type": "object",
                "additionalProperties": false,
                "required": ["from_seq", "to_seq"],
                "properties": {
                    "from_seq": { "type": "integer", "minimum": 0 },
                    "to_seq": { "type": "integer", "minimum": 0 }
                }
            },
            "committed_memory_ids": { "type": "array", "items": { "type": "string" } },
            "next_entry_point": { "type": "string" },
            "summary": {
                "type": "object",
                "additionalProperties": false,
                "required": ["event_counts", "tail"],
                "properties": {
                    "event_counts": {
                        "type": "object",
                        "additionalProperties": { "type": "integer", "minimum": 0 }
                    },
                    "tail": { "type": "array", "items": { "type": "string" } }
                }
            }
        }
    })
}

fn pack_manifest_document() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["_schema_version", "pack_id", "run_id", "created_at", "files", "pointers"],
        "properties": {
            "_schema_version": schema_version_property(),
            "pack_id": { "type": "string", "minLength": 1 },
            "run_id": { "type": "string", "minLength": 1 },
            "created_at": { "type": "string" },
            "files": {
                "type": "object",
                "additionalProperties": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["sha256", "size"],
                    "properties": {
                        "sha256": {
                            "type": "string",
                            "pattern": "^[0-9a-f]{64}$"
                        },
                        "size": { "type": "integer", "minimum": 0 }
                    }
                }
            },
            "pointers": { "type": "object" }
        }
    })
}
