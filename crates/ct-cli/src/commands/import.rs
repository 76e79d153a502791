//! Import command for loading resource states from a JSON snapshot.
//!
//! The file holds `{ "instances": { "<id>": <state>, ... } }`. States may use the
//! older field names (`flavor_id`, `state_history`, `updated_at`); files that
//! only carry `status_history` have it used as the state history. Every history
//! is truncated to its newest records on the way in.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use ct_core::ResourceState;
use ct_db::Database;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    instances: Map<String, Value>,
}

/// Parses a snapshot document into resource states, ordered by ID.
pub fn parse_snapshot(json: &str) -> Result<Vec<ResourceState>> {
    let file: SnapshotFile = serde_json::from_str(json).context("invalid snapshot JSON")?;

    let mut states = Vec::with_capacity(file.instances.len());
    for (key, value) in file.instances {
        let Value::Object(mut fields) = value else {
            anyhow::bail!("instance {key} is not an object");
        };
        normalize_fields(&key, &mut fields);
        let state: ResourceState = serde_json::from_value(Value::Object(fields))
            .with_context(|| format!("invalid state for instance {key}"))?;
        states.push(state);
    }
    states.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(states)
}

fn normalize_fields(key: &str, fields: &mut Map<String, Value>) {
    fields
        .entry("id")
        .or_insert_with(|| Value::String(key.to_string()));

    let status_history = fields.remove("status_history");
    let has_state_history = ["history", "state_history"].iter().any(|name| {
        fields
            .get(*name)
            .and_then(Value::as_array)
            .is_some_and(|records| !records.is_empty())
    });
    if let Some(records) = status_history.filter(|_| !has_state_history) {
        fields.remove("history");
        fields.insert("state_history".to_string(), records);
    }
}

pub fn run<W: Write>(writer: &mut W, db: &mut Database, path: &Path) -> Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let states = parse_snapshot(&json)
        .with_context(|| format!("failed to import {}", path.display()))?;

    for state in &states {
        db.upsert_resource(state)
            .with_context(|| format!("failed to store resource {}", state.id))?;
    }
    tracing::info!(count = states.len(), path = %path.display(), "imported snapshot");

    writeln!(writer, "Imported {} resources from {}", states.len(), path.display())?;
    Ok(())
}
