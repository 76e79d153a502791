//! Status command for showing the run state of tracked resources.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ct_core::{FleetStats, OppositeOfCurrent, ResourceState, RunState, Window, hours_matching};
use ct_db::Database;
use serde::Serialize;

use super::util::format_duration;
use crate::Config;

#[derive(Serialize)]
struct JsonStatus<'a> {
    database: String,
    #[serde(flatten)]
    stats: FleetStats,
    resources: Vec<JsonResource<'a>>,
}

#[derive(Serialize)]
struct JsonResource<'a> {
    id: &'a str,
    name: &'a str,
    price_class: &'a str,
    state: RunState,
    status: &'a str,
    power_state: i32,
    state_duration_minutes: i64,
    running_hours: f64,
    shutdown_hours: f64,
    last_updated: DateTime<Utc>,
}

/// Running and shutdown hours over the resource's whole tracked lifetime.
/// Time before the first record counts as the opposite of the current state.
fn lifetime_hours(resource: &ResourceState) -> (f64, f64) {
    let lifetime = Window::new(resource.created_at, resource.last_updated);
    let hours = |state| hours_matching(resource, state, lifetime, &OppositeOfCurrent);
    (hours(RunState::Running), hours(RunState::Shutdown))
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    config: &Config,
    json: bool,
) -> Result<()> {
    let snapshot = db.load_snapshot().context("failed to load resource snapshot")?;
    let mut resources: Vec<&ResourceState> = snapshot.values().collect();
    resources.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let stats = FleetStats::from_snapshot(resources.iter().copied());

    if json {
        let status = JsonStatus {
            database: config.database_path.display().to_string(),
            stats,
            resources: resources
                .iter()
                .map(|resource| {
                    let (running_hours, shutdown_hours) = lifetime_hours(resource);
                    JsonResource {
                        id: resource.id.as_str(),
                        name: &resource.name,
                        price_class: resource.price_class.as_str(),
                        state: resource.run_state(),
                        status: &resource.current_status,
                        power_state: resource.current_power_state,
                        state_duration_minutes: resource.current_state_duration().num_minutes(),
                        running_hours,
                        shutdown_hours,
                        last_updated: resource.last_updated,
                    }
                })
                .collect(),
        };
        writeln!(writer, "{}", serde_json::to_string_pretty(&status)?)?;
        return Ok(());
    }

    writeln!(writer, "Cost tracker status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;

    if resources.is_empty() {
        writeln!(writer, "No resources tracked.")?;
        return Ok(());
    }

    writeln!(
        writer,
        "Resources: {} ({} running, {} shutdown)",
        stats.total, stats.running, stats.shutdown
    )?;
    writeln!(writer)?;
    for resource in resources {
        let (running_hours, shutdown_hours) = lifetime_hours(resource);
        writeln!(
            writer,
            "- {} [{}] {} for {}, ran {running_hours:.2}h, stopped {shutdown_hours:.2}h",
            resource.name,
            resource.price_class,
            resource.run_state(),
            format_duration(resource.current_state_duration())
        )?;
    }

    Ok(())
}
