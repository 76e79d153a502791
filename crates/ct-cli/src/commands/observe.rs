//! Observe command for recording a single poll result.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ct_core::{Observation, PriceClassId, ResourceId, RunState};
use ct_db::Database;

use super::util::parse_datetime;
use crate::ObserveArgs;

/// Builds an observation from command-line arguments, resolving relative
/// timestamps against `now`.
pub fn build_observation(args: &ObserveArgs, now: DateTime<Utc>) -> Result<Observation> {
    let parse = |value: Option<&str>, field: &str| {
        value
            .map(|value| parse_datetime(value, now).with_context(|| format!("invalid --{field}")))
            .transpose()
    };

    let observed_at = parse(args.at.as_deref(), "at")?.unwrap_or(now);
    let created_at = parse(args.created_at.as_deref(), "created-at")?.unwrap_or(observed_at);
    let changed_at = parse(args.changed_at.as_deref(), "changed-at")?;

    Ok(Observation {
        id: ResourceId::new(args.id.clone())?,
        name: args.name.clone(),
        price_class: PriceClassId::new(args.class.clone())?,
        status: args.status.clone(),
        power_state: args.power_state,
        created_at,
        observed_at,
        changed_at,
    })
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    args: &ObserveArgs,
    now: DateTime<Utc>,
) -> Result<()> {
    let observation = build_observation(args, now)?;
    let appended = db
        .record_observation(&observation)
        .context("failed to record observation")?;

    let state = RunState::from_status(&observation.status, observation.power_state);
    if appended {
        writeln!(writer, "Recorded {} ({}): {state}", observation.name, observation.id)?;
    } else {
        writeln!(
            writer,
            "Updated {} ({}): {state}, no state change",
            observation.name, observation.id
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 12, 0, 0).unwrap()
    }

    fn args(status: &str, power_state: i32) -> ObserveArgs {
        ObserveArgs {
            id: "vm-1".to_string(),
            name: "web".to_string(),
            class: "m2.c4m8".to_string(),
            status: status.to_string(),
            power_state,
            created_at: None,
            changed_at: None,
            at: None,
        }
    }

    #[test]
    fn timestamps_default_to_now() {
        let observation = build_observation(&args("ACTIVE", 1), now()).unwrap();
        assert_eq!(observation.observed_at, now());
        assert_eq!(observation.created_at, now());
        assert_eq!(observation.changed_at, None);
    }

    #[test]
    fn relative_and_absolute_timestamps() {
        let mut args = args("ACTIVE", 1);
        args.at = Some("10 minutes ago".to_string());
        args.created_at = Some("2025-04-01T00:00:00Z".to_string());
        args.changed_at = Some("1 hour ago".to_string());

        let observation = build_observation(&args, now()).unwrap();
        assert_eq!(observation.observed_at, now() - Duration::minutes(10));
        assert_eq!(
            observation.created_at,
            Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(observation.changed_at, Some(now() - Duration::hours(1)));
    }

    #[test]
    fn invalid_input_is_rejected() {
        let mut bad_time = args("ACTIVE", 1);
        bad_time.at = Some("soon".to_string());
        let err = build_observation(&bad_time, now()).unwrap_err();
        assert!(err.to_string().contains("--at"));

        let mut empty_id = args("ACTIVE", 1);
        empty_id.id = String::new();
        assert!(build_observation(&empty_id, now()).is_err());
    }

    #[test]
    fn reports_whether_history_changed() {
        let mut db = Database::open_in_memory().unwrap();
        let mut output = Vec::new();

        run(&mut output, &mut db, &args("ACTIVE", 1), now()).unwrap();
        run(&mut output, &mut db, &args("ACTIVE", 1), now() + Duration::minutes(5)).unwrap();
        run(&mut output, &mut db, &args("SHUTOFF", 4), now() + Duration::minutes(10)).unwrap();

        let output = String::from_utf8(output).unwrap();
        assert_eq!(
            output,
            "Recorded web (vm-1): RUNNING\n\
             Updated web (vm-1): RUNNING, no state change\n\
             Recorded web (vm-1): SHUTDOWN\n"
        );
    }
}
