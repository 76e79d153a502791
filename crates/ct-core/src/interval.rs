//! Interval reconstruction from sparse state history.
//!
//! # Algorithm Summary
//!
//! 1. Each history record opens an interval that runs until the next record,
//!    or until `last_updated` for the newest one.
//! 2. If the first record is more than [`GAP_FILL_THRESHOLD`] after creation,
//!    a [`GapFill`] strategy may synthesize a leading interval from
//!    `created_at`.
//! 3. Without any history, `[created_at, last_updated)` is a single interval in
//!    the current state.
//! 4. Every interval is clipped to the query window and the matching ones are
//!    summed in hours.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{ResourceState, RunState, StateChangeRecord};

/// Minimum gap between creation and the first record before gap filling applies.
pub const GAP_FILL_THRESHOLD: Duration = Duration::minutes(1);

const MS_PER_HOUR: f64 = 3_600_000.0;

/// A half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Length of the window in hours; zero for empty or inverted windows.
    pub fn duration_hours(&self) -> f64 {
        duration_hours(self.start, self.end)
    }

    /// Hours of `[start, end)` that fall inside this window.
    pub fn overlap_hours(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        duration_hours(start.max(self.start), end.min(self.end))
    }
}

/// A reconstructed interval of constant run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: RunState,
    /// Whether the state was guessed by a [`GapFill`] strategy.
    pub inferred: bool,
}

/// Strategy for the state of a resource between creation and its first record.
///
/// Returning `None` leaves the gap unbilled in either state.
pub trait GapFill {
    fn infer(
        &self,
        created_at: DateTime<Utc>,
        first_record: &StateChangeRecord,
        current: RunState,
    ) -> Option<RunState>;
}

/// Assumes the resource was in the opposite of its current state before the
/// first record.
#[derive(Debug, Clone, Copy, Default)]
pub struct OppositeOfCurrent;

impl GapFill for OppositeOfCurrent {
    fn infer(
        &self,
        created_at: DateTime<Utc>,
        first_record: &StateChangeRecord,
        current: RunState,
    ) -> Option<RunState> {
        (first_record.timestamp - created_at > GAP_FILL_THRESHOLD).then_some(current.opposite())
    }
}

/// Never fills the gap before the first record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGapFill;

impl GapFill for NoGapFill {
    fn infer(&self, _: DateTime<Utc>, _: &StateChangeRecord, _: RunState) -> Option<RunState> {
        None
    }
}

/// Rebuilds the intervals of constant state for a resource, oldest first.
pub fn state_intervals(resource: &ResourceState, gap_fill: &dyn GapFill) -> Vec<StateInterval> {
    let history = resource.history();
    let Some(first) = history.first() else {
        return vec![StateInterval {
            start: resource.created_at,
            end: resource.last_updated,
            state: resource.run_state(),
            inferred: false,
        }];
    };

    let mut intervals = Vec::with_capacity(history.len() + 1);
    if let Some(state) = gap_fill.infer(resource.created_at, first, resource.run_state()) {
        intervals.push(StateInterval {
            start: resource.created_at,
            end: first.timestamp,
            state,
            inferred: true,
        });
    }

    for (i, record) in history.iter().enumerate() {
        let end = history
            .get(i + 1)
            .map_or(resource.last_updated, |next| next.timestamp);
        intervals.push(StateInterval {
            start: record.timestamp,
            end,
            state: record.run_state(),
            inferred: false,
        });
    }

    intervals
}

/// Hours within `window` during which the resource was in `predicate` state.
pub fn hours_matching(
    resource: &ResourceState,
    predicate: RunState,
    window: Window,
    gap_fill: &dyn GapFill,
) -> f64 {
    state_intervals(resource, gap_fill)
        .iter()
        .filter(|interval| interval.state == predicate)
        .map(|interval| window.overlap_hours(interval.start, interval.end))
        .sum()
}

#[allow(clippy::cast_precision_loss)]
fn duration_hours(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    if end <= start {
        return 0.0;
    }
    (end - start).num_milliseconds() as f64 / MS_PER_HOUR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Observation;
    use crate::types::{PriceClassId, ResourceId};
    use chrono::TimeZone;

    const EPSILON: f64 = 1e-6;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn hours(h: i64) -> DateTime<Utc> {
        t0() + Duration::hours(h)
    }

    fn record(status: &str, power_state: i32, at: DateTime<Utc>) -> StateChangeRecord {
        StateChangeRecord {
            status: status.to_string(),
            power_state,
            timestamp: at,
        }
    }

    fn resource(
        status: &str,
        power_state: i32,
        last_updated: DateTime<Utc>,
        history: Vec<StateChangeRecord>,
    ) -> ResourceState {
        let mut state = ResourceState::from_observation(&Observation {
            id: ResourceId::new("vm-1").unwrap(),
            name: "web".to_string(),
            price_class: PriceClassId::new("m2.c4m8").unwrap(),
            status: status.to_string(),
            power_state,
            created_at: t0(),
            observed_at: last_updated,
            changed_at: None,
        });
        state.replace_history(history);
        state
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < EPSILON,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn leading_gap_is_filled_with_opposite_of_current_state() {
        // Created at T0, stopped at T0+2h, still stopped.
        let vm = resource("SHUTOFF", 4, hours(10), vec![record("SHUTOFF", 4, hours(2))]);
        let window = Window::new(t0(), hours(10));

        let running = hours_matching(&vm, RunState::Running, window, &OppositeOfCurrent);
        let shutdown = hours_matching(&vm, RunState::Shutdown, window, &OppositeOfCurrent);

        assert_close(running, 2.0);
        assert_close(shutdown, 8.0);
    }

    #[test]
    fn gap_fill_can_be_disabled() {
        let vm = resource("SHUTOFF", 4, hours(10), vec![record("SHUTOFF", 4, hours(2))]);
        let window = Window::new(t0(), hours(10));

        assert_close(hours_matching(&vm, RunState::Running, window, &NoGapFill), 0.0);
        assert_close(hours_matching(&vm, RunState::Shutdown, window, &NoGapFill), 8.0);
    }

    #[test]
    fn gap_under_threshold_is_not_filled() {
        let first = t0() + Duration::seconds(30);
        let vm = resource("ACTIVE", 1, hours(1), vec![record("ACTIVE", 1, first)]);

        let intervals = state_intervals(&vm, &OppositeOfCurrent);
        assert_eq!(intervals.len(), 1);
        assert!(!intervals[0].inferred);
    }

    #[test]
    fn intervals_end_at_next_record_or_last_update() {
        let vm = resource(
            "ACTIVE",
            1,
            hours(6),
            vec![
                record("ACTIVE", 1, t0()),
                record("SHUTOFF", 4, hours(1)),
                record("ACTIVE", 1, hours(4)),
            ],
        );
        let intervals = state_intervals(&vm, &OppositeOfCurrent);

        let spans: Vec<_> = intervals.iter().map(|i| (i.start, i.end, i.state)).collect();
        assert_eq!(
            spans,
            vec![
                (t0(), hours(1), RunState::Running),
                (hours(1), hours(4), RunState::Shutdown),
                (hours(4), hours(6), RunState::Running),
            ]
        );
    }

    #[test]
    fn window_clips_intervals() {
        let vm = resource(
            "ACTIVE",
            1,
            hours(6),
            vec![
                record("ACTIVE", 1, t0()),
                record("SHUTOFF", 4, hours(1)),
                record("ACTIVE", 1, hours(4)),
            ],
        );
        let window = Window::new(hours(3), hours(5));

        assert_close(hours_matching(&vm, RunState::Running, window, &OppositeOfCurrent), 1.0);
        assert_close(hours_matching(&vm, RunState::Shutdown, window, &OppositeOfCurrent), 1.0);
    }

    #[test]
    fn empty_history_uses_current_state_for_whole_lifetime() {
        let vm = resource("ACTIVE", 1, hours(5), Vec::new());

        let window = Window::new(hours(-3), hours(3));
        assert_close(hours_matching(&vm, RunState::Running, window, &OppositeOfCurrent), 3.0);
        assert_close(hours_matching(&vm, RunState::Shutdown, window, &OppositeOfCurrent), 0.0);
    }

    #[test]
    fn windows_outside_the_lifetime_contribute_nothing() {
        let vm = resource("ACTIVE", 1, hours(5), vec![record("ACTIVE", 1, t0())]);

        let before = Window::new(hours(-10), hours(-1));
        let after = Window::new(hours(6), hours(9));
        let inverted = Window::new(hours(4), hours(2));
        for window in [before, after, inverted] {
            assert_close(hours_matching(&vm, RunState::Running, window, &OppositeOfCurrent), 0.0);
        }
    }

    #[test]
    fn running_and_shutdown_hours_cover_the_window() {
        let vm = resource(
            "SHUTOFF",
            4,
            hours(24),
            vec![
                record("ACTIVE", 1, t0()),
                record("SHUTOFF", 4, hours(7)),
                record("ACTIVE", 1, hours(9)),
            ],
        );
        // Newest record is ACTIVE but the resource now reports SHUTOFF; the
        // interval states come from the records, not the current status.
        let windows = [
            Window::new(t0(), hours(24)),
            Window::new(hours(1), hours(8)),
            Window::new(hours(6) + Duration::minutes(17), hours(9) + Duration::seconds(5)),
            Window::new(hours(20), hours(20)),
        ];
        for window in windows {
            let running = hours_matching(&vm, RunState::Running, window, &OppositeOfCurrent);
            let shutdown = hours_matching(&vm, RunState::Shutdown, window, &OppositeOfCurrent);
            assert_close(running + shutdown, window.duration_hours());
        }
    }

    #[test]
    fn widening_the_window_never_decreases_running_hours() {
        let vm = resource(
            "ACTIVE",
            1,
            hours(12),
            vec![
                record("SHUTOFF", 4, hours(2)),
                record("ACTIVE", 1, hours(5)),
                record("SHUTOFF", 4, hours(8)),
            ],
        );
        let mut previous = 0.0;
        for widen in 0..12 {
            let window = Window::new(hours(6 - widen), hours(7 + widen));
            let running = hours_matching(&vm, RunState::Running, window, &OppositeOfCurrent);
            assert!(running + EPSILON >= previous, "{running} < {previous}");
            previous = running;
        }
    }
}
