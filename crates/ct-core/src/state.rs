//! Resource state snapshots and their bounded change history.
//!
//! A [`ResourceState`] is created on the first observation of a resource and
//! mutated by every later one. Only the [`HISTORY_LIMIT`] newest
//! [`StateChangeRecord`]s are kept; a record marks the *start* of an interval
//! of constant state which ends at the next record, or at `last_updated` for
//! the newest one.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{PriceClassId, ResourceId};

/// Status reported for a resource that is up.
pub const STATUS_ACTIVE: &str = "ACTIVE";

/// Status reported for a resource that has been stopped.
pub const STATUS_SHUTOFF: &str = "SHUTOFF";

/// Power-state code of a powered-on resource.
pub const POWER_STATE_RUNNING: i32 = 1;

/// Power-state code of a powered-off resource.
pub const POWER_STATE_SHUTDOWN: i32 = 4;

/// Maximum number of history records retained per resource.
pub const HISTORY_LIMIT: usize = 3;

/// Billing-relevant state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Status `ACTIVE` with power state 1.
    Running,
    /// Any other combination.
    Shutdown,
}

impl RunState {
    /// Applies the running predicate to a status/power-state pair.
    pub fn from_status(status: &str, power_state: i32) -> Self {
        if status == STATUS_ACTIVE && power_state == POWER_STATE_RUNNING {
            Self::Running
        } else {
            Self::Shutdown
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Running => Self::Shutdown,
            Self::Shutdown => Self::Running,
        }
    }

    /// Category label used by `status` discount conditions.
    pub const fn category(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.category())
    }
}

/// A timestamped state snapshot marking the start of an interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeRecord {
    pub status: String,
    pub power_state: i32,
    pub timestamp: DateTime<Utc>,
}

impl StateChangeRecord {
    pub fn run_state(&self) -> RunState {
        RunState::from_status(&self.status, self.power_state)
    }

    fn has_state(&self, status: &str, power_state: i32) -> bool {
        self.status == status && self.power_state == power_state
    }
}

/// A single poll result for a resource, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub id: ResourceId,
    pub name: String,
    pub price_class: PriceClassId,
    pub status: String,
    pub power_state: i32,
    /// Creation time reported by the provider. Only read for new resources.
    pub created_at: DateTime<Utc>,
    /// When the poll happened.
    pub observed_at: DateTime<Utc>,
    /// The provider's own "last changed" timestamp, if it reports one.
    pub changed_at: Option<DateTime<Utc>>,
}

/// Tracked state of one billable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: ResourceId,
    pub name: String,
    #[serde(alias = "flavor_id")]
    pub price_class: PriceClassId,
    pub current_status: String,
    pub current_power_state: i32,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(
        default,
        alias = "state_history",
        deserialize_with = "deserialize_bounded_history"
    )]
    history: Vec<StateChangeRecord>,
    /// Provider-reported time of the last real state change.
    #[serde(default, alias = "updated_at", skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<DateTime<Utc>>,
}

impl ResourceState {
    /// Creates the state for a resource seen for the first time.
    pub fn from_observation(observation: &Observation) -> Self {
        let first = StateChangeRecord {
            status: observation.status.clone(),
            power_state: observation.power_state,
            timestamp: observation.changed_at.unwrap_or(observation.observed_at),
        };
        Self {
            id: observation.id.clone(),
            name: observation.name.clone(),
            price_class: observation.price_class.clone(),
            current_status: observation.status.clone(),
            current_power_state: observation.power_state,
            created_at: observation.created_at,
            last_updated: observation.observed_at,
            history: vec![first],
            last_transition_at: observation.changed_at,
        }
    }

    /// Applies a later observation of the same resource.
    ///
    /// Current fields are overwritten. A history record is appended only when
    /// the status/power-state pair differs from the newest record or the
    /// provider's change timestamp has advanced. Returns whether history grew.
    pub fn observe(&mut self, observation: &Observation) -> bool {
        self.name.clone_from(&observation.name);
        self.price_class = observation.price_class.clone();
        self.current_status.clone_from(&observation.status);
        self.current_power_state = observation.power_state;
        self.last_updated = observation.observed_at;

        let state_changed = self
            .history
            .last()
            .is_none_or(|last| !last.has_state(&observation.status, observation.power_state));
        let change_advanced = match (observation.changed_at, self.last_transition_at) {
            (Some(new), Some(old)) => new > old,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if change_advanced {
            self.last_transition_at = observation.changed_at;
        }
        if !state_changed && !change_advanced {
            return false;
        }

        let mut timestamp = observation
            .changed_at
            .filter(|_| change_advanced)
            .unwrap_or(observation.observed_at);
        if let Some(last) = self.history.last() {
            timestamp = timestamp.max(last.timestamp);
        }

        self.history.push(StateChangeRecord {
            status: observation.status.clone(),
            power_state: observation.power_state,
            timestamp,
        });
        truncate_history(&mut self.history);

        tracing::info!(
            resource_id = %self.id,
            status = %observation.status,
            power_state = observation.power_state,
            %timestamp,
            "recorded state change"
        );
        true
    }

    /// Recorded state changes, oldest first.
    pub fn history(&self) -> &[StateChangeRecord] {
        &self.history
    }

    /// Replaces the history, keeping only the newest [`HISTORY_LIMIT`] records.
    ///
    /// Records must already be in chronological order.
    pub fn replace_history(&mut self, records: Vec<StateChangeRecord>) {
        self.history = records;
        truncate_history(&mut self.history);
    }

    pub fn run_state(&self) -> RunState {
        RunState::from_status(&self.current_status, self.current_power_state)
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    /// Whether the resource is explicitly stopped (`SHUTOFF` or power state 4).
    pub fn is_shut_off(&self) -> bool {
        self.current_status == STATUS_SHUTOFF || self.current_power_state == POWER_STATE_SHUTDOWN
    }

    /// How long the resource has been in its current run state, as of `last_updated`.
    pub fn current_state_duration(&self) -> Duration {
        (self.last_updated - self.current_state_since()).max(Duration::zero())
    }

    fn current_state_since(&self) -> DateTime<Utc> {
        let current = self.run_state();
        let Some(first) = self.history.first() else {
            return self.last_transition_at.unwrap_or(self.created_at);
        };

        match self
            .history
            .iter()
            .rposition(|record| record.run_state() != current)
        {
            Some(idx) => self.history.get(idx + 1).map_or_else(
                || self.last_transition_at.unwrap_or(self.last_updated),
                |next| next.timestamp,
            ),
            None => first.timestamp.min(self.created_at),
        }
    }
}

fn truncate_history(history: &mut Vec<StateChangeRecord>) {
    if history.len() > HISTORY_LIMIT {
        let excess = history.len() - HISTORY_LIMIT;
        history.drain(..excess);
    }
}

fn deserialize_bounded_history<'de, D>(
    deserializer: D,
) -> Result<Vec<StateChangeRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut history =
        Option::<Vec<StateChangeRecord>>::deserialize(deserializer)?.unwrap_or_default();
    truncate_history(&mut history);
    Ok(history)
}

/// Running/shutdown counts across a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetStats {
    pub total: usize,
    pub running: usize,
    pub shutdown: usize,
}

impl FleetStats {
    pub fn from_snapshot<'a>(resources: impl IntoIterator<Item = &'a ResourceState>) -> Self {
        resources
            .into_iter()
            .fold(Self::default(), |mut stats, resource| {
                stats.total += 1;
                match resource.run_state() {
                    RunState::Running => stats.running += 1,
                    RunState::Shutdown => stats.shutdown += 1,
                }
                stats
            })
    }
}
