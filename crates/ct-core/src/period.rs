//! Named billing periods anchored at local calendar boundaries.

use chrono::{DateTime, Datelike, LocalResult, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::interval::Window;

/// Convenience query windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// Today, midnight to midnight.
    Daily,
    /// The whole current calendar month.
    Monthly,
    /// Month to date: start of the month until now.
    #[default]
    Current,
}

impl Period {
    pub fn window(self, as_of: &AsOf) -> Window {
        match self {
            Self::Daily => as_of.today,
            Self::Monthly => as_of.current_month,
            Self::Current => Window::new(as_of.current_month.start, as_of.now),
        }
    }
}

/// A point in time together with the calendar windows that contain it.
///
/// Built once per calculation so every rule sees the same "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsOf {
    pub now: DateTime<Utc>,
    pub today: Window,
    pub current_month: Window,
}

impl AsOf {
    /// Resolves calendar boundaries in the time zone of `now`.
    pub fn at<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        let tz = now.timezone();
        let today = now.date_naive();
        let tomorrow = today.succ_opt().unwrap_or(today);
        let month_start = today.with_day(1).unwrap_or(today);
        let next_month_start = month_start
            .checked_add_months(Months::new(1))
            .unwrap_or(month_start);

        Self {
            now: now.with_timezone(&Utc),
            today: Window::new(
                local_midnight_to_utc(&tz, today),
                local_midnight_to_utc(&tz, tomorrow),
            ),
            current_month: Window::new(
                local_midnight_to_utc(&tz, month_start),
                local_midnight_to_utc(&tz, next_month_start),
            ),
        }
    }

    /// Uses the system clock and local time zone.
    pub fn local_now() -> Self {
        Self::at(&chrono::Local::now())
    }
}

/// Converts a local date at midnight to UTC.
/// Handles DST ambiguity by picking the earlier time.
fn local_midnight_to_utc<Tz: TimeZone>(tz: &Tz, local_date: NaiveDate) -> DateTime<Utc> {
    let midnight = local_date.and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&midnight) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        LocalResult::None => {
            // Spring-forward gap at midnight; 01:00 local exists.
            let one_am = midnight + chrono::Duration::hours(1);
            tz.from_local_datetime(&one_am)
                .earliest()
                .map_or_else(|| one_am.and_utc(), |dt| dt.with_timezone(&Utc))
        }
    }
}
