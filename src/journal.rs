use chrono::{Datelike, Duration, NaiveDate, Weekday};
use thiserror::Error;

/// A full teaching day is at most 8 lesson hours.
pub const MAX_NB_HOURS: i64 = 8;

/// Monday through Saturday; Sunday is outside the journal entirely.
pub const WORKING_DAYS: i64 = 6;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("nb_hours must be between 0 and {MAX_NB_HOURS}, got {0}")]
    InvalidHours(i64),
    #[error("expected an ISO date (YYYY-MM-DD), got '{0}'")]
    BadDate(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{target} is outside the editable week {monday}..{saturday}")]
    OutOfWindow {
        target: NaiveDate,
        monday: NaiveDate,
        saturday: NaiveDate,
    },
    #[error("weekly bulk save is only allowed on Saturday, today is {today}")]
    WrongDay { today: NaiveDate },
    #[error("group is closed")]
    GroupClosed,
    #[error("curator has no active group matching this request")]
    NoActiveGroup,
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl JournalError {
    /// Stable wire code reported to the IPC caller.
    pub fn code(&self) -> &'static str {
        match self {
            JournalError::InvalidHours(_) => "invalid_hours",
            JournalError::BadDate(_) => "bad_date",
            JournalError::NotFound(_) => "not_found",
            JournalError::OutOfWindow { .. } => "out_of_window",
            JournalError::WrongDay { .. } => "wrong_day",
            JournalError::GroupClosed => "group_closed",
            JournalError::NoActiveGroup => "no_active_group",
            JournalError::Db(_) => "db_error",
        }
    }
}

pub fn parse_iso_date(s: &str) -> Result<NaiveDate, JournalError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| JournalError::BadDate(s.to_string()))
}

pub fn snap_to_monday(d: NaiveDate) -> NaiveDate {
    d - Duration::days(d.weekday().num_days_from_monday() as i64)
}

/// (monday, saturday) of the week containing `d`.
pub fn week_bounds(d: NaiveDate) -> (NaiveDate, NaiveDate) {
    let monday = snap_to_monday(d);
    (monday, monday + Duration::days(WORKING_DAYS - 1))
}

/// The six working days starting at `monday`.
pub fn week_days(monday: NaiveDate) -> Vec<NaiveDate> {
    (0..WORKING_DAYS).map(|i| monday + Duration::days(i)).collect()
}

/// Single-day corrections are allowed anywhere inside the week containing
/// `today`. `today` is supplied by the caller, never read from a clock here.
pub fn assert_single_day_editable(today: NaiveDate, target: NaiveDate) -> Result<(), JournalError> {
    let (monday, saturday) = week_bounds(today);
    if target < monday || target > saturday {
        return Err(JournalError::OutOfWindow {
            target,
            monday,
            saturday,
        });
    }
    Ok(())
}

/// The whole-week bulk save is a Saturday close-out ritual: it must run on
/// the Saturday of the week it writes, and the declared week start (snapped
/// to its Monday) must be that same week. Returns the snapped Monday.
pub fn assert_weekly_bulk_editable(
    today: NaiveDate,
    week_start: NaiveDate,
) -> Result<NaiveDate, JournalError> {
    if today.weekday() != Weekday::Sat {
        return Err(JournalError::WrongDay { today });
    }
    let (monday, saturday) = week_bounds(today);
    let declared = snap_to_monday(week_start);
    if declared != monday {
        return Err(JournalError::OutOfWindow {
            target: declared,
            monday,
            saturday,
        });
    }
    Ok(monday)
}

pub fn validate_hours(nb_hours: i64) -> Result<i64, JournalError> {
    if !(0..=MAX_NB_HOURS).contains(&nb_hours) {
        return Err(JournalError::InvalidHours(nb_hours));
    }
    Ok(nb_hours)
}

/// Presence is derived from the hours, never stored independently.
pub fn derive_status(nb_hours: i64) -> &'static str {
    if nb_hours > 0 {
        "absent"
    } else {
        "present"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    NotStarted,
    InProgress,
    Completed,
}

impl Completion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::NotStarted => "NOT_STARTED",
            Completion::InProgress => "IN_PROGRESS",
            Completion::Completed => "COMPLETED",
        }
    }
}

/// Tri-state completion of a group's journal for one day.
pub fn completion(marked: i64, total: i64) -> Completion {
    if marked == 0 {
        Completion::NotStarted
    } else if total > 0 && marked >= total {
        Completion::Completed
    } else {
        Completion::InProgress
    }
}

/// completed days out of the six working days, as a rounded percentage.
pub fn completion_pct(completed_days: i64) -> i64 {
    ((completed_days as f64) / (WORKING_DAYS as f64) * 100.0).round() as i64
}
