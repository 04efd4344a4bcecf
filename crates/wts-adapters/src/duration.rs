//! Recovery of task durations from timing cells of indeterminate shape.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use wts_core::CellValue;

const MINUTES_PER_DAY: f64 = 1440.0;

/// Outcome of reading one timing cell. Never an error: unrecoverable input
/// is a data-quality signal the caller counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationRecovery {
    /// Blank cell, nothing to recover.
    Absent,
    Minutes(u32),
    /// Hours and minutes were zero, so the seconds slot was read as minutes.
    /// Some zero-length tasks are genuine, so this reading is flagged for
    /// review rather than trusted.
    SecondsAsMinutes(u32),
    Unrecoverable,
}

impl DurationRecovery {
    pub fn minutes(&self) -> Option<u32> {
        match self {
            DurationRecovery::Minutes(m) | DurationRecovery::SecondsAsMinutes(m) => Some(*m),
            DurationRecovery::Absent | DurationRecovery::Unrecoverable => None,
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, DurationRecovery::Unrecoverable)
    }
}

/// Dates spreadsheet tools attach to a bare time value.
fn is_default_date(date: NaiveDate) -> bool {
    const DEFAULTS: [(i32, u32, u32); 5] = [
        (1899, 12, 30),
        (1899, 12, 31),
        (1900, 1, 1),
        (1904, 1, 1),
        (1970, 1, 1),
    ];
    DEFAULTS
        .iter()
        .any(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d) == Some(date))
}

fn clock_minutes(hours: u32, minutes: u32) -> DurationRecovery {
    hours
        .checked_mul(60)
        .and_then(|total| total.checked_add(minutes))
        .map_or(DurationRecovery::Unrecoverable, DurationRecovery::Minutes)
}

fn from_components(hours: u32, minutes: u32, seconds: u32) -> DurationRecovery {
    if hours == 0 && minutes == 0 && seconds > 0 {
        DurationRecovery::SecondsAsMinutes(seconds)
    } else {
        clock_minutes(hours, minutes)
    }
}

fn from_time(time: NaiveTime) -> DurationRecovery {
    from_components(time.hour(), time.minute(), time.second())
}

fn from_datetime(value: NaiveDateTime) -> DurationRecovery {
    let recovered = from_time(value.time());
    if recovered == DurationRecovery::Minutes(0) && !is_default_date(value.date()) {
        DurationRecovery::Unrecoverable
    } else {
        recovered
    }
}

fn from_number(value: f64) -> DurationRecovery {
    if !value.is_finite() || value < 0.0 {
        return DurationRecovery::Unrecoverable;
    }
    let minutes = if value < 1.0 {
        (value * MINUTES_PER_DAY).round()
    } else {
        value.round()
    };
    if minutes > f64::from(u32::MAX) {
        DurationRecovery::Unrecoverable
    } else {
        DurationRecovery::Minutes(minutes as u32)
    }
}

fn from_text(text: &str) -> DurationRecovery {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return DurationRecovery::Absent;
    }
    let parts: Option<Vec<u32>> = trimmed
        .split(':')
        .map(|part| part.trim().parse::<u32>().ok())
        .collect();
    match parts.as_deref() {
        Some([h, m, s]) if *m < 60 && *s < 60 => from_components(*h, *m, *s),
        Some([h, m]) if *m < 60 => clock_minutes(*h, *m),
        _ => DurationRecovery::Unrecoverable,
    }
}

/// Recover a duration in whole minutes from one raw timing cell.
pub fn recover_minutes(cell: &CellValue) -> DurationRecovery {
    match cell {
        CellValue::Empty => DurationRecovery::Absent,
        CellValue::Time(time) => from_time(*time),
        CellValue::DateTime(value) => from_datetime(*value),
        CellValue::Number(value) => from_number(*value),
        CellValue::Text(text) => from_text(text),
        CellValue::Bool(_) | CellValue::Date(_) | CellValue::List(_) => {
            DurationRecovery::Unrecoverable
        }
    }
}
