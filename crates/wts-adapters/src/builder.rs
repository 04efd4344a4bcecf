//! Canonical record construction from one raw sheet row.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use wts_core::{
    truncate_field, CanonicalTaskRecord, CellValue, Field, QualityCounters, QualityIssue,
    ReviewFlag, TaskOwner, TaskStatus, UnitNumber, DESCRIPTION_MAX, POSITION_MAX,
    INTEGER_FIELD_MAX, REFERENCE_CODE_MAX, TASK_NAME_MAX, TASK_NUMBER_MAX, WI_REFERENCE_MAX,
};

use crate::attribution::parse_identifiers;
use crate::duration::{recover_minutes, DurationRecovery};
use crate::reference::ReferenceTables;

pub const COL_TASK_NUMBER: usize = 0;
pub const COL_PHASE: usize = 1;
pub const COL_TASK_NAME: usize = 2;
pub const COL_DESCRIPTION: usize = 3;
pub const COL_COMPLETED: usize = 4;
pub const COL_IN_PROGRESS: usize = 5;
pub const COL_COMPLETED_BY: usize = 6;
pub const COL_DATE: usize = 7;
pub const COL_REFERENCE_CODE: usize = 8;
pub const COL_POSITION: usize = 9;
pub const COL_SCOPE_DELAYED: usize = 10;
pub const COL_WI_REFERENCE: usize = 11;
pub const COL_HEADCOUNT: usize = 13;
pub const COL_DURATION: usize = 14;

/// Text in the task-name column of the header row.
const HEADER_TASK_LABEL: &str = "TASK";

const AFFIRMATIVE_TOKENS: [&str; 4] = ["yes", "y", "1", "true"];

/// One task row as exported, before any recovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTaskRow {
    pub task_number: CellValue,
    /// Free-text phase cell. Canonical phases come from the reference table.
    pub phase_text: CellValue,
    pub task_name: CellValue,
    pub description: CellValue,
    pub completed: CellValue,
    pub in_progress: CellValue,
    pub completed_by: CellValue,
    pub date: CellValue,
    pub reference_code: CellValue,
    pub position: CellValue,
    pub scope_delayed: CellValue,
    pub wi_reference: CellValue,
    pub headcount: CellValue,
    pub duration: CellValue,
}

impl RawTaskRow {
    pub fn from_cells(cells: &[CellValue]) -> Self {
        let cell = |idx: usize| cells.get(idx).cloned().unwrap_or_default();
        Self {
            task_number: cell(COL_TASK_NUMBER),
            phase_text: cell(COL_PHASE),
            task_name: cell(COL_TASK_NAME),
            description: cell(COL_DESCRIPTION),
            completed: cell(COL_COMPLETED),
            in_progress: cell(COL_IN_PROGRESS),
            completed_by: cell(COL_COMPLETED_BY),
            date: cell(COL_DATE),
            reference_code: cell(COL_REFERENCE_CODE),
            position: cell(COL_POSITION),
            scope_delayed: cell(COL_SCOPE_DELAYED),
            wi_reference: cell(COL_WI_REFERENCE),
            headcount: cell(COL_HEADCOUNT),
            duration: cell(COL_DURATION),
        }
    }

    /// Header and blank rows are not tasks; neither is a row without a name.
    pub fn is_task(&self) -> bool {
        match self.task_name.as_text() {
            Some(name) => !name.eq_ignore_ascii_case(HEADER_TASK_LABEL),
            None => false,
        }
    }
}

pub fn is_affirmative(cell: &CellValue) -> bool {
    match cell {
        CellValue::Bool(value) => *value,
        CellValue::Number(value) => *value == 1.0,
        CellValue::Text(text) => {
            let token = text.trim().to_lowercase();
            AFFIRMATIVE_TOKENS.contains(&token.as_str())
        }
        _ => false,
    }
}

/// completed > in_progress > not_started.
pub fn derive_status(completed: &CellValue, in_progress: &CellValue) -> TaskStatus {
    if is_affirmative(completed) {
        TaskStatus::Completed
    } else if is_affirmative(in_progress) {
        TaskStatus::InProgress
    } else {
        TaskStatus::NotStarted
    }
}

/// Inclusive date window outside which completion timestamps are corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlausibleWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl Default for PlausibleWindow {
    fn default() -> Self {
        Self {
            from: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or(NaiveDate::MIN),
            to: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap_or(NaiveDate::MAX),
        }
    }
}

impl PlausibleWindow {
    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        let date = timestamp.date_naive();
        date >= self.from && date <= self.to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampCell {
    Absent,
    Parsed(DateTime<Utc>),
    Unparseable,
}

const TEXT_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const TEXT_DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d/%m/%Y"];

fn spreadsheet_epoch() -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(1899, 12, 30).and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Read a completion date cell. Serial numbers count days from 1899-12-30.
pub fn parse_completion_timestamp(cell: &CellValue) -> TimestampCell {
    let naive = match cell {
        CellValue::Empty => return TimestampCell::Absent,
        CellValue::DateTime(value) => Some(*value),
        CellValue::Date(date) => date.and_hms_opt(0, 0, 0),
        CellValue::Number(serial) if serial.is_finite() && *serial > 0.0 => {
            let seconds = (serial * 86_400.0).round() as i64;
            spreadsheet_epoch().and_then(|epoch| {
                Duration::try_seconds(seconds).and_then(|offset| epoch.checked_add_signed(offset))
            })
        }
        CellValue::Text(text) => {
            let text = text.trim();
            if text.is_empty() {
                return TimestampCell::Absent;
            }
            TEXT_DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
                .or_else(|| {
                    TEXT_DATE_FORMATS
                        .iter()
                        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
                        .and_then(|date| date.and_hms_opt(0, 0, 0))
                })
        }
        _ => None,
    };
    match naive {
        Some(value) => TimestampCell::Parsed(value.and_utc()),
        None => TimestampCell::Unparseable,
    }
}

fn bounded_text(cell: &CellValue, max_chars: usize) -> Option<String> {
    cell.as_text().map(|text| truncate_field(&text, max_chars))
}

/// Minute counts no store column can hold are as lost as unreadable ones.
fn bounded_duration(recovery: DurationRecovery) -> DurationRecovery {
    match recovery.minutes() {
        Some(minutes) if minutes > INTEGER_FIELD_MAX => DurationRecovery::Unrecoverable,
        _ => recovery,
    }
}

fn headcount_from_cell(cell: &CellValue) -> Option<u32> {
    let value = match cell {
        CellValue::Number(n) => *n,
        CellValue::Text(text) => text.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if value.is_finite() && value >= 1.0 && value.fract() == 0.0
        && value <= f64::from(INTEGER_FIELD_MAX) {
        Some(value as u32)
    } else {
        None
    }
}

/// Where a row sits: which unit, which owner, and its position there.
#[derive(Debug, Clone)]
pub struct RowPlacement {
    pub unit_number: UnitNumber,
    pub owner: TaskOwner,
    pub sort_order: u32,
}

#[derive(Debug, Clone)]
pub struct RecordBuilder {
    reference: Arc<ReferenceTables>,
    window: PlausibleWindow,
}

impl RecordBuilder {
    pub fn new(reference: Arc<ReferenceTables>, window: PlausibleWindow) -> Self {
        Self { reference, window }
    }

    pub fn window(&self) -> PlausibleWindow {
        self.window
    }

    /// Build the canonical record for a task row, counting every data-quality
    /// degradation into `quality`. Returns `None` for non-task rows.
    pub fn build(
        &self,
        row: &RawTaskRow,
        placement: RowPlacement,
        quality: &mut QualityCounters,
    ) -> Option<CanonicalTaskRecord> {
        if !row.is_task() {
            return None;
        }
        let task_name = bounded_text(&row.task_name, TASK_NAME_MAX)?;
        let standard = self.reference.task_standard(&task_name).copied();
        let mut flags = BTreeSet::new();

        let mut duration_minutes = match bounded_duration(recover_minutes(&row.duration)) {
            DurationRecovery::Minutes(minutes) => Field::source(minutes),
            DurationRecovery::SecondsAsMinutes(minutes) => {
                flags.insert(ReviewFlag::SecondsAsMinutes);
                quality.record(QualityIssue::SecondsAsMinutes);
                Field::source(minutes)
            }
            DurationRecovery::Unrecoverable => {
                flags.insert(ReviewFlag::UnparseableDuration);
                quality.record(QualityIssue::UnparseableDuration);
                Field::empty()
            }
            DurationRecovery::Absent => Field::empty(),
        };
        if duration_minutes.value.is_none() {
            if let Some(minutes) = standard.and_then(|s| s.minutes) {
                duration_minutes = Field::derived(Some(minutes));
                flags.insert(ReviewFlag::DurationFromReference);
                if standard.is_some_and(|s| s.seconds_as_minutes) {
                    flags.insert(ReviewFlag::SecondsAsMinutes);
                }
            }
        }

        let headcount = headcount_from_cell(&row.headcount)
            .or_else(|| standard.and_then(|s| s.headcount))
            .unwrap_or(1);

        let completed_by = parse_identifiers(&row.completed_by);
        let resolution = self.reference.teams.resolve(&completed_by);
        if !resolution.unknown.is_empty() {
            flags.insert(ReviewFlag::UnknownAttribution);
        }
        for identifier in resolution.unknown {
            quality.record(QualityIssue::UnknownAttribution { identifier });
        }

        let phase = match self.reference.phases.lookup(&task_name) {
            Some(label) => Field::derived(Some(label.to_string())),
            None => {
                flags.insert(ReviewFlag::UnmatchedPhase);
                quality.record(QualityIssue::UnmatchedPhase {
                    task_name: wts_core::normalize_task_name(&task_name),
                });
                Field::empty()
            }
        };

        let completed_at = match parse_completion_timestamp(&row.date) {
            TimestampCell::Absent => None,
            TimestampCell::Parsed(ts) if self.window.contains(&ts) => Some(ts),
            TimestampCell::Parsed(_) | TimestampCell::Unparseable => {
                flags.insert(ReviewFlag::ImplausibleTimestamp);
                quality.record(QualityIssue::ImplausibleTimestamp);
                None
            }
        };

        Some(CanonicalTaskRecord {
            unit_number: placement.unit_number,
            owner: placement.owner,
            sort_order: placement.sort_order,
            task_number: bounded_text(&row.task_number, TASK_NUMBER_MAX),
            task_name,
            description: bounded_text(&row.description, DESCRIPTION_MAX),
            status: derive_status(&row.completed, &row.in_progress),
            duration_minutes,
            headcount,
            phase,
            completed_by,
            team: Field::derived(resolution.team),
            completed_at,
            reference_code: bounded_text(&row.reference_code, REFERENCE_CODE_MAX),
            position: bounded_text(&row.position, POSITION_MAX),
            scope_delayed: is_affirmative(&row.scope_delayed),
            wi_reference: bounded_text(&row.wi_reference, WI_REFERENCE_MAX),
            review_flags: flags,
        })
    }
}
