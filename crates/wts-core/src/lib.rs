//! Core domain model for the work-to-sheets task ledger.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "wts-core";

/// Owner key used for tasks of flat legacy layouts that have no car.
pub const UNIT_OWNER_KEY: &str = "UNIT";

pub const TASK_NAME_MAX: usize = 255;
pub const DESCRIPTION_MAX: usize = 500;
pub const TASK_NUMBER_MAX: usize = 50;
pub const REFERENCE_CODE_MAX: usize = 50;
pub const POSITION_MAX: usize = 50;
pub const WI_REFERENCE_MAX: usize = 255;
pub const CAR_NUMBER_MAX: usize = 50;

/// Largest minute count or headcount an integer store column holds.
pub const INTEGER_FIELD_MAX: u32 = i32::MAX as u32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("invalid unit number {0:?}: expected 5 digits")]
    InvalidUnitNumber(String),
    #[error("invalid train id {0:?}")]
    InvalidTrainId(String),
    #[error("unknown task status {0:?}")]
    InvalidStatus(String),
    #[error("unknown field origin {0:?}")]
    InvalidOrigin(String),
    #[error("unknown review flag {0:?}")]
    InvalidReviewFlag(String),
}

/// One typed cell as handed over by the spreadsheet reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    List(Vec<String>),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(text) => text.trim().is_empty(),
            CellValue::List(items) => items.iter().all(|item| item.trim().is_empty()),
            _ => false,
        }
    }

    /// Render the cell as trimmed text, `None` when blank.
    pub fn as_text(&self) -> Option<String> {
        let text = match self {
            CellValue::Empty => return None,
            CellValue::Text(text) => text.trim().to_string(),
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            CellValue::Number(n) => n.to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Time(t) => t.format("%H:%M:%S").to_string(),
            CellValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            CellValue::List(items) => items
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
        };
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Five-digit vehicle unit number. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitNumber(String);

impl UnitNumber {
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let trimmed = input.trim();
        if trimmed.len() == 5 && trimmed.chars().all(|c| c.is_ascii_digit()) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(DomainError::InvalidUnitNumber(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last three digits, as used in short train names.
    pub fn short(&self) -> &str {
        &self.0[2..]
    }
}

impl TryFrom<String> for UnitNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UnitNumber> for String {
    fn from(value: UnitNumber) -> Self {
        value.0
    }
}

impl fmt::Display for UnitNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Train identifier, rendered zero-padded (`T01`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrainId(u16);

impl TrainId {
    pub fn new(number: u16) -> Self {
        Self(number)
    }

    pub fn number(&self) -> u16 {
        self.0
    }
}

impl FromStr for TrainId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        trimmed
            .strip_prefix('T')
            .or_else(|| trimmed.strip_prefix('t'))
            .and_then(|digits| digits.parse::<u16>().ok())
            .map(Self)
            .ok_or_else(|| DomainError::InvalidTrainId(s.to_string()))
    }
}

impl TryFrom<String> for TrainId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TrainId> for String {
    fn from(value: TrainId) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{:02}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub unit_number: UnitNumber,
    pub train_id: Option<TrainId>,
    pub train_name: Option<String>,
    pub construction_phase: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    pub unit_number: UnitNumber,
    pub car_type: String,
    pub car_number: Option<String>,
}

/// What a task record hangs off: a car, or the unit itself for flat layouts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOwner {
    Car { car_type: String },
    Unit,
}

impl TaskOwner {
    pub fn owner_key(&self) -> &str {
        match self {
            TaskOwner::Car { car_type } => car_type,
            TaskOwner::Unit => UNIT_OWNER_KEY,
        }
    }

    pub fn from_owner_key(key: &str) -> Self {
        if key == UNIT_OWNER_KEY {
            TaskOwner::Unit
        } else {
            TaskOwner::Car {
                car_type: key.to_string(),
            }
        }
    }
}

/// Identity of a task across resubmissions; reconciliation matches on this.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub unit_number: UnitNumber,
    pub owner_key: String,
    pub task_name: String,
    pub sort_order: u32,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/#{}/{}",
            self.unit_number, self.owner_key, self.sort_order, self.task_name
        )
    }
}

/// Trim, collapse inner whitespace and uppercase a task name.
pub fn normalize_task_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Deterministic truncation to at most `max_chars` characters.
pub fn truncate_field(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => value[..byte_idx].to_string(),
        None => value.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(TaskStatus::NotStarted),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

/// Where an overridable value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrigin {
    /// Explicit value read from the submitted row.
    Source,
    /// Reference lookup or heuristic.
    #[default]
    Derived,
    /// Human correction made in the persisted store.
    Manual,
}

impl FieldOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldOrigin::Source => "source",
            FieldOrigin::Derived => "derived",
            FieldOrigin::Manual => "manual",
        }
    }
}

impl FromStr for FieldOrigin {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(FieldOrigin::Source),
            "derived" => Ok(FieldOrigin::Derived),
            "manual" => Ok(FieldOrigin::Manual),
            other => Err(DomainError::InvalidOrigin(other.to_string())),
        }
    }
}

/// Overridable canonical field: optional value plus its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Field<T> {
    pub value: Option<T>,
    pub origin: FieldOrigin,
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            origin: FieldOrigin::Derived,
        }
    }

    pub fn source(value: T) -> Self {
        Self {
            value: Some(value),
            origin: FieldOrigin::Source,
        }
    }

    pub fn derived(value: Option<T>) -> Self {
        Self {
            value,
            origin: FieldOrigin::Derived,
        }
    }

    pub fn manual(value: Option<T>) -> Self {
        Self {
            value,
            origin: FieldOrigin::Manual,
        }
    }
}

impl<T: Clone> Field<T> {
    /// Merge a freshly extracted value over the persisted one.
    ///
    /// A manual persisted value survives unless the extraction carries an
    /// explicit, non-null value read straight from the source row.
    pub fn merged_over(&self, persisted: &Field<T>) -> Field<T> {
        if persisted.origin == FieldOrigin::Manual
            && !(self.origin == FieldOrigin::Source && self.value.is_some())
        {
            persisted.clone()
        } else {
            self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewFlag {
    /// Duration came from a seconds slot reinterpreted as minutes.
    SecondsAsMinutes,
    UnparseableDuration,
    DurationFromReference,
    ImplausibleTimestamp,
    UnknownAttribution,
    UnmatchedPhase,
}

impl ReviewFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewFlag::SecondsAsMinutes => "seconds_as_minutes",
            ReviewFlag::UnparseableDuration => "unparseable_duration",
            ReviewFlag::DurationFromReference => "duration_from_reference",
            ReviewFlag::ImplausibleTimestamp => "implausible_timestamp",
            ReviewFlag::UnknownAttribution => "unknown_attribution",
            ReviewFlag::UnmatchedPhase => "unmatched_phase",
        }
    }
}

impl FromStr for ReviewFlag {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seconds_as_minutes" => Ok(ReviewFlag::SecondsAsMinutes),
            "unparseable_duration" => Ok(ReviewFlag::UnparseableDuration),
            "duration_from_reference" => Ok(ReviewFlag::DurationFromReference),
            "implausible_timestamp" => Ok(ReviewFlag::ImplausibleTimestamp),
            "unknown_attribution" => Ok(ReviewFlag::UnknownAttribution),
            "unmatched_phase" => Ok(ReviewFlag::UnmatchedPhase),
            other => Err(DomainError::InvalidReviewFlag(other.to_string())),
        }
    }
}

/// Task record after all recovery and normalization, ready for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalTaskRecord {
    pub unit_number: UnitNumber,
    pub owner: TaskOwner,
    pub sort_order: u32,
    pub task_number: Option<String>,
    pub task_name: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub duration_minutes: Field<u32>,
    pub headcount: u32,
    pub phase: Field<String>,
    pub completed_by: Vec<String>,
    pub team: Field<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reference_code: Option<String>,
    pub position: Option<String>,
    pub scope_delayed: bool,
    pub wi_reference: Option<String>,
    #[serde(default)]
    pub review_flags: BTreeSet<ReviewFlag>,
}

impl CanonicalTaskRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            unit_number: self.unit_number.clone(),
            owner_key: self.owner.owner_key().to_string(),
            task_name: normalize_task_name(&self.task_name),
            sort_order: self.sort_order,
        }
    }
}

/// A single expected, recoverable degradation found in source data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualityIssue {
    UnresolvedIdentifier { file_name: String },
    UnparseableDuration,
    UnknownAttribution { identifier: String },
    UnmatchedPhase { task_name: String },
    ImplausibleTimestamp,
    SecondsAsMinutes,
}

/// Data-quality counters surfaced in every run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCounters {
    pub unresolved_identifiers: usize,
    pub unparseable_durations: usize,
    pub unknown_attributions: usize,
    pub unmatched_phases: usize,
    pub implausible_timestamps: usize,
    pub seconds_as_minutes: usize,
    pub skipped_files: BTreeSet<String>,
    pub unknown_identifiers: BTreeSet<String>,
    pub unmatched_task_names: BTreeSet<String>,
}

impl QualityCounters {
    pub fn record(&mut self, issue: QualityIssue) {
        match issue {
            QualityIssue::UnresolvedIdentifier { file_name } => {
                self.unresolved_identifiers += 1;
                self.skipped_files.insert(file_name);
            }
            QualityIssue::UnparseableDuration => self.unparseable_durations += 1,
            QualityIssue::UnknownAttribution { identifier } => {
                self.unknown_attributions += 1;
                self.unknown_identifiers.insert(identifier);
            }
            QualityIssue::UnmatchedPhase { task_name } => {
                self.unmatched_phases += 1;
                self.unmatched_task_names.insert(task_name);
            }
            QualityIssue::ImplausibleTimestamp => self.implausible_timestamps += 1,
            QualityIssue::SecondsAsMinutes => self.seconds_as_minutes += 1,
        }
    }

    pub fn absorb(&mut self, other: QualityCounters) {
        self.unresolved_identifiers += other.unresolved_identifiers;
        self.unparseable_durations += other.unparseable_durations;
        self.unknown_attributions += other.unknown_attributions;
        self.unmatched_phases += other.unmatched_phases;
        self.implausible_timestamps += other.implausible_timestamps;
        self.seconds_as_minutes += other.seconds_as_minutes;
        self.skipped_files.extend(other.skipped_files);
        self.unknown_identifiers.extend(other.unknown_identifiers);
        self.unmatched_task_names.extend(other.unmatched_task_names);
    }

    pub fn total_issues(&self) -> usize {
        self.unresolved_identifiers
            + self.unparseable_durations
            + self.unknown_attributions
            + self.unmatched_phases
            + self.implausible_timestamps
    }
}
