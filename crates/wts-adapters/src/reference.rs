//! Reference tables loaded once per run: teams, phases, task master data,
//! train/unit pairs, construction phase ranges and the car-sheet catalog.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use wts_core::{
    normalize_task_name, CellValue, DomainError, TrainId, UnitNumber, INTEGER_FIELD_MAX,
};

use crate::attribution::TeamMapping;
use crate::duration::{recover_minutes, DurationRecovery};
use crate::identifier::TrainUnitTable;
use crate::phase::PhaseReference;

pub const DEFAULT_UNIT_SERIES_PREFIX: &str = "96";
pub const REFERENCE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("reading reference file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("reference tables version {found} is not supported (expected {REFERENCE_VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("parsing reference tables: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("person {person} listed under both {first} and {second}")]
    DuplicateMember {
        person: String,
        first: String,
        second: String,
    },
    #[error("train table entry {train}: {source}")]
    InvalidTrainEntry {
        train: String,
        #[source]
        source: DomainError,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceFile {
    pub version: u32,
    #[serde(default = "default_unit_series_prefix")]
    pub unit_series_prefix: String,
    #[serde(default)]
    pub teams: Vec<TeamSpec>,
    #[serde(default)]
    pub phase_synonyms: BTreeMap<String, String>,
    #[serde(default)]
    pub master_data: Vec<MasterDataRow>,
    #[serde(default)]
    pub train_units: BTreeMap<String, [String; 2]>,
    #[serde(default)]
    pub construction_phases: Vec<ConstructionPhaseRange>,
    #[serde(default)]
    pub car_sheets: Vec<CarSheetSpec>,
}

fn default_unit_series_prefix() -> String {
    DEFAULT_UNIT_SERIES_PREFIX.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TeamSpec {
    pub name: String,
    pub members: Vec<String>,
}

/// One row of the task master sheet.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterDataRow {
    pub task: String,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub headcount: Option<u32>,
    #[serde(default)]
    pub timing: CellValue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConstructionPhaseRange {
    pub label: String,
    pub first_train: u16,
    pub last_train: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Formation {
    ThreeCar,
    FourCar,
}

/// Catalog entry for a workbook sheet. No car type means a flat legacy
/// layout whose tasks belong to the unit itself.
#[derive(Debug, Clone, Deserialize)]
pub struct CarSheetSpec {
    pub sheet: String,
    #[serde(default)]
    pub car_type: Option<String>,
    pub formation: Formation,
}

/// Standard headcount and minutes for a task name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStandard {
    pub headcount: Option<u32>,
    pub minutes: Option<u32>,
    pub seconds_as_minutes: bool,
}

#[derive(Debug, Clone)]
pub struct ReferenceTables {
    pub unit_series_prefix: String,
    pub teams: TeamMapping,
    pub phases: PhaseReference,
    pub task_standards: HashMap<String, TaskStandard>,
    pub trains: TrainUnitTable,
    pub construction_phases: Vec<ConstructionPhaseRange>,
    pub car_sheets: Vec<CarSheetSpec>,
}

impl ReferenceTables {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReferenceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ReferenceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ReferenceError> {
        let file: ReferenceFile = serde_yaml::from_str(text)?;
        Self::from_file(file)
    }

    pub fn from_file(file: ReferenceFile) -> Result<Self, ReferenceError> {
        if file.version != REFERENCE_VERSION {
            return Err(ReferenceError::UnsupportedVersion {
                found: file.version,
            });
        }
        let teams = TeamMapping::from_specs(&file.teams)?;

        let phases = PhaseReference::build(
            file.master_data
                .iter()
                .filter_map(|row| row.phase.as_ref().map(|phase| (row.task.clone(), phase.clone()))),
            &file.phase_synonyms,
        );

        let mut task_standards = HashMap::new();
        for row in &file.master_data {
            let key = normalize_task_name(&row.task);
            if key.is_empty() || task_standards.contains_key(&key) {
                continue;
            }
            let recovery = match recover_minutes(&row.timing) {
                recovery if recovery.minutes().is_some_and(|m| m > INTEGER_FIELD_MAX) => {
                    DurationRecovery::Unrecoverable
                }
                recovery => recovery,
            };
            if recovery == DurationRecovery::Unrecoverable {
                warn!(task = %key, timing = ?row.timing, "unparseable master data timing");
            }
            task_standards.insert(
                key,
                TaskStandard {
                    headcount: row
                        .headcount
                        .filter(|n| (1..=INTEGER_FIELD_MAX).contains(n)),
                    minutes: recovery.minutes(),
                    seconds_as_minutes: matches!(recovery, DurationRecovery::SecondsAsMinutes(_)),
                },
            );
        }

        let mut trains = TrainUnitTable::default();
        for (train, [unit1, unit2]) in &file.train_units {
            let train_id: TrainId =
                train
                    .parse()
                    .map_err(|source| ReferenceError::InvalidTrainEntry {
                        train: train.clone(),
                        source,
                    })?;
            let parse_unit = |raw: &str| {
                UnitNumber::parse(raw).map_err(|source| ReferenceError::InvalidTrainEntry {
                    train: train.clone(),
                    source,
                })
            };
            trains.insert(train_id, parse_unit(unit1)?, parse_unit(unit2)?);
        }

        Ok(Self {
            unit_series_prefix: file.unit_series_prefix,
            teams,
            phases,
            task_standards,
            trains,
            construction_phases: file.construction_phases,
            car_sheets: file.car_sheets,
        })
    }

    pub fn task_standard(&self, task_name: &str) -> Option<&TaskStandard> {
        self.task_standards.get(&normalize_task_name(task_name))
    }

    pub fn construction_phase_for(&self, train: TrainId) -> Option<&str> {
        self.construction_phases
            .iter()
            .find(|range| (range.first_train..=range.last_train).contains(&train.number()))
            .map(|range| range.label.as_str())
    }

    pub fn car_sheet(&self, sheet_name: &str) -> Option<&CarSheetSpec> {
        let wanted = sheet_name.trim();
        self.car_sheets
            .iter()
            .find(|spec| spec.sheet.eq_ignore_ascii_case(wanted))
    }
}
