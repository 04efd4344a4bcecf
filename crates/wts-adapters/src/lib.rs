//! Submission adapters: one exported workbook in, canonical task records out.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use wts_core::{
    truncate_field, CanonicalTaskRecord, Car, CellValue, QualityCounters, TaskOwner, Unit,
    UnitNumber, CAR_NUMBER_MAX,
};

pub mod attribution;
pub mod builder;
pub mod duration;
pub mod identifier;
pub mod phase;
pub mod reference;

pub use attribution::{effort_credits, parse_identifiers, EffortCredit, TeamMapping, UNKNOWN_TEAM};
pub use builder::{derive_status, PlausibleWindow, RawTaskRow, RecordBuilder, RowPlacement};
pub use duration::{recover_minutes, DurationRecovery};
pub use identifier::{ExtractedIdentifier, IdentifierError, IdentifierExtractor};
pub use phase::PhaseReference;
pub use reference::{Formation, ReferenceError, ReferenceTables};

pub const CRATE_NAME: &str = "wts-adapters";

/// Rows above this index are the sheet header area; tasks start here.
pub const TASK_ROWS_START: usize = 2;

const SUBMISSION_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("reading submission {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing submission {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Unresolved(#[from] IdentifierError),
}

/// A workbook as handed over by the spreadsheet exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbookSubmission {
    /// Original workbook file name; carries the train and unit identifiers.
    pub file_name: String,
    /// Folder the workbook was collected from, if known.
    #[serde(default)]
    pub source_path: Option<String>,
    pub sheets: Vec<SheetExport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetExport {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<Vec<CellValue>>,
}

/// A submission read from disk with its raw bytes kept for archiving.
#[derive(Debug, Clone)]
pub struct SubmissionFile {
    pub path: PathBuf,
    pub raw: Vec<u8>,
    pub workbook: WorkbookSubmission,
}

pub fn load_submission(path: impl AsRef<Path>) -> Result<SubmissionFile, SubmissionError> {
    let path = path.as_ref();
    let raw = fs::read(path).map_err(|source| SubmissionError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let workbook = serde_json::from_slice(&raw).map_err(|source| SubmissionError::Json {
        path: path.display().to_string(),
        source,
    })?;
    Ok(SubmissionFile {
        path: path.to_path_buf(),
        raw,
        workbook,
    })
}

/// Submission files in a directory, sorted by file name.
pub fn discover_submissions(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("listing {}", dir.display()))?
            .path();
        let is_submission = path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(SUBMISSION_EXTENSION));
        if is_submission {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Everything built for one unit from one submission. The submission is the
/// complete picture of this unit's tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitBatch {
    pub unit: Unit,
    pub cars: Vec<Car>,
    pub records: Vec<CanonicalTaskRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionExtract {
    pub file_name: String,
    pub train_id: String,
    pub strategy: &'static str,
    /// Both units named by the submission, for metadata upserts.
    pub units: Vec<Unit>,
    /// Units that had at least one catalogued sheet; only these reconcile.
    pub batches: Vec<UnitBatch>,
    #[serde(skip)]
    pub quality: QualityCounters,
}

fn phase_folder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bPhase\s*(\d+)\b").expect("valid phase folder regex"))
}

/// Car number from a `Car No:` / `Car:` label in the sheet header area.
/// The value is either after the colon in the same cell or the next
/// non-empty cell of that row.
pub fn header_car_number(rows: &[Vec<CellValue>]) -> Option<String> {
    for row in rows.iter().take(TASK_ROWS_START) {
        for (idx, cell) in row.iter().enumerate() {
            let Some(text) = cell.as_text() else {
                continue;
            };
            let lowered = text.to_lowercase();
            if !(lowered.starts_with("car no") || lowered.starts_with("car:")) {
                continue;
            }
            let inline = text
                .split_once(':')
                .map(|(_, rest)| rest.trim().to_string())
                .filter(|rest| !rest.is_empty());
            let value = inline.or_else(|| row[idx + 1..].iter().find_map(CellValue::as_text));
            if let Some(value) = value {
                return Some(truncate_field(&value, CAR_NUMBER_MAX));
            }
        }
    }
    None
}

pub struct SubmissionAdapter {
    reference: Arc<ReferenceTables>,
    identifiers: IdentifierExtractor,
    builder: RecordBuilder,
}

impl SubmissionAdapter {
    pub fn new(reference: Arc<ReferenceTables>, window: PlausibleWindow) -> Self {
        let identifiers = IdentifierExtractor::new(
            reference.unit_series_prefix.clone(),
            reference.trains.clone(),
        );
        let builder = RecordBuilder::new(Arc::clone(&reference), window);
        Self {
            reference,
            identifiers,
            builder,
        }
    }

    pub fn reference(&self) -> &ReferenceTables {
        &self.reference
    }

    fn construction_phase(&self, workbook: &WorkbookSubmission, id: &ExtractedIdentifier) -> Option<String> {
        workbook
            .source_path
            .as_deref()
            .and_then(|path| phase_folder_re().captures(path))
            .map(|caps| format!("Phase {}", &caps[1]))
            .or_else(|| {
                self.reference
                    .construction_phase_for(id.train_id)
                    .map(str::to_string)
            })
    }

    pub fn extract(&self, workbook: &WorkbookSubmission) -> Result<SubmissionExtract, SubmissionError> {
        let id = self.identifiers.extract(&workbook.file_name)?;
        let construction_phase = self.construction_phase(workbook, &id);
        let train_name = format!("{} ({}-{})", id.train_id, id.unit1.short(), id.unit2.short());
        let units: Vec<Unit> = [&id.unit1, &id.unit2]
            .into_iter()
            .map(|unit_number| Unit {
                unit_number: unit_number.clone(),
                train_id: Some(id.train_id),
                train_name: Some(train_name.clone()),
                construction_phase: construction_phase.clone(),
            })
            .collect();

        let mut quality = QualityCounters::default();
        let mut batches: BTreeMap<UnitNumber, UnitBatch> = BTreeMap::new();
        let mut next_sort: HashMap<(UnitNumber, TaskOwner), u32> = HashMap::new();

        for sheet in &workbook.sheets {
            let Some(spec) = self.reference.car_sheet(&sheet.name) else {
                debug!(file = %workbook.file_name, sheet = %sheet.name, "sheet not in car catalog");
                continue;
            };
            let (unit_number, unit) = match spec.formation {
                Formation::ThreeCar => (&id.unit1, &units[0]),
                Formation::FourCar => (&id.unit2, &units[1]),
            };
            let batch = batches.entry(unit_number.clone()).or_insert_with(|| UnitBatch {
                unit: unit.clone(),
                cars: Vec::new(),
                records: Vec::new(),
            });

            let owner = match &spec.car_type {
                Some(car_type) => {
                    if !batch.cars.iter().any(|car| &car.car_type == car_type) {
                        batch.cars.push(Car {
                            unit_number: unit_number.clone(),
                            car_type: car_type.clone(),
                            car_number: header_car_number(&sheet.rows),
                        });
                    }
                    TaskOwner::Car {
                        car_type: car_type.clone(),
                    }
                }
                None => TaskOwner::Unit,
            };

            let counter = next_sort
                .entry((unit_number.clone(), owner.clone()))
                .or_insert(0);
            for cells in sheet.rows.iter().skip(TASK_ROWS_START) {
                let row = RawTaskRow::from_cells(cells);
                if !row.is_task() {
                    continue;
                }
                let placement = RowPlacement {
                    unit_number: unit_number.clone(),
                    owner: owner.clone(),
                    sort_order: *counter + 1,
                };
                if let Some(record) = self.builder.build(&row, placement, &mut quality) {
                    *counter += 1;
                    batch.records.push(record);
                }
            }
        }

        if batches.is_empty() {
            warn!(file = %workbook.file_name, "no catalogued sheets in submission");
        }

        Ok(SubmissionExtract {
            file_name: workbook.file_name.clone(),
            train_id: id.train_id.to_string(),
            strategy: id.strategy,
            units,
            batches: batches.into_values().collect(),
            quality,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wts_core::TaskStatus;

    const REFERENCE: &str = r#"
version: 1
teams:
  - { name: Team A, members: [AS] }
master_data:
  - { task: Remove bogie, phase: P1 }
  - { task: Fit seats, phase: P2 }
construction_phases:
  - { label: Phase 3, first_train: 32, last_train: 62 }
car_sheets:
  - { sheet: DM 3 Car, car_type: DM 3 CAR, formation: three_car }
  - { sheet: De-Icer DM, car_type: DM 3 CAR, formation: three_car }
  - { sheet: DM 4 Car, car_type: DM 4 Car, formation: four_car }
"#;

    fn adapter() -> SubmissionAdapter {
        let reference = ReferenceTables::from_yaml_str(REFERENCE).unwrap();
        SubmissionAdapter::new(Arc::new(reference), PlausibleWindow::default())
    }

    fn text(value: &str) -> CellValue {
        CellValue::Text(value.into())
    }

    fn task_row(name: &str, completed: &str) -> Vec<CellValue> {
        vec![
            CellValue::Empty,
            CellValue::Empty,
            text(name),
            CellValue::Empty,
            text(completed),
            CellValue::Empty,
            text("as"),
        ]
    }

    fn sheet(name: &str, car_no: &str, tasks: &[(&str, &str)]) -> SheetExport {
        let mut rows = vec![
            vec![text("Car No:"), text(car_no)],
            vec![text("No."), text("Phase"), text("Task")],
        ];
        rows.extend(tasks.iter().map(|(name, done)| task_row(name, done)));
        SheetExport {
            name: name.into(),
            rows,
        }
    }

    fn workbook(sheets: Vec<SheetExport>) -> WorkbookSubmission {
        WorkbookSubmission {
            file_name: "WorktosheetsV3 T32 - (Units 96123 & 96004).xlsm".into(),
            source_path: None,
            sheets,
        }
    }

    #[test]
    fn sheets_route_to_units_by_formation() {
        let extract = adapter()
            .extract(&workbook(vec![
                sheet("DM 3 Car", "12345", &[("Remove bogie", "yes")]),
                sheet("DM 4 Car", "67890", &[("Fit seats", "")]),
                sheet("Sign Off Sheet", "", &[("Sign", "yes")]),
            ]))
            .unwrap();

        assert_eq!(extract.train_id, "T32");
        assert_eq!(extract.units.len(), 2);
        assert_eq!(extract.units[0].train_name.as_deref(), Some("T32 (123-004)"));
        assert_eq!(extract.units[0].construction_phase.as_deref(), Some("Phase 3"));

        assert_eq!(extract.batches.len(), 2);
        let three_car = extract
            .batches
            .iter()
            .find(|b| b.unit.unit_number.as_str() == "96123")
            .unwrap();
        assert_eq!(three_car.cars[0].car_number.as_deref(), Some("12345"));
        assert_eq!(three_car.records.len(), 1);
        assert_eq!(three_car.records[0].status, TaskStatus::Completed);

        let four_car = extract
            .batches
            .iter()
            .find(|b| b.unit.unit_number.as_str() == "96004")
            .unwrap();
        assert_eq!(four_car.records[0].task_name, "Fit seats");
        assert_eq!(extract.quality.total_issues(), 0);
    }

    #[test]
    fn sort_order_continues_across_sheets_of_one_owner() {
        let extract = adapter()
            .extract(&workbook(vec![
                sheet("DM 3 Car", "1", &[("Remove bogie", "yes"), ("Fit seats", "")]),
                sheet("De-Icer DM", "1", &[("Remove bogie", "")]),
            ]))
            .unwrap();
        let batch = &extract.batches[0];
        let orders: Vec<u32> = batch.records.iter().map(|r| r.sort_order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(batch.cars.len(), 1);
        let keys: std::collections::BTreeSet<_> =
            batch.records.iter().map(|r| r.natural_key()).collect();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn repeated_unit_collects_both_formations() {
        let mut book = workbook(vec![
            sheet("DM 3 Car", "1", &[("Remove bogie", "yes")]),
            sheet("DM 4 Car", "2", &[("Fit seats", "")]),
        ]);
        book.file_name = "WorktosheetsV3 T32 - (Units 96123 & 96123).xlsm".into();
        let extract = adapter().extract(&book).unwrap();

        assert_eq!(extract.batches.len(), 1);
        let batch = &extract.batches[0];
        assert_eq!(batch.unit.unit_number.as_str(), "96123");
        assert_eq!(batch.cars.len(), 2);
        assert_eq!(batch.records.len(), 2);
        let keys: std::collections::BTreeSet<_> =
            batch.records.iter().map(|r| r.natural_key()).collect();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn units_without_sheets_get_no_batch() {
        let extract = adapter()
            .extract(&workbook(vec![sheet("DM 3 Car", "1", &[("Remove bogie", "yes")])]))
            .unwrap();
        assert_eq!(extract.units.len(), 2);
        assert_eq!(extract.batches.len(), 1);
        assert_eq!(extract.batches[0].unit.unit_number.as_str(), "96123");
    }

    #[test]
    fn phase_folder_beats_train_range() {
        let mut book = workbook(vec![]);
        book.source_path = Some("/shared/Phase 2/T32/Work to sheets".into());
        let extract = adapter().extract(&book).unwrap();
        assert_eq!(extract.units[1].construction_phase.as_deref(), Some("Phase 2"));
    }

    #[test]
    fn unresolved_file_names_are_errors_for_the_caller() {
        let mut book = workbook(vec![]);
        book.file_name = "notes.xlsm".into();
        assert!(matches!(
            adapter().extract(&book),
            Err(SubmissionError::Unresolved(IdentifierError::NoTrainToken(_)))
        ));
    }

    #[test]
    fn car_number_from_inline_label() {
        let rows = vec![vec![text("Unit: 96411"), text("Car: 77012")]];
        assert_eq!(header_car_number(&rows).as_deref(), Some("77012"));
        assert_eq!(header_car_number(&[]), None);
    }

    #[test]
    fn discovers_json_submissions_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.json"), "{}").unwrap();
        fs::write(dir.path().join("a.JSON"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        let found = discover_submissions(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.JSON", "b.json"]);
    }

    #[test]
    fn malformed_submission_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();
        let err = load_submission(&path).unwrap_err();
        assert!(matches!(err, SubmissionError::Json { .. }));
        assert!(err.to_string().contains("broken.json"));
    }
}
