//! Flat row shapes shared by the REST and Postgres backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wts_core::{
    CanonicalTaskRecord, Car, Field, FieldOrigin, NaturalKey, ReviewFlag, TaskOwner, TaskStatus,
    TrainId, Unit, UnitNumber,
};

use crate::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRow {
    pub unit_number: String,
    pub train_id: Option<String>,
    pub train_name: Option<String>,
    pub construction_phase: Option<String>,
}

impl UnitRow {
    pub fn from_unit(unit: &Unit) -> Self {
        Self {
            unit_number: unit.unit_number.to_string(),
            train_id: unit.train_id.map(|id| id.to_string()),
            train_name: unit.train_name.clone(),
            construction_phase: unit.construction_phase.clone(),
        }
    }

    pub fn into_unit(self) -> Result<Unit, StoreError> {
        let train_id = self
            .train_id
            .as_deref()
            .map(str::parse::<TrainId>)
            .transpose()
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        Ok(Unit {
            unit_number: parse_unit_number(&self.unit_number)?,
            train_id,
            train_name: self.train_name,
            construction_phase: self.construction_phase,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarRow {
    pub unit_number: String,
    pub car_type: String,
    /// Left out when unknown so an upsert keeps the stored number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub car_number: Option<String>,
}

impl CarRow {
    pub fn from_car(car: &Car) -> Self {
        Self {
            unit_number: car.unit_number.to_string(),
            car_type: car.car_type.clone(),
            car_number: car.car_number.clone(),
        }
    }
}

/// One task record as a table row. `task_key` is the normalized task name,
/// so the natural key is `(unit_number, owner_key, task_key, sort_order)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub unit_number: String,
    pub owner_key: String,
    pub task_key: String,
    pub sort_order: i32,
    pub task_number: Option<String>,
    pub task_name: String,
    pub description: Option<String>,
    pub status: String,
    pub duration_minutes: Option<i32>,
    pub duration_origin: String,
    pub headcount: i32,
    pub phase: Option<String>,
    pub phase_origin: String,
    pub completed_by: Vec<String>,
    pub team: Option<String>,
    pub team_origin: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub reference_code: Option<String>,
    pub position: Option<String>,
    pub scope_delayed: bool,
    pub wi_reference: Option<String>,
    #[serde(default)]
    pub review_flags: Vec<String>,
}

fn parse_unit_number(raw: &str) -> Result<UnitNumber, StoreError> {
    UnitNumber::parse(raw).map_err(|err| StoreError::Serialization(err.to_string()))
}

fn parse_origin(raw: &str) -> Result<FieldOrigin, StoreError> {
    raw.parse()
        .map_err(|err: wts_core::DomainError| StoreError::Serialization(err.to_string()))
}

fn to_i32(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{column} {value} out of range")))
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{column} {value} is negative")))
}

impl TaskRow {
    pub fn from_record(record: &CanonicalTaskRecord) -> Result<Self, StoreError> {
        let key = record.natural_key();
        Ok(Self {
            unit_number: key.unit_number.to_string(),
            owner_key: key.owner_key,
            task_key: key.task_name,
            sort_order: to_i32(record.sort_order, "sort_order")?,
            task_number: record.task_number.clone(),
            task_name: record.task_name.clone(),
            description: record.description.clone(),
            status: record.status.as_str().to_string(),
            duration_minutes: record
                .duration_minutes
                .value
                .map(|m| to_i32(m, "duration_minutes"))
                .transpose()?,
            duration_origin: record.duration_minutes.origin.as_str().to_string(),
            headcount: to_i32(record.headcount, "headcount")?,
            phase: record.phase.value.clone(),
            phase_origin: record.phase.origin.as_str().to_string(),
            completed_by: record.completed_by.clone(),
            team: record.team.value.clone(),
            team_origin: record.team.origin.as_str().to_string(),
            completed_at: record.completed_at,
            reference_code: record.reference_code.clone(),
            position: record.position.clone(),
            scope_delayed: record.scope_delayed,
            wi_reference: record.wi_reference.clone(),
            review_flags: record
                .review_flags
                .iter()
                .map(|flag| flag.as_str().to_string())
                .collect(),
        })
    }

    pub fn into_record(self) -> Result<CanonicalTaskRecord, StoreError> {
        let status: TaskStatus = self
            .status
            .parse()
            .map_err(|err: wts_core::DomainError| StoreError::Serialization(err.to_string()))?;
        let review_flags = self
            .review_flags
            .iter()
            .map(|raw| raw.parse::<ReviewFlag>())
            .collect::<Result<_, _>>()
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        Ok(CanonicalTaskRecord {
            unit_number: parse_unit_number(&self.unit_number)?,
            owner: TaskOwner::from_owner_key(&self.owner_key),
            sort_order: to_u32(self.sort_order, "sort_order")?,
            task_number: self.task_number,
            task_name: self.task_name,
            description: self.description,
            status,
            duration_minutes: Field {
                value: self
                    .duration_minutes
                    .map(|m| to_u32(m, "duration_minutes"))
                    .transpose()?,
                origin: parse_origin(&self.duration_origin)?,
            },
            headcount: to_u32(self.headcount, "headcount")?,
            phase: Field {
                value: self.phase,
                origin: parse_origin(&self.phase_origin)?,
            },
            completed_by: self.completed_by,
            team: Field {
                value: self.team,
                origin: parse_origin(&self.team_origin)?,
            },
            completed_at: self.completed_at,
            reference_code: self.reference_code,
            position: self.position,
            scope_delayed: self.scope_delayed,
            wi_reference: self.wi_reference,
            review_flags,
        })
    }
}

/// Column filter values identifying one row by natural key.
pub fn key_filter(key: &NaturalKey) -> Result<[(&'static str, String); 4], StoreError> {
    Ok([
        ("unit_number", key.unit_number.to_string()),
        ("owner_key", key.owner_key.clone()),
        ("task_key", key.task_name.clone()),
        ("sort_order", to_i32(key.sort_order, "sort_order")?.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn task_rows_carry_origins_and_flags() {
        let record = CanonicalTaskRecord {
            unit_number: UnitNumber::parse("96123").unwrap(),
            owner: TaskOwner::Car {
                car_type: "DM 3 CAR".into(),
            },
            sort_order: 4,
            task_number: Some("4".into()),
            task_name: "Fit  cctv cameras".into(),
            description: None,
            status: TaskStatus::InProgress,
            duration_minutes: Field::source(25),
            headcount: 1,
            phase: Field::derived(Some("Build".into())),
            completed_by: vec!["SA".into()],
            team: Field::manual(Some("TFOS".into())),
            completed_at: None,
            reference_code: None,
            position: None,
            scope_delayed: false,
            wi_reference: None,
            review_flags: BTreeSet::from([ReviewFlag::SecondsAsMinutes]),
        };
        let row = TaskRow::from_record(&record).unwrap();
        assert_eq!(row.task_key, "FIT CCTV CAMERAS");
        assert_eq!(row.owner_key, "DM 3 CAR");
        assert_eq!(row.team_origin, "manual");
        assert_eq!(row.review_flags, vec!["seconds_as_minutes"]);
        assert_eq!(row.into_record().unwrap(), record);
    }

    #[test]
    fn corrupt_rows_are_serialization_errors() {
        let row = TaskRow {
            unit_number: "96123".into(),
            owner_key: "UNIT".into(),
            task_key: "X".into(),
            sort_order: 1,
            task_number: None,
            task_name: "X".into(),
            description: None,
            status: "finished".into(),
            duration_minutes: None,
            duration_origin: "derived".into(),
            headcount: 1,
            phase: None,
            phase_origin: "derived".into(),
            completed_by: vec![],
            team: None,
            team_origin: "derived".into(),
            completed_at: None,
            reference_code: None,
            position: None,
            scope_delayed: false,
            wi_reference: None,
            review_flags: vec![],
        };
        assert!(matches!(
            row.into_record(),
            Err(StoreError::Serialization(_))
        ));
    }
}
