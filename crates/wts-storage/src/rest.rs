//! PostgREST-style backend over `reqwest`.
//!
//! The REST surface has no multi-row transactions, so an apply journals every
//! write and undoes the journal in reverse when a later write fails. A write
//! is journaled before it is sent: a request whose response was lost may
//! still have landed. After a rollback the unit is read back and compared with
//! its prior state; any difference is reported as divergence.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::{info_span, warn, Instrument};
use wts_core::{CanonicalTaskRecord, NaturalKey, Unit, UnitNumber};

use crate::rows::{key_filter, CarRow, TaskRow, UnitRow};
use crate::{
    classify_status, fetch_paginated, with_retry, ApplyReport, BackoffPolicy, ChangeSet,
    RetryDisposition, StoreError, TaskStore, DEFAULT_PAGE_SIZE, INSERT_BATCH_SIZE,
};

const UNITS_TABLE: &str = "train_units";
const CARS_TABLE: &str = "cars";
const TASKS_TABLE: &str = "task_records";
const TASK_ORDER: &str = "owner_key.asc,task_key.asc,sort_order.asc";
const TASK_CONFLICT: &str = "unit_number,owner_key,task_key,sort_order";

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub page_size: usize,
    pub backoff: BackoffPolicy,
}

impl RestStoreConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(20),
            page_size: DEFAULT_PAGE_SIZE,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A write that may have reached the store and how to undo it.
#[derive(Debug, Clone)]
enum JournalEntry {
    Inserted(Vec<NaturalKey>),
    Updated(NaturalKey),
    Deleted(NaturalKey),
}

#[derive(Debug)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    page_size: usize,
    backoff: BackoffPolicy,
}

fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} {url}: {body}", status.as_u16());
    Err(match (status, classify_status(status)) {
        (StatusCode::CONFLICT, _) => StoreError::Conflict(message),
        (_, RetryDisposition::Retryable) => StoreError::Transient(message),
        (_, RetryDisposition::NonRetryable) => StoreError::Semantic(message),
    })
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            page_size: config.page_size.max(1),
            backoff: config.backoff,
        })
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{table}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    /// Send with retry; `build` is called again for every attempt.
    async fn send<F>(&self, operation: &str, build: F) -> Result<Response, StoreError>
    where
        F: Fn() -> RequestBuilder,
    {
        let build = &build;
        with_retry(&self.backoff, operation, || async move {
            let response = build().send().await?;
            check_status(response).await
        })
        .await
    }

    async fn upsert_row<T: Serialize + Sync>(
        &self,
        table: &str,
        on_conflict: &str,
        row: &T,
    ) -> Result<(), StoreError> {
        self.send("upsert", || {
            self.request(Method::POST, table)
                .query(&[("on_conflict", on_conflict)])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(row)
        })
        .await?;
        Ok(())
    }

    async fn task_page(
        &self,
        unit_number: Option<&UnitNumber>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CanonicalTaskRecord>, StoreError> {
        let response = self
            .send("fetch_tasks", || {
                let mut query = vec![
                    ("order", TASK_ORDER.to_string()),
                    ("limit", limit.to_string()),
                    ("offset", offset.to_string()),
                ];
                if let Some(unit) = unit_number {
                    query.push(("unit_number", eq(unit)));
                }
                self.request(Method::GET, TASKS_TABLE).query(&query)
            })
            .await?;
        let rows: Vec<TaskRow> = response.json().await?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn insert_tasks(&self, records: &[CanonicalTaskRecord]) -> Result<(), StoreError> {
        let rows = records
            .iter()
            .map(TaskRow::from_record)
            .collect::<Result<Vec<_>, _>>()?;
        self.send("insert_tasks", || {
            self.request(Method::POST, TASKS_TABLE)
                .header("Prefer", "return=minimal")
                .json(&rows)
        })
        .await?;
        Ok(())
    }

    async fn update_task(&self, record: &CanonicalTaskRecord) -> Result<(), StoreError> {
        let filter = key_filter(&record.natural_key())?.map(|(column, value)| (column, eq(value)));
        let row = TaskRow::from_record(record)?;
        self.send("update_task", || {
            self.request(Method::PATCH, TASKS_TABLE)
                .query(&filter)
                .header("Prefer", "return=minimal")
                .json(&row)
        })
        .await?;
        Ok(())
    }

    /// Put a prior record back whether or not its row still exists.
    async fn restore_task(&self, record: &CanonicalTaskRecord) -> Result<(), StoreError> {
        self.upsert_row(TASKS_TABLE, TASK_CONFLICT, &TaskRow::from_record(record)?)
            .await
    }

    async fn delete_task(&self, key: &NaturalKey) -> Result<(), StoreError> {
        let filter = key_filter(key)?.map(|(column, value)| (column, eq(value)));
        self.send("delete_task", || {
            self.request(Method::DELETE, TASKS_TABLE)
                .query(&filter)
                .header("Prefer", "return=minimal")
        })
        .await?;
        Ok(())
    }

    async fn apply_journaled(
        &self,
        changes: &ChangeSet,
        journal: &mut Vec<JournalEntry>,
    ) -> Result<ApplyReport, StoreError> {
        let mut report = ApplyReport::default();
        for batch in changes.inserts.chunks(INSERT_BATCH_SIZE) {
            journal.push(JournalEntry::Inserted(
                batch.iter().map(CanonicalTaskRecord::natural_key).collect(),
            ));
            self.insert_tasks(batch).await?;
            report.inserted += batch.len();
        }
        for record in &changes.updates {
            journal.push(JournalEntry::Updated(record.natural_key()));
            self.update_task(record).await?;
            report.updated += 1;
        }
        for key in &changes.delete_keys {
            journal.push(JournalEntry::Deleted(key.clone()));
            self.delete_task(key).await?;
            report.deleted += 1;
        }
        Ok(report)
    }

    async fn roll_back(
        &self,
        journal: Vec<JournalEntry>,
        before: &HashMap<NaturalKey, CanonicalTaskRecord>,
    ) -> Result<(), StoreError> {
        let missing = |key: &NaturalKey| StoreError::Conflict(format!("no prior state for {key}"));
        for entry in journal.into_iter().rev() {
            match entry {
                JournalEntry::Inserted(keys) => {
                    for key in &keys {
                        self.delete_task(key).await?;
                    }
                }
                JournalEntry::Updated(key) | JournalEntry::Deleted(key) => {
                    let previous = before.get(&key).ok_or_else(|| missing(&key))?;
                    self.restore_task(previous).await?;
                }
            }
        }
        Ok(())
    }

    async fn verify_restored(
        &self,
        unit_number: &UnitNumber,
        before: &HashMap<NaturalKey, CanonicalTaskRecord>,
    ) -> Result<(), StoreError> {
        let after = self.fetch_unit_tasks(unit_number).await?;
        let differing = after
            .iter()
            .filter(|record| before.get(&record.natural_key()) != Some(*record))
            .count();
        if after.len() != before.len() || differing > 0 {
            return Err(StoreError::Conflict(format!(
                "state after rollback differs: {} records ({differing} differing), expected {}",
                after.len(),
                before.len()
            )));
        }
        Ok(())
    }

    async fn apply_unit(&self, changes: &ChangeSet) -> Result<ApplyReport, StoreError> {
        let unit = changes.unit_number().to_string();
        let before: HashMap<NaturalKey, CanonicalTaskRecord> = self
            .fetch_unit_tasks(changes.unit_number())
            .await?
            .into_iter()
            .map(|record| (record.natural_key(), record))
            .collect();
        check_preconditions(changes, &before)?;

        // Units and cars are only ever upserted, never removed.
        self.upsert_unit(&changes.unit).await?;
        for car in &changes.cars {
            self.upsert_row(CARS_TABLE, "unit_number,car_type", &CarRow::from_car(car))
                .await?;
        }

        let mut journal = Vec::new();
        let cause = match self.apply_journaled(changes, &mut journal).await {
            Ok(report) => return Ok(report),
            Err(cause) => cause,
        };
        warn!(error = %cause, writes = journal.len(), "apply failed, rolling back");
        let restored = match self.roll_back(journal, &before).await {
            Ok(()) => self.verify_restored(changes.unit_number(), &before).await,
            Err(err) => Err(err),
        };
        match restored {
            Ok(()) => Err(StoreError::RolledBack {
                unit,
                cause: cause.to_string(),
            }),
            Err(rollback) => {
                warn!(error = %rollback, "rollback failed, unit diverged");
                Err(StoreError::Divergent {
                    unit,
                    cause: cause.to_string(),
                    rollback: rollback.to_string(),
                })
            }
        }
    }
}

/// Reject a change set that does not match what is stored before writing.
fn check_preconditions(
    changes: &ChangeSet,
    before: &HashMap<NaturalKey, CanonicalTaskRecord>,
) -> Result<(), StoreError> {
    if let Some(record) = changes
        .inserts
        .iter()
        .find(|r| before.contains_key(&r.natural_key()))
    {
        return Err(StoreError::Conflict(format!(
            "insert of existing key {}",
            record.natural_key()
        )));
    }
    if let Some(record) = changes
        .updates
        .iter()
        .find(|r| !before.contains_key(&r.natural_key()))
    {
        return Err(StoreError::Conflict(format!(
            "update of missing key {}",
            record.natural_key()
        )));
    }
    if let Some(key) = changes.delete_keys.iter().find(|k| !before.contains_key(k)) {
        return Err(StoreError::Conflict(format!("delete of missing key {key}")));
    }
    Ok(())
}

#[async_trait]
impl TaskStore for RestStore {
    fn backend(&self) -> &'static str {
        "rest"
    }

    async fn fetch_unit(&self, unit_number: &UnitNumber) -> Result<Option<Unit>, StoreError> {
        let response = self
            .send("fetch_unit", || {
                self.request(Method::GET, UNITS_TABLE)
                    .query(&[("unit_number", eq(unit_number)), ("limit", "1".to_string())])
            })
            .await?;
        let rows: Vec<UnitRow> = response.json().await?;
        rows.into_iter().next().map(UnitRow::into_unit).transpose()
    }

    async fn upsert_unit(&self, unit: &Unit) -> Result<(), StoreError> {
        self.upsert_row(UNITS_TABLE, "unit_number", &UnitRow::from_unit(unit))
            .await
    }

    async fn fetch_unit_tasks(
        &self,
        unit_number: &UnitNumber,
    ) -> Result<Vec<CanonicalTaskRecord>, StoreError> {
        fetch_paginated(self.page_size, |offset, limit| {
            self.task_page(Some(unit_number), offset, limit)
        })
        .await
    }

    async fn fetch_all_tasks(&self) -> Result<Vec<CanonicalTaskRecord>, StoreError> {
        fetch_paginated(self.page_size, |offset, limit| self.task_page(None, offset, limit)).await
    }

    async fn apply_reconciliation(&self, changes: &ChangeSet) -> Result<ApplyReport, StoreError> {
        let span = info_span!("rest_apply", unit = %changes.unit_number());
        self.apply_unit(changes).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wts_core::{Field, TaskOwner, TaskStatus};

    fn record(name: &str, sort_order: u32) -> CanonicalTaskRecord {
        CanonicalTaskRecord {
            unit_number: UnitNumber::parse("96004").unwrap(),
            owner: TaskOwner::Unit,
            sort_order,
            task_number: None,
            task_name: name.into(),
            description: None,
            status: TaskStatus::NotStarted,
            duration_minutes: Field::empty(),
            headcount: 1,
            phase: Field::empty(),
            completed_by: vec![],
            team: Field::empty(),
            completed_at: None,
            reference_code: None,
            position: None,
            scope_delayed: false,
            wi_reference: None,
            review_flags: Default::default(),
        }
    }

    fn changes() -> ChangeSet {
        ChangeSet {
            unit: Unit {
                unit_number: UnitNumber::parse("96004").unwrap(),
                train_id: None,
                train_name: None,
                construction_phase: None,
            },
            cars: vec![],
            inserts: vec![record("D", 4)],
            updates: vec![record("B", 2)],
            delete_keys: vec![record("A", 1).natural_key()],
        }
    }

    #[test]
    fn preconditions_accept_matching_state() {
        let before: HashMap<_, _> = [record("A", 1), record("B", 2)]
            .into_iter()
            .map(|r| (r.natural_key(), r))
            .collect();
        assert!(check_preconditions(&changes(), &before).is_ok());
    }

    #[test]
    fn preconditions_reject_stale_plans() {
        let before: HashMap<_, _> = [record("B", 2), record("D", 4)]
            .into_iter()
            .map(|r| (r.natural_key(), r))
            .collect();
        assert!(matches!(
            check_preconditions(&changes(), &before),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn base_url_is_normalized() {
        let store = RestStore::new(RestStoreConfig::new("http://localhost:3000/rest/v1/", "key"))
            .unwrap();
        assert_eq!(store.base_url, "http://localhost:3000/rest/v1");
        assert_eq!(store.backend(), "rest");
    }
}
