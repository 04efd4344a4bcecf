//! Per-unit replace-by-natural-key merge of a fresh batch over persisted state.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use wts_adapters::UnitBatch;
use wts_core::{CanonicalTaskRecord, FieldOrigin, NaturalKey, ReviewFlag};
use wts_storage::{ApplyReport, ChangeSet, StoreError, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Compute and report plans without writing anything.
    #[default]
    DryRun,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("unit {unit} has two records with natural key {key}")]
    DuplicateNaturalKey { unit: String, key: String },
    #[error(transparent)]
    Store(StoreError),
    #[error("unit {unit} was rolled back after a failed apply: {cause}")]
    RolledBack { unit: String, cause: String },
    #[error("unit {unit} may be partially applied ({cause}); rollback failed: {rollback}")]
    Divergent {
        unit: String,
        cause: String,
        rollback: String,
    },
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RolledBack { unit, cause } => ReconcileError::RolledBack { unit, cause },
            StoreError::Divergent {
                unit,
                cause,
                rollback,
            } => ReconcileError::Divergent {
                unit,
                cause,
                rollback,
            },
            other => ReconcileError::Store(other),
        }
    }
}

/// The diff for one unit. Always computed; applied only in [`ReconcileMode::Apply`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitPlan {
    pub changes: ChangeSet,
    /// Matched keys whose merged record equals the persisted one.
    pub unchanged: usize,
}

impl UnitPlan {
    pub fn summary(&self) -> ApplyReport {
        ApplyReport {
            inserted: self.changes.inserts.len(),
            updated: self.changes.updates.len(),
            deleted: self.changes.delete_keys.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReconciliation {
    pub plan: UnitPlan,
    /// Present once the plan has been written to the store.
    pub applied: Option<ApplyReport>,
}

const DURATION_FLAGS: [ReviewFlag; 3] = [
    ReviewFlag::SecondsAsMinutes,
    ReviewFlag::UnparseableDuration,
    ReviewFlag::DurationFromReference,
];

/// Merge a fresh record over its persisted counterpart. Everything comes
/// from the fresh record except overridable fields a human corrected.
pub fn merge_record(
    incoming: &CanonicalTaskRecord,
    persisted: &CanonicalTaskRecord,
) -> CanonicalTaskRecord {
    let mut merged = incoming.clone();
    merged.team = incoming.team.merged_over(&persisted.team);
    merged.phase = incoming.phase.merged_over(&persisted.phase);
    merged.duration_minutes = incoming
        .duration_minutes
        .merged_over(&persisted.duration_minutes);

    // Flags about a value that was overridden no longer describe the record.
    if merged.team.origin == FieldOrigin::Manual {
        merged.review_flags.remove(&ReviewFlag::UnknownAttribution);
    }
    if merged.phase.origin == FieldOrigin::Manual {
        merged.review_flags.remove(&ReviewFlag::UnmatchedPhase);
    }
    if merged.duration_minutes.origin == FieldOrigin::Manual {
        for flag in DURATION_FLAGS {
            merged.review_flags.remove(&flag);
        }
    }
    merged
}

/// Diff a unit's freshly built batch against what is persisted for it.
///
/// Keys in both are merged and become updates when the merge changes
/// anything. Keys only in the batch are inserted. Keys only in the store are
/// deleted, since the submission is the complete picture of its unit.
pub fn plan_unit(
    batch: &UnitBatch,
    persisted: Vec<CanonicalTaskRecord>,
) -> Result<UnitPlan, ReconcileError> {
    let unit = batch.unit.unit_number.to_string();
    let mut seen = BTreeSet::new();
    for record in &batch.records {
        let key = record.natural_key();
        if !seen.insert(key.clone()) {
            return Err(ReconcileError::DuplicateNaturalKey {
                unit,
                key: key.to_string(),
            });
        }
    }

    let mut persisted: BTreeMap<NaturalKey, CanonicalTaskRecord> = persisted
        .into_iter()
        .map(|record| (record.natural_key(), record))
        .collect();

    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    let mut unchanged = 0;
    for record in &batch.records {
        match persisted.remove(&record.natural_key()) {
            Some(existing) => {
                let merged = merge_record(record, &existing);
                if merged == existing {
                    unchanged += 1;
                } else {
                    updates.push(merged);
                }
            }
            None => inserts.push(record.clone()),
        }
    }
    let delete_keys: Vec<NaturalKey> = persisted.into_keys().collect();

    debug!(
        unit = %unit,
        inserts = inserts.len(),
        updates = updates.len(),
        deletes = delete_keys.len(),
        unchanged,
        "planned unit"
    );
    Ok(UnitPlan {
        changes: ChangeSet {
            unit: batch.unit.clone(),
            cars: batch.cars.clone(),
            inserts,
            updates,
            delete_keys,
        },
        unchanged,
    })
}

/// Plan one unit against the store and, in apply mode, write the plan as
/// one all-or-nothing change.
pub async fn reconcile_unit(
    store: &dyn TaskStore,
    batch: &UnitBatch,
    mode: ReconcileMode,
) -> Result<UnitReconciliation, ReconcileError> {
    let persisted = store.fetch_unit_tasks(&batch.unit.unit_number).await?;
    let plan = plan_unit(batch, persisted)?;
    let applied = match mode {
        ReconcileMode::DryRun => None,
        ReconcileMode::Apply => {
            let report = store.apply_reconciliation(&plan.changes).await?;
            info!(
                unit = %batch.unit.unit_number,
                inserted = report.inserted,
                updated = report.updated,
                deleted = report.deleted,
                "applied unit"
            );
            Some(report)
        }
    };
    Ok(UnitReconciliation { plan, applied })
}
