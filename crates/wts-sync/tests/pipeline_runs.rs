use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tempfile::TempDir;
use wts_core::{Field, ReviewFlag, UnitNumber};
use wts_storage::memory::InjectedFault;
use wts_storage::{MemoryStore, TaskStore};
use wts_sync::{report_runs_markdown, ReconcileMode, SyncConfig, SyncPipeline, UnitStatus};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn config(scratch: &TempDir, mode: ReconcileMode) -> SyncConfig {
    let root = workspace_root();
    SyncConfig {
        reference_path: root.join("reference/reference.yaml"),
        submissions_dir: root.join("fixtures/submissions"),
        reports_dir: scratch.path().join("reports"),
        archive_dir: scratch.path().join("archive"),
        mode,
        ..SyncConfig::default()
    }
}

fn unit(number: &str) -> UnitNumber {
    UnitNumber::parse(number).expect("unit number")
}

#[tokio::test]
async fn dry_run_plans_every_unit_and_writes_nothing() {
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::default());
    let pipeline = SyncPipeline::new(config(&scratch, ReconcileMode::DryRun), store.clone())
        .expect("pipeline");

    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(summary.submissions.len(), 3);
    assert_eq!(summary.submissions.iter().filter(|s| s.skipped).count(), 1);
    assert_eq!(summary.quality.unresolved_identifiers, 1);
    assert!(summary.quality.skipped_files.contains("Scan 0042.xlsm"));
    assert_eq!(summary.units_with(UnitStatus::Planned), 3);
    assert_eq!(summary.totals.inserted, 8);
    assert!(!summary.has_failures());

    assert!(store.fetch_all_tasks().await.unwrap().is_empty());
    assert!(store.fetch_unit(&unit("96067")).await.unwrap().is_none());

    let reports_dir = PathBuf::from(&summary.reports_dir);
    for file in ["summary.json", "brief.md", "plans.json", "snapshots/manifest.json"] {
        assert!(reports_dir.join(file).exists(), "missing {file}");
    }
    assert!(reports_dir.join("snapshots/task_records.parquet").exists());
    let brief = std::fs::read_to_string(reports_dir.join("brief.md")).unwrap();
    assert!(brief.contains("REFURBISH GANGWAY"));
    assert!(brief.contains("- Unresolved identifiers: 1"));
}

#[tokio::test]
async fn apply_is_idempotent_across_runs() {
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::default());
    let pipeline = SyncPipeline::new(config(&scratch, ReconcileMode::Apply), store.clone())
        .expect("pipeline");

    let first = pipeline.run_once().await.expect("first run");
    assert_eq!(first.units_with(UnitStatus::Applied), 3);
    assert_eq!(first.totals.inserted, 8);
    assert!(first.submissions.iter().all(|s| !s.deduplicated));
    let stored = store.fetch_all_tasks().await.unwrap();
    assert_eq!(stored.len(), 8);

    // The unit named by the legacy file but without sheets still gets metadata.
    let metadata = store.fetch_unit(&unit("96067")).await.unwrap().unwrap();
    assert_eq!(metadata.train_name.as_deref(), Some("T01 (067-122)"));

    let second = pipeline.run_once().await.expect("second run");
    assert_eq!(second.totals.inserted, 0);
    assert_eq!(second.totals.updated, 0);
    assert_eq!(second.totals.deleted, 0);
    assert!(second.units.iter().all(|u| u.unchanged > 0));
    assert!(second.submissions.iter().all(|s| s.deduplicated));
    assert_eq!(store.fetch_all_tasks().await.unwrap(), stored);

    let digest = report_runs_markdown(5, &scratch.path().join("reports")).unwrap();
    assert!(digest.contains(&first.run_id.to_string()));
    assert!(digest.contains(&second.run_id.to_string()));
}

#[tokio::test]
async fn manual_team_override_survives_resubmission() {
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::default());
    let pipeline = SyncPipeline::new(config(&scratch, ReconcileMode::Apply), store.clone())
        .expect("pipeline");
    pipeline.run_once().await.expect("first run");

    let floor = store
        .fetch_unit_tasks(&unit("96123"))
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.task_name == "Replace floor covering")
        .expect("floor task");
    assert!(
        store
            .amend_task(&floor.natural_key(), |r| {
                r.team = Field::manual(Some("Night Shift".into()))
            })
            .await
    );

    // The first rerun only clears the attribution flag the override settled.
    let rerun = pipeline.run_once().await.expect("rerun");
    assert_eq!(rerun.totals.updated, 1);
    let settled = pipeline.run_once().await.expect("settled rerun");
    assert_eq!(settled.totals.updated, 0);
    let kept = store
        .fetch_unit_tasks(&unit("96123"))
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.task_name == "Replace floor covering")
        .unwrap();
    assert_eq!(kept.team, Field::manual(Some("Night Shift".into())));
    assert!(!kept.review_flags.contains(&ReviewFlag::UnknownAttribution));
}

#[tokio::test]
async fn failed_unit_does_not_stop_the_others() {
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::default());
    store
        .inject_fault(unit("96123"), InjectedFault::Transient)
        .await;
    let pipeline = SyncPipeline::new(config(&scratch, ReconcileMode::Apply), store.clone())
        .expect("pipeline");

    let summary = pipeline.run_once().await.expect("run");
    assert!(summary.has_failures());
    let failed: Vec<_> = summary
        .units
        .iter()
        .filter(|u| u.status == UnitStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].unit_number, "96123");
    assert!(failed[0].error.is_some());
    assert_eq!(summary.units_with(UnitStatus::Applied), 2);

    assert!(store.fetch_unit_tasks(&unit("96123")).await.unwrap().is_empty());
    assert_eq!(store.fetch_unit_tasks(&unit("96004")).await.unwrap().len(), 2);
    assert_eq!(store.fetch_unit_tasks(&unit("96122")).await.unwrap().len(), 2);
}

#[tokio::test]
async fn stop_flag_cancels_units_before_they_start() {
    let scratch = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::default());
    let pipeline = SyncPipeline::new(config(&scratch, ReconcileMode::Apply), store.clone())
        .expect("pipeline");
    pipeline.stop_handle().store(true, Ordering::SeqCst);

    let summary = pipeline.run_once().await.expect("run");
    assert!(summary.cancelled);
    assert_eq!(summary.units_with(UnitStatus::Cancelled), 3);
    assert!(store.fetch_all_tasks().await.unwrap().is_empty());
}
