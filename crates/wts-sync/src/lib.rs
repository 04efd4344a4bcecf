use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use wts_adapters::{
    discover_submissions, load_submission, PhaseReference, PlausibleWindow, ReferenceTables,
    SubmissionAdapter, SubmissionError, UnitBatch,
};
use wts_core::{CanonicalTaskRecord, QualityCounters, QualityIssue, UnitNumber};
use wts_storage::{
    ApplyReport, BackoffPolicy, MemoryStore, PgStore, RestStore, RestStoreConfig,
    SubmissionArchive, TaskStore, DEFAULT_PAGE_SIZE,
};

pub mod metrics;
pub mod reconcile;

pub use metrics::{efficiency, EffortSummary, MetricsAggregator, MetricsReport, MetricsScope};
pub use reconcile::{
    merge_record, plan_unit, reconcile_unit, ReconcileError, ReconcileMode, UnitPlan,
};

pub const CRATE_NAME: &str = "wts-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Rest,
    Postgres,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "rest" | "postgrest" => Ok(StoreKind::Rest),
            "postgres" | "pg" => Ok(StoreKind::Postgres),
            other => bail!("unknown store backend `{other}` (expected memory, rest or postgres)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub rest_url: Option<String>,
    pub rest_key: Option<String>,
    pub reference_path: PathBuf,
    pub submissions_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub unit_concurrency: usize,
    pub http_timeout_secs: u64,
    pub page_size: usize,
    pub shift_minutes: u32,
    pub plausible: PlausibleWindow,
    pub mode: ReconcileMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            database_url: None,
            rest_url: None,
            rest_key: None,
            reference_path: PathBuf::from("reference/reference.yaml"),
            submissions_dir: PathBuf::from("submissions"),
            reports_dir: PathBuf::from("reports"),
            archive_dir: PathBuf::from("archive"),
            unit_concurrency: 4,
            http_timeout_secs: 20,
            page_size: DEFAULT_PAGE_SIZE,
            shift_minutes: metrics::DEFAULT_SHIFT_MINUTES,
            plausible: PlausibleWindow::default(),
            mode: ReconcileMode::DryRun,
        }
    }
}

fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_date(name: &str) -> Option<NaiveDate> {
    std::env::var(name)
        .ok()
        .and_then(|v| NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store: env_parsed("WTS_STORE").unwrap_or(defaults.store),
            database_url: std::env::var("DATABASE_URL").ok(),
            rest_url: std::env::var("WTS_REST_URL").ok(),
            rest_key: std::env::var("WTS_REST_KEY").ok(),
            reference_path: std::env::var("WTS_REFERENCE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.reference_path),
            submissions_dir: std::env::var("WTS_SUBMISSIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.submissions_dir),
            reports_dir: std::env::var("WTS_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            archive_dir: std::env::var("WTS_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive_dir),
            unit_concurrency: env_parsed("WTS_UNIT_CONCURRENCY").unwrap_or(defaults.unit_concurrency),
            http_timeout_secs: env_parsed("WTS_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            page_size: env_parsed("WTS_PAGE_SIZE").unwrap_or(defaults.page_size),
            shift_minutes: env_parsed("WTS_SHIFT_MINUTES").unwrap_or(defaults.shift_minutes),
            plausible: PlausibleWindow {
                from: env_date("WTS_PLAUSIBLE_FROM").unwrap_or(defaults.plausible.from),
                to: env_date("WTS_PLAUSIBLE_TO").unwrap_or(defaults.plausible.to),
            },
            mode: defaults.mode,
        }
    }
}

/// Build the configured store backend.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn TaskStore>> {
    let store: Arc<dyn TaskStore> = match config.store {
        StoreKind::Memory => Arc::new(MemoryStore::new(config.page_size)),
        StoreKind::Rest => {
            let base_url = config
                .rest_url
                .clone()
                .context("WTS_REST_URL is required for the rest store")?;
            let api_key = config
                .rest_key
                .clone()
                .context("WTS_REST_KEY is required for the rest store")?;
            Arc::new(RestStore::new(RestStoreConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                page_size: config.page_size,
                backoff: BackoffPolicy::default(),
                ..RestStoreConfig::new(base_url, api_key)
            })?)
        }
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres store")?;
            Arc::new(PgStore::connect(url).await?.with_page_size(config.page_size))
        }
    };
    Ok(store)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Planned,
    Applied,
    Failed,
    Cancelled,
}

/// Result of one unit from one submission. Counts are planned counts in a
/// dry run and written counts once applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitOutcome {
    pub unit_number: String,
    pub file_name: String,
    pub status: UnitStatus,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionRecord {
    pub file_name: String,
    pub content_hash: String,
    pub archived_path: String,
    pub deduplicated: bool,
    pub train_id: Option<String>,
    pub strategy: Option<String>,
    pub units: Vec<String>,
    pub records: usize,
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub file_name: String,
    pub unit_number: String,
    pub plan: UnitPlan,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: ReconcileMode,
    pub backend: String,
    pub submissions: Vec<SubmissionRecord>,
    pub failed_files: Vec<FileFailure>,
    pub units: Vec<UnitOutcome>,
    pub totals: ApplyReport,
    pub quality: QualityCounters,
    pub cancelled: bool,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

impl RunSummary {
    pub fn units_with(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_files.is_empty() || self.units_with(UnitStatus::Failed) > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

struct UnitResult {
    outcome: UnitOutcome,
    plan: Option<PlanEntry>,
}

/// Batches queued for one unit, in submission order.
type UnitQueue = Vec<(String, UnitBatch)>;

async fn run_unit_queue(
    store: Arc<dyn TaskStore>,
    queue: UnitQueue,
    mode: ReconcileMode,
    stop: Arc<AtomicBool>,
    run_id: Uuid,
) -> Vec<UnitResult> {
    let mut results = Vec::with_capacity(queue.len());
    for (file_name, batch) in queue {
        let unit_number = batch.unit.unit_number.to_string();
        let mut outcome = UnitOutcome {
            unit_number: unit_number.clone(),
            file_name: file_name.clone(),
            status: UnitStatus::Cancelled,
            inserted: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            error: None,
        };
        if stop.load(Ordering::SeqCst) {
            info!(unit = %unit_number, file = %file_name, "stop requested, unit not started");
            results.push(UnitResult { outcome, plan: None });
            continue;
        }

        let span = info_span!("reconcile_unit", run_id = %run_id, unit = %unit_number, file = %file_name);
        match reconcile_unit(store.as_ref(), &batch, mode)
            .instrument(span)
            .await
        {
            Ok(reconciliation) => {
                let counts = reconciliation
                    .applied
                    .unwrap_or_else(|| reconciliation.plan.summary());
                outcome.status = if reconciliation.applied.is_some() {
                    UnitStatus::Applied
                } else {
                    UnitStatus::Planned
                };
                outcome.inserted = counts.inserted;
                outcome.updated = counts.updated;
                outcome.deleted = counts.deleted;
                outcome.unchanged = reconciliation.plan.unchanged;
                results.push(UnitResult {
                    outcome,
                    plan: Some(PlanEntry {
                        file_name,
                        unit_number,
                        plan: reconciliation.plan,
                    }),
                });
            }
            Err(err) => {
                warn!(unit = %unit_number, file = %file_name, error = %err, "unit reconciliation failed");
                outcome.status = UnitStatus::Failed;
                outcome.error = Some(err.to_string());
                results.push(UnitResult { outcome, plan: None });
            }
        }
    }
    results
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn TaskStore>,
    reference: Arc<ReferenceTables>,
    adapter: SubmissionAdapter,
    archive: SubmissionArchive,
    stop: Arc<AtomicBool>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn TaskStore>) -> Result<Self> {
        let reference = Arc::new(
            ReferenceTables::load(&config.reference_path)
                .with_context(|| format!("loading {}", config.reference_path.display()))?,
        );
        let adapter = SubmissionAdapter::new(Arc::clone(&reference), config.plausible);
        let archive = SubmissionArchive::new(config.archive_dir.clone());
        Ok(Self {
            config,
            store,
            reference,
            adapter,
            archive,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked before each unit starts; in-flight units finish.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn reference(&self) -> &ReferenceTables {
        &self.reference
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mode = self.config.mode;
        info!(%run_id, ?mode, backend = self.store.backend(), "starting ingestion run");

        let paths = discover_submissions(&self.config.submissions_dir)?;
        let mut quality = QualityCounters::default();
        let mut submissions = Vec::new();
        let mut failed_files = Vec::new();
        let mut units: Vec<UnitOutcome> = Vec::new();
        let mut built: Vec<CanonicalTaskRecord> = Vec::new();
        let mut queues: BTreeMap<UnitNumber, UnitQueue> = BTreeMap::new();

        for path in &paths {
            let file = match load_submission(path) {
                Ok(file) => file,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "could not read submission");
                    failed_files.push(FileFailure {
                        path: path.display().to_string(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            let archived = self
                .archive
                .store_bytes("json", &file.raw)
                .await
                .with_context(|| format!("archiving {}", path.display()))?;
            let file_name = file.workbook.file_name.clone();
            let mut record = SubmissionRecord {
                file_name: file_name.clone(),
                content_hash: archived.content_hash.clone(),
                archived_path: archived.relative_path.display().to_string(),
                deduplicated: archived.deduplicated,
                train_id: None,
                strategy: None,
                units: Vec::new(),
                records: 0,
                skipped: false,
            };

            let extract = match self.adapter.extract(&file.workbook) {
                Ok(extract) => extract,
                Err(SubmissionError::Unresolved(err)) => {
                    warn!(file = %file_name, error = %err, "skipping submission without unit identifiers");
                    quality.record(QualityIssue::UnresolvedIdentifier {
                        file_name: file_name.clone(),
                    });
                    record.skipped = true;
                    submissions.push(record);
                    continue;
                }
                Err(err) => {
                    warn!(file = %file_name, error = %err, "could not extract submission");
                    failed_files.push(FileFailure {
                        path: path.display().to_string(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            info!(
                file = %file_name,
                train = %extract.train_id,
                strategy = extract.strategy,
                units = extract.batches.len(),
                "extracted submission"
            );
            quality.absorb(extract.quality.clone());
            record.train_id = Some(extract.train_id.clone());
            record.strategy = Some(extract.strategy.to_string());
            record.units = extract.units.iter().map(|u| u.unit_number.to_string()).collect();
            record.records = extract.batches.iter().map(|b| b.records.len()).sum();
            submissions.push(record);

            // Units without catalogued sheets only get their metadata written.
            if mode == ReconcileMode::Apply {
                for unit in &extract.units {
                    if extract.batches.iter().any(|b| b.unit.unit_number == unit.unit_number) {
                        continue;
                    }
                    if let Err(err) = self.store.upsert_unit(unit).await {
                        warn!(unit = %unit.unit_number, error = %err, "unit metadata upsert failed");
                        units.push(UnitOutcome {
                            unit_number: unit.unit_number.to_string(),
                            file_name: file_name.clone(),
                            status: UnitStatus::Failed,
                            inserted: 0,
                            updated: 0,
                            deleted: 0,
                            unchanged: 0,
                            error: Some(err.to_string()),
                        });
                    }
                }
            }

            for batch in extract.batches {
                built.extend(batch.records.iter().cloned());
                queues
                    .entry(batch.unit.unit_number.clone())
                    .or_default()
                    .push((file_name.clone(), batch));
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.unit_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (_, queue) in queues {
            let store = Arc::clone(&self.store);
            let stop = Arc::clone(&self.stop);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                run_unit_queue(store, queue, mode, stop, run_id).await
            });
        }
        let mut plans = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            for result in joined.context("unit reconciliation task panicked")? {
                units.push(result.outcome);
                plans.extend(result.plan);
            }
        }
        units.sort_by(|a, b| {
            (&a.unit_number, &a.file_name).cmp(&(&b.unit_number, &b.file_name))
        });
        plans.sort_by(|a: &PlanEntry, b: &PlanEntry| {
            (&a.unit_number, &a.file_name).cmp(&(&b.unit_number, &b.file_name))
        });

        let totals = units
            .iter()
            .filter(|u| matches!(u.status, UnitStatus::Planned | UnitStatus::Applied))
            .fold(ApplyReport::default(), |acc, u| ApplyReport {
                inserted: acc.inserted + u.inserted,
                updated: acc.updated + u.updated,
                deleted: acc.deleted + u.deleted,
            });

        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let manifest_path = self.export_parquet_snapshots(&reports_dir, &built).await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            mode,
            backend: self.store.backend().to_string(),
            submissions,
            failed_files,
            units,
            totals,
            quality,
            cancelled: self.stop.load(Ordering::SeqCst),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        self.write_reports(&reports_dir, &summary, &plans).await?;

        if summary.quality.total_issues() > 0 {
            warn!(
                issues = summary.quality.total_issues(),
                skipped_files = summary.quality.unresolved_identifiers,
                "run finished with data-quality findings"
            );
        }
        info!(
            %run_id,
            units = summary.units.len(),
            failed = summary.units_with(UnitStatus::Failed),
            inserted = summary.totals.inserted,
            updated = summary.totals.updated,
            deleted = summary.totals.deleted,
            "ingestion run finished"
        );
        Ok(summary)
    }

    async fn write_reports(
        &self,
        reports_dir: &Path,
        summary: &RunSummary,
        plans: &[PlanEntry],
    ) -> Result<()> {
        let summary_json =
            serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("summary.json"), summary_json)
            .await
            .context("writing summary.json")?;

        let brief = render_brief(summary, &self.reference.phases);
        fs::write(reports_dir.join("brief.md"), brief)
            .await
            .context("writing brief.md")?;

        let plans_json = serde_json::to_vec_pretty(plans).context("serializing unit plans")?;
        fs::write(reports_dir.join("plans.json"), plans_json)
            .await
            .context("writing plans.json")?;
        Ok(())
    }

    async fn export_parquet_snapshots(
        &self,
        reports_dir: &Path,
        records: &[CanonicalTaskRecord],
    ) -> Result<PathBuf> {
        let snapshot_dir = reports_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let records_path = snapshot_dir.join("task_records.parquet");
        let metrics_path = snapshot_dir.join("person_metrics.parquet");

        write_records_parquet(&records_path, records)?;
        let aggregator = MetricsAggregator::new(&self.reference.teams, self.config.shift_minutes);
        let persons = aggregator.per_person(records, &MetricsScope::default());
        write_person_metrics_parquet(&metrics_path, &persons, |person| {
            self.reference.teams.team_or_unknown(person).to_string()
        })?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("task_records", reports_dir, &records_path)?,
                manifest_entry("person_metrics", reports_dir, &metrics_path)?,
            ],
        };

        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let store = open_store(&config).await?;
    SyncPipeline::new(config, store)?.run_once().await
}

/// Metrics over everything persisted in `store`.
pub async fn store_metrics(
    store: &dyn TaskStore,
    reference: &ReferenceTables,
    shift_minutes: u32,
    scope: &MetricsScope,
) -> Result<MetricsReport> {
    let records = store
        .fetch_all_tasks()
        .await
        .context("reading persisted task records")?;
    Ok(MetricsAggregator::new(&reference.teams, shift_minutes).report(&records, scope))
}

/// Human-readable run brief. Nearest reference names for unmatched tasks
/// are hints for a reviewer and are never applied.
pub fn render_brief(summary: &RunSummary, phases: &PhaseReference) -> String {
    let q = &summary.quality;
    let mut lines = vec![
        "# Work-To-Sheets Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Mode: {:?}", summary.mode),
        format!("- Store: {}", summary.backend),
        format!(
            "- Submissions: {} ({} skipped, {} unreadable)",
            summary.submissions.len(),
            summary.submissions.iter().filter(|s| s.skipped).count(),
            summary.failed_files.len()
        ),
        format!(
            "- Units: {} applied, {} planned, {} failed, {} cancelled",
            summary.units_with(UnitStatus::Applied),
            summary.units_with(UnitStatus::Planned),
            summary.units_with(UnitStatus::Failed),
            summary.units_with(UnitStatus::Cancelled)
        ),
        format!(
            "- Changes: +{} ~{} -{}",
            summary.totals.inserted, summary.totals.updated, summary.totals.deleted
        ),
        String::new(),
        "## Data Quality".to_string(),
        format!("- Unresolved identifiers: {}", q.unresolved_identifiers),
        format!("- Unparseable durations: {}", q.unparseable_durations),
        format!("- Unknown attributions: {}", q.unknown_attributions),
        format!("- Unmatched phases: {}", q.unmatched_phases),
        format!("- Implausible timestamps: {}", q.implausible_timestamps),
        format!("- Seconds read as minutes (review): {}", q.seconds_as_minutes),
        String::new(),
        "## Units".to_string(),
    ];
    for unit in &summary.units {
        let mut line = format!(
            "- {} (`{}`): {:?} +{} ~{} -{} ={}",
            unit.unit_number,
            unit.file_name,
            unit.status,
            unit.inserted,
            unit.updated,
            unit.deleted,
            unit.unchanged
        );
        if let Some(error) = &unit.error {
            line.push_str(&format!(" ({error})"));
        }
        lines.push(line);
    }
    if !q.skipped_files.is_empty() {
        lines.push(String::new());
        lines.push("## Skipped Files".to_string());
        lines.extend(q.skipped_files.iter().map(|f| format!("- {f}")));
    }
    if !q.unknown_identifiers.is_empty() {
        lines.push(String::new());
        lines.push("## Unknown Identifiers".to_string());
        lines.extend(q.unknown_identifiers.iter().map(|id| format!("- {id}")));
    }
    if !q.unmatched_task_names.is_empty() {
        lines.push(String::new());
        lines.push("## Unmatched Task Names".to_string());
        for name in &q.unmatched_task_names {
            match phases.nearest_task(name) {
                Some((candidate, score)) => lines.push(format!(
                    "- {name} (nearest reference task: `{candidate}`, similarity {score:.2})"
                )),
                None => lines.push(format!("- {name}")),
            }
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the `runs` most recent run directories.
pub fn report_runs_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Work-To-Sheets Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("summary.json");
        let brief_path = dir.path().join("brief.md");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        if !summary_path.exists() {
            continue;
        }

        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let mode = summary
            .get("mode")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let backend = summary
            .get("backend")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let units = summary
            .get("units")
            .and_then(|v| v.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default();
        let failed = units
            .iter()
            .filter(|u| u.get("status").and_then(|s| s.as_str()) == Some("failed"))
            .count();
        let total = |field: &str| {
            summary
                .get("totals")
                .and_then(|t| t.get(field))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- mode: {mode} ({backend} store)"));
        lines.push(format!("- units: {} ({failed} failed)", units.len()));
        lines.push(format!(
            "- changes: +{} ~{} -{}",
            total("inserted"),
            total("updated"),
            total("deleted")
        ));
        lines.push(format!("- summary: `{}`", summary_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        if brief_path.exists() {
            lines.push(format!("- brief: `{}`", brief_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_records_parquet(path: &Path, records: &[CanonicalTaskRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("unit_number", DataType::Utf8, false),
        ArrowField::new("owner_key", DataType::Utf8, false),
        ArrowField::new("sort_order", DataType::UInt32, false),
        ArrowField::new("task_name", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("duration_minutes", DataType::UInt32, true),
        ArrowField::new("duration_origin", DataType::Utf8, false),
        ArrowField::new("phase", DataType::Utf8, true),
        ArrowField::new("team", DataType::Utf8, true),
        ArrowField::new("completed_by", DataType::Utf8, false),
        ArrowField::new("completed_at", DataType::Utf8, true),
        ArrowField::new("review_flags", DataType::Utf8, false),
    ]));

    let text = |f: &dyn Fn(&CanonicalTaskRecord) -> Option<String>| {
        StringArray::from(records.iter().map(f).collect::<Vec<_>>())
    };
    let columns: Vec<Arc<dyn arrow_array::Array>> = vec![
        Arc::new(text(&|r| Some(r.unit_number.to_string()))),
        Arc::new(text(&|r| Some(r.owner.owner_key().to_string()))),
        Arc::new(UInt32Array::from(
            records.iter().map(|r| r.sort_order).collect::<Vec<_>>(),
        )),
        Arc::new(text(&|r| Some(r.task_name.clone()))),
        Arc::new(text(&|r| Some(r.status.as_str().to_string()))),
        Arc::new(UInt32Array::from(
            records
                .iter()
                .map(|r| r.duration_minutes.value)
                .collect::<Vec<_>>(),
        )),
        Arc::new(text(&|r| Some(r.duration_minutes.origin.as_str().to_string()))),
        Arc::new(text(&|r| r.phase.value.clone())),
        Arc::new(text(&|r| r.team.value.clone())),
        Arc::new(text(&|r| Some(r.completed_by.join(", ")))),
        Arc::new(text(&|r| r.completed_at.map(|at| at.to_rfc3339()))),
        Arc::new(text(&|r| {
            Some(
                r.review_flags
                    .iter()
                    .map(|flag| flag.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            )
        })),
    ];

    let batch =
        RecordBatch::try_new(schema, columns).context("building task_records record batch")?;
    write_parquet(path, batch)
}

fn write_person_metrics_parquet<F>(path: &Path, persons: &[EffortSummary], team_of: F) -> Result<()>
where
    F: Fn(&str) -> String,
{
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("person", DataType::Utf8, false),
        ArrowField::new("team", DataType::Utf8, false),
        ArrowField::new("task_minutes", DataType::Float64, false),
        ArrowField::new("person_days", DataType::UInt32, false),
        ArrowField::new("tasks", DataType::UInt32, false),
        ArrowField::new("efficiency", DataType::Float64, false),
    ]));

    let people = StringArray::from(persons.iter().map(|p| Some(p.key.as_str())).collect::<Vec<_>>());
    let teams = StringArray::from(persons.iter().map(|p| Some(team_of(&p.key))).collect::<Vec<_>>());
    let minutes = Float64Array::from(persons.iter().map(|p| p.task_minutes).collect::<Vec<_>>());
    let days = UInt32Array::from(
        persons
            .iter()
            .map(|p| u32::try_from(p.person_days).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );
    let tasks = UInt32Array::from(
        persons
            .iter()
            .map(|p| u32::try_from(p.tasks).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );
    let efficiency = Float64Array::from(persons.iter().map(|p| p.efficiency).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(people),
            Arc::new(teams),
            Arc::new(minutes),
            Arc::new(days),
            Arc::new(tasks),
            Arc::new(efficiency),
        ],
    )
    .context("building person_metrics record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_kind_parses_aliases() {
        assert_eq!("Memory".parse::<StoreKind>().unwrap(), StoreKind::Memory);
        assert_eq!("postgrest".parse::<StoreKind>().unwrap(), StoreKind::Rest);
        assert_eq!("pg".parse::<StoreKind>().unwrap(), StoreKind::Postgres);
        assert!("sqlite".parse::<StoreKind>().is_err());
    }

    #[test]
    fn defaults_are_a_dry_run_on_memory() {
        let config = SyncConfig::default();
        assert_eq!(config.mode, ReconcileMode::DryRun);
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.shift_minutes, 480);
        assert_eq!(config.page_size, 1000);
    }

    #[tokio::test]
    async fn rest_store_requires_url_and_key() {
        let config = SyncConfig {
            store: StoreKind::Rest,
            ..SyncConfig::default()
        };
        let err = open_store(&config).await.err().unwrap();
        assert!(err.to_string().contains("WTS_REST_URL"));
    }

    #[test]
    fn parquet_manifest_hashes_written_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshots").join("person_metrics.parquet");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let persons = vec![EffortSummary {
            key: "AS".into(),
            task_minutes: 90.0,
            person_days: 1,
            tasks: 2,
            efficiency: efficiency(90.0, 1, 480),
        }];
        write_person_metrics_parquet(&path, &persons, |_| "Team A".to_string()).unwrap();
        let entry = manifest_entry("person_metrics", dir.path(), &path).unwrap();
        assert_eq!(entry.path, "snapshots/person_metrics.parquet");
        assert_eq!(entry.sha256.len(), 64);
        assert!(entry.bytes > 0);
    }

    #[test]
    fn run_digest_skips_directories_without_summary() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("not-a-run")).unwrap();
        let markdown = report_runs_markdown(5, dir.path()).unwrap();
        assert!(markdown.starts_with("# Work-To-Sheets Runs"));
        assert!(!markdown.contains("not-a-run"));
    }
}
