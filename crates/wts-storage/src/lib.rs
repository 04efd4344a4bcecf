//! Submission archive and the persisted task store capability.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;
use wts_core::{CanonicalTaskRecord, Car, NaturalKey, Unit, UnitNumber};

pub mod memory;
pub mod postgres;
pub mod rest;
pub mod rows;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use rest::{RestStore, RestStoreConfig};

pub const CRATE_NAME: &str = "wts-storage";

pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Rows per insert request when a backend batches writes.
pub const INSERT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct ArchivedSubmission {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, content-addressed copy of every submission ever received.
#[derive(Debug, Clone)]
pub struct SubmissionArchive {
    root: PathBuf,
}

impl SubmissionArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn archive_relative_path(&self, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let fan_out = content_hash.get(..2).unwrap_or("00");
        PathBuf::from(fan_out).join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(&self, extension: &str, bytes: &[u8]) -> anyhow::Result<ArchivedSubmission> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.archive_relative_path(&content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedSubmission {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Network, timeout or server-side failure; safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The store rejected the request as invalid; retrying will not help.
    #[error("store rejected request: {0}")]
    Semantic(String),
    #[error("conflicting store state: {0}")]
    Conflict(String),
    #[error("store row could not be decoded: {0}")]
    Serialization(String),
    /// A partial apply was undone; the unit is back at its previous state.
    #[error("apply for unit {unit} failed and was rolled back: {cause}")]
    RolledBack { unit: String, cause: String },
    /// A partial apply could not be undone.
    #[error("apply for unit {unit} failed ({cause}) and rollback failed ({rollback})")]
    Divergent {
        unit: String,
        cause: String,
        rollback: String,
    },
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Transient(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return StoreError::Serialization(err.to_string());
        }
        match classify_reqwest_error(&err) {
            RetryDisposition::Retryable => StoreError::Transient(err.to_string()),
            RetryDisposition::NonRetryable => StoreError::Semantic(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_) => StoreError::Transient(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_) => StoreError::Serialization(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(err.to_string())
            }
            _ => StoreError::Semantic(err.to_string()),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or retries run out.
/// Only [`StoreError::Transient`] is retried.
pub async fn with_retry<T, F, Fut>(
    backoff: &BackoffPolicy,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < backoff.max_retries =>
            {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(operation, attempt, ?delay, error = %err, "retrying store operation");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Read pages of `page_size` rows starting at offset 0 until a short page.
pub async fn fetch_paginated<T, F, Fut>(page_size: usize, mut fetch_page: F) -> Result<Vec<T>, StoreError>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = Result<Vec<T>, StoreError>>,
{
    let page_size = page_size.max(1);
    let mut out = Vec::new();
    let mut offset = 0;
    loop {
        let page = fetch_page(offset, page_size).await?;
        let len = page.len();
        out.extend(page);
        if len < page_size {
            return Ok(out);
        }
        offset += len;
    }
}

/// Everything to write for one unit, applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSet {
    pub unit: Unit,
    pub cars: Vec<Car>,
    pub inserts: Vec<CanonicalTaskRecord>,
    pub updates: Vec<CanonicalTaskRecord>,
    pub delete_keys: Vec<NaturalKey>,
}

impl ChangeSet {
    pub fn unit_number(&self) -> &UnitNumber {
        &self.unit.unit_number
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.delete_keys.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Persisted store consumed by reconciliation and metrics. Backends own
/// transport, authentication and query syntax.
#[async_trait]
pub trait TaskStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn fetch_unit(&self, unit_number: &UnitNumber) -> Result<Option<Unit>, StoreError>;

    async fn upsert_unit(&self, unit: &Unit) -> Result<(), StoreError>;

    /// Every persisted task of one unit, read page by page.
    async fn fetch_unit_tasks(
        &self,
        unit_number: &UnitNumber,
    ) -> Result<Vec<CanonicalTaskRecord>, StoreError>;

    /// Every persisted task, for metrics.
    async fn fetch_all_tasks(&self) -> Result<Vec<CanonicalTaskRecord>, StoreError>;

    /// Apply a unit's inserts, updates and deletes as one logical transaction.
    /// On failure the unit's previous state is intact, or the error says it
    /// is not.
    async fn apply_reconciliation(&self, changes: &ChangeSet) -> Result<ApplyReport, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn archive_hashing_is_stable() {
        let hash = SubmissionArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = SubmissionArchive::new(dir.path());

        let first = archive
            .store_bytes("json", b"{\"file_name\":\"T32\"}")
            .await
            .expect("first store");
        let second = archive
            .store_bytes(".json", b"{\"file_name\":\"T32\"}")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert!(first
            .relative_path
            .starts_with(&first.content_hash[..2]));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    fn quick_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_exhausted() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), StoreError> = with_retry(&quick_backoff(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Transient("timeout".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn semantic_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), StoreError> = with_retry(&quick_backoff(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Semantic("bad column".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Semantic(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failure() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(&quick_backoff(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(StoreError::Transient("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn pagination_stops_on_short_page() {
        let data: Vec<u32> = (0..25).collect();
        let requests = AtomicUsize::new(0);
        let all = fetch_paginated(10, |offset, limit| {
            requests.fetch_add(1, Ordering::SeqCst);
            let page: Vec<u32> = data.iter().skip(offset).take(limit).copied().collect();
            async move { Ok(page) }
        })
        .await
        .unwrap();
        assert_eq!(all, data);
        assert_eq!(requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn pagination_on_exact_multiple_reads_one_empty_page() {
        let data: Vec<u32> = (0..20).collect();
        let requests = AtomicUsize::new(0);
        let all = fetch_paginated(10, |offset, limit| {
            requests.fetch_add(1, Ordering::SeqCst);
            let page: Vec<u32> = data.iter().skip(offset).take(limit).copied().collect();
            async move { Ok(page) }
        })
        .await
        .unwrap();
        assert_eq!(all.len(), 20);
        assert_eq!(requests.load(Ordering::SeqCst), 3);
    }
}
