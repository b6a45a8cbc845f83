use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use prodimp_core::{ImportSummary, JobSnapshot, JobState, ProductRow, Progress, RowTotal, WebhookPayload};
use prodimp_csv::{CsvRecordReader, ParseError, ReadStats};
use prodimp_storage::{ProductStore, SubscriberRegistry};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dispatcher::DispatcherHandle;
use crate::engine::{BatchUpsertEngine, WindowOutcome, DEFAULT_BATCH_SIZE};
use crate::job_store::{JobStore, JobStoreError};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("CSV file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("CSV contained no valid rows. Ensure the file has sku and name values.")]
    NoValidRows,
    #[error("No products were imported. Verify rows include sku and name values.")]
    NothingImported,
    #[error("reading CSV: {0}")]
    Parse(#[from] ParseError),
    #[error("import stopped at the soft time limit of {limit:?} after {rows_processed} products")]
    SoftTimeLimit { limit: Duration, rows_processed: u64 },
    #[error("import exceeded the hard time limit of {limit:?}")]
    HardTimeLimit { limit: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportLimits {
    pub batch_size: usize,
    /// Checked between windows; the job fails cleanly after the current commit.
    pub soft_time_limit: Duration,
    /// Wall-clock cap on the whole run; the in-flight window is abandoned.
    pub hard_time_limit: Duration,
}

impl Default for ImportLimits {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            soft_time_limit: Duration::from_secs(3300),
            hard_time_limit: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
struct ImportTally {
    total_rows: RowTotal,
    stats: ReadStats,
    processed: u64,
    failed: u64,
    collapsed: u64,
    ignored_inactive: u64,
    windows: u64,
}

impl ImportTally {
    fn new(total_rows: RowTotal) -> Self {
        Self {
            total_rows,
            stats: ReadStats::default(),
            processed: 0,
            failed: 0,
            collapsed: 0,
            ignored_inactive: 0,
            windows: 0,
        }
    }

    fn record(&mut self, outcome: WindowOutcome, stats: ReadStats) {
        self.processed += outcome.written;
        self.failed += outcome.failed;
        self.collapsed += outcome.collapsed_duplicates;
        self.windows += 1;
        self.stats = stats;
    }

    fn progress(&self, status: String) -> JobState {
        JobState::Running(Progress {
            rows_processed: self.processed,
            rows_seen_valid: self.stats.valid,
            total_rows: self.total_rows,
            status,
        })
    }

    fn into_summary(self, job_id: Uuid, started_at: DateTime<Utc>) -> Result<ImportSummary, ImportError> {
        if self.stats.valid == 0 {
            return Err(ImportError::NoValidRows);
        }
        if self.processed == 0 {
            return Err(ImportError::NothingImported);
        }
        let finished_at = Utc::now();
        Ok(ImportSummary {
            job_id,
            total_processed: self.processed,
            total_rows: self.total_rows,
            skipped_rows: self.stats.missing_required,
            malformed_rows: self.stats.malformed,
            failed_rows: self.failed,
            ignored_inactive_flags: self.ignored_inactive,
            message: format!("Successfully processed {} products", self.processed),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        })
    }
}

/// Drives one import job from `running` to a terminal state.
pub struct ImportOrchestrator {
    engine: BatchUpsertEngine,
    jobs: Arc<dyn JobStore>,
    registry: Arc<dyn SubscriberRegistry>,
    dispatcher: DispatcherHandle,
    limits: ImportLimits,
}

impl ImportOrchestrator {
    pub fn new(
        store: Arc<dyn ProductStore>,
        registry: Arc<dyn SubscriberRegistry>,
        jobs: Arc<dyn JobStore>,
        dispatcher: DispatcherHandle,
        limits: ImportLimits,
    ) -> Self {
        Self {
            engine: BatchUpsertEngine::new(store, limits.batch_size),
            jobs,
            registry,
            dispatcher,
            limits,
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Imports `path` under an already created job and returns the terminal
    /// state. The source file is removed whatever the outcome.
    pub async fn run(&self, job_id: Uuid, path: &Path) -> JobState {
        let span = info_span!("import_job", %job_id, path = %path.display());
        self.run_inner(job_id, path).instrument(span).await
    }

    async fn run_inner(&self, job_id: Uuid, path: &Path) -> JobState {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!("import started");
        self.report(job_id, ImportTally::new(RowTotal::Counting).progress("Starting import...".into()))
            .await;

        let hard_limit = self.limits.hard_time_limit;
        let result = match tokio::time::timeout(hard_limit, self.process(job_id, path, clock)).await {
            Ok(result) => result,
            Err(_) => Err(ImportError::HardTimeLimit { limit: hard_limit }),
        };
        remove_source(path).await;

        let state = match result.and_then(|tally| tally.into_summary(job_id, started_at)) {
            Ok(summary) => JobState::Succeeded(summary),
            Err(err) => {
                error!(error = %err, "import failed");
                JobState::Failed {
                    error: err.to_string(),
                }
            }
        };
        self.report(job_id, state.clone()).await;

        if let JobState::Succeeded(summary) = &state {
            info!(
                total_processed = summary.total_processed,
                failed_rows = summary.failed_rows,
                skipped_rows = summary.skipped_rows,
                duration_ms = summary.duration_ms,
                "import succeeded"
            );
            self.notify(summary).await;
        }
        state
    }

    async fn process(&self, job_id: Uuid, path: &Path, clock: Instant) -> Result<ImportTally, ImportError> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Err(ImportError::FileNotFound(path.to_path_buf()));
        }

        let mut tally = ImportTally::new(prodimp_csv::pre_count(path).await);
        info!(total_rows = ?tally.total_rows, "pre-count finished");
        self.report(job_id, tally.progress("Importing products...".into())).await;

        let mut reader = CsvRecordReader::open(path).await?;
        let batch_size = self.engine.batch_size();
        let mut window: Vec<ProductRow> = Vec::with_capacity(batch_size);
        loop {
            let next = reader.next_valid().await?;
            let exhausted = next.is_none();
            if let Some(row) = next {
                if !row.is_active {
                    tally.ignored_inactive += 1;
                }
                window.push(row);
            }

            if window.len() >= batch_size || (exhausted && !window.is_empty()) {
                let outcome = self.engine.apply_window(&window).await;
                window.clear();
                tally.record(outcome, reader.stats());
                debug!(window = tally.windows, processed = tally.processed, "window reported");
                let status = format!("Processed {} products...", tally.processed);
                self.report(job_id, tally.progress(status)).await;

                if !exhausted && clock.elapsed() >= self.limits.soft_time_limit {
                    return Err(ImportError::SoftTimeLimit {
                        limit: self.limits.soft_time_limit,
                        rows_processed: tally.processed,
                    });
                }
            }

            if exhausted {
                break;
            }
        }

        tally.stats = reader.stats();
        debug!(
            windows = tally.windows,
            collapsed = tally.collapsed,
            rows_read = tally.stats.rows_read,
            "stream finished"
        );
        Ok(tally)
    }

    async fn report(&self, job_id: Uuid, state: JobState) {
        if let Err(err) = self.jobs.update(job_id, state).await {
            warn!(error = %err, "job state update rejected");
        }
    }

    async fn notify(&self, summary: &ImportSummary) {
        let payload = match WebhookPayload::import_completed(summary, Utc::now()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "could not build completion payload");
                return;
            }
        };
        match self.dispatcher.fan_out(self.registry.as_ref(), &payload).await {
            Ok(queued) => info!(queued, "completion webhooks queued"),
            Err(err) => warn!(error = %err, "webhook lookup failed; completion not announced"),
        }
    }
}

async fn remove_source(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("source file removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(error = %err, "could not remove source file"),
    }
}

/// Accepts import requests and runs them on a bounded pool of workers.
#[derive(Clone)]
pub struct ImportService {
    orchestrator: Arc<ImportOrchestrator>,
    slots: Arc<Semaphore>,
}

impl ImportService {
    pub fn new(orchestrator: Arc<ImportOrchestrator>, worker_slots: usize) -> Self {
        Self {
            orchestrator,
            slots: Arc::new(Semaphore::new(worker_slots.max(1))),
        }
    }

    /// Registers a pending job for `path` and returns its id without waiting
    /// for a worker.
    pub async fn submit(&self, path: impl Into<PathBuf>) -> Result<Uuid, JobStoreError> {
        let path = path.into();
        let job_id = Uuid::new_v4();
        self.orchestrator.jobs().create(job_id).await?;
        info!(%job_id, path = %path.display(), "import queued");

        let orchestrator = Arc::clone(&self.orchestrator);
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                warn!(%job_id, "worker pool closed; job left pending");
                return;
            };
            orchestrator.run(job_id, &path).await;
        });
        Ok(job_id)
    }

    /// Creates a job for `path` and runs it on the caller's task once a worker
    /// slot is free.
    pub async fn run_now(&self, path: &Path) -> Result<(Uuid, JobState), JobStoreError> {
        let job_id = Uuid::new_v4();
        self.orchestrator.jobs().create(job_id).await?;
        let _permit = self.slots.acquire().await.ok();
        let state = self.orchestrator.run(job_id, path).await;
        Ok((job_id, state))
    }

    pub async fn status(&self, job_id: Uuid) -> Option<JobSnapshot> {
        self.orchestrator.jobs().get(job_id).await
    }

    pub fn orchestrator(&self) -> &Arc<ImportOrchestrator> {
        &self.orchestrator
    }
}
