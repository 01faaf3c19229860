//! Partition orchestrator
//!
//! Drives one partition through its load:
//!
//! ```text
//! Planned ──► Purging ──► Loading(1..N) ──► Done
//!    │           │             │
//!    ▼           ▼             ▼
//! Missing      Failed        Failed
//! ```
//!
//! Chunks load in ascending order and the first chunk that fails terminally
//! stops the partition. Every terminal outcome is written to the lineage
//! ledger before the orchestrator returns. A ledger write that fails is the
//! one error returned as `Err`; everything else is reported in the
//! [`PartitionOutcome`].

use super::loader::{ChunkLoadReport, ChunkLoader};
use super::planner::plan;
use super::retry::{Classification, FailureReason, RetryPolicy};
use super::storage::{
    DestinationWriter, LineageLedger, LineageRecord, SourceLocator, StagedDataset, StagingArea,
};
use super::types::{Chunk, LoadStatus, Partition, RunId};
use crate::error::{ErrorKind, IngestError, Result};
use crate::profile::DatasetProfile;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Position of a partition in its load lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum PartitionState {
    Planned,
    Purging,
    Loading { chunk: u32, of: u32 },
    Done,
    Missing,
    Failed,
}

/// Final status of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionStatus {
    Ok,
    Missing,
    Failed,
}

/// Error detail attached to a failed partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Chunk being loaded when the partition failed
    pub chunk_index: Option<u32>,
    pub attempts: u32,
}

/// Everything a caller needs to know about one partition run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOutcome {
    pub partition: Partition,
    pub profile: String,
    /// Absent when the run was rejected before an identifier was assigned
    pub run_id: Option<RunId>,
    pub status: PartitionStatus,
    pub rows_in_file: Option<u64>,
    pub rows_purged: u64,
    /// Sum of `rows_inserted` over the partition's OK chunk records
    pub rows_inserted: u64,
    pub rows_rejected: u64,
    pub chunks_planned: u32,
    pub chunks_loaded: u32,
    pub error: Option<OutcomeError>,
}

impl PartitionOutcome {
    fn new(partition: Partition, profile: &DatasetProfile, run_id: Option<RunId>) -> Self {
        Self {
            partition,
            profile: profile.name.clone(),
            run_id,
            status: PartitionStatus::Failed,
            rows_in_file: None,
            rows_purged: 0,
            rows_inserted: 0,
            rows_rejected: 0,
            chunks_planned: 0,
            chunks_loaded: 0,
            error: None,
        }
    }

    /// Outcome for a run that returned `Err` instead of an outcome
    pub fn from_error(partition: Partition, profile: &DatasetProfile, err: &IngestError) -> Self {
        Self {
            error: Some(OutcomeError {
                kind: err.kind(),
                message: err.to_string(),
                chunk_index: None,
                attempts: 0,
            }),
            ..Self::new(partition, profile, None)
        }
    }

    /// Whether this outcome reports a bookkeeping failure rather than a data
    /// load failure
    pub fn is_operational_failure(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.kind.is_operational())
    }
}

/// Tunables of the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub chunk_size: u64,
    pub read_page_size: u64,
    pub retry: RetryPolicy,
}

/// Runs one partition at a time against the pipeline's collaborators
pub struct PartitionOrchestrator {
    locator: Arc<dyn SourceLocator>,
    staging: Arc<dyn StagingArea>,
    writer: Arc<dyn DestinationWriter>,
    ledger: Arc<dyn LineageLedger>,
    loader: ChunkLoader,
    chunk_size: u64,
    retry: RetryPolicy,
}

/// Identity shared by every ledger record of one partition run
struct RunScope<'a> {
    profile: &'a DatasetProfile,
    partition: Partition,
    run_id: &'a RunId,
    source_file: String,
    chunk_size: u64,
}

impl RunScope<'_> {
    fn record(&self, status: LoadStatus) -> LineageRecord {
        LineageRecord {
            run_id: self.run_id.clone(),
            service: self.partition.service,
            year: self.partition.month.year(),
            month: self.partition.month.month(),
            source_file: self.source_file.clone(),
            profile: self.profile.name.clone(),
            profile_version: self.profile.version,
            chunk_index: None,
            chunk_size: None,
            rows_in_file: None,
            rows_inserted: 0,
            attempts: 0,
            status,
            error_kind: None,
            error_message: None,
            ingest_ts: Utc::now(),
        }
    }

    fn chunk_record(&self, chunk: &Chunk, rows_in_file: u64, status: LoadStatus) -> LineageRecord {
        LineageRecord {
            run_id: self.run_id.for_chunk(chunk.index),
            chunk_index: Some(chunk.index),
            chunk_size: Some(self.chunk_size),
            rows_in_file: Some(rows_in_file),
            ..self.record(status)
        }
    }

    fn error_record(&self, err: &IngestError, rows_in_file: Option<u64>) -> LineageRecord {
        LineageRecord {
            rows_in_file,
            error_kind: Some(err.kind()),
            error_message: Some(err.to_string()),
            ..self.record(LoadStatus::Error)
        }
    }
}

impl PartitionOrchestrator {
    pub fn new(
        locator: Arc<dyn SourceLocator>,
        staging: Arc<dyn StagingArea>,
        writer: Arc<dyn DestinationWriter>,
        ledger: Arc<dyn LineageLedger>,
        config: OrchestratorConfig,
    ) -> Self {
        let loader = ChunkLoader::new(writer.clone(), config.read_page_size);
        Self {
            locator,
            staging,
            writer,
            ledger,
            loader,
            chunk_size: config.chunk_size,
            retry: config.retry,
        }
    }

    /// Load one partition with the given profile.
    ///
    /// Returns `Err` only when the run could not be recorded faithfully: a
    /// ledger write failed, or the profile does not describe the partition.
    #[instrument(
        skip_all,
        fields(partition = %partition, profile = %profile.name, version = profile.version)
    )]
    pub async fn run(
        &self,
        profile: &DatasetProfile,
        partition: Partition,
        deadline: Option<Instant>,
    ) -> Result<PartitionOutcome> {
        profile.validate()?;
        if profile.service != partition.service {
            return Err(IngestError::Config(format!(
                "profile '{}' loads {} data, not {}",
                profile.name, profile.service, partition.service
            )));
        }

        let started = Instant::now();
        let run_id = RunId::generate(&partition, Utc::now());
        let scope = RunScope {
            profile,
            partition,
            run_id: &run_id,
            source_file: partition.source_object_name(),
            chunk_size: self.chunk_size,
        };
        let mut outcome = PartitionOutcome::new(partition, profile, Some(run_id.clone()));

        info!(run_id = %run_id, "Starting partition load");
        transition(PartitionState::Planned);

        // 1. Locate the source object
        match self.locator.exists(&partition).await {
            Ok(true) => {}
            Ok(false) => {
                transition(PartitionState::Missing);
                let missing = IngestError::SourceMissing(scope.source_file.clone());
                self.append(LineageRecord {
                    error_kind: Some(ErrorKind::SourceMissing),
                    error_message: Some(missing.to_string()),
                    ..scope.record(LoadStatus::Missing)
                })
                .await?;
                warn!(source_file = %scope.source_file, "Source object not found, skipping");
                outcome.status = PartitionStatus::Missing;
                outcome.error = Some(OutcomeError {
                    kind: ErrorKind::SourceMissing,
                    message: missing.to_string(),
                    chunk_index: None,
                    attempts: 0,
                });
                return Ok(outcome);
            }
            Err(err) => return self.fail_before_load(&scope, outcome, err, None).await,
        }

        // 2. Open a partition-scoped view of the staged object
        let dataset = match self.staging.open(&partition, &profile.ordering).await {
            Ok(dataset) => dataset,
            Err(err) => return self.fail_before_load(&scope, outcome, err, None).await,
        };

        let result = self
            .load_staged(&scope, dataset.as_ref(), &mut outcome, deadline, started)
            .await;

        if let Err(err) = dataset.release().await {
            warn!(error = %err, "Failed to release staged dataset");
        }

        result?;
        info!(
            status = ?outcome.status,
            rows_in_file = ?outcome.rows_in_file,
            rows_inserted = outcome.rows_inserted,
            chunks_loaded = outcome.chunks_loaded,
            chunks_planned = outcome.chunks_planned,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Partition load finished"
        );
        Ok(outcome)
    }

    async fn load_staged(
        &self,
        scope: &RunScope<'_>,
        dataset: &dyn StagedDataset,
        outcome: &mut PartitionOutcome,
        deadline: Option<Instant>,
        started: Instant,
    ) -> Result<()> {
        let rows_in_file = dataset.row_count();
        outcome.rows_in_file = Some(rows_in_file);

        // 3. Plan against the row count fixed at open time
        let chunks = match plan(rows_in_file, self.chunk_size) {
            Ok(chunks) => chunks,
            Err(err) => {
                return self
                    .fail_in_place(scope, outcome, err, Some(rows_in_file))
                    .await
            }
        };
        outcome.chunks_planned = chunks.len() as u32;
        info!(rows_in_file, chunks = chunks.len(), chunk_size = self.chunk_size, "Chunk plan computed");

        // 4. Idempotency guard: remove rows from any earlier run, once
        transition(PartitionState::Purging);
        match self
            .writer
            .purge(&scope.profile.table, &scope.source_file)
            .await
        {
            Ok(purged) => {
                outcome.rows_purged = purged;
                info!(rows_purged = purged, tag = %scope.source_file, "Purged previous rows");
            }
            Err(err) => {
                let err = match err {
                    IngestError::Purge { .. } => err,
                    other => IngestError::Purge {
                        tag: scope.source_file.clone(),
                        message: other.to_string(),
                    },
                };
                return self
                    .fail_in_place(scope, outcome, err, Some(rows_in_file))
                    .await;
            }
        }

        if chunks.is_empty() {
            self.append(LineageRecord {
                rows_in_file: Some(rows_in_file),
                ..scope.record(LoadStatus::Ok)
            })
            .await?;
            transition(PartitionState::Done);
            outcome.status = PartitionStatus::Ok;
            return Ok(());
        }

        // 5. Chunks in ascending order, fail-fast
        let total = chunks.len() as u32;
        for chunk in &chunks {
            transition(PartitionState::Loading {
                chunk: chunk.index,
                of: total,
            });

            match self.load_chunk(scope, chunk, dataset, deadline, started).await {
                Ok((report, attempts)) => {
                    self.append(LineageRecord {
                        rows_inserted: report.rows_inserted,
                        attempts,
                        ..scope.chunk_record(chunk, rows_in_file, LoadStatus::Ok)
                    })
                    .await?;
                    outcome.rows_inserted += report.rows_inserted;
                    outcome.rows_rejected += report.rows_rejected;
                    outcome.chunks_loaded += 1;
                    info!(
                        chunk = chunk.index,
                        of = total,
                        attempts,
                        rows_inserted = report.rows_inserted,
                        rows_rejected = report.rows_rejected,
                        "Chunk loaded"
                    );
                }
                Err((err, attempts)) => {
                    self.append(LineageRecord {
                        rows_inserted: 0,
                        attempts,
                        error_kind: Some(err.kind()),
                        error_message: Some(err.to_string()),
                        ..scope.chunk_record(chunk, rows_in_file, LoadStatus::Error)
                    })
                    .await?;
                    error!(
                        chunk = chunk.index,
                        of = total,
                        attempts,
                        error = %err,
                        "Chunk failed, abandoning partition"
                    );
                    transition(PartitionState::Failed);
                    outcome.status = PartitionStatus::Failed;
                    outcome.error = Some(OutcomeError {
                        kind: err.kind(),
                        message: err.to_string(),
                        chunk_index: Some(chunk.index),
                        attempts,
                    });
                    return Ok(());
                }
            }
        }

        transition(PartitionState::Done);
        outcome.status = PartitionStatus::Ok;
        Ok(())
    }

    /// Retry one chunk until it loads, fails terminally, or time runs out.
    ///
    /// Returns the number of attempts made alongside either result.
    async fn load_chunk(
        &self,
        scope: &RunScope<'_>,
        chunk: &Chunk,
        dataset: &dyn StagedDataset,
        deadline: Option<Instant>,
        started: Instant,
    ) -> std::result::Result<(ChunkLoadReport, u32), (IngestError, u32)> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err((IngestError::Timeout(started.elapsed()), 0));
        }

        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let loader = &self.loader;
        let profile = scope.profile;
        let partition = &scope.partition;

        let retried = self.retry.execute(
            deadline,
            |err: &IngestError| {
                if err.is_retryable() {
                    Classification::Retryable
                } else {
                    Classification::Permanent
                }
            },
            move |attempt| {
                attempts_ref.store(attempt, Ordering::SeqCst);
                loader.load(profile, partition, chunk, dataset)
            },
        );

        let result = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, retried).await {
                Ok(result) => result,
                Err(_) => {
                    return Err((
                        IngestError::Timeout(started.elapsed()),
                        attempts.load(Ordering::SeqCst),
                    ))
                }
            },
            None => retried.await,
        };

        match result {
            Ok(retried) => Ok((retried.value, retried.attempts)),
            Err(failure) => {
                let err = match failure.reason {
                    FailureReason::DeadlineExceeded => {
                        debug!(last_error = %failure.error, "Deadline reached while retrying");
                        IngestError::Timeout(started.elapsed())
                    }
                    FailureReason::Exhausted | FailureReason::Permanent => failure.error,
                };
                Err((err, failure.attempts))
            }
        }
    }

    /// Record a failure that happened before a dataset was opened
    async fn fail_before_load(
        &self,
        scope: &RunScope<'_>,
        mut outcome: PartitionOutcome,
        err: IngestError,
        rows_in_file: Option<u64>,
    ) -> Result<PartitionOutcome> {
        self.fail_in_place(scope, &mut outcome, err, rows_in_file)
            .await?;
        Ok(outcome)
    }

    async fn fail_in_place(
        &self,
        scope: &RunScope<'_>,
        outcome: &mut PartitionOutcome,
        err: IngestError,
        rows_in_file: Option<u64>,
    ) -> Result<()> {
        self.append(scope.error_record(&err, rows_in_file)).await?;
        error!(error = %err, kind = %err.kind(), "Partition failed before loading chunks");
        transition(PartitionState::Failed);
        outcome.status = PartitionStatus::Failed;
        outcome.error = Some(OutcomeError {
            kind: err.kind(),
            message: err.to_string(),
            chunk_index: None,
            attempts: 0,
        });
        Ok(())
    }

    /// Append to the ledger; any failure is a ledger failure
    async fn append(&self, record: LineageRecord) -> Result<()> {
        self.ledger.record(&record).await.map_err(|err| match err {
            IngestError::LedgerWrite(_) => err,
            other => IngestError::LedgerWrite(other.to_string()),
        })
    }
}

fn transition(state: PartitionState) {
    debug!(state = ?state, "Partition state");
}
