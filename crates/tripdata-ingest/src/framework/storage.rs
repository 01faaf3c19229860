//! Collaborator traits used by the pipeline
//!
//! The orchestrator is written against these seams only. Postgres
//! implementations live in [`crate::postgres`]; the integration tests supply
//! in-memory ones.

use super::types::{Chunk, LoadStatus, Partition, RunId, Service};
use crate::error::{ErrorKind, Result};
use crate::profile::{CellValue, DestinationTable, OrderingKey, RawRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Answers whether a partition's source object exists
#[async_trait]
pub trait SourceLocator: Send + Sync {
    async fn exists(&self, partition: &Partition) -> Result<bool>;
}

/// Hands out partition-scoped views over staged raw objects
#[async_trait]
pub trait StagingArea: Send + Sync {
    /// Open the partition's staged object under a fixed ordering.
    ///
    /// The returned dataset holds resources until [`StagedDataset::release`]
    /// is called.
    async fn open(
        &self,
        partition: &Partition,
        ordering: &OrderingKey,
    ) -> Result<Box<dyn StagedDataset>>;
}

/// A staged object frozen for the duration of one partition load
#[async_trait]
pub trait StagedDataset: Send + Sync {
    /// Row count captured when the dataset was opened
    fn row_count(&self) -> u64;

    /// Records with ordinals in `[start, end]` under the dataset's ordering
    async fn read_window(&self, start: u64, end: u64) -> Result<Vec<RawRecord>>;

    /// Drop any per-partition resources; idempotent
    async fn release(&self) -> Result<()>;
}

/// Destination table access: delete-by-tag and chunked insert
#[async_trait]
pub trait DestinationWriter: Send + Sync {
    /// Delete every row whose tag column equals `tag`, returning the count
    async fn purge(&self, table: &DestinationTable, tag: &str) -> Result<u64>;

    /// Open an insert scope for one chunk attempt.
    ///
    /// Rows written through the sink become visible only on commit; a sink
    /// dropped without commit discards them.
    async fn begin_chunk(
        &self,
        table: &DestinationTable,
        columns: &[&str],
        chunk: &Chunk,
    ) -> Result<Box<dyn ChunkSink>>;
}

/// Pending inserts of one chunk attempt
#[async_trait]
pub trait ChunkSink: Send {
    /// Buffer or insert a batch of rows, returning how many were written
    async fn write(&mut self, rows: Vec<Vec<CellValue>>) -> Result<u64>;

    /// Make the chunk's rows durable, returning the chunk's total row count
    async fn commit(&mut self) -> Result<u64>;
}

/// Append-only audit store
#[async_trait]
pub trait LineageLedger: Send + Sync {
    async fn record(&self, record: &LineageRecord) -> Result<()>;
}

/// One immutable audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub run_id: RunId,
    pub service: Service,
    pub year: i32,
    pub month: u32,
    pub source_file: String,
    pub profile: String,
    pub profile_version: u32,
    pub chunk_index: Option<u32>,
    /// Configured chunk size, not the actual window size
    pub chunk_size: Option<u64>,
    pub rows_in_file: Option<u64>,
    pub rows_inserted: u64,
    pub attempts: u32,
    pub status: LoadStatus,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub ingest_ts: DateTime<Utc>,
}
