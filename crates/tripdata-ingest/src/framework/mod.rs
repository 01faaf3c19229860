//! Chunked idempotent bulk-load framework
//!
//! Plans a partition into fixed row windows, purges earlier rows by tag,
//! loads each window under a retry policy, and records every terminal outcome
//! in the lineage ledger. Collaborators are reached through the traits in
//! [`storage`] so the framework itself is independent of the database.

pub mod backfill;
pub mod loader;
pub mod orchestrator;
pub mod planner;
pub mod retry;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use backfill::{partitions_between, BackfillDriver, BackfillReport};
pub use loader::{ChunkLoadReport, ChunkLoader};
pub use orchestrator::{
    OrchestratorConfig, OutcomeError, PartitionOrchestrator, PartitionOutcome, PartitionState,
    PartitionStatus,
};
pub use planner::plan;
pub use retry::{Backoff, Classification, FailureReason, Retried, RetryFailure, RetryPolicy};
pub use storage::{
    ChunkSink, DestinationWriter, LineageLedger, LineageRecord, SourceLocator, StagedDataset,
    StagingArea,
};
pub use types::{Chunk, LoadStatus, Partition, RunId, Service};
