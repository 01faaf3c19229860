//! Tripdata Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Chunked, idempotent bulk loading of NYC taxi trip records into Postgres.
//!
//! # Overview
//!
//! A load unit is a **partition**: one service (yellow or green) and one
//! calendar month. Loading a partition:
//!
//! 1. checks that its source object exists (a missing month is recorded, not
//!    raised);
//! 2. stages the rows in a deterministic order and plans fixed-size chunks;
//! 3. deletes every destination row carrying the partition's idempotency tag
//!    (the source file name);
//! 4. inserts each chunk in its own transaction under a bounded retry policy;
//! 5. appends one lineage record per terminal chunk outcome.
//!
//! Re-running a partition therefore replaces its rows instead of duplicating
//! them. A backfill drives many partitions and reports each outcome.
//!
//! # Modules
//!
//! - [`framework`]: planner, retry policy, chunk loader, orchestrator and
//!   backfill driver, written against the collaborator traits in
//!   [`framework::storage`]
//! - [`profile`]: declarative dataset profiles (column mapping, row filters,
//!   ordering key) and the built-in bronze/silver profiles
//! - [`postgres`]: staging area, destination writer and lineage ledger on
//!   SQLx
//! - [`probe`]: HTTP existence check against the public trip record CDN
//! - [`config`] and [`db`]: environment configuration and pool setup
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tripdata_ingest::config::IngestConfig;
//! use tripdata_ingest::framework::{BackfillDriver, PartitionOrchestrator, partitions_between};
//! use tripdata_ingest::postgres::{PgLineageLedger, PgStagingArea, PgWarehouse};
//! use tripdata_ingest::{db, profile};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = IngestConfig::from_env()?;
//! let pool = db::create_pool(&config.database).await?;
//! let staging = Arc::new(PgStagingArea::new(pool.clone()));
//!
//! let orchestrator = Arc::new(PartitionOrchestrator::new(
//!     staging.clone(),
//!     staging,
//!     Arc::new(PgWarehouse::new(pool.clone())),
//!     Arc::new(PgLineageLedger::new(pool)),
//!     config.orchestrator(),
//! ));
//!
//! let profile = profile::find_builtin("green-silver").ok_or_else(|| anyhow::anyhow!("no profile"))?;
//! let partitions = partitions_between(profile.service, "2024-11".parse()?, "2025-02".parse()?);
//! let report = BackfillDriver::new(orchestrator, profile).run(partitions).await;
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod framework;
pub mod postgres;
pub mod probe;
pub mod profile;

// Re-export commonly used types
pub use error::{ErrorKind, IngestError, Result};
