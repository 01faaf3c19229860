//! Backfill driver
//!
//! Runs the orchestrator over an ordered list of partitions and collects one
//! outcome per partition. A failed or missing partition never stops the
//! backfill. Outcomes come back in input order even when partitions run
//! concurrently; all chunks of one partition always stay on one future.

use super::orchestrator::{PartitionOrchestrator, PartitionOutcome, PartitionStatus};
use super::types::{Partition, Service};
use crate::profile::DatasetProfile;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, instrument};
use tripdata_common::YearMonth;

/// Every partition of `service` from `from` to `to`, inclusive
pub fn partitions_between(service: Service, from: YearMonth, to: YearMonth) -> Vec<Partition> {
    YearMonth::range(from, to)
        .map(|month| Partition::new(service, month))
        .collect()
}

/// Complete per-partition result of a backfill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<PartitionOutcome>,
}

impl BackfillReport {
    pub fn count(&self, status: PartitionStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn rows_inserted(&self) -> u64 {
        self.outcomes.iter().map(|o| o.rows_inserted).sum()
    }

    /// Outcomes whose failure was in the pipeline's own bookkeeping
    pub fn operational_failures(&self) -> Vec<&PartitionOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.is_operational_failure())
            .collect()
    }
}

pub struct BackfillDriver {
    orchestrator: Arc<PartitionOrchestrator>,
    profile: DatasetProfile,
    concurrency: usize,
    partition_timeout: Option<Duration>,
}

impl BackfillDriver {
    pub fn new(orchestrator: Arc<PartitionOrchestrator>, profile: DatasetProfile) -> Self {
        Self {
            orchestrator,
            profile,
            concurrency: 1,
            partition_timeout: None,
        }
    }

    /// Number of partitions loaded at the same time; 1 is strictly sequential
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Wall-clock budget per partition; an overrun fails that partition only
    pub fn with_partition_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.partition_timeout = timeout;
        self
    }

    #[instrument(
        skip_all,
        fields(profile = %self.profile.name, partitions = partitions.len(), concurrency = self.concurrency)
    )]
    pub async fn run(&self, partitions: Vec<Partition>) -> BackfillReport {
        let started_at = Utc::now();
        info!("Starting backfill");

        let outcomes: Vec<PartitionOutcome> = stream::iter(partitions)
            .map(|partition| self.run_one(partition))
            .buffered(self.concurrency)
            .collect()
            .await;

        let report = BackfillReport {
            profile: self.profile.name.clone(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };

        info!(
            ok = report.count(PartitionStatus::Ok),
            missing = report.count(PartitionStatus::Missing),
            failed = report.count(PartitionStatus::Failed),
            operational_failures = report.operational_failures().len(),
            rows_inserted = report.rows_inserted(),
            "Backfill finished"
        );
        report
    }

    async fn run_one(&self, partition: Partition) -> PartitionOutcome {
        let deadline = self.partition_timeout.map(|budget| Instant::now() + budget);

        match self.orchestrator.run(&self.profile, partition, deadline).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    partition = %partition,
                    kind = %err.kind(),
                    error = %err,
                    "Partition run could not be recorded"
                );
                PartitionOutcome::from_error(partition, &self.profile, &err)
            }
        }
    }
}
