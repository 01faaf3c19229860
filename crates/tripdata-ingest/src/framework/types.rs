//! Core value types for the bulk-load pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tripdata_common::YearMonth;
use uuid::Uuid;

/// Trip record service (dataset family)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Yellow,
    Green,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Yellow => "yellow",
            Service::Green => "green",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yellow" => Ok(Service::Yellow),
            "green" => Ok(Service::Green),
            other => Err(format!("unknown service '{}', expected yellow or green", other)),
        }
    }
}

/// One unit of source data: a month of one service's trips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub service: Service,
    pub month: YearMonth,
}

impl Partition {
    pub fn new(service: Service, month: YearMonth) -> Self {
        Self { service, month }
    }

    /// Name of the source object, e.g. `yellow_tripdata_2024-01.parquet`.
    ///
    /// This is also the idempotency tag written into every destination row.
    pub fn source_object_name(&self) -> String {
        format!("{}_tripdata_{}.parquet", self.service, self.month)
    }

    /// Lowercase identifier safe to embed in SQL object names
    pub fn slug(&self) -> String {
        format!("{}_{}", self.service, self.month.compact())
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.month)
    }
}

/// A contiguous, inclusive, 1-based row-ordinal range of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 1-based position in the plan
    pub index: u32,
    pub start_ordinal: u64,
    pub end_ordinal: u64,
}

impl Chunk {
    pub fn size(&self) -> u64 {
        self.end_ordinal - self.start_ordinal + 1
    }
}

impl std::fmt::Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chunk {} [{}..={}]",
            self.index, self.start_ordinal, self.end_ordinal
        )
    }
}

/// Terminal status of a load attempt as persisted in the lineage ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoadStatus {
    Ok,
    Error,
    Missing,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Ok => "OK",
            LoadStatus::Error => "ERROR",
            LoadStatus::Missing => "MISSING",
        }
    }
}

impl std::fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier correlating every lineage record of one partition run.
///
/// Format: `{service}_{YYYYMM}_{utc %Y%m%d%H%M%S}_{8 hex}`; chunk records add
/// a `_c{index}` suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate(partition: &Partition, now: DateTime<Utc>) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}_{}_{}_{}",
            partition.service,
            partition.month.compact(),
            now.format("%Y%m%d%H%M%S"),
            &nonce[..8]
        ))
    }

    pub fn for_chunk(&self, index: u32) -> RunId {
        RunId(format!("{}_c{}", self.0, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
