//! In-memory collaborators for pipeline tests
//!
//! Each fake records what the orchestrator asked of it and accepts scripted
//! failures, so tests can assert on call order without a database.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tripdata_common::YearMonth;
use tripdata_ingest::framework::storage::{
    ChunkSink, DestinationWriter, LineageLedger, LineageRecord, SourceLocator, StagedDataset,
    StagingArea,
};
use tripdata_ingest::framework::{
    Chunk, OrchestratorConfig, Partition, PartitionOrchestrator, RetryPolicy, Service,
};
use tripdata_ingest::profile::{CellValue, DestinationTable, OrderingKey, RawRecord};
use tripdata_ingest::{IngestError, Result};

pub type Row = HashMap<String, CellValue>;

// ============================================================================
// Warehouse
// ============================================================================

/// Destination tables with transactional chunk sinks
#[derive(Default)]
pub struct MemoryWarehouse {
    tables: Arc<Mutex<HashMap<String, Vec<Row>>>>,
    /// Errors returned by successive commits of a chunk index
    commit_failures: Arc<Mutex<HashMap<u32, VecDeque<IngestError>>>>,
    purge_failure: Mutex<Option<IngestError>>,
    purges: Mutex<Vec<String>>,
    begun: Arc<Mutex<Vec<u32>>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` commits of chunk `index` with errors from `make`
    pub fn fail_commits(&self, index: u32, times: usize, make: impl Fn() -> IngestError) {
        let mut failures = self.commit_failures.lock().unwrap();
        let queue = failures.entry(index).or_default();
        for _ in 0..times {
            queue.push_back(make());
        }
    }

    pub fn fail_purge(&self, err: IngestError) {
        *self.purge_failure.lock().unwrap() = Some(err);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count_tagged(&self, table: &str, tag_column: &str, tag: &str) -> usize {
        self.rows(table)
            .iter()
            .filter(|row| row.get(tag_column) == Some(&CellValue::Text(Some(tag.to_string()))))
            .count()
    }

    pub fn purges(&self) -> Vec<String> {
        self.purges.lock().unwrap().clone()
    }

    /// Chunk index of every `begin_chunk` call, in call order
    pub fn begun(&self) -> Vec<u32> {
        self.begun.lock().unwrap().clone()
    }
}

#[async_trait]
impl DestinationWriter for MemoryWarehouse {
    async fn purge(&self, table: &DestinationTable, tag: &str) -> Result<u64> {
        self.purges.lock().unwrap().push(tag.to_string());
        if let Some(err) = self.purge_failure.lock().unwrap().take() {
            return Err(err);
        }

        let mut tables = self.tables.lock().unwrap();
        let rows = tables.entry(table.name.clone()).or_default();
        let before = rows.len();
        let expected = CellValue::Text(Some(tag.to_string()));
        rows.retain(|row| row.get(&table.tag_column) != Some(&expected));
        Ok((before - rows.len()) as u64)
    }

    async fn begin_chunk(
        &self,
        table: &DestinationTable,
        columns: &[&str],
        chunk: &Chunk,
    ) -> Result<Box<dyn ChunkSink>> {
        self.begun.lock().unwrap().push(chunk.index);
        Ok(Box::new(MemorySink {
            tables: self.tables.clone(),
            failures: self.commit_failures.clone(),
            table: table.name.clone(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            chunk_index: chunk.index,
            pending: Vec::new(),
        }))
    }
}

struct MemorySink {
    tables: Arc<Mutex<HashMap<String, Vec<Row>>>>,
    failures: Arc<Mutex<HashMap<u32, VecDeque<IngestError>>>>,
    table: String,
    columns: Vec<String>,
    chunk_index: u32,
    pending: Vec<Row>,
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn write(&mut self, rows: Vec<Vec<CellValue>>) -> Result<u64> {
        let written = rows.len() as u64;
        for values in rows {
            assert_eq!(values.len(), self.columns.len(), "row width mismatch");
            self.pending
                .push(self.columns.iter().cloned().zip(values).collect());
        }
        Ok(written)
    }

    async fn commit(&mut self) -> Result<u64> {
        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&self.chunk_index)
            .and_then(|queue| queue.pop_front());
        if let Some(err) = scripted {
            self.pending.clear();
            return Err(err);
        }

        let rows = std::mem::take(&mut self.pending);
        let committed = rows.len() as u64;
        self.tables
            .lock()
            .unwrap()
            .entry(self.table.clone())
            .or_default()
            .extend(rows);
        Ok(committed)
    }
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<LineageRecord>>,
    /// Number of appends that succeed before every later one fails
    fail_after: Mutex<Option<usize>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_after(&self, successes: usize) {
        *self.fail_after.lock().unwrap() = Some(successes);
    }

    pub fn records(&self) -> Vec<LineageRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl LineageLedger for MemoryLedger {
    async fn record(&self, record: &LineageRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if records.len() >= limit {
                return Err(IngestError::LedgerWrite("ledger unavailable".to_string()));
            }
        }
        records.push(record.clone());
        Ok(())
    }
}

// ============================================================================
// Staging
// ============================================================================

/// Staged objects keyed by source object name; also answers existence
#[derive(Default)]
pub struct MemoryStagingArea {
    objects: Mutex<HashMap<String, Vec<Map<String, Value>>>>,
    locate_failure: Mutex<Option<IngestError>>,
    opened: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl MemoryStagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, partition: &Partition, records: Vec<Value>) {
        let records = records
            .into_iter()
            .map(|value| match value {
                Value::Object(fields) => fields,
                other => panic!("staged record must be an object, got {}", other),
            })
            .collect();
        self.objects
            .lock()
            .unwrap()
            .insert(partition.source_object_name(), records);
    }

    pub fn fail_locate(&self, err: IngestError) {
        *self.locate_failure.lock().unwrap() = Some(err);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceLocator for MemoryStagingArea {
    async fn exists(&self, partition: &Partition) -> Result<bool> {
        if let Some(err) = self.locate_failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .contains_key(&partition.source_object_name()))
    }
}

#[async_trait]
impl StagingArea for MemoryStagingArea {
    async fn open(
        &self,
        partition: &Partition,
        ordering: &OrderingKey,
    ) -> Result<Box<dyn StagedDataset>> {
        let fields = self
            .objects
            .lock()
            .unwrap()
            .get(&partition.source_object_name())
            .cloned()
            .ok_or_else(|| IngestError::Staging(format!("{} is not staged", partition)))?;

        // Ingest ordinals are 1-based file positions; sort by the key, missing last
        let mut records: Vec<RawRecord> = fields
            .into_iter()
            .enumerate()
            .map(|(i, fields)| RawRecord::new(i as u64 + 1, fields))
            .collect();
        let key = |r: &RawRecord| r.get(&ordering.field).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        records.sort_by(|a, b| match (key(a), key(b)) {
            (Some(x), Some(y)) => x.cmp(&y).then(a.ordinal.cmp(&b.ordinal)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.ordinal.cmp(&b.ordinal),
        });

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryDataset {
            records,
            released: self.released.clone(),
            done: AtomicUsize::new(0),
        }))
    }
}

struct MemoryDataset {
    /// Position `i` holds the record with window ordinal `i + 1`
    records: Vec<RawRecord>,
    released: Arc<AtomicUsize>,
    done: AtomicUsize,
}

#[async_trait]
impl StagedDataset for MemoryDataset {
    fn row_count(&self) -> u64 {
        self.records.len() as u64
    }

    async fn read_window(&self, start: u64, end: u64) -> Result<Vec<RawRecord>> {
        let start = (start.max(1) - 1) as usize;
        let end = (end as usize).min(self.records.len());
        Ok(self.records.get(start..end).map(<[_]>::to_vec).unwrap_or_default())
    }

    async fn release(&self) -> Result<()> {
        if self.done.swap(1, Ordering::SeqCst) == 0 {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub struct Harness {
    pub staging: Arc<MemoryStagingArea>,
    pub warehouse: Arc<MemoryWarehouse>,
    pub ledger: Arc<MemoryLedger>,
    pub orchestrator: Arc<PartitionOrchestrator>,
}

impl Harness {
    pub fn new(chunk_size: u64, retry: RetryPolicy) -> Self {
        let staging = Arc::new(MemoryStagingArea::new());
        let warehouse = Arc::new(MemoryWarehouse::new());
        let ledger = Arc::new(MemoryLedger::new());
        let orchestrator = Arc::new(PartitionOrchestrator::new(
            staging.clone(),
            staging.clone(),
            warehouse.clone(),
            ledger.clone(),
            OrchestratorConfig {
                chunk_size,
                read_page_size: 4,
                retry,
            },
        ));
        Self {
            staging,
            warehouse,
            ledger,
            orchestrator,
        }
    }

    /// Chunks of 10 rows, 3 attempts, 5 second fixed backoff
    pub fn standard() -> Self {
        Self::new(10, RetryPolicy::fixed(3, Duration::from_secs(5)))
    }
}

pub fn green(year: i32, month: u32) -> Partition {
    Partition::new(Service::Green, YearMonth::new(year, month).unwrap())
}

pub fn yellow(year: i32, month: u32) -> Partition {
    Partition::new(Service::Yellow, YearMonth::new(year, month).unwrap())
}

/// A clean green trip; `n` spreads pickups one minute apart
pub fn green_trip(n: u32) -> Value {
    let pickup = format!("2024-01-01 {:02}:{:02}:00", n / 60, n % 60);
    let dropoff = format!("2024-01-01 {:02}:{:02}:30", n / 60, n % 60);
    json!({
        "VendorID": 2,
        "lpep_pickup_datetime": pickup,
        "lpep_dropoff_datetime": dropoff,
        "store_and_fwd_flag": "N",
        "RatecodeID": 1.0,
        "PULocationID": 74,
        "DOLocationID": 75,
        "passenger_count": 1.0,
        "trip_distance": 1.25,
        "fare_amount": 7.9,
        "extra": 1.0,
        "mta_tax": 0.5,
        "tip_amount": 2.0,
        "tolls_amount": 0.0,
        "ehail_fee": null,
        "improvement_surcharge": 1.0,
        "total_amount": 12.4,
        "payment_type": 1.0,
        "trip_type": 1.0,
        "congestion_surcharge": 0.0
    })
}

pub fn green_trips(count: u32) -> Vec<Value> {
    (0..count).map(green_trip).collect()
}

pub fn transient() -> IngestError {
    IngestError::TransientLoad("connection reset by peer".to_string())
}
