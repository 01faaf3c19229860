//! Staged raw objects in Postgres
//!
//! Raw records live in `raw_trip_records` keyed by `(object_name, ordinal)`
//! with a manifest row per object in `staged_objects`. Opening a partition
//! copies its records into a temporary table named after the partition, on a
//! connection held for the whole load, numbering them once under the
//! profile's ordering. Every chunk window is then a plain range scan over
//! that frozen numbering.

use super::quote_ident;
use crate::error::{IngestError, Result};
use crate::framework::storage::{SourceLocator, StagedDataset, StagingArea};
use crate::framework::types::Partition;
use crate::profile::{OrderingKey, RawRecord};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use serde_jsonlines::AsyncJsonLinesReader;
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::path::Path;
use std::pin::Pin;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Rows per `INSERT` while staging a file
const STAGE_BATCH_ROWS: usize = 5_000;

fn staging_error(err: sqlx::Error) -> IngestError {
    IngestError::Staging(err.to_string())
}

/// Staging area over `raw_trip_records` / `staged_objects`
#[derive(Clone)]
pub struct PgStagingArea {
    pool: PgPool,
}

impl PgStagingArea {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceLocator for PgStagingArea {
    async fn exists(&self, partition: &Partition) -> Result<bool> {
        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM staged_objects WHERE object_name = $1")
                .bind(partition.source_object_name())
                .fetch_optional(&self.pool)
                .await
                .map_err(staging_error)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl StagingArea for PgStagingArea {
    #[instrument(skip_all, fields(partition = %partition, order_by = %ordering.field))]
    async fn open(
        &self,
        partition: &Partition,
        ordering: &OrderingKey,
    ) -> Result<Box<dyn StagedDataset>> {
        let object_name = partition.source_object_name();
        let mut conn = self.pool.acquire().await.map_err(staging_error)?;

        let manifest_rows: Option<i64> =
            sqlx::query_scalar("SELECT row_count FROM staged_objects WHERE object_name = $1")
                .bind(&object_name)
                .fetch_optional(&mut *conn)
                .await
                .map_err(staging_error)?;
        let manifest_rows = manifest_rows
            .ok_or_else(|| IngestError::Staging(format!("{} has not been staged", object_name)))?;

        let table = format!("stage_{}", partition.slug());
        let quoted = quote_ident(&table);

        sqlx::query(&format!("DROP TABLE IF EXISTS pg_temp.{}", quoted))
            .execute(&mut *conn)
            .await
            .map_err(staging_error)?;
        sqlx::query(&format!(
            "CREATE TEMP TABLE {} (rn BIGINT PRIMARY KEY, ordinal BIGINT NOT NULL, payload JSONB NOT NULL)",
            quoted
        ))
        .execute(&mut *conn)
        .await
        .map_err(staging_error)?;

        // Ordering key compared bytewise, missing values last, ties by ordinal
        let copied = sqlx::query(&format!(
            r#"
            INSERT INTO {} (rn, ordinal, payload)
            SELECT row_number() OVER (
                       ORDER BY (payload ->> $2::text) COLLATE "C" NULLS LAST, ordinal
                   ),
                   ordinal,
                   payload
            FROM raw_trip_records
            WHERE object_name = $1
            "#,
            quoted
        ))
        .bind(&object_name)
        .bind(&ordering.field)
        .execute(&mut *conn)
        .await
        .map_err(staging_error)?
        .rows_affected();

        if copied != manifest_rows.max(0) as u64 {
            if let Err(e) = sqlx::query(&format!("DROP TABLE IF EXISTS pg_temp.{}", quoted))
                .execute(&mut *conn)
                .await
            {
                warn!(table = %table, error = %e, "Failed to drop staging table");
            }
            return Err(IngestError::Staging(format!(
                "manifest of {} lists {} rows but {} are staged",
                object_name, manifest_rows, copied
            )));
        }

        info!(table = %table, rows = copied, "Staged dataset opened");
        Ok(Box::new(PgStagedDataset {
            conn: Mutex::new(Some(conn)),
            table,
            row_count: copied,
        }))
    }
}

/// Temporary per-partition table on a dedicated connection
pub struct PgStagedDataset {
    conn: Mutex<Option<PoolConnection<Postgres>>>,
    table: String,
    row_count: u64,
}

#[async_trait]
impl StagedDataset for PgStagedDataset {
    fn row_count(&self) -> u64 {
        self.row_count
    }

    async fn read_window(&self, start: u64, end: u64) -> Result<Vec<RawRecord>> {
        let bound = |v: u64| {
            i64::try_from(v)
                .map_err(|_| IngestError::PermanentLoad(format!("ordinal {} out of range", v)))
        };
        let (start, end) = (bound(start)?, bound(end)?);

        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| {
            IngestError::PermanentLoad(format!("staged dataset {} already released", self.table))
        })?;

        let rows = sqlx::query(&format!(
            "SELECT ordinal, payload FROM {} WHERE rn BETWEEN $1 AND $2 ORDER BY rn",
            quote_ident(&self.table)
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&mut **conn)
        .await
        .map_err(staging_error)?;

        rows.into_iter()
            .map(|row| {
                let ordinal: i64 = row.try_get("ordinal").map_err(staging_error)?;
                let payload: Value = row.try_get("payload").map_err(staging_error)?;
                match payload {
                    Value::Object(fields) => Ok(RawRecord::new(ordinal.max(0) as u64, fields)),
                    other => Err(IngestError::PermanentLoad(format!(
                        "record {} is not a JSON object: {}",
                        ordinal, other
                    ))),
                }
            })
            .collect()
    }

    async fn release(&self) -> Result<()> {
        let Some(mut conn) = self.conn.lock().await.take() else {
            return Ok(());
        };

        sqlx::query(&format!("DROP TABLE IF EXISTS pg_temp.{}", quote_ident(&self.table)))
            .execute(&mut *conn)
            .await
            .map_err(staging_error)?;
        debug!(table = %self.table, "Staged dataset released");
        Ok(())
    }
}

/// Result of staging one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub object_name: String,
    pub rows: u64,
}

/// Reader yielding the objects of a JSON lines file in batches
pub struct JsonlRecords {
    stream: Pin<Box<dyn Stream<Item = std::io::Result<Value>> + Send>>,
    line: u64,
}

impl JsonlRecords {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| IngestError::Staging(format!("cannot open {}: {}", path.display(), e)))?;
        let stream = AsyncJsonLinesReader::new(BufReader::new(file)).read_all::<Value>();
        Ok(Self {
            stream: Box::pin(stream),
            line: 0,
        })
    }

    /// Up to `max` records; empty once the file is exhausted.
    ///
    /// Fails on the first line that is not valid JSON or not an object.
    pub async fn next_batch(&mut self, max: usize) -> Result<Vec<Value>> {
        let mut batch = Vec::with_capacity(max.min(STAGE_BATCH_ROWS));
        while batch.len() < max {
            let Some(item) = self.stream.next().await else {
                break;
            };
            self.line += 1;
            let value =
                item.map_err(|e| IngestError::Staging(format!("line {}: {}", self.line, e)))?;
            if !value.is_object() {
                return Err(IngestError::Staging(format!(
                    "line {} is not a JSON object",
                    self.line
                )));
            }
            batch.push(value);
        }
        Ok(batch)
    }
}

/// Replace a partition's staged object with the records of a JSON lines file.
///
/// Every line must be a JSON object. The old records, the new records and the
/// manifest row change in one transaction, so readers see either the old or
/// the new object, never a mix.
#[instrument(skip_all, fields(partition = %partition, path = %path.as_ref().display()))]
pub async fn stage_jsonl(
    pool: &PgPool,
    partition: &Partition,
    path: impl AsRef<Path>,
) -> Result<StageReport> {
    let object_name = partition.source_object_name();
    let mut records = JsonlRecords::open(path.as_ref()).await?;

    let mut tx = pool.begin().await.map_err(staging_error)?;

    sqlx::query("DELETE FROM staged_objects WHERE object_name = $1")
        .bind(&object_name)
        .execute(&mut *tx)
        .await
        .map_err(staging_error)?;
    let replaced = sqlx::query("DELETE FROM raw_trip_records WHERE object_name = $1")
        .bind(&object_name)
        .execute(&mut *tx)
        .await
        .map_err(staging_error)?
        .rows_affected();
    if replaced > 0 {
        warn!(rows = replaced, "Replacing previously staged records");
    }

    let mut ordinal: i64 = 0;
    loop {
        let batch = records.next_batch(STAGE_BATCH_ROWS).await?;
        if batch.is_empty() {
            break;
        }
        let numbered: Vec<(i64, Value)> = batch
            .into_iter()
            .map(|value| {
                ordinal += 1;
                (ordinal, value)
            })
            .collect();
        insert_raw_batch(&mut tx, &object_name, &numbered).await?;
        debug!(rows = ordinal, "Staged batch inserted");
    }

    sqlx::query(
        r#"
        INSERT INTO staged_objects (object_name, service, year, month, row_count, staged_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        "#,
    )
    .bind(&object_name)
    .bind(partition.service.as_str())
    .bind(partition.month.year())
    .bind(partition.month.month() as i32)
    .bind(ordinal)
    .execute(&mut *tx)
    .await
    .map_err(staging_error)?;

    tx.commit().await.map_err(staging_error)?;

    info!(object_name = %object_name, rows = ordinal, "Object staged");
    Ok(StageReport {
        object_name,
        rows: ordinal as u64,
    })
}

async fn insert_raw_batch(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    object_name: &str,
    batch: &[(i64, Value)],
) -> Result<()> {
    let mut query_builder =
        QueryBuilder::<Postgres>::new("INSERT INTO raw_trip_records (object_name, ordinal, payload) ");
    query_builder.push_values(batch, |mut b, (ordinal, payload)| {
        b.push_bind(object_name)
            .push_bind(*ordinal)
            .push_bind(Json(payload));
    });

    query_builder
        .build()
        .execute(&mut **tx)
        .await
        .map_err(staging_error)?;
    Ok(())
}
