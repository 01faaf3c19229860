//! Lineage ledger stored in `ingest_lineage`

use crate::error::{IngestError, Result};
use crate::framework::storage::{LineageLedger, LineageRecord};
use async_trait::async_trait;
use sqlx::PgPool;

/// Append-only ledger; rows are only ever inserted
#[derive(Clone)]
pub struct PgLineageLedger {
    pool: PgPool,
}

impl PgLineageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| IngestError::LedgerWrite(format!("{} {} does not fit in BIGINT", field, value)))
}

#[async_trait]
impl LineageLedger for PgLineageLedger {
    async fn record(&self, record: &LineageRecord) -> Result<()> {
        let chunk_size = record
            .chunk_size
            .map(|v| to_i64(v, "chunk_size"))
            .transpose()?;
        let rows_in_file = record
            .rows_in_file
            .map(|v| to_i64(v, "rows_in_file"))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO ingest_lineage (
                run_id, service, year, month, source_file, profile, profile_version,
                chunk_index, chunk_size, rows_in_file, rows_inserted, attempts,
                status, error_kind, error_message, ingest_ts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(record.run_id.as_str())
        .bind(record.service.as_str())
        .bind(record.year)
        .bind(record.month as i32)
        .bind(&record.source_file)
        .bind(&record.profile)
        .bind(record.profile_version as i32)
        .bind(record.chunk_index.map(|i| i as i32))
        .bind(chunk_size)
        .bind(rows_in_file)
        .bind(to_i64(record.rows_inserted, "rows_inserted")?)
        .bind(record.attempts as i32)
        .bind(record.status.as_str())
        .bind(record.error_kind.map(|k| k.as_str()))
        .bind(record.error_message.as_deref())
        .bind(record.ingest_ts)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::LedgerWrite(e.to_string()))?;

        tracing::debug!(
            run_id = %record.run_id,
            status = %record.status,
            chunk_index = ?record.chunk_index,
            "Lineage record written"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::framework::types::{LoadStatus, Partition, RunId, Service};
    use chrono::Utc;
    use tripdata_common::YearMonth;

    fn chunk_record(index: u32, status: LoadStatus) -> LineageRecord {
        let partition = Partition::new(Service::Green, YearMonth::new(2024, 1).unwrap());
        LineageRecord {
            run_id: RunId::generate(&partition, Utc::now()).for_chunk(index),
            service: partition.service,
            year: 2024,
            month: 1,
            source_file: partition.source_object_name(),
            profile: "green-bronze".to_string(),
            profile_version: 1,
            chunk_index: Some(index),
            chunk_size: Some(10),
            rows_in_file: Some(25),
            rows_inserted: 10,
            attempts: 1,
            status,
            error_kind: None,
            error_message: None,
            ingest_ts: Utc::now(),
        }
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires database
    async fn test_records_are_appended(pool: PgPool) -> Result<()> {
        let ledger = PgLineageLedger::new(pool.clone());

        let ok = chunk_record(1, LoadStatus::Ok);
        let mut failed = chunk_record(2, LoadStatus::Error);
        failed.rows_inserted = 0;
        failed.attempts = 3;
        failed.error_kind = Some(ErrorKind::TransientLoad);
        failed.error_message = Some("connection reset by peer".to_string());
        ledger.record(&ok).await?;
        ledger.record(&failed).await?;

        let rows: Vec<(String, String, Option<i32>, i64, i32, Option<String>)> = sqlx::query_as(
            r#"
            SELECT run_id, status, chunk_index, rows_inserted, attempts, error_kind
            FROM ingest_lineage
            ORDER BY id
            "#,
        )
        .fetch_all(&pool)
        .await?;

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, ok.run_id.as_str());
        assert_eq!(rows[0].1, "OK");
        assert_eq!(rows[0].2, Some(1));
        assert_eq!(rows[0].3, 10);
        assert_eq!(rows[0].5, None);
        assert_eq!(rows[1].1, "ERROR");
        assert_eq!(rows[1].4, 3);
        assert_eq!(rows[1].5.as_deref(), Some("transient_load"));
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires database
    async fn test_partition_level_record(pool: PgPool) -> Result<()> {
        let ledger = PgLineageLedger::new(pool.clone());
        let mut missing = chunk_record(1, LoadStatus::Missing);
        missing.chunk_index = None;
        missing.chunk_size = None;
        missing.rows_in_file = None;
        missing.rows_inserted = 0;
        missing.attempts = 0;
        missing.error_kind = Some(ErrorKind::SourceMissing);
        ledger.record(&missing).await?;

        let (status, chunk_index, source_file): (String, Option<i32>, String) = sqlx::query_as(
            "SELECT status, chunk_index, source_file FROM ingest_lineage",
        )
        .fetch_one(&pool)
        .await?;
        assert_eq!(status, "MISSING");
        assert_eq!(chunk_index, None);
        assert_eq!(source_file, "green_tripdata_2024-01.parquet");
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires database
    async fn test_oversized_count_is_a_ledger_error(pool: PgPool) -> Result<()> {
        let ledger = PgLineageLedger::new(pool.clone());
        let mut record = chunk_record(1, LoadStatus::Ok);
        record.rows_in_file = Some(u64::MAX);

        let err = ledger.record(&record).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LedgerWrite);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_lineage")
            .fetch_one(&pool)
            .await?;
        assert_eq!(count, 0);
        Ok(())
    }
}
