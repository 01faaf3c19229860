//! Destination tables in Postgres
//!
//! Each chunk attempt runs in its own transaction. Rows are inserted with
//! multi-row `INSERT .. VALUES` statements sized to stay under the protocol's
//! bind parameter limit; the transaction is committed once per chunk.

use super::quote_ident;
use crate::error::{IngestError, Result};
use crate::framework::storage::{ChunkSink, DestinationWriter};
use crate::framework::types::Chunk;
use crate::profile::{CellValue, DestinationTable};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::debug;

/// Postgres caps a statement at 65535 bind parameters
const MAX_BIND_PARAMS: usize = 65_535;

/// Destination writer backed by a connection pool
#[derive(Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Rows currently carrying `tag`
    pub async fn count_tagged(&self, table: &DestinationTable, tag: &str) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = $1",
            quote_ident(&table.name),
            quote_ident(&table.tag_column)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(tag)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl DestinationWriter for PgWarehouse {
    async fn purge(&self, table: &DestinationTable, tag: &str) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1",
            quote_ident(&table.name),
            quote_ident(&table.tag_column)
        );

        let result = sqlx::query(&sql)
            .bind(tag)
            .execute(&self.pool)
            .await
            .map_err(|e| IngestError::Purge {
                tag: tag.to_string(),
                message: e.to_string(),
            })?;

        Ok(result.rows_affected())
    }

    async fn begin_chunk(
        &self,
        table: &DestinationTable,
        columns: &[&str],
        chunk: &Chunk,
    ) -> Result<Box<dyn ChunkSink>> {
        if columns.is_empty() {
            return Err(IngestError::PermanentLoad(
                "cannot insert a chunk without columns".to_string(),
            ));
        }

        let tx = self.pool.begin().await?;
        debug!(table = %table.name, chunk = chunk.index, "Chunk transaction opened");

        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(Box::new(PgChunkSink {
            tx: Some(tx),
            insert_prefix: format!("INSERT INTO {} ({}) ", quote_ident(&table.name), column_list),
            width: columns.len(),
            inserted: 0,
        }))
    }
}

/// One chunk attempt's open transaction; dropping it uncommitted rolls back
struct PgChunkSink {
    tx: Option<Transaction<'static, Postgres>>,
    insert_prefix: String,
    width: usize,
    inserted: u64,
}

#[async_trait]
impl ChunkSink for PgChunkSink {
    async fn write(&mut self, rows: Vec<Vec<CellValue>>) -> Result<u64> {
        let tx = self.tx.as_mut().ok_or_else(|| {
            IngestError::PermanentLoad("chunk transaction already committed".to_string())
        })?;

        if let Some(row) = rows.iter().find(|row| row.len() != self.width) {
            return Err(IngestError::PermanentLoad(format!(
                "row has {} values for {} columns",
                row.len(),
                self.width
            )));
        }

        let rows_per_statement = (MAX_BIND_PARAMS / self.width).max(1);
        let mut written = 0;

        for batch in rows.chunks(rows_per_statement) {
            let mut query_builder = QueryBuilder::<Postgres>::new(self.insert_prefix.as_str());
            query_builder.push_values(batch, |mut b, row| {
                for cell in row {
                    match cell {
                        CellValue::Int(v) => b.push_bind(*v),
                        CellValue::Decimal(v) => b.push_bind(v.clone()),
                        CellValue::Timestamp(v) => b.push_bind(*v),
                        CellValue::TimestampTz(v) => b.push_bind(*v),
                        CellValue::Text(v) => b.push_bind(v.clone()),
                    };
                }
            });

            let result = query_builder.build().execute(&mut **tx).await?;
            written += result.rows_affected();
        }

        self.inserted += written;
        Ok(written)
    }

    async fn commit(&mut self) -> Result<u64> {
        let tx = self.tx.take().ok_or_else(|| {
            IngestError::PermanentLoad("chunk transaction already committed".to_string())
        })?;
        // A commit error leaves the outcome unknown; retrying could insert the
        // chunk twice, so the partition fails and a rerun purges it instead.
        tx.commit().await.map_err(|e| {
            IngestError::PermanentLoad(format!("chunk commit outcome unknown: {}", e))
        })?;
        Ok(self.inserted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use sqlx::types::BigDecimal;

    const COLUMNS: [&str; 3] = ["vendorid", "trip_distance", "source_file"];

    fn green_trips() -> DestinationTable {
        DestinationTable {
            name: "green_trips".to_string(),
            tag_column: "source_file".to_string(),
        }
    }

    fn chunk(index: u32) -> Chunk {
        Chunk {
            index,
            start_ordinal: 1,
            end_ordinal: 10,
        }
    }

    fn rows(count: usize, tag: &str) -> Vec<Vec<CellValue>> {
        (0..count)
            .map(|i| {
                vec![
                    CellValue::Int(Some(i as i64)),
                    CellValue::Decimal(Some("1.250".parse::<BigDecimal>().unwrap())),
                    CellValue::Text(Some(tag.to_string())),
                ]
            })
            .collect()
    }

    async fn load(warehouse: &PgWarehouse, count: usize, tag: &str) -> Result<u64> {
        let mut sink = warehouse.begin_chunk(&green_trips(), &COLUMNS, &chunk(1)).await?;
        sink.write(rows(count, tag)).await?;
        sink.commit().await
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires database
    async fn test_committed_chunk_is_visible(pool: PgPool) -> Result<()> {
        let warehouse = PgWarehouse::new(pool);
        let tag = "green_tripdata_2024-01.parquet";

        let mut sink = warehouse.begin_chunk(&green_trips(), &COLUMNS, &chunk(1)).await?;
        assert_eq!(sink.write(rows(3, tag)).await?, 3);
        assert_eq!(sink.write(rows(2, tag)).await?, 2);
        assert_eq!(warehouse.count_tagged(&green_trips(), tag).await?, 0);

        assert_eq!(sink.commit().await?, 5);
        assert_eq!(warehouse.count_tagged(&green_trips(), tag).await?, 5);

        let err = sink.write(rows(1, tag)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermanentLoad);
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires database
    async fn test_dropped_chunk_rolls_back(pool: PgPool) -> Result<()> {
        let warehouse = PgWarehouse::new(pool);
        let tag = "green_tripdata_2024-01.parquet";

        let mut sink = warehouse.begin_chunk(&green_trips(), &COLUMNS, &chunk(2)).await?;
        sink.write(rows(4, tag)).await?;
        drop(sink);

        assert_eq!(warehouse.count_tagged(&green_trips(), tag).await?, 0);
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires database
    async fn test_purge_only_touches_its_tag(pool: PgPool) -> Result<()> {
        let warehouse = PgWarehouse::new(pool);
        let january = "green_tripdata_2024-01.parquet";
        let february = "green_tripdata_2024-02.parquet";
        load(&warehouse, 3, january).await?;
        load(&warehouse, 2, february).await?;

        assert_eq!(warehouse.purge(&green_trips(), january).await?, 3);
        assert_eq!(warehouse.count_tagged(&green_trips(), january).await?, 0);
        assert_eq!(warehouse.count_tagged(&green_trips(), february).await?, 2);
        assert_eq!(warehouse.purge(&green_trips(), january).await?, 0);
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires database
    async fn test_large_write_stays_under_bind_limit(pool: PgPool) -> Result<()> {
        let warehouse = PgWarehouse::new(pool);
        let tag = "green_tripdata_2024-03.parquet";

        // 21845 rows of 3 values fill one statement exactly
        let written = load(&warehouse, 50_000, tag).await?;
        assert_eq!(written, 50_000);
        assert_eq!(warehouse.count_tagged(&green_trips(), tag).await?, 50_000);
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires database
    async fn test_rejects_bad_row_shapes(pool: PgPool) -> Result<()> {
        let warehouse = PgWarehouse::new(pool);

        let err = warehouse
            .begin_chunk(&green_trips(), &[], &chunk(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::PermanentLoad);

        let mut sink = warehouse.begin_chunk(&green_trips(), &COLUMNS, &chunk(1)).await?;
        let err = sink
            .write(vec![vec![CellValue::Int(Some(1))]])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 values for 3 columns"), "{}", err);
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore] // Requires database
    async fn test_unknown_column_is_permanent(pool: PgPool) -> Result<()> {
        let warehouse = PgWarehouse::new(pool);
        let mut sink = warehouse
            .begin_chunk(&green_trips(), &["no_such_column"], &chunk(1))
            .await?;

        let err = sink
            .write(vec![vec![CellValue::Int(Some(1))]])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermanentLoad);
        Ok(())
    }
}
