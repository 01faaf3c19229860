//! Generic chunk loader
//!
//! Reads one chunk's ordinal window from the staged dataset page by page,
//! filters and transforms each record according to the dataset profile, and
//! writes the resulting rows through a single [`ChunkSink`]. The sink is
//! committed once at the end, so an attempt that fails half way leaves
//! nothing behind and the retry starts clean.

use super::storage::{DestinationWriter, StagedDataset};
use super::types::{Chunk, Partition};
use crate::error::{IngestError, Result};
use crate::profile::transform::{accepts, project, RowContext};
use crate::profile::DatasetProfile;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Row accounting for one successful chunk load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLoadReport {
    pub rows_read: u64,
    /// Rows dropped by the profile's quality filters
    pub rows_rejected: u64,
    pub rows_inserted: u64,
}

pub struct ChunkLoader {
    writer: Arc<dyn DestinationWriter>,
    read_page_size: u64,
}

impl ChunkLoader {
    pub fn new(writer: Arc<dyn DestinationWriter>, read_page_size: u64) -> Self {
        Self {
            writer,
            read_page_size: read_page_size.max(1),
        }
    }

    /// Transform and insert one chunk.
    ///
    /// `rows_inserted` may be lower than the chunk size when filters reject
    /// rows; that is not an error.
    #[instrument(
        skip_all,
        fields(
            partition = %partition,
            chunk = chunk.index,
            start = chunk.start_ordinal,
            end = chunk.end_ordinal
        )
    )]
    pub async fn load(
        &self,
        profile: &DatasetProfile,
        partition: &Partition,
        chunk: &Chunk,
        dataset: &dyn StagedDataset,
    ) -> Result<ChunkLoadReport> {
        chunk.check_within(dataset.row_count())?;

        let columns = profile.column_names();
        let source_object = partition.source_object_name();
        let ctx = RowContext {
            source_object: &source_object,
            service: partition.service,
            load_ts: Utc::now(),
        };

        let mut sink = self
            .writer
            .begin_chunk(&profile.table, &columns, chunk)
            .await?;
        let mut report = ChunkLoadReport::default();

        let mut start = chunk.start_ordinal;
        while start <= chunk.end_ordinal {
            let end = start
                .saturating_add(self.read_page_size - 1)
                .min(chunk.end_ordinal);
            let records = dataset.read_window(start, end).await?;

            let expected = end - start + 1;
            if records.len() as u64 != expected {
                return Err(IngestError::PermanentLoad(format!(
                    "window [{}, {}] returned {} records, expected {}",
                    start,
                    end,
                    records.len(),
                    expected
                )));
            }

            let rows: Vec<_> = records
                .iter()
                .filter(|record| accepts(&profile.filters, record))
                .map(|record| project(&profile.columns, record, &ctx))
                .collect();

            report.rows_read += expected;
            report.rows_rejected += expected - rows.len() as u64;

            debug!(
                page_start = start,
                page_end = end,
                accepted = rows.len(),
                "Page transformed"
            );

            if !rows.is_empty() {
                sink.write(rows).await?;
            }
            start = end + 1;
        }

        report.rows_inserted = sink.commit().await?;
        Ok(report)
    }
}
