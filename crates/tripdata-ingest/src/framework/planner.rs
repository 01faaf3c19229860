//! Chunk planning
//!
//! Splits a partition's `[1, row_count]` ordinal range into contiguous,
//! non-overlapping chunks of at most `chunk_size` rows. The row count is read
//! once, when the partition's staged dataset is opened, and every chunk window
//! is computed against that fixed total.

use super::types::Chunk;
use crate::error::{IngestError, Result};

/// Plan the chunks covering `[1, row_count]`.
///
/// Produces `ceil(row_count / chunk_size)` chunks; chunk `i` covers
/// `[(i-1)*chunk_size + 1, min(i*chunk_size, row_count)]`. An empty dataset
/// yields an empty plan.
pub fn plan(row_count: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(IngestError::PermanentLoad(
            "chunk size must be a positive integer".to_string(),
        ));
    }

    let num_chunks = row_count.div_ceil(chunk_size);
    let num_chunks = u32::try_from(num_chunks).map_err(|_| {
        IngestError::PermanentLoad(format!(
            "{} rows at chunk size {} exceed the maximum chunk count",
            row_count, chunk_size
        ))
    })?;

    Ok((1..=num_chunks)
        .map(|index| {
            let start_ordinal = (index as u64 - 1) * chunk_size + 1;
            let end_ordinal = (index as u64 * chunk_size).min(row_count);
            Chunk {
                index,
                start_ordinal,
                end_ordinal,
            }
        })
        .collect())
}

impl Chunk {
    /// Reject boundaries that cannot come from [`plan`] for this row count.
    ///
    /// A malformed boundary is permanent: retrying the same window fails the
    /// same way.
    pub fn check_within(&self, row_count: u64) -> Result<()> {
        if self.start_ordinal == 0
            || self.start_ordinal > self.end_ordinal
            || self.end_ordinal > row_count
        {
            return Err(IngestError::PermanentLoad(format!(
                "malformed {} for a dataset of {} rows",
                self, row_count
            )));
        }
        Ok(())
    }
}
