//! Error types for the bulk-load pipeline
//!
//! Every failure the pipeline can observe is mapped onto one of a small set of
//! kinds. The kind decides what happens next: transient load errors are
//! retried, permanent ones fail the partition at once, and ledger errors are
//! surfaced as operational failures rather than data-load outcomes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Pipeline error
#[derive(Error, Debug, Clone)]
pub enum IngestError {
    /// The partition's source object does not exist
    #[error("source object not found: {0}")]
    SourceMissing(String),

    /// Network, lock or timeout class failure; safe to retry
    #[error("transient load error: {0}")]
    TransientLoad(String),

    /// Malformed chunk plan, schema mismatch, bad data; retrying cannot help
    #[error("permanent load error: {0}")]
    PermanentLoad(String),

    /// The audit write itself failed
    #[error("lineage ledger write failed: {0}")]
    LedgerWrite(String),

    /// The idempotency purge failed; no chunk may be loaded
    #[error("purge of '{tag}' failed: {message}")]
    Purge { tag: String, message: String },

    /// The partition's staged dataset could not be opened or read
    #[error("staging error: {0}")]
    Staging(String),

    /// The partition's wall-clock budget ran out
    #[error("partition deadline exceeded after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Discriminant of [`IngestError`], recorded in the ledger and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceMissing,
    TransientLoad,
    PermanentLoad,
    LedgerWrite,
    Purge,
    Staging,
    Timeout,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceMissing => "source_missing",
            ErrorKind::TransientLoad => "transient_load",
            ErrorKind::PermanentLoad => "permanent_load",
            ErrorKind::LedgerWrite => "ledger_write",
            ErrorKind::Purge => "purge",
            ErrorKind::Staging => "staging",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Config => "config",
        }
    }

    /// Operational kinds mean the pipeline's own bookkeeping broke, as opposed
    /// to a partition's data failing to load.
    pub fn is_operational(&self) -> bool {
        matches!(self, ErrorKind::LedgerWrite | ErrorKind::Config)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::SourceMissing(_) => ErrorKind::SourceMissing,
            IngestError::TransientLoad(_) => ErrorKind::TransientLoad,
            IngestError::PermanentLoad(_) => ErrorKind::PermanentLoad,
            IngestError::LedgerWrite(_) => ErrorKind::LedgerWrite,
            IngestError::Purge { .. } => ErrorKind::Purge,
            IngestError::Staging(_) => ErrorKind::Staging,
            IngestError::Timeout(_) => ErrorKind::Timeout,
            IngestError::Config(_) => ErrorKind::Config,
        }
    }

    /// Only transient load errors are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::TransientLoad(_))
    }

    /// Classify a database error raised while loading a chunk
    pub fn from_load(err: sqlx::Error) -> Self {
        let message = err.to_string();
        if is_transient_sqlx(&err) {
            IngestError::TransientLoad(message)
        } else {
            IngestError::PermanentLoad(message)
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::from_load(err)
    }
}

/// Whether a sqlx error is the network/lock/timeout class that a retry can fix.
///
/// SQLSTATE classes: `08` connection exception, `40` transaction rollback
/// (serialization failure, deadlock), `53` insufficient resources,
/// `55P03` lock not available, `57014` query canceled, `57P01`..`57P03`
/// admin/crash shutdown and cannot-connect-now.
pub fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| is_transient_sqlstate(&code))
            .unwrap_or(false),
        _ => false,
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("40")
        || code.starts_with("53")
        || matches!(code, "55P03" | "57014" | "57P01" | "57P02" | "57P03")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(IngestError::TransientLoad("lock timeout".into()).is_retryable());
        assert!(!IngestError::PermanentLoad("bad plan".into()).is_retryable());
        assert!(!IngestError::LedgerWrite("down".into()).is_retryable());
        assert!(!IngestError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_sqlstate_classification() {
        assert!(is_transient_sqlstate("40001"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("55P03"));
        assert!(is_transient_sqlstate("57014"));
        assert!(!is_transient_sqlstate("42703"));
        assert!(!is_transient_sqlstate("22P02"));
        assert!(!is_transient_sqlstate("23505"));
    }

    #[test]
    fn test_sqlx_error_mapping() {
        assert!(IngestError::from(sqlx::Error::PoolTimedOut).is_retryable());
        assert_eq!(
            IngestError::from(sqlx::Error::RowNotFound).kind(),
            ErrorKind::PermanentLoad
        );
    }

    #[test]
    fn test_operational_kinds() {
        assert!(ErrorKind::LedgerWrite.is_operational());
        assert!(!ErrorKind::TransientLoad.is_operational());
        assert!(!ErrorKind::SourceMissing.is_operational());
    }
}
