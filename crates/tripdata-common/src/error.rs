//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by shared types and setup code
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid year-month '{0}': expected YYYY-MM with month 01-12")]
    InvalidYearMonth(String),
}
