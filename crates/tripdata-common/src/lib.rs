//! Tripdata Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging setup, and error handling for the tripdata workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`]
//! - **Types**: calendar partition keys such as [`types::YearMonth`]
//!
//! # Example
//!
//! ```no_run
//! use tripdata_common::types::YearMonth;
//!
//! fn months() -> tripdata_common::Result<Vec<YearMonth>> {
//!     let from: YearMonth = "2024-11".parse()?;
//!     let to: YearMonth = "2025-02".parse()?;
//!     Ok(YearMonth::range(from, to).collect())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::YearMonth;
