//! Dataset profiles
//!
//! A profile is the declarative description of one load: which destination
//! table receives the rows, how each destination column is derived from the
//! raw staged record, which rows are rejected by quality filters, and the
//! ordering used to cut chunk windows. A single generic
//! [`ChunkLoader`](crate::framework::loader::ChunkLoader) executes any profile.
//!
//! Filters are part of the profile and versioned with it. Changing a profile's
//! columns or filters means bumping `version`; the version is written to every
//! lineage record so old loads stay explainable.

pub mod builtin;
pub mod transform;

use crate::error::{IngestError, Result};
use crate::framework::types::Service;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use builtin::{builtin_profiles, find_builtin};
pub use transform::{CellValue, RawRecord};

/// A declarative load description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetProfile {
    /// Stable identifier, e.g. `yellow-silver`
    pub name: String,
    pub version: u32,
    pub service: Service,
    pub table: DestinationTable,
    pub ordering: OrderingKey,
    pub columns: Vec<ColumnMapping>,
    #[serde(default)]
    pub filters: Vec<RowFilter>,
}

/// Destination table and the column carrying the idempotency tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationTable {
    pub name: String,
    pub tag_column: String,
}

/// Deterministic total order over a staged object's records.
///
/// Records are sorted by the raw string value of `field` (missing values sort
/// last) and ties are broken by the record's position in the staged object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingKey {
    pub field: String,
    #[serde(default)]
    pub tie_break: TieBreak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Position of the record in the staged object (1-based)
    #[default]
    IngestOrdinal,
}

/// One destination column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub column: String,
    pub source: ColumnSource,
    pub transform: TransformKind,
}

impl ColumnMapping {
    pub fn field(column: &str, field: &str, transform: TransformKind) -> Self {
        Self {
            column: column.to_string(),
            source: ColumnSource::Field(field.to_string()),
            transform,
        }
    }

    pub fn derived(column: &str, source: ColumnSource, transform: TransformKind) -> Self {
        Self {
            column: column.to_string(),
            source,
            transform,
        }
    }
}

/// Where a column's value comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum ColumnSource {
    /// A field of the raw record
    Field(String),
    /// The partition's source object name (the idempotency tag)
    SourceObject,
    /// The partition's service name
    Service,
    /// Wall-clock time at which the chunk was transformed
    LoadTimestamp,
    /// Always null, typed by the column's transform
    Null,
}

/// Best-effort coercion applied to a raw value.
///
/// Coercions never fail: a value that cannot be converted becomes null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TransformKind {
    Integer,
    /// Integer where zero means "not recorded"
    PositiveIntegerOrNull,
    Decimal { precision: u32, scale: u32 },
    Timestamp,
    /// Timestamp with time zone; only meaningful for [`ColumnSource::LoadTimestamp`]
    TimestampTz,
    Text,
    /// Numeric payment type code mapped to its label
    PaymentTypeLabel,
}

impl TransformKind {
    /// Postgres column type produced by this transform
    pub fn sql_type(&self) -> String {
        match self {
            TransformKind::Integer | TransformKind::PositiveIntegerOrNull => "BIGINT".to_string(),
            TransformKind::Decimal { precision, scale } => {
                format!("NUMERIC({}, {})", precision, scale)
            }
            TransformKind::Timestamp => "TIMESTAMP".to_string(),
            TransformKind::TimestampTz => "TIMESTAMPTZ".to_string(),
            TransformKind::Text | TransformKind::PaymentTypeLabel => "TEXT".to_string(),
        }
    }
}

/// Row-quality predicate; a record is inserted only if every filter accepts it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RowFilter {
    /// The field must hold a parseable timestamp
    RequireTimestamp { field: String },
    /// The field, read as `DECIMAL(precision, scale)`, must be `>= 0`
    NonNegative {
        field: String,
        precision: u32,
        scale: u32,
    },
    /// Hour boundaries crossed between `start` and `end` must not exceed `hours`
    MaxDurationHours {
        start: String,
        end: String,
        hours: i64,
    },
}

/// Largest precision Postgres `NUMERIC` accepts in our migrations
const MAX_DECIMAL_PRECISION: u32 = 38;

impl DatasetProfile {
    /// Names of the destination columns, in insert order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.column.as_str()).collect()
    }

    /// Check the profile is internally consistent before any data is touched.
    ///
    /// Problems here are permanent: no amount of retrying fixes a profile.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| {
            Err(IngestError::PermanentLoad(format!(
                "profile '{}': {}",
                self.name, message
            )))
        };

        if self.name.trim().is_empty() {
            return fail("name must not be empty".to_string());
        }
        if self.version == 0 {
            return fail("version must be at least 1".to_string());
        }
        if !is_identifier(&self.table.name) {
            return fail(format!("invalid table name '{}'", self.table.name));
        }
        if self.ordering.field.trim().is_empty() {
            return fail("ordering field must not be empty".to_string());
        }
        if self.columns.is_empty() {
            return fail("at least one column mapping is required".to_string());
        }

        let mut seen = HashSet::new();
        for mapping in &self.columns {
            if !is_identifier(&mapping.column) {
                return fail(format!("invalid column name '{}'", mapping.column));
            }
            if !seen.insert(mapping.column.as_str()) {
                return fail(format!("column '{}' is mapped twice", mapping.column));
            }
            if let TransformKind::Decimal { precision, scale } = mapping.transform {
                if precision == 0 || precision > MAX_DECIMAL_PRECISION || scale > precision {
                    return fail(format!(
                        "column '{}' has invalid DECIMAL({}, {})",
                        mapping.column, precision, scale
                    ));
                }
            }
            if let ColumnSource::Field(field) = &mapping.source {
                if field.is_empty() {
                    return fail(format!("column '{}' reads an empty field name", mapping.column));
                }
            }
            let load_ts = mapping.source == ColumnSource::LoadTimestamp;
            let tz = mapping.transform == TransformKind::TimestampTz;
            if load_ts != tz && mapping.source != ColumnSource::Null {
                return fail(format!(
                    "column '{}': load timestamps must use the timestamp_tz transform",
                    mapping.column
                ));
            }
        }

        let tag_mapping = self
            .columns
            .iter()
            .find(|c| c.column == self.table.tag_column);
        match tag_mapping {
            Some(mapping) if mapping.source == ColumnSource::SourceObject => {}
            Some(_) => {
                return fail(format!(
                    "tag column '{}' must be mapped from the source object name",
                    self.table.tag_column
                ))
            }
            None => {
                return fail(format!(
                    "tag column '{}' is not mapped",
                    self.table.tag_column
                ))
            }
        }

        for filter in &self.filters {
            match filter {
                RowFilter::NonNegative {
                    precision, scale, ..
                } if *precision == 0 || scale > precision => {
                    return fail(format!(
                        "filter has invalid DECIMAL({}, {})",
                        precision, scale
                    ));
                }
                RowFilter::MaxDurationHours { hours, .. } if *hours < 0 => {
                    return fail("duration cap must not be negative".to_string());
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Lowercase SQL identifier: `[a-z_][a-z0-9_]*`, at most 63 bytes
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
