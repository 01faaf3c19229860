//! Best-effort value coercion and row-quality filtering
//!
//! Raw staged records are loose JSON objects. Every coercion here follows the
//! same rule: a value that cannot be converted becomes null, it never aborts
//! the chunk.

use super::{ColumnMapping, ColumnSource, RowFilter, TransformKind};
use crate::framework::types::Service;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::BigDecimal;
use std::str::FromStr;

/// One record of a staged object, with its 1-based position in the object
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub ordinal: u64,
    pub fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new(ordinal: u64, fields: Map<String, Value>) -> Self {
        Self { ordinal, fields }
    }

    /// Field value, with JSON null treated as absent
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }
}

/// A typed destination cell. The variant fixes the SQL type even when null.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Int(Option<i64>),
    Decimal(Option<BigDecimal>),
    Timestamp(Option<NaiveDateTime>),
    TimestampTz(Option<DateTime<Utc>>),
    Text(Option<String>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        match self {
            CellValue::Int(v) => v.is_none(),
            CellValue::Decimal(v) => v.is_none(),
            CellValue::Timestamp(v) => v.is_none(),
            CellValue::TimestampTz(v) => v.is_none(),
            CellValue::Text(v) => v.is_none(),
        }
    }

    fn null_of(kind: TransformKind) -> Self {
        apply(kind, None)
    }
}

/// Per-chunk values for the derived column sources
#[derive(Debug, Clone)]
pub struct RowContext<'a> {
    pub source_object: &'a str,
    pub service: Service,
    pub load_ts: DateTime<Utc>,
}

/// Whether every filter accepts the record
pub fn accepts(filters: &[RowFilter], record: &RawRecord) -> bool {
    filters.iter().all(|filter| filter.accepts(record))
}

/// Project a raw record onto the destination columns
pub fn project(columns: &[ColumnMapping], record: &RawRecord, ctx: &RowContext<'_>) -> Vec<CellValue> {
    columns
        .iter()
        .map(|mapping| match &mapping.source {
            ColumnSource::Field(field) => apply(mapping.transform, record.get(field)),
            ColumnSource::SourceObject => CellValue::Text(Some(ctx.source_object.to_string())),
            ColumnSource::Service => CellValue::Text(Some(ctx.service.as_str().to_string())),
            ColumnSource::LoadTimestamp => CellValue::TimestampTz(Some(ctx.load_ts)),
            ColumnSource::Null => CellValue::null_of(mapping.transform),
        })
        .collect()
}

/// Apply one coercion to an optional raw value
pub fn apply(kind: TransformKind, raw: Option<&Value>) -> CellValue {
    match kind {
        TransformKind::Integer => CellValue::Int(raw.and_then(to_integer)),
        TransformKind::PositiveIntegerOrNull => {
            CellValue::Int(raw.and_then(to_integer).filter(|n| *n != 0))
        }
        TransformKind::Decimal { precision, scale } => {
            CellValue::Decimal(raw.and_then(|v| to_decimal(v, precision, scale)))
        }
        TransformKind::Timestamp => CellValue::Timestamp(raw.and_then(to_timestamp)),
        TransformKind::TimestampTz => {
            CellValue::TimestampTz(raw.and_then(to_timestamp).map(|t| t.and_utc()))
        }
        TransformKind::Text => CellValue::Text(raw.and_then(to_text)),
        TransformKind::PaymentTypeLabel => {
            CellValue::Text(Some(payment_type_label(raw.and_then(to_integer)).to_string()))
        }
    }
}

impl RowFilter {
    pub fn accepts(&self, record: &RawRecord) -> bool {
        match self {
            RowFilter::RequireTimestamp { field } => {
                record.get(field).and_then(to_timestamp).is_some()
            }
            RowFilter::NonNegative {
                field,
                precision,
                scale,
            } => record
                .get(field)
                .and_then(|v| to_decimal(v, *precision, *scale))
                .is_some_and(|d| d >= BigDecimal::from(0)),
            RowFilter::MaxDurationHours { start, end, hours } => {
                let start = record.get(start).and_then(to_timestamp);
                let end = record.get(end).and_then(to_timestamp);
                match (start, end) {
                    (Some(start), Some(end)) => hour_boundaries_crossed(start, end) <= *hours,
                    _ => false,
                }
            }
        }
    }
}

/// Number of hour boundaries between two timestamps, negative when `end`
/// precedes `start`
pub fn hour_boundaries_crossed(start: NaiveDateTime, end: NaiveDateTime) -> i64 {
    let hour = |t: NaiveDateTime| t.and_utc().timestamp().div_euclid(3600);
    hour(end) - hour(start)
}

/// Integer coercion: integral values as-is, fractional values rounded half
/// away from zero, anything else null
pub fn to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(round_f64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(round_f64))
        }
        _ => None,
    }
}

fn round_f64(value: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is already out of range
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    let rounded = value.round();
    if rounded.is_finite() && rounded >= -LIMIT && rounded < LIMIT {
        Some(rounded as i64)
    } else {
        None
    }
}

/// `DECIMAL(precision, scale)` coercion, rounding half away from zero.
///
/// Null when unparseable or when the rounded value needs more than
/// `precision - scale` integer digits.
pub fn to_decimal(value: &Value, precision: u32, scale: u32) -> Option<BigDecimal> {
    let parsed = match value {
        Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok()?,
        Value::String(s) => BigDecimal::from_str(s.trim()).ok()?,
        _ => return None,
    };

    let scale = i64::from(scale);
    let negative = parsed < BigDecimal::from(0);
    let half = BigDecimal::new(5.into(), scale + 1);
    let magnitude = (parsed.abs() + half).with_scale(scale);

    let limit = BigDecimal::new(1.into(), -(i64::from(precision) - scale));
    if magnitude >= limit {
        return None;
    }

    Some(if negative { -magnitude } else { magnitude })
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Timestamp coercion.
///
/// Accepts `YYYY-MM-DD HH:MM:SS[.f]`, the ISO `T` form, RFC 3339 (converted
/// to UTC), bare dates, and epoch numbers. Epoch magnitude decides the unit:
/// seconds, milliseconds or microseconds.
pub fn to_timestamp(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::String(s) => parse_timestamp_str(s.trim()),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(round_f64))
            .and_then(from_epoch),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<NaiveDateTime> {
    if s.is_empty() {
        return None;
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.naive_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .or_else(|| s.parse::<i64>().ok().and_then(from_epoch))
}

fn from_epoch(value: i64) -> Option<NaiveDateTime> {
    let magnitude = value.unsigned_abs();
    let utc = if magnitude >= 100_000_000_000_000 {
        DateTime::from_timestamp_micros(value)
    } else if magnitude >= 100_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    };
    utc.map(|t| t.naive_utc())
}

/// Text coercion: strings as-is, other scalars rendered
pub fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(map) if map.is_empty() => None,
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Label for a TLC payment type code
pub fn payment_type_label(code: Option<i64>) -> &'static str {
    match code {
        Some(1) => "Credit Card",
        Some(2) => "Cash",
        Some(3) => "No Charge",
        Some(4) => "Dispute",
        Some(5) => "Unknown",
        Some(6) => "Voided Trip",
        _ => "Other",
    }
}
