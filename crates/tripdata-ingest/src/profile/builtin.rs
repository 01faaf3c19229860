//! Built-in dataset profiles for the NYC TLC trip record files

use super::{
    ColumnMapping, ColumnSource, DatasetProfile, DestinationTable, OrderingKey, RowFilter,
    TieBreak, TransformKind,
};
use crate::framework::types::Service;

const MONEY: TransformKind = TransformKind::Decimal {
    precision: 12,
    scale: 2,
};
const DISTANCE: TransformKind = TransformKind::Decimal {
    precision: 12,
    scale: 3,
};

/// All profiles shipped with the binary
pub fn builtin_profiles() -> Vec<DatasetProfile> {
    vec![green_bronze(), green_silver(), yellow_silver()]
}

/// Look up a built-in profile by name
pub fn find_builtin(name: &str) -> Option<DatasetProfile> {
    builtin_profiles().into_iter().find(|p| p.name == name)
}

/// Typed copy of the raw green trip records, no quality filters
pub fn green_bronze() -> DatasetProfile {
    use TransformKind::{Integer, Text, Timestamp};

    DatasetProfile {
        name: "green-bronze".to_string(),
        version: 1,
        service: Service::Green,
        table: DestinationTable {
            name: "green_trips".to_string(),
            tag_column: "source_file".to_string(),
        },
        ordering: ordering("lpep_pickup_datetime"),
        columns: vec![
            ColumnMapping::field("vendorid", "VendorID", Integer),
            ColumnMapping::field("lpep_pickup_datetime", "lpep_pickup_datetime", Timestamp),
            ColumnMapping::field("lpep_dropoff_datetime", "lpep_dropoff_datetime", Timestamp),
            ColumnMapping::field("store_and_fwd_flag", "store_and_fwd_flag", Text),
            ColumnMapping::field("ratecodeid", "RatecodeID", Integer),
            ColumnMapping::field("pulocationid", "PULocationID", Integer),
            ColumnMapping::field("dolocationid", "DOLocationID", Integer),
            ColumnMapping::field("passenger_count", "passenger_count", Integer),
            ColumnMapping::field("trip_distance", "trip_distance", DISTANCE),
            ColumnMapping::field("fare_amount", "fare_amount", MONEY),
            ColumnMapping::field("extra", "extra", MONEY),
            ColumnMapping::field("mta_tax", "mta_tax", MONEY),
            ColumnMapping::field("tip_amount", "tip_amount", MONEY),
            ColumnMapping::field("tolls_amount", "tolls_amount", MONEY),
            ColumnMapping::field("ehail_fee", "ehail_fee", MONEY),
            ColumnMapping::field("improvement_surcharge", "improvement_surcharge", MONEY),
            ColumnMapping::field("total_amount", "total_amount", MONEY),
            ColumnMapping::field("payment_type", "payment_type", Integer),
            ColumnMapping::field("trip_type", "trip_type", Integer),
            ColumnMapping::field("congestion_surcharge", "congestion_surcharge", MONEY),
            ColumnMapping::field("cbd_congestion_fee", "cbd_congestion_fee", MONEY),
            ColumnMapping::derived("source_file", ColumnSource::SourceObject, Text),
        ],
        filters: vec![],
    }
}

/// Cleaned green trips in the unified silver table.
///
/// Green loads never applied the 24 hour duration cap; the filter set is
/// kept exactly as it has always run for this service.
pub fn green_silver() -> DatasetProfile {
    DatasetProfile {
        name: "green-silver".to_string(),
        version: 1,
        service: Service::Green,
        table: silver_table(),
        ordering: ordering("lpep_pickup_datetime"),
        columns: silver_columns("lpep", Some("ehail_fee"), None),
        filters: silver_filters("lpep", None),
    }
}

/// Cleaned yellow trips in the unified silver table, with the 24 hour cap
pub fn yellow_silver() -> DatasetProfile {
    DatasetProfile {
        name: "yellow-silver".to_string(),
        version: 1,
        service: Service::Yellow,
        table: silver_table(),
        ordering: ordering("tpep_pickup_datetime"),
        columns: silver_columns("tpep", None, Some("Airport_fee")),
        filters: silver_filters("tpep", Some(24)),
    }
}

fn ordering(field: &str) -> OrderingKey {
    OrderingKey {
        field: field.to_string(),
        tie_break: TieBreak::IngestOrdinal,
    }
}

fn silver_table() -> DestinationTable {
    DestinationTable {
        name: "taxi_trips_all".to_string(),
        tag_column: "source_file".to_string(),
    }
}

fn optional_field(column: &str, field: Option<&str>, transform: TransformKind) -> ColumnMapping {
    match field {
        Some(field) => ColumnMapping::field(column, field, transform),
        None => ColumnMapping::derived(column, ColumnSource::Null, transform),
    }
}

fn silver_columns(
    prefix: &str,
    ehail_fee: Option<&str>,
    airport_fee: Option<&str>,
) -> Vec<ColumnMapping> {
    use TransformKind::{Integer, PaymentTypeLabel, PositiveIntegerOrNull, Text, Timestamp};

    let pickup = format!("{}_pickup_datetime", prefix);
    let dropoff = format!("{}_dropoff_datetime", prefix);

    vec![
        ColumnMapping::field("vendor_id", "VendorID", Integer),
        ColumnMapping::field("pickup_datetime", &pickup, Timestamp),
        ColumnMapping::field("dropoff_datetime", &dropoff, Timestamp),
        ColumnMapping::field("passenger_count", "passenger_count", PositiveIntegerOrNull),
        ColumnMapping::field("trip_distance", "trip_distance", DISTANCE),
        ColumnMapping::field("ratecode_id", "RatecodeID", Integer),
        ColumnMapping::field("store_and_fwd_flag", "store_and_fwd_flag", Text),
        ColumnMapping::field("pulocation_id", "PULocationID", Integer),
        ColumnMapping::field("dolocation_id", "DOLocationID", Integer),
        ColumnMapping::field("payment_type_id", "payment_type", Integer),
        ColumnMapping::field("payment_type", "payment_type", PaymentTypeLabel),
        ColumnMapping::field("fare_amount", "fare_amount", MONEY),
        ColumnMapping::field("extra", "extra", MONEY),
        ColumnMapping::field("mta_tax", "mta_tax", MONEY),
        ColumnMapping::field("tip_amount", "tip_amount", MONEY),
        ColumnMapping::field("tolls_amount", "tolls_amount", MONEY),
        ColumnMapping::field("improvement_surcharge", "improvement_surcharge", MONEY),
        ColumnMapping::field("total_amount", "total_amount", MONEY),
        ColumnMapping::field("congestion_surcharge", "congestion_surcharge", MONEY),
        optional_field("airport_fee", airport_fee, MONEY),
        ColumnMapping::field("cbd_congestion_fee", "cbd_congestion_fee", MONEY),
        optional_field("ehail_fee", ehail_fee, MONEY),
        ColumnMapping::field("trip_type", "trip_type", Integer),
        ColumnMapping::derived("service_type", ColumnSource::Service, Text),
        ColumnMapping::derived("source_file", ColumnSource::SourceObject, Text),
        ColumnMapping::derived(
            "load_ts",
            ColumnSource::LoadTimestamp,
            TransformKind::TimestampTz,
        ),
    ]
}

fn silver_filters(prefix: &str, max_hours: Option<i64>) -> Vec<RowFilter> {
    let pickup = format!("{}_pickup_datetime", prefix);
    let dropoff = format!("{}_dropoff_datetime", prefix);

    let mut filters = vec![
        RowFilter::RequireTimestamp {
            field: pickup.clone(),
        },
        RowFilter::RequireTimestamp {
            field: dropoff.clone(),
        },
        RowFilter::NonNegative {
            field: "trip_distance".to_string(),
            precision: 12,
            scale: 3,
        },
        RowFilter::NonNegative {
            field: "total_amount".to_string(),
            precision: 12,
            scale: 2,
        },
    ];

    if let Some(hours) = max_hours {
        filters.push(RowFilter::MaxDurationHours {
            start: pickup,
            end: dropoff,
            hours,
        });
    }

    filters
}
