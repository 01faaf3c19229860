//! Postgres implementations of the pipeline's collaborators

pub mod ledger;
pub mod staging;
pub mod warehouse;

pub use ledger::PgLineageLedger;
pub use staging::{stage_jsonl, JsonlRecords, PgStagedDataset, PgStagingArea, StageReport};
pub use warehouse::PgWarehouse;

/// Quote an identifier for interpolation into SQL.
///
/// Profile validation restricts table and column names to lowercase
/// identifiers; quoting keeps reserved words such as `extra` usable.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("taxi_trips_all"), "\"taxi_trips_all\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
