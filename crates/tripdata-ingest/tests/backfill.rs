//! Backfills over month ranges

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::*;
use tripdata_common::YearMonth;
use tripdata_ingest::framework::{
    partitions_between, BackfillDriver, LoadStatus, PartitionStatus, Service,
};
use tripdata_ingest::profile::find_builtin;
use tripdata_ingest::ErrorKind;

#[tokio::test]
async fn test_missing_month_does_not_stop_backfill() {
    let h = Harness::standard();
    h.staging.stage(&green(2024, 1), green_trips(12));

    let partitions = partitions_between(
        Service::Green,
        YearMonth::new(2023, 12).unwrap(),
        YearMonth::new(2024, 1).unwrap(),
    );
    let report = BackfillDriver::new(h.orchestrator.clone(), find_builtin("green-bronze").unwrap())
        .run(partitions)
        .await;

    let statuses: Vec<PartitionStatus> = report.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(statuses, vec![PartitionStatus::Missing, PartitionStatus::Ok]);
    assert_eq!(report.count(PartitionStatus::Missing), 1);
    assert_eq!(report.rows_inserted(), 12);
    assert!(report.operational_failures().is_empty());

    let statuses: Vec<LoadStatus> = h.ledger.records().iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![LoadStatus::Missing, LoadStatus::Ok, LoadStatus::Ok]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_backfill_keeps_input_order() {
    let h = Harness::standard();
    let sizes = [7u32, 0, 23, 10];
    for (i, size) in sizes.iter().enumerate() {
        h.staging.stage(&green(2024, i as u32 + 1), green_trips(*size));
    }
    // March fails for good after its first chunk
    h.warehouse.fail_commits(2, 3, transient);

    let partitions = partitions_between(
        Service::Green,
        YearMonth::new(2024, 1).unwrap(),
        YearMonth::new(2024, 5).unwrap(),
    );
    let report = BackfillDriver::new(h.orchestrator.clone(), find_builtin("green-bronze").unwrap())
        .with_concurrency(3)
        .run(partitions)
        .await;

    let months: Vec<String> = report
        .outcomes
        .iter()
        .map(|o| o.partition.month.to_string())
        .collect();
    assert_eq!(months, vec!["2024-01", "2024-02", "2024-03", "2024-04", "2024-05"]);

    let statuses: Vec<PartitionStatus> = report.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![
            PartitionStatus::Ok,
            PartitionStatus::Ok,
            PartitionStatus::Failed,
            PartitionStatus::Ok,
            PartitionStatus::Missing,
        ]
    );
    assert_eq!(
        report.outcomes[2].error.as_ref().unwrap().kind,
        ErrorKind::TransientLoad
    );
    assert_eq!(report.rows_inserted(), 7 + 10 + 10);
    assert_eq!(h.staging.opened(), h.staging.released());
}

#[tokio::test]
async fn test_report_serializes_outcomes() {
    let h = Harness::standard();
    h.staging.stage(&green(2024, 1), green_trips(3));

    let report = BackfillDriver::new(h.orchestrator.clone(), find_builtin("green-silver").unwrap())
        .run(vec![green(2024, 1), green(2024, 2)])
        .await;

    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["profile"], "green-silver");
    assert_eq!(value["outcomes"][0]["status"], "OK");
    assert_eq!(value["outcomes"][0]["rows_inserted"], 3);
    assert_eq!(value["outcomes"][1]["status"], "MISSING");
    assert_eq!(value["outcomes"][1]["error"]["kind"], "source_missing");
}
