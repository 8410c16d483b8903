use std::time::Duration;

use crate::support::{
    helpers::{census_document, config_for, init_tracing, MEASURE},
    mock_api::{MockCensus, MockCensusServer, Reply},
};
use anyhow::{bail, Result};
use censustab::{
    reorder_rows, FailurePolicy, FetchError, Pipeline, PipelineOutcome, PivotReport, Selection,
};
use serde_json::json;

fn expect_tables(outcome: PipelineOutcome) -> Result<PivotReport> {
    match outcome {
        PipelineOutcome::Tables(report) => Ok(report),
        PipelineOutcome::NoData { skipped } => {
            bail!("expected tables, got no data (skipped: {skipped:?})")
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn best_effort_merges_and_skips_failed_entity() -> Result<()> {
    init_tracing();
    let census = MockCensus::new();
    census
        .serve(
            "75056",
            census_document(&[("1", "11", 100.0), ("ENS", "11", 100.0)]),
        )
        .serve(
            "13055",
            census_document(&[("1", "11", 50.0), ("2", "12", 7.0), ("ENS", "11", 57.0)]),
        )
        .script("69123", vec![Reply::Status(500)]);
    let server = MockCensusServer::start(census.clone()).await?;

    let pipeline = Pipeline::with_reqwest(config_for(server.url(), FailurePolicy::BestEffort)?)?;
    let selection = Selection::new(["75056", "13055", "69123"], [MEASURE])?;
    let report = expect_tables(pipeline.run(&selection).await?)?;

    assert_eq!(report.fetched, vec!["75056".to_string(), "13055".to_string()]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].entity, "69123");
    assert!(report.skipped[0].reason.contains("500"));

    let table = report.table(MEASURE).expect("POP table");
    assert_eq!(table.value("1", "11"), Some(150.0));
    assert_eq!(table.value("2", "12"), Some(7.0));
    assert_eq!(table.value("ENS", "11"), Some(157.0));
    assert_eq!(table.value("2", "11"), None);
    assert_eq!(table.columns(), vec!["11", "12", "ENS"]);
    assert_eq!(table.primary_label("1"), "Agriculteurs");

    let snapshot = pipeline.telemetry().snapshot();
    assert_eq!(snapshot.documents_fetched, 2);
    assert_eq!(snapshot.entities_skipped, 1);
    assert_eq!(census.requests_for("69123"), 1, "HTTP 500 must not be retried");

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fail_fast_aborts_when_any_entity_fails() -> Result<()> {
    init_tracing();
    let census = MockCensus::new();
    census
        .serve("75056", census_document(&[("1", "11", 100.0)]))
        .script("69123", vec![Reply::Status(503)]);
    let server = MockCensusServer::start(census).await?;

    let pipeline = Pipeline::with_reqwest(config_for(server.url(), FailurePolicy::FailFast)?)?;
    let selection = Selection::new(["75056", "69123"], [MEASURE])?;
    let err = pipeline.run(&selection).await.unwrap_err();

    match err.downcast_ref::<FetchError>() {
        Some(FetchError::Status { entity, status }) => {
            assert_eq!(entity, "69123");
            assert_eq!(*status, 503);
        }
        other => panic!("expected status error, got {other:?} ({err:#})"),
    }

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limited_entity_recovers_after_backoff() -> Result<()> {
    init_tracing();
    let census = MockCensus::new();
    census.rate_limit_then_serve("75056", 2, census_document(&[("1", "11", 42.0)]));
    let server = MockCensusServer::start(census.clone()).await?;

    let pipeline = Pipeline::with_reqwest(config_for(server.url(), FailurePolicy::FailFast)?)?;
    let selection = Selection::new(["75056"], [MEASURE])?;
    let report = expect_tables(pipeline.run(&selection).await?)?;

    let table = report.table(MEASURE).expect("POP table");
    assert_eq!(table.value("1", "11"), Some(42.0));
    assert_eq!(census.requests_for("75056"), 3);
    assert_eq!(pipeline.telemetry().snapshot().rate_limit_retries, 2);

    let metrics = pipeline.client().metrics();
    assert_eq!(metrics.total_requests, 3);
    assert_eq!(metrics.rate_limited, 2);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistent_rate_limit_exhausts_retries() -> Result<()> {
    init_tracing();
    let census = MockCensus::new();
    census.script("75056", vec![Reply::Status(429)]);
    let server = MockCensusServer::start(census.clone()).await?;

    let pipeline = Pipeline::with_reqwest(config_for(server.url(), FailurePolicy::BestEffort)?)?;
    let selection = Selection::new(["75056"], [MEASURE])?;

    match pipeline.run(&selection).await? {
        PipelineOutcome::NoData { skipped } => {
            assert_eq!(skipped.len(), 1);
            assert!(skipped[0].reason.contains("rate limited"));
        }
        PipelineOutcome::Tables(report) => panic!("expected no data, got {report:?}"),
    }
    assert_eq!(census.requests_for("75056"), 6, "one request plus five retries");

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreadable_body_is_skipped_under_best_effort() -> Result<()> {
    init_tracing();
    let census = MockCensus::new();
    census
        .serve("75056", census_document(&[("1", "11", 10.0)]))
        .script("13055", vec![Reply::Body("<html>maintenance</html>".into())]);
    let server = MockCensusServer::start(census).await?;

    let pipeline = Pipeline::with_reqwest(config_for(server.url(), FailurePolicy::BestEffort)?)?;
    let selection = Selection::new(["75056", "13055"], [MEASURE])?;
    let report = expect_tables(pipeline.run(&selection).await?)?;

    assert_eq!(report.fetched, vec!["75056".to_string()]);
    assert_eq!(report.skipped[0].entity, "13055");

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_selection_yields_no_data_without_requests() -> Result<()> {
    init_tracing();
    let census = MockCensus::new();
    let server = MockCensusServer::start(census.clone()).await?;

    let pipeline = Pipeline::with_reqwest(config_for(server.url(), FailurePolicy::BestEffort)?)?;
    let selection = Selection::new(Vec::<String>::new(), [MEASURE])?;

    match pipeline.run(&selection).await? {
        PipelineOutcome::NoData { skipped } => assert!(skipped.is_empty()),
        PipelineOutcome::Tables(report) => panic!("expected no data, got {report:?}"),
    }
    assert_eq!(census.total_requests(), 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn merge_follows_selection_order_not_arrival_order() -> Result<()> {
    init_tracing();
    let census = MockCensus::new();
    census
        .script(
            "75056",
            vec![Reply::Delayed(
                Duration::from_millis(200),
                Box::new(Reply::Document(census_document(&[("2", "12", 5.0)]))),
            )],
        )
        .serve("13055", census_document(&[("1", "11", 3.0)]));
    let server = MockCensusServer::start(census).await?;

    let pipeline = Pipeline::with_reqwest(config_for(server.url(), FailurePolicy::FailFast)?)?;
    let selection = Selection::new(["75056", "13055"], [MEASURE])?;
    let report = expect_tables(pipeline.run(&selection).await?)?;

    assert_eq!(report.fetched, vec!["75056".to_string(), "13055".to_string()]);
    let table = report.table(MEASURE).expect("POP table");
    assert_eq!(table.categories(), &["2".to_string(), "1".to_string()]);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn total_row_moves_to_the_top_and_other_measures_stay_empty() -> Result<()> {
    init_tracing();
    let census = MockCensus::new();
    census.serve(
        "75056",
        census_document(&[
            ("1", "11", 1_200.4),
            ("2", "11", 300.2),
            ("ENS", "11", 1_500.6),
        ]),
    );
    let server = MockCensusServer::start(census).await?;

    let pipeline = Pipeline::with_reqwest(config_for(server.url(), FailurePolicy::BestEffort)?)?;
    let selection = Selection::new(["75056"], [MEASURE, "NBLOG"])?;
    let report = expect_tables(pipeline.run(&selection).await?)?;

    assert_eq!(report.tables.len(), 2);
    assert!(report.table("NBLOG").expect("NBLOG table").is_empty());

    let mut rows = report.table(MEASURE).expect("POP table").rows();
    reorder_rows(&mut rows);
    let order: Vec<&str> = rows.iter().map(|row| row.code.as_str()).collect();
    assert_eq!(order, vec!["ENS", "1", "2"]);
    assert_eq!(rows[0].value("11"), Some(1_501));
    assert_eq!(rows[1].value("11"), Some(1_200));
    assert_eq!(rows[1].value("12"), Some(0));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_entries_do_not_abort_a_fail_fast_batch() -> Result<()> {
    init_tracing();
    let mut damaged = census_document(&[("1", "11", 30.0)]);
    if let Some(cells) = damaged["Cellule"].as_array_mut() {
        cells.push(json!({ "Mesure": "POP", "Modalite": [{ "@code": "2" }], "Valeur": "9" }));
        cells.push(json!({ "Mesure": { "@code": "POP" }, "Modalite": [{ "@variable": "CS1_6" }], "Valeur": "9" }));
    }
    if let Some(variables) = damaged["Variable"].as_array_mut() {
        variables.push(json!({ "Libelle": "definition without a code" }));
    }

    let census = MockCensus::new();
    census
        .serve("75056", damaged)
        .serve("13055", census_document(&[("1", "11", 12.0)]));
    let server = MockCensusServer::start(census).await?;

    let pipeline = Pipeline::with_reqwest(config_for(server.url(), FailurePolicy::FailFast)?)?;
    let selection = Selection::new(["75056", "13055"], [MEASURE])?;
    let report = expect_tables(pipeline.run(&selection).await?)?;

    assert_eq!(report.fetched, vec!["75056".to_string(), "13055".to_string()]);
    let table = report.table(MEASURE).expect("POP table");
    assert_eq!(table.value("1", "11"), Some(42.0));
    assert_eq!(table.primary_label("1"), "Agriculteurs");
    assert_eq!(pipeline.telemetry().snapshot().malformed_cells, 2);

    server.shutdown().await;
    Ok(())
}
