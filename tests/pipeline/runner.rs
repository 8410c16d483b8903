use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{census_document, config_for, init_tracing, MEASURE},
    mock_api::{MockCensus, MockCensusServer, Reply},
};
use anyhow::{Context, Result};
use censustab::{
    FailurePolicy, FetchError, HttpResponse, HttpTransport, Pipeline, PipelineOutcome, Selection,
};
use futures::future::BoxFuture;
use tokio::time::{sleep, timeout};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_the_pipeline_abandons_in_flight_fetches() -> Result<()> {
    init_tracing();
    let census = MockCensus::new();
    census.script(
        "75056",
        vec![Reply::Delayed(
            Duration::from_secs(30),
            Box::new(Reply::Document(census_document(&[("1", "11", 1.0)]))),
        )],
    );
    let server = MockCensusServer::start(census).await?;

    let pipeline = Arc::new(Pipeline::with_reqwest(config_for(
        server.url(),
        FailurePolicy::BestEffort,
    )?)?);
    let token = pipeline.cancellation_token();
    let selection = Selection::new(["75056"], [MEASURE])?;

    let run = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(&selection).await })
    };

    sleep(Duration::from_millis(100)).await;
    token.cancel();

    let result = timeout(Duration::from_secs(5), run)
        .await
        .context("cancelled run did not finish")?
        .context("run task panicked")?;
    let err = result.unwrap_err();
    assert!(
        matches!(err.downcast_ref::<FetchError>(), Some(FetchError::Cancelled)),
        "expected cancellation, got {err:#}"
    );

    // The delayed handler is still sleeping; skip the graceful wait.
    drop(server);
    Ok(())
}

/// Serves the same document for every URL and counts calls.
struct StaticTransport {
    body: String,
    calls: AtomicUsize,
}

impl HttpTransport for StaticTransport {
    fn get<'a>(&'a self, url: &'a str, auth_token: &'a str) -> BoxFuture<'a, Result<HttpResponse>> {
        Box::pin(async move {
            assert!(url.starts_with("http://census.test/COM-"));
            assert_eq!(auth_token, crate::support::helpers::TOKEN);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse {
                status: 200,
                body: self.body.clone(),
            })
        })
    }
}

#[tokio::test]
async fn pipeline_runs_over_a_custom_transport_and_accumulates_telemetry() -> Result<()> {
    init_tracing();
    let transport = Arc::new(StaticTransport {
        body: census_document(&[("1", "11", 10.0), ("2", "12", 4.0)]).to_string(),
        calls: AtomicUsize::new(0),
    });
    let config = config_for("http://census.test", FailurePolicy::FailFast)?;
    let pipeline = Pipeline::new(config, transport.clone())?;

    let selection = Selection::new(["75056", "13055", "75056"], [MEASURE])?;
    for _ in 0..2 {
        match pipeline.run(&selection).await? {
            PipelineOutcome::Tables(report) => {
                let table = report.table(MEASURE).context("POP table")?;
                assert_eq!(table.value("1", "11"), Some(20.0));
                assert_eq!(table.value("2", "12"), Some(8.0));
            }
            PipelineOutcome::NoData { skipped } => panic!("unexpected no data: {skipped:?}"),
        }
    }

    assert_eq!(transport.calls.load(Ordering::SeqCst), 4, "duplicates fetched once per run");
    let snapshot = pipeline.telemetry().snapshot();
    assert_eq!(snapshot.runs, 2);
    assert_eq!(snapshot.documents_fetched, 4);
    assert_eq!(snapshot.entities_skipped, 0);
    Ok(())
}
