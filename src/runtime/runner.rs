use crate::api::client::{DocumentClient, HttpTransport, ReqwestTransport};
use crate::api::document::{EntityId, MergedDocument};
use crate::pipeline::batch::{fetch_all, BatchOutcome, EntityFailure};
use crate::pipeline::pivot::{pivot_measures, PivotTable};
use crate::runtime::config::{PipelineConfig, Selection};
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pivot tables produced by one run, one per requested measure.
#[derive(Debug, Clone)]
pub struct PivotReport {
    pub tables: Vec<PivotTable>,
    pub document: MergedDocument,
    pub fetched: Vec<EntityId>,
    pub skipped: Vec<EntityFailure>,
}

impl PivotReport {
    pub fn table(&self, measure: &str) -> Option<&PivotTable> {
        self.tables.iter().find(|table| table.measure() == measure)
    }
}

/// Result of a run that reached the data service.
///
/// `NoData` means no selected entity produced a document; a run that could
/// not retrieve data at all returns `Err` instead.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Tables(PivotReport),
    NoData { skipped: Vec<EntityFailure> },
}

/// Fetch, merge and pivot for one configured census table.
pub struct Pipeline {
    config: PipelineConfig,
    client: DocumentClient,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let client = DocumentClient::from_config(&config, transport)?;
        Ok(Self {
            config,
            client,
            telemetry: Arc::new(Telemetry::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Builds a pipeline over the `reqwest` transport.
    pub fn with_reqwest(config: PipelineConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config.request_timeout())?;
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn client(&self) -> &DocumentClient {
        &self.client
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Root token; cancelling it abandons every in-flight run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self, selection: &Selection) -> Result<PipelineOutcome> {
        let token = self.shutdown.child_token();
        self.run_with_cancellation(selection, &token).await
    }

    pub async fn run_with_cancellation(
        &self,
        selection: &Selection,
        cancellation: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        self.telemetry.record_run();
        tracing::info!(
            entities = selection.entity_ids().len(),
            measures = ?selection.measures(),
            primary = self.config.primary_variable(),
            secondary = self.config.secondary_variable(),
            "starting pipeline run"
        );

        let outcome = fetch_all(
            &self.client,
            selection.entity_ids(),
            self.config.failure_policy(),
            cancellation,
        )
        .await?;

        let outcome = match outcome {
            BatchOutcome::Empty { skipped } => {
                self.telemetry.record_entities_skipped(skipped.len() as u64);
                PipelineOutcome::NoData { skipped }
            }
            BatchOutcome::Merged(batch) => {
                self.telemetry
                    .record_documents_fetched(batch.fetched.len() as u64);
                self.telemetry
                    .record_entities_skipped(batch.skipped.len() as u64);
                self.telemetry
                    .record_rate_limit_retries(batch.rate_limit_retries as u64);
                self.telemetry
                    .record_malformed_cells(batch.malformed_cells as u64);

                let tables = pivot_measures(
                    &batch.document,
                    self.config.primary_variable(),
                    self.config.secondary_variable(),
                    selection.measures(),
                );
                let skipped_cells: usize = tables.iter().map(PivotTable::skipped_cells).sum();
                self.telemetry.record_skipped_pivot_cells(skipped_cells as u64);

                PipelineOutcome::Tables(PivotReport {
                    tables,
                    document: batch.document,
                    fetched: batch.fetched,
                    skipped: batch.skipped,
                })
            }
        };

        self.telemetry.log_snapshot();
        Ok(outcome)
    }

    /// Runs once, abandoning the run on Ctrl-C (SIGINT).
    pub async fn run_until_ctrl_c(&self, selection: &Selection) -> Result<PipelineOutcome> {
        let token = self.shutdown.child_token();
        let watcher = token.clone();
        let signal_task = tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        tracing::info!("Ctrl-C received; abandoning run");
                        watcher.cancel();
                    }
                }
                _ = watcher.cancelled() => {}
            }
        });

        let result = self.run_with_cancellation(selection, &token).await;
        token.cancel();
        if let Err(err) = signal_task.await {
            tracing::warn!(error = %err, "signal watcher task panicked");
        }
        result
    }
}
