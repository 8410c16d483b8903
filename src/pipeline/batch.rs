//! Batch orchestration: one concurrent fetch per entity, a failure policy
//! deciding what a terminal per-entity failure does to the batch, and the
//! merge of whatever was fetched.

use crate::api::client::{DocumentClient, FetchError, FetchedDocument};
use crate::api::document::{EntityId, MergedDocument};
use crate::pipeline::merge::merge;
use anyhow::Result;
use futures::future::{join_all, try_join_all};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// What a terminal failure of one entity does to the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Any failure aborts the batch; no document is produced.
    FailFast,
    /// Failed entities are logged and left out of the merge.
    #[default]
    BestEffort,
}

impl std::str::FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "fail-fast" | "failfast" => Ok(FailurePolicy::FailFast),
            "best-effort" | "besteffort" => Ok(FailurePolicy::BestEffort),
            other => anyhow::bail!("unknown failure policy {other:?}; expected fail-fast or best-effort"),
        }
    }
}

/// An entity left out of a best-effort batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFailure {
    pub entity: EntityId,
    pub reason: String,
}

/// Result of a batch in which at least one entity produced a document.
#[derive(Debug, Clone)]
pub struct MergedBatch {
    pub document: MergedDocument,
    /// Entities merged, in request order.
    pub fetched: Vec<EntityId>,
    pub skipped: Vec<EntityFailure>,
    pub malformed_cells: usize,
    /// Requests answered with 429 across all merged entities.
    pub rate_limit_retries: usize,
}

#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Merged(MergedBatch),
    /// No entity produced a document. Distinct from a failed batch.
    Empty { skipped: Vec<EntityFailure> },
}

impl BatchOutcome {
    pub fn document(&self) -> Option<&MergedDocument> {
        match self {
            BatchOutcome::Merged(batch) => Some(&batch.document),
            BatchOutcome::Empty { .. } => None,
        }
    }

    pub fn skipped(&self) -> &[EntityFailure] {
        match self {
            BatchOutcome::Merged(batch) => &batch.skipped,
            BatchOutcome::Empty { skipped } => skipped,
        }
    }
}

/// Fetches every entity concurrently and merges the documents in
/// `entity_ids` order, whatever order the responses arrive in.
///
/// Repeated identifiers are fetched once. Cancelling `cancellation` stops
/// in-flight fetches and yields [`FetchError::Cancelled`]; no partial
/// document is returned.
pub async fn fetch_all(
    client: &DocumentClient,
    entity_ids: &[EntityId],
    policy: FailurePolicy,
    cancellation: &CancellationToken,
) -> Result<BatchOutcome> {
    let entities = unique_entities(entity_ids);
    if entities.is_empty() {
        tracing::info!("no entities selected; nothing to fetch");
        return Ok(BatchOutcome::Empty {
            skipped: Vec::new(),
        });
    }

    let batch_token = cancellation.child_token();
    tracing::debug!(entities = entities.len(), policy = ?policy, "dispatching batch");

    let fetches = entities
        .iter()
        .map(|entity| client.fetch(entity, &batch_token));

    let (documents, skipped) = match policy {
        FailurePolicy::FailFast => match try_join_all(fetches).await {
            Ok(documents) => (documents, Vec::new()),
            Err(err) => {
                batch_token.cancel();
                tracing::error!(error = %err, "entity failed; aborting fail-fast batch");
                return Err(err);
            }
        },
        FailurePolicy::BestEffort => {
            let results = join_all(fetches).await;
            if cancellation.is_cancelled() {
                return Err(FetchError::Cancelled.into());
            }
            collect_best_effort(&entities, results)?
        }
    };

    if documents.is_empty() {
        tracing::warn!(skipped = skipped.len(), "no entity produced data");
        return Ok(BatchOutcome::Empty { skipped });
    }

    let malformed_cells = documents.iter().map(|fetched| fetched.malformed_cells).sum();
    let rate_limit_retries = documents
        .iter()
        .map(|fetched| fetched.attempts.saturating_sub(1))
        .sum();
    let document = merge(documents.iter().map(|fetched| &fetched.document));
    let fetched: Vec<EntityId> = documents.into_iter().map(|fetched| fetched.entity).collect();

    tracing::info!(
        fetched = fetched.len(),
        skipped = skipped.len(),
        cells = document.cells.len(),
        "batch merged"
    );

    Ok(BatchOutcome::Merged(MergedBatch {
        document,
        fetched,
        skipped,
        malformed_cells,
        rate_limit_retries,
    }))
}

fn collect_best_effort(
    entities: &[&EntityId],
    results: Vec<Result<FetchedDocument>>,
) -> Result<(Vec<FetchedDocument>, Vec<EntityFailure>)> {
    let mut documents = Vec::with_capacity(results.len());
    let mut skipped = Vec::new();

    for (entity, result) in entities.iter().zip(results) {
        match result {
            Ok(fetched) => documents.push(fetched),
            Err(err) => {
                if matches!(err.downcast_ref::<FetchError>(), Some(FetchError::Cancelled)) {
                    return Err(err);
                }
                tracing::warn!(entity = %entity, error = %err, "skipping entity in best-effort batch");
                skipped.push(EntityFailure {
                    entity: (*entity).clone(),
                    reason: format!("{err:#}"),
                });
            }
        }
    }

    Ok((documents, skipped))
}

fn unique_entities(entity_ids: &[EntityId]) -> Vec<&EntityId> {
    let mut seen = HashSet::new();
    entity_ids
        .iter()
        .filter(|entity| seen.insert(entity.as_str()))
        .collect()
}
