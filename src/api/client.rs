//! HTTP transport abstraction and the retrying document client that fetches
//! one census document per entity.

use crate::api::auth::bearer_header;
use crate::api::document::{parse_document, EntityId, RawDocument};
use crate::api::metrics::{RequestMetrics, RequestMetricsSnapshot};
use crate::api::options::ClientOptions;
use crate::api::retry::{FetchEvent, FetchState, RetryContext};
use crate::pipeline::backoff::sleep_with_cancellation;
use crate::runtime::config::PipelineConfig;
use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Placeholder replaced by the entity identifier in URL templates.
pub const ENTITY_PLACEHOLDER: &str = "{entity}";
/// Older spelling of [`ENTITY_PLACEHOLDER`], still accepted.
pub const COMMUNE_PLACEHOLDER: &str = "{communeCode}";

const HTTP_TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug)]
pub enum FetchError {
    /// The request never produced a response.
    Transport { entity: EntityId, message: String },
    /// Non-success status other than 429. Not retried.
    Status { entity: EntityId, status: u16 },
    Timeout { entity: EntityId },
    /// HTTP 429 for a single attempt. Retried by the client.
    RateLimited { entity: EntityId },
    RetriesExhausted { entity: EntityId, attempts: usize },
    InvalidBody { entity: EntityId, message: String },
    /// The identifier cannot be placed in a URL path segment as-is.
    InvalidEntity { entity: EntityId },
    Cancelled,
}

impl FetchError {
    pub fn entity(&self) -> Option<&str> {
        match self {
            FetchError::Transport { entity, .. }
            | FetchError::Status { entity, .. }
            | FetchError::Timeout { entity }
            | FetchError::RateLimited { entity }
            | FetchError::RetriesExhausted { entity, .. }
            | FetchError::InvalidBody { entity, .. }
            | FetchError::InvalidEntity { entity } => Some(entity),
            FetchError::Cancelled => None,
        }
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Transport { entity, message } => {
                write!(f, "request for entity {entity} failed: {message}")
            }
            FetchError::Status { entity, status } => {
                write!(f, "request for entity {entity} returned HTTP {status}")
            }
            FetchError::Timeout { entity } => write!(f, "request for entity {entity} timed out"),
            FetchError::RateLimited { entity } => {
                write!(f, "request for entity {entity} was rate limited")
            }
            FetchError::RetriesExhausted { entity, attempts } => write!(
                f,
                "entity {entity} still rate limited after {attempts} attempts"
            ),
            FetchError::InvalidBody { entity, message } => {
                write!(f, "entity {entity} returned an unreadable document: {message}")
            }
            FetchError::InvalidEntity { entity } => {
                write!(f, "entity identifier {entity:?} is not a plain code")
            }
            FetchError::Cancelled => write!(f, "fetch cancelled"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Raw HTTP answer handed back by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Minimal capability the client needs from an HTTP stack.
///
/// `Err` means no response was received at all.
pub trait HttpTransport: Send + Sync {
    fn get<'a>(&'a self, url: &'a str, auth_token: &'a str) -> BoxFuture<'a, Result<HttpResponse>>;
}

/// [`HttpTransport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get<'a>(&'a self, url: &'a str, auth_token: &'a str) -> BoxFuture<'a, Result<HttpResponse>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .header(AUTHORIZATION, bearer_header(auth_token)?)
                .header(ACCEPT, "application/json")
                .send()
                .await
                .with_context(|| format!("GET {url} failed"))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .with_context(|| format!("failed to read body from {url}"))?;
            Ok(HttpResponse { status, body })
        })
    }
}

/// A document together with how it was obtained.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub entity: EntityId,
    pub document: RawDocument,
    pub malformed_cells: usize,
    /// Requests issued, including rate-limited ones.
    pub attempts: usize,
}

/// Fetches census documents one entity at a time, retrying rate-limited requests.
#[derive(Clone)]
pub struct DocumentClient {
    transport: Arc<dyn HttpTransport>,
    url_template: Arc<String>,
    auth_token: Arc<String>,
    options: ClientOptions,
    metrics: Arc<RequestMetrics>,
}

impl std::fmt::Debug for DocumentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentClient")
            .field("url_template", &self.url_template)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl DocumentClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        url_template: impl Into<String>,
        auth_token: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self> {
        options.validate()?;

        let url_template = url_template.into();
        if !has_entity_placeholder(&url_template) {
            bail!("url_template must contain the {ENTITY_PLACEHOLDER} placeholder");
        }

        Ok(Self {
            transport,
            url_template: Arc::new(url_template),
            auth_token: Arc::new(auth_token.into()),
            options,
            metrics: Arc::new(RequestMetrics::default()),
        })
    }

    pub fn from_config(config: &PipelineConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        config.validate()?;
        let options = ClientOptions {
            request_timeout: config.request_timeout(),
            max_retries: config.max_retries(),
            backoff: config.backoff(),
        };
        Self::new(
            transport,
            config.url_template().to_owned(),
            config.auth_token().to_owned(),
            options,
        )
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn metrics(&self) -> RequestMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn url_for(&self, entity: &str) -> String {
        self.url_template
            .replace(ENTITY_PLACEHOLDER, entity)
            .replace(COMMUNE_PLACEHOLDER, entity)
    }

    /// Fetches the document for `entity`.
    ///
    /// HTTP 429 answers are retried up to `max_retries` times using the
    /// configured backoff; every other failure is terminal on first sight.
    /// Errors downcast to [`FetchError`].
    pub async fn fetch(
        &self,
        entity: &str,
        cancellation: &CancellationToken,
    ) -> Result<FetchedDocument> {
        if !is_valid_entity_id(entity) {
            return Err(FetchError::InvalidEntity {
                entity: entity.to_owned(),
            }
            .into());
        }

        let url = self.url_for(entity);
        let context = RetryContext::new(entity);
        let advance = |state: FetchState, event: FetchEvent| {
            let next = state.on(event);
            context.log_transition(state, next);
            next
        };

        let mut state = advance(FetchState::Pending, FetchEvent::Dispatch);
        let mut attempt = 0usize;
        let mut retries = 0usize;
        let mut delay = Duration::ZERO;

        loop {
            match state {
                FetchState::Requesting => {
                    attempt += 1;
                    let started = Instant::now();
                    match self.request_once(entity, &url, cancellation).await {
                        Ok(parsed) => {
                            self.metrics.record_success(started.elapsed());
                            advance(state, FetchEvent::Success);
                            context.log_completed(
                                attempt,
                                parsed.document.cells.len(),
                                parsed.malformed_cells,
                            );
                            return Ok(FetchedDocument {
                                entity: entity.to_owned(),
                                document: parsed.document,
                                malformed_cells: parsed.malformed_cells,
                                attempts: attempt,
                            });
                        }
                        Err(err) if is_rate_limited(&err) => {
                            self.metrics.record_rate_limited(started.elapsed());
                            if retries >= self.options.max_retries {
                                advance(state, FetchEvent::RetriesExhausted);
                                context.log_exhausted(attempt);
                                return Err(FetchError::RetriesExhausted {
                                    entity: entity.to_owned(),
                                    attempts: attempt,
                                }
                                .into());
                            }
                            retries += 1;
                            delay = self.options.backoff.delay_for(retries);
                            context.log_rate_limited(
                                attempt,
                                self.options.max_retries - retries,
                                delay,
                            );
                            state = advance(state, FetchEvent::RateLimited);
                        }
                        Err(err) => {
                            if is_cancelled(&err) {
                                advance(state, FetchEvent::Cancelled);
                            } else {
                                self.metrics.record_failure(started.elapsed());
                                advance(state, FetchEvent::OtherError);
                                context.log_failure(attempt, &err);
                            }
                            return Err(err);
                        }
                    }
                }
                FetchState::Backoff => {
                    if let Err(err) = sleep_with_cancellation(delay, cancellation).await {
                        advance(state, FetchEvent::Cancelled);
                        return Err(err);
                    }
                    state = advance(state, FetchEvent::BackoffElapsed);
                }
                FetchState::Pending | FetchState::Done | FetchState::Failed => {
                    return Err(anyhow!(
                        "fetch for entity {entity} stalled in state {state:?}"
                    ));
                }
            }
        }
    }

    async fn request_once(
        &self,
        entity: &str,
        url: &str,
        cancellation: &CancellationToken,
    ) -> Result<crate::api::document::ParsedDocument> {
        let request = timeout(
            self.options.request_timeout,
            self.transport.get(url, &self.auth_token),
        );

        let response = tokio::select! {
            _ = cancellation.cancelled() => return Err(FetchError::Cancelled.into()),
            result = request => result
                .map_err(|_| FetchError::Timeout { entity: entity.to_owned() })?
                .map_err(|err| FetchError::Transport {
                    entity: entity.to_owned(),
                    message: format!("{err:#}"),
                })?,
        };

        match response.status {
            HTTP_TOO_MANY_REQUESTS => Err(FetchError::RateLimited {
                entity: entity.to_owned(),
            }
            .into()),
            200..=299 => parse_document(&response.body).map_err(|err| {
                FetchError::InvalidBody {
                    entity: entity.to_owned(),
                    message: format!("{err:#}"),
                }
                .into()
            }),
            status => Err(FetchError::Status {
                entity: entity.to_owned(),
                status,
            }
            .into()),
        }
    }
}

/// Entity codes are substituted verbatim into the URL path, so only ASCII
/// letters, digits, `-` and `_` are accepted.
pub fn is_valid_entity_id(entity: &str) -> bool {
    !entity.is_empty()
        && entity
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

pub(crate) fn has_entity_placeholder(template: &str) -> bool {
    template.contains(ENTITY_PLACEHOLDER) || template.contains(COMMUNE_PLACEHOLDER)
}

fn is_rate_limited(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<FetchError>(),
        Some(FetchError::RateLimited { .. })
    )
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<FetchError>(), Some(FetchError::Cancelled))
}
