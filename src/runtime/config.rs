use crate::api::client::{has_entity_placeholder, is_valid_entity_id, ENTITY_PLACEHOLDER};
use crate::api::document::EntityId;
use crate::api::options::{DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::pipeline::backoff::BackoffPolicy;
use crate::pipeline::batch::FailurePolicy;
use anyhow::{bail, Context, Result};
use std::time::Duration;

/// Runtime configuration for one census query (which table, how to reach it,
/// and how to behave under rate limiting and partial failure).
///
/// All instances must be constructed via [`PipelineConfig::builder`] or
/// [`PipelineConfig::new`] so invariants are validated before any consumer
/// observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    url_template: String,
    auth_token: String,
    primary_variable: String,
    secondary_variable: String,
    failure_policy: FailurePolicy,
    backoff: BackoffPolicy,
    max_retries: usize,
    request_timeout: Duration,
}

pub struct PipelineConfigParams {
    pub url_template: String,
    pub auth_token: String,
    pub primary_variable: String,
    pub secondary_variable: String,
    pub failure_policy: FailurePolicy,
    pub backoff: BackoffPolicy,
    pub max_retries: usize,
    pub request_timeout: Duration,
}

impl PipelineConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: PipelineConfigParams) -> Result<Self> {
        let PipelineConfigParams {
            url_template,
            auth_token,
            primary_variable,
            secondary_variable,
            failure_policy,
            backoff,
            max_retries,
            request_timeout,
        } = params;

        let config = Self {
            url_template: trimmed_string(url_template),
            auth_token: trimmed_string(auth_token),
            primary_variable: trimmed_string(primary_variable),
            secondary_variable: trimmed_string(secondary_variable),
            failure_policy,
            backoff,
            max_retries,
            request_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    /// URL with an entity placeholder, e.g. `https://host/geo-CS1_6-TACTR_2/COM-{entity}.all.all`.
    pub fn url_template(&self) -> &str {
        &self.url_template
    }

    /// Bearer token sent with every request.
    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Variable whose modalities become pivot rows.
    pub fn primary_variable(&self) -> &str {
        &self.primary_variable
    }

    /// Variable whose modalities become pivot columns.
    pub fn secondary_variable(&self) -> &str {
        &self.secondary_variable
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Retries allowed for a rate-limited entity after its first request.
    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_url_template(&self.url_template)?;
        ensure_not_empty(&self.auth_token, "auth_token")?;
        ensure_not_empty(&self.primary_variable, "primary_variable")?;
        ensure_not_empty(&self.secondary_variable, "secondary_variable")?;

        if self.primary_variable == self.secondary_variable {
            bail!("primary_variable and secondary_variable must differ");
        }

        if self.max_retries == 0 {
            bail!("max_retries must be greater than 0");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        self.backoff.validate()
    }
}

#[derive(Debug, Default, Clone)]
pub struct PipelineConfigBuilder {
    url_template: Option<String>,
    auth_token: Option<String>,
    primary_variable: Option<String>,
    secondary_variable: Option<String>,
    failure_policy: Option<FailurePolicy>,
    backoff: Option<BackoffPolicy>,
    max_retries: Option<usize>,
    request_timeout: Option<Duration>,
}

impl PipelineConfigBuilder {
    pub fn url_template(mut self, template: impl Into<String>) -> Self {
        self.url_template = Some(template.into());
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn primary_variable(mut self, code: impl Into<String>) -> Self {
        self.primary_variable = Some(code.into());
        self
    }

    pub fn secondary_variable(mut self, code: impl Into<String>) -> Self {
        self.secondary_variable = Some(code.into());
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<PipelineConfig> {
        let params = PipelineConfigParams {
            url_template: self.url_template.context("url_template is required")?,
            auth_token: self.auth_token.context("auth_token is required")?,
            primary_variable: self
                .primary_variable
                .context("primary_variable is required")?,
            secondary_variable: self
                .secondary_variable
                .context("secondary_variable is required")?,
            failure_policy: self.failure_policy.unwrap_or_default(),
            backoff: self.backoff.unwrap_or_default(),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            request_timeout: self
                .request_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
        };

        PipelineConfig::new(params)
    }
}

/// Per-run input: which entities to query and which measures to pivot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    entity_ids: Vec<EntityId>,
    measures: Vec<String>,
}

impl Selection {
    pub fn new<E, M>(entity_ids: E, measures: M) -> Result<Self>
    where
        E: IntoIterator,
        E::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        let entity_ids: Vec<EntityId> = entity_ids
            .into_iter()
            .map(|entity| trimmed_string(entity.into()))
            .filter(|entity| !entity.is_empty())
            .collect();
        let measures: Vec<String> = measures
            .into_iter()
            .map(|measure| trimmed_string(measure.into()))
            .filter(|measure| !measure.is_empty())
            .collect();

        if measures.is_empty() {
            bail!("at least one measure code is required");
        }

        if let Some(entity) = entity_ids.iter().find(|entity| !is_valid_entity_id(entity)) {
            bail!("entity identifier {entity:?} may only contain ASCII letters, digits, '-' and '_'");
        }

        Ok(Self {
            entity_ids,
            measures,
        })
    }

    pub fn entity_ids(&self) -> &[EntityId] {
        &self.entity_ids
    }

    pub fn measures(&self) -> &[String] {
        &self.measures
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_url_template(template: &str) -> Result<()> {
    let template = template.trim();
    if !(template.starts_with("http://") || template.starts_with("https://")) {
        bail!("url_template must start with http:// or https://");
    }
    if !has_entity_placeholder(template) {
        bail!("url_template must contain the {ENTITY_PLACEHOLDER} placeholder");
    }
    Ok(())
}
