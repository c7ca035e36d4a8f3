//! Legal service client and tag status claim validation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use metastore_core::context::{CORRELATION_ID, DATA_PARTITION_ID, USER};
use metastore_core::{
    defaults, Error, InvalidTag, LegalCompliance, LegalService, LegalTagChangedCollection,
    RequestContext, Result,
};

/// Connection settings for [`HttpLegalService`].
#[derive(Debug, Clone)]
pub struct LegalConfig {
    /// Base URL, e.g. `http://legal/api/legal/v1`.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Tag names per validation request.
    pub chunk_size: usize,
}

impl Default for LegalConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::LEGAL_SERVICE_URL.to_string(),
            timeout_secs: defaults::LEGAL_TIMEOUT_SECS,
            chunk_size: defaults::LEGAL_VALIDATE_CHUNK_SIZE,
        }
    }
}

impl LegalConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LEGAL_SERVICE_URL` | `http://localhost:8080/api/legal/v1` | Legal service base URL |
    /// | `LEGAL_TIMEOUT_SECS` | `30` | Request timeout |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("LEGAL_SERVICE_URL") {
            config.base_url = url;
        }
        if let Some(secs) = std::env::var("LEGAL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.timeout_secs = secs;
        }
        config
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    names: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateResponse {
    #[serde(default)]
    invalid_legal_tags: Vec<InvalidTag>,
}

/// Legal service reached over HTTP.
pub struct HttpLegalService {
    client: Client,
    config: LegalConfig,
}

impl HttpLegalService {
    pub fn new(config: LegalConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build legal client: {}", e)))?;
        Ok(Self { client, config })
    }

    async fn validate_chunk(&self, ctx: &RequestContext, names: &[String]) -> Result<Vec<InvalidTag>> {
        let url = format!(
            "{}/legaltags:validate",
            self.config.base_url.trim_end_matches('/')
        );
        let mut request = self
            .client
            .post(url)
            .header(DATA_PARTITION_ID, ctx.partition_id())
            .header(CORRELATION_ID, ctx.correlation_id())
            .json(&ValidateRequest { names });
        if let Some(user) = ctx.user() {
            request = request.header(USER, user);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::LegalService(format!(
                "Legal service returned {}: {}",
                status, body
            )));
        }

        let parsed: ValidateResponse = response.json().await?;
        Ok(parsed.invalid_legal_tags)
    }
}

#[async_trait]
impl LegalService for HttpLegalService {
    async fn invalid_tags(&self, ctx: &RequestContext, names: &[String]) -> Result<Vec<InvalidTag>> {
        let mut invalid: HashMap<String, InvalidTag> = HashMap::new();
        for chunk in names.chunks(self.config.chunk_size.max(1)) {
            for tag in self.validate_chunk(ctx, chunk).await? {
                invalid.entry(tag.name.clone()).or_insert(tag);
            }
        }
        Ok(invalid.into_values().collect())
    }
}

/// Keeps only tag status claims the legal service currently agrees with.
pub struct LegalTagConsistencyValidator {
    legal: Arc<dyn LegalService>,
}

impl LegalTagConsistencyValidator {
    pub fn new(legal: Arc<dyn LegalService>) -> Self {
        Self { legal }
    }

    /// Filter `changes` against the legal service.
    ///
    /// A `compliant` claim survives when the tag is not reported invalid, an
    /// `incompliant` claim when it is. Claims with any other status pass
    /// through untouched. Fails with `ComplianceUpdateStopped` when the legal
    /// service cannot be consulted.
    pub async fn check(
        &self,
        changes: &LegalTagChangedCollection,
        ctx: &RequestContext,
    ) -> Result<LegalTagChangedCollection> {
        if changes.is_empty() {
            return Ok(LegalTagChangedCollection::default());
        }

        let mut names = changes.tag_names();
        names.sort();
        names.dedup();

        let invalid: HashSet<String> = self
            .legal
            .invalid_tags(ctx, &names)
            .await
            .map_err(|e| Error::ComplianceUpdateStopped(e.to_string()))?
            .into_iter()
            .map(|t| t.name)
            .collect();

        let mut kept = LegalTagChangedCollection::default();
        for change in &changes.status_changed_tags {
            let is_invalid = invalid.contains(&change.changed_tag_name);
            let consistent = match change.changed_tag_status.parse::<LegalCompliance>() {
                Ok(LegalCompliance::Compliant) => !is_invalid,
                Ok(LegalCompliance::Incompliant) => is_invalid,
                Err(_) => true,
            };
            if consistent {
                kept.status_changed_tags.push(change.clone());
            } else {
                warn!(
                    subsystem = "jobs",
                    component = "legal",
                    partition_id = %ctx.partition_id(),
                    correlation_id = %ctx.correlation_id(),
                    tag = %change.changed_tag_name,
                    claimed = %change.changed_tag_status,
                    "Dropping tag status claim the legal service disagrees with"
                );
            }
        }

        debug!(
            subsystem = "jobs",
            component = "legal",
            received = changes.status_changed_tags.len(),
            kept = kept.status_changed_tags.len(),
            "Validated tag status claims"
        );
        Ok(kept)
    }
}
