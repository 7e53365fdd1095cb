//! Event source contracts, the GitHub webhook-deliveries source, and the source registry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookpoll_core::{DeliveryEvent, SourceAttributes, SourceType};
use hookpoll_http::{HttpClient, HttpError};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "hookpoll-sources";

const GITHUB_API_VERSION: &str = "2022-11-28";
const DELIVERIES_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("invalid source attributes: {0}")]
    InvalidAttributes(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no event source registered for source type {0}")]
pub struct UnsupportedSourceError(pub SourceType);

/// A per-provider client able to list recent webhook deliveries for a target.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn source_type(&self) -> SourceType;

    async fn fetch_recent_deliveries(
        &self,
        attributes: &SourceAttributes,
    ) -> Result<Vec<DeliveryEvent>, FetchError>;
}

#[derive(Debug, Clone, Deserialize)]
struct GithubDeliverySummary {
    id: u64,
    #[serde(default)]
    guid: Option<String>,
    delivered_at: DateTime<Utc>,
    #[serde(default)]
    redelivery: bool,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubDeliveryDetail {
    id: u64,
    #[serde(default)]
    guid: Option<String>,
    delivered_at: DateTime<Utc>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    request: GithubDeliveryRequest,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GithubDeliveryRequest {
    #[serde(default)]
    headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    payload: Option<JsonValue>,
}

impl From<GithubDeliveryDetail> for DeliveryEvent {
    fn from(detail: GithubDeliveryDetail) -> Self {
        DeliveryEvent {
            delivery_id: detail.id.to_string(),
            guid: detail.guid,
            event: detail.event,
            action: detail.action,
            delivered_at: detail.delivered_at,
            headers: detail.request.headers.unwrap_or_default(),
            payload: detail.request.payload.unwrap_or(JsonValue::Null),
        }
    }
}

/// Polls the repository webhook deliveries API.
///
/// Only deliveries inside the target's lookback window are returned, so a
/// delivery aging out of the window shows up as a deletion in the cache.
/// Redeliveries are skipped; the original delivery already carries the event.
#[derive(Debug, Clone)]
pub struct GithubEventSource {
    http: Arc<HttpClient>,
}

impl GithubEventSource {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }

    fn headers(attributes: &SourceAttributes) -> Result<HeaderMap, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static(GITHUB_API_VERSION),
        );

        if let Some(var) = &attributes.token_env {
            let token = std::env::var(var).map_err(|_| {
                FetchError::InvalidAttributes(format!("token env var {var} is not set"))
            })?;
            let mut value =
                HeaderValue::from_str(&format!("Bearer {}", token.trim())).map_err(|_| {
                    FetchError::InvalidAttributes(format!("token in {var} is not a valid header"))
                })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    fn hook_url(attributes: &SourceAttributes) -> Result<String, FetchError> {
        let (owner, repo) = split_repository(&attributes.repository)?;
        let webhook_id = attributes.webhook_id.trim();
        if webhook_id.is_empty() {
            return Err(FetchError::InvalidAttributes("webhook_id is empty".to_string()));
        }
        Ok(format!(
            "{}/repos/{owner}/{repo}/hooks/{webhook_id}",
            attributes.api_url()
        ))
    }
}

fn split_repository(repository: &str) -> Result<(&str, &str), FetchError> {
    match repository.trim().split_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
            Ok((owner, repo))
        }
        _ => Err(FetchError::InvalidAttributes(format!(
            "repository must look like owner/name, got {repository:?}"
        ))),
    }
}

#[async_trait]
impl EventSource for GithubEventSource {
    fn source_type(&self) -> SourceType {
        SourceType::Github
    }

    async fn fetch_recent_deliveries(
        &self,
        attributes: &SourceAttributes,
    ) -> Result<Vec<DeliveryEvent>, FetchError> {
        let hook_url = Self::hook_url(attributes)?;
        let headers = Self::headers(attributes)?;
        let scope = attributes.repository.as_str();

        let list_url = format!("{hook_url}/deliveries?per_page={DELIVERIES_PAGE_SIZE}");
        let summaries: Vec<GithubDeliverySummary> =
            self.http.get_json(scope, &list_url, headers.clone()).await?;

        let cutoff = Utc::now() - chrono::Duration::minutes(i64::from(attributes.lookback_minutes));
        let recent: Vec<_> = summaries
            .into_iter()
            .filter(|d| !d.redelivery && d.delivered_at >= cutoff)
            .collect();
        debug!(
            repository = scope,
            recent = recent.len(),
            "listed webhook deliveries"
        );

        let mut events = Vec::with_capacity(recent.len());
        for summary in recent {
            let detail_url = format!("{hook_url}/deliveries/{}", summary.id);
            let detail: GithubDeliveryDetail =
                self.http.get_json(scope, &detail_url, headers.clone()).await?;
            let mut event = DeliveryEvent::from(detail);
            if event.event.is_none() {
                event.event = summary.event;
            }
            if event.action.is_none() {
                event.action = summary.action;
            }
            if event.guid.is_none() {
                event.guid = summary.guid;
            }
            events.push(event);
        }

        info!(repository = scope, deliveries = events.len(), "fetched webhook deliveries");
        Ok(events)
    }
}

pub fn has_builtin_source(source_type: SourceType) -> bool {
    matches!(source_type, SourceType::Github)
}

/// Built-in source for a given type, if one exists.
pub fn source_for_type(
    source_type: SourceType,
    http: Arc<HttpClient>,
) -> Option<Arc<dyn EventSource>> {
    match source_type {
        SourceType::Github => Some(Arc::new(GithubEventSource::new(http))),
        SourceType::Gitlab | SourceType::Bitbucket => None,
    }
}

#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<SourceType, Arc<dyn EventSource>>,
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.supported())
            .finish()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every source this crate ships.
    pub fn builtin(http: Arc<HttpClient>) -> Self {
        let mut registry = Self::new();
        for source_type in SourceType::ALL {
            if let Some(source) = source_for_type(source_type, http.clone()) {
                registry.register(source);
            }
        }
        registry
    }

    /// Register a source under its own type, replacing any previous one.
    pub fn register(&mut self, source: Arc<dyn EventSource>) -> Option<Arc<dyn EventSource>> {
        self.sources.insert(source.source_type(), source)
    }

    pub fn with_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.register(source);
        self
    }

    pub fn resolve(
        &self,
        source_type: SourceType,
    ) -> Result<Arc<dyn EventSource>, UnsupportedSourceError> {
        self.sources
            .get(&source_type)
            .cloned()
            .ok_or(UnsupportedSourceError(source_type))
    }

    pub fn supported(&self) -> Vec<SourceType> {
        let mut types: Vec<_> = self.sources.keys().copied().collect();
        types.sort();
        types
    }
}
