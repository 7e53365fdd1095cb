//! Polling executor: per-target delivery caches, the poll-and-publish tick, and its scheduler host.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use hookpoll_core::{
    CacheSnapshot, DeliveryCache, DeliveryEvent, PollRequest, PollingReport, PollingTargetId,
    PublishBatch, SourceAttributes, SourceType, TickResult,
};
use hookpoll_http::{HttpClient, HttpClientConfig, HttpError, RateLimit};
use hookpoll_sources::{EventSource, FetchError, SourceRegistry, UnsupportedSourceError};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hookpoll-executor";

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

#[derive(Clone)]
pub struct ExecutorConfig {
    pub manager_url: String,
    pub manager_token: Option<String>,
    pub targets_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    pub scheduler_enabled: bool,
    /// Requests allowed back to back before pacing kicks in; `None` disables pacing.
    pub rate_limit_burst: Option<u32>,
    pub rate_limit_refill_ms: u64,
}

impl fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("manager_url", &self.manager_url)
            .field("manager_token", &self.manager_token.as_ref().map(|_| "<redacted>"))
            .field("targets_file", &self.targets_file)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("publish_timeout_secs", &self.publish_timeout_secs)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .field("rate_limit_refill_ms", &self.rate_limit_refill_ms)
            .finish()
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            manager_url: lookup("HOOKPOLL_MANAGER_URL")
                .unwrap_or_else(|| "http://localhost:7143/api".to_string()),
            manager_token: lookup("HOOKPOLL_MANAGER_TOKEN").filter(|t| !t.trim().is_empty()),
            targets_file: lookup("HOOKPOLL_TARGETS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./targets.yaml")),
            user_agent: lookup("HOOKPOLL_USER_AGENT").unwrap_or_else(|| "hookpoll/0.1".to_string()),
            http_timeout_secs: number("HOOKPOLL_HTTP_TIMEOUT_SECS", 20),
            fetch_timeout_secs: number("HOOKPOLL_FETCH_TIMEOUT_SECS", 60),
            publish_timeout_secs: number("HOOKPOLL_PUBLISH_TIMEOUT_SECS", 30),
            scheduler_enabled: lookup("HOOKPOLL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            rate_limit_burst: lookup("HOOKPOLL_RATE_LIMIT_BURST")
                .and_then(|v| v.trim().parse().ok())
                .filter(|burst: &u32| *burst > 0),
            rate_limit_refill_ms: number("HOOKPOLL_RATE_LIMIT_REFILL_MS", 1000),
        }
    }

    /// Settings for the client shared by the sources and the manager sink.
    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            rate_limit: self.rate_limit_burst.map(|burst| RateLimit {
                burst,
                refill_every: Duration::from_millis(self.rate_limit_refill_ms),
            }),
            ..Default::default()
        }
    }

    pub fn timeouts(&self) -> TickTimeouts {
        TickTimeouts {
            fetch: Duration::from_secs(self.fetch_timeout_secs),
            publish: Duration::from_secs(self.publish_timeout_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("target id {0} is listed more than once")]
    DuplicateTarget(String),
    #[error("target {0} has a zero poll interval")]
    ZeroInterval(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetsFile {
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub target_id: String,
    pub account_id: String,
    #[serde(default)]
    pub polling_doc_id: Option<String>,
    pub source_type: SourceType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    pub attributes: SourceAttributes,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

impl TargetConfig {
    pub fn poll_request(&self) -> PollRequest {
        PollRequest {
            target_id: PollingTargetId::new(self.target_id.clone()),
            account_id: self.account_id.clone(),
            polling_doc_id: self
                .polling_doc_id
                .clone()
                .unwrap_or_else(|| self.target_id.clone()),
            source_type: self.source_type,
            attributes: self.attributes.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl TargetsFile {
    pub fn parse(text: &str) -> Result<Self> {
        let file: TargetsFile = serde_yaml::from_str(text).context("parsing targets yaml")?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.target_id.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.target_id.clone()));
            }
            if target.poll_interval_secs == 0 {
                return Err(ConfigError::ZeroInterval(target.target_id.clone()));
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &TargetConfig> {
        self.targets.iter().filter(|t| t.enabled)
    }
}

pub async fn load_targets(path: &Path) -> Result<TargetsFile> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    TargetsFile::parse(&text).with_context(|| format!("loading {}", path.display()))
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("invalid manager url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Transport that forwards a polling report to the manager.
///
/// `Ok(())` means the manager acknowledged the report; anything else leaves
/// the sender free to retry the same report later.
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(&self, report: &PollingReport) -> Result<(), PublishError>;
}

/// Posts reports as JSON to `{manager_url}/polling/{target_id}/result?accountId=...`.
#[derive(Debug, Clone)]
pub struct HttpPublishSink {
    http: Arc<HttpClient>,
    manager_url: String,
    token: Option<String>,
}

impl HttpPublishSink {
    pub fn new(
        http: Arc<HttpClient>,
        manager_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            http,
            manager_url: manager_url.into(),
            token,
        }
    }

    fn result_url(&self, report: &PollingReport) -> Result<reqwest::Url, PublishError> {
        let invalid = |reason: String| PublishError::InvalidUrl {
            url: self.manager_url.clone(),
            reason,
        };
        let mut url = reqwest::Url::parse(&self.manager_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(["polling", report.target_id.as_str(), "result"]);
        url.query_pairs_mut()
            .append_pair("accountId", &report.account_id);
        Ok(url)
    }

    fn headers(&self) -> Result<HeaderMap, PublishError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .map_err(|_| PublishError::InvalidUrl {
                    url: self.manager_url.clone(),
                    reason: "manager token is not a valid header value".to_string(),
                })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl PublishSink for HttpPublishSink {
    async fn publish(&self, report: &PollingReport) -> Result<(), PublishError> {
        let url = self.result_url(report)?;
        let headers = self.headers()?;
        let response = self
            .http
            .post_json(report.target_id.as_str(), url.as_str(), headers, report)
            .await?;
        debug!(status = response.status.as_u16(), "manager acknowledged polling report");
        Ok(())
    }
}

/// Concurrent map of per-target caches.
///
/// Distinct targets insert concurrently; each cache sits behind its own lock
/// so ticks for one target are serialized. Entries live until [`evict`] is
/// called or the process exits.
///
/// [`evict`]: DeliveryCacheMap::evict
#[derive(Debug, Default)]
pub struct DeliveryCacheMap {
    inner: DashMap<PollingTargetId, Arc<Mutex<DeliveryCache>>>,
}

impl DeliveryCacheMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, target_id: &PollingTargetId) -> Arc<Mutex<DeliveryCache>> {
        self.inner.entry(target_id.clone()).or_default().clone()
    }

    pub fn evict(&self, target_id: &PollingTargetId) -> bool {
        self.inner.remove(target_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn targets(&self) -> Vec<PollingTargetId> {
        let mut ids: Vec<_> = self.inner.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub async fn snapshot(&self, target_id: &PollingTargetId) -> Option<CacheSnapshot> {
        let cache = self.inner.get(target_id).map(|e| e.value().clone())?;
        let guard = cache.lock().await;
        Some(guard.snapshot())
    }

    pub async fn state(&self, target_id: &PollingTargetId) -> Option<DeliveryCache> {
        let cache = self.inner.get(target_id).map(|e| e.value().clone())?;
        let guard = cache.lock().await;
        Some(guard.clone())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TickTimeouts {
    pub fetch: Duration,
    pub publish: Duration,
}

impl Default for TickTimeouts {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(60),
            publish: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub target_id: PollingTargetId,
    pub result: Result<TickResult, UnsupportedSourceError>,
}

/// Runs one poll-and-publish cycle per call for a single target.
///
/// Fetching is skipped while a publish is outstanding, and cache state only
/// advances past "pending" once the sink confirms delivery. Fetch and publish
/// failures are absorbed into a 200 [`TickResult`]; the next tick retries.
pub struct PollingExecutor {
    registry: SourceRegistry,
    sink: Arc<dyn PublishSink>,
    caches: DeliveryCacheMap,
    timeouts: TickTimeouts,
}

impl PollingExecutor {
    pub fn new(registry: SourceRegistry, sink: Arc<dyn PublishSink>) -> Self {
        Self {
            registry,
            sink,
            caches: DeliveryCacheMap::new(),
            timeouts: TickTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: TickTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Run one tick, waiting for any tick already in progress for the target.
    pub async fn run_once(
        &self,
        request: &PollRequest,
    ) -> Result<TickResult, UnsupportedSourceError> {
        async {
            let cache = self.caches.get_or_create(&request.target_id);
            let mut cache = cache.lock().await;
            self.tick(request, &mut cache).await
        }
        .instrument(tick_span(request))
        .await
    }

    /// Like [`run_once`](Self::run_once), but returns `None` without touching
    /// the target when a tick for it is already in progress.
    pub async fn try_run_once(
        &self,
        request: &PollRequest,
    ) -> Option<Result<TickResult, UnsupportedSourceError>> {
        async {
            let cache = self.caches.get_or_create(&request.target_id);
            let Ok(mut cache) = cache.try_lock() else {
                debug!("previous tick still running; skipping");
                return None;
            };
            Some(self.tick(request, &mut cache).await)
        }
        .instrument(tick_span(request))
        .await
    }

    async fn tick(
        &self,
        request: &PollRequest,
        cache: &mut DeliveryCache,
    ) -> Result<TickResult, UnsupportedSourceError> {
        if cache.needs_to_publish() {
            debug!("previous publish unconfirmed; skipping fetch");
        } else {
            let source = self.registry.resolve(request.source_type)?;
            match self.fetch(source.as_ref(), &request.attributes).await {
                Ok(events) if events.is_empty() => {
                    info!("no recent deliveries");
                    return Ok(TickResult::ok("no recent deliveries"));
                }
                Ok(events) => {
                    let fetched = events.len();
                    cache.populate(events);
                    debug!(fetched, snapshot = ?cache.snapshot(), "cache populated");
                }
                Err(err) => {
                    warn!(error = %err, "fetching deliveries failed");
                    self.report_failure(request, &err).await;
                    return Ok(TickResult::ok(format!("fetch failed: {err}")));
                }
            }
        }

        if !cache.needs_to_publish() {
            return Ok(TickResult::ok("nothing new to publish"));
        }

        let batch = cache.pending_batch();
        let report = PollingReport::batch(request, batch.clone());
        match self.publish(&report).await {
            Ok(()) => {
                commit_published(cache, &batch);
                info!(
                    new_events = batch.new_events.len(),
                    deleted = batch.delete_ids.len(),
                    first_poll = batch.is_first_poll,
                    "published deliveries"
                );
                Ok(TickResult::ok(format!(
                    "published {} new, {} deleted",
                    batch.new_events.len(),
                    batch.delete_ids.len()
                )))
            }
            Err(err) => {
                warn!(
                    error = %err,
                    pending = batch.new_events.len(),
                    "publish failed; will retry next tick"
                );
                Ok(TickResult::ok(format!("publish failed: {err}")))
            }
        }
    }

    async fn fetch(
        &self,
        source: &dyn EventSource,
        attributes: &SourceAttributes,
    ) -> Result<Vec<DeliveryEvent>, FetchError> {
        let fetch = source.fetch_recent_deliveries(attributes);
        match tokio::time::timeout(self.timeouts.fetch, fetch).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.timeouts.fetch)),
        }
    }

    async fn publish(&self, report: &PollingReport) -> Result<(), PublishError> {
        match tokio::time::timeout(self.timeouts.publish, self.sink.publish(report)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.timeouts.publish)),
        }
    }

    async fn report_failure(&self, request: &PollRequest, err: &FetchError) {
        let report = PollingReport::failure(request, err.to_string());
        if let Err(publish_err) = self.publish(&report).await {
            warn!(error = %publish_err, "could not report fetch failure to manager");
        }
    }

    /// Tick each request in turn.
    pub async fn run_all_once(&self, requests: &[PollRequest]) -> Vec<TickOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self.run_once(request).await;
            if let Err(err) = &result {
                error!(target_id = %request.target_id, error = %err, "tick abandoned");
            }
            outcomes.push(TickOutcome {
                target_id: request.target_id.clone(),
                result,
            });
        }
        outcomes
    }

    /// Drop a target's cache, e.g. when the target is deprovisioned.
    pub fn evict(&self, target_id: &PollingTargetId) -> bool {
        self.caches.evict(target_id)
    }

    pub async fn cache_snapshot(&self, target_id: &PollingTargetId) -> Option<CacheSnapshot> {
        self.caches.snapshot(target_id).await
    }

    /// Copy of a target's full cache, taken under its lock.
    pub async fn cache_state(&self, target_id: &PollingTargetId) -> Option<DeliveryCache> {
        self.caches.state(target_id).await
    }

    pub fn tracked_targets(&self) -> Vec<PollingTargetId> {
        self.caches.targets()
    }
}

fn tick_span(request: &PollRequest) -> Span {
    info_span!(
        "polling_tick",
        tick_id = %Uuid::new_v4(),
        target_id = %request.target_id,
        account_id = %request.account_id,
        source_type = %request.source_type,
    )
}

fn commit_published(cache: &mut DeliveryCache, batch: &PublishBatch) {
    cache.clear_published(&batch.new_events);
    cache.remove_deleted_ids(&batch.delete_ids);
    cache.set_first_collection_on_delegate(false);
}

/// Executor wired with the built-in sources, the HTTP sink and the targets file.
pub struct PollingService {
    config: ExecutorConfig,
    executor: Arc<PollingExecutor>,
    targets: TargetsFile,
}

impl PollingService {
    pub async fn from_config(config: ExecutorConfig) -> Result<Self> {
        let http = Arc::new(HttpClient::new(config.http_config()).context("building http client")?);
        let registry = SourceRegistry::builtin(http.clone());
        let sink = Arc::new(HttpPublishSink::new(
            http,
            config.manager_url.clone(),
            config.manager_token.clone(),
        ));
        let targets = load_targets(&config.targets_file).await?;
        let executor = PollingExecutor::new(registry, sink).with_timeouts(config.timeouts());

        Ok(Self::new(config, Arc::new(executor), targets))
    }

    pub fn new(
        config: ExecutorConfig,
        executor: Arc<PollingExecutor>,
        targets: TargetsFile,
    ) -> Self {
        Self {
            config,
            executor,
            targets,
        }
    }

    pub fn executor(&self) -> &Arc<PollingExecutor> {
        &self.executor
    }

    pub fn targets(&self) -> &TargetsFile {
        &self.targets
    }

    /// Tick every enabled target once, or only `only` when given.
    pub async fn tick(&self, only: Option<&str>) -> Result<Vec<TickOutcome>> {
        let requests: Vec<_> = self
            .targets
            .enabled()
            .filter(|t| only.map_or(true, |id| t.target_id == id))
            .map(TargetConfig::poll_request)
            .collect();
        if let Some(id) = only {
            if requests.is_empty() {
                anyhow::bail!("no enabled target with id {id}");
            }
        }
        Ok(self.executor.run_all_once(&requests).await)
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for target in self.targets.enabled() {
            let executor = self.executor.clone();
            let request = target.poll_request();
            let job = Job::new_repeated_async(target.poll_interval(), move |_uuid, _l| {
                let executor = executor.clone();
                let request = request.clone();
                Box::pin(async move {
                    // Overlapping firings are dropped rather than queued on the lock.
                    match executor.try_run_once(&request).await {
                        None => {}
                        Some(Ok(result)) => debug!(
                            target_id = %request.target_id,
                            status = result.status_code,
                            message = %result.message,
                            "tick finished"
                        ),
                        Some(Err(err)) => error!(
                            target_id = %request.target_id,
                            error = %err,
                            "tick abandoned"
                        ),
                    }
                })
            })
            .with_context(|| format!("creating polling job for {}", target.target_id))?;
            sched.add(job).await.context("adding polling job")?;
        }
        Ok(Some(sched))
    }

    /// Poll on schedule until ctrl-c; with the scheduler disabled, run a single pass.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        let Some(mut sched) = self.maybe_build_scheduler().await? else {
            warn!("scheduler disabled (HOOKPOLL_SCHEDULER_ENABLED); running a single pass");
            self.tick(None).await?;
            return Ok(());
        };

        sched.start().await.context("starting scheduler")?;
        info!(targets = self.targets.enabled().count(), "polling scheduler started");
        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("shutting down polling scheduler");
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}

pub async fn tick_once_from_env(only: Option<&str>) -> Result<Vec<TickOutcome>> {
    let service = PollingService::from_config(ExecutorConfig::from_env()).await?;
    service.tick(only).await
}

pub async fn run_from_env() -> Result<()> {
    let service = PollingService::from_config(ExecutorConfig::from_env()).await?;
    service.run_until_shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TARGETS_YAML: &str = r#"
targets:
  - target_id: pt-1
    account_id: acc-1
    polling_doc_id: doc-1
    source_type: github
    poll_interval_secs: 120
    attributes:
      repository: octo/hello
      webhook_id: "42"
      token_env: GITHUB_TOKEN
  - target_id: pt-2
    account_id: acc-1
    source_type: gitlab
    enabled: false
    attributes:
      repository: octo/other
      webhook_id: "7"
"#;

    fn request() -> PollRequest {
        PollRequest {
            target_id: PollingTargetId::new("pt/1"),
            account_id: "acc 1".to_string(),
            polling_doc_id: "doc-1".to_string(),
            source_type: SourceType::Github,
            attributes: SourceAttributes {
                repository: "octo/hello".to_string(),
                webhook_id: "42".to_string(),
                api_url: None,
                token_env: None,
                lookback_minutes: 60,
            },
        }
    }

    #[test]
    fn config_defaults_apply_without_env() {
        let config = ExecutorConfig::from_lookup(|_| None);
        assert_eq!(config.manager_url, "http://localhost:7143/api");
        assert_eq!(config.targets_file, PathBuf::from("./targets.yaml"));
        assert_eq!(config.fetch_timeout_secs, 60);
        assert_eq!(config.publish_timeout_secs, 30);
        assert!(!config.scheduler_enabled);
        assert!(config.manager_token.is_none());
    }

    #[test]
    fn config_reads_overrides_and_redacts_token() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("HOOKPOLL_MANAGER_URL", "https://manager.example/api"),
            ("HOOKPOLL_MANAGER_TOKEN", "s3cret"),
            ("HOOKPOLL_FETCH_TIMEOUT_SECS", "5"),
            ("HOOKPOLL_PUBLISH_TIMEOUT_SECS", "not-a-number"),
            ("HOOKPOLL_SCHEDULER_ENABLED", "true"),
        ]);
        let config = ExecutorConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.manager_url, "https://manager.example/api");
        assert_eq!(config.timeouts().fetch, Duration::from_secs(5));
        assert_eq!(config.timeouts().publish, Duration::from_secs(30));
        assert!(config.scheduler_enabled);
        assert!(!format!("{config:?}").contains("s3cret"));
    }

    #[test]
    fn rate_limit_is_off_unless_a_burst_is_configured() {
        let config = ExecutorConfig::from_lookup(|_| None);
        assert_eq!(config.http_config().rate_limit, None);

        let zero = ExecutorConfig::from_lookup(|k| {
            (k == "HOOKPOLL_RATE_LIMIT_BURST").then(|| "0".to_string())
        });
        assert_eq!(zero.http_config().rate_limit, None);

        let vars: HashMap<&str, &str> = HashMap::from([
            ("HOOKPOLL_RATE_LIMIT_BURST", "5"),
            ("HOOKPOLL_RATE_LIMIT_REFILL_MS", "250"),
            ("HOOKPOLL_HTTP_TIMEOUT_SECS", "7"),
        ]);
        let config = ExecutorConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        let http = config.http_config();
        assert_eq!(
            http.rate_limit,
            Some(RateLimit {
                burst: 5,
                refill_every: Duration::from_millis(250),
            })
        );
        assert_eq!(http.timeout, Duration::from_secs(7));
        assert_eq!(http.user_agent.as_deref(), Some("hookpoll/0.1"));
    }

    #[test]
    fn targets_yaml_parses_with_defaults() {
        let file = TargetsFile::parse(TARGETS_YAML).expect("parse");
        assert_eq!(file.targets.len(), 2);
        let enabled: Vec<_> = file.enabled().map(|t| t.target_id.as_str()).collect();
        assert_eq!(enabled, vec!["pt-1"]);

        let first = file.targets[0].poll_request();
        assert_eq!(first.polling_doc_id, "doc-1");
        assert_eq!(first.attributes.token_env.as_deref(), Some("GITHUB_TOKEN"));
        assert_eq!(file.targets[0].poll_interval(), Duration::from_secs(120));

        let second = &file.targets[1];
        assert_eq!(second.poll_request().polling_doc_id, "pt-2");
        assert_eq!(second.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(second.source_type, SourceType::Gitlab);
    }

    #[test]
    fn duplicate_target_ids_are_rejected() {
        let yaml = r#"
targets:
  - target_id: a
    account_id: x
    source_type: github
    attributes: { repository: o/r, webhook_id: "1" }
  - target_id: a
    account_id: x
    source_type: github
    attributes: { repository: o/r, webhook_id: "2" }
"#;
        let err = TargetsFile::parse(yaml).expect_err("duplicate");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let yaml = r#"
targets:
  - target_id: a
    account_id: x
    source_type: github
    poll_interval_secs: 0
    attributes: { repository: o/r, webhook_id: "1" }
"#;
        assert!(TargetsFile::parse(yaml).is_err());
    }

    #[tokio::test]
    async fn targets_load_from_disk() {
        let dir = tempdir().expect("tempdir");
        let file_path = dir.path().join("targets.yaml");
        std::fs::write(&file_path, TARGETS_YAML).expect("write");
        let file = load_targets(&file_path).await.expect("load");
        assert_eq!(file.targets.len(), 2);

        let missing = load_targets(&dir.path().join("nope.yaml")).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn http_sink_posts_report_to_target_result_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/polling/pt%2F1/result"))
            .and(query_param("accountId", "acc 1"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let http = Arc::new(HttpClient::new(HttpClientConfig::default()).expect("client"));
        let sink = HttpPublishSink::new(http, format!("{}/api", server.uri()), Some("tok".into()));
        let report = PollingReport::failure(&request(), "boom");
        sink.publish(&report).await.expect("acknowledged");
    }

    #[tokio::test]
    async fn http_sink_treats_rejection_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let http = Arc::new(HttpClient::new(HttpClientConfig::default()).expect("client"));
        let sink = HttpPublishSink::new(http, server.uri(), None);
        let err = sink
            .publish(&PollingReport::failure(&request(), "boom"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, PublishError::Http(ref e) if e.status() == Some(400)));
    }

    #[test]
    fn http_sink_rejects_unusable_manager_url() {
        let http = Arc::new(HttpClient::new(HttpClientConfig::default()).expect("client"));
        let sink = HttpPublishSink::new(http, "not a url", None);
        let err = sink
            .result_url(&PollingReport::failure(&request(), "boom"))
            .expect_err("invalid");
        assert!(matches!(err, PublishError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn cache_map_creates_lazily_and_evicts() {
        let map = DeliveryCacheMap::new();
        let id = PollingTargetId::new("t1");
        assert!(map.snapshot(&id).await.is_none());

        let first = map.get_or_create(&id);
        let second = map.get_or_create(&id);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(map.len(), 1);
        assert_eq!(map.snapshot(&id).await.map(|s| s.is_first_poll), Some(true));

        assert!(map.evict(&id));
        assert!(!map.evict(&id));
        assert!(map.is_empty());
    }
}
