//! Rate-limited forecast fetching with a persistent on-disk cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ecoalert_core::DailyForecast;
pub use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ecoalert-fetch";

/// JSON object on disk mapping `"{location_key}_{limit}"` to forecast records.
#[derive(Debug, Clone)]
pub struct ForecastCache {
    path: PathBuf,
}

impl ForecastCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cache_key(location_key: &str, limit: usize) -> String {
        format!("{location_key}_{limit}")
    }

    /// Read the whole cache. Missing, unreadable or corrupt files read as empty.
    pub async fn load(&self) -> Map<String, Value> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Map::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "forecast cache unreadable; treating as empty");
                return Map::new();
            }
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!(path = %self.path.display(), "forecast cache is not a JSON object; treating as empty");
                Map::new()
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "forecast cache corrupt; treating as empty");
                Map::new()
            }
        }
    }

    pub async fn get(&self, location_key: &str, limit: usize) -> Option<Vec<DailyForecast>> {
        let key = Self::cache_key(location_key, limit);
        let value = self.load().await.remove(&key)?;
        match serde_json::from_value(value) {
            Ok(records) => Some(records),
            Err(err) => {
                warn!(key = %key, error = %err, "cached forecast entry unreadable; ignoring");
                None
            }
        }
    }

    /// Insert one entry and rewrite the file via temp-file rename.
    pub async fn put(
        &self,
        location_key: &str,
        limit: usize,
        records: &[DailyForecast],
    ) -> anyhow::Result<()> {
        let mut map = self.load().await;
        map.insert(
            Self::cache_key(location_key, limit),
            serde_json::to_value(records).context("serializing forecast records")?,
        );
        let bytes = serde_json::to_vec_pretty(&Value::Object(map)).context("serializing forecast cache")?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new(""));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating cache directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.cache.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp cache {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

/// Network attempts allowed in one load run. Created fresh by the caller per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallBudget {
    max_calls: usize,
    used: usize,
}

impl CallBudget {
    pub fn new(max_calls: usize) -> Self {
        Self { max_calls, used: 0 }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.max_calls.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max_calls
    }

    fn try_take(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.used += 1;
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only the provider's "slow down" answer is worth waiting out.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct SourceResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport failure: {0}")]
    Transport(String),
}

/// External daily-forecast provider.
#[async_trait]
pub trait ForecastSource: Send + Sync {
    fn name(&self) -> &str;

    async fn daily_forecast(&self, location_key: &str) -> Result<SourceResponse, FetchError>;
}

/// Why a fetch produced no records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    BudgetExhausted,
    RateLimited { attempts: usize },
    HttpStatus(u16),
    Transport(String),
    Malformed(String),
}

impl SkipReason {
    /// True when the same request may succeed on a later run.
    pub fn is_retry_later(&self) -> bool {
        matches!(self, SkipReason::BudgetExhausted | SkipReason::RateLimited { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fresh(Vec<DailyForecast>),
    Cached(Vec<DailyForecast>),
    Skipped(SkipReason),
}

impl FetchOutcome {
    pub fn records(&self) -> &[DailyForecast] {
        match self {
            FetchOutcome::Fresh(records) | FetchOutcome::Cached(records) => records,
            FetchOutcome::Skipped(_) => &[],
        }
    }

    pub fn into_records(self) -> Vec<DailyForecast> {
        match self {
            FetchOutcome::Fresh(records) | FetchOutcome::Cached(records) => records,
            FetchOutcome::Skipped(_) => Vec::new(),
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            FetchOutcome::Skipped(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ForecastEnvelope {
    #[serde(rename = "DailyForecasts")]
    daily_forecasts: Vec<DailyForecast>,
}

fn parse_forecast_body(body: &[u8], limit: usize) -> Result<Vec<DailyForecast>, serde_json::Error> {
    let envelope: ForecastEnvelope = serde_json::from_slice(body)?;
    let mut records = envelope.daily_forecasts;
    records.truncate(limit);
    Ok(records)
}

/// Wraps a [`ForecastSource`] with the cache, a caller-owned call budget and
/// fixed-delay retries on rate limiting. Never returns an error: failures become
/// [`FetchOutcome::Skipped`].
pub struct RateLimitedFetcher {
    source: Arc<dyn ForecastSource>,
    cache: ForecastCache,
    retry: RetryPolicy,
}

impl RateLimitedFetcher {
    pub fn new(source: Arc<dyn ForecastSource>, cache: ForecastCache, retry: RetryPolicy) -> Self {
        Self {
            source,
            cache,
            retry,
        }
    }

    pub fn cache(&self) -> &ForecastCache {
        &self.cache
    }

    pub async fn fetch(
        &self,
        location_key: &str,
        limit: usize,
        budget: &mut CallBudget,
    ) -> FetchOutcome {
        let span = info_span!("forecast_fetch", source = self.source.name(), location_key, limit);
        self.fetch_inner(location_key, limit, budget)
            .instrument(span)
            .await
    }

    async fn fetch_inner(
        &self,
        location_key: &str,
        limit: usize,
        budget: &mut CallBudget,
    ) -> FetchOutcome {
        if let Some(records) = self.cache.get(location_key, limit).await {
            debug!(records = records.len(), "forecast cache hit");
            return FetchOutcome::Cached(records);
        }

        let mut attempts = 0usize;
        loop {
            if !budget.try_take() {
                info!(used = budget.used(), max = budget.max_calls(), "call budget exhausted; skipping fetch");
                return FetchOutcome::Skipped(SkipReason::BudgetExhausted);
            }
            attempts += 1;

            let response = match self.source.daily_forecast(location_key).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(attempts, error = %err, "forecast request failed");
                    return FetchOutcome::Skipped(SkipReason::Transport(err.to_string()));
                }
            };

            if response.status.is_success() {
                let records = match parse_forecast_body(&response.body, limit) {
                    Ok(records) => records,
                    Err(err) => {
                        warn!(error = %err, "forecast response malformed");
                        return FetchOutcome::Skipped(SkipReason::Malformed(err.to_string()));
                    }
                };
                if let Err(err) = self.cache.put(location_key, limit, &records).await {
                    warn!(error = %err, "failed to persist forecast cache");
                }
                debug!(records = records.len(), attempts, "forecast fetched");
                return FetchOutcome::Fresh(records);
            }

            if classify_status(response.status) == RetryDisposition::NonRetryable {
                warn!(status = response.status.as_u16(), "forecast request rejected");
                return FetchOutcome::Skipped(SkipReason::HttpStatus(response.status.as_u16()));
            }

            if attempts > self.retry.max_retries {
                warn!(attempts, "rate limited; retries exhausted");
                return FetchOutcome::Skipped(SkipReason::RateLimited { attempts });
            }

            info!(attempts, delay_ms = self.retry.retry_delay.as_millis() as u64, "rate limited; retrying");
            tokio::time::sleep(self.retry.retry_delay).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccuWeatherConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for AccuWeatherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://dataservice.accuweather.com".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// 5-day daily forecast endpoint, metric units, with wind details.
#[derive(Debug)]
pub struct AccuWeatherSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AccuWeatherSource {
    pub fn new(config: AccuWeatherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn forecast_url(&self, location_key: &str) -> String {
        format!("{}/forecasts/v1/daily/5day/{}", self.base_url, location_key)
    }
}

#[async_trait]
impl ForecastSource for AccuWeatherSource {
    fn name(&self) -> &str {
        "accuweather"
    }

    async fn daily_forecast(&self, location_key: &str) -> Result<SourceResponse, FetchError> {
        let resp = self
            .client
            .get(self.forecast_url(location_key))
            .query(&[
                ("apikey", self.api_key.as_str()),
                ("metric", "true"),
                ("details", "true"),
            ])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        Ok(SourceResponse { status, body })
    }
}
