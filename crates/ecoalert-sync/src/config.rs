use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use ecoalert_core::{LocationCatalog, RedListCategory};
use ecoalert_fetch::{AccuWeatherConfig, RetryPolicy};
use tracing::warn;

use crate::loader::DEFAULT_MAX_NEW_ROWS;
use crate::queries::DEFAULT_RECENT_YEAR;

#[derive(Debug, Clone)]
pub struct EcoConfig {
    pub database_url: String,
    pub cache_path: PathBuf,
    /// Optional catalog override; the built-in reference catalog is used otherwise.
    pub catalog_path: Option<PathBuf>,
    pub accuweather_api_key: Option<String>,
    pub accuweather_base_url: String,
    pub max_new_rows: usize,
    pub max_calls: usize,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub forecast_days: usize,
    pub recent_year: i32,
    pub severity_threshold: RedListCategory,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for EcoConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://ecoalert.db".to_string(),
            cache_path: PathBuf::from("weather_cache.json"),
            catalog_path: None,
            accuweather_api_key: None,
            accuweather_base_url: AccuWeatherConfig::default().base_url,
            max_new_rows: DEFAULT_MAX_NEW_ROWS,
            max_calls: 20,
            max_retries: 3,
            retry_delay_ms: 2000,
            forecast_days: 5,
            recent_year: DEFAULT_RECENT_YEAR,
            severity_threshold: RedListCategory::Vulnerable,
            reports_dir: PathBuf::from("reports"),
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            user_agent: "ecoalert/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }
}

fn env_parsed<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, "ignoring unparseable setting");
            default
        }),
        Err(_) => default,
    }
}

impl EcoConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            cache_path: std::env::var("ECOALERT_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_path),
            catalog_path: std::env::var("ECOALERT_CATALOG").ok().map(PathBuf::from),
            accuweather_api_key: std::env::var("ACCUWEATHER_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            accuweather_base_url: std::env::var("ACCUWEATHER_BASE_URL")
                .unwrap_or(defaults.accuweather_base_url),
            max_new_rows: env_parsed("ECOALERT_MAX_NEW_ROWS", defaults.max_new_rows),
            max_calls: env_parsed("ECOALERT_MAX_CALLS", defaults.max_calls),
            max_retries: env_parsed("ECOALERT_MAX_RETRIES", defaults.max_retries),
            retry_delay_ms: env_parsed("ECOALERT_RETRY_DELAY_MS", defaults.retry_delay_ms),
            forecast_days: env_parsed("ECOALERT_FORECAST_DAYS", defaults.forecast_days),
            recent_year: env_parsed("ECOALERT_RECENT_YEAR", defaults.recent_year),
            severity_threshold: env_parsed("ECOALERT_SEVERITY_THRESHOLD", defaults.severity_threshold),
            reports_dir: std::env::var("ECOALERT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            scheduler_enabled: std::env::var("ECOALERT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("ECOALERT_SYNC_CRON").unwrap_or(defaults.sync_cron),
            user_agent: std::env::var("ECOALERT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parsed("ECOALERT_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn accuweather(&self) -> Option<AccuWeatherConfig> {
        let api_key = self.accuweather_api_key.clone()?;
        Some(AccuWeatherConfig {
            base_url: self.accuweather_base_url.clone(),
            api_key,
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        })
    }

    pub fn load_catalog(&self) -> Result<LocationCatalog> {
        match &self.catalog_path {
            Some(path) => LocationCatalog::from_yaml_file(path)
                .with_context(|| format!("loading catalog {}", path.display())),
            None => LocationCatalog::reference().context("loading reference catalog"),
        }
    }
}
