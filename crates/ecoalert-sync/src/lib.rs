//! Load pipeline: schema management, capped incremental loads, aggregate
//! reports and the optional cron schedule.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ecoalert_adapters::{load_snapshot, IucnSpeciesAdapter, NoaaClimateAdapter, Rejected, SnapshotAdapter};
use ecoalert_core::LocationCatalog;
use ecoalert_fetch::{
    AccuWeatherConfig, AccuWeatherSource, CallBudget, FetchOutcome, ForecastCache, ForecastSource,
    RateLimitedFetcher,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod config;
pub mod loader;
pub mod queries;
pub mod reports;
pub mod schema;
pub mod staging;

pub use config::EcoConfig;
pub use loader::{load_batch, BatchCursor, BatchOutcome, Candidate, DEFAULT_HUMIDITY, DEFAULT_MAX_NEW_ROWS};
pub use queries::{LocationSummary, RegionCategoryCount, SpeciesWeather};
pub use reports::{ReportOptions, ReportSummary};
pub use schema::{MigrationOutcome, SchemaReport, SchemaShape};

pub const CRATE_NAME: &str = "ecoalert-sync";

/// Rows per report of the latest-weather-per-species query.
const LATEST_WEATHER_LIMIT: usize = 25;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dataset: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub inserted: usize,
    pub skipped_existing: usize,
    pub cursor: BatchCursor,
    pub rejected: usize,
    pub unresolved: usize,
    pub calls_used: usize,
    pub fetch_skips: usize,
}

pub struct EcoPipeline {
    config: EcoConfig,
    pool: SqlitePool,
    catalog: Arc<LocationCatalog>,
    fetcher: RateLimitedFetcher,
    run_lock: Mutex<()>,
}

impl EcoPipeline {
    /// Opens the store, creates missing tables and seeds the catalog.
    pub async fn connect(config: EcoConfig) -> Result<Self> {
        let catalog = config.load_catalog()?;
        let pool = schema::connect(&config.database_url).await?;
        schema::ensure_schema(&pool, &catalog).await?;

        let source = AccuWeatherSource::new(config.accuweather().unwrap_or_else(|| AccuWeatherConfig {
            base_url: config.accuweather_base_url.clone(),
            user_agent: Some(config.user_agent.clone()),
            ..AccuWeatherConfig::default()
        }))?;
        let fetcher = RateLimitedFetcher::new(
            Arc::new(source),
            ForecastCache::new(&config.cache_path),
            config.retry_policy(),
        );

        Ok(Self {
            config,
            pool,
            catalog: Arc::new(catalog),
            fetcher,
            run_lock: Mutex::new(()),
        })
    }

    pub fn with_forecast_source(mut self, source: Arc<dyn ForecastSource>) -> Self {
        self.fetcher = RateLimitedFetcher::new(
            source,
            ForecastCache::new(&self.config.cache_path),
            self.config.retry_policy(),
        );
        self
    }

    pub fn config(&self) -> &EcoConfig {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn catalog(&self) -> &LocationCatalog {
        &self.catalog
    }

    pub async fn migrate(&self) -> Result<MigrationOutcome> {
        let _guard = self.run_lock.lock().await;
        schema::migrate_to_normalized_schema(&self.pool).await
    }

    pub async fn verify(&self) -> Result<SchemaReport> {
        schema::verify_migration(&self.pool).await
    }

    /// Fetches forecasts for every catalog place with a fresh call budget and
    /// loads up to `max_new_rows` new days.
    pub async fn run_weather(&self) -> Result<RunSummary> {
        let _guard = self.run_lock.lock().await;
        self.weather_run().await
    }

    pub async fn run_climate(&self, input: &Path, cursor: BatchCursor) -> Result<RunSummary> {
        let _guard = self.run_lock.lock().await;
        self.climate_run(input, cursor).await
    }

    pub async fn run_species(&self, input: &Path, cursor: BatchCursor) -> Result<RunSummary> {
        let _guard = self.run_lock.lock().await;
        self.species_run(input, cursor).await
    }

    /// Weather, then whichever snapshot inputs are given, each from the start.
    pub async fn run_once(&self, climate_input: Option<&Path>, species_input: Option<&Path>) -> Result<Vec<RunSummary>> {
        let _guard = self.run_lock.lock().await;
        let mut runs = vec![self.weather_run().await?];
        if let Some(input) = climate_input {
            runs.push(self.climate_run(input, BatchCursor::start()).await?);
        }
        if let Some(input) = species_input {
            runs.push(self.species_run(input, BatchCursor::start()).await?);
        }
        Ok(runs)
    }

    pub async fn write_reports(&self) -> Result<ReportSummary> {
        let _guard = self.run_lock.lock().await;
        reports::write_reports(
            &self.pool,
            &self.config.reports_dir,
            ReportOptions {
                recent_year: self.config.recent_year,
                severity_threshold: self.config.severity_threshold,
                latest_limit: LATEST_WEATHER_LIMIT,
            },
        )
        .await
    }

    /// A cron job running the weather load, when scheduling is enabled.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.as_str();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_weather().await {
                    Ok(summary) => info!(inserted = summary.inserted, run_id = %summary.run_id, "scheduled weather load finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled weather load failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn weather_run(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let max_calls = if self.config.accuweather_api_key.is_some() {
            self.config.max_calls
        } else {
            warn!("ACCUWEATHER_API_KEY not set; serving cached forecasts only");
            0
        };
        let mut budget = CallBudget::new(max_calls);
        let mut candidates = Vec::new();
        let mut fetch_skips = 0usize;

        for (key, location_id) in self.catalog.weather_locations() {
            let outcome = self
                .fetcher
                .fetch(key, self.config.forecast_days, &mut budget)
                .await;
            if let FetchOutcome::Skipped(reason) = &outcome {
                fetch_skips += 1;
                if reason.is_retry_later() {
                    info!(location_key = key, ?reason, "forecast deferred to a later run");
                } else {
                    warn!(location_key = key, ?reason, "forecast skipped");
                }
            }
            candidates.extend(staging::weather_candidates(location_id, outcome.records()));
        }

        let outcome = load_batch(&self.pool, &candidates, BatchCursor::start(), self.config.max_new_rows).await?;
        Ok(RunSummary {
            run_id: Uuid::new_v4(),
            dataset: "weather".to_string(),
            started_at,
            finished_at: Utc::now(),
            candidates: candidates.len(),
            inserted: outcome.inserted,
            skipped_existing: outcome.skipped_existing,
            cursor: outcome.cursor,
            rejected: 0,
            unresolved: 0,
            calls_used: budget.used(),
            fetch_skips,
        })
    }

    async fn climate_run(&self, input: &Path, cursor: BatchCursor) -> Result<RunSummary> {
        let started_at = Utc::now();
        let adapter = NoaaClimateAdapter;
        let snapshot = load_snapshot(input)?;
        let parsed = adapter
            .parse(&snapshot)
            .with_context(|| format!("parsing {} snapshot {}", adapter.dataset(), input.display()))?;
        log_rejections(adapter.dataset(), &parsed.rejected);

        let staged = staging::climate_candidates(&self.catalog, &parsed.records);
        self.finish_snapshot_run(adapter.dataset(), started_at, staged, parsed.rejected.len(), cursor)
            .await
    }

    async fn species_run(&self, input: &Path, cursor: BatchCursor) -> Result<RunSummary> {
        let started_at = Utc::now();
        let adapter = IucnSpeciesAdapter;
        let snapshot = load_snapshot(input)?;
        let parsed = adapter
            .parse(&snapshot)
            .with_context(|| format!("parsing {} snapshot {}", adapter.dataset(), input.display()))?;
        log_rejections(adapter.dataset(), &parsed.rejected);

        let staged = staging::species_candidates(&self.catalog, &parsed.records);
        self.finish_snapshot_run(adapter.dataset(), started_at, staged, parsed.rejected.len(), cursor)
            .await
    }

    async fn finish_snapshot_run(
        &self,
        dataset: &str,
        started_at: DateTime<Utc>,
        staged: staging::Staged,
        rejected: usize,
        cursor: BatchCursor,
    ) -> Result<RunSummary> {
        let outcome = load_batch(&self.pool, &staged.candidates, cursor, self.config.max_new_rows).await?;
        if !outcome.is_drained(staged.candidates.len()) {
            info!(dataset, next_cursor = outcome.cursor.position(), "batch cap reached; resume from cursor");
        }
        Ok(RunSummary {
            run_id: Uuid::new_v4(),
            dataset: dataset.to_string(),
            started_at,
            finished_at: Utc::now(),
            candidates: staged.candidates.len(),
            inserted: outcome.inserted,
            skipped_existing: outcome.skipped_existing,
            cursor: outcome.cursor,
            rejected,
            unresolved: staged.unresolved.len(),
            calls_used: 0,
            fetch_skips: 0,
        })
    }
}

fn log_rejections(dataset: &str, rejected: &[Rejected]) {
    for r in rejected {
        warn!(dataset, position = r.position, reason = %r.reason, "source entry rejected");
    }
}

pub async fn connect_from_env() -> Result<EcoPipeline> {
    EcoPipeline::connect(EcoConfig::from_env()).await
}
