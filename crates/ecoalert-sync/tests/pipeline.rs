use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ecoalert_fetch::{FetchError, ForecastSource, SourceResponse, StatusCode};
use ecoalert_sync::{BatchCursor, EcoConfig, EcoPipeline, MigrationOutcome, SchemaShape};
use tempfile::TempDir;

/// Five forecast days for any location key.
struct FixedForecast {
    calls: AtomicUsize,
}

impl FixedForecast {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ForecastSource for FixedForecast {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn daily_forecast(&self, _location_key: &str) -> Result<SourceResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let days: Vec<_> = (1..=5)
            .map(|day| {
                serde_json::json!({
                    "Date": format!("2024-01-{day:02}T07:00:00+00:00"),
                    "Temperature": {"Maximum": {"Value": 20.0 + day as f64, "Unit": "C"}},
                    "Day": {"HasPrecipitation": day == 1, "Wind": {"Speed": {"Value": 10.0, "Unit": "km/h"}}}
                })
            })
            .collect();
        Ok(SourceResponse {
            status: StatusCode::OK,
            body: serde_json::to_vec(&serde_json::json!({ "DailyForecasts": days })).expect("body"),
        })
    }
}

fn fixture(rel: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(rel)
}

fn config(dir: &TempDir) -> EcoConfig {
    EcoConfig {
        database_url: format!("sqlite://{}", dir.path().join("ecoalert.db").display()),
        cache_path: dir.path().join("weather_cache.json"),
        reports_dir: dir.path().join("reports"),
        accuweather_api_key: Some("test-key".into()),
        retry_delay_ms: 0,
        ..EcoConfig::default()
    }
}

async fn pipeline(config: EcoConfig, source: Arc<FixedForecast>) -> EcoPipeline {
    EcoPipeline::connect(config)
        .await
        .expect("pipeline")
        .with_forecast_source(source)
}

async fn count(pipeline: &EcoPipeline, sql: &str) -> i64 {
    sqlx::query_scalar(sql)
        .fetch_one(pipeline.pool())
        .await
        .expect("count")
}

#[tokio::test]
async fn weather_runs_are_capped_and_second_run_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let source = FixedForecast::new();
    let pipeline = pipeline(config(&dir), source.clone()).await;

    let first = pipeline.run_weather().await.unwrap();
    assert_eq!(first.candidates, 100);
    assert_eq!(first.inserted, 25);
    assert_eq!(first.calls_used, 20);
    assert_eq!(source.calls(), 20);

    let second = pipeline.run_weather().await.unwrap();
    assert_eq!(second.inserted, 25);
    assert_eq!(second.skipped_existing, 25);
    assert_eq!(second.calls_used, 0);
    assert_eq!(source.calls(), 20);

    assert_eq!(count(&pipeline, "SELECT COUNT(*) FROM weather").await, 50);
    assert_eq!(count(&pipeline, "SELECT COUNT(*) FROM weather_details").await, 50);
}

#[tokio::test]
async fn call_budget_limits_network_attempts_per_run() {
    let dir = tempfile::tempdir().unwrap();
    let source = FixedForecast::new();
    let pipeline = pipeline(
        EcoConfig {
            max_calls: 3,
            ..config(&dir)
        },
        source.clone(),
    )
    .await;

    let run = pipeline.run_weather().await.unwrap();
    assert_eq!(source.calls(), 3);
    assert_eq!(run.calls_used, 3);
    assert_eq!(run.fetch_skips, 17);
    assert_eq!(run.candidates, 15);
    assert_eq!(run.inserted, 15);
}

#[tokio::test]
async fn without_api_key_only_cached_forecasts_load() {
    let dir = tempfile::tempdir().unwrap();
    let source = FixedForecast::new();
    let pipeline = pipeline(
        EcoConfig {
            accuweather_api_key: None,
            ..config(&dir)
        },
        source.clone(),
    )
    .await;

    let run = pipeline.run_weather().await.unwrap();
    assert_eq!(source.calls(), 0);
    assert_eq!(run.inserted, 0);
    assert_eq!(run.fetch_skips, 20);
}

#[tokio::test]
async fn climate_snapshot_loads_in_capped_batches_via_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(config(&dir), FixedForecast::new()).await;
    let input = fixture("noaa/noaa_data.json");

    let first = pipeline.run_climate(&input, BatchCursor::start()).await.unwrap();
    assert_eq!(first.candidates, 71);
    assert_eq!(first.rejected, 1);
    assert_eq!(first.unresolved, 1);
    assert_eq!(first.inserted, 25);
    assert_eq!(first.cursor, BatchCursor(25));

    let mut cursor = first.cursor;
    let mut total = first.inserted;
    while cursor.position() < first.candidates {
        let run = pipeline.run_climate(&input, cursor).await.unwrap();
        assert!(run.inserted <= 25);
        total += run.inserted;
        cursor = run.cursor;
    }
    assert_eq!(total, 71);
    assert_eq!(count(&pipeline, "SELECT COUNT(*) FROM climate").await, 71);

    let again = pipeline.run_climate(&input, BatchCursor::start()).await.unwrap();
    assert_eq!(again.inserted, 0);
}

#[tokio::test]
async fn species_snapshot_fans_out_broad_regions() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(
        EcoConfig {
            max_new_rows: 100,
            ..config(&dir)
        },
        FixedForecast::new(),
    )
    .await;

    let run = pipeline
        .run_species(&fixture("iucn/iucn_data.json"), BatchCursor::start())
        .await
        .unwrap();
    assert_eq!(run.candidates, 13);
    assert_eq!(run.inserted, 13);
    assert_eq!(run.rejected, 1);
    assert_eq!(run.unresolved, 1);

    assert_eq!(
        count(&pipeline, "SELECT COUNT(*) FROM species WHERE common_name = 'African Elephant'").await,
        3
    );
    assert_eq!(
        count(&pipeline, "SELECT COUNT(*) FROM species WHERE common_name = 'Pongo abelii' AND location_id = 6").await,
        1
    );
}

#[tokio::test]
async fn html_snapshots_load_through_the_same_path() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(config(&dir), FixedForecast::new()).await;

    let climate = pipeline
        .run_climate(&fixture("noaa/africa.html"), BatchCursor::start())
        .await
        .unwrap();
    assert_eq!(climate.candidates, 12);
    assert_eq!(climate.rejected, 1);

    let species = pipeline
        .run_species(&fixture("iucn/search.html"), BatchCursor::start())
        .await
        .unwrap();
    assert_eq!(species.candidates, 4);
    assert_eq!(species.rejected, 3);
    assert_eq!(species.unresolved, 1);
}

#[tokio::test]
async fn full_sync_then_migrate_then_report() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Arc::new(
        pipeline(
            EcoConfig {
                max_new_rows: 200,
                ..config(&dir)
            },
            FixedForecast::new(),
        )
        .await,
    );

    let runs = pipeline
        .run_once(None, Some(&fixture("iucn/iucn_data.json")))
        .await
        .unwrap();
    assert_eq!(
        runs.iter().map(|r| r.dataset.as_str()).collect::<Vec<_>>(),
        vec!["weather", "iucn-species"]
    );

    assert!(matches!(
        pipeline.migrate().await.unwrap(),
        MigrationOutcome::Migrated { species_rows: 13, climate_rows: 0 }
    ));
    assert_eq!(pipeline.migrate().await.unwrap(), MigrationOutcome::AlreadyNormalized);
    let report = pipeline.verify().await.unwrap();
    assert_eq!(report.shape, SchemaShape::Normalized);
    assert_eq!(report.species_sample.len(), 5);

    // Loads keep working against the normalized tables.
    let again = pipeline
        .run_species(&fixture("iucn/iucn_data.json"), BatchCursor::start())
        .await
        .unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(again.skipped_existing, 13);

    let summary = pipeline.write_reports().await.unwrap();
    assert_eq!(summary.locations, 20);
    let stats = std::fs::read_to_string(Path::new(&summary.reports_dir).join("location_stats.txt")).unwrap();
    // No climate rows were loaded, so every anomaly renders as zero.
    let mumbai = stats.lines().find(|l| l.contains("Mumbai")).unwrap();
    assert!(mumbai.contains("| 0.00 "));

    assert!(pipeline.clone().maybe_build_scheduler().await.unwrap().is_none());
}
