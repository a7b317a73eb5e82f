//! Text, CSV and parquet renderings of the aggregate queries.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use ecoalert_core::RedListCategory;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::queries::{
    latest_weather_per_species, location_summaries, region_category_counts, LocationSummary,
    RegionCategoryCount, SpeciesWeather,
};

#[derive(Debug, Clone, Copy)]
pub struct ReportOptions {
    pub recent_year: i32,
    pub severity_threshold: RedListCategory,
    pub latest_limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub reports_dir: String,
    pub locations: usize,
    pub species_rows: usize,
    pub region_rows: usize,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
struct LocationStatsRow<'a> {
    location_id: i64,
    name: &'a str,
    avg_temperature: f64,
    species_count: i64,
    recent_anomaly: f64,
    avg_wind_speed: f64,
}

#[derive(Debug, Serialize)]
struct SpeciesLatestRow<'a> {
    species: &'a str,
    red_list_category: &'a str,
    location_id: i64,
    date: String,
    temperature: f64,
    precipitation: f64,
}

#[derive(Debug, Serialize)]
struct RegionCategoryRow<'a> {
    region: &'a str,
    category: &'static str,
    species_count: i64,
}

/// Runs every aggregate and writes the results under `root/<run id>/`.
pub async fn write_reports(pool: &sqlx::SqlitePool, root: &Path, options: ReportOptions) -> Result<ReportSummary> {
    let run_id = Uuid::new_v4();
    let reports_dir = root.join(run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summaries = location_summaries(pool, options.recent_year).await?;
    let latest = latest_weather_per_species(pool, options.latest_limit).await?;
    let regions = region_category_counts(pool, options.severity_threshold).await?;

    fs::write(reports_dir.join("location_stats.txt"), render_location_table(&summaries))
        .await
        .context("writing location_stats.txt")?;
    write_location_csv(&reports_dir.join("location_stats.csv"), &summaries)?;
    write_species_csv(&reports_dir.join("species_latest.csv"), &latest)?;
    write_region_csv(&reports_dir.join("region_categories.csv"), &regions)?;
    let manifest_path = export_parquet_snapshots(&reports_dir, &summaries, &regions).await?;

    info!(reports_dir = %reports_dir.display(), locations = summaries.len(), "reports written");
    Ok(ReportSummary {
        run_id,
        generated_at: Utc::now(),
        reports_dir: reports_dir.display().to_string(),
        locations: summaries.len(),
        species_rows: latest.len(),
        region_rows: regions.len(),
        parquet_manifest: manifest_path.display().to_string(),
    })
}

/// Pipe-delimited table with missing aggregates shown as zero.
pub fn render_location_table(summaries: &[LocationSummary]) -> String {
    let mut lines = vec![
        format!(
            "{:<11} | {:<14} | {:<13} | {:<13} | {:<18} | {}",
            "Location ID", "Name", "Avg Temp (°C)", "Species Count", "Recent Anomaly (°C)", "Avg Wind (km/h)"
        ),
        "-".repeat(98),
    ];
    for s in summaries {
        lines.push(format!(
            "{:<11} | {:<14} | {:<13.1} | {:<13} | {:<18.2} | {:.1}",
            s.location_id.0,
            s.name,
            s.display_avg_temperature(),
            s.species_count,
            s.display_recent_anomaly(),
            s.display_avg_wind_speed()
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

const LOCATION_STATS_HEADER: [&str; 6] = [
    "location_id",
    "name",
    "avg_temperature",
    "species_count",
    "recent_anomaly",
    "avg_wind_speed",
];
const SPECIES_LATEST_HEADER: [&str; 6] = [
    "species",
    "red_list_category",
    "location_id",
    "date",
    "temperature",
    "precipitation",
];
const REGION_CATEGORIES_HEADER: [&str; 3] = ["region", "category", "species_count"];

/// CSV writer with the header already written, so empty reports still carry it.
fn csv_with_header(path: &Path, header: &[&str]) -> Result<csv::Writer<File>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer
        .write_record(header)
        .with_context(|| format!("writing header of {}", path.display()))?;
    Ok(writer)
}

fn write_location_csv(path: &Path, summaries: &[LocationSummary]) -> Result<()> {
    let mut writer = csv_with_header(path, &LOCATION_STATS_HEADER)?;
    for s in summaries {
        writer.serialize(LocationStatsRow {
            location_id: s.location_id.0,
            name: &s.name,
            avg_temperature: s.display_avg_temperature(),
            species_count: s.species_count,
            recent_anomaly: s.display_recent_anomaly(),
            avg_wind_speed: s.display_avg_wind_speed(),
        })?;
    }
    writer.flush().with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

fn write_species_csv(path: &Path, rows: &[SpeciesWeather]) -> Result<()> {
    let mut writer = csv_with_header(path, &SPECIES_LATEST_HEADER)?;
    for r in rows {
        writer.serialize(SpeciesLatestRow {
            species: &r.species,
            red_list_category: r.red_list_category.as_deref().unwrap_or_default(),
            location_id: r.location_id.0,
            date: r.date.format("%Y-%m-%d").to_string(),
            temperature: r.temperature,
            precipitation: r.precipitation,
        })?;
    }
    writer.flush().with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

fn write_region_csv(path: &Path, rows: &[RegionCategoryCount]) -> Result<()> {
    let mut writer = csv_with_header(path, &REGION_CATEGORIES_HEADER)?;
    for r in rows {
        writer.serialize(RegionCategoryRow {
            region: &r.region,
            category: r.category.label(),
            species_count: r.species_count,
        })?;
    }
    writer.flush().with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

async fn export_parquet_snapshots(
    reports_dir: &Path,
    summaries: &[LocationSummary],
    regions: &[RegionCategoryCount],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let summaries_path = snapshot_dir.join("location_summaries.parquet");
    let regions_path = snapshot_dir.join("region_categories.parquet");
    write_summaries_parquet(&summaries_path, summaries)?;
    write_regions_parquet(&regions_path, regions)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("location_summaries", reports_dir, &summaries_path)?,
            manifest_entry("region_categories", reports_dir, &regions_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_summaries_parquet(path: &Path, summaries: &[LocationSummary]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("location_id", DataType::Int64, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("avg_temperature", DataType::Float64, true),
        ArrowField::new("species_count", DataType::Int64, false),
        ArrowField::new("recent_anomaly", DataType::Float64, true),
        ArrowField::new("avg_wind_speed", DataType::Float64, true),
    ]));

    let ids = Int64Array::from(summaries.iter().map(|s| s.location_id.0).collect::<Vec<_>>());
    let names = StringArray::from(summaries.iter().map(|s| Some(s.name.as_str())).collect::<Vec<_>>());
    let temperatures = Float64Array::from(summaries.iter().map(|s| s.avg_temperature).collect::<Vec<_>>());
    let species = Int64Array::from(summaries.iter().map(|s| s.species_count).collect::<Vec<_>>());
    let anomalies = Float64Array::from(summaries.iter().map(|s| s.recent_anomaly).collect::<Vec<_>>());
    let winds = Float64Array::from(summaries.iter().map(|s| s.avg_wind_speed).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(names),
            Arc::new(temperatures),
            Arc::new(species),
            Arc::new(anomalies),
            Arc::new(winds),
        ],
    )
    .context("building location_summaries record batch")?;
    write_parquet(path, batch)
}

fn write_regions_parquet(path: &Path, regions: &[RegionCategoryCount]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("region", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("species_count", DataType::Int64, false),
    ]));

    let names = StringArray::from(regions.iter().map(|r| Some(r.region.as_str())).collect::<Vec<_>>());
    let categories = StringArray::from(regions.iter().map(|r| Some(r.category.label())).collect::<Vec<_>>());
    let counts = Int64Array::from(regions.iter().map(|r| r.species_count).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(schema, vec![Arc::new(names), Arc::new(categories), Arc::new(counts)])
        .context("building region_categories record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
