//! Capped, idempotent inserts of staged candidate rows.

use anyhow::{Context, Result};
use ecoalert_core::{ClimateAnomaly, SpeciesObservation, WeatherObservation};
use serde::Serialize;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::schema::{detect_shape, SchemaShape};

pub const DEFAULT_MAX_NEW_ROWS: usize = 25;

/// Humidity stored for every forecast day; the daily feed does not report it.
pub const DEFAULT_HUMIDITY: f64 = 50.0;

/// Stored precipitation when the forecast flags precipitation for the day.
pub const FLAGGED_PRECIPITATION: f64 = 50.0;

/// Index of the next unconsumed candidate in a staged batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct BatchCursor(pub usize);

impl BatchCursor {
    pub fn start() -> Self {
        Self(0)
    }

    pub fn position(self) -> usize {
        self.0
    }
}

/// One row the loader may write.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate {
    Weather(WeatherObservation),
    Climate(ClimateAnomaly),
    Species(SpeciesObservation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub skipped_existing: usize,
    pub cursor: BatchCursor,
}

impl BatchOutcome {
    pub fn is_drained(&self, total: usize) -> bool {
        self.cursor.position() >= total
    }
}

/// Walks `candidates` from `cursor` in order, inserting rows that do not exist
/// yet, and stops once `max_new_rows` rows have been written. Everything runs in
/// one transaction; an error leaves the store unchanged.
pub async fn load_batch(
    pool: &SqlitePool,
    candidates: &[Candidate],
    cursor: BatchCursor,
    max_new_rows: usize,
) -> Result<BatchOutcome> {
    let mut tx = pool.begin().await.context("starting load transaction")?;
    let shape = detect_shape(&mut tx).await?;

    let mut inserted = 0usize;
    let mut skipped_existing = 0usize;
    let mut next = cursor.position().min(candidates.len());

    while next < candidates.len() && inserted < max_new_rows {
        if insert_candidate(&mut tx, shape, &candidates[next]).await? {
            inserted += 1;
        } else {
            skipped_existing += 1;
        }
        next += 1;
    }

    tx.commit().await.context("committing load")?;

    let outcome = BatchOutcome {
        inserted,
        skipped_existing,
        cursor: BatchCursor(next),
    };
    info!(
        inserted,
        skipped_existing,
        cursor = next,
        remaining = candidates.len() - next,
        "batch loaded"
    );
    Ok(outcome)
}

async fn insert_candidate(
    conn: &mut SqliteConnection,
    shape: SchemaShape,
    candidate: &Candidate,
) -> Result<bool> {
    match candidate {
        Candidate::Weather(obs) => insert_weather(conn, obs).await,
        Candidate::Climate(row) => insert_climate(conn, shape, row).await,
        Candidate::Species(row) => insert_species(conn, shape, row).await,
    }
}

async fn insert_weather(conn: &mut SqliteConnection, obs: &WeatherObservation) -> Result<bool> {
    let written = sqlx::query(
        r#"
        INSERT OR IGNORE INTO weather (location_id, date, temperature, humidity, precipitation)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(obs.location_id.0)
    .bind(obs.date)
    .bind(obs.temperature)
    .bind(obs.humidity)
    .bind(obs.precipitation)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("inserting weather {} {}", obs.location_id, obs.date))?
    .rows_affected()
        == 1;

    // Details only accompany a newly written day, so they stay within the cap.
    if let (true, Some(wind_speed)) = (written, obs.wind_speed) {
        sqlx::query("INSERT OR IGNORE INTO weather_details (location_id, date, wind_speed) VALUES (?1, ?2, ?3)")
            .bind(obs.location_id.0)
            .bind(obs.date)
            .bind(wind_speed)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("inserting weather detail {} {}", obs.location_id, obs.date))?;
    }

    if !written {
        debug!(location_id = %obs.location_id, date = %obs.date, "weather row already present");
    }
    Ok(written)
}

async fn insert_climate(conn: &mut SqliteConnection, shape: SchemaShape, row: &ClimateAnomaly) -> Result<bool> {
    let result = match shape {
        SchemaShape::Legacy => {
            sqlx::query(
                "INSERT OR IGNORE INTO climate (region, year, temp_anomaly, location_id) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&row.region)
            .bind(row.year)
            .bind(row.anomaly)
            .bind(row.location_id.0)
            .execute(&mut *conn)
            .await
        }
        SchemaShape::Normalized => {
            let geo_key = lookup_id(conn, Lookup::Region, &row.region).await?;
            sqlx::query(
                "INSERT OR IGNORE INTO climate (geo_key, year, temp_anomaly, location_id) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(geo_key)
            .bind(row.year)
            .bind(row.anomaly)
            .bind(row.location_id.0)
            .execute(&mut *conn)
            .await
        }
    };
    let written = result
        .with_context(|| format!("inserting climate {} {} {}", row.region, row.year, row.location_id))?
        .rows_affected()
        == 1;
    Ok(written)
}

async fn insert_species(
    conn: &mut SqliteConnection,
    shape: SchemaShape,
    row: &SpeciesObservation,
) -> Result<bool> {
    let result = match shape {
        SchemaShape::Legacy => {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO species (common_name, population_status, red_list_category, location_id)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(&row.species_key)
            .bind(&row.population_status)
            .bind(&row.red_list_category)
            .bind(row.location_id.0)
            .execute(&mut *conn)
            .await
        }
        SchemaShape::Normalized => {
            let name_key = lookup_id(conn, Lookup::SpeciesName, &row.species_key).await?;
            let status_key = lookup_id(conn, Lookup::PopulationStatus, &row.population_status).await?;
            let category_key = lookup_id(conn, Lookup::RedListCategory, &row.red_list_category).await?;
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO species (species_name_key, population_status_key, red_list_key, location_id)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(name_key)
            .bind(status_key)
            .bind(category_key)
            .bind(row.location_id.0)
            .execute(&mut *conn)
            .await
        }
    };
    let written = result
        .with_context(|| format!("inserting species {} at {}", row.species_key, row.location_id))?
        .rows_affected()
        == 1;
    Ok(written)
}

#[derive(Debug, Clone, Copy)]
enum Lookup {
    Region,
    PopulationStatus,
    RedListCategory,
    SpeciesName,
}

impl Lookup {
    fn table_and_column(self) -> (&'static str, &'static str) {
        match self {
            Lookup::Region => ("noaa_regions", "region"),
            Lookup::PopulationStatus => ("population_status", "status"),
            Lookup::RedListCategory => ("red_list_cat", "red_list_category"),
            Lookup::SpeciesName => ("species_names", "common_name"),
        }
    }
}

/// Id of `value` in a lookup table, appending it on first sight.
async fn lookup_id(conn: &mut SqliteConnection, lookup: Lookup, value: &str) -> Result<i64> {
    let (table, column) = lookup.table_and_column();

    let insert = format!("INSERT OR IGNORE INTO {table} ({column}) VALUES (?1)");
    sqlx::query(&insert)
        .bind(value)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("adding {value:?} to {table}"))?;

    let select = format!("SELECT id FROM {table} WHERE {column} = ?1");
    let row = sqlx::query(&select)
        .bind(value)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("looking up {value:?} in {table}"))?;
    Ok(row.try_get("id")?)
}
