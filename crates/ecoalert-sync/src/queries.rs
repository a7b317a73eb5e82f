//! Read-only aggregates over the loaded tables.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use ecoalert_core::{LocationId, RedListCategory};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::schema::{detect_shape, SchemaShape};

/// Climate years at or after this count as recent in location summaries.
pub const DEFAULT_RECENT_YEAR: i32 = 2020;

/// Per-location statistics. Aggregates with no matching rows are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationSummary {
    pub location_id: LocationId,
    pub name: String,
    pub avg_temperature: Option<f64>,
    pub species_count: i64,
    pub recent_anomaly: Option<f64>,
    pub avg_wind_speed: Option<f64>,
}

impl LocationSummary {
    pub fn display_avg_temperature(&self) -> f64 {
        self.avg_temperature.unwrap_or(0.0)
    }

    pub fn display_recent_anomaly(&self) -> f64 {
        self.recent_anomaly.unwrap_or(0.0)
    }

    pub fn display_avg_wind_speed(&self) -> f64 {
        self.avg_wind_speed.unwrap_or(0.0)
    }
}

/// Most recent weather at the location of one species.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeciesWeather {
    pub species: String,
    pub red_list_category: Option<String>,
    pub location_id: LocationId,
    pub date: NaiveDate,
    pub temperature: f64,
    pub precipitation: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionCategoryCount {
    pub region: String,
    pub category: RedListCategory,
    pub species_count: i64,
}

/// `species` with names and categories resolved, whatever the table shape.
fn species_view(shape: SchemaShape) -> &'static str {
    match shape {
        SchemaShape::Legacy => {
            "SELECT common_name AS species, red_list_category, location_id FROM species"
        }
        SchemaShape::Normalized => {
            r#"
            SELECT sn.common_name AS species, rl.red_list_category AS red_list_category, s.location_id AS location_id
              FROM species s
              JOIN species_names sn ON sn.id = s.species_name_key
              LEFT JOIN red_list_cat rl ON rl.id = s.red_list_key
            "#
        }
    }
}

async fn current_shape(pool: &SqlitePool) -> Result<SchemaShape> {
    let mut conn = pool.acquire().await.context("acquiring connection")?;
    detect_shape(&mut conn).await
}

pub async fn location_summaries(pool: &SqlitePool, recent_year: i32) -> Result<Vec<LocationSummary>> {
    let species_column = match current_shape(pool).await? {
        SchemaShape::Legacy => "common_name",
        SchemaShape::Normalized => "species_name_key",
    };
    let sql = format!(
        r#"
        SELECT w.location_id AS location_id,
               l.name AS name,
               AVG(w.temperature) AS avg_temperature,
               (SELECT COUNT(DISTINCT s.{species_column})
                  FROM species s
                 WHERE s.location_id = w.location_id) AS species_count,
               (SELECT AVG(c.temp_anomaly)
                  FROM climate c
                 WHERE c.location_id = w.location_id
                   AND c.year >= ?1) AS recent_anomaly,
               AVG(wd.wind_speed) AS avg_wind_speed
          FROM weather w
          JOIN locations l ON l.id = w.location_id
          LEFT JOIN weather_details wd ON wd.location_id = w.location_id AND wd.date = w.date
         GROUP BY w.location_id, l.name
         ORDER BY w.location_id
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(recent_year)
        .fetch_all(pool)
        .await
        .context("querying location summaries")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(LocationSummary {
            location_id: LocationId(row.try_get("location_id")?),
            name: row.try_get("name")?,
            avg_temperature: row.try_get("avg_temperature")?,
            species_count: row.try_get("species_count")?,
            recent_anomaly: row.try_get("recent_anomaly")?,
            avg_wind_speed: row.try_get("avg_wind_speed")?,
        });
    }
    Ok(out)
}

/// For each species, the latest weather row at its location. Date ties resolve
/// in whatever order SQLite returns them.
pub async fn latest_weather_per_species(pool: &SqlitePool, limit: usize) -> Result<Vec<SpeciesWeather>> {
    let view = species_view(current_shape(pool).await?);
    let sql = format!(
        r#"
        WITH named AS ({view}),
        ranked AS (
            SELECT n.species, n.red_list_category, n.location_id,
                   w.date, w.temperature, w.precipitation,
                   ROW_NUMBER() OVER (PARTITION BY n.species ORDER BY w.date DESC) AS rn
              FROM named n
              JOIN weather w ON w.location_id = n.location_id
             WHERE n.species IS NOT NULL AND n.species <> ''
        )
        SELECT species, red_list_category, location_id, date, temperature, precipitation
          FROM ranked
         WHERE rn = 1
         ORDER BY species
         LIMIT ?1
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await
        .context("querying latest weather per species")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let raw_date: String = row.try_get("date")?;
        let date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d")
            .with_context(|| format!("parsing stored date {raw_date:?}"))?;
        out.push(SpeciesWeather {
            species: row.try_get("species")?,
            red_list_category: row.try_get("red_list_category")?,
            location_id: LocationId(row.try_get("location_id")?),
            date,
            temperature: row.try_get("temperature")?,
            precipitation: row.try_get("precipitation")?,
        });
    }
    Ok(out)
}

/// Distinct species per (region, category) for categories at or above `threshold`,
/// most severe first within each region.
pub async fn region_category_counts(
    pool: &SqlitePool,
    threshold: RedListCategory,
) -> Result<Vec<RegionCategoryCount>> {
    let view = species_view(current_shape(pool).await?);
    let labels: Vec<&str> = threshold.at_or_above().map(RedListCategory::label).collect();
    let placeholders = vec!["?"; labels.len()].join(", ");
    let sql = format!(
        r#"
        WITH named AS ({view})
        SELECT lr.region AS region,
               n.red_list_category AS category,
               COUNT(DISTINCT n.species) AS species_count
          FROM named n
          JOIN location_regions lr ON lr.location_id = n.location_id
         WHERE n.red_list_category IN ({placeholders})
         GROUP BY lr.region, n.red_list_category
        "#
    );

    let mut query = sqlx::query(&sql);
    for label in &labels {
        query = query.bind(*label);
    }
    let rows = query
        .fetch_all(pool)
        .await
        .context("querying region/category counts")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let label: String = row.try_get("category")?;
        let Ok(category) = label.parse::<RedListCategory>() else {
            warn!(category = %label, "skipping unrecognised red list category");
            continue;
        };
        out.push(RegionCategoryCount {
            region: row.try_get("region")?,
            category,
            species_count: row.try_get("species_count")?,
        });
    }
    out.sort_by(|a, b| a.region.cmp(&b.region).then(b.category.cmp(&a.category)));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{load_batch, BatchCursor, Candidate};
    use crate::schema::migrate_to_normalized_schema;
    use crate::schema::tests::test_pool;
    use ecoalert_core::{ClimateAnomaly, SpeciesObservation, WeatherObservation};

    fn weather(location: i64, day: u32, temperature: f64, wind_speed: Option<f64>) -> Candidate {
        Candidate::Weather(WeatherObservation {
            location_id: LocationId(location),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            temperature,
            humidity: 50.0,
            precipitation: 0.0,
            wind_speed,
        })
    }

    fn species(name: &str, category: &str, location: i64) -> Candidate {
        Candidate::Species(SpeciesObservation {
            species_key: name.into(),
            population_status: "Decreasing".into(),
            red_list_category: category.into(),
            location_id: LocationId(location),
        })
    }

    fn climate(year: i32, anomaly: f64, location: i64) -> Candidate {
        Candidate::Climate(ClimateAnomaly {
            region: "africa".into(),
            year,
            anomaly,
            location_id: LocationId(location),
        })
    }

    async fn seeded_pool() -> (tempfile::TempDir, SqlitePool) {
        let (dir, pool) = test_pool().await;
        let batch = vec![
            weather(4, 1, 20.0, Some(10.0)),
            weather(4, 2, 24.0, None),
            weather(8, 1, 18.0, None),
            weather(8, 3, 19.5, Some(4.0)),
            species("Leopard", "Vulnerable", 4),
            species("Leopard", "Vulnerable", 8),
            species("African Elephant", "Endangered", 4),
            species("Dodo", "Extinct", 20),
            species("House Sparrow", "Least Concern", 8),
            climate(2019, 3.0, 4),
            climate(2021, 1.0, 4),
            climate(2024, 2.0, 4),
            climate(2012, 0.7, 8),
        ];
        load_batch(&pool, &batch, BatchCursor::start(), 100).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn summaries_average_recent_years_only() {
        let (_dir, pool) = seeded_pool().await;
        let summaries = location_summaries(&pool, DEFAULT_RECENT_YEAR).await.unwrap();
        assert_eq!(summaries.len(), 2);

        let cape_town = &summaries[0];
        assert_eq!(cape_town.name, "Cape Town");
        assert_eq!(cape_town.avg_temperature, Some(22.0));
        assert_eq!(cape_town.species_count, 2);
        assert_eq!(cape_town.recent_anomaly, Some(1.5));
        assert_eq!(cape_town.avg_wind_speed, Some(10.0));
    }

    #[tokio::test]
    async fn missing_recent_anomaly_displays_as_zero() {
        let (_dir, pool) = seeded_pool().await;
        let summaries = location_summaries(&pool, DEFAULT_RECENT_YEAR).await.unwrap();
        let nairobi = summaries.iter().find(|s| s.location_id == LocationId(8)).unwrap();
        assert_eq!(nairobi.recent_anomaly, None);
        assert_eq!(nairobi.display_recent_anomaly(), 0.0);
        assert_eq!(nairobi.avg_wind_speed, Some(4.0));
    }

    #[tokio::test]
    async fn latest_weather_keeps_one_row_per_species() {
        let (_dir, pool) = seeded_pool().await;
        let rows = latest_weather_per_species(&pool, 25).await.unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.species.as_str()).collect();
        assert_eq!(names, vec!["African Elephant", "House Sparrow", "Leopard"]);

        let leopard = &rows[2];
        assert_eq!(leopard.location_id, LocationId(8));
        assert_eq!(leopard.date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        assert_eq!(leopard.red_list_category.as_deref(), Some("Vulnerable"));
    }

    #[tokio::test]
    async fn region_counts_respect_threshold_in_both_shapes() {
        let (_dir, pool) = seeded_pool().await;
        let legacy = region_category_counts(&pool, RedListCategory::Vulnerable).await.unwrap();

        migrate_to_normalized_schema(&pool).await.unwrap();
        let normalized = region_category_counts(&pool, RedListCategory::Vulnerable).await.unwrap();
        assert_eq!(legacy, normalized);

        let africa: Vec<_> = normalized
            .iter()
            .filter(|c| c.region == "africa")
            .map(|c| (c.category, c.species_count))
            .collect();
        assert_eq!(
            africa,
            vec![
                (RedListCategory::Extinct, 1),
                (RedListCategory::Endangered, 1),
                (RedListCategory::Vulnerable, 1),
            ]
        );
        assert!(normalized.iter().all(|c| c.category >= RedListCategory::Vulnerable));
    }

    #[tokio::test]
    async fn empty_store_yields_no_summaries() {
        let (_dir, pool) = test_pool().await;
        assert!(location_summaries(&pool, 2020).await.unwrap().is_empty());
        assert!(latest_weather_per_species(&pool, 5).await.unwrap().is_empty());
    }
}
