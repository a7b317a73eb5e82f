//! SQLite layout, reference seeding and the legacy to normalized migration.
//!
//! `species` and `climate` exist in two shapes. The legacy shape stores text
//! values inline; the normalized shape factors them into append-only lookup
//! tables. Both are readable and writable by the loader and the queries.

use std::str::FromStr;

use anyhow::{Context, Result};
use ecoalert_core::LocationCatalog;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

const CREATE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS locations (
        id          INTEGER PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        weather_key TEXT UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS location_regions (
        location_id INTEGER NOT NULL REFERENCES locations(id),
        region      TEXT NOT NULL,
        UNIQUE (location_id, region)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS weather (
        weather_id    INTEGER PRIMARY KEY AUTOINCREMENT,
        location_id   INTEGER NOT NULL REFERENCES locations(id),
        date          TEXT NOT NULL,
        temperature   REAL NOT NULL,
        humidity      REAL NOT NULL,
        precipitation REAL NOT NULL,
        UNIQUE (location_id, date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS weather_details (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        location_id INTEGER NOT NULL REFERENCES locations(id),
        date        TEXT NOT NULL,
        wind_speed  REAL,
        UNIQUE (location_id, date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS climate (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        region       TEXT NOT NULL,
        year         INTEGER NOT NULL,
        temp_anomaly REAL,
        location_id  INTEGER NOT NULL REFERENCES locations(id),
        UNIQUE (region, year, location_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS species (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        common_name       TEXT NOT NULL,
        population_status TEXT,
        red_list_category TEXT,
        location_id       INTEGER NOT NULL REFERENCES locations(id),
        UNIQUE (common_name, location_id)
    )
    "#,
    "CREATE TABLE IF NOT EXISTS noaa_regions (id INTEGER PRIMARY KEY AUTOINCREMENT, region TEXT NOT NULL UNIQUE)",
    "CREATE TABLE IF NOT EXISTS population_status (id INTEGER PRIMARY KEY AUTOINCREMENT, status TEXT NOT NULL UNIQUE)",
    "CREATE TABLE IF NOT EXISTS red_list_cat (id INTEGER PRIMARY KEY AUTOINCREMENT, red_list_category TEXT NOT NULL UNIQUE)",
    "CREATE TABLE IF NOT EXISTS species_names (id INTEGER PRIMARY KEY AUTOINCREMENT, common_name TEXT NOT NULL UNIQUE)",
];

const FILL_LOOKUPS: &[&str] = &[
    "INSERT OR IGNORE INTO noaa_regions (region) SELECT DISTINCT region FROM climate WHERE region IS NOT NULL ORDER BY region",
    "INSERT OR IGNORE INTO population_status (status) SELECT DISTINCT population_status FROM species WHERE population_status IS NOT NULL ORDER BY population_status",
    "INSERT OR IGNORE INTO red_list_cat (red_list_category) SELECT DISTINCT red_list_category FROM species WHERE red_list_category IS NOT NULL ORDER BY red_list_category",
    "INSERT OR IGNORE INTO species_names (common_name) SELECT DISTINCT common_name FROM species ORDER BY common_name",
];

const CREATE_SPECIES_NEW: &str = r#"
    CREATE TABLE species_new (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        species_name_key      INTEGER NOT NULL REFERENCES species_names(id),
        population_status_key INTEGER REFERENCES population_status(id),
        red_list_key          INTEGER REFERENCES red_list_cat(id),
        location_id           INTEGER NOT NULL REFERENCES locations(id),
        UNIQUE (species_name_key, location_id)
    )
"#;

const COPY_SPECIES: &str = r#"
    INSERT INTO species_new (id, species_name_key, population_status_key, red_list_key, location_id)
    SELECT s.id, sn.id, ps.id, rl.id, s.location_id
      FROM species s
      JOIN species_names sn ON sn.common_name = s.common_name
      LEFT JOIN population_status ps ON ps.status = s.population_status
      LEFT JOIN red_list_cat rl ON rl.red_list_category = s.red_list_category
"#;

const CREATE_CLIMATE_NEW: &str = r#"
    CREATE TABLE climate_new (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        geo_key      INTEGER NOT NULL REFERENCES noaa_regions(id),
        year         INTEGER NOT NULL,
        temp_anomaly REAL,
        location_id  INTEGER NOT NULL REFERENCES locations(id),
        UNIQUE (geo_key, year, location_id)
    )
"#;

const COPY_CLIMATE: &str = r#"
    INSERT INTO climate_new (id, geo_key, year, temp_anomaly, location_id)
    SELECT c.id, r.id, c.year, c.temp_anomaly, c.location_id
      FROM climate c
      JOIN noaa_regions r ON r.region = c.region
"#;

const SWAP_TABLES: &[&str] = &[
    "DROP TABLE species",
    "ALTER TABLE species_new RENAME TO species",
    "DROP TABLE climate",
    "ALTER TABLE climate_new RENAME TO climate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchemaShape {
    Legacy,
    Normalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationOutcome {
    AlreadyNormalized,
    Migrated { species_rows: u64, climate_rows: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeciesSample {
    pub species: String,
    pub population_status: Option<String>,
    pub red_list_category: Option<String>,
    pub location_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateSample {
    pub region: String,
    pub year: i64,
    pub temp_anomaly: Option<f64>,
    pub location_id: i64,
}

/// Column layout plus a few joined rows of the two migrated tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaReport {
    pub shape: SchemaShape,
    pub species_columns: Vec<String>,
    pub climate_columns: Vec<String>,
    pub species_sample: Vec<SpeciesSample>,
    pub climate_sample: Vec<ClimateSample>,
}

/// Single-connection pool: the loader is the only writer.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("opening {database_url}"))
}

async fn create_tables(conn: &mut SqliteConnection) -> Result<()> {
    for statement in CREATE_TABLES {
        sqlx::query(statement)
            .execute(&mut *conn)
            .await
            .context("creating tables")?;
    }
    Ok(())
}

/// Creates any missing table and seeds the catalog's places and region tags.
pub async fn ensure_schema(pool: &SqlitePool, catalog: &LocationCatalog) -> Result<()> {
    let mut tx = pool.begin().await.context("starting schema transaction")?;
    create_tables(&mut tx).await?;

    for location in catalog.locations() {
        sqlx::query("INSERT OR IGNORE INTO locations (id, name, weather_key) VALUES (?1, ?2, ?3)")
            .bind(location.id.0)
            .bind(&location.name)
            .bind(location.weather_key.as_deref())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("seeding location {}", location.name))?;
    }

    for (region, members) in catalog.regions() {
        for id in members {
            sqlx::query("INSERT OR IGNORE INTO location_regions (location_id, region) VALUES (?1, ?2)")
                .bind(id.0)
                .bind(region)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("tagging location {id} with {region}"))?;
        }
    }

    tx.commit().await.context("committing schema")?;
    debug!(locations = catalog.locations().len(), "schema ready");
    Ok(())
}

pub async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
        .bind(table)
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("inspecting columns of {table}"))?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("name").map_err(Into::into))
        .collect()
}

pub async fn detect_shape(conn: &mut SqliteConnection) -> Result<SchemaShape> {
    let columns = table_columns(conn, "species").await?;
    let normalized = ["species_name_key", "population_status_key"]
        .iter()
        .all(|wanted| columns.iter().any(|c| c == wanted));
    Ok(if normalized {
        SchemaShape::Normalized
    } else {
        SchemaShape::Legacy
    })
}

/// Rewrites `species` and `climate` to reference the lookup tables. Runs as one
/// transaction, so a failure leaves the legacy tables untouched.
pub async fn migrate_to_normalized_schema(pool: &SqlitePool) -> Result<MigrationOutcome> {
    let mut tx = pool.begin().await.context("starting migration")?;
    create_tables(&mut tx).await?;

    if detect_shape(&mut tx).await? == SchemaShape::Normalized {
        debug!("species table already normalized");
        return Ok(MigrationOutcome::AlreadyNormalized);
    }

    for statement in FILL_LOOKUPS {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .context("filling lookup tables")?;
    }

    sqlx::query(CREATE_SPECIES_NEW)
        .execute(&mut *tx)
        .await
        .context("creating species_new")?;
    let species_rows = sqlx::query(COPY_SPECIES)
        .execute(&mut *tx)
        .await
        .context("copying species rows")?
        .rows_affected();

    sqlx::query(CREATE_CLIMATE_NEW)
        .execute(&mut *tx)
        .await
        .context("creating climate_new")?;
    let climate_rows = sqlx::query(COPY_CLIMATE)
        .execute(&mut *tx)
        .await
        .context("copying climate rows")?
        .rows_affected();

    for statement in SWAP_TABLES {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("running {statement}"))?;
    }

    tx.commit().await.context("committing migration")?;
    info!(species_rows, climate_rows, "migrated to normalized schema");
    Ok(MigrationOutcome::Migrated {
        species_rows,
        climate_rows,
    })
}

const SAMPLE_LIMIT: i64 = 5;

pub async fn verify_migration(pool: &SqlitePool) -> Result<SchemaReport> {
    let mut conn = pool.acquire().await.context("acquiring connection")?;
    let shape = detect_shape(&mut conn).await?;
    let species_columns = table_columns(&mut conn, "species").await?;
    let climate_columns = table_columns(&mut conn, "climate").await?;

    let (species_sql, climate_sql) = match shape {
        SchemaShape::Normalized => (
            r#"
            SELECT sn.common_name AS species, ps.status AS population_status,
                   rl.red_list_category AS red_list_category, s.location_id AS location_id
              FROM species s
              JOIN species_names sn ON sn.id = s.species_name_key
              LEFT JOIN population_status ps ON ps.id = s.population_status_key
              LEFT JOIN red_list_cat rl ON rl.id = s.red_list_key
             ORDER BY s.id
             LIMIT ?1
            "#,
            r#"
            SELECT r.region AS region, c.year AS year, c.temp_anomaly AS temp_anomaly,
                   c.location_id AS location_id
              FROM climate c
              JOIN noaa_regions r ON r.id = c.geo_key
             ORDER BY c.id
             LIMIT ?1
            "#,
        ),
        SchemaShape::Legacy => (
            r#"
            SELECT common_name AS species, population_status, red_list_category, location_id
              FROM species
             ORDER BY id
             LIMIT ?1
            "#,
            r#"
            SELECT region, year, temp_anomaly, location_id
              FROM climate
             ORDER BY id
             LIMIT ?1
            "#,
        ),
    };

    let species_sample = sqlx::query(species_sql)
        .bind(SAMPLE_LIMIT)
        .fetch_all(&mut *conn)
        .await
        .context("sampling species")?
        .into_iter()
        .map(|row| {
            Ok(SpeciesSample {
                species: row.try_get("species")?,
                population_status: row.try_get("population_status")?,
                red_list_category: row.try_get("red_list_category")?,
                location_id: row.try_get("location_id")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

    let climate_sample = sqlx::query(climate_sql)
        .bind(SAMPLE_LIMIT)
        .fetch_all(&mut *conn)
        .await
        .context("sampling climate")?
        .into_iter()
        .map(|row| {
            Ok(ClimateSample {
                region: row.try_get("region")?,
                year: row.try_get("year")?,
                temp_anomaly: row.try_get("temp_anomaly")?,
                location_id: row.try_get("location_id")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

    Ok(SchemaReport {
        shape,
        species_columns,
        climate_columns,
        species_sample,
        climate_sample,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn test_pool() -> (TempDir, SqlitePool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("ecoalert.db").display());
        let pool = connect(&url).await.expect("pool");
        let catalog = LocationCatalog::reference().expect("catalog");
        ensure_schema(&pool, &catalog).await.expect("schema");
        (dir, pool)
    }

    async fn seed_legacy_rows(pool: &SqlitePool) {
        for (name, status, category, location) in [
            ("Leopard", "Decreasing", "Vulnerable", 4),
            ("Leopard", "Decreasing", "Vulnerable", 8),
            ("African Elephant", "Decreasing", "Endangered", 20),
        ] {
            sqlx::query(
                "INSERT INTO species (common_name, population_status, red_list_category, location_id) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(name)
            .bind(status)
            .bind(category)
            .bind(location)
            .execute(pool)
            .await
            .unwrap();
        }
        for (region, year, anomaly, location) in [("africa", 2020, 1.22, 4), ("globe", 2024, 1.29, 4)] {
            sqlx::query("INSERT INTO climate (region, year, temp_anomaly, location_id) VALUES (?1, ?2, ?3, ?4)")
                .bind(region)
                .bind(year)
                .bind(anomaly)
                .bind(location)
                .execute(pool)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent_and_seeds_catalog() {
        let (_dir, pool) = test_pool().await;
        let catalog = LocationCatalog::reference().unwrap();
        ensure_schema(&pool, &catalog).await.unwrap();

        let locations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM locations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(locations, 20);
        let africa: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM location_regions WHERE region = 'africa'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(africa, 3);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(detect_shape(&mut conn).await.unwrap(), SchemaShape::Legacy);
    }

    #[tokio::test]
    async fn migration_moves_values_into_lookups() {
        let (_dir, pool) = test_pool().await;
        seed_legacy_rows(&pool).await;

        let outcome = migrate_to_normalized_schema(&pool).await.unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                species_rows: 3,
                climate_rows: 2
            }
        );

        let names: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM species_names")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(names, 2);

        let report = verify_migration(&pool).await.unwrap();
        assert_eq!(report.shape, SchemaShape::Normalized);
        assert!(report.species_columns.contains(&"species_name_key".to_string()));
        assert!(report.climate_columns.contains(&"geo_key".to_string()));
        assert!(!report.climate_columns.contains(&"region".to_string()));
        assert_eq!(report.species_sample.len(), 3);
        assert_eq!(report.species_sample[2].species, "African Elephant");
        assert_eq!(report.species_sample[2].red_list_category.as_deref(), Some("Endangered"));
        assert_eq!(report.climate_sample[0].region, "africa");
    }

    #[tokio::test]
    async fn second_migration_is_a_no_op() {
        let (_dir, pool) = test_pool().await;
        seed_legacy_rows(&pool).await;
        migrate_to_normalized_schema(&pool).await.unwrap();

        assert_eq!(
            migrate_to_normalized_schema(&pool).await.unwrap(),
            MigrationOutcome::AlreadyNormalized
        );
        let species: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM species")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(species, 3);

        // ensure_schema must not resurrect legacy columns after migration.
        ensure_schema(&pool, &LocationCatalog::reference().unwrap()).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(detect_shape(&mut conn).await.unwrap(), SchemaShape::Normalized);
    }

    #[tokio::test]
    async fn failed_migration_leaves_legacy_tables_intact() {
        let (_dir, pool) = test_pool().await;
        seed_legacy_rows(&pool).await;
        // A leftover table makes CREATE TABLE species_new fail mid-migration.
        sqlx::query("CREATE TABLE species_new (id INTEGER)")
            .execute(&pool)
            .await
            .unwrap();

        assert!(migrate_to_normalized_schema(&pool).await.is_err());

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(detect_shape(&mut conn).await.unwrap(), SchemaShape::Legacy);
        let lookups: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM species_names")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(lookups, 0);
    }
}
