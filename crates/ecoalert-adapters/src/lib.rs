//! Record sources: parsers for climate-anomaly and species-assessment snapshots.
//!
//! Snapshots are either the JSON dumps written by the scraping step or the saved
//! HTML pages themselves. Browser automation stays outside this crate.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use ecoalert_core::{ClimateRecord, SpeciesRecord};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ecoalert-adapters";

/// Default when a species card omits its population trend.
pub const UNKNOWN_POPULATION_STATUS: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotFormat {
    Json,
    Html,
}

impl SnapshotFormat {
    pub fn from_path(path: &Path) -> Result<Self, AdapterError> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => Ok(SnapshotFormat::Json),
            Some("html") | Some("htm") => Ok(SnapshotFormat::Html),
            _ => Err(AdapterError::Message(format!(
                "cannot infer snapshot format from {}",
                path.display()
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub format: SnapshotFormat,
    pub text: String,
}

impl Snapshot {
    pub fn from_text(path: impl Into<PathBuf>, format: SnapshotFormat, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            format,
            text: text.into(),
        }
    }

    /// File stem, used as the region of a single-region climate page.
    pub fn stem(&self) -> Option<&str> {
        self.path.file_stem().and_then(|s| s.to_str())
    }
}

pub fn load_snapshot(path: impl AsRef<Path>) -> anyhow::Result<Snapshot> {
    let path = path.as_ref();
    let format = SnapshotFormat::from_path(path)?;
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(Snapshot {
        path: path.to_path_buf(),
        format,
        text,
    })
}

/// A source entry that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejected {
    pub position: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBatch<T> {
    pub records: Vec<T>,
    pub rejected: Vec<Rejected>,
}

impl<T> Default for ParsedBatch<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl<T> ParsedBatch<T> {
    fn reject(&mut self, position: usize, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(position, reason = %reason, "rejected source entry");
        self.rejected.push(Rejected { position, reason });
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid json snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait SnapshotAdapter: Send + Sync {
    type Record;

    fn dataset(&self) -> &'static str;

    fn parse(&self, snapshot: &Snapshot) -> Result<ParsedBatch<Self::Record>, AdapterError>;
}

/// Yearly land+ocean temperature anomalies per broad region.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoaaClimateAdapter;

impl SnapshotAdapter for NoaaClimateAdapter {
    type Record = ClimateRecord;

    fn dataset(&self) -> &'static str {
        "noaa-climate"
    }

    fn parse(&self, snapshot: &Snapshot) -> Result<ParsedBatch<ClimateRecord>, AdapterError> {
        match snapshot.format {
            SnapshotFormat::Json => parse_noaa_dump(&snapshot.text),
            SnapshotFormat::Html => {
                let region = snapshot.stem().ok_or_else(|| {
                    AdapterError::Message(format!(
                        "climate page {} needs a region file name",
                        snapshot.path.display()
                    ))
                })?;
                parse_noaa_table(&snapshot.text, region)
            }
        }
    }
}

/// Species assessments from the red-list search results.
#[derive(Debug, Clone, Copy, Default)]
pub struct IucnSpeciesAdapter;

impl SnapshotAdapter for IucnSpeciesAdapter {
    type Record = SpeciesRecord;

    fn dataset(&self) -> &'static str {
        "iucn-species"
    }

    fn parse(&self, snapshot: &Snapshot) -> Result<ParsedBatch<SpeciesRecord>, AdapterError> {
        match snapshot.format {
            SnapshotFormat::Json => parse_iucn_dump(&snapshot.text),
            SnapshotFormat::Html => parse_iucn_cards(&snapshot.text),
        }
    }
}

fn json_i32(value: &JsonValue) -> Option<i32> {
    match value {
        JsonValue::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `[[region, year, anomaly], ...]`; year and anomaly may be strings or numbers.
pub fn parse_noaa_dump(text: &str) -> Result<ParsedBatch<ClimateRecord>, AdapterError> {
    let rows: Vec<JsonValue> = serde_json::from_str(text)?;
    let mut batch = ParsedBatch::default();

    for (position, row) in rows.iter().enumerate() {
        let Some([region, year, anomaly]) = row.as_array().map(Vec::as_slice).and_then(|r| <&[JsonValue; 3]>::try_from(r).ok()) else {
            batch.reject(position, "expected [region, year, anomaly]");
            continue;
        };
        let Some(region) = region.as_str().map(str::trim).filter(|r| !r.is_empty()) else {
            batch.reject(position, "missing region");
            continue;
        };
        let Some(year) = json_i32(year) else {
            batch.reject(position, format!("unparseable year {year}"));
            continue;
        };
        let Some(anomaly) = json_f64(anomaly) else {
            batch.reject(position, format!("unparseable anomaly {anomaly}"));
            continue;
        };
        batch.records.push(ClimateRecord {
            region: region.to_string(),
            year,
            anomaly,
        });
    }

    Ok(batch)
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn all_texts(scope: ElementRef<'_>, sel: &Selector) -> Vec<String> {
    scope
        .select(sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect()
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Single-region time-series table. Rows without data cells (the header) are
/// skipped silently.
pub fn parse_noaa_table(html: &str, region: &str) -> Result<ParsedBatch<ClimateRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector(r#"tr[role="row"]"#)?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a")?;
    let mut batch = ParsedBatch::default();

    for (position, row) in document.select(&row_sel).enumerate() {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        if cells.is_empty() {
            continue;
        }
        let Some(year) = first_text(row, &link_sel).and_then(|y| y.parse::<i32>().ok()) else {
            batch.reject(position, "row has no year link");
            continue;
        };
        let Some(anomaly) = cells
            .get(1)
            .and_then(|cell| cell.value().attr("data-sortval"))
            .and_then(|v| v.trim().parse::<f64>().ok())
        else {
            batch.reject(position, format!("no numeric anomaly for {year}"));
            continue;
        };
        batch.records.push(ClimateRecord {
            region: region.to_string(),
            year,
            anomaly,
        });
    }

    Ok(batch)
}

#[derive(Debug, Deserialize)]
struct IucnDumpEntry {
    #[serde(rename = "Common Name", default)]
    common_name: String,
    #[serde(rename = "Population Status", default)]
    population_status: Option<String>,
    #[serde(rename = "Red List Category")]
    red_list_category: String,
    #[serde(rename = "Location")]
    location: String,
}

/// `{scientific_name: {"Common Name", "Population Status", "Red List Category", "Location"}}`
/// in file order.
pub fn parse_iucn_dump(text: &str) -> Result<ParsedBatch<SpeciesRecord>, AdapterError> {
    let entries: serde_json::Map<String, JsonValue> = serde_json::from_str(text)?;
    let mut batch = ParsedBatch::default();

    for (position, (scientific_name, value)) in entries.into_iter().enumerate() {
        let entry: IucnDumpEntry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(err) => {
                batch.reject(position, format!("{scientific_name}: {err}"));
                continue;
            }
        };
        batch.records.push(SpeciesRecord {
            scientific_name: scientific_name.trim().to_string(),
            common_name: entry.common_name.trim().to_string(),
            population_status: entry
                .population_status
                .and_then(text_or_none)
                .unwrap_or_else(|| UNKNOWN_POPULATION_STATUS.to_string()),
            red_list_category: entry.red_list_category.trim().to_string(),
            assessment_region: assessment_region(&entry.location),
        });
    }

    Ok(batch)
}

/// Scope text looks like "Western Africa, 2020"; only the first part names a place.
fn assessment_region(scope: &str) -> String {
    scope.split(", ").next().unwrap_or_default().trim().to_string()
}

/// Search-result cards. Every field is read from inside its own card, and a card
/// must carry exactly one scientific name; anything else is rejected rather than
/// paired positionally with a neighbour's fields.
pub fn parse_iucn_cards(html: &str) -> Result<ParsedBatch<SpeciesRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = selector("li.list-results__item")?;
    let title_sel = selector("h2.list-results__title")?;
    let subtitle_sel = selector("p.list-results__subtitle")?;
    let population_sel = selector("span.species-population")?;
    let category_sel = selector("a.species-category")?;
    let assessment_sel = selector("span.species-assessment")?;

    let mut batch: ParsedBatch<SpeciesRecord> = ParsedBatch::default();

    for (position, card) in document.select(&card_sel).enumerate() {
        let common_name = first_text(card, &title_sel).unwrap_or_default();

        let mut scientific = all_texts(card, &subtitle_sel);
        scientific.dedup();
        let scientific_name = match scientific.as_slice() {
            [name] => name.clone(),
            [] => {
                batch.reject(position, format!("card {common_name:?} has no scientific name"));
                continue;
            }
            names => {
                batch.reject(
                    position,
                    format!("card {common_name:?} has {} scientific names", names.len()),
                );
                continue;
            }
        };

        if batch
            .records
            .iter()
            .any(|r| r.scientific_name == scientific_name)
        {
            batch.reject(position, format!("duplicate scientific name {scientific_name:?}"));
            continue;
        }

        let Some(red_list_category) = first_attr(card, &category_sel, "title") else {
            batch.reject(position, format!("{scientific_name}: missing red list category"));
            continue;
        };
        let Some(scope) = first_text(card, &assessment_sel) else {
            batch.reject(position, format!("{scientific_name}: missing assessment scope"));
            continue;
        };

        batch.records.push(SpeciesRecord {
            scientific_name,
            common_name,
            population_status: first_text(card, &population_sel)
                .unwrap_or_else(|| UNKNOWN_POPULATION_STATUS.to_string()),
            red_list_category,
            assessment_region: assessment_region(&scope),
        });
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(rel: &str) -> PathBuf {
        workspace_root().join("fixtures").join(rel)
    }

    #[test]
    fn noaa_dump_accepts_strings_and_numbers() {
        let batch = parse_noaa_dump(r#"[["globe", "2020", "0.98"], ["africa", 2024, 1.64]]"#).unwrap();
        assert_eq!(
            batch.records,
            vec![
                ClimateRecord { region: "globe".into(), year: 2020, anomaly: 0.98 },
                ClimateRecord { region: "africa".into(), year: 2024, anomaly: 1.64 },
            ]
        );
        assert!(batch.rejected.is_empty());
    }

    #[test]
    fn noaa_dump_rejects_malformed_rows_without_failing() {
        let batch = parse_noaa_dump(r#"[["globe", "x", "1"], ["globe"], ["", "2020", "1"], ["globe", "2021", "0.5"]]"#).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(
            batch.rejected.iter().map(|r| r.position).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn noaa_table_uses_file_stem_as_region() {
        let snapshot = load_snapshot(fixture("noaa/africa.html")).unwrap();
        let batch = NoaaClimateAdapter.parse(&snapshot).unwrap();
        assert_eq!(batch.records.len(), 4);
        assert!(batch.records.iter().all(|r| r.region == "africa"));
        assert_eq!(batch.records[1], ClimateRecord { region: "africa".into(), year: 2020, anomaly: 1.22 });
        assert_eq!(batch.rejected.len(), 1);
        assert!(batch.rejected[0].reason.contains("2022"));
    }

    #[test]
    fn iucn_dump_keeps_file_order() {
        let snapshot = load_snapshot(fixture("iucn/iucn_data.json")).unwrap();
        let batch = IucnSpeciesAdapter.parse(&snapshot).unwrap();
        let names: Vec<_> = batch.records.iter().map(|r| r.scientific_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Loxodonta africana",
                "Panthera pardus",
                "Diceros bicornis",
                "Chelonia mydas",
                "Phalacrocorax nigrogularis",
                "Pongo abelii",
            ]
        );
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.records[5].species_key(), "Pongo abelii");
    }

    #[test]
    fn iucn_cards_validate_scientific_name_pairing() {
        let snapshot = load_snapshot(fixture("iucn/search.html")).unwrap();
        let batch = IucnSpeciesAdapter.parse(&snapshot).unwrap();

        let names: Vec<_> = batch.records.iter().map(|r| r.scientific_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Loxodonta africana", "Panthera pardus", "Phalacrocorax nigrogularis"]
        );

        let elephant = &batch.records[0];
        assert_eq!(elephant.common_name, "African Elephant");
        assert_eq!(elephant.red_list_category, "Endangered");
        assert_eq!(elephant.population_status, "Decreasing");
        assert_eq!(elephant.assessment_region, "Pan-Africa");
        assert_eq!(batch.records[2].assessment_region, "Persian Gulf");

        let reasons: Vec<_> = batch.rejected.iter().map(|r| r.reason.as_str()).collect();
        assert_eq!(reasons.len(), 3);
        assert!(reasons[0].contains("no scientific name"));
        assert!(reasons[1].contains("2 scientific names"));
        assert!(reasons[2].contains("duplicate"));
    }

    #[test]
    fn format_is_inferred_from_extension() {
        assert_eq!(SnapshotFormat::from_path(Path::new("a/b.JSON")).unwrap(), SnapshotFormat::Json);
        assert_eq!(SnapshotFormat::from_path(Path::new("globe.htm")).unwrap(), SnapshotFormat::Html);
        assert!(SnapshotFormat::from_path(Path::new("data.csv")).is_err());
    }
}
