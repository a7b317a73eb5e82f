//! Core domain model and reference data for EcoAlert.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod catalog;

pub use catalog::{CatalogError, LocationCatalog, Resolution};

pub const CRATE_NAME: &str = "ecoalert-core";

/// Canonical integer id joining weather, species and climate rows for one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub i64);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    /// External weather-provider location key, when the place has a forecast feed.
    #[serde(default)]
    pub weather_key: Option<String>,
}

/// One day of a daily forecast, in the provider's wire shape.
///
/// The same shape is written to the on-disk forecast cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DailyForecast {
    pub date: String,
    pub temperature: TemperatureRange,
    #[serde(default)]
    pub day: DayPeriod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemperatureRange {
    pub maximum: Measurement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<Measurement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Measurement {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DayPeriod {
    #[serde(default)]
    pub has_precipitation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind: Option<Wind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Wind {
    pub speed: Measurement,
}

impl DailyForecast {
    /// Calendar date from the leading `YYYY-MM-DD` of the provider timestamp.
    pub fn calendar_date(&self) -> Option<NaiveDate> {
        let prefix = self.date.get(..10)?;
        NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
    }

    pub fn max_temperature(&self) -> f64 {
        self.temperature.maximum.value
    }

    pub fn wind_speed(&self) -> Option<f64> {
        self.day.wind.as_ref().map(|w| w.speed.value)
    }
}

/// Normalized weather row, one per (location, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub location_id: LocationId,
    pub date: NaiveDate,
    pub temperature: f64,
    pub humidity: f64,
    pub precipitation: f64,
    pub wind_speed: Option<f64>,
}

/// Region-level yearly anomaly as scraped, before fan-out to locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateRecord {
    pub region: String,
    pub year: i32,
    pub anomaly: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateAnomaly {
    pub region: String,
    pub year: i32,
    pub anomaly: f64,
    pub location_id: LocationId,
}

/// Species assessment as scraped, before reconciliation to locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesRecord {
    pub scientific_name: String,
    pub common_name: String,
    pub population_status: String,
    pub red_list_category: String,
    /// First entry of the assessment scope, e.g. "Global" or "Western Africa".
    pub assessment_region: String,
}

impl SpeciesRecord {
    /// Common name, or the scientific name when no common name was published.
    pub fn species_key(&self) -> &str {
        let common = self.common_name.trim();
        if common.is_empty() {
            self.scientific_name.trim()
        } else {
            common
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesObservation {
    pub species_key: String,
    pub population_status: String,
    pub red_list_category: String,
    pub location_id: LocationId,
}

/// IUCN red-list categories in increasing order of severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RedListCategory {
    NotEvaluated,
    DataDeficient,
    LeastConcern,
    NearThreatened,
    Vulnerable,
    Endangered,
    CriticallyEndangered,
    ExtinctInTheWild,
    Extinct,
}

impl RedListCategory {
    pub const ALL: [RedListCategory; 9] = [
        RedListCategory::NotEvaluated,
        RedListCategory::DataDeficient,
        RedListCategory::LeastConcern,
        RedListCategory::NearThreatened,
        RedListCategory::Vulnerable,
        RedListCategory::Endangered,
        RedListCategory::CriticallyEndangered,
        RedListCategory::ExtinctInTheWild,
        RedListCategory::Extinct,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RedListCategory::NotEvaluated => "Not Evaluated",
            RedListCategory::DataDeficient => "Data Deficient",
            RedListCategory::LeastConcern => "Least Concern",
            RedListCategory::NearThreatened => "Near Threatened",
            RedListCategory::Vulnerable => "Vulnerable",
            RedListCategory::Endangered => "Endangered",
            RedListCategory::CriticallyEndangered => "Critically Endangered",
            RedListCategory::ExtinctInTheWild => "Extinct in the Wild",
            RedListCategory::Extinct => "Extinct",
        }
    }

    /// Categories at or above `self` in severity.
    pub fn at_or_above(self) -> impl Iterator<Item = RedListCategory> {
        Self::ALL.into_iter().filter(move |c| *c >= self)
    }
}

impl fmt::Display for RedListCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown red list category: {0:?}")]
pub struct UnknownCategory(pub String);

impl FromStr for RedListCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_label(s);
        Self::ALL
            .into_iter()
            .find(|c| normalize_label(c.label()) == wanted)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

fn normalize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
