//! Location reference data and key reconciliation.
//!
//! Three independent key spaces meet here: forecast-provider location keys,
//! free-text place names, and the region vocabulary used by species assessments.
//! Everything resolves to a [`LocationId`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use strsim::jaro_winkler;
use thiserror::Error;

use crate::{Location, LocationId};

const REFERENCE_CATALOG: &str = include_str!("../reference_catalog.yaml");

/// Minimum similarity for a label to be reported as a near miss.
const NEAREST_HINT_THRESHOLD: f64 = 0.8;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("reading catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing catalog: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate location id {0}")]
    DuplicateId(LocationId),
    #[error("duplicate location name {0:?}")]
    DuplicateName(String),
    #[error("duplicate weather key {0:?}")]
    DuplicateWeatherKey(String),
    #[error("region {region:?} lists unknown place {place:?}")]
    UnknownMember { region: String, place: String },
    #[error("external label {label:?} points at unknown region {region:?}")]
    UnknownRegion { label: String, region: String },
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    locations: Vec<Location>,
    #[serde(default)]
    regions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    external_regions: BTreeMap<String, String>,
}

/// Outcome of reconciling one external label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The label names a broad region; one row per member place.
    Region {
        region: String,
        locations: Vec<LocationId>,
    },
    /// The label matched a single place by substring containment.
    Place { name: String, location: LocationId },
    Unresolved {
        label: String,
        nearest: Option<String>,
    },
}

impl Resolution {
    pub fn locations(&self) -> &[LocationId] {
        match self {
            Resolution::Region { locations, .. } => locations,
            Resolution::Place { location, .. } => std::slice::from_ref(location),
            Resolution::Unresolved { .. } => &[],
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Resolution::Unresolved { .. })
    }
}

/// Immutable lookup tables, built once at startup.
#[derive(Debug, Clone)]
pub struct LocationCatalog {
    locations: Vec<Location>,
    by_name: HashMap<String, LocationId>,
    by_weather_key: HashMap<String, LocationId>,
    regions: BTreeMap<String, Vec<LocationId>>,
    external_regions: BTreeMap<String, String>,
}

impl LocationCatalog {
    /// The twenty reference places shipped with the crate.
    pub fn reference() -> Result<Self, CatalogError> {
        Self::from_yaml_str(REFERENCE_CATALOG)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_yaml::from_str(text)?;
        Self::build(file)
    }

    fn build(file: CatalogFile) -> Result<Self, CatalogError> {
        let mut ids = HashSet::new();
        let mut by_name = HashMap::new();
        let mut by_weather_key = HashMap::new();

        for location in &file.locations {
            if !ids.insert(location.id) {
                return Err(CatalogError::DuplicateId(location.id));
            }
            if by_name.insert(location.name.clone(), location.id).is_some() {
                return Err(CatalogError::DuplicateName(location.name.clone()));
            }
            if let Some(key) = &location.weather_key {
                if by_weather_key.insert(key.clone(), location.id).is_some() {
                    return Err(CatalogError::DuplicateWeatherKey(key.clone()));
                }
            }
        }

        let mut regions = BTreeMap::new();
        for (region, members) in &file.regions {
            let mut ids = Vec::with_capacity(members.len());
            for place in members {
                let id = by_name
                    .get(place)
                    .copied()
                    .ok_or_else(|| CatalogError::UnknownMember {
                        region: region.clone(),
                        place: place.clone(),
                    })?;
                ids.push(id);
            }
            regions.insert(region.clone(), ids);
        }

        for (label, region) in &file.external_regions {
            if !regions.contains_key(region) {
                return Err(CatalogError::UnknownRegion {
                    label: label.clone(),
                    region: region.clone(),
                });
            }
        }

        Ok(Self {
            locations: file.locations,
            by_name,
            by_weather_key,
            regions,
            external_regions: file.external_regions,
        })
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn location(&self, id: LocationId) -> Option<&Location> {
        self.locations.iter().find(|l| l.id == id)
    }

    pub fn id_for_place(&self, name: &str) -> Option<LocationId> {
        self.by_name.get(name).copied()
    }

    pub fn id_for_weather_key(&self, key: &str) -> Option<LocationId> {
        self.by_weather_key.get(key).copied()
    }

    /// Locations that have a forecast feed, in catalog order.
    pub fn weather_locations(&self) -> impl Iterator<Item = (&str, LocationId)> {
        self.locations
            .iter()
            .filter_map(|l| l.weather_key.as_deref().map(|key| (key, l.id)))
    }

    pub fn regions(&self) -> impl Iterator<Item = (&str, &[LocationId])> {
        self.regions
            .iter()
            .map(|(name, members)| (name.as_str(), members.as_slice()))
    }

    /// Broad regions a location belongs to.
    pub fn region_tags(&self, id: LocationId) -> Vec<&str> {
        self.regions
            .iter()
            .filter(|(_, members)| members.contains(&id))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Members of a broad region named by the climate source.
    pub fn resolve_climate_region(&self, region: &str) -> Option<(&str, &[LocationId])> {
        if let Some((name, members)) = self.regions.get_key_value(region) {
            return Some((name.as_str(), members.as_slice()));
        }
        self.regions
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(region))
            .map(|(name, members)| (name.as_str(), members.as_slice()))
    }

    /// Resolve a species-assessment scope label.
    ///
    /// Vocabulary labels fan out to every member of their region. A label that is
    /// unknown, or whose region has no members, falls back to the first place whose
    /// name contains it.
    pub fn resolve_species_label(&self, label: &str) -> Resolution {
        let label = label.trim();
        if label.is_empty() {
            return Resolution::Unresolved {
                label: String::new(),
                nearest: None,
            };
        }

        if let Some(region) = self.external_regions.get(label) {
            let members = self.regions.get(region).cloned().unwrap_or_default();
            if !members.is_empty() {
                return Resolution::Region {
                    region: region.clone(),
                    locations: members,
                };
            }
        }

        if let Some(place) = self.locations.iter().find(|l| l.name.contains(label)) {
            return Resolution::Place {
                name: place.name.clone(),
                location: place.id,
            };
        }

        Resolution::Unresolved {
            label: label.to_string(),
            nearest: self.nearest_label(label),
        }
    }

    fn nearest_label(&self, label: &str) -> Option<String> {
        self.locations
            .iter()
            .map(|l| l.name.as_str())
            .chain(self.external_regions.keys().map(String::as_str))
            .map(|candidate| (candidate, jaro_winkler(label, candidate)))
            .filter(|(_, score)| *score >= NEAREST_HINT_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(candidate, _)| candidate.to_string())
    }
}
