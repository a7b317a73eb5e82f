//! Turns source records into loader candidates through the location catalog.

use ecoalert_core::{
    ClimateAnomaly, ClimateRecord, DailyForecast, LocationCatalog, LocationId, RedListCategory,
    Resolution, SpeciesObservation, SpeciesRecord, WeatherObservation,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::loader::{Candidate, DEFAULT_HUMIDITY, FLAGGED_PRECIPITATION};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Staged {
    pub candidates: Vec<Candidate>,
    pub unresolved: Vec<UnresolvedRecord>,
}

/// A record whose place label matched nothing in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedRecord {
    pub record: String,
    pub label: String,
    pub nearest: Option<String>,
}

pub fn observation_from_forecast(location_id: LocationId, day: &DailyForecast) -> Option<WeatherObservation> {
    let date = day.calendar_date()?;
    Some(WeatherObservation {
        location_id,
        date,
        temperature: day.max_temperature(),
        humidity: DEFAULT_HUMIDITY,
        precipitation: if day.day.has_precipitation {
            FLAGGED_PRECIPITATION
        } else {
            0.0
        },
        wind_speed: day.wind_speed(),
    })
}

pub fn weather_candidates(location_id: LocationId, forecasts: &[DailyForecast]) -> Vec<Candidate> {
    forecasts
        .iter()
        .filter_map(|day| {
            let obs = observation_from_forecast(location_id, day);
            if obs.is_none() {
                warn!(location_id = %location_id, date = %day.date, "forecast day has no usable date");
            }
            obs
        })
        .map(Candidate::Weather)
        .collect()
}

/// One candidate per member place of the record's region.
pub fn climate_candidates(catalog: &LocationCatalog, records: &[ClimateRecord]) -> Staged {
    let mut staged = Staged::default();
    for record in records {
        let Some((region, members)) = catalog.resolve_climate_region(&record.region) else {
            warn!(region = %record.region, year = record.year, "unknown climate region");
            staged.unresolved.push(UnresolvedRecord {
                record: format!("{} {}", record.region, record.year),
                label: record.region.clone(),
                nearest: None,
            });
            continue;
        };
        if members.is_empty() {
            debug!(region, "climate region has no member places");
        }
        staged
            .candidates
            .extend(members.iter().map(|&location_id| {
                Candidate::Climate(ClimateAnomaly {
                    region: region.to_string(),
                    year: record.year,
                    anomaly: record.anomaly,
                    location_id,
                })
            }));
    }
    staged
}

/// One candidate per place the assessment scope resolves to. Known red-list
/// labels are stored in their canonical spelling.
pub fn species_candidates(catalog: &LocationCatalog, records: &[SpeciesRecord]) -> Staged {
    let mut staged = Staged::default();
    for record in records {
        let resolution = catalog.resolve_species_label(&record.assessment_region);
        if let Resolution::Unresolved { label, nearest } = &resolution {
            warn!(
                species = %record.scientific_name,
                label = %label,
                nearest = nearest.as_deref().unwrap_or("-"),
                "species scope matched no location"
            );
            staged.unresolved.push(UnresolvedRecord {
                record: record.scientific_name.clone(),
                label: label.clone(),
                nearest: nearest.clone(),
            });
            continue;
        }

        let category = record
            .red_list_category
            .parse::<RedListCategory>()
            .map(|c| c.label().to_string())
            .unwrap_or_else(|_| record.red_list_category.trim().to_string());

        staged
            .candidates
            .extend(resolution.locations().iter().map(|&location_id| {
                Candidate::Species(SpeciesObservation {
                    species_key: record.species_key().to_string(),
                    population_status: record.population_status.clone(),
                    red_list_category: category.clone(),
                    location_id,
                })
            }));
    }
    staged
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecoalert_core::{DayPeriod, Measurement, TemperatureRange};

    fn catalog() -> LocationCatalog {
        LocationCatalog::reference().unwrap()
    }

    fn record(name: &str, scope: &str, category: &str) -> SpeciesRecord {
        SpeciesRecord {
            scientific_name: name.into(),
            common_name: String::new(),
            population_status: "Decreasing".into(),
            red_list_category: category.into(),
            assessment_region: scope.into(),
        }
    }

    #[test]
    fn forecast_day_maps_to_documented_defaults() {
        let day = DailyForecast {
            date: "2024-01-01T07:00:00-03:00".into(),
            temperature: TemperatureRange {
                maximum: Measurement { value: 22.0, unit: Some("C".into()) },
                minimum: None,
            },
            day: DayPeriod {
                has_precipitation: true,
                wind: None,
            },
        };
        let obs = observation_from_forecast(LocationId(5), &day).unwrap();
        assert_eq!(obs.humidity, 50.0);
        assert_eq!(obs.precipitation, 50.0);
        assert_eq!(obs.temperature, 22.0);
        assert_eq!(obs.date.to_string(), "2024-01-01");

        let mut bad = day.clone();
        bad.date = "soon".into();
        assert_eq!(weather_candidates(LocationId(5), &[day, bad]).len(), 1);
    }

    #[test]
    fn broad_species_label_fans_out_to_three_locations() {
        let staged = species_candidates(&catalog(), &[record("Diceros bicornis", "Western Africa", "critically endangered")]);
        assert_eq!(staged.candidates.len(), 3);
        match &staged.candidates[0] {
            Candidate::Species(obs) => {
                assert_eq!(obs.species_key, "Diceros bicornis");
                assert_eq!(obs.red_list_category, "Critically Endangered");
            }
            other => panic!("unexpected candidate {other:?}"),
        }
    }

    #[test]
    fn unresolved_species_are_reported_not_staged() {
        let staged = species_candidates(
            &catalog(),
            &[record("Phalacrocorax nigrogularis", "Persian Gulf", "Vulnerable"), record("Panthera pardus", "Cape Town", "Vulnerable")],
        );
        assert_eq!(staged.candidates.len(), 1);
        assert_eq!(staged.unresolved.len(), 1);
        assert_eq!(staged.unresolved[0].label, "Persian Gulf");
    }

    #[test]
    fn climate_records_fan_out_and_skip_unknown_regions() {
        let records = vec![
            ClimateRecord { region: "africa".into(), year: 2024, anomaly: 1.64 },
            ClimateRecord { region: "europe".into(), year: 2024, anomaly: 2.37 },
            ClimateRecord { region: "atlantis".into(), year: 2024, anomaly: 9.99 },
        ];
        let staged = climate_candidates(&catalog(), &records);
        assert_eq!(staged.candidates.len(), 3);
        assert_eq!(staged.unresolved.len(), 1);
        assert!(staged.candidates.iter().all(|c| matches!(c, Candidate::Climate(row) if row.region == "africa")));
    }
}
