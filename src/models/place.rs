//! Place records flowing through resolution and enrichment.

use serde::{Deserialize, Serialize};

use super::MatchResult;
use crate::error::RecordError;

/// Which upstream dataset produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Populated-places gazetteer (GeoNames)
    #[serde(alias = "geonames")]
    Gazetteer,
    /// Crowd-sourced map database (OpenStreetMap via Overpass)
    #[serde(alias = "osm")]
    MapDatabase,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Gazetteer => write!(f, "geonames"),
            Source::MapDatabase => write!(f, "osm"),
        }
    }
}

/// Geographic point (lat/lon, WGS84 degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Validated constructor
    pub fn new(lat: f64, lon: f64) -> Result<Self, RecordError> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(RecordError::NotFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(RecordError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(RecordError::LongitudeOutOfRange(lon));
        }
        Ok(Self { lat, lon })
    }
}

/// A populated place (city, town, village) and everything derived for it.
///
/// Created once when a source row is parsed, then mutated in place by the
/// resolver and enrichment stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRecord {
    pub name: String,

    /// ISO 3166-1 alpha-2, empty when unknown
    #[serde(default)]
    pub country: String,

    pub latitude: f64,
    pub longitude: f64,

    #[serde(default)]
    pub population: u64,

    pub source: Source,

    /// Elevation in meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,

    /// Distance to the region perimeter; `None` when unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km_to_perimeter: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub airport: Option<MatchResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hospital: Option<MatchResult>,

    /// Explanations for fields left empty by malformed input
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl PlaceRecord {
    /// Create a record with validated coordinates and no derived fields
    pub fn new(
        name: impl Into<String>,
        latitude: f64,
        longitude: f64,
        source: Source,
    ) -> Result<Self, RecordError> {
        let point = GeoPoint::new(latitude, longitude)?;
        Ok(Self {
            name: name.into(),
            country: String::new(),
            latitude: point.lat,
            longitude: point.lon,
            population: 0,
            source,
            elevation: None,
            distance_km_to_perimeter: None,
            airport: None,
            hospital: None,
            notes: Vec::new(),
        })
    }

    pub fn with_country(mut self, country: &str) -> Self {
        self.country = normalize_country(country);
        self
    }

    pub fn with_population(mut self, population: u64) -> Self {
        self.population = population;
        self
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.latitude,
            lon: self.longitude,
        }
    }

    pub fn has_country(&self) -> bool {
        !self.country.is_empty()
    }

    /// Trimmed, lowercased, whitespace-collapsed name used for duplicate detection
    pub fn name_key(&self) -> String {
        name_key(&self.name)
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

/// Normalize a place name for comparison
pub fn name_key(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Uppercase a country code and map the legacy "UK" to "GB"
pub fn normalize_country(code: &str) -> String {
    let code = code.trim().to_uppercase();
    if code == "UK" {
        "GB".to_string()
    } else {
        code
    }
}
