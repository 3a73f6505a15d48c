use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::boundary::{FallbackBox, DEFAULT_BOUNDARY_URLS};
use crate::error::ConfigError;
use crate::facility::{DEFAULT_AIRPORTS_URL, DEFAULT_LOOKUP_MODEL, DEFAULT_LOOKUP_URL, DEFAULT_OSRM_URL};
use crate::resilience::RetryPolicy;
use crate::resolver::DEFAULT_DEDUPE_THRESHOLD_KM;
use crate::sources::{DEFAULT_GEONAMES_URL, DEFAULT_OVERPASS_ENDPOINTS};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub region: RegionConfig,
    pub gazetteer: GazetteerConfig,
    pub map_database: MapDatabaseConfig,
    pub boundaries: BoundariesConfig,
    pub routing: RoutingConfig,
    pub retry: RetryPolicy,
    pub airports: AirportsConfig,
    pub hospitals: HospitalsConfig,
    pub live_lookup: LiveLookupConfig,
    pub batch: BatchConfig,
}

/// Built-in region: default countries and a conservative perimeter box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionPreset {
    pub slug: &'static str,
    pub name: &'static str,
    pub countries: &'static [&'static str],
    pub excluded_countries: &'static [&'static str],
    /// (min_lon, min_lat, max_lon, max_lat)
    pub bbox: (f64, f64, f64, f64),
}

pub const REGION_PRESETS: [RegionPreset; 6] = [
    RegionPreset {
        slug: "alps",
        name: "Alps",
        countries: &["AT", "FR", "IT", "DE", "CH"],
        excluded_countries: &["SI", "LI"],
        bbox: (4.0, 43.5, 17.5, 49.0),
    },
    RegionPreset {
        slug: "pyrenees",
        name: "Pyrenees",
        countries: &["FR", "ES", "AD"],
        excluded_countries: &[],
        bbox: (-2.8, 42.0, 3.6, 43.8),
    },
    RegionPreset {
        slug: "rockies",
        name: "Rocky Mountains",
        countries: &["US", "CA"],
        excluded_countries: &[],
        bbox: (-125.0, 31.0, -103.0, 60.0),
    },
    RegionPreset {
        slug: "sierra_nevada",
        name: "Sierra Nevada",
        countries: &["US", "MX"],
        excluded_countries: &[],
        bbox: (-122.0, 35.0, -117.5, 40.5),
    },
    RegionPreset {
        slug: "cascade_range",
        name: "Cascade Range",
        countries: &["US", "CA"],
        excluded_countries: &[],
        bbox: (-123.5, 40.5, -119.5, 52.0),
    },
    RegionPreset {
        slug: "coast_mountains",
        name: "Coast Mountains",
        countries: &["US", "CA"],
        excluded_countries: &[],
        bbox: (-135.5, 49.0, -121.0, 60.0),
    },
];

/// Preset for `slug`, falling back to the Alps for unknown slugs
pub fn region_preset(slug: &str) -> &'static RegionPreset {
    let key = slug.trim().to_lowercase();
    REGION_PRESETS
        .iter()
        .find(|p| p.slug == key)
        .unwrap_or(&REGION_PRESETS[0])
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegionConfig {
    pub preset: String,
    pub name: Option<String>,
    pub slug: Option<String>,
    /// Overrides the preset's country list
    pub countries: Option<Vec<String>>,
    pub excluded_countries: Option<Vec<String>>,
    /// GeoJSON perimeter; the preset box is used when absent
    pub perimeter: Option<PathBuf>,
    pub min_population: u64,
    pub include_villages: bool,
    pub require_osm_population: bool,
    /// Overwrite source country codes with the boundary inference
    pub enforce_boundary_country: bool,
    pub dedupe_threshold_km: f64,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            preset: "alps".to_string(),
            name: None,
            slug: None,
            countries: None,
            excluded_countries: None,
            perimeter: None,
            min_population: 5000,
            include_villages: false,
            require_osm_population: false,
            enforce_boundary_country: false,
            dedupe_threshold_km: DEFAULT_DEDUPE_THRESHOLD_KM,
        }
    }
}

impl RegionConfig {
    pub fn preset(&self) -> &'static RegionPreset {
        region_preset(&self.preset)
    }

    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.preset().name.to_string())
    }

    pub fn slug(&self) -> String {
        self.slug.clone().unwrap_or_else(|| self.preset().slug.to_string())
    }

    pub fn countries(&self) -> Vec<String> {
        match &self.countries {
            Some(codes) if !codes.is_empty() => codes.clone(),
            _ => self.preset().countries.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn excluded_countries(&self) -> Vec<String> {
        match &self.excluded_countries {
            Some(codes) => codes.clone(),
            None => self.preset().excluded_countries.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// OSM `place` values to query
    pub fn place_types(&self) -> Vec<&'static str> {
        if self.include_villages {
            vec!["city", "town", "village"]
        } else {
            vec!["city", "town"]
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GazetteerConfig {
    pub username: Option<String>,
    pub endpoint: String,
    pub page_size: usize,
    pub page_pause_ms: u64,
    /// Abort the run when the gazetteer cannot be used
    pub mandatory: bool,
}

impl Default for GazetteerConfig {
    fn default() -> Self {
        Self {
            username: None,
            endpoint: DEFAULT_GEONAMES_URL.to_string(),
            page_size: 1000,
            page_pause_ms: 1000,
            mandatory: false,
        }
    }
}

impl GazetteerConfig {
    pub const USERNAME_ENV: &'static str = "GEONAMES_USERNAME";

    /// Configured username, else the environment
    pub fn resolve_username(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.username
            .clone()
            .or_else(|| env(Self::USERNAME_ENV))
            .filter(|u| !u.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MapDatabaseConfig {
    pub endpoints: Vec<String>,
    pub tile_size_deg: f64,
    pub tile_pause_ms: u64,
    pub retries_per_endpoint: u32,
}

impl Default for MapDatabaseConfig {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_OVERPASS_ENDPOINTS.iter().map(|e| e.to_string()).collect(),
            tile_size_deg: 1.0,
            tile_pause_ms: 500,
            retries_per_endpoint: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BoundariesConfig {
    pub cache_path: PathBuf,
    pub urls: Vec<String>,
    pub timeout_secs: u64,
    /// Use rough country rectangles when the dataset is unavailable
    pub bbox_fallback: bool,
    pub fallback_boxes: Option<Vec<FallbackBox>>,
}

impl Default for BoundariesConfig {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from("data/cache/countries.geojson"),
            urls: DEFAULT_BOUNDARY_URLS.iter().map(|u| u.to_string()).collect(),
            timeout_secs: 60,
            bbox_fallback: true,
            fallback_boxes: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RoutingConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub pacing_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OSRM_URL.to_string(),
            timeout_secs: 30,
            pacing_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AirportsConfig {
    pub dataset_url: String,
    pub cache_path: PathBuf,
    pub k: usize,
    pub max_radius_km: f64,
    /// Ask the live lookup service instead of the dataset
    pub live_lookup: bool,
}

impl Default for AirportsConfig {
    fn default() -> Self {
        Self {
            dataset_url: DEFAULT_AIRPORTS_URL.to_string(),
            cache_path: PathBuf::from("data/cache/airports.csv"),
            k: 3,
            max_radius_km: 300.0,
            live_lookup: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HospitalsConfig {
    pub enabled: bool,
    pub k: usize,
    pub max_radius_km: f64,
}

impl Default for HospitalsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            k: 3,
            max_radius_km: 100.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LiveLookupConfig {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for LiveLookupConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LOOKUP_URL.to_string(),
            model: DEFAULT_LOOKUP_MODEL.to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatchConfig {
    /// Places matched at once; 1 runs sequentially with pacing
    pub concurrency: usize,
    pub limit: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            limit: None,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Check everything that would otherwise fail halfway through a run
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.validate_with(|key| std::env::var(key).ok())
    }

    pub fn validate_with(&self, env: impl Fn(&str) -> Option<String>) -> std::result::Result<(), ConfigError> {
        if self.gazetteer.mandatory && self.gazetteer.resolve_username(&env).is_none() {
            return Err(ConfigError::MissingGazetteerUser);
        }
        if let Some(path) = &self.region.perimeter {
            if !path.exists() {
                return Err(ConfigError::MissingPerimeter(path.display().to_string()));
            }
        }
        if self.airports.live_lookup && env(&self.live_lookup.api_key_env).is_none() {
            return Err(ConfigError::MissingCredential(self.live_lookup.api_key_env.clone()));
        }

        if self.airports.k == 0 {
            return Err(invalid("airports.k", "must be at least 1"));
        }
        if self.hospitals.k == 0 {
            return Err(invalid("hospitals.k", "must be at least 1"));
        }
        for (field, radius) in [
            ("airports.max_radius_km", self.airports.max_radius_km),
            ("hospitals.max_radius_km", self.hospitals.max_radius_km),
        ] {
            if !(radius.is_finite() && radius > 0.0) {
                return Err(invalid(field, format!("{} is not a positive distance", radius)));
            }
        }
        let threshold = self.region.dedupe_threshold_km;
        if !(threshold.is_finite() && threshold >= 0.0) {
            return Err(invalid("region.dedupe_threshold_km", format!("{} is negative", threshold)));
        }
        if !(self.map_database.tile_size_deg > 0.0) {
            return Err(invalid("map_database.tile_size_deg", "must be positive"));
        }
        if self.map_database.endpoints.is_empty() {
            return Err(invalid("map_database.endpoints", "at least one endpoint is required"));
        }
        if self.batch.concurrency == 0 {
            return Err(invalid("batch.concurrency", "must be at least 1"));
        }
        if !(self.retry.initial_backoff_secs >= 0.0 && self.retry.jitter_secs >= 0.0) {
            return Err(invalid("retry", "delays must not be negative"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.region.preset().slug, "alps");
        assert_eq!(config.region.countries(), vec!["AT", "FR", "IT", "DE", "CH"]);
        assert_eq!(config.region.excluded_countries(), vec!["SI", "LI"]);
        assert_eq!(config.region.min_population, 5000);
        assert_eq!(config.airports.k, 3);
        assert_eq!(config.hospitals.max_radius_km, 100.0);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.map_database.endpoints.len(), 4);
        assert!(config.validate_with(no_env).is_ok());
    }

    #[test]
    fn test_load_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[region]
preset = "pyrenees"
include_villages = true

[retry]
max_retries = 4

[airports]
k = 5

[[boundaries.fallback_boxes]]
code = "ES"
min_lon = -9.4
min_lat = 36.0
max_lon = 3.4
max_lat = 43.8
"#
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.region.name(), "Pyrenees");
        assert_eq!(config.region.countries(), vec!["FR", "ES", "AD"]);
        assert_eq!(config.region.place_types(), vec!["city", "town", "village"]);
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.retry.initial_backoff_secs, 2.0);
        assert_eq!(config.airports.k, 5);
        assert_eq!(config.boundaries.fallback_boxes.unwrap()[0].code, "ES");
    }

    #[test]
    fn test_unknown_preset_is_alps() {
        assert_eq!(region_preset("Himalaya").slug, "alps");
        assert_eq!(region_preset(" Rockies ").name, "Rocky Mountains");
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.gazetteer.mandatory = true;
        assert!(matches!(config.validate_with(no_env), Err(ConfigError::MissingGazetteerUser)));
        let with_user = |key: &str| (key == "GEONAMES_USERNAME").then(|| "demo".to_string());
        assert!(config.validate_with(with_user).is_ok());

        let mut config = Config::default();
        config.airports.live_lookup = true;
        assert!(matches!(
            config.validate_with(no_env),
            Err(ConfigError::MissingCredential(ref key)) if key == "OPENAI_API_KEY"
        ));

        let mut config = Config::default();
        config.region.perimeter = Some(PathBuf::from("/nonexistent/perimeter.geojson"));
        assert!(matches!(config.validate_with(no_env), Err(ConfigError::MissingPerimeter(_))));

        let mut config = Config::default();
        config.airports.k = 0;
        assert!(matches!(
            config.validate_with(no_env),
            Err(ConfigError::Invalid { field: "airports.k", .. })
        ));

        let mut config = Config::default();
        config.batch.concurrency = 0;
        assert!(config.validate_with(no_env).is_err());
    }
}
