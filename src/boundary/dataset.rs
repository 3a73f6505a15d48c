//! Country polygons from the Natural Earth admin-0 GeoJSON.

use geojson::{FeatureCollection, GeoJson, JsonObject};
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::BoundaryPolygon;
use crate::error::BoundaryError;
use crate::models::normalize_country;
use crate::resilience::{cached_download, RetryPolicy};

/// Properties that may carry the ISO alpha-2 code, in order of preference
pub const CODE_PROPERTIES: [&str; 5] = ["ISO_A2", "ISO_A2_EH", "ADM0_A3_IS", "ADM0_A3", "WB_A2"];

pub const DEFAULT_BOUNDARY_URLS: [&str; 2] = [
    "https://raw.githubusercontent.com/nvkelso/natural-earth-vector/master/geojson/ne_50m_admin_0_countries.geojson",
    "https://raw.githubusercontent.com/nvkelso/natural-earth-vector/master/geojson/ne_110m_admin_0_countries.geojson",
];

/// First usable two-letter code among the known property names.
///
/// Placeholders such as "-99" are skipped so a later property can supply
/// the code (France carries "-99" in ISO_A2).
pub fn country_code(properties: &JsonObject) -> Option<String> {
    CODE_PROPERTIES.iter().find_map(|key| {
        let value = properties.get(*key)?.as_str()?;
        let code = normalize_country(value);
        let valid = code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic());
        valid.then_some(code)
    })
}

/// Parse a FeatureCollection into boundary polygons.
///
/// Features without a usable code or with a non-areal geometry are skipped.
pub fn parse_boundaries(text: &str) -> Result<Vec<BoundaryPolygon>, BoundaryError> {
    let geojson: GeoJson = text
        .parse()
        .map_err(|e: geojson::Error| BoundaryError::Parse(e.to_string()))?;
    let collection = FeatureCollection::try_from(geojson)
        .map_err(|e| BoundaryError::Parse(e.to_string()))?;

    let total = collection.features.len();
    let mut boundaries = Vec::with_capacity(total);
    let mut skipped = 0usize;

    for feature in collection.features {
        let code = match feature.properties.as_ref().and_then(country_code) {
            Some(code) => code,
            None => {
                skipped += 1;
                continue;
            }
        };
        let Some(geometry) = feature.geometry else {
            skipped += 1;
            continue;
        };
        let geometry: geo::Geometry<f64> = match geometry.try_into() {
            Ok(g) => g,
            Err(e) => {
                debug!("Skipping boundary {}: {}", code, e);
                skipped += 1;
                continue;
            }
        };
        let multipolygon = match geometry {
            geo::Geometry::Polygon(p) => geo::MultiPolygon::new(vec![p]),
            geo::Geometry::MultiPolygon(mp) => mp,
            _ => {
                skipped += 1;
                continue;
            }
        };
        boundaries.push(BoundaryPolygon::new(&code, multipolygon));
    }

    info!(
        "Parsed {} country boundaries ({} of {} features skipped)",
        boundaries.len(),
        skipped,
        total
    );
    Ok(boundaries)
}

/// Load boundaries from the cache, downloading from `urls` on first use.
pub async fn load_boundaries(
    client: &Client,
    cache_path: &Path,
    urls: &[String],
    policy: &RetryPolicy,
    timeout: Duration,
) -> Result<Vec<BoundaryPolygon>, BoundaryError> {
    let text = cached_download(client, cache_path, urls, policy, timeout, |text| {
        parse_boundaries(text).map(|_| ()).map_err(|e| e.to_string())
    })
    .await
        .map_err(|e| {
            warn!("Boundary dataset download failed: {}", e);
            BoundaryError::Unavailable
        })?;
    parse_boundaries(&text)
}
