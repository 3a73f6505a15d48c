//! Overpass API client for OpenStreetMap places and hospitals.
//!
//! Large regions are split into tiles so each query stays small; every tile
//! runs against the mirror list with failover, and a failing tile is skipped
//! rather than failing the whole region.

use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::parse_loose_f64;
use crate::error::SourceError;
use crate::models::{Facility, FacilityKind, PlaceRecord, Source};
use crate::resilience::{with_failover, RetryPolicy};

pub const DEFAULT_OVERPASS_ENDPOINTS: [&str; 4] = [
    "https://overpass-api.de/api/interpreter",
    "https://overpass.kumi.systems/api/interpreter",
    "https://overpass.openstreetmap.ru/api/interpreter",
    "https://overpass.nchc.org.tw/api/interpreter",
];

const COUNTRY_TAGS: [&str; 3] = ["addr:country", "is_in:country_code", "ISO3166-1"];

/// Query rectangle in Overpass order (south, west, north, east)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl Bbox {
    /// From a (min_lon, min_lat, max_lon, max_lat) envelope
    pub fn from_envelope((min_lon, min_lat, max_lon, max_lat): (f64, f64, f64, f64)) -> Self {
        Self {
            south: min_lat,
            west: min_lon,
            north: max_lat,
            east: max_lon,
        }
    }

    fn overpass(&self) -> String {
        format!("{},{},{},{}", self.south, self.west, self.north, self.east)
    }
}

/// Split a rectangle into tiles of at most `size_deg` on each side, row by
/// row from the south-west corner
pub fn tile_bbox(bbox: Bbox, size_deg: f64) -> Vec<Bbox> {
    if !(size_deg > 0.0) || bbox.south >= bbox.north || bbox.west >= bbox.east {
        return Vec::new();
    }
    let mut tiles = Vec::new();
    let mut lat = bbox.south;
    while lat < bbox.north {
        let next_lat = bbox.north.min(lat + size_deg);
        let mut lon = bbox.west;
        while lon < bbox.east {
            let next_lon = bbox.east.min(lon + size_deg);
            tiles.push(Bbox {
                south: lat,
                west: lon,
                north: next_lat,
                east: next_lon,
            });
            lon = next_lon;
        }
        lat = next_lat;
    }
    tiles
}

/// Overpass QL for `place` nodes, ways and relations inside `bbox`
pub fn build_place_query(bbox: Bbox, place_types: &[&str], require_population: bool) -> String {
    let types = place_types.join("|");
    let population = if require_population { "[\"population\"]" } else { "" };
    let area = bbox.overpass();
    format!(
        "[out:json][timeout:90];\n(\n  node[\"place\"~\"^({types})$\"]{population}({area});\n  way[\"place\"~\"^({types})$\"]{population}({area});\n  relation[\"place\"~\"^({types})$\"]{population}({area});\n);\nout center;\n"
    )
}

pub fn build_hospital_query(bbox: Bbox) -> String {
    let area = bbox.overpass();
    format!(
        "[out:json][timeout:90];\n(\n  node[\"amenity\"=\"hospital\"]({area});\n  way[\"amenity\"=\"hospital\"]({area});\n  relation[\"amenity\"=\"hospital\"]({area});\n);\nout center;\n"
    )
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
    #[serde(default)]
    remark: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    #[serde(rename = "type", default)]
    kind: String,
    lat: Option<f64>,
    lon: Option<f64>,
    center: Option<Center>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct Center {
    lat: f64,
    lon: f64,
}

impl OverpassElement {
    /// Nodes carry their own coordinates; ways and relations their center
    fn position(&self) -> Option<(f64, f64)> {
        if self.kind == "node" {
            Some((self.lat?, self.lon?))
        } else {
            self.center.as_ref().map(|c| (c.lat, c.lon))
        }
    }

    fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    fn name(&self) -> Option<&str> {
        self.tag("name")
    }
}

fn decode(body: &str) -> Result<OverpassResponse, SourceError> {
    let response: OverpassResponse =
        serde_json::from_str(body).map_err(|e| SourceError::Decode(e.to_string()))?;
    if let Some(remark) = &response.remark {
        debug!("Overpass remark: {}", remark);
    }
    Ok(response)
}

/// Parse a place query response into map-database records
pub fn parse_places(body: &str) -> Result<Vec<PlaceRecord>, SourceError> {
    let response = decode(body)?;
    let mut records = Vec::with_capacity(response.elements.len());
    for element in &response.elements {
        let (Some(name), Some((lat, lon))) = (element.name(), element.position()) else {
            continue;
        };
        let Ok(mut record) = PlaceRecord::new(name, lat, lon, Source::MapDatabase) else {
            continue;
        };

        if let Some(raw) = element.tag("population") {
            match parse_loose_f64(raw) {
                Some(p) if p >= 0.0 => record.population = p as u64,
                _ => record.add_note(format!("unparsable population {:?}", raw)),
            }
        }
        record.elevation = element
            .tag("ele")
            .or_else(|| element.tag("height"))
            .and_then(parse_loose_f64);
        if let Some(country) = COUNTRY_TAGS.iter().find_map(|k| element.tag(k)) {
            record = record.with_country(country);
        }
        records.push(record);
    }
    Ok(records)
}

/// Parse a hospital query response into facility candidates
pub fn parse_hospitals(body: &str) -> Result<Vec<Facility>, SourceError> {
    let response = decode(body)?;
    Ok(response
        .elements
        .iter()
        .filter_map(|e| {
            let (lat, lon) = e.position()?;
            Some(Facility::new(e.name()?, FacilityKind::Hospital, lat, lon))
        })
        .collect())
}

fn dedupe_key(name: &str, lat: f64, lon: f64) -> (String, i64, i64) {
    (
        name.to_string(),
        (lat * 10_000.0).round() as i64,
        (lon * 10_000.0).round() as i64,
    )
}

/// Tiled Overpass queries with mirror failover
pub struct OverpassClient {
    client: Client,
    endpoints: Vec<String>,
    per_endpoint: RetryPolicy,
    tile_size_deg: f64,
    tile_pause: Duration,
}

impl OverpassClient {
    pub fn new(client: Client, endpoints: Vec<String>) -> Self {
        Self {
            client,
            endpoints,
            per_endpoint: RetryPolicy::default(),
            tile_size_deg: 1.0,
            tile_pause: Duration::from_millis(500),
        }
    }

    pub fn with_retry(mut self, per_endpoint: RetryPolicy) -> Self {
        self.per_endpoint = per_endpoint;
        self
    }

    pub fn with_tiles(mut self, tile_size_deg: f64, tile_pause: Duration) -> Self {
        self.tile_size_deg = tile_size_deg;
        self.tile_pause = tile_pause;
        self
    }

    async fn post(&self, endpoint: String, query: &str) -> Result<String, SourceError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("data", query)
            .finish();
        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http(status.as_u16()));
        }
        Ok(response.text().await?)
    }

    /// Run one query, moving down the mirror list on failure
    pub async fn query(&self, query: &str) -> Result<String, SourceError> {
        with_failover(
            &self.endpoints,
            &self.per_endpoint,
            "Overpass query",
            SourceError::is_transient,
            |endpoint| self.post(endpoint, query),
        )
        .await
        .map_err(|e| {
            e.into_last()
                .unwrap_or_else(|| SourceError::Service("no Overpass endpoints configured".to_string()))
        })
    }

    /// Places across every tile of `bbox`, deduplicated across tile borders
    pub async fn fetch_places(
        &self,
        bbox: Bbox,
        place_types: &[&str],
        require_population: bool,
    ) -> Vec<PlaceRecord> {
        let tiles = tile_bbox(bbox, self.tile_size_deg);
        let mut seen = HashSet::new();
        let mut places = Vec::new();
        let mut failed_tiles = 0usize;

        for (i, tile) in tiles.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.tile_pause).await;
            }
            let query = build_place_query(*tile, place_types, require_population);
            let chunk = match self.query(&query).await.and_then(|body| parse_places(&body)) {
                Ok(chunk) => chunk,
                Err(e) => {
                    failed_tiles += 1;
                    warn!("Skipping Overpass tile {:?}: {}", tile, e);
                    continue;
                }
            };
            for place in chunk {
                if seen.insert(dedupe_key(&place.name, place.latitude, place.longitude)) {
                    places.push(place);
                }
            }
        }

        info!(
            "Overpass: {} places from {} tiles ({} failed)",
            places.len(),
            tiles.len(),
            failed_tiles
        );
        places
    }

    /// Hospitals across every tile of `bbox`
    pub async fn fetch_hospitals(&self, bbox: Bbox) -> Vec<Facility> {
        let tiles = tile_bbox(bbox, self.tile_size_deg);
        let mut seen = HashSet::new();
        let mut hospitals = Vec::new();

        for (i, tile) in tiles.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.tile_pause).await;
            }
            match self
                .query(&build_hospital_query(*tile))
                .await
                .and_then(|body| parse_hospitals(&body))
            {
                Ok(chunk) => {
                    for h in chunk {
                        if seen.insert(dedupe_key(&h.name, h.latitude, h.longitude)) {
                            hospitals.push(h);
                        }
                    }
                }
                Err(e) => warn!("Skipping hospital tile {:?}: {}", tile, e),
            }
        }
        info!("Overpass: {} hospitals", hospitals.len());
        hospitals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
        "version": 0.6,
        "elements": [
            {"type": "node", "id": 1, "lat": 47.2654, "lon": 11.3928,
             "tags": {"name": "Innsbruck", "place": "city", "population": "130 894", "ele": "574", "is_in:country_code": "at"}},
            {"type": "way", "id": 2, "center": {"lat": 46.4983, "lon": 11.3548},
             "tags": {"name": "Bozen", "place": "city", "height": "262", "ISO3166-1": "IT"}},
            {"type": "relation", "id": 3, "tags": {"name": "No Center", "place": "town"}},
            {"type": "node", "id": 4, "lat": 47.0, "lon": 11.0, "tags": {"place": "village"}},
            {"type": "node", "id": 5, "lat": 47.1, "lon": 11.1, "tags": {"name": "Odd", "population": "approx. 900"}}
        ]
    }"#;

    #[test]
    fn test_parse_places() {
        let places = parse_places(BODY).unwrap();
        assert_eq!(places.len(), 3);

        assert_eq!(places[0].name, "Innsbruck");
        assert_eq!(places[0].population, 130_894);
        assert_eq!(places[0].elevation, Some(574.0));
        assert_eq!(places[0].country, "AT");
        assert_eq!(places[0].source, Source::MapDatabase);

        assert_eq!(places[1].latitude, 46.4983);
        assert_eq!(places[1].elevation, Some(262.0));
        assert_eq!(places[1].country, "IT");

        assert_eq!(places[2].population, 0);
        assert_eq!(places[2].notes.len(), 1);
    }

    #[test]
    fn test_parse_places_grouped_population() {
        let body = r#"{"elements": [
            {"type": "node", "id": 7, "lat": 46.2, "lon": 6.15, "tags": {"name": "Carouge", "population": "22'000"}},
            {"type": "node", "id": 8, "lat": 47.8, "lon": 13.04, "tags": {"name": "Salzburg", "population": "155,021", "ele": "1,220"}}
        ]}"#;
        let places = parse_places(body).unwrap();
        assert_eq!(places[0].population, 22_000);
        assert_eq!(places[1].population, 155_021);
        assert_eq!(places[1].elevation, Some(1220.0));
        assert!(places.iter().all(|p| p.notes.is_empty()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_places("<html>busy</html>"), Err(SourceError::Decode(_))));
    }

    #[test]
    fn test_parse_hospitals() {
        let body = r#"{"elements": [
            {"type": "node", "lat": 47.2633, "lon": 11.3836, "tags": {"name": "Klinik Innsbruck", "amenity": "hospital"}},
            {"type": "way", "center": {"lat": 47.28, "lon": 11.5}, "tags": {"amenity": "hospital"}}
        ]}"#;
        let hospitals = parse_hospitals(body).unwrap();
        assert_eq!(hospitals.len(), 1);
        assert_eq!(hospitals[0].kind, FacilityKind::Hospital);
    }

    #[test]
    fn test_query_text() {
        let bbox = Bbox { south: 46.0, west: 10.0, north: 47.0, east: 11.0 };
        let q = build_place_query(bbox, &["city", "town"], true);
        assert!(q.contains(r#"node["place"~"^(city|town)$"]["population"](46,10,47,11);"#));
        assert!(q.ends_with("out center;\n"));
        let q = build_place_query(bbox, &["city"], false);
        assert!(q.contains(r#"way["place"~"^(city)$"](46,10,47,11);"#));
        assert!(build_hospital_query(bbox).contains(r#"["amenity"="hospital"]"#));
    }

    #[test]
    fn test_tiles_cover_box() {
        let tiles = tile_bbox(Bbox { south: 43.5, west: 4.0, north: 45.0, east: 6.5 }, 1.0);
        assert_eq!(tiles.len(), 6);
        assert_eq!(tiles[0], Bbox { south: 43.5, west: 4.0, north: 44.5, east: 5.0 });
        assert_eq!(tiles[5], Bbox { south: 44.5, west: 6.0, north: 45.0, east: 6.5 });
        assert!(tile_bbox(Bbox { south: 1.0, west: 1.0, north: 1.0, east: 2.0 }, 1.0).is_empty());
        assert!(tile_bbox(Bbox { south: 0.0, west: 0.0, north: 1.0, east: 1.0 }, 0.0).is_empty());
    }

    #[test]
    fn test_dedupe_key_rounds_to_four_places() {
        assert_eq!(dedupe_key("A", 47.00001, 11.00004), dedupe_key("A", 47.0, 11.0));
        assert_ne!(dedupe_key("A", 47.0001, 11.0), dedupe_key("A", 47.0, 11.0));
    }

    #[tokio::test]
    async fn test_no_endpoints_is_an_error() {
        let client = OverpassClient::new(Client::new(), Vec::new());
        assert!(client.query("[out:json];").await.is_err());
    }
}
