//! Airport candidates from the OurAirports CSV dataset.

use reqwest::Client;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::SourceError;
use crate::models::{Facility, FacilityKind};
use crate::resilience::{cached_download, RetryPolicy};

pub const DEFAULT_AIRPORTS_URL: &str = "https://davidmegginson.github.io/ourairports-data/airports.csv";

#[derive(Debug, Deserialize)]
struct AirportRow {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    name: String,
    latitude_deg: Option<f64>,
    longitude_deg: Option<f64>,
    #[serde(default)]
    scheduled_service: String,
    #[serde(default)]
    iata_code: String,
    #[serde(default)]
    icao_code: String,
    #[serde(default)]
    gps_code: String,
}

fn valid_iata(code: &str) -> bool {
    (3..=4).contains(&code.len()) && code.chars().all(|c| c.is_ascii_alphabetic())
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_uppercase())
}

impl AirportRow {
    /// Medium/large airports with scheduled service and a usable IATA code
    fn into_facility(self) -> Option<Facility> {
        if !matches!(self.kind.as_str(), "medium_airport" | "large_airport") {
            return None;
        }
        if !self.scheduled_service.trim().eq_ignore_ascii_case("yes") {
            return None;
        }
        let iata = non_empty(&self.iata_code).filter(|c| valid_iata(c))?;
        let (lat, lon) = (self.latitude_deg?, self.longitude_deg?);
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }

        let mut facility = Facility::new(self.name.trim(), FacilityKind::Airport, lat, lon);
        facility.iata = Some(iata);
        facility.icao = non_empty(&self.icao_code).or_else(|| non_empty(&self.gps_code));
        Some(facility)
    }
}

/// Columns every usable airports file carries
const REQUIRED_COLUMNS: [&str; 5] = ["type", "latitude_deg", "longitude_deg", "scheduled_service", "iata_code"];

fn check_header<R: Read>(csv_reader: &mut csv::Reader<R>) -> Result<(), SourceError> {
    let headers = csv_reader
        .headers()
        .map_err(|e| SourceError::Decode(format!("unreadable airports header: {}", e)))?;
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|column| !headers.iter().any(|h| h.trim() == *column))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SourceError::Decode(format!("airports file lacks columns {}", missing.join(", "))))
    }
}

/// Whether `text` looks like an airports CSV, judged by its header only
pub fn validate_airports_csv(text: &str) -> Result<(), String> {
    let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(text.as_bytes());
    check_header(&mut csv_reader).map_err(|e| e.to_string())
}

/// Parse the airports CSV, keeping only rows that pass the service filters
pub fn parse_airports_csv<R: Read>(reader: R) -> Result<Vec<Facility>, SourceError> {
    let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    check_header(&mut csv_reader)?;

    let mut airports = Vec::new();
    let mut rows = 0usize;
    let mut malformed = 0usize;
    for row in csv_reader.deserialize::<AirportRow>() {
        rows += 1;
        match row {
            Ok(row) => airports.extend(row.into_facility()),
            Err(e) => {
                malformed += 1;
                debug!("Skipping malformed airport row: {}", e);
            }
        }
    }

    if rows > 0 && malformed == rows {
        return Err(SourceError::Decode("no airport row could be parsed".to_string()));
    }
    info!(
        "Loaded {} scheduled-service airports from {} rows ({} malformed)",
        airports.len(),
        rows,
        malformed
    );
    Ok(airports)
}

/// Load airports from the cache, downloading the dataset on first use
pub async fn load_airports(
    client: &Client,
    cache_path: &Path,
    url: &str,
    policy: &RetryPolicy,
    timeout: Duration,
) -> Result<Vec<Facility>, SourceError> {
    let text = cached_download(
        client,
        cache_path,
        &[url.to_string()],
        policy,
        timeout,
        validate_airports_csv,
    )
    .await?;
    parse_airports_csv(text.as_bytes())
}
