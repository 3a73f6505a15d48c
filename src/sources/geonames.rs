//! GeoNames `searchJSON` client for populated places.

use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::parse_loose_f64;
use crate::error::SourceError;
use crate::models::{PlaceRecord, Source};
use crate::resilience::{retry, RetryPolicy};

pub const DEFAULT_GEONAMES_URL: &str = "http://api.geonames.org/searchJSON";

/// GeoNames caps `maxRows` at 1000
const MAX_PAGE_SIZE: usize = 1000;

/// One parsed result page
#[derive(Debug, Default)]
pub struct GeonamesPage {
    pub total: usize,
    /// Number of entries on the page, parsed or not
    pub returned: usize,
    pub records: Vec<PlaceRecord>,
    pub skipped: usize,
}

fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_loose_f64(s),
        _ => None,
    }
}

fn value_str<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_entry(item: &Value) -> Option<PlaceRecord> {
    let name = value_str(item, "name").or_else(|| value_str(item, "toponymName"))?;
    let country = value_str(item, "countryCode")?;
    let lat = item.get("lat").and_then(value_f64)?;
    let lon = item.get("lng").and_then(value_f64)?;

    let mut record = PlaceRecord::new(name, lat, lon, Source::Gazetteer)
        .ok()?
        .with_country(country);

    match item.get("population") {
        None | Some(Value::Null) => {}
        Some(raw) => match value_f64(raw) {
            Some(p) if p >= 0.0 => record.population = p as u64,
            _ => record.add_note(format!("unparsable population {}", raw)),
        },
    }
    record.elevation = item.get("elevation").and_then(value_f64);
    Some(record)
}

/// Parse one `searchJSON` response body.
///
/// Entries without a name, country or valid coordinates are skipped and
/// counted; an error payload from the service is returned as an error.
pub fn parse_geonames_page(payload: &Value) -> Result<GeonamesPage, SourceError> {
    if let Some(status) = payload.get("status") {
        let message = status
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(SourceError::Service(message.to_string()));
    }

    let total = payload
        .get("totalResultsCount")
        .and_then(value_f64)
        .map(|t| t.max(0.0) as usize)
        .unwrap_or(0);
    let entries = payload
        .get("geonames")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut page = GeonamesPage {
        total,
        returned: entries.len(),
        ..Default::default()
    };
    for item in entries {
        match parse_entry(item) {
            Some(record) => page.records.push(record),
            None => page.skipped += 1,
        }
    }
    Ok(page)
}

/// Paginated gazetteer client
pub struct GeonamesClient {
    client: Client,
    endpoint: String,
    username: String,
    page_size: usize,
    page_pause: Duration,
    policy: RetryPolicy,
}

impl GeonamesClient {
    pub fn new(client: Client, endpoint: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            username: username.into(),
            page_size: MAX_PAGE_SIZE,
            page_pause: Duration::from_secs(1),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn with_page_pause(mut self, pause: Duration) -> Self {
        self.page_pause = pause;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn page_url(&self, country: &str, min_population: u64, start_row: usize) -> Result<Url, SourceError> {
        Url::parse_with_params(
            &self.endpoint,
            &[
                ("featureClass", "P".to_string()),
                ("country", country.to_string()),
                ("orderby", "population".to_string()),
                ("maxRows", self.page_size.to_string()),
                ("startRow", start_row.to_string()),
                ("username", self.username.clone()),
                ("minPopulation", min_population.to_string()),
            ],
        )
        .map_err(|e| SourceError::Network(format!("invalid gazetteer URL: {}", e)))
    }

    async fn fetch_page(&self, url: Url) -> Result<GeonamesPage, SourceError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http(status.as_u16()));
        }
        let payload: Value = response.json().await?;
        parse_geonames_page(&payload)
    }

    /// All populated places of one country at or above `min_population`
    pub async fn fetch_country(&self, country: &str, min_population: u64) -> Result<Vec<PlaceRecord>, SourceError> {
        let mut records = Vec::new();
        let mut skipped = 0usize;
        let mut start_row = 0usize;

        loop {
            let url = self.page_url(country, min_population, start_row)?;
            debug!("GeoNames {} page at row {}", country, start_row);
            let label = format!("GeoNames {} page {}", country, start_row / self.page_size);
            let page = retry(&self.policy, &label, SourceError::is_transient, || self.fetch_page(url.clone())).await?;

            skipped += page.skipped;
            records.extend(page.records);
            start_row += self.page_size;
            if page.returned == 0 || start_row >= page.total {
                break;
            }
            tokio::time::sleep(self.page_pause).await;
        }

        if skipped > 0 {
            warn!("GeoNames {}: skipped {} malformed entries", country, skipped);
        }
        info!("GeoNames {}: {} places", country, records.len());
        Ok(records)
    }

    /// Every country in turn; the first failing country aborts
    pub async fn fetch_countries(&self, countries: &[String], min_population: u64) -> Result<Vec<PlaceRecord>, SourceError> {
        let mut all = Vec::new();
        for (i, country) in countries.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.page_pause).await;
            }
            all.extend(self.fetch_country(country, min_population).await?);
        }
        Ok(all)
    }
}
