//! Driving distance and time between two coordinates.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::RoutingError;
use crate::models::{GeoPoint, RouteEstimate};

pub const DEFAULT_OSRM_URL: &str = "https://router.project-osrm.org";

/// A service answering "how far is the drive from A to B".
///
/// Implementations return a structured failure instead of panicking; the
/// matcher decides whether to retry.
#[async_trait]
pub trait RoutingService: Send + Sync {
    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteEstimate, RoutingError>;
}

/// Turn raw meters and seconds into a rounded estimate.
///
/// Confidence is 95 when both values are positive, 60 otherwise.
pub fn estimate_from_route(distance_m: f64, duration_s: f64) -> RouteEstimate {
    let confidence_pct = if distance_m > 0.0 && duration_s > 0.0 { 95 } else { 60 };
    RouteEstimate {
        distance_km: (distance_m / 1000.0 * 1000.0).round() / 1000.0,
        duration_minutes: (duration_s / 60.0 * 10.0).round() / 10.0,
        confidence_pct,
    }
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    #[serde(default)]
    distance: f64,
    #[serde(default)]
    duration: f64,
}

/// Client for the OSRM `route` endpoint
pub struct OsrmClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl OsrmClient {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn route_url(&self, from: GeoPoint, to: GeoPoint) -> Result<Url, RoutingError> {
        let raw = format!(
            "{}/route/v1/driving/{:.6},{:.6};{:.6},{:.6}",
            self.base_url.trim_end_matches('/'),
            from.lon,
            from.lat,
            to.lon,
            to.lat
        );
        Url::parse_with_params(&raw, &[("overview", "false"), ("alternatives", "false")])
            .map_err(|e| RoutingError::Network(format!("invalid routing URL: {}", e)))
    }
}

#[async_trait]
impl RoutingService for OsrmClient {
    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteEstimate, RoutingError> {
        let url = self.route_url(from, to)?;
        debug!("OSRM request {}", url);

        let response = self.client.get(url).timeout(self.timeout).send().await?;
        let status = response.status();
        let body = response.text().await?;

        let parsed: Option<OsrmResponse> = serde_json::from_str(&body).ok();
        if !status.is_success() {
            // OSRM reports unroutable pairs as HTTP 400 with a code
            return match parsed.and_then(|p| p.code) {
                Some(code) if code == "NoRoute" || code == "NoSegment" => Err(RoutingError::NoRoute),
                _ => Err(RoutingError::Http(status.as_u16())),
            };
        }

        let parsed = parsed.ok_or_else(|| RoutingError::Decode(truncate(&body, 200)))?;
        let route = parsed.routes.first().ok_or(RoutingError::NoRoute)?;
        Ok(estimate_from_route(route.distance, route.duration))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
