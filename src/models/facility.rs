//! Facility candidates and the per-place match outcome.

use serde::{Deserialize, Serialize};

use super::GeoPoint;

/// Kind of facility a place is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacilityKind {
    Airport,
    Hospital,
}

impl std::fmt::Display for FacilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacilityKind::Airport => write!(f, "airport"),
            FacilityKind::Hospital => write!(f, "hospital"),
        }
    }
}

/// An airport or hospital candidate. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub name: String,
    pub kind: FacilityKind,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icao: Option<String>,
}

impl Facility {
    pub fn new(name: impl Into<String>, kind: FacilityKind, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            latitude,
            longitude,
            iata: None,
            icao: None,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.latitude,
            lon: self.longitude,
        }
    }
}

/// Driving distance/time returned by the routing service
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteEstimate {
    pub distance_km: f64,
    pub duration_minutes: f64,
    pub confidence_pct: u8,
}

/// How a match was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// A driving route was computed to the chosen facility
    Routed,
    /// Every routing attempt failed; the facility is the nearest by air
    RoutingFailed,
    /// No candidate within the service radius; no route was attempted
    OutOfServiceRadius,
    /// The candidate set was empty
    NoCandidates,
    /// The live lookup service could not identify a facility
    LookupFailed,
}

/// Outcome of matching one place to its nearest facility.
///
/// Route fields are `None` whenever no route was computed; callers must check
/// `status` and `error` rather than assume data is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facility: Option<Facility>,

    /// Great-circle distance to the chosen facility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crow_flies_km: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteEstimate>,

    pub status: MatchStatus,

    /// Confidence reported by the live lookup service, if used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_confidence_pct: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MatchResult {
    pub fn failed(status: MatchStatus, error: impl Into<String>) -> Self {
        Self {
            facility: None,
            crow_flies_km: None,
            route: None,
            status,
            lookup_confidence_pct: None,
            reasoning: None,
            error: Some(error.into()),
        }
    }

    pub fn for_facility(facility: Facility, crow_flies_km: f64, status: MatchStatus) -> Self {
        Self {
            facility: Some(facility),
            crow_flies_km: Some(crow_flies_km),
            route: None,
            status,
            lookup_confidence_pct: None,
            reasoning: None,
            error: None,
        }
    }

    /// A facility was chosen and nothing failed; re-running can be skipped
    pub fn is_complete(&self) -> bool {
        self.facility.is_some() && self.error.is_none()
    }
}
