use serde::Serialize;

use super::{MatchResult, MatchStatus, PlaceRecord, Source};

/// Flat version of PlaceRecord for tabular output.
/// Nested match results are spread into prefixed columns.
#[derive(Debug, Clone, Serialize)]
pub struct PlaceRow {
    pub name: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    pub population: u64,
    pub elevation: Option<f64>,
    pub source: Source,
    pub distance_km_to_perimeter: Option<f64>,
    pub airport_name: Option<String>,
    pub airport_iata: Option<String>,
    pub airport_icao: Option<String>,
    pub airport_km: Option<f64>,
    pub driving_km_to_airport: Option<f64>,
    pub driving_time_minutes_to_airport: Option<f64>,
    pub airport_status: Option<MatchStatus>,
    pub airport_error: Option<String>,
    pub hospital_name: Option<String>,
    pub hospital_km: Option<f64>,
    pub driving_km_to_hospital: Option<f64>,
    pub driving_time_minutes_to_hospital: Option<f64>,
    pub hospital_status: Option<MatchStatus>,
    pub hospital_error: Option<String>,
    pub notes: String,
}

struct MatchColumns {
    name: Option<String>,
    iata: Option<String>,
    icao: Option<String>,
    km: Option<f64>,
    driving_km: Option<f64>,
    driving_minutes: Option<f64>,
    status: Option<MatchStatus>,
    error: Option<String>,
}

impl MatchColumns {
    fn from_match(result: Option<&MatchResult>) -> Self {
        let facility = result.and_then(|r| r.facility.as_ref());
        let route = result.and_then(|r| r.route);
        Self {
            name: facility.map(|f| f.name.clone()),
            iata: facility.and_then(|f| f.iata.clone()),
            icao: facility.and_then(|f| f.icao.clone()),
            km: result.and_then(|r| r.crow_flies_km),
            driving_km: route.map(|r| r.distance_km),
            driving_minutes: route.map(|r| r.duration_minutes),
            status: result.map(|r| r.status),
            error: result.and_then(|r| r.error.clone()),
        }
    }
}

impl PlaceRow {
    pub fn from_place(place: &PlaceRecord) -> Self {
        let airport = MatchColumns::from_match(place.airport.as_ref());
        let hospital = MatchColumns::from_match(place.hospital.as_ref());

        Self {
            name: place.name.clone(),
            country: place.country.clone(),
            latitude: place.latitude,
            longitude: place.longitude,
            population: place.population,
            elevation: place.elevation,
            source: place.source,
            distance_km_to_perimeter: place.distance_km_to_perimeter,
            airport_name: airport.name,
            airport_iata: airport.iata,
            airport_icao: airport.icao,
            airport_km: airport.km,
            driving_km_to_airport: airport.driving_km,
            driving_time_minutes_to_airport: airport.driving_minutes,
            airport_status: airport.status,
            airport_error: airport.error,
            hospital_name: hospital.name,
            hospital_km: hospital.km,
            driving_km_to_hospital: hospital.driving_km,
            driving_time_minutes_to_hospital: hospital.driving_minutes,
            hospital_status: hospital.status,
            hospital_error: hospital.error,
            notes: place.notes.join("; "),
        }
    }
}
