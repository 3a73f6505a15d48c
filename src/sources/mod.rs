//! Upstream place sources: the gazetteer and the map database.

pub mod geonames;
pub mod overpass;

use reqwest::Client;
use std::time::Duration;

use crate::error::SourceError;

pub use geonames::{parse_geonames_page, GeonamesClient, GeonamesPage, DEFAULT_GEONAMES_URL};
pub use overpass::{
    build_hospital_query, build_place_query, parse_hospitals, parse_places, tile_bbox, Bbox,
    OverpassClient, DEFAULT_OVERPASS_ENDPOINTS,
};

pub const USER_AGENT: &str = concat!("ridgeline/", env!("CARGO_PKG_VERSION"), " (place resolution)");

/// Shared HTTP client for every outbound call
pub fn build_client(timeout: Duration) -> Result<Client, SourceError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .gzip(true)
        .build()
        .map_err(|e| SourceError::Network(format!("failed to create HTTP client: {}", e)))
}

const GROUP_SEPARATORS: [char; 3] = [',', '\'', '_'];

/// Parse a number that may carry spaces or thousands separators
/// ("12 345", "12,345", "1'200", "1_000").
///
/// Separators must split the integer part into groups of three digits, so
/// a decimal comma such as "47,5" is rejected rather than misread.
pub(crate) fn parse_loose_f64(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let plain = if cleaned.contains(GROUP_SEPARATORS) {
        strip_grouping(&cleaned)?
    } else {
        cleaned
    };
    plain.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn strip_grouping(number: &str) -> Option<String> {
    let (integer, fraction) = match number.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (number, None),
    };
    let mut groups = integer.split(GROUP_SEPARATORS);
    let mut plain = groups.next()?.to_string();
    for group in groups {
        if group.len() != 3 || !group.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        plain.push_str(group);
    }
    if let Some(fraction) = fraction {
        plain.push('.');
        plain.push_str(fraction);
    }
    Some(plain)
}
