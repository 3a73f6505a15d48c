//! Hand-specified country rectangles.
//!
//! Used as the lookup path when the polygon dataset is unavailable, and by
//! the country exclusion filter for records without a country code.

use geo::{Contains, Coord, Point, Rect};
use serde::Deserialize;
use tracing::debug;

use super::CountrySet;
use crate::models::normalize_country;

/// A country code with a rough bounding rectangle, in degrees
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FallbackBox {
    pub code: String,
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl FallbackBox {
    pub fn new(code: &str, min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            code: normalize_country(code),
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    pub fn rect(&self) -> Rect<f64> {
        Rect::new(
            Coord { x: self.min_lon, y: self.min_lat },
            Coord { x: self.max_lon, y: self.max_lat },
        )
    }

    /// Strict interior test; points on the edge are outside
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.rect().contains(&Point::new(lon, lat))
    }
}

// Rough boxes for the countries around the Alps
const ROUGH_BOXES: [(&str, f64, f64, f64, f64); 7] = [
    ("AT", 9.53, 46.37, 17.16, 49.02),
    ("DE", 5.87, 47.27, 15.04, 55.06),
    ("FR", -5.14, 41.33, 9.56, 51.09),
    ("IT", 6.62, 35.29, 18.79, 47.09),
    ("CH", 5.96, 45.80, 10.49, 47.81),
    ("SI", 13.37, 45.40, 16.61, 46.88),
    ("LI", 9.47, 47.05, 9.64, 47.27),
];

/// Rough rectangle for a known country code
pub fn rough_box(code: &str) -> Option<FallbackBox> {
    let code = normalize_country(code);
    ROUGH_BOXES
        .iter()
        .find(|(c, ..)| *c == code)
        .map(|&(c, min_lon, min_lat, max_lon, max_lat)| {
            FallbackBox::new(c, min_lon, min_lat, max_lon, max_lat)
        })
}

/// Ordered list of country rectangles; the first containing box wins
#[derive(Debug, Clone, PartialEq)]
pub struct BboxFallback {
    boxes: Vec<FallbackBox>,
}

impl Default for BboxFallback {
    /// DE before AT (Munich) and IT before FR (Turin, Milan)
    fn default() -> Self {
        Self::from_boxes(["DE", "IT", "AT", "FR"].iter().filter_map(|c| rough_box(c)).collect())
    }
}

impl BboxFallback {
    pub fn from_boxes(boxes: Vec<FallbackBox>) -> Self {
        Self { boxes }
    }

    pub fn boxes(&self) -> &[FallbackBox] {
        &self.boxes
    }

    pub fn lookup(&self, lat: f64, lon: f64, allowed: Option<&CountrySet>) -> Option<String> {
        let hit = self
            .boxes
            .iter()
            .filter(|b| allowed.map_or(true, |set| set.is_empty() || set.contains(&b.code)))
            .find(|b| b.contains(lat, lon))
            .map(|b| b.code.clone());
        debug!("Bounding-box lookup at ({}, {}): {:?}", lat, lon, hit);
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let fallback = BboxFallback::default();
        // Munich is in both the DE and AT boxes
        assert_eq!(fallback.lookup(48.1351, 11.5820, None), Some("DE".to_string()));
        // Turin is in both the IT and FR boxes
        assert_eq!(fallback.lookup(45.0703, 7.6869, None), Some("IT".to_string()));
        assert_eq!(fallback.lookup(47.2692, 11.4041, None), Some("AT".to_string()));
        assert_eq!(fallback.lookup(0.0, 0.0, None), None);
    }

    #[test]
    fn test_allowed_restricts_boxes() {
        let fallback = BboxFallback::default();
        let only_at = CountrySet::from_codes(["AT"]);
        assert_eq!(
            fallback.lookup(48.1351, 11.5820, Some(&only_at)),
            Some("AT".to_string())
        );
    }

    #[test]
    fn test_override_boxes() {
        let fallback = BboxFallback::from_boxes(vec![FallbackBox::new("es", -9.4, 36.0, 3.4, 43.8)]);
        assert_eq!(fallback.lookup(42.5, 0.5, None), Some("ES".to_string()));
        assert_eq!(fallback.lookup(48.1351, 11.5820, None), None);
    }

    #[test]
    fn test_rough_box_lookup() {
        assert!(rough_box("ch").unwrap().contains(46.95, 7.45));
        assert!(rough_box("XX").is_none());
    }
}
