//! Record filters applied before deduplication.

use rayon::prelude::*;
use tracing::{info, warn};

use crate::boundary::{rough_box, CountryLookup, CountrySet};
use crate::distance::Perimeter;
use crate::models::PlaceRecord;

/// Drop records whose country is excluded.
///
/// A record without a country is dropped when it falls inside the rough
/// rectangle of an excluded country.
pub fn exclude_countries(records: Vec<PlaceRecord>, excluded: &CountrySet) -> Vec<PlaceRecord> {
    if excluded.is_empty() {
        return records;
    }
    let boxes: Vec<_> = records
        .iter()
        .any(|r| !r.has_country())
        .then(|| {
            CODES_WITH_BOXES
                .iter()
                .filter(|c| excluded.contains(c))
                .filter_map(|c| rough_box(c))
                .collect()
        })
        .unwrap_or_default();

    let before = records.len();
    let kept: Vec<PlaceRecord> = records
        .into_iter()
        .filter(|r| {
            if r.has_country() {
                !excluded.contains(&r.country)
            } else {
                !boxes.iter().any(|b| b.contains(r.latitude, r.longitude))
            }
        })
        .collect();
    info!(
        "Country exclusion removed {} of {} records",
        before - kept.len(),
        before
    );
    kept
}

const CODES_WITH_BOXES: [&str; 7] = ["AT", "DE", "FR", "IT", "CH", "SI", "LI"];

/// Infer a country for records that have none. Returns how many were filled.
pub fn fill_missing_country(
    records: &mut [PlaceRecord],
    lookup: &CountryLookup,
    allowed: Option<&CountrySet>,
) -> usize {
    let filled: usize = records
        .par_iter_mut()
        .filter(|r| !r.has_country())
        .map(|r| {
            let code = lookup.infer(r.latitude, r.longitude, allowed);
            if code.is_empty() {
                0
            } else {
                r.country = code;
                1
            }
        })
        .sum();
    info!("Filled missing country on {} records", filled);
    filled
}

/// Overwrite each record's country with the boundary inference, keeping the
/// existing value when inference fails. Returns how many changed.
pub fn enforce_country_by_boundary(
    records: &mut [PlaceRecord],
    lookup: &CountryLookup,
    allowed: Option<&CountrySet>,
) -> usize {
    let changed: usize = records
        .par_iter_mut()
        .map(|r| {
            let code = lookup.infer(r.latitude, r.longitude, allowed);
            if !code.is_empty() && code != r.country {
                r.country = code;
                1
            } else {
                0
            }
        })
        .sum();
    info!("Boundary check changed the country of {} records", changed);
    changed
}

/// Keep records strictly inside the perimeter.
///
/// An unusable perimeter keeps everything, since inclusion cannot be decided.
pub fn filter_within_perimeter(records: Vec<PlaceRecord>, perimeter: &Perimeter) -> Vec<PlaceRecord> {
    if !perimeter.is_usable() {
        warn!("Perimeter unusable, skipping the inclusion filter");
        return records;
    }
    let before = records.len();
    let kept: Vec<PlaceRecord> = records
        .into_par_iter()
        .filter(|r| perimeter.contains(r.latitude, r.longitude))
        .collect();
    info!("{} of {} records inside the perimeter", kept.len(), before);
    kept
}

pub fn enforce_min_population(records: Vec<PlaceRecord>, min_population: u64) -> Vec<PlaceRecord> {
    records
        .into_iter()
        .filter(|r| r.population >= min_population)
        .collect()
}
