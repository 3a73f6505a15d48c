//! Entity Resolver: merges gazetteer and map-database records into one
//! deduplicated list.
//!
//! Records are visited largest population first. Each one either becomes a
//! new kept record or is folded into an already kept record with the same
//! normalized name lying within the distance threshold. The pass is greedy
//! and deterministic: given the same input and the same country lookup the
//! output is identical across runs.

pub mod filters;

use hashbrown::HashMap;
use tracing::{debug, info};

use crate::boundary::{CountryLookup, CountrySet};
use crate::distance::haversine_km;
use crate::models::{PlaceRecord, Source};

pub const DEFAULT_DEDUPE_THRESHOLD_KM: f64 = 10.0;

/// Counters for one dedupe pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupeStats {
    pub input: usize,
    pub kept: usize,
    pub merged: usize,
    /// Merges where the incoming record replaced the kept one
    pub replaced: usize,
}

pub struct EntityResolver<'a> {
    lookup: &'a CountryLookup,
    threshold_km: f64,
    allowed: Option<CountrySet>,
}

impl<'a> EntityResolver<'a> {
    pub fn new(lookup: &'a CountryLookup) -> Self {
        Self {
            lookup,
            threshold_km: DEFAULT_DEDUPE_THRESHOLD_KM,
            allowed: None,
        }
    }

    pub fn with_threshold_km(mut self, threshold_km: f64) -> Self {
        self.threshold_km = threshold_km;
        self
    }

    /// Restrict country inference to these codes
    pub fn with_allowed_countries(mut self, allowed: CountrySet) -> Self {
        self.allowed = (!allowed.is_empty()).then_some(allowed);
        self
    }

    pub fn dedupe(&self, records: Vec<PlaceRecord>) -> Vec<PlaceRecord> {
        self.dedupe_with_stats(records).0
    }

    pub fn dedupe_with_stats(&self, mut records: Vec<PlaceRecord>) -> (Vec<PlaceRecord>, DedupeStats) {
        let mut stats = DedupeStats {
            input: records.len(),
            ..Default::default()
        };

        // Stable: equal populations keep input order
        records.sort_by(|a, b| b.population.cmp(&a.population));

        let mut kept: Vec<PlaceRecord> = Vec::with_capacity(records.len());
        // Normalized name -> indices into `kept`, in acceptance order
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();

        for mut candidate in records {
            let key = candidate.name_key();
            let duplicate_of = by_name.get(&key).and_then(|indices| {
                indices.iter().copied().find(|&i| {
                    haversine_km(
                        candidate.latitude,
                        candidate.longitude,
                        kept[i].latitude,
                        kept[i].longitude,
                    ) <= self.threshold_km
                })
            });

            // A replacement moves the kept slot to the incoming coordinates,
            // which can bring it within range of another kept namesake. Those
            // chains are not merged again in this pass.
            match duplicate_of {
                Some(i) => {
                    stats.merged += 1;
                    if self.merge_into(&mut kept[i], candidate) {
                        stats.replaced += 1;
                    }
                }
                None => {
                    if !candidate.has_country() {
                        candidate.country = self.infer(&candidate);
                    }
                    by_name.entry(key).or_default().push(kept.len());
                    kept.push(candidate);
                }
            }
        }

        // Replacements can put a smaller record in an earlier slot
        kept.sort_by(|a, b| b.population.cmp(&a.population));

        stats.kept = kept.len();
        info!(
            "Dedupe: {} records in, {} kept, {} merged ({} replaced by a preferred duplicate)",
            stats.input, stats.kept, stats.merged, stats.replaced
        );
        (kept, stats)
    }

    fn infer(&self, record: &PlaceRecord) -> String {
        self.lookup
            .infer(record.latitude, record.longitude, self.allowed.as_ref())
    }

    /// Fold `candidate` into `kept`. Returns true when the candidate replaced
    /// the kept record.
    fn merge_into(&self, kept: &mut PlaceRecord, mut candidate: PlaceRecord) -> bool {
        let candidate_wins = prefers(&candidate, kept);
        let country = {
            let (preferred, other) = if candidate_wins {
                (&candidate, &*kept)
            } else {
                (&*kept, &candidate)
            };
            resolve_country(
                &self.infer(preferred),
                &self.infer(other),
                &preferred.country,
            )
        };

        debug!(
            "Merging duplicate '{}' ({}) into '{}' ({}), {} wins, country {}",
            candidate.name,
            candidate.source,
            kept.name,
            kept.source,
            if candidate_wins { "incoming" } else { "kept" },
            country
        );

        if candidate_wins {
            candidate.country = country;
            *kept = candidate;
        } else {
            kept.country = country;
        }
        candidate_wins
    }
}

/// Whether `a` should represent a duplicate pair over `b`: the gazetteer beats
/// the map database, then higher population wins. Ties keep `b`.
pub fn prefers(a: &PlaceRecord, b: &PlaceRecord) -> bool {
    if a.source != b.source {
        a.source == Source::Gazetteer
    } else {
        a.population > b.population
    }
}

/// Country for a merged pair from each record's boundary inference.
///
/// Agreement or disagreement both yield the preferred record's inference;
/// a single inference is used as is; with none, the preferred record keeps
/// its existing country.
pub fn resolve_country(preferred_inferred: &str, other_inferred: &str, preferred_existing: &str) -> String {
    match (preferred_inferred.is_empty(), other_inferred.is_empty()) {
        (false, _) => preferred_inferred.to_string(),
        (true, false) => other_inferred.to_string(),
        (true, true) => preferred_existing.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{BoundaryIndex, BoundaryPolygon};
    use crate::distance::perimeter::square;
    use geo::MultiPolygon;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    /// AT east of 10.5°E, CH west of it
    fn lookup() -> CountryLookup {
        CountryLookup::from_index(BoundaryIndex::build(vec![
            BoundaryPolygon::new("AT", MultiPolygon::new(vec![square(10.5, 46.4, 17.1, 49.0)])),
            BoundaryPolygon::new("CH", MultiPolygon::new(vec![square(6.0, 45.8, 10.5, 47.8)])),
        ]))
    }

    fn place(name: &str, lat: f64, lon: f64, source: Source, population: u64) -> PlaceRecord {
        PlaceRecord::new(name, lat, lon, source)
            .unwrap()
            .with_population(population)
    }

    #[test]
    fn test_innsbruck_keeps_gazetteer_record() {
        let lookup = lookup();
        let resolver = EntityResolver::new(&lookup);
        let records = vec![
            place("innsbruck ", 47.2800, 11.4041, Source::MapDatabase, 0),
            place("Innsbruck", 47.2692, 11.4041, Source::Gazetteer, 130_000),
        ];

        let (out, stats) = resolver.dedupe_with_stats(records);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source, Source::Gazetteer);
        assert_eq!(out[0].population, 130_000);
        assert_eq!(out[0].country, "AT");
        assert_eq!(stats.merged, 1);
        assert_eq!(stats.replaced, 0);
    }

    #[test]
    fn test_gazetteer_replaces_larger_map_record() {
        let lookup = lookup();
        let resolver = EntityResolver::new(&lookup);
        let records = vec![
            place("Innsbruck", 47.2800, 11.4041, Source::MapDatabase, 150_000),
            place("Innsbruck", 47.2692, 11.4041, Source::Gazetteer, 130_000),
        ];
        let (out, stats) = resolver.dedupe_with_stats(records);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source, Source::Gazetteer);
        assert_eq!(out[0].latitude, 47.2692);
        assert_eq!(stats.replaced, 1);
    }

    #[test]
    fn test_same_source_higher_population_wins() {
        let kept = place("Lienz", 46.83, 12.77, Source::MapDatabase, 12_000);
        let bigger = place("Lienz", 46.83, 12.77, Source::MapDatabase, 13_000);
        let same = place("Lienz", 46.83, 12.77, Source::MapDatabase, 12_000);
        assert!(prefers(&bigger, &kept));
        assert!(!prefers(&same, &kept));
    }

    #[test]
    fn test_far_apart_namesakes_are_kept() {
        let lookup = lookup();
        let resolver = EntityResolver::new(&lookup);
        let records = vec![
            place("Neustift", 47.11, 11.31, Source::Gazetteer, 4_000),
            place("Neustift", 48.00, 16.00, Source::Gazetteer, 3_000),
        ];
        assert_eq!(resolver.dedupe(records).len(), 2);
    }

    #[test]
    fn test_disagreeing_inference_follows_preferred_record() {
        let lookup = lookup();
        let resolver = EntityResolver::new(&lookup);
        // Straddling the 10.5°E border, 3 km apart
        let records = vec![
            place("Grenzdorf", 47.0, 10.48, Source::MapDatabase, 9_000),
            place("Grenzdorf", 47.0, 10.52, Source::Gazetteer, 1_000).with_country("IT"),
        ];
        let out = resolver.dedupe(records);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source, Source::Gazetteer);
        assert_eq!(out[0].country, "AT");
    }

    #[test]
    fn test_resolve_country_rules() {
        assert_eq!(resolve_country("AT", "AT", "DE"), "AT");
        assert_eq!(resolve_country("AT", "CH", "DE"), "AT");
        assert_eq!(resolve_country("", "CH", "DE"), "CH");
        assert_eq!(resolve_country("", "", "DE"), "DE");
    }

    #[test]
    fn test_allowed_countries_restrict_fill() {
        let lookup = lookup();
        // On the shared border both polygons touch the point; AT comes first
        let on_border = || vec![place("Grenzhof", 47.0, 10.5, Source::Gazetteer, 800)];
        assert_eq!(EntityResolver::new(&lookup).dedupe(on_border())[0].country, "AT");

        let resolver = EntityResolver::new(&lookup).with_allowed_countries(CountrySet::from_codes(["CH"]));
        assert_eq!(resolver.dedupe(on_border())[0].country, "CH");
    }

    #[test]
    fn test_idempotent() {
        let lookup = lookup();
        let resolver = EntityResolver::new(&lookup);
        let records = vec![
            place("Innsbruck", 47.2692, 11.4041, Source::Gazetteer, 130_000),
            place("Innsbruck", 47.2800, 11.4041, Source::MapDatabase, 0),
            place("Hall in Tirol", 47.2833, 11.5078, Source::Gazetteer, 14_000),
            place("Hall  in tirol", 47.2850, 11.5000, Source::MapDatabase, 13_500),
            place("Landeck", 47.14, 10.56, Source::MapDatabase, 8_000),
        ];
        let once = resolver.dedupe(records);
        let twice = resolver.dedupe(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn test_idempotent_after_replacement() {
        let lookup = lookup();
        let resolver = EntityResolver::new(&lookup);
        let records = vec![
            place("Innsbruck", 47.2800, 11.4041, Source::MapDatabase, 150_000),
            place("Hall in Tirol", 47.2833, 11.5078, Source::Gazetteer, 140_000),
            place("Innsbruck", 47.2692, 11.4041, Source::Gazetteer, 130_000),
        ];
        let (once, stats) = resolver.dedupe_with_stats(records);
        assert_eq!(stats.replaced, 1);
        let names: Vec<&str> = once.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Hall in Tirol", "Innsbruck"]);
        assert!(once.windows(2).all(|w| w[0].population >= w[1].population));

        let twice = resolver.dedupe(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_shuffled_input_same_set() {
        let lookup = lookup();
        let resolver = EntityResolver::new(&lookup);
        let records: Vec<PlaceRecord> = (0..20)
            .map(|i| {
                place(
                    &format!("Ort {}", i),
                    46.5 + i as f64 * 0.1,
                    10.0 + i as f64 * 0.2,
                    Source::Gazetteer,
                    1_000 * (i % 4),
                )
            })
            .collect();

        let sorted_names = |out: Vec<PlaceRecord>| {
            let mut names: Vec<(String, String)> = out.into_iter().map(|r| (r.name, r.country)).collect();
            names.sort();
            names
        };

        let baseline = sorted_names(resolver.dedupe(records.clone()));
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..5 {
            let mut shuffled = records.clone();
            shuffled.shuffle(&mut rng);
            assert_eq!(sorted_names(resolver.dedupe(shuffled)), baseline);
        }
    }
}
