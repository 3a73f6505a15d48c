//! Batch orchestration.
//!
//! Source records are combined, filtered, deduplicated and annotated with
//! perimeter distances in one synchronous pass, then matched against
//! airports and hospitals. Matching is resumable: a record already holding a
//! complete result for a facility kind is skipped.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::boundary::{CountryLookup, CountrySet};
use crate::config::Config;
use crate::distance::{annotate_perimeter_distances, load_perimeter_geojson, DistanceStats, Perimeter};
use crate::facility::{FacilityMatcher, MatchMode, MatchStats};
use crate::models::{FacilityKind, MatchResult, PlaceRecord};
use crate::resolver::filters::{
    enforce_country_by_boundary, enforce_min_population, exclude_countries, fill_missing_country,
    filter_within_perimeter,
};
use crate::resolver::{DedupeStats, EntityResolver};
use crate::sources::{Bbox, GeonamesClient, OverpassClient};

/// Settings for the resolution pass
#[derive(Debug, Clone)]
pub struct ResolveSettings {
    /// Countries the region is restricted to, if any
    pub allowed: Option<CountrySet>,
    pub excluded: CountrySet,
    pub min_population: u64,
    pub dedupe_threshold_km: f64,
    pub enforce_boundary_country: bool,
}

impl ResolveSettings {
    pub fn from_config(config: &Config) -> Self {
        let allowed = config.region.countries();
        Self {
            allowed: (!allowed.is_empty()).then(|| CountrySet::from_codes(allowed)),
            excluded: CountrySet::from_codes(config.region.excluded_countries()),
            min_population: config.region.min_population,
            dedupe_threshold_km: config.region.dedupe_threshold_km,
            enforce_boundary_country: config.region.enforce_boundary_country,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResolveReport {
    pub input: usize,
    pub after_exclusion: usize,
    pub inside_perimeter: usize,
    pub above_min_population: usize,
    pub dedupe: DedupeStats,
    pub distances: DistanceStats,
}

/// Filter, deduplicate and annotate combined source records
pub fn resolve_places(
    records: Vec<PlaceRecord>,
    lookup: &CountryLookup,
    perimeter: &Perimeter,
    settings: &ResolveSettings,
) -> (Vec<PlaceRecord>, ResolveReport) {
    let mut report = ResolveReport {
        input: records.len(),
        ..Default::default()
    };
    let allowed = settings.allowed.as_ref();

    let mut records = exclude_countries(records, &settings.excluded);
    report.after_exclusion = records.len();

    fill_missing_country(&mut records, lookup, allowed);
    if settings.enforce_boundary_country {
        enforce_country_by_boundary(&mut records, lookup, allowed);
    }

    let records = filter_within_perimeter(records, perimeter);
    report.inside_perimeter = records.len();

    let records = enforce_min_population(records, settings.min_population);
    report.above_min_population = records.len();

    let mut resolver = EntityResolver::new(lookup).with_threshold_km(settings.dedupe_threshold_km);
    if let Some(allowed) = &settings.allowed {
        resolver = resolver.with_allowed_countries(allowed.clone());
    }
    let (mut records, dedupe) = resolver.dedupe_with_stats(records);
    report.dedupe = dedupe;

    report.distances = annotate_perimeter_distances(&mut records, perimeter);

    info!(
        "Resolved {} source records into {} places",
        report.input,
        records.len()
    );
    (records, report)
}

/// The configured perimeter file, or the region preset's box when none is set
pub fn load_region_perimeter(config: &Config) -> crate::Result<Perimeter> {
    match &config.region.perimeter {
        Some(path) => Ok(load_perimeter_geojson(path)?),
        None => {
            let preset = config.region.preset();
            info!("No perimeter file, using the {} preset box", preset.name);
            let (min_lon, min_lat, max_lon, max_lat) = preset.bbox;
            Ok(Perimeter::from_bbox(min_lon, min_lat, max_lon, max_lat))
        }
    }
}

/// Region rectangle as (min_lon, min_lat, max_lon, max_lat): the perimeter's
/// envelope, else the preset box
pub fn region_envelope(perimeter: &Perimeter, config: &Config) -> (f64, f64, f64, f64) {
    perimeter.bbox().unwrap_or(config.region.preset().bbox)
}

/// Grow a rectangle by `margin_km` on every side
pub fn expand_envelope((min_lon, min_lat, max_lon, max_lat): (f64, f64, f64, f64), margin_km: f64) -> Bbox {
    let lat_margin = margin_km / 111.32;
    let widest = min_lat.abs().max(max_lat.abs()).min(89.0);
    let lon_margin = margin_km / (111.32 * widest.to_radians().cos());
    Bbox {
        south: (min_lat - lat_margin).max(-90.0),
        west: (min_lon - lon_margin).max(-180.0),
        north: (max_lat + lat_margin).min(90.0),
        east: (max_lon + lon_margin).min(180.0),
    }
}

/// Fetch and combine records from the gazetteer and the map database.
///
/// The gazetteer aborts the run only when configured as mandatory; map
/// database tiles that fail are skipped.
pub async fn collect_places(client: &Client, config: &Config, envelope: (f64, f64, f64, f64)) -> Result<Vec<PlaceRecord>> {
    let mut combined = Vec::new();

    match config.gazetteer.resolve_username(|key| std::env::var(key).ok()) {
        Some(username) => {
            let geonames = GeonamesClient::new(client.clone(), &config.gazetteer.endpoint, username)
                .with_page_size(config.gazetteer.page_size)
                .with_page_pause(Duration::from_millis(config.gazetteer.page_pause_ms))
                .with_retry(config.retry.clone());
            match geonames
                .fetch_countries(&config.region.countries(), config.region.min_population)
                .await
            {
                Ok(records) => combined.extend(records),
                Err(e) if config.gazetteer.mandatory => {
                    return Err(e).context("Gazetteer is mandatory and failed");
                }
                Err(e) => warn!("Gazetteer unavailable, continuing with map data only: {}", e),
            }
        }
        None => warn!("No gazetteer username configured, skipping the gazetteer"),
    }
    let from_gazetteer = combined.len();

    let overpass = overpass_client(client, config);
    let place_types = config.region.place_types();
    combined.extend(
        overpass
            .fetch_places(
                Bbox::from_envelope(envelope),
                &place_types,
                config.region.require_osm_population,
            )
            .await,
    );

    info!(
        "Collected {} gazetteer and {} map-database records",
        from_gazetteer,
        combined.len() - from_gazetteer
    );
    Ok(combined)
}

pub fn overpass_client(client: &Client, config: &Config) -> OverpassClient {
    let per_endpoint = crate::resilience::RetryPolicy {
        max_retries: config.map_database.retries_per_endpoint.saturating_sub(1),
        ..config.retry.clone()
    };
    OverpassClient::new(client.clone(), config.map_database.endpoints.clone())
        .with_retry(per_endpoint)
        .with_tiles(
            config.map_database.tile_size_deg,
            Duration::from_millis(config.map_database.tile_pause_ms),
        )
}

/// How a matching pass walks the batch
#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub mode: MatchMode,
    /// Places in flight at once; 1 is sequential
    pub concurrency: usize,
    /// Pause between places when sequential
    pub pacing: Duration,
    /// Process at most this many pending places
    pub limit: Option<usize>,
    pub show_progress: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            mode: MatchMode::Offline,
            concurrency: 1,
            pacing: Duration::from_millis(500),
            limit: None,
            show_progress: false,
        }
    }
}

fn slot(record: &PlaceRecord, kind: FacilityKind) -> Option<&MatchResult> {
    match kind {
        FacilityKind::Airport => record.airport.as_ref(),
        FacilityKind::Hospital => record.hospital.as_ref(),
    }
}

fn slot_mut(record: &mut PlaceRecord, kind: FacilityKind) -> &mut Option<MatchResult> {
    match kind {
        FacilityKind::Airport => &mut record.airport,
        FacilityKind::Hospital => &mut record.hospital,
    }
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Match every pending record against `matcher`, storing the result on the
/// record. Records with a complete result for this kind are left untouched.
pub async fn match_facilities(records: &mut [PlaceRecord], matcher: &FacilityMatcher, options: &MatchOptions) -> MatchStats {
    let kind = matcher.kind();
    let mut stats = MatchStats::default();

    let mut pending: Vec<(usize, PlaceRecord)> = Vec::new();
    for (i, record) in records.iter().enumerate() {
        if slot(record, kind).is_some_and(MatchResult::is_complete) {
            stats.skipped += 1;
        } else {
            pending.push((i, record.clone()));
        }
    }
    if let Some(limit) = options.limit {
        pending.truncate(limit);
    }

    let concurrency = options.concurrency.max(1);
    let sequential = concurrency == 1;
    let pb = progress_bar(pending.len() as u64, options.show_progress);
    pb.set_message(format!("{} matching", kind));

    let results: Vec<(usize, MatchResult)> = stream::iter(pending.into_iter().enumerate())
        .map(|(position, (index, place))| {
            let pb = &pb;
            async move {
                if sequential && position > 0 && !options.pacing.is_zero() {
                    tokio::time::sleep(options.pacing).await;
                }
                let result = matcher.find_nearest(&place, options.mode).await;
                pb.inc(1);
                (index, result)
            }
        })
        .buffered(concurrency)
        .collect()
        .await;
    pb.finish_and_clear();

    for (index, result) in results {
        stats.record(&result);
        *slot_mut(&mut records[index], kind) = Some(result);
    }
    stats.log(kind);
    stats
}

/// On-disk state of a run; reloading it resumes matching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub region: String,
    pub generated_at: DateTime<Utc>,
    pub places: Vec<PlaceRecord>,
}

impl Snapshot {
    pub fn new(region: impl Into<String>, places: Vec<PlaceRecord>) -> Self {
        Self {
            region: region.into(),
            generated_at: Utc::now(),
            places,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse snapshot {}", path.display()))
    }

    /// Write atomically through a temporary file next to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to move snapshot to {}", path.display()))?;
        Ok(())
    }
}

/// Write the flat CSV view of `places`
pub fn write_csv(path: &Path, places: &[PlaceRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
    for place in places {
        writer.serialize(crate::models::PlaceRow::from_place(place))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{BboxFallback, BoundaryIndex, BoundaryPolygon};
    use crate::distance::perimeter::square;
    use crate::error::RoutingError;
    use crate::facility::{MatcherConfig, RoutingService};
    use crate::models::{Facility, GeoPoint, MatchStatus, RouteEstimate, Source};
    use crate::resilience::RetryPolicy;
    use async_trait::async_trait;
    use geo::MultiPolygon;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingRouter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RoutingService for CountingRouter {
        async fn route(&self, _from: GeoPoint, _to: GeoPoint) -> Result<RouteEstimate, RoutingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RouteEstimate {
                distance_km: 10.0,
                duration_minutes: 12.0,
                confidence_pct: 95,
            })
        }
    }

    fn place(name: &str, lat: f64, lon: f64, source: Source) -> PlaceRecord {
        PlaceRecord::new(name, lat, lon, source).unwrap()
    }

    fn tyrol_lookup() -> CountryLookup {
        let index = BoundaryIndex::build(vec![
            BoundaryPolygon::new("AT", MultiPolygon::new(vec![square(10.0, 46.5, 13.0, 48.0)])),
            BoundaryPolygon::new("IT", MultiPolygon::new(vec![square(10.0, 45.0, 13.0, 46.5)])),
        ]);
        CountryLookup::new(Some(index), Some(BboxFallback::default()))
    }

    #[test]
    fn test_region_perimeter_from_preset_or_file() {
        let mut config = Config::default();
        let perimeter = load_region_perimeter(&config).unwrap();
        assert!(perimeter.is_usable());
        assert_eq!(perimeter.bbox(), Some(config.region.preset().bbox));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perimeter.geojson");
        fs::write(
            &path,
            r#"{"type":"Polygon","coordinates":[[[10.0,46.5],[13.0,46.5],[13.0,48.0],[10.0,48.0],[10.0,46.5]]]}"#,
        )
        .unwrap();
        config.region.perimeter = Some(path);
        let perimeter = load_region_perimeter(&config).unwrap();
        assert!(perimeter.contains(47.27, 11.40));

        config.region.perimeter = Some(dir.path().join("missing.geojson"));
        assert!(matches!(
            load_region_perimeter(&config),
            Err(crate::RidgelineError::Geometry(_))
        ));
    }

    fn settings() -> ResolveSettings {
        ResolveSettings {
            allowed: Some(CountrySet::from_codes(["AT", "IT", "DE"])),
            excluded: CountrySet::from_codes(["SI"]),
            min_population: 5000,
            dedupe_threshold_km: 10.0,
            enforce_boundary_country: false,
        }
    }

    #[test]
    fn test_resolve_places_end_to_end() {
        let records = vec![
            place("Innsbruck", 47.2692, 11.4041, Source::Gazetteer).with_population(130_000).with_country("AT"),
            place("Innsbruck", 47.2654, 11.3928, Source::MapDatabase).with_population(132_000),
            place("Bozen", 46.4983, 11.3548, Source::MapDatabase).with_population(107_000),
            place("Ljubljana", 46.05, 14.5, Source::Gazetteer).with_population(280_000).with_country("SI"),
            place("Hamlet", 47.1, 11.2, Source::MapDatabase).with_population(200),
            place("Paris", 48.85, 2.35, Source::Gazetteer).with_population(2_100_000).with_country("FR"),
        ];
        let perimeter = Perimeter::from_bbox(10.0, 45.0, 13.0, 48.0);

        let (resolved, report) = resolve_places(records, &tyrol_lookup(), &perimeter, &settings());
        let names: Vec<&str> = resolved.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Innsbruck", "Bozen"]);

        assert_eq!(report.input, 6);
        assert_eq!(report.after_exclusion, 5);
        assert_eq!(report.inside_perimeter, 4);
        assert_eq!(report.above_min_population, 3);
        assert_eq!(report.dedupe.merged, 1);

        let innsbruck = &resolved[0];
        assert_eq!(innsbruck.source, Source::Gazetteer);
        assert_eq!(innsbruck.country, "AT");
        assert_eq!(innsbruck.distance_km_to_perimeter, Some(0.0));
        assert_eq!(resolved[1].country, "IT");
        assert_eq!(report.distances.success, 2);
    }

    #[test]
    fn test_expand_envelope() {
        let bbox = expand_envelope((10.0, 46.0, 12.0, 47.0), 111.32);
        assert!((bbox.south - 45.0).abs() < 1e-9);
        assert!((bbox.north - 48.0).abs() < 1e-9);
        assert!(bbox.west < 9.0 && bbox.east > 13.0);
    }

    fn matcher(router: Arc<CountingRouter>) -> FacilityMatcher {
        FacilityMatcher::new(
            FacilityKind::Airport,
            vec![Facility::new("Innsbruck Airport", FacilityKind::Airport, 47.2602, 11.3440)],
            router,
            MatcherConfig {
                pacing: Duration::ZERO,
                retry: RetryPolicy::immediate(0),
                ..Default::default()
            },
        )
    }

    fn options() -> MatchOptions {
        MatchOptions {
            pacing: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_match_then_resume_skips_complete() {
        let router = Arc::new(CountingRouter { calls: AtomicUsize::new(0) });
        let matcher = matcher(router.clone());
        let mut records = vec![
            place("Innsbruck", 47.2692, 11.4041, Source::Gazetteer),
            place("Hall in Tirol", 47.2833, 11.5, Source::Gazetteer),
        ];

        let first = match_facilities(&mut records, &matcher, &options()).await;
        assert_eq!(first.routed, 2);
        assert_eq!(router.calls.load(Ordering::SeqCst), 2);
        let snapshot = records.clone();

        let second = match_facilities(&mut records, &matcher, &options()).await;
        assert_eq!(second.skipped, 2);
        assert_eq!(second.routed, 0);
        assert_eq!(router.calls.load(Ordering::SeqCst), 2);
        assert_eq!(records, snapshot);
    }

    #[tokio::test]
    async fn test_failed_results_are_retried_and_limit_applies() {
        let router = Arc::new(CountingRouter { calls: AtomicUsize::new(0) });
        let matcher = matcher(router.clone());
        let mut failed = place("Innsbruck", 47.2692, 11.4041, Source::Gazetteer);
        failed.airport = Some(MatchResult::failed(MatchStatus::RoutingFailed, "routing failed: HTTP 500"));
        let mut records = vec![
            failed,
            place("Hall in Tirol", 47.2833, 11.5, Source::Gazetteer),
            place("Schwaz", 47.35, 11.7, Source::Gazetteer),
        ];

        let limited = MatchOptions {
            limit: Some(2),
            concurrency: 2,
            ..options()
        };
        let stats = match_facilities(&mut records, &matcher, &limited).await;
        assert_eq!(stats.routed, 2);
        assert!(records[0].airport.as_ref().unwrap().is_complete());
        assert!(records[2].airport.is_none());
    }

    #[test]
    fn test_snapshot_and_csv_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut innsbruck = place("Innsbruck", 47.2692, 11.4041, Source::Gazetteer).with_country("AT");
        innsbruck.distance_km_to_perimeter = Some(0.0);
        let snapshot = Snapshot::new("alps", vec![innsbruck]);

        let json_path = dir.path().join("out/places.json");
        snapshot.save(&json_path).unwrap();
        let loaded = Snapshot::load(&json_path).unwrap();
        assert_eq!(loaded.places, snapshot.places);
        assert_eq!(loaded.region, "alps");

        let csv_path = dir.path().join("out/places.csv");
        write_csv(&csv_path, &loaded.places).unwrap();
        let text = fs::read_to_string(&csv_path).unwrap();
        assert!(text.starts_with("name,country,latitude,longitude"));
        assert!(text.contains("Innsbruck,AT,47.2692,11.4041"));
    }
}
