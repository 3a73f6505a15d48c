//! Nearest-facility search: coarse great-circle shortlist, then routing.
//!
//! Offline mode shortlists the K nearest candidates by air, routes to those
//! within the service radius one at a time (pausing between calls) and keeps
//! the fastest drive. Live mode asks the lookup service which facility is
//! nearest and routes to it. Every path ends in a `MatchResult` carrying an
//! explicit status; no route is ever invented.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::lookup::LiveLookup;
use super::routing::RoutingService;
use crate::distance::haversine_km;
use crate::error::{LookupError, RoutingError};
use crate::models::{Facility, FacilityKind, MatchResult, MatchStatus, PlaceRecord, RouteEstimate};
use crate::resilience::{retry, RetryPolicy};

/// Where candidates come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Pre-loaded candidate set
    Offline,
    /// Ask the live lookup service per place
    Live,
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Shortlist size
    pub k: usize,
    pub max_radius_km: f64,
    /// Pause between consecutive routing calls for one place
    pub pacing: Duration,
    pub retry: RetryPolicy,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            k: 3,
            max_radius_km: 300.0,
            pacing: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

/// A shortlisted candidate: index into the candidate set and distance by air
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shortlisted {
    pub index: usize,
    pub crow_flies_km: f64,
}

fn by_distance(a: &Shortlisted, b: &Shortlisted) -> Ordering {
    a.crow_flies_km
        .total_cmp(&b.crow_flies_km)
        .then(a.index.cmp(&b.index))
}

/// The `k` candidates nearest to (lat, lon) by great-circle distance,
/// ordered nearest first. Ties are broken by candidate index.
pub fn k_nearest(candidates: &[Facility], lat: f64, lon: f64, k: usize) -> Vec<Shortlisted> {
    let mut all: Vec<Shortlisted> = candidates
        .iter()
        .enumerate()
        .map(|(index, f)| Shortlisted {
            index,
            crow_flies_km: haversine_km(lat, lon, f.latitude, f.longitude),
        })
        .collect();

    let k = k.min(all.len());
    if k == 0 {
        return Vec::new();
    }
    if k < all.len() {
        all.select_nth_unstable_by(k - 1, by_distance);
        all.truncate(k);
    }
    all.sort_by(by_distance);
    all
}

/// Per-batch outcome counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MatchStats {
    pub routed: usize,
    pub routing_failed: usize,
    pub out_of_radius: usize,
    pub no_candidates: usize,
    pub lookup_failed: usize,
    pub skipped: usize,
}

impl MatchStats {
    pub fn record(&mut self, result: &MatchResult) {
        match result.status {
            MatchStatus::Routed => self.routed += 1,
            MatchStatus::RoutingFailed => self.routing_failed += 1,
            MatchStatus::OutOfServiceRadius => self.out_of_radius += 1,
            MatchStatus::NoCandidates => self.no_candidates += 1,
            MatchStatus::LookupFailed => self.lookup_failed += 1,
        }
    }

    pub fn log(&self, kind: FacilityKind) {
        info!(
            "{} matching: {} routed, {} routing failed, {} out of radius, {} without candidates, {} lookup failed, {} resumed",
            kind,
            self.routed,
            self.routing_failed,
            self.out_of_radius,
            self.no_candidates,
            self.lookup_failed,
            self.skipped
        );
    }
}

/// Matches places to the nearest facility of one kind.
///
/// Candidates and collaborators are shared read-only; one matcher can serve
/// many places concurrently.
pub struct FacilityMatcher {
    kind: FacilityKind,
    candidates: Arc<[Facility]>,
    router: Arc<dyn RoutingService>,
    live: Option<Arc<dyn LiveLookup>>,
    config: MatcherConfig,
}

impl FacilityMatcher {
    pub fn new(
        kind: FacilityKind,
        candidates: Vec<Facility>,
        router: Arc<dyn RoutingService>,
        config: MatcherConfig,
    ) -> Self {
        Self {
            kind,
            candidates: candidates.into(),
            router,
            live: None,
            config,
        }
    }

    pub fn with_live_lookup(mut self, live: Arc<dyn LiveLookup>) -> Self {
        self.live = Some(live);
        self
    }

    pub fn kind(&self) -> FacilityKind {
        self.kind
    }

    pub fn candidates(&self) -> &[Facility] {
        &self.candidates
    }

    pub async fn find_nearest(&self, place: &PlaceRecord, mode: MatchMode) -> MatchResult {
        match mode {
            MatchMode::Offline => self.find_offline(place).await,
            MatchMode::Live => self.find_live(place).await,
        }
    }

    async fn route_with_retry(&self, place: &PlaceRecord, facility: &Facility) -> Result<RouteEstimate, RoutingError> {
        let label = format!("route {} -> {}", place.name, facility.name);
        retry(&self.config.retry, &label, RoutingError::is_transient, || {
            self.router.route(place.point(), facility.point())
        })
        .await
    }

    async fn find_offline(&self, place: &PlaceRecord) -> MatchResult {
        if self.candidates.is_empty() {
            return MatchResult::failed(
                MatchStatus::NoCandidates,
                format!("no {} candidates loaded", self.kind),
            );
        }

        let shortlist = k_nearest(
            &self.candidates,
            place.latitude,
            place.longitude,
            self.config.k.max(1),
        );
        let within: Vec<Shortlisted> = shortlist
            .iter()
            .copied()
            .filter(|s| s.crow_flies_km <= self.config.max_radius_km)
            .collect();

        let Some(nearest_within) = within.first().copied() else {
            // Nothing in range: report the nearest by air without a route
            let Some(nearest) = shortlist.first().copied() else {
                return MatchResult::failed(MatchStatus::NoCandidates, "empty shortlist");
            };
            debug!(
                "{}: nearest {} is {:.1} km away, beyond {} km",
                place.name, self.kind, nearest.crow_flies_km, self.config.max_radius_km
            );
            return MatchResult::for_facility(
                self.candidates[nearest.index].clone(),
                nearest.crow_flies_km,
                MatchStatus::OutOfServiceRadius,
            );
        };

        let mut best: Option<(Shortlisted, RouteEstimate)> = None;
        let mut last_error: Option<RoutingError> = None;
        for (i, candidate) in within.iter().enumerate() {
            if i > 0 && !self.config.pacing.is_zero() {
                tokio::time::sleep(self.config.pacing).await;
            }
            let facility = &self.candidates[candidate.index];
            match self.route_with_retry(place, facility).await {
                Ok(route) => {
                    // Strict comparison keeps the nearer-by-air candidate on ties
                    if best.map_or(true, |(_, b)| route.duration_minutes < b.duration_minutes) {
                        best = Some((*candidate, route));
                    }
                }
                Err(e) => {
                    debug!("Routing {} -> {} failed: {}", place.name, facility.name, e);
                    last_error = Some(e);
                }
            }
        }

        match best {
            Some((chosen, route)) => {
                let mut result = MatchResult::for_facility(
                    self.candidates[chosen.index].clone(),
                    chosen.crow_flies_km,
                    MatchStatus::Routed,
                );
                result.route = Some(route);
                result
            }
            None => {
                let reason = last_error.map_or_else(|| "no attempt".to_string(), |e| e.to_string());
                warn!(
                    "All {} routing attempts failed for {}: {}",
                    within.len(),
                    place.name,
                    reason
                );
                let mut result = MatchResult::for_facility(
                    self.candidates[nearest_within.index].clone(),
                    nearest_within.crow_flies_km,
                    MatchStatus::RoutingFailed,
                );
                result.error = Some(format!("routing failed: {}", reason));
                result
            }
        }
    }

    async fn find_live(&self, place: &PlaceRecord) -> MatchResult {
        let Some(live) = &self.live else {
            return MatchResult::failed(MatchStatus::LookupFailed, "live lookup is not configured");
        };

        let label = format!("{} lookup for {}", self.kind, place.name);
        let answer = retry(&self.config.retry, &label, LookupError::is_retryable, || {
            live.lookup(place, self.kind)
        })
        .await;

        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                warn!("{} failed: {}", label, e);
                let mut result = MatchResult::failed(MatchStatus::LookupFailed, e.to_string());
                if let LookupError::Unparsable { raw } = e {
                    result.reasoning = Some(raw);
                }
                return result;
            }
        };

        let Some(facility) = answer.facility(self.kind) else {
            let mut result = MatchResult::failed(
                MatchStatus::LookupFailed,
                format!(
                    "missing coordinates for {}",
                    answer.label().unwrap_or("the identified facility")
                ),
            );
            result.lookup_confidence_pct = answer.confidence_pct;
            result.reasoning = answer.reasoning;
            return result;
        };

        let crow_flies_km = haversine_km(
            place.latitude,
            place.longitude,
            facility.latitude,
            facility.longitude,
        );
        let route = self.route_with_retry(place, &facility).await;

        let mut result = MatchResult::for_facility(facility, crow_flies_km, MatchStatus::Routed);
        result.lookup_confidence_pct = answer.confidence_pct;
        result.reasoning = answer.reasoning;
        match route {
            Ok(route) => result.route = Some(route),
            Err(e) => {
                result.status = MatchStatus::RoutingFailed;
                result.error = Some(format!("routing failed: {}", e));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facility::lookup::LiveAnswer;
    use crate::models::{GeoPoint, Source};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Drives at 60 km/h along the great circle, optionally failing
    struct FakeRouter {
        fail_with: Option<RoutingError>,
        calls: Mutex<Vec<(f64, f64)>>,
        /// Fixed durations by destination latitude, overriding the speed model
        durations: Vec<(f64, f64)>,
    }

    impl FakeRouter {
        fn working() -> Self {
            Self {
                fail_with: None,
                calls: Mutex::new(Vec::new()),
                durations: Vec::new(),
            }
        }

        fn failing(error: RoutingError) -> Self {
            Self {
                fail_with: Some(error),
                ..Self::working()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RoutingService for FakeRouter {
        async fn route(&self, from: GeoPoint, to: GeoPoint) -> Result<RouteEstimate, RoutingError> {
            self.calls.lock().unwrap().push((to.lat, to.lon));
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            let km = haversine_km(from.lat, from.lon, to.lat, to.lon) * 1.3;
            let minutes = self
                .durations
                .iter()
                .find(|(lat, _)| *lat == to.lat)
                .map(|(_, m)| *m)
                .unwrap_or(km);
            Ok(RouteEstimate {
                distance_km: km,
                duration_minutes: minutes,
                confidence_pct: 95,
            })
        }
    }

    struct FakeLookup {
        answer: Result<LiveAnswer, LookupError>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl LiveLookup for FakeLookup {
        async fn lookup(&self, _place: &PlaceRecord, _kind: FacilityKind) -> Result<LiveAnswer, LookupError> {
            *self.calls.lock().unwrap() += 1;
            self.answer.clone()
        }
    }

    fn config() -> MatcherConfig {
        MatcherConfig {
            k: 3,
            max_radius_km: 300.0,
            pacing: Duration::ZERO,
            retry: RetryPolicy::immediate(2),
        }
    }

    fn airport(name: &str, lat: f64, lon: f64) -> Facility {
        Facility::new(name, FacilityKind::Airport, lat, lon)
    }

    fn alpine_airports() -> Vec<Facility> {
        vec![
            airport("Munich", 48.3538, 11.7861),
            airport("Innsbruck", 47.2602, 11.3440),
            airport("Verona", 45.3957, 10.8885),
            airport("Salzburg", 47.7933, 13.0043),
            airport("Reykjavik", 64.1300, -21.9406),
        ]
    }

    fn innsbruck() -> PlaceRecord {
        PlaceRecord::new("Innsbruck", 47.2692, 11.4041, Source::Gazetteer).unwrap()
    }

    #[test]
    fn test_k_nearest_orders_shortlist() {
        let airports = alpine_airports();
        let shortlist = k_nearest(&airports, 47.2692, 11.4041, 3);
        let names: Vec<&str> = shortlist.iter().map(|s| airports[s.index].name.as_str()).collect();
        assert_eq!(names, vec!["Innsbruck", "Munich", "Salzburg"]);
        assert!(shortlist.windows(2).all(|w| w[0].crow_flies_km <= w[1].crow_flies_km));

        assert_eq!(k_nearest(&airports, 47.0, 11.0, 10).len(), 5);
        assert!(k_nearest(&[], 47.0, 11.0, 3).is_empty());
    }

    #[tokio::test]
    async fn test_picks_fastest_drive_within_radius() {
        let mut router = FakeRouter::working();
        // Munich is further by air but quicker by road in this fake
        router.durations = vec![(47.2602, 45.0), (48.3538, 30.0), (47.7933, 120.0)];
        let router = Arc::new(router);
        let matcher = FacilityMatcher::new(FacilityKind::Airport, alpine_airports(), router.clone(), config());

        let result = matcher.find_nearest(&innsbruck(), MatchMode::Offline).await;
        assert_eq!(result.status, MatchStatus::Routed);
        assert_eq!(result.facility.unwrap().name, "Munich");
        assert_eq!(result.route.unwrap().duration_minutes, 30.0);
        assert!(result.error.is_none());
        assert_eq!(router.call_count(), 3);
    }

    #[tokio::test]
    async fn test_all_routing_fails_returns_nearest_within_radius() {
        let router = Arc::new(FakeRouter::failing(RoutingError::Http(500)));
        let matcher = FacilityMatcher::new(FacilityKind::Airport, alpine_airports(), router.clone(), config());

        let result = matcher.find_nearest(&innsbruck(), MatchMode::Offline).await;
        assert_eq!(result.status, MatchStatus::RoutingFailed);
        assert_eq!(result.facility.as_ref().unwrap().name, "Innsbruck");
        assert!(result.route.is_none());
        assert!(result.error.as_deref().unwrap().starts_with("routing failed"));
        assert!(!result.is_complete());
        // Three candidates, three attempts each
        assert_eq!(router.call_count(), 9);
    }

    #[tokio::test]
    async fn test_no_route_is_not_retried() {
        let router = Arc::new(FakeRouter::failing(RoutingError::NoRoute));
        let matcher = FacilityMatcher::new(FacilityKind::Airport, alpine_airports(), router.clone(), config());
        let result = matcher.find_nearest(&innsbruck(), MatchMode::Offline).await;
        assert_eq!(result.status, MatchStatus::RoutingFailed);
        assert_eq!(router.call_count(), 3);
    }

    #[tokio::test]
    async fn test_out_of_radius_reports_nearest_without_route() {
        let router = Arc::new(FakeRouter::working());
        let matcher = FacilityMatcher::new(FacilityKind::Airport, alpine_airports(), router.clone(), config());
        let tromso = PlaceRecord::new("Tromsø", 69.6492, 18.9553, Source::Gazetteer).unwrap();

        let result = matcher.find_nearest(&tromso, MatchMode::Offline).await;
        assert_eq!(result.status, MatchStatus::OutOfServiceRadius);
        assert_eq!(result.facility.as_ref().unwrap().name, "Reykjavik");
        assert!(result.route.is_none());
        assert!(result.crow_flies_km.unwrap() > 300.0);
        assert_eq!(router.call_count(), 0);
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let matcher = FacilityMatcher::new(
            FacilityKind::Hospital,
            Vec::new(),
            Arc::new(FakeRouter::working()),
            config(),
        );
        let result = matcher.find_nearest(&innsbruck(), MatchMode::Offline).await;
        assert_eq!(result.status, MatchStatus::NoCandidates);
        assert!(result.facility.is_none());
    }

    #[tokio::test]
    async fn test_live_lookup_then_route() {
        let lookup = Arc::new(FakeLookup {
            answer: Ok(LiveAnswer {
                name: Some("Innsbruck Airport".into()),
                iata: Some("INN".into()),
                latitude: Some(47.2602),
                longitude: Some(11.3440),
                confidence_pct: Some(90),
                ..Default::default()
            }),
            calls: Mutex::new(0),
        });
        let matcher = FacilityMatcher::new(
            FacilityKind::Airport,
            Vec::new(),
            Arc::new(FakeRouter::working()),
            config(),
        )
        .with_live_lookup(lookup.clone());

        let result = matcher.find_nearest(&innsbruck(), MatchMode::Live).await;
        assert_eq!(result.status, MatchStatus::Routed);
        assert_eq!(result.lookup_confidence_pct, Some(90));
        assert!(result.route.is_some());
        assert_eq!(*lookup.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_live_lookup_retries_then_fails() {
        let lookup = Arc::new(FakeLookup {
            answer: Err(LookupError::NoFacility),
            calls: Mutex::new(0),
        });
        let matcher = FacilityMatcher::new(
            FacilityKind::Airport,
            Vec::new(),
            Arc::new(FakeRouter::working()),
            config(),
        )
        .with_live_lookup(lookup.clone());

        let result = matcher.find_nearest(&innsbruck(), MatchMode::Live).await;
        assert_eq!(result.status, MatchStatus::LookupFailed);
        assert!(result.error.is_some());
        assert_eq!(*lookup.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_live_mode_without_service() {
        let matcher = FacilityMatcher::new(
            FacilityKind::Airport,
            alpine_airports(),
            Arc::new(FakeRouter::working()),
            config(),
        );
        let result = matcher.find_nearest(&innsbruck(), MatchMode::Live).await;
        assert_eq!(result.status, MatchStatus::LookupFailed);
    }

    #[test]
    fn test_stats_record() {
        let mut stats = MatchStats::default();
        stats.record(&MatchResult::failed(MatchStatus::NoCandidates, "none"));
        stats.record(&MatchResult::failed(MatchStatus::LookupFailed, "x"));
        assert_eq!(stats.no_candidates, 1);
        assert_eq!(stats.lookup_failed, 1);
    }
}
