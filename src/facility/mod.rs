//! Nearest airport and hospital matching.
//!
//! Candidates come from an offline set (OurAirports, hospital queries) or,
//! opt-in, from a live lookup service. Driving distances come from a
//! routing service behind the `RoutingService` trait.

pub mod airports;
pub mod lookup;
pub mod matcher;
pub mod routing;

pub use airports::{load_airports, parse_airports_csv, validate_airports_csv, DEFAULT_AIRPORTS_URL};
pub use lookup::{LiveAnswer, LiveLookup, OpenAiLookup, DEFAULT_LOOKUP_MODEL, DEFAULT_LOOKUP_URL};
pub use matcher::{k_nearest, FacilityMatcher, MatchMode, MatchStats, MatcherConfig, Shortlisted};
pub use routing::{estimate_from_route, OsrmClient, RoutingService, DEFAULT_OSRM_URL};
