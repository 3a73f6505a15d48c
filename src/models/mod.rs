//! Core data models for place resolution and facility matching.

pub mod facility;
pub mod place;
pub mod row;

pub use facility::{Facility, FacilityKind, MatchResult, MatchStatus, RouteEstimate};
pub use place::{name_key, normalize_country, GeoPoint, PlaceRecord, Source};
pub use row::PlaceRow;
