//! Ridgeline - place resolution and facility matching for mountain regions
//!
//! This library provides the resolution core (country boundaries, distances,
//! deduplication, facility matching) and the pipeline used by the `resolve`
//! binary.

pub mod boundary;
pub mod config;
pub mod distance;
pub mod error;
pub mod facility;
pub mod models;
pub mod pipeline;
pub mod resilience;
pub mod resolver;
pub mod sources;

pub use error::{Result, RidgelineError};
pub use models::{Facility, FacilityKind, MatchResult, MatchStatus, PlaceRecord, Source};
