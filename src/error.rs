//! Error taxonomy shared by the resolution core.

use thiserror::Error;

/// A place record failed basic coordinate validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("latitude {0} outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("coordinate is not a finite number")]
    NotFinite,
}

/// Perimeter geometry problems.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("perimeter contains no polygons")]
    Empty,
    #[error("perimeter is invalid and could not be repaired")]
    Unrepairable,
    #[error("unsupported perimeter geometry: {0}")]
    Unsupported(String),
    #[error("failed to parse perimeter GeoJSON: {0}")]
    Parse(String),
}

/// Failures while loading the country boundary dataset.
#[derive(Error, Debug)]
pub enum BoundaryError {
    #[error("failed to parse boundary GeoJSON: {0}")]
    Parse(String),
    #[error("boundary dataset I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("boundary dataset could not be downloaded from any mirror")]
    Unavailable,
}

/// Failures talking to the gazetteer or map-database services.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("service reported an error: {0}")]
    Service(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Http(status) => *status == 429 || *status >= 500,
            SourceError::Network(_) => true,
            SourceError::Decode(_) | SourceError::Service(_) | SourceError::Io(_) => false,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => SourceError::Http(status.as_u16()),
            None if err.is_decode() => SourceError::Decode(err.to_string()),
            None => SourceError::Network(err.to_string()),
        }
    }
}

/// Structured failure of one routing call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("HTTP {0} from routing service")]
    Http(u16),
    #[error("no route found")]
    NoRoute,
    #[error("routing network failure: {0}")]
    Network(String),
    #[error("could not decode routing response: {0}")]
    Decode(String),
}

impl RoutingError {
    pub fn is_transient(&self) -> bool {
        match self {
            RoutingError::Http(status) => *status == 429 || *status >= 500,
            RoutingError::Network(_) => true,
            RoutingError::NoRoute | RoutingError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for RoutingError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => RoutingError::Http(status.as_u16()),
            None if err.is_decode() => RoutingError::Decode(err.to_string()),
            None => RoutingError::Network(err.to_string()),
        }
    }
}

/// Failure of the live facility lookup service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("lookup service returned no output")]
    EmptyOutput,
    #[error("failed to parse JSON from lookup output")]
    Unparsable { raw: String },
    #[error("lookup answer names no facility")]
    NoFacility,
    #[error("HTTP {0} from lookup service")]
    Http(u16),
    #[error("lookup network failure: {0}")]
    Network(String),
}

impl LookupError {
    /// Every failure except a client-side HTTP error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            LookupError::Http(status) => *status == 429 || *status >= 500,
            _ => true,
        }
    }
}

impl From<reqwest::Error> for LookupError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => LookupError::Http(status.as_u16()),
            None => LookupError::Network(err.to_string()),
        }
    }
}

/// Invalid or incomplete configuration; always fatal before processing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),
    #[error("gazetteer is mandatory but no username is configured")]
    MissingGazetteerUser,
    #[error("perimeter file {0} does not exist")]
    MissingPerimeter(String),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum RidgelineError {
    #[error("record error: {0}")]
    Record(#[from] RecordError),
    #[error("geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("boundary error: {0}")]
    Boundary(#[from] BoundaryError),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),
    #[error("lookup error: {0}")]
    Lookup(#[from] LookupError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RidgelineError>;
