//! Boundary Index: point → ISO alpha-2 country inference.
//!
//! Country polygons are loaded once (from a local cache, downloading on first
//! use) into an R-tree. When the dataset cannot be obtained, lookups degrade to
//! a short list of hand-specified rectangles, which can be overridden or
//! switched off in configuration.

mod bbox;
mod dataset;
mod index;

pub use bbox::{rough_box, BboxFallback, FallbackBox};
pub use dataset::{country_code, load_boundaries, parse_boundaries, DEFAULT_BOUNDARY_URLS};
pub use index::{BoundaryIndex, BoundaryPolygon, CountrySet, IndexedBoundary, LookupStep};

use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::BoundariesConfig;
use crate::resilience::RetryPolicy;

/// Country inference service shared read-only by every resolution stage.
///
/// Never fails: a missing dataset falls back to rectangles, and a point
/// neither path can place yields an empty code.
pub struct CountryLookup {
    index: Option<BoundaryIndex>,
    fallback: Option<BboxFallback>,
}

impl CountryLookup {
    pub fn new(index: Option<BoundaryIndex>, fallback: Option<BboxFallback>) -> Self {
        Self { index, fallback }
    }

    /// Polygon index only, no rectangle fallback
    pub fn from_index(index: BoundaryIndex) -> Self {
        Self::new(Some(index), None)
    }

    /// Build from configuration, downloading the dataset if it is not cached
    pub async fn load(client: &Client, config: &BoundariesConfig, policy: &RetryPolicy) -> Self {
        let fallback = config.bbox_fallback.then(|| match &config.fallback_boxes {
            Some(boxes) => BboxFallback::from_boxes(boxes.clone()),
            None => BboxFallback::default(),
        });

        let index = match load_boundaries(
            client,
            &config.cache_path,
            &config.urls,
            policy,
            Duration::from_secs(config.timeout_secs),
        )
        .await
        {
            Ok(boundaries) if !boundaries.is_empty() => Some(BoundaryIndex::build(boundaries)),
            Ok(_) => {
                warn!("Boundary dataset contained no usable countries");
                None
            }
            Err(e) => {
                warn!("Boundary dataset unavailable: {}", e);
                None
            }
        };

        match (&index, &fallback) {
            (Some(_), _) => {}
            (None, Some(f)) => info!(
                "Country lookup will use {} fallback rectangles",
                f.boxes().len()
            ),
            (None, None) => warn!("Country lookup disabled: no dataset and no fallback"),
        }

        Self::new(index, fallback)
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    /// Country code for (lat, lon), or an empty string if unknown
    pub fn infer(&self, lat: f64, lon: f64, allowed: Option<&CountrySet>) -> String {
        let code = match (&self.index, &self.fallback) {
            (Some(index), _) => index.lookup(lat, lon, allowed),
            (None, Some(fallback)) => fallback.lookup(lat, lon, allowed),
            (None, None) => None,
        };
        code.unwrap_or_default()
    }
}
