//! Spatial index for fast country boundary lookups.

use geo::{BoundingRect, Closest, ClosestPoint, Contains, Intersects, MultiPolygon, Point};
use hashbrown::HashSet;
use rstar::{RTree, RTreeObject, AABB};
use std::sync::Arc;
use tracing::info;

use crate::models::normalize_country;

/// One country's geometry and its ISO alpha-2 code
#[derive(Debug, Clone)]
pub struct BoundaryPolygon {
    pub code: String,
    pub geometry: MultiPolygon<f64>,
}

impl BoundaryPolygon {
    pub fn new(code: &str, geometry: MultiPolygon<f64>) -> Self {
        Self {
            code: normalize_country(code),
            geometry,
        }
    }

    /// Get the bounding box of this boundary
    pub fn bbox(&self) -> Option<(f64, f64, f64, f64)> {
        self.geometry
            .bounding_rect()
            .map(|rect| (rect.min().x, rect.min().y, rect.max().x, rect.max().y))
    }

    /// Planar distance in degrees from `point` to this boundary
    fn planar_distance(&self, point: &Point<f64>) -> f64 {
        match self.geometry.closest_point(point) {
            Closest::Intersection(_) => 0.0,
            Closest::SinglePoint(p) => (p.x() - point.x()).hypot(p.y() - point.y()),
            Closest::Indeterminate => f64::INFINITY,
        }
    }
}

/// Set of allowed country codes, normalized to uppercase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountrySet(HashSet<String>);

impl CountrySet {
    pub fn from_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            codes
                .into_iter()
                .map(|c| normalize_country(c.as_ref()))
                .filter(|c| !c.is_empty())
                .collect(),
        )
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Wrapper for R-tree indexing of country boundaries
#[derive(Clone)]
pub struct IndexedBoundary {
    pub boundary: Arc<BoundaryPolygon>,
    /// Position in the build input; orders candidates deterministically
    ordinal: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedBoundary {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

impl IndexedBoundary {
    pub fn new(ordinal: usize, boundary: BoundaryPolygon) -> Option<Self> {
        let (min_x, min_y, max_x, max_y) = boundary.bbox()?;
        Some(Self {
            boundary: Arc::new(boundary),
            ordinal,
            envelope: AABB::from_corners([min_x, min_y], [max_x, max_y]),
        })
    }
}

/// Which step of the lookup chain produced a code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStep {
    Contains,
    Touches,
    Nearest,
    AnyCandidate,
}

type Step = fn(&[&IndexedBoundary], &Point<f64>, Option<&CountrySet>) -> Option<String>;

const STEPS: [(LookupStep, Step); 4] = [
    (LookupStep::Contains, containing),
    (LookupStep::Touches, touching),
    (LookupStep::Nearest, nearest_allowed),
    (LookupStep::AnyCandidate, any_candidate),
];

fn allowed(code: &str, allowed: Option<&CountrySet>) -> bool {
    allowed.map_or(true, |set| set.is_empty() || set.contains(code))
}

fn containing(
    candidates: &[&IndexedBoundary],
    point: &Point<f64>,
    allowed_codes: Option<&CountrySet>,
) -> Option<String> {
    candidates
        .iter()
        .filter(|ib| allowed(&ib.boundary.code, allowed_codes))
        .find(|ib| ib.boundary.geometry.contains(point))
        .map(|ib| ib.boundary.code.clone())
}

fn touching(
    candidates: &[&IndexedBoundary],
    point: &Point<f64>,
    allowed_codes: Option<&CountrySet>,
) -> Option<String> {
    candidates
        .iter()
        .filter(|ib| allowed(&ib.boundary.code, allowed_codes))
        .find(|ib| {
            ib.boundary.geometry.intersects(point) && !ib.boundary.geometry.contains(point)
        })
        .map(|ib| ib.boundary.code.clone())
}

fn nearest_allowed(
    candidates: &[&IndexedBoundary],
    point: &Point<f64>,
    allowed_codes: Option<&CountrySet>,
) -> Option<String> {
    let mut best: Option<(f64, &IndexedBoundary)> = None;
    for ib in candidates
        .iter()
        .filter(|ib| allowed(&ib.boundary.code, allowed_codes))
    {
        let d = ib.boundary.planar_distance(point);
        if !d.is_finite() {
            continue;
        }
        // Strict comparison keeps the lowest ordinal on ties
        if best.map_or(true, |(best_d, _)| d < best_d) {
            best = Some((d, *ib));
        }
    }
    best.map(|(_, ib)| ib.boundary.code.clone())
}

fn any_candidate(
    candidates: &[&IndexedBoundary],
    _point: &Point<f64>,
    _allowed_codes: Option<&CountrySet>,
) -> Option<String> {
    candidates.first().map(|ib| ib.boundary.code.clone())
}

/// R-tree over country polygons answering point → ISO alpha-2 queries.
///
/// Immutable after `build`; share it behind an `Arc` for concurrent readers.
pub struct BoundaryIndex {
    tree: RTree<IndexedBoundary>,
}

impl BoundaryIndex {
    /// Build spatial index from country boundaries
    pub fn build(boundaries: Vec<BoundaryPolygon>) -> Self {
        info!(
            "Building spatial index for {} country boundaries...",
            boundaries.len()
        );

        let indexed: Vec<IndexedBoundary> = boundaries
            .into_iter()
            .enumerate()
            .filter_map(|(i, b)| IndexedBoundary::new(i, b))
            .collect();

        let tree = RTree::bulk_load(indexed);
        info!("Spatial index built with {} entries", tree.size());

        Self { tree }
    }

    /// Country code for (lat, lon), or `None` when no boundary envelope
    /// covers the point.
    ///
    /// Tries, in order: containment, boundary touch, nearest boundary (the
    /// first three restricted to `allowed_codes`), then any candidate.
    pub fn lookup(&self, lat: f64, lon: f64, allowed_codes: Option<&CountrySet>) -> Option<String> {
        self.lookup_with_step(lat, lon, allowed_codes)
            .map(|(code, _)| code)
    }

    /// Like `lookup`, also reporting which step matched
    pub fn lookup_with_step(
        &self,
        lat: f64,
        lon: f64,
        allowed_codes: Option<&CountrySet>,
    ) -> Option<(String, LookupStep)> {
        let point = Point::new(lon, lat);
        let query_envelope = AABB::from_point([lon, lat]);

        let mut candidates: Vec<&IndexedBoundary> = self
            .tree
            .locate_in_envelope_intersecting(&query_envelope)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|ib| ib.ordinal);

        STEPS.iter().find_map(|(step, strategy)| {
            strategy(&candidates, &point, allowed_codes).map(|code| (code, *step))
        })
    }

    /// Get total number of indexed boundaries
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}
