//! Distance from a point to a region perimeter.
//!
//! The perimeter is validated (and repaired when needed) once, when it is
//! prepared. Each query then walks an ordered list of tiers and keeps the
//! first finite answer:
//!
//! 1. inside the perimeter: 0 km
//! 2. nearest point on the outline, measured on the ellipsoid
//! 3. perimeter centroid
//! 4. nearest point on the bounding rectangle
//!
//! A perimeter that cannot be repaired yields no distance for any point;
//! that is logged once when the perimeter is prepared.

use geo::{
    BooleanOps, BoundingRect, Centroid, Closest, ClosestPoint, Contains, Coord, LineString,
    MultiLineString, MultiPolygon, Point, Polygon, Rect, Simplify, Validation,
};
use geojson::GeoJson;
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;
use tracing::{error, info, warn};

use super::geodesic::{haversine_km, point_distance_km};
use crate::error::GeometryError;
use crate::models::PlaceRecord;

/// Simplification tolerance in degrees (about 100 m)
pub const REPAIR_SIMPLIFY_TOLERANCE: f64 = 0.001;

/// How the perimeter geometry got into its usable state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    AlreadyValid,
    Unioned,
    Simplified,
}

/// The tier that produced a distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceTier {
    Inside,
    NearestBoundary,
    Centroid,
    BoundingBox,
}

impl DistanceTier {
    /// Centroid and bounding box answers are approximations
    pub fn is_fallback(self) -> bool {
        matches!(self, DistanceTier::Centroid | DistanceTier::BoundingBox)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerimeterDistance {
    pub km: f64,
    pub tier: DistanceTier,
}

/// Why a single tier gave no answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TierMiss {
    NotInside,
    NoGeometry,
    NonFinite,
}

type Tier = fn(&Perimeter, Point<f64>) -> Result<f64, TierMiss>;

const TIERS: [(DistanceTier, Tier); 4] = [
    (DistanceTier::Inside, inside_tier),
    (DistanceTier::NearestBoundary, nearest_boundary_tier),
    (DistanceTier::Centroid, centroid_tier),
    (DistanceTier::BoundingBox, bounding_box_tier),
];

/// A validated region perimeter ready for distance queries
#[derive(Debug, Clone)]
pub struct Perimeter {
    geometry: MultiPolygon<f64>,
    outline: MultiLineString<f64>,
    repair: Result<RepairOutcome, GeometryError>,
}

impl Perimeter {
    /// Validate and, if needed, repair `geometry`.
    ///
    /// Never fails: an unrepairable perimeter is kept in an unusable state
    /// and reports every distance as unavailable.
    pub fn prepare(geometry: MultiPolygon<f64>) -> Self {
        match repair(geometry) {
            Ok((geometry, outcome)) => {
                match outcome {
                    RepairOutcome::AlreadyValid => {}
                    RepairOutcome::Unioned => info!("Perimeter repaired by self-union"),
                    RepairOutcome::Simplified => info!(
                        "Perimeter repaired by simplification ({} deg)",
                        REPAIR_SIMPLIFY_TOLERANCE
                    ),
                }
                let outline = outline_of(&geometry);
                Self {
                    geometry,
                    outline,
                    repair: Ok(outcome),
                }
            }
            Err(e) => {
                error!("Perimeter is unusable, distances will be unavailable: {}", e);
                Self {
                    geometry: MultiPolygon::new(vec![]),
                    outline: MultiLineString::new(vec![]),
                    repair: Err(e),
                }
            }
        }
    }

    /// Perimeter covering an axis-aligned box
    pub fn from_bbox(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        let rect = Rect::new(
            Coord { x: min_lon, y: min_lat },
            Coord { x: max_lon, y: max_lat },
        );
        Self::prepare(MultiPolygon::new(vec![rect.to_polygon()]))
    }

    pub fn is_usable(&self) -> bool {
        self.repair.is_ok()
    }

    pub fn repair_outcome(&self) -> Result<RepairOutcome, &GeometryError> {
        self.repair.as_ref().copied()
    }

    /// Bounding box as (min_lon, min_lat, max_lon, max_lat)
    pub fn bbox(&self) -> Option<(f64, f64, f64, f64)> {
        self.geometry
            .bounding_rect()
            .map(|r| (r.min().x, r.min().y, r.max().x, r.max().y))
    }

    /// Point-in-perimeter test; false for an unusable perimeter
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.is_usable() && self.geometry.contains(&Point::new(lon, lat))
    }

    /// Distance in km from (lat, lon) to the perimeter, or `None` when every
    /// tier failed or the perimeter is unusable.
    pub fn distance_km(&self, lat: f64, lon: f64) -> Option<PerimeterDistance> {
        if !self.is_usable() {
            return None;
        }
        let point = Point::new(lon, lat);
        TIERS.iter().find_map(|(tier, strategy)| {
            strategy(self, point)
                .ok()
                .map(|km| PerimeterDistance { km, tier: *tier })
        })
    }
}

/// Make `geometry` valid: self-union first, then simplification.
pub fn repair(geometry: MultiPolygon<f64>) -> Result<(MultiPolygon<f64>, RepairOutcome), GeometryError> {
    if geometry.0.is_empty() {
        return Err(GeometryError::Empty);
    }
    if geometry.is_valid() {
        return Ok((geometry, RepairOutcome::AlreadyValid));
    }

    let unioned = geometry.union(&MultiPolygon::new(vec![]));
    if !unioned.0.is_empty() && unioned.is_valid() {
        return Ok((unioned, RepairOutcome::Unioned));
    }

    let base = if unioned.0.is_empty() { geometry } else { unioned };
    let simplified = base.simplify(REPAIR_SIMPLIFY_TOLERANCE);
    if !simplified.0.is_empty() && simplified.is_valid() {
        return Ok((simplified, RepairOutcome::Simplified));
    }

    Err(GeometryError::Unrepairable)
}

fn outline_of(geometry: &MultiPolygon<f64>) -> MultiLineString<f64> {
    let rings: Vec<LineString<f64>> = geometry
        .iter()
        .flat_map(|polygon| std::iter::once(polygon.exterior()).chain(polygon.interiors()))
        .cloned()
        .collect();
    MultiLineString::new(rings)
}

fn finite(km: f64) -> Result<f64, TierMiss> {
    if km.is_finite() {
        Ok(km)
    } else {
        Err(TierMiss::NonFinite)
    }
}

fn inside_tier(perimeter: &Perimeter, point: Point<f64>) -> Result<f64, TierMiss> {
    if perimeter.geometry.contains(&point) {
        Ok(0.0)
    } else {
        Err(TierMiss::NotInside)
    }
}

fn nearest_boundary_tier(perimeter: &Perimeter, point: Point<f64>) -> Result<f64, TierMiss> {
    match perimeter.outline.closest_point(&point) {
        Closest::Intersection(p) | Closest::SinglePoint(p) => {
            finite(point_distance_km(point.y(), point.x(), p.y(), p.x()))
        }
        Closest::Indeterminate => Err(TierMiss::NoGeometry),
    }
}

fn centroid_tier(perimeter: &Perimeter, point: Point<f64>) -> Result<f64, TierMiss> {
    let c = perimeter.geometry.centroid().ok_or(TierMiss::NoGeometry)?;
    finite(point_distance_km(point.y(), point.x(), c.y(), c.x()))
}

fn bounding_box_tier(perimeter: &Perimeter, point: Point<f64>) -> Result<f64, TierMiss> {
    let rect = perimeter.geometry.bounding_rect().ok_or(TierMiss::NoGeometry)?;
    let lon = point.x().clamp(rect.min().x, rect.max().x);
    let lat = point.y().clamp(rect.min().y, rect.max().y);
    finite(haversine_km(point.y(), point.x(), lat, lon))
}

/// Load a perimeter from a GeoJSON FeatureCollection (first feature), a
/// Feature, or a bare Polygon/MultiPolygon geometry.
pub fn load_perimeter_geojson(path: &Path) -> Result<Perimeter, GeometryError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| GeometryError::Parse(format!("{}: {}", path.display(), e)))?;
    let geometry = parse_perimeter_geojson(&text)?;
    Ok(Perimeter::prepare(geometry))
}

pub fn parse_perimeter_geojson(text: &str) -> Result<MultiPolygon<f64>, GeometryError> {
    let geojson: GeoJson = text
        .parse()
        .map_err(|e: geojson::Error| GeometryError::Parse(e.to_string()))?;

    let geometry = match geojson {
        GeoJson::FeatureCollection(fc) => fc
            .features
            .into_iter()
            .next()
            .and_then(|f| f.geometry)
            .ok_or(GeometryError::Empty)?,
        GeoJson::Feature(f) => f.geometry.ok_or(GeometryError::Empty)?,
        GeoJson::Geometry(g) => g,
    };

    let geometry: geo::Geometry<f64> = geometry
        .try_into()
        .map_err(|e: geojson::Error| GeometryError::Parse(e.to_string()))?;

    match geometry {
        geo::Geometry::Polygon(p) => Ok(MultiPolygon::new(vec![p])),
        geo::Geometry::MultiPolygon(mp) => Ok(mp),
        other => Err(GeometryError::Unsupported(geometry_kind(&other).to_string())),
    }
}

fn geometry_kind(geometry: &geo::Geometry<f64>) -> &'static str {
    match geometry {
        geo::Geometry::Point(_) => "Point",
        geo::Geometry::Line(_) => "Line",
        geo::Geometry::LineString(_) => "LineString",
        geo::Geometry::MultiPoint(_) => "MultiPoint",
        geo::Geometry::MultiLineString(_) => "MultiLineString",
        geo::Geometry::GeometryCollection(_) => "GeometryCollection",
        _ => "Geometry",
    }
}

/// Per-batch outcome counters for perimeter distances
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DistanceStats {
    pub success: usize,
    pub fallback: usize,
    pub failure: usize,
}

impl DistanceStats {
    pub fn total(&self) -> usize {
        self.success + self.fallback + self.failure
    }

    fn record(&mut self, outcome: Option<DistanceTier>) {
        match outcome {
            Some(tier) if tier.is_fallback() => self.fallback += 1,
            Some(_) => self.success += 1,
            None => self.failure += 1,
        }
    }
}

/// Fill `distance_km_to_perimeter` on every record, in parallel.
///
/// Distances are rounded to 3 decimals. Records for which no tier produced
/// a value keep `None` and get a note.
pub fn annotate_perimeter_distances(records: &mut [PlaceRecord], perimeter: &Perimeter) -> DistanceStats {
    let outcomes: Vec<Option<DistanceTier>> = records
        .par_iter_mut()
        .map(|record| match perimeter.distance_km(record.latitude, record.longitude) {
            Some(d) => {
                record.distance_km_to_perimeter = Some((d.km * 1000.0).round() / 1000.0);
                Some(d.tier)
            }
            None => {
                record.distance_km_to_perimeter = None;
                record.add_note("perimeter distance unavailable");
                None
            }
        })
        .collect();

    let mut stats = DistanceStats::default();
    for outcome in outcomes {
        stats.record(outcome);
    }

    if stats.fallback > 0 || stats.failure > 0 {
        warn!(
            "Perimeter distances: {} exact, {} approximate, {} unavailable",
            stats.success, stats.fallback, stats.failure
        );
    } else {
        info!("Perimeter distances: {} exact", stats.success);
    }
    stats
}

/// Square polygon helper used by presets and tests
pub fn square(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Polygon<f64> {
    Rect::new(
        Coord { x: min_lon, y: min_lat },
        Coord { x: max_lon, y: max_lat },
    )
    .to_polygon()
}
