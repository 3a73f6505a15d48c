//! Distance Engine: point-to-point and point-to-perimeter distances.

pub mod geodesic;
pub mod perimeter;

pub use geodesic::{haversine_km, point_distance_km, vincenty_km, GeodesicError, EARTH_RADIUS_KM};
pub use perimeter::{
    annotate_perimeter_distances, load_perimeter_geojson, parse_perimeter_geojson, repair,
    DistanceStats, DistanceTier, Perimeter, PerimeterDistance, RepairOutcome,
};
