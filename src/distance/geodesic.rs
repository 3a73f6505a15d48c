//! Point-to-point distances on the WGS84 ellipsoid and the mean sphere.

use thiserror::Error;

/// Mean Earth radius used by the spherical formula
pub const EARTH_RADIUS_KM: f64 = 6371.0;

// WGS84
const SEMI_MAJOR_KM: f64 = 6378.137;
const FLATTENING: f64 = 1.0 / 298.257_223_563;
const SEMI_MINOR_KM: f64 = SEMI_MAJOR_KM * (1.0 - FLATTENING);

const MAX_ITERATIONS: usize = 100;
const CONVERGENCE_THRESHOLD: f64 = 1e-12;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum GeodesicError {
    #[error("Vincenty iteration did not converge")]
    NoConvergence,
    #[error("coincident points")]
    Coincident,
    #[error("numerical failure in Vincenty formula")]
    NonFinite,
}

/// Great-circle distance on a sphere of radius 6371 km
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();
    EARTH_RADIUS_KM * c
}

/// Inverse Vincenty solution on the WGS84 ellipsoid
pub fn vincenty_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> Result<f64, GeodesicError> {
    let l = (lon2 - lon1).to_radians();
    let u1 = ((1.0 - FLATTENING) * lat1.to_radians().tan()).atan();
    let u2 = ((1.0 - FLATTENING) * lat2.to_radians().tan()).atan();
    let (sin_u1, cos_u1) = u1.sin_cos();
    let (sin_u2, cos_u2) = u2.sin_cos();

    let mut lambda = l;
    let mut converged = false;
    let (mut sin_sigma, mut cos_sigma, mut sigma) = (0.0, 0.0, 0.0);
    let (mut cos_sq_alpha, mut cos_2sigma_m) = (0.0, 0.0);

    for _ in 0..MAX_ITERATIONS {
        let (sin_lambda, cos_lambda) = lambda.sin_cos();
        sin_sigma = ((cos_u2 * sin_lambda).powi(2)
            + (cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda).powi(2))
        .sqrt();
        if sin_sigma == 0.0 {
            return Err(GeodesicError::Coincident);
        }
        cos_sigma = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
        sigma = sin_sigma.atan2(cos_sigma);
        let sin_alpha = cos_u1 * cos_u2 * sin_lambda / sin_sigma;
        cos_sq_alpha = 1.0 - sin_alpha.powi(2);
        // Equatorial line: cos_sq_alpha is zero
        cos_2sigma_m = if cos_sq_alpha == 0.0 {
            0.0
        } else {
            cos_sigma - 2.0 * sin_u1 * sin_u2 / cos_sq_alpha
        };
        let c = FLATTENING / 16.0 * cos_sq_alpha * (4.0 + FLATTENING * (4.0 - 3.0 * cos_sq_alpha));
        let previous = lambda;
        lambda = l
            + (1.0 - c)
                * FLATTENING
                * sin_alpha
                * (sigma
                    + c * sin_sigma
                        * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m.powi(2))));

        if !lambda.is_finite() {
            return Err(GeodesicError::NonFinite);
        }
        if (lambda - previous).abs() <= CONVERGENCE_THRESHOLD {
            converged = true;
            break;
        }
    }

    if !converged {
        return Err(GeodesicError::NoConvergence);
    }

    let u_sq = cos_sq_alpha * (SEMI_MAJOR_KM.powi(2) - SEMI_MINOR_KM.powi(2)) / SEMI_MINOR_KM.powi(2);
    let a = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
    let b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
    let delta_sigma = b
        * sin_sigma
        * (cos_2sigma_m
            + b / 4.0
                * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m.powi(2))
                    - b / 6.0
                        * cos_2sigma_m
                        * (-3.0 + 4.0 * sin_sigma.powi(2))
                        * (-3.0 + 4.0 * cos_2sigma_m.powi(2))));

    let distance = SEMI_MINOR_KM * a * (sigma - delta_sigma);
    if distance.is_finite() {
        Ok(distance)
    } else {
        Err(GeodesicError::NonFinite)
    }
}

/// Ellipsoidal distance, falling back to the spherical formula whenever
/// Vincenty fails (coincident or near-antipodal points).
///
/// Arguments are put in a canonical order first so the result is exactly
/// symmetric.
pub fn point_distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let ((lat1, lon1), (lat2, lon2)) = if (lat1, lon1) <= (lat2, lon2) {
        ((lat1, lon1), (lat2, lon2))
    } else {
        ((lat2, lon2), (lat1, lon1))
    };
    vincenty_km(lat1, lon1, lat2, lon2).unwrap_or_else(|_| haversine_km(lat1, lon1, lat2, lon2))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INNSBRUCK: (f64, f64) = (47.2692, 11.4041);
    const MUNICH: (f64, f64) = (48.1351, 11.5820);

    #[test]
    fn test_haversine_known_distance() {
        let d = haversine_km(INNSBRUCK.0, INNSBRUCK.1, MUNICH.0, MUNICH.1);
        assert!((d - 97.2).abs() < 1.0, "got {}", d);
    }

    #[test]
    fn test_vincenty_close_to_haversine() {
        let v = vincenty_km(INNSBRUCK.0, INNSBRUCK.1, MUNICH.0, MUNICH.1).unwrap();
        let h = haversine_km(INNSBRUCK.0, INNSBRUCK.1, MUNICH.0, MUNICH.1);
        assert!((v - h).abs() / h < 0.005);
    }

    #[test]
    fn test_vincenty_equator_degree() {
        // One degree of longitude on the equator is 111.319 km on WGS84
        let v = vincenty_km(0.0, 0.0, 0.0, 1.0).unwrap();
        assert!((v - 111.319).abs() < 0.01, "got {}", v);
    }

    #[test]
    fn test_coincident_points() {
        assert_eq!(vincenty_km(10.0, 10.0, 10.0, 10.0), Err(GeodesicError::Coincident));
        assert_eq!(point_distance_km(10.0, 10.0, 10.0, 10.0), 0.0);
    }

    #[test]
    fn test_antipodal_falls_back_to_sphere() {
        let d = point_distance_km(0.0, 0.0, 0.5, 179.7);
        assert!(d.is_finite());
        assert!(d > 19_000.0 && d < 20_100.0, "got {}", d);
    }

    #[test]
    fn test_symmetry() {
        let pairs = [
            (INNSBRUCK, MUNICH),
            ((45.0, 7.0), (-33.9, 151.2)),
            ((-10.0, -170.0), (10.0, 170.0)),
        ];
        for ((lat1, lon1), (lat2, lon2)) in pairs {
            assert_eq!(
                point_distance_km(lat1, lon1, lat2, lon2),
                point_distance_km(lat2, lon2, lat1, lon1)
            );
        }
    }
}
