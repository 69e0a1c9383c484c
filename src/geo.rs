//! Local tangent-plane conversions used for leg targets and convergence checks.
//!
//! Both functions are flat-earth approximations. They are only meaningful for
//! offsets of a few kilometres away from the poles.

use crate::vehicle::Coordinate;

/// Radius of the spherical earth used for offset conversion, in metres.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Metres per degree used by [`planar_distance`].
pub const METRES_PER_DEGREE: f64 = 111_319.5;

/// Coordinate `north_m` metres north and `east_m` metres east of `origin`.
///
/// The altitude of `origin` is carried over unchanged; callers that need a
/// different target altitude override it on the result.
pub fn offset_to_coordinate(origin: Coordinate, north_m: f64, east_m: f64) -> Coordinate {
    let d_lat = north_m / EARTH_RADIUS_M;
    let d_lon = east_m / (EARTH_RADIUS_M * origin.latitude.to_radians().cos());

    Coordinate {
        latitude: origin.latitude + d_lat.to_degrees(),
        longitude: origin.longitude + d_lon.to_degrees(),
        relative_altitude: origin.relative_altitude,
    }
}

/// Ground distance in metres between two coordinates.
///
/// Euclidean distance over raw degree deltas. Longitude is not scaled by
/// latitude, matching the ArduPilot autotest helper the mission tolerances
/// were tuned against.
pub fn planar_distance(a: Coordinate, b: Coordinate) -> f64 {
    let d_lat = b.latitude - a.latitude;
    let d_lon = b.longitude - a.longitude;
    (d_lat * d_lat + d_lon * d_lon).sqrt() * METRES_PER_DEGREE
}

/// North/east split of `distance` metres along compass `heading_deg`.
pub fn heading_offset(heading_deg: f64, distance: f64) -> (f64, f64) {
    let heading = heading_deg.to_radians();
    (heading.cos() * distance, heading.sin() * distance)
}

/// Wraps an angle into `[0, 360)`.
pub fn normalize_heading(heading_deg: f64) -> f64 {
    heading_deg.rem_euclid(360.0)
}

/// Smallest absolute angle between two headings, in `[0, 180]`.
pub fn heading_error(a_deg: f64, b_deg: f64) -> f64 {
    let diff = normalize_heading(a_deg - b_deg);
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}
