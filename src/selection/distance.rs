// src/selection/distance.rs

//! Great-circle distance, grounded on the teacher's geospatial haversine
//! helper (`core/commands/geospatial/helpers.rs`), using the Earth radius
//! the design spec calls for (6371 km) rather than the teacher's more
//! precise constant.

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two (latitude, longitude) points, in
/// kilometers. Symmetric, and zero when the two points are equal (§8).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_distance_for_identical_points() {
        assert_eq!(haversine_km(48.85, 2.35, 48.85, 2.35), 0.0);
    }

    proptest! {
        #[test]
        fn is_symmetric(lat1 in -85.0..85.0, lon1 in -179.0..179.0, lat2 in -85.0..85.0, lon2 in -179.0..179.0) {
            let a = haversine_km(lat1, lon1, lat2, lon2);
            let b = haversine_km(lat2, lon2, lat1, lon1);
            prop_assert!((a - b).abs() < 1e-6);
        }
    }
}
