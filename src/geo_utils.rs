//! Geographic utilities.

use geo::{Distance, Haversine, Point};

use crate::types::{GpsPoint, LocationSample};

/// Great-circle distance between two GPS points in meters.
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Great-circle distance between two samples in meters (altitude ignored).
pub fn sample_distance(a: &LocationSample, b: &LocationSample) -> f64 {
    haversine_distance(&a.point(), &b.point())
}

/// Total distance along consecutive samples.
pub fn polyline_length(samples: &[LocationSample]) -> f64 {
    samples
        .windows(2)
        .map(|w| sample_distance(&w[0], &w[1]))
        .sum()
}
