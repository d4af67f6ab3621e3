//! Run metrics computed over a finished trace.
//!
//! Pure functions: no state, no I/O. Every metric is computed per segment
//! and never across a pause boundary.
//!
//! ## Example
//! ```rust
//! use runsync::{metrics, LocationSample, LocationSegment, RunTrace};
//!
//! let trace = RunTrace::from_segments(vec![LocationSegment::from_samples(vec![
//!     LocationSample::new(0.0, 0.0, 5.0, 0),
//!     LocationSample::new(0.0, 0.0, 2.0, 1_000),
//!     LocationSample::new(0.0, 0.0, 9.0, 2_000),
//! ])]);
//! assert_eq!(metrics::total_elevation_gain_meters(&trace), 7.0);
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::geo_utils::sample_distance;
use crate::types::{GpsPoint, LocationSample, Run, RunTrace};

const MS_TO_KMH: f64 = 3.6;

/// Speed between two consecutive samples in km/h, or None when the time
/// delta is not positive or the result is not finite.
fn pair_speed_kmh(a: &LocationSample, b: &LocationSample) -> Option<f64> {
    let dt_ms = b.timestamp_millis - a.timestamp_millis;
    if dt_ms <= 0 {
        return None;
    }
    let meters_per_second = sample_distance(a, b) / (dt_ms as f64 / 1000.0);
    let kmh = meters_per_second * MS_TO_KMH;
    (kmh.is_finite() && kmh >= 0.0).then_some(kmh)
}

/// Maximum instantaneous speed across all segments in km/h.
///
/// Segments with fewer than two samples contribute nothing. Zero or
/// negative time deltas are skipped. Returns 0.0 when no pair qualifies.
pub fn max_speed_kmh(trace: &RunTrace) -> f64 {
    trace
        .segments()
        .iter()
        .flat_map(|segment| {
            segment
                .samples()
                .windows(2)
                .filter_map(|w| pair_speed_kmh(&w[0], &w[1]))
        })
        .fold(0.0, f64::max)
}

/// Sum of positive altitude deltas between consecutive samples.
/// Descents are ignored rather than subtracted.
pub fn total_elevation_gain_meters(trace: &RunTrace) -> f64 {
    trace
        .segments()
        .iter()
        .map(|segment| {
            segment
                .samples()
                .windows(2)
                .map(|w| (w[1].altitude_meters - w[0].altitude_meters).max(0.0))
                .sum::<f64>()
        })
        .sum()
}

/// Build a [`Run`] from a finished trace.
///
/// Returns None when no segment holds at least two samples: such a run has
/// no path worth saving.
pub fn summarize_run(
    trace: &RunTrace,
    distance_meters: f64,
    elapsed: Duration,
    start_time_utc: DateTime<Utc>,
) -> Option<Run> {
    if !trace.segments().iter().any(|s| s.len() >= 2) {
        return None;
    }

    let last_known_location = trace
        .last_sample()
        .map(LocationSample::point)
        .unwrap_or(GpsPoint::new(0.0, 0.0));

    Some(Run {
        id: None,
        duration: elapsed,
        start_time_utc,
        distance_meters,
        last_known_location,
        max_speed_kmh: max_speed_kmh(trace),
        total_elevation_gain_meters: total_elevation_gain_meters(trace),
        map_image_ref: None,
    })
}
