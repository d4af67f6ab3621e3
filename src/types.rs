//! Core data model: samples, traces and runs.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Location
// ============================================================================

/// A GPS coordinate with latitude and longitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// One fix from the location source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_meters: f64,
    /// Source timestamp (milliseconds, monotonic within a run)
    pub timestamp_millis: i64,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, altitude_meters: f64, timestamp_millis: i64) -> Self {
        Self {
            latitude,
            longitude,
            altitude_meters,
            timestamp_millis,
        }
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    /// Coordinates in range and a finite altitude.
    pub fn is_valid(&self) -> bool {
        self.point().is_valid() && self.altitude_meters.is_finite()
    }
}

// ============================================================================
// Trace
// ============================================================================

/// Contiguous samples recorded between two pause boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationSegment {
    samples: Vec<LocationSample>,
}

impl LocationSegment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a segment from samples already known to be in order.
    pub fn from_samples(samples: Vec<LocationSample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[LocationSample] {
        &self.samples
    }

    pub fn last(&self) -> Option<&LocationSample> {
        self.samples.last()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append a sample. Returns false (and drops the sample) unless its
    /// timestamp is strictly after the current last sample.
    pub fn push(&mut self, sample: LocationSample) -> bool {
        if let Some(last) = self.samples.last() {
            if sample.timestamp_millis <= last.timestamp_millis {
                return false;
            }
        }
        self.samples.push(sample);
        true
    }
}

/// The geometric record of a run, split into segments at pause boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTrace {
    segments: Vec<LocationSegment>,
}

impl RunTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(segments: Vec<LocationSegment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[LocationSegment] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn sample_count(&self) -> usize {
        self.segments.iter().map(LocationSegment::len).sum()
    }

    /// Last sample of the whole trace, across segments.
    pub fn last_sample(&self) -> Option<&LocationSample> {
        self.segments.iter().rev().find_map(LocationSegment::last)
    }

    /// Start a new segment, even if the current one never got a sample.
    pub(crate) fn open_segment(&mut self) {
        self.segments.push(LocationSegment::new());
    }

    /// Open a segment only if there is none or the current one has samples.
    pub(crate) fn ensure_open_segment(&mut self) {
        if !matches!(self.segments.last(), Some(s) if s.is_empty()) {
            self.segments.push(LocationSegment::new());
        }
    }

    /// Mutable access to the segment currently receiving samples.
    pub(crate) fn active_segment_mut(&mut self) -> Option<&mut LocationSegment> {
        self.segments.last_mut()
    }
}

/// Live run telemetry published while tracking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunData {
    pub trace: RunTrace,
    /// Great-circle distance accumulated within segments
    pub distance_meters: f64,
}

// ============================================================================
// Run
// ============================================================================

/// Identifier of a run, shared between local store and remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A completed run with aggregated metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// None until the run is first persisted
    pub id: Option<RunId>,
    pub duration: Duration,
    pub start_time_utc: DateTime<Utc>,
    pub distance_meters: f64,
    pub last_known_location: GpsPoint,
    pub max_speed_kmh: f64,
    pub total_elevation_gain_meters: f64,
    /// Remote URL of the rendered map, once the service has stored it
    pub map_image_ref: Option<String>,
}

impl Run {
    /// Average speed over the whole run in km/h (0 for a zero-length run).
    pub fn avg_speed_kmh(&self) -> f64 {
        let hours = self.duration.as_secs_f64() / 3600.0;
        if hours <= 0.0 {
            return 0.0;
        }
        (self.distance_meters / 1000.0) / hours
    }
}

// ============================================================================
// Pending sync records
// ============================================================================

/// A run that still has to reach the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCreate {
    pub run: Run,
    pub map_image: Vec<u8>,
}

impl PendingCreate {
    pub fn run_id(&self) -> Option<&RunId> {
        self.run.id.as_ref()
    }
}

/// A local deletion that still has to reach the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelete {
    pub run_id: RunId,
}

// ============================================================================
// Tracking session
// ============================================================================

/// Process-scoped tracking flags, persisted so the UI can be restored after
/// the process is killed mid-run.
///
/// Written by the aggregator on start/toggle/finish/reset. Cleared by
/// `finish()`, `reset()` and `delete_all_runs()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingState {
    /// A run has been started and not yet finished
    pub run_active: bool,
    /// Samples are currently being recorded
    pub tracking: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_rejects_non_increasing_timestamps() {
        let mut segment = LocationSegment::new();
        assert!(segment.push(LocationSample::new(0.0, 0.0, 0.0, 1_000)));
        assert!(!segment.push(LocationSample::new(0.0, 0.0, 0.0, 1_000)));
        assert!(!segment.push(LocationSample::new(0.0, 0.0, 0.0, 500)));
        assert!(segment.push(LocationSample::new(0.0, 0.0, 0.0, 2_000)));
        assert_eq!(segment.len(), 2);
    }

    #[test]
    fn test_open_segment_keeps_empty_segments() {
        let mut trace = RunTrace::new();
        trace.ensure_open_segment();
        trace.ensure_open_segment();
        assert_eq!(trace.segment_count(), 1);

        if let Some(segment) = trace.active_segment_mut() {
            segment.push(LocationSample::new(1.0, 1.0, 0.0, 1));
        }
        trace.open_segment();
        trace.open_segment();
        assert_eq!(trace.segment_count(), 3);
        assert_eq!(trace.sample_count(), 1);

        trace.ensure_open_segment();
        assert_eq!(trace.segment_count(), 3);
    }

    #[test]
    fn test_sample_validity() {
        assert!(LocationSample::new(51.5, -0.12, 30.0, 0).is_valid());
        assert!(!LocationSample::new(f64::NAN, -0.12, 30.0, 0).is_valid());
        assert!(!LocationSample::new(91.0, -0.12, 30.0, 0).is_valid());
        assert!(!LocationSample::new(51.5, 181.0, 30.0, 0).is_valid());
        assert!(!LocationSample::new(51.5, -0.12, f64::INFINITY, 0).is_valid());
    }

    #[test]
    fn test_avg_speed() {
        let run = Run {
            id: None,
            duration: Duration::from_secs(1800),
            start_time_utc: Utc::now(),
            distance_meters: 5_000.0,
            last_known_location: GpsPoint::new(0.0, 0.0),
            max_speed_kmh: 12.0,
            total_elevation_gain_meters: 0.0,
            map_image_ref: None,
        };
        assert!((run.avg_speed_kmh() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_run_id_generate_is_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
    }
}
