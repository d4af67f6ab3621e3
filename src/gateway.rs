//! Remote run service boundary.
//!
//! The interactive path (`fetch_runs`, `logout`) and the background jobs
//! (`post_run`, `delete_run`) both talk to the service through
//! [`RemoteRunGateway`]. Wire DTOs live here so every gateway shares them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::types::{GpsPoint, Run, RunId};

/// Remote run service.
#[async_trait]
pub trait RemoteRunGateway: Send + Sync {
    /// Upload a run with its map image. Returns the remote copy, which may
    /// carry the stored map image URL.
    async fn post_run(&self, run: &Run, map_image: &[u8]) -> Result<Run, NetworkError>;

    /// Delete a run remotely. Deleting an id the service does not know
    /// counts as success.
    async fn delete_run(&self, id: &RunId) -> Result<(), NetworkError>;

    async fn fetch_runs(&self) -> Result<Vec<Run>, NetworkError>;

    /// Invalidate the remote session.
    async fn logout(&self) -> Result<(), NetworkError>;
}

// ============================================================================
// Wire format
// ============================================================================

/// Run as returned by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDto {
    pub id: String,
    pub date_time_utc: String,
    pub duration_millis: u64,
    pub distance_meters: f64,
    pub lat: f64,
    pub long: f64,
    pub avg_speed_kmh: f64,
    pub max_speed_kmh: f64,
    pub total_elevation_meters: f64,
    pub map_picture_url: Option<String>,
}

/// Body of the `RUN_DATA` part of a create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub id: String,
    pub duration_millis: u64,
    pub distance_meters: f64,
    pub epoch_millis: i64,
    pub lat: f64,
    pub long: f64,
    pub avg_speed_kmh: f64,
    pub max_speed_kmh: f64,
    pub total_elevation_meters: f64,
}

impl RunDto {
    pub fn into_run(self) -> Result<Run, NetworkError> {
        let start_time_utc = DateTime::parse_from_rfc3339(&self.date_time_utc)
            .map_err(|_| NetworkError::Serialization)?
            .with_timezone(&Utc);

        Ok(Run {
            id: Some(RunId::from(self.id)),
            duration: Duration::from_millis(self.duration_millis),
            start_time_utc,
            distance_meters: self.distance_meters,
            last_known_location: GpsPoint::new(self.lat, self.long),
            max_speed_kmh: self.max_speed_kmh,
            total_elevation_gain_meters: self.total_elevation_meters,
            map_image_ref: self.map_picture_url,
        })
    }
}

impl CreateRunRequest {
    /// Build the create payload. Fails for a run without id.
    pub fn from_run(run: &Run) -> Result<Self, NetworkError> {
        let id = run.id.as_ref().ok_or(NetworkError::Serialization)?;
        Ok(Self {
            id: id.to_string(),
            duration_millis: run.duration.as_millis() as u64,
            distance_meters: run.distance_meters,
            epoch_millis: run.start_time_utc.timestamp_millis(),
            lat: run.last_known_location.latitude,
            long: run.last_known_location.longitude,
            avg_speed_kmh: run.avg_speed_kmh(),
            max_speed_kmh: run.max_speed_kmh,
            total_elevation_meters: run.total_elevation_gain_meters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_dto_parsing() {
        let json = r#"{
            "id": "abc",
            "dateTimeUtc": "2024-05-01T07:30:00Z",
            "durationMillis": 1800000,
            "distanceMeters": 5000.0,
            "lat": 51.5,
            "long": -0.12,
            "avgSpeedKmh": 10.0,
            "maxSpeedKmh": 14.5,
            "totalElevationMeters": 42.0,
            "mapPictureUrl": "https://maps/abc.jpg"
        }"#;
        let dto: RunDto = serde_json::from_str(json).unwrap();
        let run = dto.into_run().unwrap();

        assert_eq!(run.id, Some(RunId::from("abc")));
        assert_eq!(run.duration, Duration::from_secs(1800));
        assert_eq!(run.total_elevation_gain_meters, 42.0);
        assert_eq!(run.map_image_ref.as_deref(), Some("https://maps/abc.jpg"));
    }

    #[test]
    fn test_bad_timestamp_is_serialization_error() {
        let dto = RunDto {
            id: "abc".to_string(),
            date_time_utc: "yesterday".to_string(),
            duration_millis: 0,
            distance_meters: 0.0,
            lat: 0.0,
            long: 0.0,
            avg_speed_kmh: 0.0,
            max_speed_kmh: 0.0,
            total_elevation_meters: 0.0,
            map_picture_url: None,
        };
        assert_eq!(dto.into_run().unwrap_err(), NetworkError::Serialization);
    }

    #[test]
    fn test_create_request_requires_id() {
        let run = Run {
            id: None,
            duration: Duration::from_secs(60),
            start_time_utc: Utc::now(),
            distance_meters: 200.0,
            last_known_location: GpsPoint::new(1.0, 2.0),
            max_speed_kmh: 15.0,
            total_elevation_gain_meters: 0.0,
            map_image_ref: None,
        };
        assert!(CreateRunRequest::from_run(&run).is_err());

        let run = Run {
            id: Some(RunId::from("r1")),
            ..run
        };
        let request = CreateRunRequest::from_run(&run).unwrap();
        assert_eq!(request.id, "r1");
        assert!((request.avg_speed_kmh - 12.0).abs() < 1e-9);
    }
}
