//! # Runsync
//!
//! Offline-first run tracking core.
//!
//! This library provides:
//! - Live aggregation of GPS fixes into a segmented run trace
//! - Run metrics (distance, max speed, elevation gain, pace)
//! - A SQLite-backed run store with durable pending-sync records
//! - Bounded, classified background retry jobs against a remote service
//!
//! ## Quick Start
//!
//! ```rust
//! use runsync::{metrics, LocationSample, LocationSegment, RunTrace};
//!
//! let segment = LocationSegment::from_samples(vec![
//!     LocationSample::new(51.5074, -0.1278, 10.0, 0),
//!     LocationSample::new(51.5080, -0.1278, 14.0, 10_000),
//! ]);
//! let trace = RunTrace::from_segments(vec![segment]);
//!
//! assert!(metrics::max_speed_kmh(&trace) > 0.0);
//! assert_eq!(metrics::total_elevation_gain_meters(&trace), 4.0);
//! ```

// Unified error handling
pub mod error;
pub use error::{ConfigError, DataError, Disposition, LocalError, NetworkError, Result};

// Core data model
pub mod types;
pub use types::{
    GpsPoint, LocationSample, LocationSegment, PendingCreate, PendingDelete, Run, RunData, RunId, RunTrace,
    TrackingState,
};

// Configuration
pub mod config;
pub use config::{HttpConfig, SyncConfig, TrackerConfig};

// Geographic utilities (great-circle distance)
pub mod geo_utils;

// Trace metrics and run summaries
pub mod metrics;

// Display formatting for durations, distances and pace
pub mod format;

// Live location aggregation
pub mod tracker;
pub use tracker::{ChannelLocationSource, LocationAggregator, LocationEvent, LocationSource};

// SQLite persistence
pub mod migrations;
pub mod persistence;
pub use persistence::{CreateOutcome, DeleteOutcome, RunStore};

// Remote service boundary
pub mod gateway;
pub use gateway::RemoteRunGateway;

pub mod http;
pub use http::HttpRunGateway;

// Background sync jobs
pub mod jobs;
pub use jobs::{JobHandle, JobKind, JobScheduler, JobState, RetryableJob, SyncAttempt};

// Orchestrator facade
pub mod repository;
pub use repository::RunSyncOrchestrator;

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("runsync"),
    );
}

#[cfg(not(target_os = "android"))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}
