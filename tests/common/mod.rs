//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use runsync::{GpsPoint, NetworkError, RemoteRunGateway, Run, RunId, SyncConfig};
use tokio::sync::Semaphore;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Short backoff so paused-clock tests stay readable.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        retry_base_delay: Duration::from_millis(100),
        retry_max_delay: Duration::from_secs(1),
        ..SyncConfig::default()
    }
}

pub fn sample_run(id: Option<&str>, start_secs: i64) -> Run {
    Run {
        id: id.map(RunId::from),
        duration: Duration::from_secs(1_500),
        start_time_utc: Utc.timestamp_opt(start_secs, 0).unwrap(),
        distance_meters: 5_000.0,
        last_known_location: GpsPoint::new(51.5, -0.12),
        max_speed_kmh: 15.0,
        total_elevation_gain_meters: 20.0,
        map_image_ref: None,
    }
}

/// In-memory remote service with switchable failures.
#[derive(Default)]
pub struct ScriptedGateway {
    failure: Mutex<Option<NetworkError>>,
    /// When set, every post waits for a permit
    post_gate: Option<Arc<Semaphore>>,
    /// When set, posts are stored but answered with a timeout
    lose_acks: AtomicBool,
    remote: Mutex<Vec<Run>>,
    post_calls: AtomicU32,
    delete_calls: AtomicU32,
    logout_calls: AtomicU32,
}

impl ScriptedGateway {
    pub fn online() -> Self {
        Self::default()
    }

    pub fn offline() -> Self {
        Self::failing(NetworkError::NoInternet)
    }

    pub fn failing(error: NetworkError) -> Self {
        Self {
            failure: Mutex::new(Some(error)),
            ..Self::default()
        }
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            post_gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn set_failure(&self, failure: Option<NetworkError>) {
        *self.failure.lock().unwrap() = failure;
    }

    pub fn set_lose_acks(&self, lose: bool) {
        self.lose_acks.store(lose, Ordering::SeqCst);
    }

    pub fn seed_remote(&self, run: Run) {
        self.remote.lock().unwrap().push(run);
    }

    pub fn remote_ids(&self) -> Vec<RunId> {
        let mut ids: Vec<_> = self
            .remote
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn post_calls(&self) -> u32 {
        self.post_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> u32 {
        self.logout_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), NetworkError> {
        match *self.failure.lock().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteRunGateway for ScriptedGateway {
    async fn post_run(&self, run: &Run, _map_image: &[u8]) -> Result<Run, NetworkError> {
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.post_gate {
            let _permit = gate.acquire().await.unwrap();
        }
        self.check()?;

        let id = run.id.clone().ok_or(NetworkError::Serialization)?;
        let mut stored = run.clone();
        stored.map_image_ref = Some(format!("https://maps.example/{}.jpg", id));

        let mut remote = self.remote.lock().unwrap();
        remote.retain(|r| r.id.as_ref() != Some(&id));
        remote.push(stored.clone());
        if self.lose_acks.load(Ordering::SeqCst) {
            return Err(NetworkError::RequestTimeout);
        }
        Ok(stored)
    }

    async fn delete_run(&self, id: &RunId) -> Result<(), NetworkError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.remote
            .lock()
            .unwrap()
            .retain(|r| r.id.as_ref() != Some(id));
        Ok(())
    }

    async fn fetch_runs(&self) -> Result<Vec<Run>, NetworkError> {
        self.check()?;
        Ok(self.remote.lock().unwrap().clone())
    }

    async fn logout(&self) -> Result<(), NetworkError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.check()
    }
}
