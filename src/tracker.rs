//! # Location Aggregator
//!
//! Turns a live stream of location fixes into a segmented [`RunTrace`], a
//! running distance and an elapsed-time counter.
//!
//! Three values are published on `tokio::sync::watch` channels, so late
//! subscribers always see the latest value:
//! - current location (every fix, tracked or not)
//! - [`RunData`] (trace + distance, updated per recorded fix)
//! - elapsed tracked time (republished every `tick_interval`)
//!
//! Samples are recorded only while tracking is *effective*: tracking was
//! requested, the source is available, and the run is not finished. Every
//! transition into the effective state opens a new segment.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::TrackerConfig;
use crate::geo_utils::sample_distance;
use crate::persistence::RunStore;
use crate::types::{LocationSample, RunData, RunTrace, TrackingState};

/// Event emitted by a [`LocationSource`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocationEvent {
    Sample(LocationSample),
    /// Permission revoked or hardware gone; ingestion is suspended.
    Unavailable,
    /// The source recovered.
    Available,
}

/// Platform location provider.
pub trait LocationSource: Send + Sync {
    /// Acquire the provider. Events arrive on the returned channel until
    /// [`stop`](LocationSource::stop) is called or the sender is dropped.
    fn start(&self) -> mpsc::UnboundedReceiver<LocationEvent>;

    /// Release the provider.
    fn stop(&self);
}

/// [`LocationSource`] fed by the host app, e.g. from a platform callback.
#[derive(Default)]
pub struct ChannelLocationSource {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<LocationEvent>>>,
}

impl ChannelLocationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every active subscriber.
    pub fn emit(&self, event: LocationEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|tx| tx.send(event).is_ok());
    }
}

impl LocationSource for ChannelLocationSource {
    fn start(&self) -> mpsc::UnboundedReceiver<LocationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut guard) => guard.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    fn stop(&self) {
        match self.subscribers.lock() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

// ============================================================================
// Aggregator state
// ============================================================================

#[derive(Default)]
struct TrackerState {
    /// Tracking requested by the user
    tracking: bool,
    source_available: bool,
    finished: bool,
    trace: RunTrace,
    distance_meters: f64,
    /// Tracked time accumulated before `resumed_at`
    elapsed_base: Duration,
    /// Set while tracking is effective
    resumed_at: Option<Instant>,
    started_at_utc: Option<DateTime<Utc>>,
}

impl TrackerState {
    fn is_effective(&self) -> bool {
        self.tracking && self.source_available && !self.finished
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.elapsed_base
            + self
                .resumed_at
                .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }

    /// Apply an effective-tracking transition after any flag change.
    fn sync_effective(&mut self, now: Instant) {
        match (self.resumed_at, self.is_effective()) {
            (None, true) => {
                self.trace.ensure_open_segment();
                self.resumed_at = Some(now);
                self.started_at_utc.get_or_insert_with(Utc::now);
            }
            (Some(since), false) => {
                self.elapsed_base += now.saturating_duration_since(since);
                self.resumed_at = None;
            }
            _ => {}
        }
    }

    fn persisted(&self) -> TrackingState {
        TrackingState {
            run_active: self.started_at_utc.is_some() && !self.finished,
            tracking: self.tracking,
        }
    }

    /// Record a fix. Returns true if the trace changed.
    fn record(&mut self, sample: LocationSample) -> bool {
        if !self.is_effective() {
            return false;
        }
        if !sample.is_valid() {
            debug!(
                "[LocationAggregator] Dropping invalid fix at {}",
                sample.timestamp_millis
            );
            return false;
        }
        if let Some(last) = self.trace.last_sample() {
            // Also rejects a fix that would overlap the previous segment
            if sample.timestamp_millis <= last.timestamp_millis {
                debug!(
                    "[LocationAggregator] Dropping out-of-order fix at {}",
                    sample.timestamp_millis
                );
                return false;
            }
        }
        let Some(segment) = self.trace.active_segment_mut() else {
            return false;
        };
        let step = segment.last().map_or(0.0, |prev| sample_distance(prev, &sample));
        if !segment.push(sample) {
            return false;
        }
        self.distance_meters += step;
        true
    }
}

struct Shared {
    state: Mutex<TrackerState>,
    current_location: watch::Sender<Option<LocationSample>>,
    run_data: watch::Sender<RunData>,
    elapsed: watch::Sender<Duration>,
    store: Option<Arc<RunStore>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish_run_data(&self, state: &TrackerState) {
        self.run_data.send_replace(RunData {
            trace: state.trace.clone(),
            distance_meters: state.distance_meters,
        });
    }

    fn publish_elapsed(&self) {
        let elapsed = self.lock().elapsed(Instant::now());
        self.elapsed.send_if_modified(|current| {
            let changed = *current != elapsed;
            *current = elapsed;
            changed
        });
    }

    fn persist(&self, state: &TrackerState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_tracking_state(state.persisted()) {
                warn!("[LocationAggregator] Failed to persist tracking state: {}", e);
            }
        }
    }

    fn handle_event(&self, event: LocationEvent) {
        let mut state = self.lock();
        match event {
            LocationEvent::Sample(sample) => {
                if state.finished {
                    return;
                }
                if sample.is_valid() {
                    self.current_location.send_replace(Some(sample));
                }
                if state.record(sample) {
                    self.publish_run_data(&state);
                }
            }
            LocationEvent::Unavailable | LocationEvent::Available => {
                let available = event == LocationEvent::Available;
                if state.source_available == available {
                    return;
                }
                info!(
                    "[LocationAggregator] Location source {}",
                    if available { "available" } else { "unavailable" }
                );
                state.source_available = available;
                state.sync_effective(Instant::now());
                drop(state);
                self.publish_elapsed();
            }
        }
    }

    fn set_source_available(&self, available: bool) {
        let mut state = self.lock();
        state.source_available = available;
        state.sync_effective(Instant::now());
    }
}

struct ObserverTasks {
    events: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

impl ObserverTasks {
    fn abort(self) {
        self.events.abort();
        self.ticker.abort();
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Live run telemetry.
///
/// `start_observing` must be called from within a tokio runtime.
pub struct LocationAggregator {
    shared: Arc<Shared>,
    source: Arc<dyn LocationSource>,
    config: TrackerConfig,
    tasks: Mutex<Option<ObserverTasks>>,
}

impl LocationAggregator {
    pub fn new(source: Arc<dyn LocationSource>, config: TrackerConfig) -> Self {
        Self::build(source, config, None)
    }

    /// Like [`new`](Self::new), but the tracking flags are written to `store`
    /// on every start, toggle, finish and reset.
    pub fn with_state_store(
        source: Arc<dyn LocationSource>,
        config: TrackerConfig,
        store: Arc<RunStore>,
    ) -> Self {
        Self::build(source, config, Some(store))
    }

    fn build(
        source: Arc<dyn LocationSource>,
        config: TrackerConfig,
        store: Option<Arc<RunStore>>,
    ) -> Self {
        let (current_location, _) = watch::channel(None);
        let (run_data, _) = watch::channel(RunData::default());
        let (elapsed, _) = watch::channel(Duration::ZERO);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TrackerState::default()),
                current_location,
                run_data,
                elapsed,
                store,
            }),
            source,
            config,
            tasks: Mutex::new(None),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Option<ObserverTasks>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ========================================================================
    // Source lifecycle
    // ========================================================================

    /// Acquire the location source. Idempotent.
    pub fn start_observing(&self) {
        let mut tasks = self.tasks();
        if tasks.is_some() {
            return;
        }

        let mut events_rx = self.source.start();
        self.shared.set_source_available(true);

        let shared = Arc::clone(&self.shared);
        let events = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                shared.handle_event(event);
            }
            debug!("[LocationAggregator] Location stream closed");
        });

        let shared = Arc::clone(&self.shared);
        let tick = self.config.tick_interval.max(Duration::from_millis(1));
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                shared.publish_elapsed();
            }
        });

        *tasks = Some(ObserverTasks { events, ticker });
        info!("[LocationAggregator] Started observing");
    }

    /// Release the location source. No-op when not observing. Recorded trace
    /// data is kept.
    pub fn stop_observing(&self) {
        let Some(tasks) = self.tasks().take() else {
            return;
        };
        tasks.abort();
        self.source.stop();
        self.shared.set_source_available(false);
        self.shared.publish_elapsed();
        info!("[LocationAggregator] Stopped observing");
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Record (true) or discard (false) incoming fixes. Resuming opens a new
    /// segment.
    pub fn set_tracking(&self, tracking: bool) {
        let mut state = self.shared.lock();
        if state.finished || state.tracking == tracking {
            return;
        }
        state.tracking = tracking;
        if tracking {
            // Every resume starts a segment, even after an empty pause
            state.trace.open_segment();
        }
        state.sync_effective(Instant::now());
        self.shared.persist(&state);
        debug!("[LocationAggregator] Tracking set to {}", tracking);
        drop(state);
        self.shared.publish_elapsed();
    }

    pub fn is_tracking(&self) -> bool {
        self.shared.lock().tracking
    }

    /// Freeze the run and hand back its trace, one segment per resume.
    /// Later fixes are ignored until [`reset`](Self::reset).
    pub fn finish(&self) -> RunTrace {
        let mut state = self.shared.lock();
        let now = Instant::now();
        state.finished = true;
        state.sync_effective(now);
        state.tracking = false;
        self.shared.persist(&state);

        let trace = state.trace.clone();
        info!(
            "[LocationAggregator] Finished run: {} segments, {} samples, {:.0} m",
            trace.segment_count(),
            trace.sample_count(),
            state.distance_meters
        );
        drop(state);
        self.shared.publish_elapsed();
        trace
    }

    /// Clear all run state for a new run.
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        let source_available = state.source_available;
        *state = TrackerState {
            source_available,
            ..TrackerState::default()
        };
        self.shared.persist(&state);
        self.shared.publish_run_data(&state);
        drop(state);
        self.shared.publish_elapsed();
        debug!("[LocationAggregator] Reset");
    }

    // ========================================================================
    // Observables
    // ========================================================================

    pub fn current_location(&self) -> watch::Receiver<Option<LocationSample>> {
        self.shared.current_location.subscribe()
    }

    pub fn run_data(&self) -> watch::Receiver<RunData> {
        self.shared.run_data.subscribe()
    }

    pub fn elapsed(&self) -> watch::Receiver<Duration> {
        self.shared.elapsed.subscribe()
    }

    /// Tracked time right now, without waiting for the next tick.
    pub fn elapsed_now(&self) -> Duration {
        self.shared.lock().elapsed(Instant::now())
    }

    /// Wall-clock time tracking first became effective for this run.
    pub fn started_at_utc(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().started_at_utc
    }
}

impl Drop for LocationAggregator {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks().take() {
            tasks.abort();
            self.source.stop();
        }
    }
}
