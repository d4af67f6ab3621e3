//! # Run Store
//!
//! SQLite-backed durable store for runs and their pending-sync records.
//!
//! ## Tables
//!
//! - `runs`: every locally known run, synced or not
//! - `pending_creates`: run snapshot + map image for runs the remote has not acknowledged
//! - `pending_deletes`: ids deleted locally but not yet remotely
//! - `tracking_state`: persisted tracking flags
//!
//! Every mutation that touches a run and a pending record commits in a single
//! transaction. After each commit the ordered run list is republished to
//! every subscriber, so no observer sees one half of a mutation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::DateTime;
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::watch;

use crate::error::LocalError;
use crate::migrations::run_migrations;
use crate::types::{GpsPoint, PendingCreate, PendingDelete, Run, RunId, TrackingState};

type StoreResult<T> = std::result::Result<T, LocalError>;

const SELECT_RUN_COLUMNS: &str = "SELECT id, duration_ms, start_time_ms, distance_meters, \
     latitude, longitude, max_speed_kmh, total_elevation_gain_meters, map_image_ref FROM runs";

/// What a local deletion left behind for the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// A PendingDelete was recorded; the remote copy must be removed.
    RemoteDeleteRequired,
    /// The run never reached the remote; its PendingCreate was dropped.
    LocalOnly,
}

/// How a create request ended, as far as the client can tell.
#[derive(Debug, Clone, Copy)]
pub enum CreateOutcome<'a> {
    /// The remote stored the run and returned its copy.
    Acknowledged(&'a Run),
    /// The request failed before the remote could have stored anything.
    NotDelivered,
    /// The request failed but the remote may have stored the run anyway.
    Uncertain,
}

struct StoreInner {
    db: Connection,
    /// Runs whose create request is currently on the wire
    creates_in_flight: HashSet<RunId>,
}

/// Durable store of runs and pending-sync records.
pub struct RunStore {
    inner: Mutex<StoreInner>,
    runs_tx: watch::Sender<Vec<Run>>,
}

// ============================================================================
// Row mapping
// ============================================================================

fn row_to_run(row: &Row) -> rusqlite::Result<Run> {
    let id: String = row.get(0)?;
    let duration_ms: i64 = row.get(1)?;
    let start_time_ms: i64 = row.get(2)?;
    let start_time_utc = DateTime::from_timestamp_millis(start_time_ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(2, start_time_ms))?;

    Ok(Run {
        id: Some(RunId::from(id)),
        duration: Duration::from_millis(duration_ms.max(0) as u64),
        start_time_utc,
        distance_meters: row.get(3)?,
        last_known_location: GpsPoint::new(row.get(4)?, row.get(5)?),
        max_speed_kmh: row.get(6)?,
        total_elevation_gain_meters: row.get(7)?,
        map_image_ref: row.get(8)?,
    })
}

fn load_runs(conn: &Connection) -> rusqlite::Result<Vec<Run>> {
    let mut stmt = conn.prepare(&format!(
        "{} ORDER BY start_time_ms DESC, id ASC",
        SELECT_RUN_COLUMNS
    ))?;
    let runs = stmt
        .query_map([], row_to_run)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(runs)
}

fn write_run(conn: &Connection, id: &RunId, run: &Run) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO runs (id, duration_ms, start_time_ms, distance_meters, latitude, longitude,
                           max_speed_kmh, total_elevation_gain_meters, map_image_ref)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
             duration_ms = excluded.duration_ms,
             start_time_ms = excluded.start_time_ms,
             distance_meters = excluded.distance_meters,
             latitude = excluded.latitude,
             longitude = excluded.longitude,
             max_speed_kmh = excluded.max_speed_kmh,
             total_elevation_gain_meters = excluded.total_elevation_gain_meters,
             map_image_ref = excluded.map_image_ref",
        params![
            id.as_str(),
            run.duration.as_millis() as i64,
            run.start_time_utc.timestamp_millis(),
            run.distance_meters,
            run.last_known_location.latitude,
            run.last_known_location.longitude,
            run.max_speed_kmh,
            run.total_elevation_gain_meters,
            run.map_image_ref,
        ],
    )?;
    Ok(())
}

fn require_id(run: &Run) -> StoreResult<&RunId> {
    run.id
        .as_ref()
        .ok_or_else(|| LocalError::storage("run has no id"))
}

fn read_pending_create(conn: &Connection, id: &RunId) -> StoreResult<Option<PendingCreate>> {
    let row: Option<(String, Vec<u8>)> = conn
        .query_row(
            "SELECT run_json, map_image FROM pending_creates WHERE run_id = ?",
            params![id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((run_json, map_image)) => Ok(Some(PendingCreate {
            run: serde_json::from_str(&run_json)?,
            map_image,
        })),
        None => Ok(None),
    }
}

impl RunStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) a store at the given path.
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref();
        info!("[RunStore] Opening {}", db_path.display());
        Self::from_connection(Connection::open(db_path)?)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut db: Connection) -> StoreResult<Self> {
        run_migrations(&mut db)?;
        let runs = load_runs(&db)?;
        debug!("[RunStore] Loaded {} runs", runs.len());
        let (runs_tx, _) = watch::channel(runs);

        Ok(Self {
            inner: Mutex::new(StoreInner {
                db,
                creates_in_flight: HashSet::new(),
            }),
            runs_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reload the run list and hand it to subscribers. Called after commit.
    fn publish(&self, db: &Connection) {
        match load_runs(db) {
            Ok(runs) => {
                self.runs_tx.send_replace(runs);
            }
            Err(e) => warn!("[RunStore] Failed to reload runs after commit: {}", e),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Subscribe to the ordered run list (newest first). The receiver starts
    /// with the current list and sees every later commit.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Run>> {
        self.runs_tx.subscribe()
    }

    pub fn runs(&self) -> StoreResult<Vec<Run>> {
        let inner = self.lock();
        Ok(load_runs(&inner.db)?)
    }

    pub fn get_run(&self, id: &RunId) -> StoreResult<Option<Run>> {
        let inner = self.lock();
        let run = inner
            .db
            .query_row(
                &format!("{} WHERE id = ?", SELECT_RUN_COLUMNS),
                params![id.as_str()],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    pub fn pending_create(&self, id: &RunId) -> StoreResult<Option<PendingCreate>> {
        let inner = self.lock();
        read_pending_create(&inner.db, id)
    }

    pub fn pending_creates(&self) -> StoreResult<Vec<PendingCreate>> {
        let inner = self.lock();
        let mut stmt = inner
            .db
            .prepare("SELECT run_json, map_image FROM pending_creates ORDER BY created_at, run_id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(run_json, map_image)| -> StoreResult<PendingCreate> {
                Ok(PendingCreate {
                    run: serde_json::from_str(&run_json)?,
                    map_image,
                })
            })
            .collect()
    }

    pub fn has_pending_delete(&self, id: &RunId) -> StoreResult<bool> {
        let inner = self.lock();
        let count: i64 = inner.db.query_row(
            "SELECT COUNT(*) FROM pending_deletes WHERE run_id = ?",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn pending_deletes(&self) -> StoreResult<Vec<PendingDelete>> {
        let inner = self.lock();
        let mut stmt = inner
            .db
            .prepare("SELECT run_id FROM pending_deletes ORDER BY created_at, run_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids
            .into_iter()
            .map(|id| PendingDelete {
                run_id: RunId::from(id),
            })
            .collect())
    }

    // ========================================================================
    // Interactive mutations
    // ========================================================================

    /// Write a run and its PendingCreate in one transaction. Any earlier
    /// PendingDelete for the same id is superseded.
    pub fn upsert_run_with_pending(&self, run: &Run, map_image: &[u8]) -> StoreResult<()> {
        let id = require_id(run)?;
        let run_json = serde_json::to_string(run)?;

        let mut inner = self.lock();
        let tx = inner.db.transaction()?;
        write_run(&tx, id, run)?;
        tx.execute(
            "INSERT OR REPLACE INTO pending_creates (run_id, run_json, map_image) VALUES (?1, ?2, ?3)",
            params![id.as_str(), run_json, map_image],
        )?;
        tx.execute(
            "DELETE FROM pending_deletes WHERE run_id = ?",
            params![id.as_str()],
        )?;
        tx.commit()?;

        debug!("[RunStore] Upserted run {} with pending create", id);
        self.publish(&inner.db);
        Ok(())
    }

    /// Delete a run locally and record what the remote still needs.
    ///
    /// A run the remote can not know about (PendingCreate present, no create
    /// on the wire, never acknowledged or possibly delivered) is dropped
    /// locally and nothing else is recorded. Otherwise a PendingDelete is
    /// inserted.
    pub fn delete_run_with_pending(&self, id: &RunId) -> StoreResult<DeleteOutcome> {
        let mut inner = self.lock();
        let create_in_flight = inner.creates_in_flight.contains(id);

        let tx = inner.db.transaction()?;
        let remote_known = tx
            .query_row(
                "SELECT remote_known FROM runs WHERE id = ?",
                params![id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some_and(|flag| flag != 0);
        tx.execute("DELETE FROM runs WHERE id = ?", params![id.as_str()])?;
        let dropped_creates = tx.execute(
            "DELETE FROM pending_creates WHERE run_id = ?",
            params![id.as_str()],
        )?;

        let outcome = if dropped_creates > 0 && !create_in_flight && !remote_known {
            DeleteOutcome::LocalOnly
        } else {
            tx.execute(
                "INSERT OR IGNORE INTO pending_deletes (run_id) VALUES (?)",
                params![id.as_str()],
            )?;
            DeleteOutcome::RemoteDeleteRequired
        };
        tx.commit()?;

        debug!("[RunStore] Deleted run {} ({:?})", id, outcome);
        self.publish(&inner.db);
        Ok(outcome)
    }

    /// Merge the authoritative remote list into the local cache.
    ///
    /// Runs with a PendingCreate keep their local version, runs with a
    /// PendingDelete are not resurrected, and local runs missing remotely are
    /// removed only when nothing is pending for them.
    pub fn merge_remote_runs(&self, remote: &[Run]) -> StoreResult<usize> {
        let mut inner = self.lock();
        let tx = inner.db.transaction()?;

        let pending_ids: HashSet<String> = {
            let mut stmt = tx.prepare(
                "SELECT run_id FROM pending_creates UNION SELECT run_id FROM pending_deletes",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<HashSet<_>>>()?;
            ids
        };

        let mut remote_ids = HashSet::new();
        let mut written = 0;
        for run in remote {
            let Some(id) = run.id.as_ref() else {
                warn!("[RunStore] Skipping remote run without id");
                continue;
            };
            remote_ids.insert(id.as_str().to_string());
            if !pending_ids.contains(id.as_str()) {
                write_run(&tx, id, run)?;
                written += 1;
            }
            tx.execute(
                "UPDATE runs SET remote_known = 1 WHERE id = ?",
                params![id.as_str()],
            )?;
        }

        let local_ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM runs")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        let mut removed = 0;
        for id in local_ids {
            if !remote_ids.contains(&id) && !pending_ids.contains(&id) {
                tx.execute("DELETE FROM runs WHERE id = ?", params![id])?;
                removed += 1;
            }
        }
        tx.commit()?;

        info!(
            "[RunStore] Merged remote runs: {} written, {} removed",
            written, removed
        );
        self.publish(&inner.db);
        Ok(written)
    }

    /// Clear runs, pending records and tracking state.
    pub fn delete_all(&self) -> StoreResult<()> {
        let mut inner = self.lock();
        let tx = inner.db.transaction()?;
        tx.execute_batch(
            "DELETE FROM runs;
             DELETE FROM pending_creates;
             DELETE FROM pending_deletes;
             UPDATE tracking_state SET run_active = 0, tracking = 0 WHERE id = 1;",
        )?;
        tx.commit()?;
        inner.creates_in_flight.clear();

        info!("[RunStore] Cleared all runs and pending records");
        self.publish(&inner.db);
        Ok(())
    }

    // ========================================================================
    // Job bookkeeping
    // ========================================================================

    /// Read the PendingCreate for `id` and mark its create request as in
    /// flight. Returns None if the record is gone.
    pub fn begin_create_attempt(&self, id: &RunId) -> StoreResult<Option<PendingCreate>> {
        let mut inner = self.lock();
        let pending = read_pending_create(&inner.db, id)?;
        if pending.is_some() {
            inner.creates_in_flight.insert(id.clone());
        }
        Ok(pending)
    }

    /// Close a create attempt. On acknowledgement the PendingCreate is
    /// deleted, the run is marked as known remotely and the remote map
    /// reference (if any) is recorded, all in one transaction. An uncertain
    /// failure only marks the run as known remotely.
    pub fn finish_create_attempt(&self, id: &RunId, outcome: CreateOutcome<'_>) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.creates_in_flight.remove(id);

        let remote = match outcome {
            CreateOutcome::NotDelivered => return Ok(()),
            CreateOutcome::Uncertain => {
                inner.db.execute(
                    "UPDATE runs SET remote_known = 1 WHERE id = ?",
                    params![id.as_str()],
                )?;
                debug!("[RunStore] Create for {} may have landed", id);
                return Ok(());
            }
            CreateOutcome::Acknowledged(remote) => remote,
        };

        let tx = inner.db.transaction()?;
        tx.execute(
            "DELETE FROM pending_creates WHERE run_id = ?",
            params![id.as_str()],
        )?;
        tx.execute(
            "UPDATE runs SET remote_known = 1 WHERE id = ?",
            params![id.as_str()],
        )?;
        if let Some(map_ref) = remote.map_image_ref.as_deref() {
            tx.execute(
                "UPDATE runs SET map_image_ref = ?1 WHERE id = ?2",
                params![map_ref, id.as_str()],
            )?;
        }
        tx.commit()?;

        debug!("[RunStore] Create acknowledged for {}", id);
        self.publish(&inner.db);
        Ok(())
    }

    /// Delete the PendingDelete for `id`. Returns false if it was already gone.
    pub fn complete_pending_delete(&self, id: &RunId) -> StoreResult<bool> {
        let inner = self.lock();
        let removed = inner.db.execute(
            "DELETE FROM pending_deletes WHERE run_id = ?",
            params![id.as_str()],
        )?;
        Ok(removed > 0)
    }

    // ========================================================================
    // Tracking state
    // ========================================================================

    pub fn tracking_state(&self) -> StoreResult<TrackingState> {
        let inner = self.lock();
        let state = inner.db.query_row(
            "SELECT run_active, tracking FROM tracking_state WHERE id = 1",
            [],
            |row| {
                Ok(TrackingState {
                    run_active: row.get::<_, i64>(0)? != 0,
                    tracking: row.get::<_, i64>(1)? != 0,
                })
            },
        )?;
        Ok(state)
    }

    pub fn save_tracking_state(&self, state: TrackingState) -> StoreResult<()> {
        let inner = self.lock();
        inner.db.execute(
            "UPDATE tracking_state SET run_active = ?1, tracking = ?2 WHERE id = 1",
            params![state.run_active, state.tracking],
        )?;
        Ok(())
    }

    /// Run raw SQL against the store, for tests that need a broken schema.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        self.lock().db.execute_batch(sql)?;
        Ok(())
    }
}
