//! Schema migrations for the run store.

use log::info;
use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

/// Initial schema: runs plus the two pending-sync tables.
const V1_RUNS_AND_PENDING: &str = r#"
    -- Locally known runs (synced or not)
    CREATE TABLE runs (
        id TEXT PRIMARY KEY,
        duration_ms INTEGER NOT NULL,
        start_time_ms INTEGER NOT NULL,      -- Unix epoch millis, UTC
        distance_meters REAL NOT NULL,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        max_speed_kmh REAL NOT NULL,
        total_elevation_gain_meters REAL NOT NULL,
        map_image_ref TEXT
    );

    CREATE INDEX idx_runs_start_time ON runs(start_time_ms DESC);

    -- Runs not yet acknowledged by the remote service
    CREATE TABLE pending_creates (
        run_id TEXT PRIMARY KEY,
        run_json TEXT NOT NULL,
        map_image BLOB NOT NULL,
        created_at INTEGER DEFAULT (strftime('%s', 'now'))
    );

    -- Local deletions not yet acknowledged by the remote service
    CREATE TABLE pending_deletes (
        run_id TEXT PRIMARY KEY,
        created_at INTEGER DEFAULT (strftime('%s', 'now'))
    );
"#;

/// Persisted tracking flags (single row).
const V2_TRACKING_STATE: &str = r#"
    CREATE TABLE tracking_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        run_active INTEGER NOT NULL DEFAULT 0,
        tracking INTEGER NOT NULL DEFAULT 0
    );

    INSERT INTO tracking_state (id, run_active, tracking) VALUES (1, 0, 0);
"#;

/// Whether the remote may hold a copy of the run. Set once a create is
/// acknowledged, may have landed, or the run came from a fetch.
const V3_REMOTE_KNOWN: &str = r#"
    ALTER TABLE runs ADD COLUMN remote_known INTEGER NOT NULL DEFAULT 0;
"#;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(V1_RUNS_AND_PENDING),
        M::up(V2_TRACKING_STATE),
        M::up(V3_REMOTE_KNOWN),
    ])
}

/// Bring the schema up to the latest version.
pub fn run_migrations(conn: &mut Connection) -> Result<(), rusqlite_migration::Error> {
    migrations().to_latest(conn)?;
    info!("[RunStore] Schema up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM tracking_state", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
