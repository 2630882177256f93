//! SQLite database store implementation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use super::models::*;
use crate::config::MonitorSettings;
use crate::monitor::EntityMonitorState;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
const SETTINGS_KEY: &str = "monitor";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Background task failed: {0}")]
    Task(String),
    #[error("Not found")]
    NotFound,
}

/// A persisted state together with the time it was written.
#[derive(Debug, Clone)]
pub struct PersistedState {
    pub state: EntityMonitorState,
    pub updated_at: DateTime<Utc>,
}

impl PersistedState {
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match freshness_cutoff(now, window) {
            Some(cutoff) => self.updated_at >= cutoff,
            None => true,
        }
    }
}

/// Oldest write time still inside `window`.
///
/// `None` when the window reaches back past any representable time, in which
/// case every record is fresh.
pub fn freshness_cutoff(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    ChronoDuration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
}

/// Persistence contract the monitor engine relies on.
pub trait StateStore: Send + Sync {
    fn load(&self, entity_id: &str) -> Result<Option<PersistedState>, DbError>;
    /// States written within `window`. Rows that fail to decode are skipped.
    fn load_all_fresher_than(&self, window: Duration) -> Result<Vec<EntityMonitorState>, DbError>;
    /// Writes are conditional: a row is never replaced by an older revision.
    fn save(&self, state: &EntityMonitorState) -> Result<(), DbError>;
    /// Returns how many rows were actually written.
    fn save_all(&self, states: &[EntityMonitorState]) -> Result<usize, DbError>;
    fn delete(&self, entity_id: &str) -> Result<(), DbError>;
}

/// Source of the live fleet list.
pub trait FleetSource: Send + Sync {
    fn list_endpoints(&self) -> Result<Vec<MonitoredEndpoint>, DbError>;
}

/// Thread-safe database store.
///
/// Holds a few connections to the same WAL-mode database. Per-entity writes
/// pick a connection by hashing the entity id, so saves for unrelated
/// entities do not wait on one another in-process.
#[derive(Clone)]
pub struct Store {
    conns: Arc<Vec<Mutex<Connection>>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::with_connections(path, 1)
    }

    /// Create a store with `connections` shards (at least one).
    pub fn with_connections<P: AsRef<Path>>(path: P, connections: usize) -> Result<Self, DbError> {
        let path = path.as_ref();

        let mut first = open_connection(path)?;
        embedded::migrations::runner()
            .run(&mut first)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        let mut conns = vec![Mutex::new(first)];
        for _ in 1..connections.max(1) {
            conns.push(Mutex::new(open_connection(path)?));
        }

        Ok(Self {
            conns: Arc::new(conns),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conns[0])
    }

    fn conn_for(&self, entity_id: &str) -> MutexGuard<'_, Connection> {
        let mut hasher = DefaultHasher::new();
        entity_id.hash(&mut hasher);
        let shard = (hasher.finish() % self.conns.len() as u64) as usize;
        lock(&self.conns[shard])
    }

    // --- Endpoints ---

    /// Get all endpoints.
    pub fn get_endpoints(&self) -> Result<Vec<MonitoredEndpoint>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT entity_id, host, port, enabled FROM endpoints ORDER BY entity_id",
        )?;

        let endpoints = stmt
            .query_map([], |row| {
                Ok(MonitoredEndpoint {
                    entity_id: row.get(0)?,
                    host: row.get(1)?,
                    port: row.get(2)?,
                    enabled: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(endpoints)
    }

    /// Get an endpoint by entity id.
    pub fn get_endpoint(&self, entity_id: &str) -> Result<MonitoredEndpoint, DbError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT entity_id, host, port, enabled FROM endpoints WHERE entity_id = ?1",
            params![entity_id],
            |row| {
                Ok(MonitoredEndpoint {
                    entity_id: row.get(0)?,
                    host: row.get(1)?,
                    port: row.get(2)?,
                    enabled: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Insert or update an endpoint.
    pub fn upsert_endpoint(&self, endpoint: &MonitoredEndpoint) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO endpoints (entity_id, host, port, enabled) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(entity_id) DO UPDATE SET
             host=excluded.host, port=excluded.port, enabled=excluded.enabled",
            params![
                endpoint.entity_id,
                endpoint.host,
                endpoint.port,
                endpoint.enabled,
            ],
        )?;
        Ok(())
    }

    /// Delete an endpoint and its monitor state.
    pub fn delete_endpoint(&self, entity_id: &str) -> Result<(), DbError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM monitor_state WHERE entity_id = ?1", params![entity_id])?;
        let deleted = tx.execute("DELETE FROM endpoints WHERE entity_id = ?1", params![entity_id])?;
        tx.commit()?;

        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Settings ---

    /// Load the persisted monitor settings, if any were saved.
    pub fn load_settings(&self) -> Result<Option<MonitorSettings>, DbError> {
        let conn = self.conn();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SETTINGS_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| DbError::Decode(format!("settings: {}", e))),
        }
    }

    /// Persist the monitor settings.
    pub fn save_settings(&self, settings: &MonitorSettings) -> Result<(), DbError> {
        let json = serde_json::to_string(settings)
            .map_err(|e| DbError::Decode(format!("settings: {}", e)))?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![SETTINGS_KEY, json],
        )?;
        Ok(())
    }

    // --- Monitor state ---

    /// Delete states whose endpoint is gone, disabled or has no host.
    pub fn prune_orphaned_states(&self) -> Result<usize, DbError> {
        let conn = self.conn();
        let pruned = conn.execute(
            "DELETE FROM monitor_state WHERE entity_id NOT IN
             (SELECT entity_id FROM endpoints WHERE enabled = 1 AND trim(host) != '')",
            [],
        )?;
        Ok(pruned)
    }

    fn query_states(
        conn: &Connection,
        filter: &str,
        param: &str,
    ) -> Result<Vec<(StateRow, String)>, DbError> {
        let sql = format!(
            "SELECT entity_id, current_state, pending_state, pending_since, last_stable_at,
                    instability_started_at, switch_count, last_notified_at, last_probe_at,
                    last_probe_ok, revision, updated_at
             FROM monitor_state WHERE {}",
            filter
        );
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt
            .query_map(params![param], |row| {
                Ok((
                    StateRow {
                        entity_id: row.get(0)?,
                        current_state: row.get(1)?,
                        pending_state: row.get(2)?,
                        pending_since: row.get(3)?,
                        last_stable_at: row.get(4)?,
                        instability_started_at: row.get(5)?,
                        switch_count: row.get(6)?,
                        last_notified_at: row.get(7)?,
                        last_probe_at: row.get(8)?,
                        last_probe_ok: row.get(9)?,
                        revision: row.get(10)?,
                    },
                    row.get::<_, String>(11)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    /// Overwrite the write time of a state row.
    #[cfg(test)]
    pub fn set_state_updated_at(&self, entity_id: &str, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE monitor_state SET updated_at = ?1 WHERE entity_id = ?2",
            params![fmt_time(at), entity_id],
        )?;
        Ok(())
    }
}

impl StateStore for Store {
    fn load(&self, entity_id: &str) -> Result<Option<PersistedState>, DbError> {
        let conn = self.conn_for(entity_id);
        let mut rows = Self::query_states(&conn, "entity_id = ?1", entity_id)?;

        let Some((row, updated_at)) = rows.pop() else {
            return Ok(None);
        };
        let updated_at = parse_db_time(&updated_at)
            .ok_or_else(|| DbError::Decode(format!("bad updated_at {:?}", updated_at)))?;

        Ok(Some(PersistedState {
            state: row.decode()?,
            updated_at,
        }))
    }

    fn load_all_fresher_than(&self, window: Duration) -> Result<Vec<EntityMonitorState>, DbError> {
        // Every stored time sorts after the empty string
        let cutoff = freshness_cutoff(Utc::now(), window)
            .map(fmt_time)
            .unwrap_or_default();

        let conn = self.conn();
        let rows = Self::query_states(&conn, "updated_at >= ?1", &cutoff)?;

        let mut states = Vec::with_capacity(rows.len());
        for (row, _) in rows {
            let entity_id = row.entity_id.clone();
            match row.decode() {
                Ok(state) => states.push(state),
                Err(e) => tracing::warn!("Skipping unreadable state for {}: {}", entity_id, e),
            }
        }

        Ok(states)
    }

    fn save(&self, state: &EntityMonitorState) -> Result<(), DbError> {
        let conn = self.conn_for(&state.entity_id);
        if !upsert_state(&conn, state, Utc::now())? {
            tracing::debug!(entity_id = %state.entity_id, "Kept newer stored revision");
        }
        Ok(())
    }

    fn save_all(&self, states: &[EntityMonitorState]) -> Result<usize, DbError> {
        if states.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let mut written = 0;
        for state in states {
            if upsert_state(&tx, state, now)? {
                written += 1;
            }
        }
        tx.commit()?;

        Ok(written)
    }

    fn delete(&self, entity_id: &str) -> Result<(), DbError> {
        let conn = self.conn_for(entity_id);
        conn.execute("DELETE FROM monitor_state WHERE entity_id = ?1", params![entity_id])?;
        Ok(())
    }
}

impl FleetSource for Store {
    fn list_endpoints(&self) -> Result<Vec<MonitoredEndpoint>, DbError> {
        self.get_endpoints()
    }
}

fn open_connection(path: &Path) -> Result<Connection, DbError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    // journal_mode returns the resulting mode as a row
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    Ok(conn)
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Insert or update one state row. Returns false when the stored row has a
/// newer revision and was left alone.
fn upsert_state(conn: &Connection, state: &EntityMonitorState, updated_at: DateTime<Utc>) -> Result<bool, DbError> {
    let changed = conn.execute(
        "INSERT INTO monitor_state (entity_id, current_state, pending_state, pending_since,
            last_stable_at, instability_started_at, switch_count, last_notified_at,
            last_probe_at, last_probe_ok, revision, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(entity_id) DO UPDATE SET
         current_state=excluded.current_state, pending_state=excluded.pending_state,
         pending_since=excluded.pending_since, last_stable_at=excluded.last_stable_at,
         instability_started_at=excluded.instability_started_at,
         switch_count=excluded.switch_count, last_notified_at=excluded.last_notified_at,
         last_probe_at=excluded.last_probe_at, last_probe_ok=excluded.last_probe_ok,
         revision=excluded.revision, updated_at=excluded.updated_at
         WHERE excluded.revision >= monitor_state.revision",
        params![
            state.entity_id,
            state.current_state.as_str(),
            state.pending_state.map(|s| s.as_str()),
            state.pending_since.map(fmt_time),
            state.last_stable_at.map(fmt_time),
            state.instability_started_at.map(fmt_time),
            state.switch_count,
            state.last_notified_at.map(fmt_time),
            state.last_probe_at.map(fmt_time),
            state.last_probe_ok,
            state.revision as i64,
            fmt_time(updated_at),
        ],
    )?;
    Ok(changed > 0)
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try various formats
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{ConfirmedState, PowerState};
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::with_connections(tmp.path(), 3).unwrap();
        (tmp, store)
    }

    fn pending_state(id: &str) -> EntityMonitorState {
        let now = Utc::now();
        let mut state = EntityMonitorState::new(id);
        state.observe(true, now - ChronoDuration::minutes(2));
        state.observe(false, now - ChronoDuration::minutes(1));
        state
    }

    #[test]
    fn test_endpoint_crud() {
        let (_tmp, store) = open_store();

        let endpoint = MonitoredEndpoint {
            entity_id: "sub-42".to_string(),
            host: "198.51.100.7".to_string(),
            ..Default::default()
        };
        store.upsert_endpoint(&endpoint).unwrap();

        let fetched = store.get_endpoint("sub-42").unwrap();
        assert_eq!(fetched.port, 80);
        assert!(fetched.enabled);

        let mut updated = fetched;
        updated.enabled = false;
        updated.port = 8443;
        store.upsert_endpoint(&updated).unwrap();
        assert_eq!(store.list_endpoints().unwrap(), vec![updated]);

        store.delete_endpoint("sub-42").unwrap();
        assert!(matches!(store.get_endpoint("sub-42"), Err(DbError::NotFound)));
        assert!(matches!(store.delete_endpoint("sub-42"), Err(DbError::NotFound)));
    }

    #[test]
    fn test_state_save_and_load() {
        let (_tmp, store) = open_store();
        let state = pending_state("sub-1");

        store.save(&state).unwrap();
        let loaded = store.load("sub-1").unwrap().expect("state");
        assert_eq!(loaded.state.current_state, ConfirmedState::On);
        assert_eq!(loaded.state.pending_state, Some(PowerState::Off));
        assert_eq!(loaded.state.switch_count, 1);
        assert_eq!(loaded.state.pending_since, state.pending_since);
        assert!(loaded.is_fresh(Utc::now(), Duration::from_secs(3600)));

        assert!(store.load("missing").unwrap().is_none());
    }

    #[test]
    fn test_load_all_skips_stale_records() {
        let (_tmp, store) = open_store();
        let saved = store
            .save_all(&[pending_state("fresh"), pending_state("stale")])
            .unwrap();
        assert_eq!(saved, 2);

        store
            .set_state_updated_at("stale", Utc::now() - ChronoDuration::hours(2))
            .unwrap();

        let restored = store.load_all_fresher_than(Duration::from_secs(3600)).unwrap();
        let ids: Vec<_> = restored.iter().map(|s| s.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["fresh"]);
    }

    #[test]
    fn test_load_all_skips_unreadable_rows() {
        let (_tmp, store) = open_store();
        store.save(&pending_state("good")).unwrap();
        store.save(&pending_state("bad")).unwrap();
        store
            .conn()
            .execute(
                "UPDATE monitor_state SET current_state = 'sideways' WHERE entity_id = 'bad'",
                [],
            )
            .unwrap();

        let restored = store.load_all_fresher_than(Duration::from_secs(3600)).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].entity_id, "good");
    }

    #[test]
    fn test_older_revision_never_replaces_newer_row() {
        let (_tmp, store) = open_store();
        let before = pending_state("sub-1");
        let mut after = before.clone();
        after.confirm_due(Utc::now(), Duration::from_secs(30)).expect("transition");

        store.save(&after).unwrap();
        assert_eq!(store.save_all(&[before.clone()]).unwrap(), 0);
        store.save(&before).unwrap();

        let loaded = store.load("sub-1").unwrap().expect("state");
        assert_eq!(loaded.state.current_state, ConfirmedState::Off);
        assert_eq!(loaded.state.pending_state, None);
        assert_eq!(loaded.state.revision, after.revision);
    }

    #[test]
    fn test_unbounded_window_keeps_everything_on_both_paths() {
        let (_tmp, store) = open_store();
        store.save(&pending_state("old")).unwrap();
        store
            .set_state_updated_at("old", Utc::now() - ChronoDuration::days(365 * 200))
            .unwrap();

        let window = Duration::MAX;
        assert_eq!(freshness_cutoff(Utc::now(), window), None);
        assert_eq!(store.load_all_fresher_than(window).unwrap().len(), 1);
        let loaded = store.load("old").unwrap().expect("state");
        assert!(loaded.is_fresh(Utc::now(), window));
    }

    #[test]
    fn test_prune_drops_states_without_a_live_endpoint() {
        let (_tmp, store) = open_store();
        for (id, host, enabled) in [("live", "10.0.0.1", true), ("off", "10.0.0.2", false), ("blank", "", true)] {
            store
                .upsert_endpoint(&MonitoredEndpoint {
                    entity_id: id.to_string(),
                    host: host.to_string(),
                    enabled,
                    ..Default::default()
                })
                .unwrap();
        }
        for id in ["live", "off", "blank", "deleted"] {
            store.save(&pending_state(id)).unwrap();
        }

        assert_eq!(store.prune_orphaned_states().unwrap(), 3);
        let ids: Vec<_> = store
            .load_all_fresher_than(Duration::from_secs(3600))
            .unwrap()
            .into_iter()
            .map(|s| s.entity_id)
            .collect();
        assert_eq!(ids, vec!["live".to_string()]);
    }

    #[test]
    fn test_settings_round_trip() {
        let (_tmp, store) = open_store();
        assert!(store.load_settings().unwrap().is_none());

        let settings = MonitorSettings {
            debounce_minutes: 0,
            interval_override_secs: 15,
            cooldown_secs: 120,
        };
        store.save_settings(&settings).unwrap();
        assert_eq!(store.load_settings().unwrap(), Some(settings));
    }
}
