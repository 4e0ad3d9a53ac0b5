//! Persistence layer (SQLite).
//!
//! Holds the state that outlives a single connection:
//! - `stations` - connection status and heartbeat freshness
//! - `requests` - data requests and the legacy single-result mirror
//! - `responses` - one row per (request, station)
//! - `sessions` - ICE sessions and their append-only candidate log
//!
//! Each table module exposes free functions over a borrowed
//! [`rusqlite::Connection`]. Callers lock the shared [`Db`] handle once per
//! logical operation so multi-statement updates stay atomic.

pub mod requests;
pub mod responses;
pub mod schema;
pub mod sessions;
pub mod stations;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared database handle.
pub type Db = Arc<Mutex<Connection>>;

/// Open (or create) the database file and make sure every table exists.
pub fn open(path: &Path) -> Result<Db> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("opening database {}", path.display()))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::create_all_tables(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database, used by tests and `--ephemeral` servers.
pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::create_all_tables(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Lock the connection. A poisoned lock only means another task panicked
/// mid-operation; SQLite itself is still consistent, so keep going.
pub fn lock(db: &Db) -> MutexGuard<'_, Connection> {
    db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Current Unix timestamp in seconds (0 if the clock is before the epoch).
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
