//! Table definitions.

use rusqlite::Connection;

/// Creates all required tables and indexes.
pub fn create_all_tables(conn: &Connection) -> rusqlite::Result<()> {
    create_station_table(conn)?;
    create_request_table(conn)?;
    create_response_table(conn)?;
    create_session_tables(conn)?;
    Ok(())
}

/// Stations: connection status plus last heartbeat for the freshness filter.
pub fn create_station_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS stations (
            station_id TEXT PRIMARY KEY NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('connected', 'disconnected')),
            last_heartbeat INTEGER,
            last_connected INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Data requests. The `mirror_*` columns hold the first ready station's
/// descriptor for consumers that only understand a single result.
pub fn create_request_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS data_requests (
            request_id TEXT PRIMARY KEY NOT NULL,
            request_type TEXT NOT NULL,
            parameters TEXT NOT NULL,
            requester_id TEXT NOT NULL,
            transfer_mode TEXT NOT NULL CHECK (transfer_mode IN ('proxy', 'direct')),
            status TEXT NOT NULL CHECK (status IN
                ('pending', 'assigned', 'ice_session_created', 'ready', 'error')),
            fanout_count INTEGER NOT NULL DEFAULT 0,
            assigned_station TEXT,
            mirror_station TEXT,
            mirror_file_path TEXT,
            mirror_download_url TEXT,
            mirror_file_size INTEGER,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Per-station responses, unique on (request, station) so re-delivery upserts.
pub fn create_response_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS collector_responses (
            request_id TEXT NOT NULL REFERENCES data_requests(request_id) ON DELETE CASCADE,
            station_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('processing', 'ready', 'error')),
            file_path TEXT,
            download_url TEXT,
            file_size INTEGER,
            error TEXT,
            session_id TEXT,
            updated_at INTEGER NOT NULL,
            UNIQUE (request_id, station_id)
        )",
        [],
    )?;
    Ok(())
}

/// ICE sessions and their append-only candidate log.
pub fn create_session_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ice_sessions (
            session_id TEXT PRIMARY KEY NOT NULL,
            request_id TEXT,
            initiator_id TEXT NOT NULL,
            initiator_role TEXT NOT NULL,
            target_id TEXT,
            target_role TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN
                ('pending', 'offer_received', 'answer_received', 'accepted')),
            offer_sdp TEXT,
            answer_sdp TEXT,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ice_candidates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES ice_sessions(session_id) ON DELETE CASCADE,
            contributor TEXT NOT NULL,
            candidate TEXT NOT NULL,
            sdp_mline_index INTEGER,
            sdp_mid TEXT,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ice_candidates_session
            ON ice_candidates (session_id)",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_all_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();
        create_all_tables(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('stations', 'data_requests', 'collector_responses',
                              'ice_sessions', 'ice_candidates')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }
}
