//! Station status and heartbeat freshness.

use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationRecord {
    pub station_id: String,
    pub connected: bool,
    pub last_heartbeat: Option<i64>,
    pub last_connected: i64,
}

fn parse_station_row(row: &Row<'_>) -> rusqlite::Result<StationRecord> {
    let status: String = row.get(1)?;
    Ok(StationRecord {
        station_id: row.get(0)?,
        connected: status == "connected",
        last_heartbeat: row.get(2)?,
        last_connected: row.get(3)?,
    })
}

/// Record a successful auth handshake. Counts as a heartbeat so a freshly
/// connected station is immediately eligible for fan-out.
pub fn mark_connected(conn: &Connection, station_id: &str, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO stations (station_id, status, last_heartbeat, last_connected)
         VALUES (?1, 'connected', ?2, ?2)
         ON CONFLICT(station_id) DO UPDATE SET
             status = 'connected',
             last_heartbeat = excluded.last_heartbeat,
             last_connected = excluded.last_connected",
        params![station_id, now],
    )?;
    Ok(())
}

/// A heartbeat only arrives over a live socket, so it also restores
/// `connected` if a stale teardown flipped the status.
pub fn record_heartbeat(conn: &Connection, station_id: &str, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE stations SET status = 'connected', last_heartbeat = MAX(COALESCE(last_heartbeat, 0), ?2)
         WHERE station_id = ?1",
        params![station_id, now],
    )?;
    Ok(())
}

/// Flip a station to disconnected. Unknown ids are a no-op.
pub fn mark_disconnected(conn: &Connection, station_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE stations SET status = 'disconnected' WHERE station_id = ?1",
        [station_id],
    )?;
    Ok(())
}

/// Called at startup: no socket survives a restart.
pub fn mark_all_disconnected(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE stations SET status = 'disconnected' WHERE status = 'connected'",
        [],
    )
}

/// Connected stations whose last heartbeat is at or after `since`.
pub fn fresh_stations(conn: &Connection, since: i64) -> rusqlite::Result<Vec<StationRecord>> {
    let mut stmt = conn.prepare(
        "SELECT station_id, status, last_heartbeat, last_connected FROM stations
         WHERE status = 'connected' AND last_heartbeat >= ?1
         ORDER BY station_id",
    )?;
    let rows = stmt.query_map([since], parse_station_row)?;
    rows.collect()
}

pub fn get_station(conn: &Connection, station_id: &str) -> rusqlite::Result<Option<StationRecord>> {
    conn.query_row(
        "SELECT station_id, status, last_heartbeat, last_connected FROM stations
         WHERE station_id = ?1",
        [station_id],
        parse_station_row,
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::schema::create_all_tables;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();
        conn
    }

    #[test]
    fn freshness_filter_excludes_stale_and_disconnected() {
        let conn = setup_db();
        mark_connected(&conn, "fresh", 1_000).unwrap();
        mark_connected(&conn, "stale", 700).unwrap();
        mark_connected(&conn, "gone", 1_000).unwrap();
        mark_disconnected(&conn, "gone").unwrap();

        let fresh = fresh_stations(&conn, 1_000 - 120).unwrap();
        let ids: Vec<_> = fresh.iter().map(|s| s.station_id.as_str()).collect();
        assert_eq!(ids, vec!["fresh"]);
    }

    #[test]
    fn heartbeat_never_moves_backwards() {
        let conn = setup_db();
        mark_connected(&conn, "st", 500).unwrap();
        record_heartbeat(&conn, "st", 900).unwrap();
        record_heartbeat(&conn, "st", 800).unwrap();

        let st = get_station(&conn, "st").unwrap().unwrap();
        assert_eq!(st.last_heartbeat, Some(900));
        assert!(st.connected);
    }

    #[test]
    fn heartbeat_restores_a_stale_disconnect() {
        let conn = setup_db();
        mark_connected(&conn, "st", 1_000).unwrap();
        mark_disconnected(&conn, "st").unwrap();
        assert!(fresh_stations(&conn, 900).unwrap().is_empty());

        record_heartbeat(&conn, "st", 1_030).unwrap();
        let fresh = fresh_stations(&conn, 900).unwrap();
        assert_eq!(fresh.len(), 1);
        assert!(fresh[0].connected);
    }

    #[test]
    fn restart_resets_connected_flags() {
        let conn = setup_db();
        mark_connected(&conn, "a", 10).unwrap();
        mark_connected(&conn, "b", 10).unwrap();
        assert_eq!(mark_all_disconnected(&conn).unwrap(), 2);
        assert!(fresh_stations(&conn, 0).unwrap().is_empty());
    }

    #[test]
    fn disconnect_of_unknown_station_is_noop() {
        let conn = setup_db();
        mark_disconnected(&conn, "nobody").unwrap();
        assert!(get_station(&conn, "nobody").unwrap().is_none());
    }
}
