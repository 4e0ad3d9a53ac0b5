//! Per-station responses to a data request.

use crate::core::protocol::api::StationResult;
use crate::core::protocol::ResponseStatus;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// A station's response as reported on the wire.
pub struct ResponseUpsert<'a> {
    pub request_id: &'a str,
    pub station_id: &'a str,
    pub status: ResponseStatus,
    pub file_path: Option<&'a str>,
    pub download_url: Option<&'a str>,
    pub file_size: Option<u64>,
    pub error: Option<&'a str>,
    pub updated_at: i64,
}

fn parse_result_row(row: &Row<'_>) -> rusqlite::Result<StationResult> {
    let status: String = row.get(1)?;
    Ok(StationResult {
        station_id: row.get(0)?,
        status: ResponseStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown response status '{status}'").into(),
            )
        })?,
        file_path: row.get(2)?,
        file_size: row.get::<_, Option<i64>>(3)?.map(|v| v.max(0) as u64),
        download_url: row.get(4)?,
        error: row.get(5)?,
        session_id: row.get(6)?,
    })
}

/// Insert or overwrite the (request, station) row.
///
/// Returns the status that was stored before this call, if any, so callers
/// can tell a fresh transition from a re-delivery.
pub fn upsert_response(
    conn: &Connection,
    resp: &ResponseUpsert<'_>,
) -> rusqlite::Result<Option<ResponseStatus>> {
    let previous: Option<String> = conn
        .query_row(
            "SELECT status FROM collector_responses WHERE request_id = ?1 AND station_id = ?2",
            params![resp.request_id, resp.station_id],
            |row| row.get(0),
        )
        .optional()?;

    conn.execute(
        "INSERT INTO collector_responses
            (request_id, station_id, status, file_path, download_url, file_size, error, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(request_id, station_id) DO UPDATE SET
             status = excluded.status,
             file_path = excluded.file_path,
             download_url = excluded.download_url,
             file_size = excluded.file_size,
             error = excluded.error,
             updated_at = excluded.updated_at",
        params![
            resp.request_id,
            resp.station_id,
            resp.status.as_str(),
            resp.file_path,
            resp.download_url,
            resp.file_size.map(|v| v as i64),
            resp.error,
            resp.updated_at,
        ],
    )?;

    Ok(previous.as_deref().and_then(ResponseStatus::parse))
}

pub fn set_session(
    conn: &Connection,
    request_id: &str,
    station_id: &str,
    session_id: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE collector_responses SET session_id = ?3
         WHERE request_id = ?1 AND station_id = ?2",
        params![request_id, station_id, session_id],
    )?;
    Ok(())
}

/// All station results for a request, in station-id order.
pub fn list_results(conn: &Connection, request_id: &str) -> rusqlite::Result<Vec<StationResult>> {
    let mut stmt = conn.prepare(
        "SELECT station_id, status, file_path, file_size, download_url, error, session_id
         FROM collector_responses WHERE request_id = ?1
         ORDER BY station_id",
    )?;
    let rows = stmt.query_map([request_id], parse_result_row)?;
    rows.collect()
}

pub fn get_result(
    conn: &Connection,
    request_id: &str,
    station_id: &str,
) -> rusqlite::Result<Option<StationResult>> {
    conn.query_row(
        "SELECT station_id, status, file_path, file_size, download_url, error, session_id
         FROM collector_responses WHERE request_id = ?1 AND station_id = ?2",
        params![request_id, station_id],
        parse_result_row,
    )
    .optional()
}

pub fn count_by_status(
    conn: &Connection,
    request_id: &str,
    status: ResponseStatus,
) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM collector_responses WHERE request_id = ?1 AND status = ?2",
        params![request_id, status.as_str()],
        |row| row.get(0),
    )
}
