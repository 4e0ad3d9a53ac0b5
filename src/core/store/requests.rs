//! Data requests and the single-result mirror.

use crate::core::protocol::TransferMode;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

/// Lifecycle of a data request as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Assigned,
    IceSessionCreated,
    Ready,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Assigned => "assigned",
            RequestStatus::IceSessionCreated => "ice_session_created",
            RequestStatus::Ready => "ready",
            RequestStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "assigned" => Some(RequestStatus::Assigned),
            "ice_session_created" => Some(RequestStatus::IceSessionCreated),
            "ready" => Some(RequestStatus::Ready),
            "error" => Some(RequestStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub request_id: String,
    pub request_type: String,
    pub parameters: Value,
    pub requester_id: String,
    pub transfer_mode: TransferMode,
    pub status: RequestStatus,
    pub fanout_count: u32,
    pub assigned_station: Option<String>,
    pub mirror_station: Option<String>,
    pub mirror_file_path: Option<String>,
    pub mirror_download_url: Option<String>,
    pub mirror_file_size: Option<u64>,
    pub created_at: i64,
}

/// Fields needed to create a request row.
pub struct NewRequest<'a> {
    pub request_id: &'a str,
    pub request_type: &'a str,
    pub parameters: &'a Value,
    pub requester_id: &'a str,
    pub transfer_mode: TransferMode,
    pub created_at: i64,
}

/// Descriptor copied into the mirror columns.
pub struct MirrorUpdate<'a> {
    pub station_id: &'a str,
    pub file_path: Option<&'a str>,
    pub download_url: Option<&'a str>,
    pub file_size: Option<u64>,
    pub status: RequestStatus,
}

fn conversion_error(col: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn parse_request_row(row: &Row<'_>) -> rusqlite::Result<RequestRecord> {
    let parameters: String = row.get(2)?;
    let mode: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(RequestRecord {
        request_id: row.get(0)?,
        request_type: row.get(1)?,
        parameters: serde_json::from_str(&parameters)
            .map_err(|e| conversion_error(2, e.to_string()))?,
        requester_id: row.get(3)?,
        transfer_mode: TransferMode::parse(&mode)
            .ok_or_else(|| conversion_error(4, format!("unknown transfer mode '{mode}'")))?,
        status: RequestStatus::parse(&status)
            .ok_or_else(|| conversion_error(5, format!("unknown request status '{status}'")))?,
        fanout_count: row.get(6)?,
        assigned_station: row.get(7)?,
        mirror_station: row.get(8)?,
        mirror_file_path: row.get(9)?,
        mirror_download_url: row.get(10)?,
        mirror_file_size: row.get::<_, Option<i64>>(11)?.map(|v| v.max(0) as u64),
        created_at: row.get(12)?,
    })
}

const REQUEST_COLUMNS: &str = "request_id, request_type, parameters, requester_id, transfer_mode,
     status, fanout_count, assigned_station, mirror_station, mirror_file_path,
     mirror_download_url, mirror_file_size, created_at";

pub fn insert_request(conn: &Connection, req: &NewRequest<'_>) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO data_requests
            (request_id, request_type, parameters, requester_id, transfer_mode, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
        params![
            req.request_id,
            req.request_type,
            req.parameters.to_string(),
            req.requester_id,
            req.transfer_mode.as_str(),
            req.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_request(conn: &Connection, request_id: &str) -> rusqlite::Result<Option<RequestRecord>> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLUMNS} FROM data_requests WHERE request_id = ?1"),
        [request_id],
        parse_request_row,
    )
    .optional()
}

/// Record the stations selected for fan-out, before any of them is contacted.
pub fn mark_assigned(
    conn: &Connection,
    request_id: &str,
    assigned_station: &str,
    fanout_count: u32,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE data_requests
         SET status = 'assigned', assigned_station = ?2, fanout_count = ?3
         WHERE request_id = ?1 AND status = 'pending'",
        params![request_id, assigned_station, fanout_count],
    )?;
    Ok(())
}

/// Correct the fan-out once delivery is known. `assigned_station` is the
/// first station that accepted delivery. `status` is left alone because
/// station replies may already have advanced it.
pub fn set_fanout(
    conn: &Connection,
    request_id: &str,
    assigned_station: &str,
    fanout_count: u32,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE data_requests SET assigned_station = ?2, fanout_count = ?3 WHERE request_id = ?1",
        params![request_id, assigned_station, fanout_count],
    )?;
    Ok(())
}

pub fn set_status(conn: &Connection, request_id: &str, status: RequestStatus) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE data_requests SET status = ?2 WHERE request_id = ?1",
        params![request_id, status.as_str()],
    )?;
    Ok(())
}

/// Fill the mirror columns if no station has claimed them yet.
///
/// Returns `true` if this call won the mirror.
pub fn mirror_first_ready(
    conn: &Connection,
    request_id: &str,
    update: &MirrorUpdate<'_>,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE data_requests
         SET mirror_station = ?2, mirror_file_path = ?3, mirror_download_url = ?4,
             mirror_file_size = ?5, status = ?6
         WHERE request_id = ?1 AND mirror_station IS NULL",
        params![
            request_id,
            update.station_id,
            update.file_path,
            update.download_url,
            update.file_size.map(|v| v as i64),
            update.status.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

/// Move a request to `error` unless some station already produced a result.
pub fn mark_error_if_unresolved(conn: &Connection, request_id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE data_requests SET status = 'error'
         WHERE request_id = ?1 AND mirror_station IS NULL AND status != 'error'",
        [request_id],
    )?;
    Ok(changed == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::schema::create_all_tables;
    use serde_json::json;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();
        conn
    }

    fn insert(conn: &Connection, id: &str, mode: TransferMode) {
        let params = json!({"interface": "eth0", "duration": 30});
        insert_request(
            conn,
            &NewRequest {
                request_id: id,
                request_type: "pcap",
                parameters: &params,
                requester_id: "rx-1",
                transfer_mode: mode,
                created_at: 1_000,
            },
        )
        .unwrap();
    }

    fn mirror<'a>(station: &'a str, path: &'a str) -> MirrorUpdate<'a> {
        MirrorUpdate {
            station_id: station,
            file_path: Some(path),
            download_url: None,
            file_size: Some(64),
            status: RequestStatus::Ready,
        }
    }

    #[test]
    fn insert_and_read_back() {
        let conn = setup_db();
        insert(&conn, "r1", TransferMode::Direct);

        let req = get_request(&conn, "r1").unwrap().unwrap();
        assert_eq!(req.status, RequestStatus::Pending);
        assert_eq!(req.transfer_mode, TransferMode::Direct);
        assert_eq!(req.parameters["interface"], "eth0");
        assert_eq!(req.fanout_count, 0);
        assert!(get_request(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn mirror_keeps_first_ready_station() {
        let conn = setup_db();
        insert(&conn, "r1", TransferMode::Proxy);
        mark_assigned(&conn, "r1", "A", 3).unwrap();

        assert!(mirror_first_ready(&conn, "r1", &mirror("B", "/b.pcap")).unwrap());
        assert!(!mirror_first_ready(&conn, "r1", &mirror("A", "/a.pcap")).unwrap());
        assert!(!mirror_first_ready(&conn, "r1", &mirror("C", "/c.pcap")).unwrap());

        let req = get_request(&conn, "r1").unwrap().unwrap();
        assert_eq!(req.mirror_station.as_deref(), Some("B"));
        assert_eq!(req.mirror_file_path.as_deref(), Some("/b.pcap"));
        assert_eq!(req.assigned_station.as_deref(), Some("A"));
        assert_eq!(req.fanout_count, 3);
        assert_eq!(req.status, RequestStatus::Ready);
    }

    #[test]
    fn error_does_not_override_a_resolved_request() {
        let conn = setup_db();
        insert(&conn, "r1", TransferMode::Proxy);
        insert(&conn, "r2", TransferMode::Proxy);
        mirror_first_ready(&conn, "r1", &mirror("A", "/a.pcap")).unwrap();

        assert!(!mark_error_if_unresolved(&conn, "r1").unwrap());
        assert!(mark_error_if_unresolved(&conn, "r2").unwrap());
        assert!(!mark_error_if_unresolved(&conn, "r2").unwrap());

        assert_eq!(
            get_request(&conn, "r1").unwrap().unwrap().status,
            RequestStatus::Ready
        );
        assert_eq!(
            get_request(&conn, "r2").unwrap().unwrap().status,
            RequestStatus::Error
        );
    }

    #[test]
    fn fanout_correction_keeps_an_advanced_status() {
        let conn = setup_db();
        insert(&conn, "r1", TransferMode::Proxy);
        mark_assigned(&conn, "r1", "A", 3).unwrap();
        mirror_first_ready(&conn, "r1", &mirror("B", "/b.pcap")).unwrap();

        set_fanout(&conn, "r1", "B", 2).unwrap();

        let req = get_request(&conn, "r1").unwrap().unwrap();
        assert_eq!(req.fanout_count, 2);
        assert_eq!(req.assigned_station.as_deref(), Some("B"));
        assert_eq!(req.status, RequestStatus::Ready);
    }
}
