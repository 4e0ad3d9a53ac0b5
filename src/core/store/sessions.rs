//! ICE sessions and the append-only candidate log.

use crate::core::protocol::api::CandidateView;
use crate::core::protocol::{IceCandidatePayload, PeerKey, PeerRole};
use crate::core::signaling::session::{IceSession, SessionStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};

fn conversion_error(col: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, msg.into())
}

fn parse_role(col: usize, s: &str) -> rusqlite::Result<PeerRole> {
    s.parse().map_err(|e: anyhow::Error| conversion_error(col, e.to_string()))
}

fn parse_session_row(row: &Row<'_>) -> rusqlite::Result<IceSession> {
    let initiator_role: String = row.get(3)?;
    let target_role: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(IceSession {
        session_id: row.get(0)?,
        request_id: row.get(1)?,
        initiator: PeerKey {
            id: row.get(2)?,
            role: parse_role(3, &initiator_role)?,
        },
        target_id: row.get(4)?,
        target_role: parse_role(5, &target_role)?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| conversion_error(6, format!("unknown session status '{status}'")))?,
        offer_sdp: row.get(7)?,
        answer_sdp: row.get(8)?,
        created_at: row.get(9)?,
    })
}

pub fn insert_session(conn: &Connection, session: &IceSession) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO ice_sessions
            (session_id, request_id, initiator_id, initiator_role, target_id, target_role,
             status, offer_sdp, answer_sdp, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            session.session_id,
            session.request_id,
            session.initiator.id,
            session.initiator.role.as_str(),
            session.target_id,
            session.target_role.as_str(),
            session.status.as_str(),
            session.offer_sdp,
            session.answer_sdp,
            session.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_session(conn: &Connection, session_id: &str) -> rusqlite::Result<Option<IceSession>> {
    conn.query_row(
        "SELECT session_id, request_id, initiator_id, initiator_role, target_id, target_role,
                status, offer_sdp, answer_sdp, created_at
         FROM ice_sessions WHERE session_id = ?1",
        [session_id],
        parse_session_row,
    )
    .optional()
}

/// Write back the mutable parts of a session (binding, status, SDPs).
pub fn update_session(conn: &Connection, session: &IceSession) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE ice_sessions
         SET target_id = ?2, status = ?3, offer_sdp = ?4, answer_sdp = ?5
         WHERE session_id = ?1",
        params![
            session.session_id,
            session.target_id,
            session.status.as_str(),
            session.offer_sdp,
            session.answer_sdp,
        ],
    )?;
    Ok(())
}

pub fn append_candidate(
    conn: &Connection,
    session_id: &str,
    contributor: &PeerKey,
    candidate: &IceCandidatePayload,
    now: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO ice_candidates
            (session_id, contributor, candidate, sdp_mline_index, sdp_mid, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            session_id,
            contributor.to_string(),
            candidate.candidate,
            candidate.sdp_mline_index,
            candidate.sdp_mid,
            now,
        ],
    )?;
    Ok(())
}

/// Candidates for a session in arrival order, minus those `caller` contributed.
pub fn candidates_excluding(
    conn: &Connection,
    session_id: &str,
    caller: &PeerKey,
) -> rusqlite::Result<Vec<CandidateView>> {
    let mut stmt = conn.prepare(
        "SELECT contributor, candidate, sdp_mid, sdp_mline_index FROM ice_candidates
         WHERE session_id = ?1 AND contributor != ?2
         ORDER BY id",
    )?;
    let rows = stmt.query_map(params![session_id, caller.to_string()], |row| {
        Ok(CandidateView {
            contributor: row.get(0)?,
            ice_candidate: IceCandidatePayload {
                candidate: row.get(1)?,
                sdp_mid: row.get(2)?,
                sdp_mline_index: row.get(3)?,
            },
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::schema::create_all_tables;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        create_all_tables(&conn).unwrap();
        conn
    }

    fn candidate(addr: &str) -> IceCandidatePayload {
        IceCandidatePayload {
            candidate: format!("candidate:1 1 udp 2122260223 {addr} 50000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn session_round_trips_through_update() {
        let conn = setup_db();
        let mut s = IceSession::new("s1", None, PeerKey::receiver("rx"), PeerRole::Station, 5);
        insert_session(&conn, &s).unwrap();

        s.bind_target(&PeerKey::station("A"));
        s.record_offer("v=0");
        update_session(&conn, &s).unwrap();

        let loaded = get_session(&conn, "s1").unwrap().unwrap();
        assert_eq!(loaded, s);
        assert!(get_session(&conn, "s2").unwrap().is_none());
    }

    #[test]
    fn own_candidates_are_filtered_out() {
        let conn = setup_db();
        let rx = PeerKey::receiver("rx");
        let st = PeerKey::station("A");
        let s = IceSession::new("s1", None, rx.clone(), PeerRole::Station, 0);
        insert_session(&conn, &s).unwrap();

        append_candidate(&conn, "s1", &rx, &candidate("10.0.0.1"), 1).unwrap();
        append_candidate(&conn, "s1", &st, &candidate("10.0.0.2"), 2).unwrap();
        append_candidate(&conn, "s1", &st, &candidate("10.0.0.3"), 3).unwrap();

        let for_rx = candidates_excluding(&conn, "s1", &rx).unwrap();
        assert_eq!(for_rx.len(), 2);
        assert!(for_rx.iter().all(|c| c.contributor == "station:A"));
        assert!(for_rx[0].ice_candidate.candidate.contains("10.0.0.2"));

        let for_st = candidates_excluding(&conn, "s1", &st).unwrap();
        assert_eq!(for_st.len(), 1);
        assert_eq!(for_st[0].contributor, "receiver:rx");
    }
}
