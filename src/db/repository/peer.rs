//! Repository functions for the `peers` table.

use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::DatabaseError;
use crate::models::{Peer, PeerStatus};

const PEER_COLUMNS: &str = "id, name, ip, key, public_key, status, device_type, updated_at";

/// Raw row; `status` is parsed after the query so enum errors surface as
/// `DatabaseError::InvalidEnum` rather than a generic SQLite error.
struct PeerRow {
    id: String,
    name: String,
    ip: String,
    key: Option<Vec<u8>>,
    public_key: Option<Vec<u8>>,
    status: String,
    device_type: String,
    updated_at: chrono::DateTime<chrono::Utc>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<PeerRow> {
    Ok(PeerRow {
        id: row.get(0)?,
        name: row.get(1)?,
        ip: row.get(2)?,
        key: row.get(3)?,
        public_key: row.get(4)?,
        status: row.get(5)?,
        device_type: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn peer_from_row(row: PeerRow) -> Result<Peer, DatabaseError> {
    Ok(Peer {
        id: row.id,
        name: row.name,
        ip: row.ip,
        key: row.key,
        public_key: row.public_key,
        status: PeerStatus::from_str(&row.status)?,
        device_type: row.device_type,
        updated_at: row.updated_at,
    })
}

fn query_peers(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Peer>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(peer_from_row).collect()
}

pub fn get_all_peers(conn: &Connection) -> Result<Vec<Peer>, DatabaseError> {
    query_peers(
        conn,
        &format!("SELECT {PEER_COLUMNS} FROM peers ORDER BY name"),
        [],
    )
}

/// Peers whose status is `paired`.
pub fn get_paired_peers(conn: &Connection) -> Result<Vec<Peer>, DatabaseError> {
    query_peers(
        conn,
        &format!("SELECT {PEER_COLUMNS} FROM peers WHERE status = ?1"),
        params![PeerStatus::Paired.as_str()],
    )
}

pub fn get_peer(conn: &Connection, id: &str) -> Result<Option<Peer>, DatabaseError> {
    let mut stmt = conn.prepare(&format!("SELECT {PEER_COLUMNS} FROM peers WHERE id = ?1"))?;
    let row = stmt.query_row(params![id], read_row).optional()?;
    row.map(peer_from_row).transpose()
}

pub fn insert_peer(conn: &Connection, peer: &Peer) -> Result<(), DatabaseError> {
    check_key_invariant(peer)?;
    conn.execute(
        &format!("INSERT INTO peers ({PEER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            peer.id,
            peer.name,
            peer.ip,
            peer.key,
            peer.public_key,
            peer.status.as_str(),
            peer.device_type,
            peer.updated_at,
        ],
    )?;
    Ok(())
}

pub fn update_peer(conn: &Connection, peer: &Peer) -> Result<(), DatabaseError> {
    check_key_invariant(peer)?;
    let updated = conn.execute(
        "UPDATE peers SET name = ?2, ip = ?3, key = ?4, public_key = ?5, status = ?6,
         device_type = ?7, updated_at = ?8 WHERE id = ?1",
        params![
            peer.id,
            peer.name,
            peer.ip,
            peer.key,
            peer.public_key,
            peer.status.as_str(),
            peer.device_type,
            peer.updated_at,
        ],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "peer".into(),
            id: peer.id.clone(),
        });
    }
    Ok(())
}

pub fn delete_peer(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let deleted = conn.execute("DELETE FROM peers WHERE id = ?1", params![id])?;
    Ok(deleted > 0)
}

/// Key material may only be stored for paired peers.
fn check_key_invariant(peer: &Peer) -> Result<(), DatabaseError> {
    if peer.status == PeerStatus::Unpaired && (peer.key.is_some() || peer.public_key.is_some()) {
        return Err(DatabaseError::ConstraintViolation(format!(
            "unpaired peer {} must not carry key material",
            peer.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn paired(id: &str) -> Peer {
        Peer {
            id: id.into(),
            name: format!("Peer {id}"),
            ip: "192.168.1.30".into(),
            key: Some(vec![1u8; 32]),
            public_key: Some(vec![2u8; 32]),
            status: PeerStatus::Paired,
            device_type: "phone".into(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn paired_peers_exclude_unpaired_rows() {
        let conn = open_memory_database().unwrap();
        insert_peer(&conn, &paired("a")).unwrap();
        let mut b = paired("b");
        b.status = PeerStatus::Unpaired;
        b.key = None;
        b.public_key = None;
        insert_peer(&conn, &b).unwrap();

        let all = get_all_peers(&conn).unwrap();
        assert_eq!(all.len(), 2);
        let paired_only = get_paired_peers(&conn).unwrap();
        assert_eq!(paired_only.len(), 1);
        assert_eq!(paired_only[0].id, "a");
    }

    #[test]
    fn unpaired_peer_with_key_is_rejected() {
        let conn = open_memory_database().unwrap();
        let mut peer = paired("a");
        peer.status = PeerStatus::Unpaired;
        assert!(matches!(
            insert_peer(&conn, &peer),
            Err(DatabaseError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn update_flips_status_and_keeps_row() {
        let conn = open_memory_database().unwrap();
        let mut peer = paired("a");
        insert_peer(&conn, &peer).unwrap();

        peer.status = PeerStatus::Unpaired;
        peer.key = None;
        peer.public_key = None;
        update_peer(&conn, &peer).unwrap();

        let loaded = get_peer(&conn, "a").unwrap().unwrap();
        assert_eq!(loaded.status, PeerStatus::Unpaired);
        assert!(loaded.key.is_none());
        assert_eq!(loaded.name, "Peer a");
    }

    #[test]
    fn unknown_status_in_table_surfaces_as_invalid_enum() {
        let conn = open_memory_database().unwrap();
        insert_peer(&conn, &paired("a")).unwrap();
        conn.execute_batch("PRAGMA ignore_check_constraints = ON; UPDATE peers SET status = 'lost';")
            .unwrap();
        assert!(matches!(
            get_peer(&conn, "a"),
            Err(DatabaseError::InvalidEnum { .. })
        ));
    }

    #[test]
    fn delete_peer_removes_row() {
        let conn = open_memory_database().unwrap();
        insert_peer(&conn, &paired("a")).unwrap();
        assert!(delete_peer(&conn, "a").unwrap());
        assert!(get_peer(&conn, "a").unwrap().is_none());
    }
}
