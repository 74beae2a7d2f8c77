//! Repository functions for the `sessions` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::DatabaseError;
use crate::models::Session;

const SESSION_COLUMNS: &str = "client_id, token, client_ip, os_name, os_version, browser_name,
     browser_version, created_at, updated_at, last_seen_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        client_id: row.get(0)?,
        token: row.get(1)?,
        client_ip: row.get(2)?,
        os_name: row.get(3)?,
        os_version: row.get(4)?,
        browser_name: row.get(5)?,
        browser_version: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        last_seen_at: row.get(9)?,
    })
}

/// All persisted sessions, oldest first.
pub fn get_all_sessions(conn: &Connection) -> Result<Vec<Session>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at"
    ))?;
    let rows = stmt
        .query_map([], session_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_session(conn: &Connection, client_id: &str) -> Result<Option<Session>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE client_id = ?1"
    ))?;
    let row = stmt
        .query_row(params![client_id], session_from_row)
        .optional()?;
    Ok(row)
}

pub fn insert_session(conn: &Connection, session: &Session) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO sessions ({SESSION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ),
        params![
            session.client_id,
            session.token,
            session.client_ip,
            session.os_name,
            session.os_version,
            session.browser_name,
            session.browser_version,
            session.created_at,
            session.updated_at,
            session.last_seen_at,
        ],
    )?;
    Ok(())
}

/// Overwrite every mutable column of an existing session.
pub fn update_session(conn: &Connection, session: &Session) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE sessions SET token = ?2, client_ip = ?3, os_name = ?4, os_version = ?5,
         browser_name = ?6, browser_version = ?7, updated_at = ?8, last_seen_at = ?9
         WHERE client_id = ?1",
        params![
            session.client_id,
            session.token,
            session.client_ip,
            session.os_name,
            session.os_version,
            session.browser_name,
            session.browser_version,
            session.updated_at,
            session.last_seen_at,
        ],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "session".into(),
            id: session.client_id.clone(),
        });
    }
    Ok(())
}

/// Delete a session. Returns `false` when no row matched.
pub fn delete_session(conn: &Connection, client_id: &str) -> Result<bool, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM sessions WHERE client_id = ?1",
        params![client_id],
    )?;
    Ok(deleted > 0)
}

/// Write a "last seen" timestamp without touching the rest of the row.
pub fn update_last_seen(
    conn: &Connection,
    client_id: &str,
    seen_at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let updated = conn.execute(
        "UPDATE sessions SET last_seen_at = ?2 WHERE client_id = ?1",
        params![client_id, seen_at],
    )?;
    Ok(updated > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn sample(client_id: &str) -> Session {
        let mut session = Session::new(client_id);
        session.token = vec![7u8; 32];
        session.client_ip = "192.168.1.20".into();
        session.os_name = "macOS".into();
        session.browser_name = "Firefox".into();
        session
    }

    #[test]
    fn insert_and_get_session() {
        let conn = open_memory_database().unwrap();
        let session = sample("c1");
        insert_session(&conn, &session).unwrap();

        let loaded = get_session(&conn, "c1").unwrap().unwrap();
        assert_eq!(loaded.client_id, "c1");
        assert_eq!(loaded.token, vec![7u8; 32]);
        assert_eq!(loaded.os_name, "macOS");
        assert!(loaded.last_seen_at.is_none());
    }

    #[test]
    fn get_missing_session_returns_none() {
        let conn = open_memory_database().unwrap();
        assert!(get_session(&conn, "ghost").unwrap().is_none());
    }

    #[test]
    fn duplicate_client_id_is_rejected() {
        let conn = open_memory_database().unwrap();
        insert_session(&conn, &sample("c1")).unwrap();
        assert!(insert_session(&conn, &sample("c1")).is_err());
    }

    #[test]
    fn update_session_overwrites_fields() {
        let conn = open_memory_database().unwrap();
        let mut session = sample("c1");
        insert_session(&conn, &session).unwrap();

        session.client_ip = "10.0.0.9".into();
        session.token = vec![9u8; 32];
        update_session(&conn, &session).unwrap();

        let loaded = get_session(&conn, "c1").unwrap().unwrap();
        assert_eq!(loaded.client_ip, "10.0.0.9");
        assert_eq!(loaded.token, vec![9u8; 32]);
    }

    #[test]
    fn update_missing_session_is_not_found() {
        let conn = open_memory_database().unwrap();
        let result = update_session(&conn, &sample("nobody"));
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn delete_session_reports_whether_row_existed() {
        let conn = open_memory_database().unwrap();
        insert_session(&conn, &sample("c1")).unwrap();
        assert!(delete_session(&conn, "c1").unwrap());
        assert!(!delete_session(&conn, "c1").unwrap());
        assert!(get_all_sessions(&conn).unwrap().is_empty());
    }

    #[test]
    fn last_seen_is_written_independently() {
        let conn = open_memory_database().unwrap();
        insert_session(&conn, &sample("c1")).unwrap();
        let now = Utc::now();
        assert!(update_last_seen(&conn, "c1", now).unwrap());
        assert!(!update_last_seen(&conn, "ghost", now).unwrap());

        let loaded = get_session(&conn, "c1").unwrap().unwrap();
        assert_eq!(loaded.last_seen_at.map(|t| t.timestamp()), Some(now.timestamp()));
    }
}
