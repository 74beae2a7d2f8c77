//! Repository functions for the `chat_groups` table.
//!
//! Members are stored as a JSON array of peer ids.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::DatabaseError;
use crate::models::ChatGroup;

struct GroupRow {
    id: String,
    key: Vec<u8>,
    members: String,
    updated_at: chrono::DateTime<chrono::Utc>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<GroupRow> {
    Ok(GroupRow {
        id: row.get(0)?,
        key: row.get(1)?,
        members: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn group_from_row(row: GroupRow) -> Result<ChatGroup, DatabaseError> {
    let members: Vec<String> =
        serde_json::from_str(&row.members).map_err(|e| DatabaseError::CorruptedColumn {
            column: "chat_groups.members".into(),
            reason: e.to_string(),
        })?;
    Ok(ChatGroup {
        id: row.id,
        key: row.key,
        members,
        updated_at: row.updated_at,
    })
}

fn encode_members(group: &ChatGroup) -> Result<String, DatabaseError> {
    serde_json::to_string(&group.members).map_err(|e| DatabaseError::CorruptedColumn {
        column: "chat_groups.members".into(),
        reason: e.to_string(),
    })
}

pub fn get_all_groups(conn: &Connection) -> Result<Vec<ChatGroup>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT id, key, members, updated_at FROM chat_groups")?;
    let rows = stmt
        .query_map([], read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(group_from_row).collect()
}

pub fn get_group(conn: &Connection, id: &str) -> Result<Option<ChatGroup>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT id, key, members, updated_at FROM chat_groups WHERE id = ?1")?;
    let row = stmt.query_row(params![id], read_row).optional()?;
    row.map(group_from_row).transpose()
}

pub fn insert_group(conn: &Connection, group: &ChatGroup) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO chat_groups (id, key, members, updated_at) VALUES (?1, ?2, ?3, ?4)",
        params![group.id, group.key, encode_members(group)?, group.updated_at],
    )?;
    Ok(())
}

pub fn update_group(conn: &Connection, group: &ChatGroup) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE chat_groups SET key = ?2, members = ?3, updated_at = ?4 WHERE id = ?1",
        params![group.id, group.key, encode_members(group)?, group.updated_at],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "chat_group".into(),
            id: group.id.clone(),
        });
    }
    Ok(())
}

pub fn delete_group(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let deleted = conn.execute("DELETE FROM chat_groups WHERE id = ?1", params![id])?;
    Ok(deleted > 0)
}
