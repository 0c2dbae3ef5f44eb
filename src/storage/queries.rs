//! Database queries for version histories and the context/tag registry
//!
//! Every function takes a borrowed connection so callers decide the
//! transaction boundary (one per mutation, one per batch).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{MemvaultError, Result};
use crate::types::*;

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, value: &str) -> rusqlite::Result<T> {
    serde_json::from_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Parse a record (without versions and tags) from a `memories` row
fn history_from_row(row: &Row) -> rusqlite::Result<MemoryWithHistory> {
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let metadata: String = row.get("metadata")?;

    Ok(MemoryWithHistory {
        id: row.get("id")?,
        current_version: row.get("current_version")?,
        versions: Vec::new(),
        context: row.get("context")?,
        tags: BTreeSet::new(),
        created_at: parse_timestamp(3, &created_at)?,
        updated_at: parse_timestamp(4, &updated_at)?,
        metadata: json_column(5, &metadata)?,
    })
}

fn version_from_row(row: &Row) -> rusqlite::Result<(String, MemoryVersion)> {
    let created_at: String = row.get("created_at")?;
    Ok((
        row.get("memory_id")?,
        MemoryVersion {
            version_number: row.get("version_number")?,
            content: row.get("content")?,
            created_at: parse_timestamp(3, &created_at)?,
            created_by: row.get("created_by")?,
            change_note: row.get("change_note")?,
        },
    ))
}

/// Load every stored history.
///
/// Fails with a storage error if any record violates
/// `current_version == len(versions)`.
pub fn load_histories(conn: &Connection) -> Result<BTreeMap<MemoryId, MemoryWithHistory>> {
    let mut histories = BTreeMap::new();

    let mut stmt = conn.prepare(
        "SELECT id, current_version, context, created_at, updated_at, metadata FROM memories",
    )?;
    for row in stmt.query_map([], history_from_row)? {
        let history = row?;
        histories.insert(history.id.clone(), history);
    }

    let mut stmt = conn.prepare(
        "SELECT memory_id, version_number, content, created_at, created_by, change_note
         FROM memory_versions ORDER BY memory_id, version_number",
    )?;
    for row in stmt.query_map([], version_from_row)? {
        let (memory_id, version) = row?;
        let history = histories.get_mut(&memory_id).ok_or_else(|| {
            MemvaultError::storage(format!(
                "orphaned version {} for memory {:?}",
                version.version_number, memory_id
            ))
        })?;
        history.versions.push(version);
    }

    let mut stmt = conn.prepare("SELECT memory_id, tag FROM memory_tags")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (memory_id, tag) = row?;
        if let Some(history) = histories.get_mut(&memory_id) {
            history.tags.insert(tag);
        }
    }

    if let Some(bad) = histories.values().find(|h| !h.is_consistent()) {
        return Err(MemvaultError::storage(format!(
            "corrupt history for memory {:?}: current_version {} with {} versions",
            bad.id,
            bad.current_version,
            bad.versions.len()
        )));
    }

    Ok(histories)
}

/// Insert or update the record-level row and replace its tag set
pub fn upsert_record(conn: &Connection, history: &MemoryWithHistory) -> Result<()> {
    conn.execute(
        "INSERT INTO memories (id, current_version, context, created_at, updated_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            current_version = excluded.current_version,
            context = excluded.context,
            updated_at = excluded.updated_at,
            metadata = excluded.metadata",
        params![
            history.id,
            history.current_version,
            history.context,
            history.created_at.to_rfc3339(),
            history.updated_at.to_rfc3339(),
            serde_json::to_string(&history.metadata)?,
        ],
    )?;
    replace_tags(conn, &history.id, &history.tags)
}

fn replace_tags(conn: &Connection, memory_id: &str, tags: &BTreeSet<String>) -> Result<()> {
    conn.execute(
        "DELETE FROM memory_tags WHERE memory_id = ?",
        params![memory_id],
    )?;
    let mut stmt =
        conn.prepare_cached("INSERT OR IGNORE INTO memory_tags (memory_id, tag) VALUES (?, ?)")?;
    for tag in tags {
        stmt.execute(params![memory_id, tag])?;
    }
    Ok(())
}

/// Append one version row. Fails if the version number already exists.
pub fn insert_version(conn: &Connection, memory_id: &str, version: &MemoryVersion) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO memory_versions
            (memory_id, version_number, content, created_at, created_by, change_note)
         VALUES (?, ?, ?, ?, ?, ?)",
    )?
    .execute(params![
        memory_id,
        version.version_number,
        version.content,
        version.created_at.to_rfc3339(),
        version.created_by,
        version.change_note,
    ])?;
    Ok(())
}

/// Persist a record whose only history change is one appended version
pub fn save_appended(conn: &Connection, history: &MemoryWithHistory) -> Result<()> {
    let latest = history
        .latest()
        .ok_or_else(|| MemvaultError::storage(format!("memory {:?} has no versions", history.id)))?;
    upsert_record(conn, history)?;
    insert_version(conn, &history.id, latest)
}

/// Overwrite a record and its entire history
pub fn replace_history(conn: &Connection, history: &MemoryWithHistory) -> Result<()> {
    delete_history(conn, &history.id)?;
    conn.execute(
        "INSERT INTO memories (id, current_version, context, created_at, updated_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            history.id,
            history.current_version,
            history.context,
            history.created_at.to_rfc3339(),
            history.updated_at.to_rfc3339(),
            serde_json::to_string(&history.metadata)?,
        ],
    )?;
    for version in &history.versions {
        insert_version(conn, &history.id, version)?;
    }
    replace_tags(conn, &history.id, &history.tags)
}

/// Delete a record with its versions and tags. Returns whether a row existed.
pub fn delete_history(conn: &Connection, memory_id: &str) -> Result<bool> {
    conn.execute(
        "DELETE FROM memory_versions WHERE memory_id = ?",
        params![memory_id],
    )?;
    conn.execute(
        "DELETE FROM memory_tags WHERE memory_id = ?",
        params![memory_id],
    )?;
    let deleted = conn.execute("DELETE FROM memories WHERE id = ?", params![memory_id])?;
    Ok(deleted > 0)
}

// ============================================================================
// Registry
// ============================================================================

fn context_from_row(row: &Row) -> rusqlite::Result<Context> {
    let tags: String = row.get("tags")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Context {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        memory_count: row.get("memory_count")?,
        tags: json_column(4, &tags)?,
        created_at: parse_timestamp(5, &created_at)?,
        updated_at: parse_timestamp(6, &updated_at)?,
    })
}

fn tag_from_row(row: &Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        name: row.get("name")?,
        description: row.get("description")?,
        color: row.get("color")?,
        memory_count: row.get("memory_count")?,
    })
}

fn session_from_row(row: &Row) -> rusqlite::Result<ClientSession> {
    let created_at: String = row.get("created_at")?;
    let last_activity: String = row.get("last_activity")?;
    let shared_with: String = row.get("shared_with")?;
    Ok(ClientSession {
        client_id: row.get("client_id")?,
        current_context: row.get("current_context")?,
        created_at: parse_timestamp(2, &created_at)?,
        last_activity: parse_timestamp(3, &last_activity)?,
        shared_with: json_column(4, &shared_with)?,
    })
}

pub fn load_contexts(conn: &Connection) -> Result<BTreeMap<String, Context>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, description, memory_count, tags, created_at, updated_at FROM contexts",
    )?;
    let contexts = stmt
        .query_map([], context_from_row)?
        .map(|r| r.map(|c| (c.id.clone(), c)))
        .collect::<rusqlite::Result<_>>()?;
    Ok(contexts)
}

pub fn load_tags(conn: &Connection) -> Result<BTreeMap<String, Tag>> {
    let mut stmt = conn.prepare("SELECT name, description, color, memory_count FROM tags")?;
    let tags = stmt
        .query_map([], tag_from_row)?
        .map(|r| r.map(|t| (t.name.clone(), t)))
        .collect::<rusqlite::Result<_>>()?;
    Ok(tags)
}

pub fn load_sessions(conn: &Connection) -> Result<BTreeMap<String, ClientSession>> {
    let mut stmt = conn.prepare(
        "SELECT client_id, current_context, created_at, last_activity, shared_with FROM sessions",
    )?;
    let sessions = stmt
        .query_map([], session_from_row)?
        .map(|r| r.map(|s| (s.client_id.clone(), s)))
        .collect::<rusqlite::Result<_>>()?;
    Ok(sessions)
}

pub fn upsert_context(conn: &Connection, context: &Context) -> Result<()> {
    conn.execute(
        "INSERT INTO contexts (id, name, description, memory_count, tags, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            memory_count = excluded.memory_count,
            tags = excluded.tags,
            updated_at = excluded.updated_at",
        params![
            context.id,
            context.name,
            context.description,
            context.memory_count,
            serde_json::to_string(&context.tags)?,
            context.created_at.to_rfc3339(),
            context.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn delete_context(conn: &Connection, id: &str) -> Result<bool> {
    Ok(conn.execute("DELETE FROM contexts WHERE id = ?", params![id])? > 0)
}

pub fn upsert_tag(conn: &Connection, tag: &Tag) -> Result<()> {
    conn.execute(
        "INSERT INTO tags (name, description, color, memory_count)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET
            description = excluded.description,
            color = excluded.color,
            memory_count = excluded.memory_count",
        params![tag.name, tag.description, tag.color, tag.memory_count],
    )?;
    Ok(())
}

pub fn delete_tag(conn: &Connection, name: &str) -> Result<bool> {
    Ok(conn.execute("DELETE FROM tags WHERE name = ?", params![name])? > 0)
}

pub fn upsert_session(conn: &Connection, session: &ClientSession) -> Result<()> {
    conn.execute(
        "INSERT INTO sessions (client_id, current_context, created_at, last_activity, shared_with)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(client_id) DO UPDATE SET
            current_context = excluded.current_context,
            last_activity = excluded.last_activity,
            shared_with = excluded.shared_with",
        params![
            session.client_id,
            session.current_context,
            session.created_at.to_rfc3339(),
            session.last_activity.to_rfc3339(),
            serde_json::to_string(&session.shared_with)?,
        ],
    )?;
    Ok(())
}

pub fn delete_session(conn: &Connection, client_id: &str) -> Result<bool> {
    Ok(conn.execute(
        "DELETE FROM sessions WHERE client_id = ?",
        params![client_id],
    )? > 0)
}

/// Read a registry metadata value such as `format_version`
pub fn registry_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM registry_meta WHERE key = ?",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}
