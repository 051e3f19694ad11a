//! Queue repository: SQL for `queue_messages` and `dead_letters`.
//!
//! Times are epoch milliseconds. A message is visible when
//! `visible_at <= now`; dequeueing pushes `visible_at` forward by the
//! visibility timeout and stamps a fresh receipt handle.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;

/// A raw queued message.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub message_id: String,
    pub job_id: String,
    pub body: String,
    pub enqueued_at: i64,
    pub visible_at: i64,
    pub receive_count: u32,
    pub receipt_handle: Option<String>,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            message_id: row.get("message_id")?,
            job_id: row.get("job_id")?,
            body: row.get("body")?,
            enqueued_at: row.get("enqueued_at")?,
            visible_at: row.get("visible_at")?,
            receive_count: row.get("receive_count")?,
            receipt_handle: row.get("receipt_handle")?,
        })
    }
}

/// A raw dead-lettered message.
#[derive(Debug, Clone)]
pub struct DeadLetterRow {
    pub message_id: String,
    pub job_id: String,
    pub body: String,
    pub receive_count: u32,
    pub enqueued_at: i64,
    pub dead_lettered_at: i64,
}

impl DeadLetterRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            message_id: row.get("message_id")?,
            job_id: row.get("job_id")?,
            body: row.get("body")?,
            receive_count: row.get("receive_count")?,
            enqueued_at: row.get("enqueued_at")?,
            dead_lettered_at: row.get("dead_lettered_at")?,
        })
    }
}

pub fn insert(
    conn: &Connection,
    message_id: &str,
    job_id: &str,
    body: &str,
    now_ms: i64,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO queue_messages (message_id, job_id, body, enqueued_at, visible_at, receive_count)
         VALUES (?1, ?2, ?3, ?4, ?4, 0)",
        params![message_id, job_id, body, now_ms],
    )?;
    Ok(())
}

/// Oldest message whose visibility window has lapsed.
pub fn next_visible(conn: &Connection, now_ms: i64) -> Result<Option<MessageRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM queue_messages WHERE visible_at <= ?1
             ORDER BY enqueued_at ASC, rowid ASC LIMIT 1",
            params![now_ms],
            MessageRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Records one more delivery of `message_id`.
pub fn mark_received(
    conn: &Connection,
    message_id: &str,
    receipt_handle: &str,
    visible_at: i64,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE queue_messages SET receive_count = receive_count + 1,
         receipt_handle = ?2, visible_at = ?3
         WHERE message_id = ?1",
        params![message_id, receipt_handle, visible_at],
    )?;
    Ok(changed)
}

pub fn delete_by_receipt(
    conn: &Connection,
    message_id: &str,
    receipt_handle: &str,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM queue_messages WHERE message_id = ?1 AND receipt_handle = ?2",
        params![message_id, receipt_handle],
    )?;
    Ok(changed)
}

/// Makes an in-flight message visible again immediately.
pub fn release_by_receipt(
    conn: &Connection,
    message_id: &str,
    receipt_handle: &str,
    now_ms: i64,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE queue_messages SET visible_at = ?3, receipt_handle = NULL
         WHERE message_id = ?1 AND receipt_handle = ?2",
        params![message_id, receipt_handle, now_ms],
    )?;
    Ok(changed)
}

/// Moves a message into the dead-letter table.
pub fn move_to_dead_letter(
    conn: &Connection,
    message: &MessageRow,
    now_ms: i64,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR REPLACE INTO dead_letters
         (message_id, job_id, body, receive_count, enqueued_at, dead_lettered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            message.message_id,
            message.job_id,
            message.body,
            message.receive_count,
            message.enqueued_at,
            now_ms
        ],
    )?;
    conn.execute(
        "DELETE FROM queue_messages WHERE message_id = ?1",
        params![message.message_id],
    )?;
    Ok(())
}

pub fn dead_letters(conn: &Connection) -> Result<Vec<DeadLetterRow>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM dead_letters ORDER BY dead_lettered_at ASC")?;
    let rows = stmt
        .query_map([], DeadLetterRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_dead_letter(
    conn: &Connection,
    message_id: &str,
) -> Result<Option<DeadLetterRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM dead_letters WHERE message_id = ?1",
            params![message_id],
            DeadLetterRow::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn delete_dead_letter(conn: &Connection, message_id: &str) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM dead_letters WHERE message_id = ?1",
        params![message_id],
    )?;
    Ok(changed)
}

/// Counts of (visible, in flight, dead-lettered) messages at `now_ms`.
pub fn depth(conn: &Connection, now_ms: i64) -> Result<(u64, u64, u64), DatabaseError> {
    let visible: u64 = conn.query_row(
        "SELECT COUNT(*) FROM queue_messages WHERE visible_at <= ?1",
        params![now_ms],
        |r| r.get(0),
    )?;
    let in_flight: u64 = conn.query_row(
        "SELECT COUNT(*) FROM queue_messages WHERE visible_at > ?1",
        params![now_ms],
        |r| r.get(0),
    )?;
    let dead: u64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |r| r.get(0))?;
    Ok((visible, in_flight, dead))
}
