
use rusqlite::{Connection, Row, params};
use tracing::debug;
use uuid::Uuid;

use tidings_types::{Filter, Metadata, Operation};

use crate::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, encode_opt_ts, encode_ts, op_col, opt_ts_col, ts_col, uuid_col};
use crate::store::{MessageStore, Sink};

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, body, sent_at, delivered_at, read_at, operation, version";

impl MessageStore for Database {
    fn upsert(&self, msg: &Message) -> Result<()> {
        self.with_conn(|conn| upsert(conn, msg))
    }

    fn get_by_id(&self, id: Uuid, operation: Operation) -> Result<Message> {
        self.with_conn(|conn| get_by_id(conn, id, operation))
    }

    fn delete(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| delete(conn, id))
    }

    fn delete_with_operation(&self, id: Uuid, operation: Operation) -> Result<()> {
        self.with_conn(|conn| delete_with_operation(conn, id, operation))
    }

    fn stream_undelivered(
        &self,
        receiver: Uuid,
        operation: Operation,
        sink: Sink<'_>,
    ) -> Result<usize> {
        // Rows are read under the lock, handed over after it is released.
        let pending = self.with_conn(|conn| undelivered(conn, receiver, operation))?;
        Ok(drain_into(pending, sink))
    }

    fn stream_page(&self, user: Uuid, filter: &Filter, sink: Sink<'_>) -> Result<Metadata> {
        let (rows, total) = self.with_conn(|conn| page(conn, user, filter))?;
        drain_into(rows, sink);
        Ok(Metadata::calculate(total, filter))
    }
}

fn drain_into(rows: Vec<Message>, sink: Sink<'_>) -> usize {
    let mut sent = 0;
    for msg in rows {
        sent += 1;
        if sink(msg).is_break() {
            break;
        }
    }
    sent
}

/// Writes every column of `msg`, replacing whatever row held this id.
pub fn upsert(conn: &Connection, msg: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO message
            (id, sender_id, receiver_id, body, sent_at, delivered_at, read_at, operation, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            sender_id    = excluded.sender_id,
            receiver_id  = excluded.receiver_id,
            body         = excluded.body,
            sent_at      = excluded.sent_at,
            delivered_at = excluded.delivered_at,
            read_at      = excluded.read_at,
            operation    = excluded.operation,
            version      = message.version + 1",
        params![
            msg.id.to_string(),
            msg.sender_id.to_string(),
            msg.receiver_id.to_string(),
            msg.body,
            encode_ts(&msg.sent_at),
            encode_opt_ts(&msg.delivered_at),
            encode_opt_ts(&msg.read_at),
            msg.operation.tag(),
            msg.version.max(1),
        ],
    )?;
    debug!(message_id = %msg.id, op = %msg.operation, "message stored");
    Ok(())
}

pub fn get_by_id(conn: &Connection, id: Uuid, operation: Operation) -> Result<Message> {
    let msg = conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM message WHERE id = ?1 AND operation = ?2"),
        params![id.to_string(), operation.tag()],
        message_from_row,
    )?;
    Ok(msg)
}

pub fn delete(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute("DELETE FROM message WHERE id = ?1", [id.to_string()])?;
    Ok(())
}

pub fn delete_with_operation(conn: &Connection, id: Uuid, operation: Operation) -> Result<()> {
    conn.execute(
        "DELETE FROM message WHERE id = ?1 AND operation = ?2",
        params![id.to_string(), operation.tag()],
    )?;
    Ok(())
}

fn undelivered(conn: &Connection, receiver: Uuid, operation: Operation) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM message
         WHERE receiver_id = ?1 AND operation = ?2
         ORDER BY sent_at ASC, rowid ASC"
    ))?;
    let rows = stmt
        .query_map(params![receiver.to_string(), operation.tag()], message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn page(conn: &Connection, user: Uuid, filter: &Filter) -> Result<(Vec<Message>, u64)> {
    let mut stmt = conn.prepare(&format!(
        "SELECT count(*) OVER(), {MESSAGE_COLUMNS} FROM message
         WHERE sender_id = ?1 OR receiver_id = ?1
         ORDER BY sent_at DESC, rowid DESC
         LIMIT ?2 OFFSET ?3"
    ))?;

    let mut total = 0u64;
    let mut out = Vec::new();
    let mut rows = stmt.query(params![user.to_string(), filter.limit(), filter.offset()])?;
    while let Some(row) = rows.next()? {
        let count: i64 = row.get(0)?;
        total = u64::try_from(count).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        out.push(message_from_offset(row, 1)?);
    }
    Ok((out, total))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    message_from_offset(row, 0)
}

fn message_from_offset(row: &Row<'_>, at: usize) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_col(row, at)?,
        sender_id: uuid_col(row, at + 1)?,
        receiver_id: uuid_col(row, at + 2)?,
        body: row.get(at + 3)?,
        sent_at: ts_col(row, at + 4)?,
        delivered_at: opt_ts_col(row, at + 5)?,
        read_at: opt_ts_col(row, at + 6)?,
        operation: op_col(row, at + 7)?,
        version: row.get(at + 8)?,
    })
}
