use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            email       TEXT NOT NULL UNIQUE COLLATE NOCASE,
            password    BLOB NOT NULL,
            activated   INTEGER NOT NULL DEFAULT 0,
            last_online TEXT,
            created_at  TEXT NOT NULL,
            version     INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS token (
            hash        TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            scope       TEXT NOT NULL,
            expiry      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_token_user
            ON token(user_id, scope);

        -- One row per unordered pair; the lower id is always sender_id.
        CREATE TABLE IF NOT EXISTS conversation (
            sender_id   TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            receiver_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (sender_id, receiver_id),
            CHECK (sender_id < receiver_id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversation_receiver
            ON conversation(receiver_id);

        CREATE TABLE IF NOT EXISTS message (
            id           TEXT PRIMARY KEY,
            sender_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            receiver_id  TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            body         TEXT,
            sent_at      TEXT NOT NULL,
            delivered_at TEXT,
            read_at      TEXT,
            operation    INTEGER NOT NULL,
            version      INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_message_pending
            ON message(receiver_id, operation, sent_at);

        CREATE INDEX IF NOT EXISTS idx_message_sender
            ON message(sender_id, sent_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('users', 'token', 'conversation', 'message')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }
}
