use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::Database;
use crate::error::Result;
use crate::models::{Correspondent, encode_ts, opt_ts_col, uuid_col};
use crate::store::ConversationStore;

impl ConversationStore for Database {
    fn create(&self, a: Uuid, b: Uuid) -> Result<()> {
        self.with_conn(|conn| create(conn, a, b))
    }

    fn exists(&self, a: Uuid, b: Uuid) -> Result<bool> {
        self.with_conn(|conn| exists(conn, a, b))
    }

    fn list_for(&self, user: Uuid) -> Result<Vec<Correspondent>> {
        self.with_conn(|conn| list_for(conn, user))
    }
}

/// Ids in storage order: the lower one first.
fn canonical(a: Uuid, b: Uuid) -> (String, String) {
    let (a, b) = (a.to_string(), b.to_string());
    if a < b { (a, b) } else { (b, a) }
}

pub fn create(conn: &Connection, a: Uuid, b: Uuid) -> Result<()> {
    let (low, high) = canonical(a, b);
    conn.execute(
        "INSERT INTO conversation (sender_id, receiver_id, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(sender_id, receiver_id) DO NOTHING",
        params![low, high, encode_ts(&Utc::now())],
    )?;
    Ok(())
}

pub fn exists(conn: &Connection, a: Uuid, b: Uuid) -> Result<bool> {
    let (a, b) = (a.to_string(), b.to_string());
    let found = conn
        .query_row(
            "SELECT 1 FROM conversation
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)",
            params![a, b],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn list_for(conn: &Connection, user: Uuid) -> Result<Vec<Correspondent>> {
    let mut stmt = conn.prepare(
        "SELECT users.id, users.name, users.email, users.last_online
         FROM conversation
         INNER JOIN users ON users.id =
             CASE WHEN conversation.sender_id = ?1
                  THEN conversation.receiver_id
                  ELSE conversation.sender_id END
         WHERE conversation.sender_id = ?1 OR conversation.receiver_id = ?1
         ORDER BY conversation.created_at ASC, conversation.rowid ASC",
    )?;
    let rows = stmt
        .query_map([user.to_string()], |row| {
            Ok(Correspondent {
                peer_id: uuid_col(row, 0)?,
                peer_name: row.get(1)?,
                peer_email: row.get(2)?,
                peer_last_online: opt_ts_col(row, 3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use crate::store::UserStore;

    fn db_with_users(n: usize) -> (Database, Vec<Uuid>) {
        let db = Database::open_in_memory().unwrap();
        let ids = (0..n)
            .map(|i| {
                db.register(&format!("user{i}"), &format!("user{i}@example.com"), b"pw")
                    .unwrap()
            })
            .collect();
        (db, ids)
    }

    #[test]
    fn create_is_idempotent_on_the_unordered_pair() {
        let (db, ids) = db_with_users(2);
        let (a, b) = (ids[0], ids[1]);

        db.create(a, b).unwrap();
        db.create(b, a).unwrap();
        db.create(a, b).unwrap();

        let rows: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT count(*) FROM conversation", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(rows, 1);
        assert!(db.exists(a, b).unwrap());
        assert!(db.exists(b, a).unwrap());
    }

    #[test]
    fn self_conversation_is_rejected() {
        let (db, ids) = db_with_users(1);
        let err = db.create(ids[0], ids[0]).unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[test]
    fn list_shows_the_other_side() {
        let (db, ids) = db_with_users(3);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        db.create(a, b).unwrap();
        db.create(c, a).unwrap();

        let peers: Vec<Uuid> = db.list_for(a).unwrap().iter().map(|p| p.peer_id).collect();
        assert_eq!(peers, vec![b, c]);

        let of_b = db.list_for(b).unwrap();
        assert_eq!(of_b.len(), 1);
        assert_eq!(of_b[0].peer_id, a);
        assert_eq!(of_b[0].peer_name, "user0");
        assert_eq!(of_b[0].peer_email, "user0@example.com");

        assert!(!db.exists(b, c).unwrap());
    }
}
