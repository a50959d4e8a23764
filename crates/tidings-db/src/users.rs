use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use uuid::Uuid;

use tidings_types::{Filter, Metadata};

use crate::Database;
use crate::error::{Result, StoreError};
use crate::models::{User, encode_opt_ts, encode_ts, opt_ts_col, ts_col, uuid_col};
use crate::similarity::SEARCH_THRESHOLD;
use crate::store::{SearchField, UserField, UserStore};
use crate::tokens::TokenScope;

const USER_COLUMNS: &str =
    "users.id, users.name, users.email, users.password, users.activated, \
     users.last_online, users.created_at, users.version";

impl UserStore for Database {
    fn register(&self, name: &str, email: &str, password: &[u8]) -> Result<Uuid> {
        self.with_conn(|conn| insert(conn, name, email, password))
    }

    fn exists_by_email(&self, email: &str) -> Result<bool> {
        self.with_conn(|conn| exists_by_email(conn, email))
    }

    fn get_by(&self, field: UserField<'_>) -> Result<User> {
        self.with_conn(|conn| get_by(conn, field))
    }

    fn update(&self, user: &mut User) -> Result<()> {
        self.with_conn(|conn| update(conn, user))
    }

    fn activate(&self, user: &mut User) -> Result<()> {
        self.with_conn(|conn| activate(conn, user))
    }

    fn get_for_token(&self, scope: TokenScope, hash: &str) -> Result<User> {
        self.with_conn(|conn| get_for_token(conn, scope, hash))
    }

    fn search_by_query(
        &self,
        field: SearchField,
        value: &str,
        filter: &Filter,
    ) -> Result<(Vec<User>, Metadata)> {
        self.with_conn(|conn| search(conn, field, value, filter))
    }
}

pub fn insert(conn: &Connection, name: &str, email: &str, password: &[u8]) -> Result<Uuid> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO users (id, name, email, password, activated, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![id.to_string(), name, email, password, encode_ts(&Utc::now())],
    )
    .map_err(map_email_violation)?;
    Ok(id)
}

pub fn exists_by_email(conn: &Connection, email: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM users WHERE email = ?1", [email], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

pub fn get_by(conn: &Connection, field: UserField<'_>) -> Result<User> {
    let user = match field {
        UserField::Id(id) => conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            [id.to_string()],
            user_from_row,
        )?,
        UserField::Email(email) => conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
            [email],
            user_from_row,
        )?,
    };
    Ok(user)
}

pub fn update(conn: &Connection, user: &mut User) -> Result<()> {
    let version = conn
        .query_row(
            "UPDATE users
             SET name = ?1, email = ?2, password = ?3, activated = ?4, last_online = ?5,
                 version = version + 1
             WHERE id = ?6 AND version = ?7
             RETURNING version",
            params![
                user.name,
                user.email,
                user.password,
                user.activated,
                encode_opt_ts(&user.last_online),
                user.id.to_string(),
                user.version
            ],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(map_email_violation)?;

    user.version = version.ok_or(StoreError::Conflict)?;
    Ok(())
}

pub fn activate(conn: &Connection, user: &mut User) -> Result<()> {
    let version = conn
        .query_row(
            "UPDATE users SET activated = 1, version = version + 1
             WHERE id = ?1 AND version = ?2
             RETURNING version",
            params![user.id.to_string(), user.version],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;

    user.version = version.ok_or(StoreError::Conflict)?;
    user.activated = true;
    Ok(())
}

pub fn get_for_token(conn: &Connection, scope: TokenScope, hash: &str) -> Result<User> {
    let user = conn.query_row(
        &format!(
            "SELECT {USER_COLUMNS} FROM users
             INNER JOIN token ON token.user_id = users.id
             WHERE token.hash = ?1 AND token.scope = ?2 AND token.expiry > ?3"
        ),
        params![hash, scope.as_str(), encode_ts(&Utc::now())],
        user_from_row,
    )?;
    Ok(user)
}

pub fn search(
    conn: &Connection,
    field: SearchField,
    value: &str,
    filter: &Filter,
) -> Result<(Vec<User>, Metadata)> {
    let column = field.column();
    let sql = format!(
        "SELECT count(*) OVER(), {USER_COLUMNS},
                strict_word_similarity(?1, users.{column}) AS score
         FROM users
         WHERE users.activated = 1 AND strict_word_similarity(?1, users.{column}) >= ?2
         ORDER BY score DESC, users.created_at ASC, users.id ASC
         LIMIT ?3 OFFSET ?4"
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut total = 0u64;
    let mut users = Vec::new();
    let mut rows = stmt.query(params![value, SEARCH_THRESHOLD, filter.limit(), filter.offset()])?;
    while let Some(row) = rows.next()? {
        total = row.get::<_, i64>(0)? as u64;
        users.push(user_from_offset(row, 1)?);
    }

    Ok((users, Metadata::calculate(total, filter)))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    user_from_offset(row, 0)
}

fn user_from_offset(row: &Row<'_>, at: usize) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_col(row, at)?,
        name: row.get(at + 1)?,
        email: row.get(at + 2)?,
        password: row.get(at + 3)?,
        activated: row.get(at + 4)?,
        last_online: opt_ts_col(row, at + 5)?,
        created_at: ts_col(row, at + 6)?,
        version: row.get(at + 7)?,
    })
}

/// Only the unique index on `users.email` becomes `DuplicateEmail`; every
/// other failure keeps its usual classification.
fn map_email_violation(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(err, Some(msg)) = &e {
        if err.code == ErrorCode::ConstraintViolation
            && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            && msg.contains("users.email")
        {
            return StoreError::DuplicateEmail;
        }
    }
    StoreError::from(e)
}
