//! Opaque bearer tokens. Only the sha-256 of the plain text is stored.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::Result;
use crate::models::encode_ts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScope {
    Activation,
    Authentication,
}

impl TokenScope {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenScope::Activation => "activation",
            TokenScope::Authentication => "authentication",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    /// Handed to the client once, never persisted.
    pub plaintext: String,
    pub hash: String,
    pub user_id: Uuid,
    pub expiry: DateTime<Utc>,
    pub scope: TokenScope,
}

impl Token {
    pub fn generate(user_id: Uuid, ttl: Duration, scope: TokenScope) -> Token {
        let mut raw = [0u8; 16];
        rand::rng().fill_bytes(&mut raw);
        let plaintext = URL_SAFE_NO_PAD.encode(raw);
        let hash = hash_plaintext(&plaintext);
        Token {
            plaintext,
            hash,
            user_id,
            expiry: Utc::now() + ttl,
            scope,
        }
    }
}

/// Lowercase hex sha-256, the form tokens are looked up by.
pub fn hash_plaintext(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

pub fn insert(conn: &Connection, token: &Token) -> Result<()> {
    conn.execute(
        "INSERT INTO token (hash, user_id, scope, expiry) VALUES (?1, ?2, ?3, ?4)",
        params![
            token.hash,
            token.user_id.to_string(),
            token.scope.as_str(),
            encode_ts(&token.expiry)
        ],
    )?;
    Ok(())
}

pub fn delete_all_for_user(conn: &Connection, scope: TokenScope, user_id: Uuid) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM token WHERE scope = ?1 AND user_id = ?2",
        params![scope.as_str(), user_id.to_string()],
    )?;
    Ok(n)
}
