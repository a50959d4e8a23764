//! Records stored by the database, plus their mapping onto wire types.
//! Column encoding lives here so every query module reads rows the same way.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

use tidings_types::api::UserResponse;
use tidings_types::{Frame, Operation};

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    /// Opaque password verifier; the hashing scheme is the caller's business.
    pub password: Vec<u8>,
    pub activated: bool,
    /// `None` while the user has a live session.
    pub last_online: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

/// A pending message row. At most one row exists per id; its `operation`
/// says which step of the lifecycle is still waiting for an ack.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub body: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub operation: Operation,
    pub version: i64,
}

/// One side of a conversation, seen from the other participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondent {
    pub peer_id: Uuid,
    pub peer_name: String,
    pub peer_email: String,
    pub peer_last_online: Option<DateTime<Utc>>,
}

impl From<Message> for Frame {
    fn from(m: Message) -> Frame {
        Frame {
            id: Some(m.id),
            sender_id: m.sender_id.to_string(),
            receiver_id: m.receiver_id.to_string(),
            body: m.body,
            sent_at: m.sent_at,
            delivered_at: m.delivered_at,
            read_at: m.read_at,
            operation: m.operation,
        }
    }
}

impl From<&User> for UserResponse {
    fn from(u: &User) -> UserResponse {
        UserResponse {
            id: u.id,
            name: u.name.clone(),
            email: u.email.clone(),
            activated: u.activated,
            last_online: u.last_online,
            created_at: u.created_at,
            version: u.version,
        }
    }
}

// -- Column encoding --

/// Fixed-width RFC 3339 so that text order equals time order in SQL.
pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn encode_opt_ts(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(encode_ts)
}

pub(crate) fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn op_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Operation> {
    let raw: u8 = row.get(idx)?;
    Operation::try_from(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encoded_timestamps_sort_chronologically() {
        let whole = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let fractional = whole + chrono::Duration::microseconds(500_000);
        let later = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap();

        let mut encoded = vec![encode_ts(&later), encode_ts(&fractional), encode_ts(&whole)];
        encoded.sort();
        assert_eq!(
            encoded,
            vec![encode_ts(&whole), encode_ts(&fractional), encode_ts(&later)]
        );
        assert_eq!(encode_ts(&whole), "2025-01-01T00:00:00.000000Z");
    }

    #[test]
    fn message_maps_onto_frame() {
        let m = Message {
            id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            body: Some("hi".into()),
            sent_at: Utc::now(),
            delivered_at: None,
            read_at: None,
            operation: Operation::Create,
            version: 1,
        };
        let frame = Frame::from(m.clone());
        assert_eq!(frame.id, Some(m.id));
        assert_eq!(frame.sender_id, m.sender_id.to_string());
        assert_eq!(frame.receiver_id, m.receiver_id.to_string());
        assert_eq!(frame.operation, Operation::Create);
    }
}
