use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on a message body, in UTF-8 bytes.
pub const MAX_BODY_BYTES: usize = 5120;

/// Operation tag carried by every frame. The ordinals are part of the wire
/// format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Operation {
    Create = 0,
    Delivered = 1,
    DeliveredConfirm = 2,
    Read = 3,
    ReadConfirm = 4,
    Delete = 5,
    DeleteConfirm = 6,
    Online = 7,
    Offline = 8,
    Typing = 9,
    SyncConvos = 10,
}

impl Operation {
    /// Order in which pending buckets are pushed to a reconnecting session.
    pub const REPLAY_ORDER: [Operation; 4] = [
        Operation::Delete,
        Operation::Delivered,
        Operation::Read,
        Operation::Create,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Operations that leave a row in the message store.
    pub fn is_persisted(self) -> bool {
        matches!(
            self,
            Operation::Create | Operation::Delivered | Operation::Read | Operation::Delete
        )
    }

    /// Sender-facing acks: they drain the store but are never relayed.
    pub fn is_confirm(self) -> bool {
        matches!(
            self,
            Operation::DeliveredConfirm | Operation::ReadConfirm | Operation::DeleteConfirm
        )
    }

    /// Everything that refers to a concrete message needs its id.
    pub fn requires_id(self) -> bool {
        self.is_persisted() || self.is_confirm()
    }
}

impl From<Operation> for u8 {
    fn from(op: Operation) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for Operation {
    type Error = UnknownOperation;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => Operation::Create,
            1 => Operation::Delivered,
            2 => Operation::DeliveredConfirm,
            3 => Operation::Read,
            4 => Operation::ReadConfirm,
            5 => Operation::Delete,
            6 => Operation::DeleteConfirm,
            7 => Operation::Online,
            8 => Operation::Offline,
            9 => Operation::Typing,
            10 => Operation::SyncConvos,
            other => return Err(UnknownOperation(other)),
        })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownOperation(pub u8);

impl fmt::Display for UnknownOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown operation tag {}", self.0)
    }
}

impl std::error::Error for UnknownOperation {}

/// A single JSON message exchanged over the `/sub` socket, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    /// Overwritten by the broker with the authenticated user on the way in.
    #[serde(rename = "senderID", default)]
    pub sender_id: String,

    #[serde(rename = "receiverID", default)]
    pub receiver_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    #[serde(default = "Utc::now")]
    pub sent_at: DateTime<Utc>,

    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,

    pub operation: Operation,
}

impl Frame {
    /// A body-less frame generated by the broker (presence, sync).
    pub fn signal(operation: Operation, sender_id: Uuid, receiver_id: Uuid) -> Self {
        Self {
            id: None,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            body: None,
            sent_at: Utc::now(),
            delivered_at: None,
            read_at: None,
            operation,
        }
    }
}

/// Field name -> problem, serialized as `{"error": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub error: BTreeMap<String, String>,
}

impl ValidationError {
    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut v = Self::default();
        v.add(field, message);
        v
    }

    /// Records the first problem seen for a field; later ones are ignored.
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.error
            .entry(field.to_string())
            .or_insert_with(|| message.into());
    }

    pub fn check(&mut self, ok: bool, field: &str, message: &str) {
        if !ok {
            self.add(field, message);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.error.is_empty()
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.error {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{field}: {message}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Anything the broker writes to a client socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Error(ValidationError),
    Frame(Frame),
}

impl From<Frame> for ServerFrame {
    fn from(frame: Frame) -> Self {
        ServerFrame::Frame(frame)
    }
}
