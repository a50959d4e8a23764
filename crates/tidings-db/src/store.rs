//! Store seams used by the broker and the HTTP layer.
//!
//! All methods are synchronous; async callers hop onto the blocking pool.
//! [`Database`](crate::Database) implements every trait, and each method is a
//! thin wrapper over a free function in the matching module that takes a
//! `&Connection`, so the same queries also run inside
//! [`Database::run_in_transaction`](crate::Database::run_in_transaction).

use std::ops::ControlFlow;

use tidings_types::{Filter, Metadata, Operation};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Correspondent, Message, User};
use crate::tokens::TokenScope;

/// Receives rows one at a time. Returning `Break` stops the stream early.
pub type Sink<'a> = &'a mut dyn FnMut(Message) -> ControlFlow<()>;

pub trait MessageStore: Send + Sync {
    /// Inserts or fully replaces the row keyed by `msg.id`.
    fn upsert(&self, msg: &Message) -> Result<()>;

    fn get_by_id(&self, id: Uuid, operation: Operation) -> Result<Message>;

    /// Removes any row with this id, whatever its operation.
    fn delete(&self, id: Uuid) -> Result<()>;

    /// Removes the row with this id only if it carries `operation`.
    fn delete_with_operation(&self, id: Uuid, operation: Operation) -> Result<()>;

    /// Feeds every pending `operation` row addressed to `receiver` into
    /// `sink`, oldest first. The sink may block; no store lock is held while
    /// it runs. Returns the number of rows handed over.
    fn stream_undelivered(&self, receiver: Uuid, operation: Operation, sink: Sink<'_>)
    -> Result<usize>;

    /// Feeds one page of rows sent or received by `user`, newest first.
    fn stream_page(&self, user: Uuid, filter: &Filter, sink: Sink<'_>) -> Result<Metadata>;
}

#[derive(Debug, Clone, Copy)]
pub enum UserField<'a> {
    Id(Uuid),
    Email(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Name,
    Email,
}

impl SearchField {
    pub(crate) fn column(self) -> &'static str {
        match self {
            SearchField::Name => "name",
            SearchField::Email => "email",
        }
    }
}

pub trait UserStore: Send + Sync {
    /// Returns the new id, or `DuplicateEmail`.
    fn register(&self, name: &str, email: &str, password: &[u8]) -> Result<Uuid>;

    fn exists_by_email(&self, email: &str) -> Result<bool>;

    fn get_by(&self, field: UserField<'_>) -> Result<User>;

    /// Writes every mutable column if `user.version` is still current and
    /// bumps `user.version` on success. `Conflict` otherwise.
    fn update(&self, user: &mut User) -> Result<()>;

    /// Same version discipline as [`UserStore::update`], sets `activated`.
    fn activate(&self, user: &mut User) -> Result<()>;

    /// Resolves the owner of an unexpired token.
    fn get_for_token(&self, scope: TokenScope, hash: &str) -> Result<User>;

    /// Activated users whose `field` is similar to `value`, best match first.
    fn search_by_query(
        &self,
        field: SearchField,
        value: &str,
        filter: &Filter,
    ) -> Result<(Vec<User>, Metadata)>;
}

pub trait ConversationStore: Send + Sync {
    /// Idempotent on the unordered pair.
    fn create(&self, a: Uuid, b: Uuid) -> Result<()>;

    fn exists(&self, a: Uuid, b: Uuid) -> Result<bool>;

    fn list_for(&self, user: Uuid) -> Result<Vec<Correspondent>>;
}
