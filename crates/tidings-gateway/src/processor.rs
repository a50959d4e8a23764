//! Inbound frame handling.
//!
//! Every frame is first turned into a [`Plan`] (pure, no I/O), then its
//! store mutation runs on the blocking pool, and only after that succeeds is
//! the frame relayed. A frame whose mutation keeps failing is dropped; the
//! client resends it and every mutation is idempotent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use tidings_db::{Message, StoreError};
use tidings_types::{Frame, MAX_BODY_BYTES, Operation, ServerFrame, ValidationError};

use crate::broker::Stores;
use crate::error::{GatewayError, Result};
use crate::presence::Presence;
use crate::registry::{Offer, Registry, SessionHandle};

/// Where a processed frame goes after its mutation has been stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The frame's receiver, if online.
    Peer(Uuid),
    /// Every online correspondent of the sender.
    Correspondents,
    /// Acks are consumed by the broker.
    Nowhere,
}

/// A store change derived from one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Ensure the conversation exists, then store the message.
    Create(Message),
    /// Drop the row at `from` and store `msg` in its place.
    Advance { from: Operation, msg: Message },
    /// Drop every row with this id and store `msg`.
    Replace(Message),
    /// Drop the row with this id at `operation`.
    Drain { id: Uuid, operation: Operation },
}

impl Mutation {
    pub fn apply(&self, stores: &Stores) -> std::result::Result<(), StoreError> {
        match self {
            Mutation::Create(msg) => {
                stores.conversations.create(msg.sender_id, msg.receiver_id)?;
                stores.messages.upsert(msg)
            }
            Mutation::Advance { from, msg } => {
                stores.messages.delete_with_operation(msg.id, *from)?;
                stores.messages.upsert(msg)
            }
            Mutation::Replace(msg) => {
                stores.messages.delete(msg.id)?;
                stores.messages.upsert(msg)
            }
            Mutation::Drain { id, operation } => {
                stores.messages.delete_with_operation(*id, *operation)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// The frame as it will be relayed: sender rewritten, timestamps filled.
    pub frame: Frame,
    pub mutation: Option<Mutation>,
    pub route: Route,
}

/// Validates `frame` on behalf of `sender` and decides what to do with it.
pub fn plan(mut frame: Frame, sender: Uuid) -> std::result::Result<Plan, ValidationError> {
    let op = frame.operation;
    frame.sender_id = sender.to_string();

    let mut v = ValidationError::default();

    // SyncConvos goes to correspondents and carries no meaningful receiver.
    let receiver = if op == Operation::SyncConvos {
        None
    } else {
        match Uuid::parse_str(&frame.receiver_id) {
            Ok(r) if r == sender => {
                v.add("receiverID", "must not be the sender");
                None
            }
            Ok(r) => Some(r),
            Err(_) => {
                v.add("receiverID", "must be a valid UUID");
                None
            }
        }
    };

    if let Some(body) = &frame.body {
        v.check(
            body.len() <= MAX_BODY_BYTES,
            "body",
            "must not be more than 5120 bytes long",
        );
    }
    if op == Operation::Create {
        v.check(
            frame.body.as_deref().is_some_and(|b| !b.is_empty()),
            "body",
            "must be provided",
        );
    }
    if op.requires_id() {
        v.check(frame.id.is_some(), "id", "must be provided");
    }
    v.into_result()?;

    if op == Operation::SyncConvos {
        return Ok(Plan {
            frame,
            mutation: None,
            route: Route::Correspondents,
        });
    }

    let Some(receiver) = receiver else {
        return Err(ValidationError::single("receiverID", "must be a valid UUID"));
    };

    match op {
        Operation::Delivered if frame.delivered_at.is_none() => {
            frame.delivered_at = Some(Utc::now());
        }
        Operation::Read if frame.read_at.is_none() => frame.read_at = Some(Utc::now()),
        _ => {}
    }

    let mutation = frame.id.and_then(|id| {
        let msg = || Message {
            id,
            sender_id: sender,
            receiver_id: receiver,
            body: frame.body.clone(),
            sent_at: frame.sent_at,
            delivered_at: frame.delivered_at,
            read_at: frame.read_at,
            operation: op,
            version: 1,
        };
        match op {
            Operation::Create => Some(Mutation::Create(msg())),
            Operation::Delivered => Some(Mutation::Advance {
                from: Operation::Create,
                msg: msg(),
            }),
            Operation::DeliveredConfirm => Some(Mutation::Drain {
                id,
                operation: Operation::Delivered,
            }),
            Operation::Read => Some(Mutation::Advance {
                from: Operation::Delivered,
                msg: msg(),
            }),
            Operation::ReadConfirm => Some(Mutation::Drain {
                id,
                operation: Operation::Read,
            }),
            Operation::Delete => Some(Mutation::Replace(msg())),
            Operation::DeleteConfirm => Some(Mutation::Drain {
                id,
                operation: Operation::Delete,
            }),
            Operation::Online | Operation::Offline | Operation::Typing | Operation::SyncConvos => {
                None
            }
        }
    });

    let route = if op.is_confirm() {
        Route::Nowhere
    } else {
        Route::Peer(receiver)
    };

    Ok(Plan {
        frame,
        mutation,
        route,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Multiplied by the attempt number before each retry.
    pub backoff: Duration,
}

/// Applies inbound frames for every session.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    stores: Stores,
    registry: Registry,
    presence: Presence,
    retry: RetryPolicy,
}

impl Processor {
    pub fn new(stores: Stores, registry: Registry, presence: Presence, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                stores,
                registry,
                presence,
                retry,
            }),
        }
    }

    /// Handles one frame read from `session`. Problems with the frame go
    /// back to the session as an error frame; the session stays open.
    pub async fn handle(&self, session: &SessionHandle, frame: Frame) {
        let sender = session.user_id();
        let plan = match plan(frame, sender) {
            Ok(plan) => plan,
            Err(invalid) => {
                debug!(user_id = %sender, error = %invalid, "rejected frame");
                session.offer(ServerFrame::Error(invalid));
                return;
            }
        };
        let op = plan.frame.operation;

        if let Some(mutation) = plan.mutation {
            match self.persist(mutation).await {
                Ok(()) => {}
                // Only the receiver's foreign key can refuse a validated frame.
                Err(GatewayError::Store(StoreError::Rejected(e))) => {
                    debug!(user_id = %sender, op = %op, error = %e, "receiver does not exist");
                    session.offer(ServerFrame::Error(ValidationError::single(
                        "receiverID",
                        "must be an existing user",
                    )));
                    return;
                }
                Err(e) => {
                    error!(user_id = %sender, op = %op, message_id = ?plan.frame.id, error = %e,
                        "dropping frame after store failure");
                    return;
                }
            }
        }

        match plan.route {
            Route::Peer(receiver) => self.relay(receiver, plan.frame),
            Route::Correspondents => {
                if let Err(e) = self.inner.presence.broadcast(sender, op).await {
                    warn!(user_id = %sender, error = %e, "sync broadcast failed");
                }
            }
            Route::Nowhere => {}
        }
    }

    fn relay(&self, receiver: Uuid, frame: Frame) {
        let op = frame.operation;
        let Some(peer) = self.inner.registry.lookup(receiver) else {
            debug!(receiver = %receiver, op = %op, "receiver offline");
            return;
        };
        match peer.offer(frame) {
            Offer::Queued => debug!(receiver = %receiver, op = %op, "relayed"),
            Offer::Offline => debug!(receiver = %receiver, op = %op, "receiver not live"),
            Offer::TooSlow => warn!(receiver = %receiver, op = %op, "receiver too slow"),
        }
    }

    /// Runs `mutation` on the blocking pool, retrying transient failures.
    pub async fn persist(&self, mutation: Mutation) -> Result<()> {
        let retry = self.inner.retry;
        let mut attempt = 1;
        loop {
            let stores = self.inner.stores.clone();
            let m = mutation.clone();
            let result = tokio::task::spawn_blocking(move || m.apply(&stores)).await?;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < retry.attempts => {
                    warn!(attempt, error = %e, "transient store failure, retrying");
                    tokio::time::sleep(retry.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(op: Operation, receiver: &str) -> Frame {
        Frame {
            id: Some(Uuid::new_v4()),
            sender_id: String::new(),
            receiver_id: receiver.to_string(),
            body: Some("hi".into()),
            sent_at: Utc::now(),
            delivered_at: None,
            read_at: None,
            operation: op,
        }
    }

    #[test]
    fn sender_is_always_overwritten() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let mut f = frame(Operation::Create, &peer.to_string());
        f.sender_id = Uuid::new_v4().to_string();

        let plan = plan(f, me).unwrap();
        assert_eq!(plan.frame.sender_id, me.to_string());
        assert_eq!(plan.route, Route::Peer(peer));
        match plan.mutation {
            Some(Mutation::Create(msg)) => {
                assert_eq!(msg.sender_id, me);
                assert_eq!(msg.receiver_id, peer);
            }
            other => panic!("unexpected mutation {other:?}"),
        }
    }

    #[test]
    fn bad_receiver_is_a_validation_error() {
        let me = Uuid::new_v4();
        let err = plan(frame(Operation::Create, "bob"), me).unwrap_err();
        assert_eq!(err.error["receiverID"], "must be a valid UUID");

        let err = plan(frame(Operation::Typing, &me.to_string()), me).unwrap_err();
        assert_eq!(err.error["receiverID"], "must not be the sender");
    }

    #[test]
    fn body_rules() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4().to_string();

        let mut missing = frame(Operation::Create, &peer);
        missing.body = None;
        assert_eq!(plan(missing, me).unwrap_err().error["body"], "must be provided");

        let mut huge = frame(Operation::Create, &peer);
        huge.body = Some("x".repeat(MAX_BODY_BYTES + 1));
        assert!(plan(huge, me).unwrap_err().error.contains_key("body"));

        let mut exact = frame(Operation::Create, &peer);
        exact.body = Some("é".repeat(MAX_BODY_BYTES / 2));
        assert!(plan(exact, me).is_ok());

        // Only Create needs a body.
        let mut ack = frame(Operation::Delivered, &peer);
        ack.body = None;
        assert!(plan(ack, me).is_ok());
    }

    #[test]
    fn message_operations_need_an_id() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4().to_string();
        for op in [
            Operation::Create,
            Operation::Delivered,
            Operation::DeliveredConfirm,
            Operation::Read,
            Operation::ReadConfirm,
            Operation::Delete,
            Operation::DeleteConfirm,
        ] {
            let mut f = frame(op, &peer);
            f.id = None;
            assert!(plan(f, me).unwrap_err().error.contains_key("id"), "{op}");
        }

        let mut typing = frame(Operation::Typing, &peer);
        typing.id = None;
        typing.body = None;
        let plan = plan(typing, me).unwrap();
        assert_eq!(plan.mutation, None);
    }

    #[test]
    fn operation_table() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let p = peer.to_string();

        let check = |op: Operation| plan(frame(op, &p), me).unwrap();

        let delivered = check(Operation::Delivered);
        assert!(matches!(
            delivered.mutation,
            Some(Mutation::Advance { from: Operation::Create, .. })
        ));
        assert!(delivered.frame.delivered_at.is_some());
        assert_eq!(delivered.route, Route::Peer(peer));

        let read = check(Operation::Read);
        assert!(matches!(
            read.mutation,
            Some(Mutation::Advance { from: Operation::Delivered, .. })
        ));
        assert!(read.frame.read_at.is_some());

        assert!(matches!(check(Operation::Delete).mutation, Some(Mutation::Replace(_))));

        for (confirm, drained) in [
            (Operation::DeliveredConfirm, Operation::Delivered),
            (Operation::ReadConfirm, Operation::Read),
            (Operation::DeleteConfirm, Operation::Delete),
        ] {
            let plan = check(confirm);
            assert_eq!(plan.route, Route::Nowhere);
            assert!(matches!(
                plan.mutation,
                Some(Mutation::Drain { operation, .. }) if operation == drained
            ));
        }

        for signal in [Operation::Online, Operation::Offline, Operation::Typing] {
            let plan = check(signal);
            assert_eq!(plan.mutation, None);
            assert_eq!(plan.route, Route::Peer(peer));
        }
    }

    #[test]
    fn sync_convos_needs_no_receiver() {
        let me = Uuid::new_v4();
        let mut f = frame(Operation::SyncConvos, "");
        f.id = None;
        f.body = None;
        let plan = plan(f, me).unwrap();
        assert_eq!(plan.route, Route::Correspondents);
        assert_eq!(plan.mutation, None);
    }
}
