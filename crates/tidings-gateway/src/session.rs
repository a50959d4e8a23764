//! One admitted connection: open, replay, run the reader and writer, tear
//! down.
//!
//! The transport is any `Stream`/`Sink` pair of websocket messages, so the
//! broker can be driven over an in-memory pipe in tests exactly as it is
//! over an upgraded axum socket.

use std::collections::HashSet;
use std::fmt::Display;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tidings_db::{StoreError, UserField, UserStore};
use tidings_types::{Frame, Operation, ServerFrame, ValidationError};

use crate::broker::{Broker, SessionConfig};
use crate::error::Result;
use crate::registry::{Admission, CloseReason, SessionHandle};
use crate::throttle::Throttle;

pub(crate) async fn run<S, K, E>(broker: Broker, admission: Admission, stream: S, sink: K)
where
    S: Stream<Item = std::result::Result<Message, E>> + Send + Unpin + 'static,
    E: Display + Send + 'static,
    K: Sink<Message> + Send + Unpin + 'static,
    K::Error: Display + Send,
{
    let Admission { handle, outbound } = admission;
    let user_id = handle.user_id();
    let config = broker.config().clone();

    if let Err(e) = record_last_online(&broker, &handle, None).await {
        warn!(user_id = %user_id, error = %e, "could not mark user online");
    }
    if let Err(e) = broker.presence().broadcast(user_id, Operation::Online).await {
        warn!(user_id = %user_id, error = %e, "online broadcast failed");
    }

    let pong = Arc::new(AtomicBool::new(true));
    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound,
        handle.clone(),
        pong.clone(),
        config.clone(),
    ));

    let sent = match replay(&broker, &handle, HashSet::new()).await {
        Ok(sent) => {
            debug!(user_id = %user_id, count = sent.len(), "replay finished");
            Some(sent)
        }
        Err(e) => {
            error!(user_id = %user_id, error = %e, "replay failed");
            handle.close(CloseReason::Abnormal);
            None
        }
    };

    handle.go_live();

    // Rows stored while the first pass ran were offered to a session that
    // was not live yet; pick them up now.
    if let Some(sent) = sent {
        let before = sent.len();
        match replay(&broker, &handle, sent).await {
            Ok(sent) => debug!(user_id = %user_id, count = sent.len() - before, "catch-up finished"),
            Err(e) => {
                error!(user_id = %user_id, error = %e, "catch-up replay failed");
                handle.close(CloseReason::Abnormal);
            }
        }
    }
    let mut reader = tokio::spawn(read_loop(stream, broker.clone(), handle.clone(), pong));
    info!(user_id = %user_id, conn_id = %handle.conn_id(), "session live");

    let sink = tokio::select! {
        out = &mut writer => {
            handle.cancel_token().cancel();
            join_within(&mut reader, config.join_grace).await;
            out.ok().flatten()
        }
        _ = &mut reader => {
            handle.cancel_token().cancel();
            join_within(&mut writer, config.join_grace).await.flatten()
        }
    };

    let reason = handle.close_reason().unwrap_or(if broker.supervisor().is_shutting_down() {
        CloseReason::GoingAway
    } else {
        CloseReason::Normal
    });

    if let Err(e) = broker.presence().broadcast(user_id, Operation::Offline).await {
        warn!(user_id = %user_id, error = %e, "offline broadcast failed");
    }
    broker.registry().remove(&handle);
    if let Err(e) = record_last_online(&broker, &handle, Some(Utc::now())).await {
        warn!(user_id = %user_id, error = %e, "could not record last online");
    }

    if let Some(mut sink) = sink.filter(|_| reason.sends_frame()) {
        let close = Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: Utf8Bytes::from_static(reason.reason()),
        }));
        match tokio::time::timeout(config.write_timeout, sink.send(close)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(user_id = %user_id, error = %e, "close frame not sent"),
            Err(_) => debug!(user_id = %user_id, "close frame timed out"),
        }
    }

    info!(user_id = %user_id, code = reason.code(), "session closed");
}

/// Waits for `task` up to `grace`, aborting it if it overstays.
async fn join_within<T>(task: &mut JoinHandle<T>, grace: Duration) -> Option<T> {
    match tokio::time::timeout(grace, &mut *task).await {
        Ok(Ok(out)) => Some(out),
        Ok(Err(e)) => {
            error!(error = %e, "session task failed");
            None
        }
        Err(_) => {
            warn!("session task did not stop in time, aborting");
            task.abort();
            None
        }
    }
}

/// Drains the outbound queue onto the socket. Hands the sink back when the
/// session is cancelled so teardown can still send a close frame; a broken
/// socket yields `None`.
async fn write_loop<K>(
    mut sink: K,
    mut outbound: mpsc::Receiver<ServerFrame>,
    handle: SessionHandle,
    pong: Arc<AtomicBool>,
    config: SessionConfig,
) -> Option<K>
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let cancel = handle.cancel_token().clone();
    let _guard = cancel.clone().drop_guard();
    let user_id = handle.user_id();

    let mut throttle = Throttle::new(config.burst, config.burst_window);
    let start = tokio::time::Instant::now() + config.heartbeat;
    let mut heartbeat = tokio::time::interval_at(start, config.heartbeat);
    let mut missed: u8 = 0;

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Some(sink),
            next = outbound.recv() => {
                let Some(frame) = next else {
                    return Some(sink);
                };
                throttle.acquire().await;
                match serde_json::to_string(&frame) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        error!(user_id = %user_id, error = %e, "unserializable frame");
                        continue;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if pong.swap(false, Ordering::AcqRel) {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= 2 {
                        warn!(user_id = %user_id, missed, "heartbeat timeout, dropping connection");
                        handle.close(CloseReason::Abnormal);
                        return None;
                    }
                }
                Message::Ping(Bytes::new())
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Some(sink),
            sent = tokio::time::timeout(config.write_timeout, sink.send(msg)) => match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(user_id = %user_id, error = %e, "write failed");
                    handle.close(CloseReason::Abnormal);
                    return None;
                }
                Err(_) => {
                    warn!(user_id = %user_id, "write timed out");
                    handle.close(CloseReason::Abnormal);
                    return None;
                }
            },
        }
    }
}

/// Feeds inbound frames to the processor, one at a time and in order.
async fn read_loop<S, E>(mut stream: S, broker: Broker, handle: SessionHandle, pong: Arc<AtomicBool>)
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let cancel = handle.cancel_token().clone();
    let _guard = cancel.clone().drop_guard();
    let user_id = handle.user_id();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                let frame = match serde_json::from_str::<Frame>(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(user_id = %user_id, error = %e, "malformed frame");
                        handle.offer(ServerFrame::Error(ValidationError::single(
                            "frame",
                            e.to_string(),
                        )));
                        continue;
                    }
                };

                let processor = broker.processor().clone();
                let session = handle.clone();
                let done = broker
                    .supervisor()
                    .spawn("process-frame", async move {
                        processor.handle(&session, frame).await
                    })
                    .await;
                if !matches!(done, Ok(Some(()))) {
                    error!(user_id = %user_id, "frame handler died, terminating session");
                    break;
                }
            }
            Some(Ok(Message::Pong(_))) => pong.store(true, Ordering::Release),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(user_id = %user_id, error = %e, "read failed");
                handle.close(CloseReason::Abnormal);
                break;
            }
        }
    }
}

/// Pushes every pending row for this user into its own queue, bucket by
/// bucket, skipping rows already in `sent`. Blocks on the queue, so the
/// writer must already be running. Returns `sent` with the new rows added.
async fn replay(
    broker: &Broker,
    handle: &SessionHandle,
    mut sent: HashSet<(Uuid, Operation)>,
) -> Result<HashSet<(Uuid, Operation)>> {
    let messages = broker.stores().messages.clone();
    let tx = handle.sender().clone();
    let cancel = handle.cancel_token().clone();
    let user_id = handle.user_id();

    let sent = tokio::task::spawn_blocking(move || -> std::result::Result<_, StoreError> {
        for op in Operation::REPLAY_ORDER {
            if cancel.is_cancelled() {
                break;
            }
            messages.stream_undelivered(user_id, op, &mut |msg| {
                if cancel.is_cancelled() {
                    return ControlFlow::Break(());
                }
                if !sent.insert((msg.id, msg.operation)) {
                    return ControlFlow::Continue(());
                }
                match tx.blocking_send(ServerFrame::from(Frame::from(msg))) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(_) => ControlFlow::Break(()),
                }
            })?;
        }
        Ok(sent)
    })
    .await??;

    Ok(sent)
}

/// Sets `last_online` (None means online now), re-reading the user on
/// version conflicts. Going offline never overwrites a newer session of the
/// same user.
async fn record_last_online(
    broker: &Broker,
    handle: &SessionHandle,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    let users = broker.stores().users.clone();
    let attempts = broker.config().last_online_attempts.max(1);
    let registry = broker.registry().clone();
    let user_id = handle.user_id();
    let conn_id = handle.conn_id();

    tokio::task::spawn_blocking(move || {
        let superseded = || {
            registry
                .lookup(user_id)
                .is_some_and(|h| h.conn_id() != conn_id)
        };
        set_last_online(users.as_ref(), user_id, at, attempts, &superseded)
    })
    .await??;
    Ok(())
}

fn set_last_online(
    users: &dyn UserStore,
    user_id: Uuid,
    at: Option<DateTime<Utc>>,
    attempts: u32,
    superseded: &dyn Fn() -> bool,
) -> std::result::Result<(), StoreError> {
    let mut attempt = 1;
    loop {
        let mut user = users.get_by(UserField::Id(user_id))?;
        // Checked after the read: a newer session admitted later bumps the
        // version and sends us round again.
        if at.is_some() && superseded() {
            return Ok(());
        }
        user.last_online = at;
        match users.update(&mut user) {
            Ok(()) => return Ok(()),
            Err(StoreError::Conflict) if attempt < attempts => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tidings_db::Database;

    #[test]
    fn last_online_keeps_concurrent_edits() {
        let db = Database::open_in_memory().unwrap();
        let id = db.register("Alice", "alice@example.com", b"pw").unwrap();

        // Another writer has already moved the version on.
        let mut other = db.get_by(UserField::Id(id)).unwrap();
        other.name = "Alicia".into();
        db.update(&mut other).unwrap();

        let now = Utc::now();
        set_last_online(&db, id, Some(now), 5, &|| false).unwrap();
        let user = db.get_by(UserField::Id(id)).unwrap();
        assert_eq!(user.name, "Alicia");
        assert_eq!(
            user.last_online.map(|t| t.timestamp_micros()),
            Some(now.timestamp_micros())
        );

        set_last_online(&db, id, None, 5, &|| true).unwrap();
        assert_eq!(db.get_by(UserField::Id(id)).unwrap().last_online, None);
    }

    #[test]
    fn going_offline_yields_to_a_newer_session() {
        let db = Database::open_in_memory().unwrap();
        let id = db.register("Alice", "alice@example.com", b"pw").unwrap();

        set_last_online(&db, id, Some(Utc::now()), 5, &|| true).unwrap();
        assert_eq!(db.get_by(UserField::Id(id)).unwrap().last_online, None);
    }

    #[test]
    fn reconnect_between_read_and_write_keeps_user_online() {
        let db = Database::open_in_memory().unwrap();
        let id = db.register("Alice", "alice@example.com", b"pw").unwrap();
        let mut user = db.get_by(UserField::Id(id)).unwrap();
        user.last_online = Some(Utc::now());
        db.update(&mut user).unwrap();

        // The new session is admitted just after the first check and marks
        // the user online before the old teardown writes.
        let checks = AtomicUsize::new(0);
        let superseded = || {
            if checks.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut fresh = db.get_by(UserField::Id(id)).unwrap();
                fresh.last_online = None;
                db.update(&mut fresh).unwrap();
                false
            } else {
                true
            }
        };

        set_last_online(&db, id, Some(Utc::now()), 5, &superseded).unwrap();
        assert_eq!(checks.load(Ordering::SeqCst), 2);
        assert_eq!(db.get_by(UserField::Id(id)).unwrap().last_online, None);
    }

    #[test]
    fn missing_user_is_not_retried() {
        let db = Database::open_in_memory().unwrap();
        let err = set_last_online(&db, Uuid::new_v4(), None, 5, &|| false).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }
}
