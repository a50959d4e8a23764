use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use tidings_types::ServerFrame;

use crate::error::{GatewayError, Result};

/// Why a session ended, as reported in the close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    GoingAway,
    TooSlow,
    /// The peer vanished; no close frame can be sent.
    Abnormal,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::GoingAway => 1001,
            CloseReason::TooSlow => 1008,
            CloseReason::Abnormal => 1006,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::Normal => "",
            CloseReason::GoingAway => "server shutting down",
            CloseReason::TooSlow => "connection too slow to keep up with messages",
            CloseReason::Abnormal => "",
        }
    }

    /// 1006 is reserved for "no close frame received" and is never sent.
    pub fn sends_frame(self) -> bool {
        !matches!(self, CloseReason::Abnormal)
    }
}

/// Outcome of a non-blocking offer into a session queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// No live session: not yet past replay, already closing, or gone.
    Offline,
    /// The queue was full; the session has been told to close.
    TooSlow,
}

/// Cheap, cloneable reference to one admitted session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    user_id: Uuid,
    conn_id: Uuid,
    tx: mpsc::Sender<ServerFrame>,
    /// Request scope: a child of the global shutdown token.
    cancel: CancellationToken,
    close: OnceLock<CloseReason>,
    live: AtomicBool,
    accepted_at: DateTime<Utc>,
}

impl SessionHandle {
    pub fn user_id(&self) -> Uuid {
        self.inner.user_id
    }

    pub fn conn_id(&self) -> Uuid {
        self.inner.conn_id
    }

    pub fn accepted_at(&self) -> DateTime<Utc> {
        self.inner.accepted_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Live once replay has finished. Relays are only offered to live sessions.
    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire) && !self.inner.cancel.is_cancelled()
    }

    pub(crate) fn go_live(&self) {
        self.inner.live.store(true, Ordering::Release);
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<ServerFrame> {
        &self.inner.tx
    }

    /// Never blocks. A full queue trips the slow-consumer breaker.
    pub fn offer(&self, frame: impl Into<ServerFrame>) -> Offer {
        if !self.is_live() {
            return Offer::Offline;
        }
        match self.inner.tx.try_send(frame.into()) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => {
                self.close_slow();
                Offer::TooSlow
            }
            Err(TrySendError::Closed(_)) => Offer::Offline,
        }
    }

    /// Records `reason` unless one was already recorded, then cancels the
    /// request scope.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.inner.close.set(reason);
        self.inner.cancel.cancel();
    }

    pub fn close_slow(&self) {
        warn!(user_id = %self.inner.user_id, "outbound queue full, closing slow session");
        self.close(CloseReason::TooSlow);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close.get().copied()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("user_id", &self.inner.user_id)
            .field("conn_id", &self.inner.conn_id)
            .field("live", &self.is_live())
            .finish()
    }
}

/// A freshly admitted session: the handle others offer into, and the queue
/// its writer drains.
pub struct Admission {
    pub handle: SessionHandle,
    pub outbound: mpsc::Receiver<ServerFrame>,
}

/// Map of user id to the single live session of that user.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
    capacity: usize,
    shutdown: CancellationToken,
}

impl Registry {
    pub fn new(capacity: usize, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                shutdown,
            }),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, SessionHandle>> {
        // Every critical section is a single map operation, so a panic
        // elsewhere cannot leave the map half-written.
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn admit(&self, user_id: Uuid) -> Result<Admission> {
        let mut sessions = self.sessions();
        if sessions.contains_key(&user_id) {
            return Err(GatewayError::AlreadySubscribed);
        }

        let (tx, outbound) = mpsc::channel(self.inner.capacity);
        let handle = SessionHandle {
            inner: Arc::new(HandleInner {
                user_id,
                conn_id: Uuid::new_v4(),
                tx,
                cancel: self.inner.shutdown.child_token(),
                close: OnceLock::new(),
                live: AtomicBool::new(false),
                accepted_at: Utc::now(),
            }),
        };
        sessions.insert(user_id, handle.clone());
        drop(sessions);

        info!(user_id = %user_id, conn_id = %handle.conn_id(), "session admitted");
        Ok(Admission { handle, outbound })
    }

    pub fn lookup(&self, user_id: Uuid) -> Option<SessionHandle> {
        self.sessions().get(&user_id).cloned()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.lookup(user_id).is_some_and(|h| h.is_live())
    }

    /// Removes the entry only while it still belongs to `handle`.
    pub fn remove(&self, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(&handle.user_id()) {
            Some(current) if current.conn_id() == handle.conn_id() => {
                sessions.remove(&handle.user_id());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
