use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, Stream, StreamExt};
use tokio::task::JoinHandle;
use uuid::Uuid;

use tidings_db::{ConversationStore, Database, MessageStore, UserStore};

use crate::error::Result;
use crate::presence::Presence;
use crate::processor::{Processor, RetryPolicy};
use crate::registry::{Admission, Registry, SessionHandle};
use crate::session;
use crate::supervisor::Supervisor;

/// The stores the broker talks to.
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub users: Arc<dyn UserStore>,
    pub conversations: Arc<dyn ConversationStore>,
}

impl Stores {
    /// Every store backed by one SQLite database.
    pub fn from_database(db: Arc<Database>) -> Self {
        Self {
            messages: db.clone(),
            users: db.clone(),
            conversations: db,
        }
    }
}

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub write_timeout: Duration,
    /// Writer pacing: at most `burst` frames per `burst_window`.
    pub burst: u32,
    pub burst_window: Duration,
    pub heartbeat: Duration,
    /// How long teardown waits for the reader or writer before aborting it.
    pub join_grace: Duration,
    pub persist_attempts: u32,
    pub persist_backoff: Duration,
    pub last_online_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            write_timeout: Duration::from_secs(2),
            burst: 10,
            burst_window: Duration::from_millis(100),
            heartbeat: Duration::from_secs(15),
            join_grace: Duration::from_secs(5),
            persist_attempts: 5,
            persist_backoff: Duration::from_millis(50),
            last_online_attempts: 5,
        }
    }
}

/// Root object of the real-time side: owns the registry, the processor,
/// presence fan-out and the supervisor every session runs under.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    registry: Registry,
    processor: Processor,
    presence: Presence,
    supervisor: Supervisor,
    stores: Stores,
    config: SessionConfig,
}

impl Broker {
    pub fn new(stores: Stores, supervisor: Supervisor, config: SessionConfig) -> Self {
        let registry = Registry::new(config.queue_capacity, supervisor.shutdown_token().clone());
        let presence = Presence::new(stores.conversations.clone(), registry.clone());
        let processor = Processor::new(
            stores.clone(),
            registry.clone(),
            presence.clone(),
            RetryPolicy {
                attempts: config.persist_attempts.max(1),
                backoff: config.persist_backoff,
            },
        );

        Self {
            inner: Arc::new(BrokerInner {
                registry,
                processor,
                presence,
                supervisor,
                stores,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn processor(&self) -> &Processor {
        &self.inner.processor
    }

    pub fn presence(&self) -> &Presence {
        &self.inner.presence
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Reserves the user's single session slot.
    pub fn admit(&self, user_id: Uuid) -> Result<Admission> {
        self.inner.registry.admit(user_id)
    }

    /// Gives back a slot whose connection never materialised.
    pub fn release(&self, handle: &SessionHandle) {
        handle.cancel_token().cancel();
        self.inner.registry.remove(handle);
    }

    /// Runs an admitted session over an upgraded websocket.
    pub fn spawn_session(&self, admission: Admission, socket: WebSocket) -> JoinHandle<Option<()>> {
        let (sink, stream) = socket.split();
        self.serve(admission, stream, sink)
    }

    /// Runs an admitted session over any websocket-shaped transport.
    pub fn serve<S, K, E>(&self, admission: Admission, stream: S, sink: K) -> JoinHandle<Option<()>>
    where
        S: Stream<Item = std::result::Result<Message, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
        K: Sink<Message> + Send + Unpin + 'static,
        K::Error: Display + Send,
    {
        self.inner
            .supervisor
            .spawn("session", session::run(self.clone(), admission, stream, sink))
    }
}
