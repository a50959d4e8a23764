use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use tidings_db::ConversationStore;
use tidings_types::{Frame, Operation};

use crate::error::Result;
use crate::registry::{Offer, Registry};

/// Fans Online, Offline and SyncConvos signals out to a user's
/// correspondents that currently hold a live session.
#[derive(Clone)]
pub struct Presence {
    conversations: Arc<dyn ConversationStore>,
    registry: Registry,
}

impl Presence {
    pub fn new(conversations: Arc<dyn ConversationStore>, registry: Registry) -> Self {
        Self {
            conversations,
            registry,
        }
    }

    /// Returns how many peers the signal was queued for.
    pub async fn broadcast(&self, user_id: Uuid, operation: Operation) -> Result<usize> {
        let store = self.conversations.clone();
        let peers = tokio::task::spawn_blocking(move || store.list_for(user_id)).await??;

        let mut queued = 0;
        for peer in peers {
            let Some(session) = self.registry.lookup(peer.peer_id) else {
                continue;
            };
            if session.offer(Frame::signal(operation, user_id, peer.peer_id)) == Offer::Queued {
                queued += 1;
            }
        }

        debug!(user_id = %user_id, op = %operation, queued, "presence broadcast");
        Ok(queued)
    }
}
