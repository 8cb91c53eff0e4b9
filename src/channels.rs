use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::presence::ConnId;

/// A logical pub/sub topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelId {
    /// Every member of a room.
    Room(i64),
    /// One specific connection.
    Conn(ConnId),
    /// Every connection on every worker.
    Broadcast,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Room(id) => write!(f, "room:{id}"),
            ChannelId::Conn(conn) => write!(f, "conn:{conn}"),
            ChannelId::Broadcast => write!(f, "broadcast"),
        }
    }
}

type Queue = mpsc::Sender<Arc<String>>;

/// Fire-and-forget fan-out of frames to channel subscribers.
///
/// Each connection binds its outbound queue once, then subscribes to any
/// number of channels. Publishing serializes the frame once and pushes the
/// same `Arc` into every subscriber's queue; a full or closed queue drops
/// the frame for that subscriber only.
pub struct ChannelRouter {
    queues: RwLock<HashMap<ConnId, Queue>>,
    topics: RwLock<HashMap<ChannelId, HashSet<ConnId>>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub async fn bind(&self, conn: ConnId, queue: Queue) {
        self.queues.write().await.insert(conn, queue);
    }

    /// Drop the queue binding. Safe to call for a never-bound connection.
    pub async fn unbind(&self, conn: &ConnId) {
        self.queues.write().await.remove(conn);
    }

    pub async fn subscribe(&self, conn: &ConnId, channels: &[ChannelId]) {
        let mut topics = self.topics.write().await;
        for channel in channels {
            topics.entry(channel.clone()).or_default().insert(conn.clone());
        }
    }

    /// Idempotent: unsubscribing twice, or a connection that never
    /// subscribed, is a no-op.
    pub async fn unsubscribe(&self, conn: &ConnId, channels: &[ChannelId]) {
        let mut topics = self.topics.write().await;
        for channel in channels {
            if let Some(subs) = topics.get_mut(channel) {
                subs.remove(conn);
                if subs.is_empty() {
                    topics.remove(channel);
                }
            }
        }
    }

    /// Serialize once, fan out to every subscriber of `channel`. No
    /// acknowledgement; slow subscribers lose the frame, not the connection.
    pub async fn publish(&self, channel: &ChannelId, frame: &Value) {
        let text = match serde_json::to_string(frame) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                warn!(%channel, error = %e, "failed to serialize frame");
                return;
            }
        };
        let topics = self.topics.read().await;
        let Some(subs) = topics.get(channel) else {
            debug!(%channel, "publish to channel with no subscribers");
            return;
        };
        let queues = self.queues.read().await;
        for conn in subs {
            let Some(queue) = queues.get(conn) else {
                continue;
            };
            match queue.try_send(Arc::clone(&text)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%conn, %channel, "dropping frame for slow subscriber");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(%conn, %channel, "dropping frame for closed subscriber");
                }
            }
        }
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.topics.read().await.get(channel).map_or(0, HashSet::len)
    }
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::new()
    }
}
