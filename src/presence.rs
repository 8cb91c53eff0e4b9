use std::fmt;
use std::sync::Arc;

use rand::{distr::Alphanumeric, Rng};
use tracing::warn;

use crate::store::{SharedStore, StoreError, ONLINE_KEY};

const NONCE_LEN: usize = 8;

/// Identity of one live websocket, printable as `"{user_id}:{nonce}"`.
///
/// The nonce comes from the client when it reconnects a tab (so the same tab
/// keeps the same identity across drops) and is generated fresh otherwise.
/// Never persisted past the connection's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub user_id: i64,
    pub nonce: String,
}

impl ConnId {
    /// Derive an identity from the user and an optional client-supplied
    /// nonce. A malformed nonce is replaced rather than rejected.
    pub fn issue(user_id: i64, requested: Option<&str>) -> Self {
        let nonce = match requested {
            Some(n) if !n.is_empty() && n.len() <= 32 && n.chars().all(|c| c.is_ascii_alphanumeric()) => {
                n.to_owned()
            }
            _ => rand::rng()
                .sample_iter(&Alphanumeric)
                .take(NONCE_LEN)
                .map(char::from)
                .collect(),
        };
        Self { user_id, nonce }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (user, nonce) = s.split_once(':')?;
        if nonce.is_empty() {
            return None;
        }
        Some(Self {
            user_id: user.parse().ok()?,
            nonce: nonce.to_owned(),
        })
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.nonce)
    }
}

/// Tracks which connections are live in the shared online set and derives
/// per-user online/offline state from it.
pub struct PresenceTracker {
    store: Arc<dyn SharedStore>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Returns false if the identity was already registered, which means the
    /// client is re-claiming a nonce the core still considers live.
    pub async fn register(&self, conn: &ConnId) -> Result<bool, StoreError> {
        self.store.sadd(ONLINE_KEY, &conn.to_string()).await
    }

    pub async fn unregister(&self, conn: &ConnId) -> Result<bool, StoreError> {
        self.store.srem(ONLINE_KEY, &conn.to_string()).await
    }

    /// One scan of the online set: whether `user_id` has any live connection
    /// other than `excluding`, plus the deduplicated online user ids.
    ///
    /// The scan is a single store command, so against a store that executes
    /// commands serially it reflects every registration issued before it on
    /// this connection.
    pub async fn status(
        &self,
        user_id: i64,
        excluding: &ConnId,
    ) -> Result<(bool, Vec<i64>), StoreError> {
        let members = self.store.smembers(ONLINE_KEY).await?;
        let mut online = Vec::new();
        let mut elsewhere = false;
        for member in &members {
            let Some(conn) = ConnId::parse(member) else {
                warn!(member, "skipping malformed entry in online set");
                continue;
            };
            if !online.contains(&conn.user_id) {
                online.push(conn.user_id);
            }
            if conn.user_id == user_id && conn != *excluding {
                elsewhere = true;
            }
        }
        online.sort_unstable();
        Ok((elsewhere, online))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(Arc::new(MemoryStore::default()))
    }

    #[test]
    fn conn_id_round_trips() {
        let conn = ConnId::issue(7, Some("abc123"));
        assert_eq!(conn.to_string(), "7:abc123");
        assert_eq!(ConnId::parse("7:abc123"), Some(conn));
        assert_eq!(ConnId::parse("garbage"), None);
        assert_eq!(ConnId::parse("x:y"), None);
        assert_eq!(ConnId::parse("7:"), None);
    }

    #[test]
    fn bad_nonces_are_replaced() {
        let conn = ConnId::issue(7, Some("has:colon"));
        assert_ne!(conn.nonce, "has:colon");
        assert_eq!(conn.nonce.len(), NONCE_LEN);
        let conn = ConnId::issue(7, None);
        assert_eq!(conn.nonce.len(), NONCE_LEN);
    }

    #[tokio::test]
    async fn single_connection_is_not_online_elsewhere() {
        let presence = tracker();
        let conn = ConnId::issue(1, None);
        assert!(presence.register(&conn).await.unwrap());
        let (elsewhere, online) = presence.status(1, &conn).await.unwrap();
        assert!(!elsewhere);
        assert_eq!(online, vec![1]);
    }

    #[tokio::test]
    async fn second_connection_sees_the_first() {
        let presence = tracker();
        let first = ConnId::issue(1, Some("aaaa"));
        let second = ConnId::issue(1, Some("bbbb"));
        presence.register(&first).await.unwrap();
        presence.register(&second).await.unwrap();

        let (elsewhere, online) = presence.status(1, &second).await.unwrap();
        assert!(elsewhere);
        assert_eq!(online, vec![1]);

        // closing the first of two leaves the user online
        presence.unregister(&first).await.unwrap();
        let (elsewhere, _) = presence.status(1, &first).await.unwrap();
        assert!(elsewhere);

        // closing the last does not
        presence.unregister(&second).await.unwrap();
        let (elsewhere, online) = presence.status(1, &second).await.unwrap();
        assert!(!elsewhere);
        assert!(online.is_empty());
    }

    #[tokio::test]
    async fn users_are_deduplicated_in_the_roster() {
        let presence = tracker();
        presence.register(&ConnId::issue(1, Some("aaaa"))).await.unwrap();
        presence.register(&ConnId::issue(1, Some("bbbb"))).await.unwrap();
        presence.register(&ConnId::issue(2, Some("cccc"))).await.unwrap();
        let (_, online) = presence.status(2, &ConnId::issue(2, Some("cccc"))).await.unwrap();
        assert_eq!(online, vec![1, 2]);
    }

    #[tokio::test]
    async fn register_reports_reclaimed_nonces() {
        let presence = tracker();
        let conn = ConnId::issue(1, Some("aaaa"));
        assert!(presence.register(&conn).await.unwrap());
        assert!(!presence.register(&conn).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let store = Arc::new(MemoryStore::default());
        store.sadd(ONLINE_KEY, "not-a-conn-id").await.unwrap();
        let presence = PresenceTracker::new(store);
        let conn = ConnId::issue(1, None);
        presence.register(&conn).await.unwrap();
        let (_, online) = presence.status(1, &conn).await.unwrap();
        assert_eq!(online, vec![1]);
    }
}
