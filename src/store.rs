use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;

/// Set holding the conn ids of every live websocket, across all workers.
pub const ONLINE_KEY: &str = "online";
/// Hash mapping session tokens to user ids.
pub const SESSIONS_KEY: &str = "sessions";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Client to the store shared by all worker processes.
///
/// The online set and the session map live here, not in process memory, so
/// every mutation goes through the store's atomic primitives. Implementations
/// must execute commands one at a time per client, which is what makes
/// register-then-scan read its own write.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Add `member` to the set at `key`. Returns false if it was already there.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Remove `member` from the set at `key`. Returns false if it wasn't there.
    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Whether the store connection still has an operation in flight.
    /// Teardown polls this before releasing the connection.
    fn in_progress(&self) -> bool {
        false
    }
}

/// Single-worker store. Good enough for one process; run the redis store to
/// share presence across workers.
#[derive(Default)]
pub struct MemoryStore {
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.sets.lock().entry(key.to_owned()).or_default().insert(member.to_owned()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .sets
            .lock()
            .get_mut(key)
            .is_some_and(|set| set.remove(member)))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sets
            .lock()
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .hashes
            .lock()
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.hashes
            .lock()
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
        Ok(())
    }
}

pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sadd_reports_new_members() {
        let store = MemoryStore::default();
        assert!(store.sadd(ONLINE_KEY, "1:abc").await.unwrap());
        assert!(!store.sadd(ONLINE_KEY, "1:abc").await.unwrap());
        assert_eq!(store.smembers(ONLINE_KEY).await.unwrap(), vec!["1:abc"]);
    }

    #[tokio::test]
    async fn srem_is_idempotent() {
        let store = MemoryStore::default();
        store.sadd(ONLINE_KEY, "1:abc").await.unwrap();
        assert!(store.srem(ONLINE_KEY, "1:abc").await.unwrap());
        assert!(!store.srem(ONLINE_KEY, "1:abc").await.unwrap());
        assert!(!store.srem("no-such-set", "1:abc").await.unwrap());
    }

    #[tokio::test]
    async fn hashes_round_trip() {
        let store = MemoryStore::default();
        assert_eq!(store.hget(SESSIONS_KEY, "tok").await.unwrap(), None);
        store.hset(SESSIONS_KEY, "tok", "42").await.unwrap();
        assert_eq!(
            store.hget(SESSIONS_KEY, "tok").await.unwrap().as_deref(),
            Some("42")
        );
    }
}
