use std::sync::Arc;

use crate::store::{SharedStore, StoreError, SESSIONS_KEY};

/// Lookup of opaque session tokens in the shared store. Session issuance
/// happens elsewhere; this core only resolves and consumes tokens.
pub struct SessionMap {
    store: Arc<dyn SharedStore>,
}

impl SessionMap {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, token: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .store
            .hget(SESSIONS_KEY, token)
            .await?
            .and_then(|id| id.parse().ok()))
    }

    pub async fn insert(&self, token: &str, user_id: i64) -> Result<(), StoreError> {
        self.store
            .hset(SESSIONS_KEY, token, &user_id.to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn resolves_known_tokens() {
        let sessions = SessionMap::new(Arc::new(MemoryStore::default()));
        sessions.insert("deadbeef", 7).await.unwrap();
        assert_eq!(sessions.resolve("deadbeef").await.unwrap(), Some(7));
        assert_eq!(sessions.resolve("stale").await.unwrap(), None);
    }
}
