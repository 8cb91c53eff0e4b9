pub mod channels;
pub mod chat;
pub mod config;
pub mod error;
pub mod models;
pub mod presence;
pub mod reconcile;
pub mod repo;
pub mod sessions;
pub mod store;

use std::sync::Arc;

use serde_json::Value;
use sqlx::SqlitePool;

pub use error::ChatError;

use channels::ChannelRouter;
use chat::dispatch::DispatchTable;
use config::Config;
use presence::PresenceTracker;
use repo::Repo;
use sessions::SessionMap;
use store::SharedStore;

/// Shared application state. Everything in here is either cheaply cloneable
/// or behind an `Arc`, so handlers clone freely.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub store: Arc<dyn SharedStore>,
    pub router: Arc<ChannelRouter>,
    pub dispatch: Arc<DispatchTable>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, store: Arc<dyn SharedStore>, config: Arc<Config>) -> Self {
        Self {
            db_pool,
            store,
            router: Arc::new(ChannelRouter::new()),
            dispatch: Arc::new(DispatchTable::new()),
            config,
        }
    }

    pub fn repo(&self) -> Repo {
        Repo::new(self.db_pool.clone())
    }

    pub fn presence(&self) -> PresenceTracker {
        PresenceTracker::new(Arc::clone(&self.store))
    }

    pub fn sessions(&self) -> SessionMap {
        SessionMap::new(Arc::clone(&self.store))
    }
}

/// Typed field access on loosely structured frames. A missing or mistyped
/// field is a protocol violation, not a crash.
pub trait GetField {
    fn get_str_field(&self, name: &str) -> Result<String, ChatError>;
    fn get_i64_field(&self, name: &str) -> Result<i64, ChatError>;
}

impl GetField for Value {
    fn get_str_field(&self, name: &str) -> Result<String, ChatError> {
        self.get(name)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ChatError::Protocol(format!("expected field {name} to be a string")))
    }

    fn get_i64_field(&self, name: &str) -> Result<i64, ChatError> {
        self.get(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| ChatError::Protocol(format!("expected field {name} to be an integer")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_access_distinguishes_missing_from_mistyped() {
        let frame = json!({"content": "hi", "id": 7, "count": "many"});
        assert_eq!(frame.get_str_field("content").unwrap(), "hi");
        assert_eq!(frame.get_i64_field("id").unwrap(), 7);
        assert!(frame.get_str_field("absent").is_err());
        assert!(frame.get_i64_field("count").is_err());
        assert!(frame.get_str_field("id").is_err());
    }
}
