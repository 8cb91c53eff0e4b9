use crate::store::StoreError;

/// Errors raised inside a websocket connection.
///
/// `Rejected` closes the socket before it ever becomes active. `Protocol` is
/// answered with a growl frame to the offending client and the connection
/// stays up. Everything else is a collaborator failure and aborts the
/// in-flight operation.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Protocol(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
