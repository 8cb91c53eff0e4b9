use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::{AppState, ChatError};

use super::session::{ConnectParams, ConnectionSession};

/// Private-range close code sent when the session token is rejected.
const SESSION_REJECTED: u16 = 4403;

const OUTBOUND_QUEUE: usize = 256;

/// Connection URL parameters. `id` is the reconnection nonce, `messages` the
/// comma-separated ids the client already holds.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    session_id: Option<String>,
    id: Option<String>,
    history: Option<String>,
    messages: Option<String>,
}

impl ConnectQuery {
    fn into_params(self) -> ConnectParams {
        ConnectParams {
            session_id: self.session_id,
            nonce: self.id,
            history: matches!(self.history.as_deref(), Some("1") | Some("true")),
            known_ids: self
                .messages
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .filter_map(|id| id.parse().ok())
                .collect(),
        }
    }
}

pub async fn chat_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.into_params()))
}

async fn handle_socket(socket: WebSocket, state: AppState, params: ConnectParams) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(OUTBOUND_QUEUE);
    let mut session = ConnectionSession::new(state, tx);

    if let Err(e) = session.open(&params).await {
        match e {
            ChatError::Rejected(reason) => {
                info!(reason, "rejecting connection");
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: SESSION_REJECTED,
                        reason: reason.into(),
                    })))
                    .await;
            }
            e => {
                error!(error = %e, "failed to open connection");
                let _ = sink.close().await;
            }
        }
        session.close().await;
        return;
    }

    loop {
        tokio::select! {
            frame = rx.recv() => {
                // the queue closing means the session is gone
                let Some(frame) = frame else { break };
                if sink
                    .send(Message::Text(frame.as_str().to_owned().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = session.handle_frame(text.as_str()).await {
                            error!(error = %e, "closing connection after handler failure");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }

    session.close().await;
}
