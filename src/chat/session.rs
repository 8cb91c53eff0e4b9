use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channels::ChannelId;
use crate::models::UserIdentity;
use crate::presence::ConnId;
use crate::reconcile::{ReconcileOptions, ReconciliationEngine};
use crate::{AppState, ChatError};

use super::frames::{self, InboundFrame};

/// Lifecycle of one socket. `Closing -> Closed` is the only way out of
/// `Active`; no transition skips a state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Authenticating,
    Active,
    Closing,
    Closed,
}

/// What the client handed us on the connection URL.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub session_id: Option<String>,
    /// Reconnection nonce; lets a tab keep its connection identity.
    pub nonce: Option<String>,
    pub history: bool,
    pub known_ids: Vec<i64>,
}

/// A frame on its way out. Anything structured gets one canonical
/// serialization; anything else must already be wire text.
pub enum Outbound {
    Frame(Value),
    Raw(String),
}

/// The per-socket state machine. Owns nothing but its identity and its
/// subscription set; everything shared lives behind `AppState`.
///
/// Frames are handled strictly one at a time: the reader loop in `ws.rs`
/// awaits `handle_frame` before taking the next frame off the socket.
pub struct ConnectionSession {
    state: SessionState,
    app: AppState,
    tx: mpsc::Sender<Arc<String>>,
    conn: Option<ConnId>,
    user: Option<UserIdentity>,
    channels: Vec<ChannelId>,
    restored: bool,
}

impl ConnectionSession {
    pub fn new(app: AppState, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            state: SessionState::Pending,
            app,
            tx,
            conn: None,
            user: None,
            channels: Vec::new(),
            restored: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn conn(&self) -> Option<&ConnId> {
        self.conn.as_ref()
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    pub fn restored(&self) -> bool {
        self.restored
    }

    pub(crate) fn app(&self) -> &AppState {
        &self.app
    }

    pub(crate) fn conn_ref(&self) -> Result<&ConnId, ChatError> {
        self.conn
            .as_ref()
            .ok_or_else(|| ChatError::Protocol("socket is not initialized yet".to_owned()))
    }

    pub(crate) fn user_ref(&self) -> Result<&UserIdentity, ChatError> {
        self.user
            .as_ref()
            .ok_or_else(|| ChatError::Protocol("socket is not initialized yet".to_owned()))
    }

    /// Bring the connection up. A `Rejected` error means the session token
    /// didn't resolve and the socket must close before ever being active;
    /// any other error is a collaborator failure and aborts the open.
    pub async fn open(&mut self, params: &ConnectParams) -> Result<(), ChatError> {
        self.state = SessionState::Authenticating;

        let token = params.session_id.as_deref().unwrap_or_default();
        let user_id = match token {
            "" => None,
            t => self.app.sessions().resolve(t).await?,
        };
        let Some(user_id) = user_id else {
            return Err(ChatError::Rejected(format!(
                "session key {token:?} has been rejected"
            )));
        };
        let Some(user) = self.app.repo().user(user_id).await? else {
            return Err(ChatError::Rejected(format!(
                "no user behind session key {token:?}"
            )));
        };

        let mut conn = ConnId::issue(user_id, params.nonce.as_deref());
        // Register before any online query, so every consumer in this open()
        // sees a snapshot that already includes this connection.
        let mut newly = self.app.presence().register(&conn).await?;

        // The client re-claimed a nonce the core still considers live. The
        // reference behavior computes this and then drops it, hence the
        // default-off toggle.
        let candidate = !newly && params.nonce.as_deref() == Some(conn.nonce.as_str());
        self.restored = candidate && self.app.config.restore_connections;

        // A live identity belongs to the socket that registered it. Unless
        // this connection restores that socket, it gets a fresh one, so the
        // stale teardown cannot strip the survivor's binding or presence.
        while !newly && !self.restored {
            conn = ConnId::issue(user_id, None);
            newly = self.app.presence().register(&conn).await?;
        }
        self.conn = Some(conn.clone());
        self.user = Some(user.clone());

        // registered above, so the scan already counts this connection
        let (was_online, online) = self.app.presence().status(user_id, &conn).await?;

        let mut rooms = self.app.repo().rooms_for_user(user_id).await?;
        let room_ids: Vec<i64> = rooms.iter().map(|r| r.room_id).collect();
        for (room_id, member) in self.app.repo().room_members(&room_ids).await? {
            if let Some(room) = rooms.iter_mut().find(|r| r.room_id == room_id) {
                room.users.push(member);
            }
        }

        let plan = ReconciliationEngine::new(self.app.repo())
            .reconcile(
                user_id,
                &ReconcileOptions {
                    history: params.history,
                    known_ids: params.known_ids.clone(),
                    was_online,
                    restored: self.restored,
                },
            )
            .await?;
        let mut missed = plan.missed;
        let mut history = plan.history;
        for room in &mut rooms {
            if let Some(batch) = missed.remove(&room.room_id) {
                room.missed_messages = batch;
            }
            if let Some(batch) = history.remove(&room.room_id) {
                room.history_messages = batch;
            }
        }

        let mut channels: Vec<ChannelId> =
            room_ids.iter().map(|id| ChannelId::Room(*id)).collect();
        channels.push(ChannelId::Conn(conn.clone()));
        channels.push(ChannelId::Broadcast);
        self.app.router.bind(conn.clone(), self.tx.clone()).await;
        self.app.router.subscribe(&conn, &channels).await;
        self.channels = channels;

        let roster = self.app.repo().roster(self.app.config.show_geo).await?;

        self.ws_write(Outbound::Frame(frames::set_rooms(&rooms, &roster, &online)))
            .await?;
        if !was_online {
            debug!(%conn, "first connection for user {user_id}, announcing login");
            self.app
                .router
                .publish(&ChannelId::Broadcast, &frames::online_login(&online, &user))
                .await;
        }

        info!(%conn, rooms = room_ids.len(), restored = self.restored, "connection open");
        self.state = SessionState::Active;
        Ok(())
    }

    /// Handle one inbound frame. Protocol violations are answered with a
    /// growl to this client only and leave the connection active;
    /// collaborator failures come back as `Err` and take the session down.
    pub async fn handle_frame(&mut self, raw: &str) -> Result<(), ChatError> {
        debug!("<< {:.1000}", raw);
        let mut js: Option<Value> = None;
        match self.dispatch_frame(raw, &mut js).await {
            Err(ChatError::Protocol(reason)) => {
                warn!(reason, "rejected frame");
                self.ws_write(Outbound::Frame(frames::growl(&reason, js)))
                    .await
            }
            other => other,
        }
    }

    async fn dispatch_frame(&mut self, raw: &str, js: &mut Option<Value>) -> Result<(), ChatError> {
        if self.state != SessionState::Active {
            return Err(ChatError::Protocol(format!(
                "skipping frame, socket is not initialized yet: {raw:.100}"
            )));
        }
        if raw.is_empty() {
            return Err(ChatError::Protocol("skipping empty frame".to_owned()));
        }
        let frame = InboundFrame::parse(raw)?;
        *js = frame.js_message_id.clone();
        let Some(handler) = self.app.dispatch.get(&frame.action) else {
            return Err(ChatError::Protocol(format!(
                "event {} is unknown",
                frame.action
            )));
        };
        // room-scoped events must stay inside the subscription set
        if let Some(room_id) = frame.room_id {
            if !self.channels.contains(&ChannelId::Room(room_id)) {
                return Err(ChatError::Protocol(format!(
                    "access denied for room {room_id}"
                )));
            }
        }
        handler(self, frame).await
    }

    /// Queue a frame for the writer task. A gone writer means the socket
    /// already closed under us, which is a race, not an error.
    pub async fn ws_write(&self, out: Outbound) -> Result<(), ChatError> {
        let text = match out {
            // serialization failure here is a bug in frame construction,
            // and it takes the session down rather than degrade quietly
            Outbound::Frame(frame) => serde_json::to_string(&frame)?,
            Outbound::Raw(text) => text,
        };
        debug!(">> {:.1000}", text);
        if self.tx.send(Arc::new(text)).await.is_err() {
            debug!("dropping frame, socket already closed");
        }
        Ok(())
    }

    /// Tear the connection down. Best-effort and idempotent: every step
    /// logs instead of failing, because there is nobody left to tell.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let was_active = self.state == SessionState::Active;
        self.state = SessionState::Closing;

        if let Some(conn) = self.conn.clone() {
            let channels = std::mem::take(&mut self.channels);
            self.app.router.unsubscribe(&conn, &channels).await;

            if let Err(e) = self.app.presence().unregister(&conn).await {
                warn!(%conn, error = %e, "failed to remove connection from online set");
            }
            match self.app.presence().status(conn.user_id, &conn).await {
                Ok((still_online, online)) => {
                    if was_active && !still_online {
                        self.app
                            .router
                            .publish(
                                &ChannelId::Broadcast,
                                &frames::online_logout(&online, conn.user_id),
                            )
                            .await;
                    }
                }
                Err(e) => warn!(%conn, error = %e, "failed to read online set during close"),
            }

            if was_active {
                match self.app.repo().update_last_read(conn.user_id).await {
                    Ok(rows) => debug!(%conn, rows, "moved last-read pointers"),
                    Err(e) => warn!(%conn, error = %e, "failed to move last-read pointers"),
                }
            }

            // wait out an in-flight store operation, but only so long
            let mut tries = 0;
            loop {
                if !self.app.store.in_progress() {
                    break;
                }
                if tries >= self.app.config.close_retries {
                    warn!(%conn, tries, "store still busy, forcing teardown");
                    break;
                }
                tries += 1;
                tokio::time::sleep(self.app.config.close_retry_delay).await;
            }
            self.app.router.unbind(&conn).await;
            info!(%conn, "connection closed");
        }

        self.state = SessionState::Closed;
    }
}
