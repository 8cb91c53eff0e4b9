use std::collections::HashMap;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::channels::ChannelId;
use crate::presence::ConnId;
use crate::{ChatError, GetField};

use super::actions;
use super::frames::{self, InboundFrame};
use super::session::{ConnectionSession, Outbound};

pub type Handler =
    for<'a> fn(&'a mut ConnectionSession, InboundFrame) -> BoxFuture<'a, Result<(), ChatError>>;

/// Static mapping from event name to handler. Built once at startup and
/// validated there, so an unknown event at runtime is a client error, never
/// a dispatch failure. Collaborators that own more events (signaling,
/// moderation) register them the same way.
pub struct DispatchTable {
    handlers: HashMap<&'static str, Handler>,
}

impl DispatchTable {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
        handlers.insert(actions::SEND_MESSAGE, send_message as Handler);
        handlers.insert(actions::EDIT_MESSAGE, edit_message as Handler);
        handlers.insert(actions::DELETE_MESSAGE, delete_message as Handler);
        handlers.insert(actions::LOAD_MESSAGES, load_messages as Handler);
        handlers.insert(actions::PING, ping as Handler);
        handlers.insert(actions::SEND_RTC_DATA, send_rtc_data as Handler);
        Self { handlers }
    }

    pub fn get(&self, action: &str) -> Option<Handler> {
        self.handlers.get(action).copied()
    }

    /// Startup check: every known inbound event has a handler.
    pub fn validate(&self) -> anyhow::Result<()> {
        for action in actions::INBOUND {
            if !self.handlers.contains_key(action) {
                anyhow::bail!("no handler registered for event {action}");
            }
        }
        Ok(())
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

fn send_message<'a>(
    session: &'a mut ConnectionSession,
    frame: InboundFrame,
) -> BoxFuture<'a, Result<(), ChatError>> {
    Box::pin(async move {
        let room_id = frame.require_room()?;
        let content = frame.body.get_str_field("content")?;
        let symbol = frame
            .body
            .get("symbol")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let user_id = session.user_ref()?.id;
        let message = session
            .app()
            .repo()
            .insert_message(user_id, room_id, &content, symbol.as_deref())
            .await?;
        session
            .app()
            .router
            .publish(&ChannelId::Room(room_id), &frames::print_message(&message))
            .await;
        Ok(())
    })
}

fn edit_message<'a>(
    session: &'a mut ConnectionSession,
    frame: InboundFrame,
) -> BoxFuture<'a, Result<(), ChatError>> {
    Box::pin(async move {
        let id = frame.body.get_i64_field("id")?;
        let content = frame.body.get_str_field("content")?;
        let user_id = session.user_ref()?.id;
        let Some(message) = session.app().repo().edit_message(id, user_id, &content).await? else {
            return Err(ChatError::Protocol(format!("message {id} cannot be edited")));
        };
        session
            .app()
            .router
            .publish(
                &ChannelId::Room(message.room_id),
                &frames::edit_message(&message),
            )
            .await;
        Ok(())
    })
}

fn delete_message<'a>(
    session: &'a mut ConnectionSession,
    frame: InboundFrame,
) -> BoxFuture<'a, Result<(), ChatError>> {
    Box::pin(async move {
        let id = frame.body.get_i64_field("id")?;
        let user_id = session.user_ref()?.id;
        let Some(message) = session.app().repo().delete_message(id, user_id).await? else {
            return Err(ChatError::Protocol(format!("message {id} cannot be deleted")));
        };
        session
            .app()
            .router
            .publish(
                &ChannelId::Room(message.room_id),
                &frames::delete_message(&message),
            )
            .await;
        Ok(())
    })
}

fn load_messages<'a>(
    session: &'a mut ConnectionSession,
    frame: InboundFrame,
) -> BoxFuture<'a, Result<(), ChatError>> {
    Box::pin(async move {
        let room_id = frame.require_room()?;
        let count = frame.body.get("count").and_then(Value::as_i64).unwrap_or(10);
        let before = frame.body.get("headerId").and_then(Value::as_i64);
        let messages = session
            .app()
            .repo()
            .older_messages(room_id, before, count)
            .await?;
        session
            .ws_write(Outbound::Frame(frames::load_messages(
                room_id,
                &messages,
                frame.js_message_id.clone(),
            )))
            .await
    })
}

fn ping<'a>(
    session: &'a mut ConnectionSession,
    frame: InboundFrame,
) -> BoxFuture<'a, Result<(), ChatError>> {
    Box::pin(async move {
        session
            .ws_write(Outbound::Frame(frames::pong(frame.js_message_id.clone())))
            .await
    })
}

/// WebRTC signaling passthrough: the payload is opaque here, only the
/// target connection matters.
fn send_rtc_data<'a>(
    session: &'a mut ConnectionSession,
    frame: InboundFrame,
) -> BoxFuture<'a, Result<(), ChatError>> {
    Box::pin(async move {
        let target = frame.body.get_str_field("connId")?;
        let target = ConnId::parse(&target)
            .ok_or_else(|| ChatError::Protocol(format!("bad connection id {target}")))?;
        let from = session.conn_ref()?.clone();
        session
            .app()
            .router
            .publish(
                &ChannelId::Conn(target),
                &frames::rtc_data(&from, &frame.body),
            )
            .await;
        Ok(())
    })
}
