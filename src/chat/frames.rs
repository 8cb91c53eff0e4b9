use serde_json::{json, Value};

use crate::models::{MessageView, RoomDescriptor, RosterEntry, UserIdentity};
use crate::presence::ConnId;
use crate::{ChatError, GetField};

use super::actions;

/// A parsed client frame. `body` keeps the event-specific fields for the
/// handler; `room_id` and `js_message_id` are pulled out because the session
/// needs them before dispatch.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub action: String,
    pub room_id: Option<i64>,
    pub js_message_id: Option<Value>,
    pub body: Value,
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let body: Value = serde_json::from_str(raw)
            .map_err(|e| ChatError::Protocol(format!("malformed frame: {e}")))?;
        if !body.is_object() {
            return Err(ChatError::Protocol("frame is not an object".to_owned()));
        }
        let action = body.get_str_field("action")?;
        let room_id = match body.get("roomId") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_i64().ok_or_else(|| {
                ChatError::Protocol(format!("expected roomId to be an integer, got {v}"))
            })?),
        };
        let js_message_id = body.get("jsMessageId").cloned();
        Ok(Self {
            action,
            room_id,
            js_message_id,
            body,
        })
    }

    pub fn require_room(&self) -> Result<i64, ChatError> {
        self.room_id
            .ok_or_else(|| ChatError::Protocol(format!("{} requires a roomId", self.action)))
    }
}

fn with_js(mut frame: Value, js: Option<Value>) -> Value {
    if let Some(js) = js {
        frame["jsMessageId"] = js;
    }
    frame
}

/// Error notice to the offending client only.
pub fn growl(content: &str, js: Option<Value>) -> Value {
    with_js(json!({"action": actions::GROWL, "content": content}), js)
}

pub fn pong(js: Option<Value>) -> Value {
    with_js(json!({"action": actions::PONG}), js)
}

/// Initial snapshot: rooms with membership settings and missed/history
/// batches, the full user roster, and who is online right now.
pub fn set_rooms(rooms: &[RoomDescriptor], users: &[RosterEntry], online: &[i64]) -> Value {
    json!({
        "action": actions::SET_ROOMS,
        "rooms": rooms,
        "users": users,
        "online": online,
    })
}

pub fn online_login(online: &[i64], user: &UserIdentity) -> Value {
    json!({
        "action": actions::ONLINE_LOGIN,
        "online": online,
        "userId": user.id,
        "user": user.username,
        "sex": user.sex_str(),
    })
}

pub fn online_logout(online: &[i64], user_id: i64) -> Value {
    json!({
        "action": actions::ONLINE_LOGOUT,
        "online": online,
        "userId": user_id,
    })
}

pub fn print_message(message: &MessageView) -> Value {
    json!({"action": actions::PRINT_MESSAGE, "message": message})
}

pub fn edit_message(message: &MessageView) -> Value {
    json!({"action": actions::EDIT_MESSAGE, "message": message})
}

pub fn delete_message(message: &MessageView) -> Value {
    json!({"action": actions::DELETE_MESSAGE, "message": message})
}

pub fn load_messages(room_id: i64, messages: &[MessageView], js: Option<Value>) -> Value {
    with_js(
        json!({
            "action": actions::LOAD_MESSAGES,
            "roomId": room_id,
            "messages": messages,
        }),
        js,
    )
}

/// Opaque signaling relay. `content` passes through untouched.
pub fn rtc_data(from: &ConnId, content: &Value) -> Value {
    json!({
        "action": actions::RTC_DATA,
        "from": from.to_string(),
        "content": content,
    })
}
