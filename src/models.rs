use std::collections::HashMap;

use serde::Serialize;

/// Immutable identity of the user behind a session. Owned by the persistence
/// layer; read-only here.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub id: i64,
    pub username: String,
    /// ISO/IEC 5218: 0 unknown, 1 male, 2 female.
    pub sex: i64,
}

impl UserIdentity {
    pub fn sex_str(&self) -> &'static str {
        match self.sex {
            1 => "Male",
            2 => "Female",
            _ => "Secret",
        }
    }
}

/// One entry of the user roster sent in the initial snapshot. Geo fields are
/// filled only when the feature flag is on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: i64,
    pub username: String,
    pub sex: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

/// A single media attachment, already resolved and ready to inline. The wire
/// format never references attachments by id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A message as it goes over the wire: media inlined under its symbol.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: i64,
    pub user_id: i64,
    pub room_id: i64,
    /// Milliseconds since the epoch.
    pub time: i64,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub deleted: bool,
    pub edited: i64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub files: HashMap<String, AttachmentView>,
}

/// A room plus this user's membership settings, as sent in the initial
/// snapshot. A `None` name denotes a private/direct room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDescriptor {
    pub room_id: i64,
    pub name: Option<String>,
    pub notifications: bool,
    pub volume: i64,
    pub users: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missed_messages: Vec<MessageView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history_messages: Vec<MessageView>,
}
