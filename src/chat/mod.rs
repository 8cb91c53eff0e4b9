pub mod dispatch;
pub mod frames;
pub mod session;
pub mod ws;

use axum::{routing::get, Router};

use crate::AppState;

/// Wire names of every event, inbound and outbound.
pub mod actions {
    pub const SEND_MESSAGE: &str = "sendMessage";
    pub const EDIT_MESSAGE: &str = "editMessage";
    pub const DELETE_MESSAGE: &str = "deleteMessage";
    pub const LOAD_MESSAGES: &str = "loadMessages";
    pub const PING: &str = "ping";
    pub const SEND_RTC_DATA: &str = "sendRtcData";

    pub const PRINT_MESSAGE: &str = "printMessage";
    pub const GROWL: &str = "growlMessage";
    pub const SET_ROOMS: &str = "setRooms";
    pub const ONLINE_LOGIN: &str = "onlineLogin";
    pub const ONLINE_LOGOUT: &str = "onlineLogout";
    pub const PONG: &str = "pong";
    pub const RTC_DATA: &str = "rtcData";

    /// Every event a client may send. The dispatch table is validated
    /// against this list at startup.
    pub const INBOUND: &[&str] = &[
        SEND_MESSAGE,
        EDIT_MESSAGE,
        DELETE_MESSAGE,
        LOAD_MESSAGES,
        PING,
        SEND_RTC_DATA,
    ];
}

pub fn router() -> Router<AppState> {
    Router::new().route("/chat", get(ws::chat_ws))
}
