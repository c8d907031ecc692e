use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::Auth;

/// Provider reached over a WebSocket connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketProvider {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    pub url: String,
    /// Optional subprotocol offered during the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WebSocketProvider {
    pub fn new(name: String, url: String, auth: Option<Auth>) -> Self {
        Self {
            name,
            auth,
            url,
            protocol: None,
            keep_alive: false,
            headers: None,
            timeout_ms: None,
        }
    }
}
