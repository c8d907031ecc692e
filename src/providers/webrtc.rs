use serde::{Deserialize, Serialize};

use crate::auth::Auth;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Provider reached over a WebRTC data channel negotiated through an HTTP
/// signaling endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcProvider {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    /// HTTP endpoint accepting the SDP offer.
    pub signaling_server: String,
    #[serde(default = "WebRtcProvider::default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
    #[serde(default = "WebRtcProvider::default_channel_label")]
    pub channel_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WebRtcProvider {
    pub fn new(name: String, signaling_server: String) -> Self {
        Self {
            name,
            auth: None,
            signaling_server,
            ice_servers: Self::default_ice_servers(),
            channel_label: Self::default_channel_label(),
            timeout_ms: None,
        }
    }

    fn default_ice_servers() -> Vec<IceServer> {
        vec![IceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }]
    }

    fn default_channel_label() -> String {
        "utcp-data".to_string()
    }
}
