use serde::{Deserialize, Serialize};

use crate::auth::Auth;

/// Provider speaking newline-free JSON documents over raw TCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpProvider {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    pub host: String,
    pub port: u16,
    #[serde(default = "TcpProvider::default_timeout")]
    pub timeout_ms: Option<u64>,
}

impl TcpProvider {
    pub fn new(name: String, host: String, port: u16) -> Self {
        Self {
            name,
            auth: None,
            host,
            port,
            timeout_ms: Self::default_timeout(),
        }
    }

    fn default_timeout() -> Option<u64> {
        Some(30_000)
    }
}
