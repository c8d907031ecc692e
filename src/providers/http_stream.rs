use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::Auth;

/// Provider whose tool responses arrive as a chunked sequence of JSON values
/// (NDJSON or JSON text sequence) over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpStreamProvider {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    pub url: String,
    #[serde(default = "HttpStreamProvider::default_method")]
    pub http_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl HttpStreamProvider {
    pub fn new(name: String, url: String, auth: Option<Auth>) -> Self {
        Self {
            name,
            auth,
            url,
            http_method: Self::default_method(),
            headers: None,
            timeout_ms: None,
        }
    }

    fn default_method() -> String {
        "POST".to_string()
    }
}
