use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::Auth;

/// Provider reached over plain request/response HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProvider {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(default = "HttpProvider::default_method")]
    pub http_method: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// When set, call arguments are wrapped under this field in the JSON body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_field: Option<String>,
    /// Argument names lifted out of the payload and sent as request headers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl HttpProvider {
    pub fn new(name: String, url: String, http_method: String, auth: Option<Auth>) -> Self {
        Self {
            name,
            auth,
            http_method,
            url,
            content_type: Some("application/json".to_string()),
            headers: None,
            body_field: None,
            header_fields: None,
            timeout_ms: None,
        }
    }

    fn default_method() -> String {
        "GET".to_string()
    }
}
