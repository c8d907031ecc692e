use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::Auth;

/// Provider streaming tool results as Server-Sent Events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseProvider {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl SseProvider {
    pub fn new(name: String, url: String, auth: Option<Auth>) -> Self {
        Self {
            name,
            auth,
            url,
            headers: None,
            body_field: None,
            header_fields: None,
            timeout_ms: None,
        }
    }
}
