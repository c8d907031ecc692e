use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::Auth;

/// Provider whose tools are the fields of one GraphQL operation type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphqlProvider {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    pub url: String,
    /// "query", "mutation", or "subscription".
    #[serde(default = "GraphqlProvider::default_operation")]
    pub operation_type: String,
    /// When set, discovery is restricted to this single field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl GraphqlProvider {
    pub fn new(name: String, url: String, auth: Option<Auth>) -> Self {
        Self {
            name,
            auth,
            url,
            operation_type: Self::default_operation(),
            operation_name: None,
            headers: None,
            timeout_ms: None,
        }
    }

    fn default_operation() -> String {
        "query".to_string()
    }
}
