use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::Auth;

/// Provider speaking the Model Context Protocol, either by spawning a child
/// process (command vector set) or over streamable HTTP (url set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpProvider {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// Executable plus arguments for the stdio sub-transport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl McpProvider {
    pub fn new_http(name: String, url: String, auth: Option<Auth>) -> Self {
        Self {
            name,
            auth,
            url: Some(url),
            headers: None,
            command: None,
            env_vars: None,
            working_dir: None,
        }
    }

    pub fn new_stdio(name: String, command: Vec<String>) -> Self {
        Self {
            name,
            auth: None,
            url: None,
            headers: None,
            command: Some(command),
            env_vars: None,
            working_dir: None,
        }
    }

    pub fn is_stdio(&self) -> bool {
        self.command.as_ref().map_or(false, |c| !c.is_empty())
    }

    pub fn is_http(&self) -> bool {
        self.url.is_some()
    }
}
