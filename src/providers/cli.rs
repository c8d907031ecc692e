use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::Auth;

/// Provider backed by a local command-line executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliProvider {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    /// Full command line, split on whitespace before execution.
    pub command_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl CliProvider {
    pub fn new(name: String, command_name: String) -> Self {
        Self {
            name,
            auth: None,
            command_name,
            env_vars: None,
            working_dir: None,
        }
    }
}
