use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::auth::Auth;

/// A locally defined tool: a string template rendered with the call
/// arguments, unless an in-process handler is registered for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Template body; `{key}` placeholders are replaced with argument values.
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Provider whose tools live in-process: loaded from a local JSON file or
/// supplied as in-memory templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextProvider {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub templates: Vec<TextTemplate>,
}

impl TextProvider {
    pub fn new(name: String) -> Self {
        Self {
            name,
            auth: None,
            file_path: None,
            templates: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_templates(mut self, templates: Vec<TextTemplate>) -> Self {
        self.templates = templates;
        self
    }
}
