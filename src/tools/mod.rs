use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// JSON-Schema-like record describing a tool's inputs or outputs. Schemas are
/// carried opaquely; the client never validates arguments against them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type", default = "ToolSchema::default_type")]
    pub type_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<HashMap<String, Value>>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Default for ToolSchema {
    fn default() -> Self {
        Self {
            type_: Self::default_type(),
            properties: None,
            required: None,
            description: None,
            title: None,
            items: None,
            enum_: None,
            minimum: None,
            maximum: None,
            format: None,
        }
    }
}

impl ToolSchema {
    pub fn object() -> Self {
        Self::default()
    }

    fn default_type() -> String {
        "object".to_string()
    }
}

/// In-process callback used by text-provider tools.
pub type ToolHandler = Arc<dyn Fn(HashMap<String, Value>) -> Result<Value> + Send + Sync>;

/// A named operation exposed by a provider. After registration the name is
/// globally unique and prefixed with `"<provider_name>."`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: ToolSchema,
    #[serde(default)]
    pub outputs: ToolSchema,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Snapshot of the owning provider, when known.
    #[serde(rename = "tool_provider", skip_serializing_if = "Option::is_none")]
    pub provider: Option<crate::providers::Provider>,
    #[serde(skip)]
    pub handler: Option<ToolHandler>,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            inputs: ToolSchema::object(),
            outputs: ToolSchema::object(),
            tags: Vec::new(),
            provider: None,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: ToolHandler) -> Self {
        self.handler = Some(handler);
        self
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("tags", &self.tags)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Tool catalog returned by a provider during discovery. Consumed by the
/// client and discarded once the repository holds its tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtcpManual {
    #[serde(default = "UtcpManual::default_version")]
    pub version: String,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
}

impl UtcpManual {
    pub fn new(tools: Vec<Tool>) -> Self {
        Self {
            version: Self::default_version(),
            tools,
            provider_name: None,
            original_url: None,
        }
    }

    fn default_version() -> String {
        "1.0".to_string()
    }

    /// Lenient manual extraction: accepts a full manual document or any JSON
    /// object with a `tools` array, skipping entries that fail to decode.
    pub fn from_document(doc: &Value) -> Option<Self> {
        let tools_array = doc.get("tools")?.as_array()?;
        let tools = tools_array
            .iter()
            .filter_map(|t| serde_json::from_value::<Tool>(t.clone()).ok())
            .collect();
        Some(Self {
            version: doc
                .get("version")
                .and_then(|v| v.as_str())
                .unwrap_or("1.0")
                .to_string(),
            tools,
            provider_name: None,
            original_url: None,
        })
    }
}

/// Ranking contract used by `search_tools`.
#[async_trait]
pub trait ToolSearchStrategy: Send + Sync {
    async fn search_tools(&self, query: &str, limit: usize) -> Result<Vec<Tool>>;
}
