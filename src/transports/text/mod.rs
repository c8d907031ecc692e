use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::errors::UtcpError;
use crate::providers::{Provider, ProviderType, TextProvider, TextTemplate};
use crate::tools::{Tool, UtcpManual};
use crate::transports::stream::StreamResult;
use crate::transports::{bare_tool_name, ClientTransport};

/// Driver for local text providers: tools come from a JSON file or from
/// in-memory templates. Invocation renders the template with the argument
/// mapping; tools carrying an in-process handler are short-circuited by the
/// client before reaching any transport.
pub struct TextTransport {
    // "<provider>.<tool>" -> template body
    templates: RwLock<HashMap<String, String>>,
}

impl TextTransport {
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
        }
    }

    fn expect_text<'a>(prov: &'a Provider) -> Result<&'a TextProvider> {
        match prov {
            Provider::Text(p) => Ok(p),
            other => Err(UtcpError::mismatch(ProviderType::Text, other.provider_type())),
        }
    }

    /// Render `{key}` placeholders with stringified argument values.
    pub(crate) fn render(template: &str, args: &HashMap<String, Value>) -> String {
        let mut out = template.to_string();
        for (key, value) in args {
            let placeholder = format!("{{{key}}}");
            if out.contains(&placeholder) {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => other.to_string(),
                };
                out = out.replace(&placeholder, &rendered);
            }
        }
        out
    }

    async fn load_file_tools(prov: &TextProvider) -> Result<Vec<Tool>> {
        let Some(path) = &prov.file_path else {
            return Ok(Vec::new());
        };
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| UtcpError::Io(format!("failed to read {}: {e}", path.display())))?;

        if let Ok(tools) = serde_json::from_str::<Vec<Tool>>(&contents) {
            return Ok(tools);
        }
        let document: Value = serde_json::from_str(&contents)
            .map_err(|e| UtcpError::Config(format!("invalid tools file: {e}")))?;
        Ok(UtcpManual::from_document(&document)
            .map(|m| m.tools)
            .unwrap_or_default())
    }

    fn template_tool(template: &TextTemplate) -> Tool {
        let mut tool = Tool::new(&template.name, &template.description);
        tool.tags = template.tags.clone();
        tool
    }
}

#[async_trait]
impl ClientTransport for TextTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let text_prov = Self::expect_text(prov)?;

        let mut tools = Self::load_file_tools(text_prov).await?;
        let mut templates = self.templates.write().await;
        for template in &text_prov.templates {
            templates.insert(
                format!("{}.{}", text_prov.name, template.name),
                template.template.clone(),
            );
            tools.push(Self::template_tool(template));
        }
        Ok(tools)
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        let text_prov = Self::expect_text(prov)?;
        let prefix = format!("{}.", text_prov.name);
        self.templates
            .write()
            .await
            .retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        _last_event_id: Option<&str>,
    ) -> Result<Value> {
        let text_prov = Self::expect_text(prov)?;
        let bare = bare_tool_name(tool_name, &text_prov.name);
        let key = format!("{}.{bare}", text_prov.name);

        let template = {
            let templates = self.templates.read().await;
            templates.get(&key).cloned()
        };
        let template = template
            .or_else(|| {
                text_prov
                    .templates
                    .iter()
                    .find(|t| t.name == bare)
                    .map(|t| t.template.clone())
            })
            .ok_or_else(|| UtcpError::ToolNotFound(format!("no template for '{tool_name}'")))?;

        Ok(Value::String(Self::render(&template, &args)))
    }

    async fn call_tool_stream(
        &self,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        Self::expect_text(prov)?;
        Err(UtcpError::Unsupported("text transport does not stream".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn template_provider() -> TextProvider {
        TextProvider::new("local".into()).with_templates(vec![TextTemplate {
            name: "greet".into(),
            description: "Greets someone".into(),
            template: "Hello, {name}! You are {age}.".into(),
            tags: vec!["local".into()],
        }])
    }

    #[test]
    fn render_replaces_placeholders_with_scalars() {
        let mut args = HashMap::new();
        args.insert("name".to_string(), json!("World"));
        args.insert("n".to_string(), json!(3));
        assert_eq!(
            TextTransport::render("{name} x{n}, untouched {missing}", &args),
            "World x3, untouched {missing}"
        );
    }

    #[tokio::test]
    async fn register_expands_templates_and_call_renders() {
        let prov = Provider::Text(template_provider());
        let transport = TextTransport::new();

        let tools = transport.register_tool_provider(&prov).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "greet");
        assert_eq!(tools[0].tags, vec!["local"]);

        let mut args = HashMap::new();
        args.insert("name".to_string(), json!("UTCP"));
        args.insert("age".to_string(), json!(2));

        let value = transport
            .call_tool("local.greet", args, &prov, None)
            .await
            .unwrap();
        assert_eq!(value, json!("Hello, UTCP! You are 2."));
    }

    #[tokio::test]
    async fn register_loads_tools_from_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tools.json");
        std::fs::write(
            &path,
            json!({
                "version": "1.0",
                "tools": [{ "name": "lookup", "description": "Find things" }]
            })
            .to_string(),
        )
        .unwrap();

        let prov = Provider::Text(TextProvider::new("files".into()).with_file(path));
        let tools = TextTransport::new()
            .register_tool_provider(&prov)
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "lookup");
    }

    #[tokio::test]
    async fn deregister_drops_templates() {
        let prov = Provider::Text(template_provider());
        let transport = TextTransport::new();
        transport.register_tool_provider(&prov).await.unwrap();
        transport.deregister_tool_provider(&prov).await.unwrap();
        assert!(transport.templates.read().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_and_stream_are_typed_errors() {
        let prov = Provider::Text(TextProvider::new("empty".into()));
        let transport = TextTransport::new();

        let err = transport
            .call_tool("empty.nope", HashMap::new(), &prov, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::ToolNotFound(_))
        ));

        let err = transport
            .call_tool_stream("empty.nope", HashMap::new(), &prov)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Unsupported(_))
        ));
    }
}
