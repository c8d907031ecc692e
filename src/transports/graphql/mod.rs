use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::auth::Auth;
use crate::errors::UtcpError;
use crate::providers::{GraphqlProvider, Provider, ProviderType};
use crate::tools::{Tool, ToolSchema};
use crate::transports::stream::{boxed_channel_stream, StreamResult};
use crate::transports::{bare_tool_name, ClientTransport};

/// Driver mapping GraphQL operations to tools: discovery introspects the
/// schema and emits one tool per field of the configured operation type;
/// queries and mutations go over HTTP, subscriptions over the `graphql-ws`
/// WebSocket subprotocol.
pub struct GraphQlTransport {
    client: Client,
}

impl GraphQlTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn expect_graphql<'a>(prov: &'a Provider) -> Result<&'a GraphqlProvider> {
        match prov {
            Provider::Graphql(p) => Ok(p),
            other => Err(UtcpError::mismatch(
                ProviderType::Graphql,
                other.provider_type(),
            )),
        }
    }

    /// The provider's configured operation type wins; an unset or unknown
    /// value falls back to inference from the tool name.
    fn operation_type(configured: &str, tool_name: &str) -> String {
        let op = configured.trim().to_lowercase();
        if matches!(op.as_str(), "query" | "mutation" | "subscription") {
            return op;
        }

        let tool = tool_name.to_lowercase();
        if tool.starts_with("subscription") || tool.starts_with("subscribe") || tool.starts_with("on_")
        {
            return "subscription".to_string();
        }
        if tool.starts_with("create") || tool.starts_with("update") || tool.starts_with("delete") {
            return "mutation".to_string();
        }
        "query".to_string()
    }

    /// Map a JSON argument to a GraphQL variable declaration. Complex values
    /// travel as JSON strings for portability.
    fn normalize_arg(key: &str, value: Value) -> (String, Value) {
        match value {
            Value::Bool(_) => ("Boolean!".to_string(), value),
            Value::Number(num) => {
                if let Some(int_val) = num.as_i64() {
                    if int_val >= i64::from(i32::MIN) && int_val <= i64::from(i32::MAX) {
                        return ("Int!".to_string(), Value::Number(num));
                    }
                }
                ("Float!".to_string(), Value::Number(num))
            }
            Value::String(s) => {
                let type_name = if key.to_ascii_lowercase().ends_with("_id") {
                    "ID!"
                } else {
                    "String!"
                };
                (type_name.to_string(), Value::String(s))
            }
            Value::Array(_) | Value::Object(_) => {
                ("String!".to_string(), Value::String(value.to_string()))
            }
            Value::Null => ("String".to_string(), Value::Null),
        }
    }

    fn build_document(
        operation_type: &str,
        operation_name: &str,
        field: &str,
        args: HashMap<String, Value>,
    ) -> (String, HashMap<String, Value>) {
        let mut defs = Vec::new();
        let mut uses = Vec::new();
        let mut variables = HashMap::new();

        let mut keys: Vec<_> = args.keys().cloned().collect();
        keys.sort();
        let mut args = args;
        for key in keys {
            let value = args.remove(&key).unwrap();
            let (type_name, normalized) = Self::normalize_arg(&key, value);
            defs.push(format!("${key}: {type_name}"));
            uses.push(format!("{key}: ${key}"));
            variables.insert(key, normalized);
        }

        let document = if defs.is_empty() {
            format!("{operation_type} {{ {field} }}")
        } else {
            format!(
                "{operation_type} {operation_name}({}) {{ {field}({}) }}",
                defs.join(", "),
                uses.join(", ")
            )
        };
        (document, variables)
    }

    fn apply_auth(builder: reqwest::RequestBuilder, auth: &Auth) -> Result<reqwest::RequestBuilder> {
        match auth {
            Auth::ApiKey(api_key) => match api_key.location.to_ascii_lowercase().as_str() {
                "header" => Ok(builder.header(&api_key.var_name, &api_key.api_key)),
                "query" => Ok(builder.query(&[(api_key.var_name.clone(), api_key.api_key.clone())])),
                "cookie" => Ok(builder.header(
                    "cookie",
                    format!("{}={}", api_key.var_name, api_key.api_key),
                )),
                other => Err(UtcpError::Config(format!("Unsupported API key location: {other}")).into()),
            },
            Auth::Basic(basic) => Ok(builder.basic_auth(&basic.username, Some(&basic.password))),
            Auth::OAuth2(_) => Err(UtcpError::Unsupported(
                "OAuth2 is not supported by the GraphQL transport".to_string(),
            )
            .into()),
        }
    }

    async fn execute(
        &self,
        prov: &GraphqlProvider,
        query: &str,
        variables: HashMap<String, Value>,
    ) -> Result<Value> {
        let mut builder = self
            .client
            .post(&prov.url)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }
        if let Some(auth) = &prov.auth {
            builder = Self::apply_auth(builder, auth)?;
        }
        if let Some(timeout) = prov.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout));
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UtcpError::Protocol(format!(
                "GraphQL request failed: HTTP {status}: {}",
                crate::transports::http::body_prefix(&body)
            ))
            .into());
        }

        let result: Value = response.json().await?;
        if let Some(errors) = result.get("errors").filter(|e| !e.as_array().map_or(true, Vec::is_empty)) {
            return Err(UtcpError::Protocol(format!("GraphQL errors: {errors}")).into());
        }
        result
            .get("data")
            .cloned()
            .ok_or_else(|| UtcpError::Protocol("GraphQL response missing data".to_string()).into())
    }

    fn introspection_key(operation_type: &str) -> &'static str {
        match operation_type {
            "mutation" => "mutationType",
            "subscription" => "subscriptionType",
            _ => "queryType",
        }
    }
}

#[async_trait]
impl ClientTransport for GraphQlTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let gql_prov = Self::expect_graphql(prov)?;
        let operation_type = Self::operation_type(&gql_prov.operation_type, "");

        let introspection = r#"
        query IntrospectionQuery {
          __schema {
            queryType { fields { name description } }
            mutationType { fields { name description } }
            subscriptionType { fields { name description } }
          }
        }"#;

        let data = self.execute(gql_prov, introspection, HashMap::new()).await?;
        let key = Self::introspection_key(&operation_type);

        let mut tools = Vec::new();
        if let Some(fields) = data
            .pointer(&format!("/__schema/{key}/fields"))
            .and_then(|v| v.as_array())
        {
            for field in fields {
                let Some(name) = field.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                if let Some(filter) = &gql_prov.operation_name {
                    if filter != name {
                        continue;
                    }
                }
                let mut tool = Tool::new(
                    name,
                    field
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default(),
                );
                tool.tags = vec![operation_type.clone()];
                tool.inputs = ToolSchema::object();
                tools.push(tool);
            }
        }
        Ok(tools)
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        Self::expect_graphql(prov)?;
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        _last_event_id: Option<&str>,
    ) -> Result<Value> {
        let gql_prov = Self::expect_graphql(prov)?;
        let field = bare_tool_name(tool_name, &gql_prov.name);
        let operation_type = Self::operation_type(&gql_prov.operation_type, field);
        let operation_name = gql_prov.operation_name.as_deref().unwrap_or(field);

        let (document, variables) =
            Self::build_document(&operation_type, operation_name, field, args);
        let data = self.execute(gql_prov, &document, variables).await?;

        // Unwrap the single requested field when the server returned it.
        if let Some(value) = data.get(field) {
            return Ok(value.clone());
        }
        Ok(data)
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        let gql_prov = Self::expect_graphql(prov)?;
        let field = bare_tool_name(tool_name, &gql_prov.name).to_string();
        let operation_type = Self::operation_type(&gql_prov.operation_type, &field);
        if operation_type != "subscription" {
            return Err(UtcpError::Unsupported(format!(
                "GraphQL streaming requires a subscription; '{field}' is a {operation_type}"
            ))
            .into());
        }

        let operation_name = gql_prov.operation_name.as_deref().unwrap_or(&field);
        let (document, variables) =
            Self::build_document(&operation_type, operation_name, &field, args);

        let ws_url = gql_prov
            .url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);

        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        let mut request = ws_url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("graphql-ws"),
        );
        if let Some(headers) = &gql_prov.headers {
            for (k, v) in headers {
                let name = HeaderName::from_bytes(k.as_bytes())
                    .map_err(|_| UtcpError::Config(format!("invalid header name: {k}")))?;
                request.headers_mut().insert(
                    name,
                    HeaderValue::from_str(v)
                        .map_err(|_| UtcpError::Config(format!("invalid header value: {v}")))?,
                );
            }
        }
        if let Some(auth) = &gql_prov.auth {
            match auth {
                Auth::ApiKey(api_key) if api_key.location.eq_ignore_ascii_case("header") => {
                    let name = HeaderName::from_bytes(api_key.var_name.as_bytes())
                        .map_err(|_| UtcpError::Config("invalid auth header name".to_string()))?;
                    request.headers_mut().insert(
                        name,
                        HeaderValue::from_str(&api_key.api_key)
                            .map_err(|_| UtcpError::Config("invalid auth header value".to_string()))?,
                    );
                }
                Auth::Basic(basic) => {
                    let encoded = base64::engine::general_purpose::STANDARD
                        .encode(format!("{}:{}", basic.username, basic.password));
                    request.headers_mut().insert(
                        "authorization",
                        HeaderValue::from_str(&format!("Basic {encoded}"))
                            .map_err(|_| UtcpError::Config("invalid auth header".to_string()))?,
                    );
                }
                _ => {}
            }
        }

        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| UtcpError::Io(format!("GraphQL WebSocket handshake failed: {e}")))?;

        // graphql-ws handshake: connection_init -> connection_ack -> start.
        ws.send(Message::Text(json!({ "type": "connection_init" }).to_string()))
            .await?;
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let ack: Value = serde_json::from_str(&text)
                    .map_err(|e| UtcpError::Protocol(format!("invalid handshake frame: {e}")))?;
                if ack.get("type").and_then(|v| v.as_str()) != Some("connection_ack") {
                    return Err(UtcpError::Protocol(format!(
                        "expected connection_ack, got: {text}"
                    ))
                    .into());
                }
            }
            other => {
                return Err(UtcpError::Protocol(format!(
                    "missing connection_ack frame: {other:?}"
                ))
                .into())
            }
        }

        ws.send(Message::Text(
            json!({
                "id": "1",
                "type": "start",
                "payload": { "query": document, "variables": variables }
            })
            .to_string(),
        ))
        .await?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(msg) = ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let parsed: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                let _ = tx
                                    .send(Err(UtcpError::Protocol(format!(
                                        "invalid subscription frame: {e}"
                                    ))
                                    .into()))
                                    .await;
                                return;
                            }
                        };
                        match parsed.get("type").and_then(|v| v.as_str()) {
                            Some("data") => {
                                if let Some(errors) = parsed.pointer("/payload/errors") {
                                    let _ = tx
                                        .send(Err(UtcpError::Protocol(format!(
                                            "GraphQL subscription errors: {errors}"
                                        ))
                                        .into()))
                                        .await;
                                    return;
                                }
                                if let Some(data) = parsed.pointer("/payload/data") {
                                    if tx.send(Ok(data.clone())).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Some("error") => {
                                let payload = parsed
                                    .get("payload")
                                    .map(|p| p.to_string())
                                    .unwrap_or_else(|| "unknown error".to_string());
                                let _ = tx
                                    .send(Err(UtcpError::Protocol(format!(
                                        "GraphQL subscription error: {payload}"
                                    ))
                                    .into()))
                                    .await;
                                return;
                            }
                            Some("complete") => return,
                            // ka (keep-alive) and friends are ignored.
                            _ => {}
                        }
                    }
                    Ok(Message::Close(_)) => return,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = tx
                            .send(Err(UtcpError::Io(format!("WebSocket error: {err}")).into()))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(boxed_channel_stream(rx, None))
    }
}
