use anyhow::Result;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{header, Client};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::auth::Auth;
use crate::errors::UtcpError;
use crate::providers::{McpProvider, Provider, ProviderType};
use crate::tools::{Tool, ToolSchema};
use crate::transports::stream::{boxed_channel_stream, boxed_slice_stream, StreamResult};
use crate::transports::ClientTransport;

const PROTOCOL_VERSION: &str = "2024-11-05";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Driver for Model Context Protocol providers. A command vector selects the
/// stdio sub-transport (a child process speaking line-delimited JSON-RPC); a
/// URL selects streamable HTTP. Server notifications are bridged through the
/// stream abstraction.
pub struct McpTransport {
    client: Client,
    sessions: Mutex<HashMap<String, Arc<StdioSession>>>,
}

/// A running stdio MCP server: requests correlated by id, notifications
/// forwarded to the active stream when one is attached.
struct StdioSession {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    notifications: Mutex<Option<mpsc::Sender<Result<Value>>>>,
    next_id: AtomicU64,
}

impl StdioSession {
    async fn spawn(prov: &McpProvider) -> Result<Arc<Self>> {
        let command = prov
            .command
            .as_ref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| UtcpError::Config("MCP provider has an empty command".to_string()))?;

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]);
        if let Some(env) = &prov.env_vars {
            for (k, v) in env {
                cmd.env(k, v);
            }
        }
        if let Some(dir) = &prov.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| UtcpError::Io(format!("failed to spawn MCP server '{}': {e}", command[0])))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| UtcpError::Io("MCP child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UtcpError::Io("MCP child has no stdout".to_string()))?;

        let session = Arc::new(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending: Mutex::new(HashMap::new()),
            notifications: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });

        let reader_session = session.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                reader_session.route(message).await;
            }
            // Child went away; fail anything still waiting.
            reader_session.pending.lock().await.clear();
        });

        Ok(session)
    }

    async fn route(&self, message: Value) {
        if let Some(id) = message.get("id").and_then(|v| v.as_u64()) {
            if let Some(waiter) = self.pending.lock().await.remove(&id) {
                let _ = waiter.send(message);
            }
            return;
        }
        let is_notification = message
            .get("method")
            .and_then(|v| v.as_str())
            .map(|m| m.starts_with("notifications/"))
            .unwrap_or(false);
        if is_notification {
            if let Some(sink) = self.notifications.lock().await.as_ref() {
                let payload = message.get("params").cloned().unwrap_or(Value::Null);
                let _ = sink.send(Ok(json!({ "notification": payload }))).await;
            }
        }
    }

    async fn write_line(&self, message: &Value) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(message.to_string().as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn notify(&self, method: &str) -> Result<()> {
        self.write_line(&json!({ "jsonrpc": "2.0", "method": method }))
            .await
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        self.write_line(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        }))
        .await?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| UtcpError::Cancelled(format!("MCP request '{method}' timed out")))?
            .map_err(|_| UtcpError::Io("MCP server closed before replying".to_string()))?;

        if let Some(error) = response.get("error") {
            return Err(UtcpError::Protocol(format!("MCP error: {error}")).into());
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| UtcpError::Protocol("MCP response missing result".to_string()).into())
    }

    async fn initialize(&self) -> Result<()> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "utcp-client", "version": env!("CARGO_PKG_VERSION") }
            }),
        )
        .await?;
        self.notify("notifications/initialized").await
    }

    async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!("failed to kill MCP child: {e}");
        }
    }
}

impl McpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("failed to build HTTP client"),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn expect_mcp<'a>(prov: &'a Provider) -> Result<&'a McpProvider> {
        match prov {
            Provider::Mcp(p) => Ok(p),
            other => Err(UtcpError::mismatch(ProviderType::Mcp, other.provider_type())),
        }
    }

    async fn session(&self, prov: &McpProvider) -> Result<Arc<StdioSession>> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get(&prov.name) {
                return Ok(session.clone());
            }
        }
        let session = StdioSession::spawn(prov).await?;
        session.initialize().await?;
        self.sessions
            .lock()
            .await
            .insert(prov.name.clone(), session.clone());
        Ok(session)
    }

    fn parse_tools(result: &Value) -> Vec<Tool> {
        let Some(tools) = result.get("tools").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        tools
            .iter()
            .filter_map(|entry| {
                let name = entry.get("name").and_then(|v| v.as_str())?;
                let mut tool = Tool::new(
                    name,
                    entry
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default(),
                );
                if let Some(schema) = entry.get("inputSchema") {
                    tool.inputs = serde_json::from_value(schema.clone())
                        .unwrap_or_else(|_| ToolSchema::object());
                }
                Some(tool)
            })
            .collect()
    }

    fn apply_auth(builder: reqwest::RequestBuilder, auth: &Auth) -> Result<reqwest::RequestBuilder> {
        match auth {
            Auth::ApiKey(api_key) => match api_key.location.to_ascii_lowercase().as_str() {
                "header" => Ok(builder.header(&api_key.var_name, &api_key.api_key)),
                "query" => Ok(builder.query(&[(api_key.var_name.clone(), api_key.api_key.clone())])),
                "cookie" => Ok(builder.header(
                    header::COOKIE,
                    format!("{}={}", api_key.var_name, api_key.api_key),
                )),
                other => Err(UtcpError::Config(format!("Unsupported API key location: {other}")).into()),
            },
            Auth::Basic(basic) => Ok(builder.basic_auth(&basic.username, Some(&basic.password))),
            Auth::OAuth2(_) => Err(UtcpError::Unsupported(
                "OAuth2 is not supported by the MCP transport".to_string(),
            )
            .into()),
        }
    }

    async fn http_rpc(&self, prov: &McpProvider, method: &str, params: Value) -> Result<Value> {
        let url = prov
            .url
            .as_ref()
            .ok_or_else(|| UtcpError::Config("MCP provider has no URL".to_string()))?;

        let request = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let mut builder = self.client.post(url).json(&request);
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }
        if let Some(auth) = &prov.auth {
            builder = Self::apply_auth(builder, auth)?;
        }

        let response = crate::transports::http::error_for_status(builder.send().await?).await?;
        let message: Value = response.json().await?;
        if let Some(error) = message.get("error") {
            return Err(UtcpError::Protocol(format!("MCP error: {error}")).into());
        }
        message
            .get("result")
            .cloned()
            .ok_or_else(|| UtcpError::Protocol("MCP response missing result".to_string()).into())
    }

    /// Streamable HTTP: POST the call accepting both JSON and SSE. An SSE
    /// response carries JSON-RPC messages per event; notifications stream
    /// through, the final response ends the stream.
    async fn http_stream(
        &self,
        prov: &McpProvider,
        tool_name: &str,
        args: HashMap<String, Value>,
    ) -> Result<Box<dyn StreamResult>> {
        let url = prov
            .url
            .as_ref()
            .ok_or_else(|| UtcpError::Config("MCP provider has no URL".to_string()))?;

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": tool_name, "arguments": args }
        });
        let mut builder = self
            .client
            .post(url)
            .header(header::ACCEPT, "application/json, text/event-stream")
            .json(&request);
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }
        if let Some(auth) = &prov.auth {
            builder = Self::apply_auth(builder, auth)?;
        }

        let response = crate::transports::http::error_for_status(builder.send().await?).await?;
        let is_sse = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        if !is_sse {
            let message: Value = response.json().await?;
            if let Some(error) = message.get("error") {
                return Err(UtcpError::Protocol(format!("MCP error: {error}")).into());
            }
            let result = message.get("result").cloned().unwrap_or(Value::Null);
            return Ok(boxed_slice_stream(vec![result]));
        }

        let mut events = response.bytes_stream().eventsource();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        let Ok(message) = serde_json::from_str::<Value>(&event.data) else {
                            let _ = tx
                                .send(Err(UtcpError::Protocol(format!(
                                    "invalid MCP event: {}",
                                    event.data
                                ))
                                .into()))
                                .await;
                            return;
                        };
                        if let Some(error) = message.get("error") {
                            let _ = tx
                                .send(Err(
                                    UtcpError::Protocol(format!("MCP error: {error}")).into()
                                ))
                                .await;
                            return;
                        }
                        if let Some(result) = message.get("result") {
                            let _ = tx.send(Ok(result.clone())).await;
                            return;
                        }
                        if message
                            .get("method")
                            .and_then(|v| v.as_str())
                            .map(|m| m.starts_with("notifications/"))
                            .unwrap_or(false)
                        {
                            let payload = message.get("params").cloned().unwrap_or(Value::Null);
                            if tx.send(Ok(json!({ "notification": payload }))).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(Err(UtcpError::Io(format!("MCP stream failed: {err}")).into()))
                            .await;
                        return;
                    }
                }
            }
        });
        Ok(boxed_channel_stream(rx, None))
    }
}

#[async_trait]
impl ClientTransport for McpTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let mcp_prov = Self::expect_mcp(prov)?;

        let result = if mcp_prov.is_stdio() {
            let session = self.session(mcp_prov).await?;
            session.request("tools/list", json!({})).await?
        } else if mcp_prov.is_http() {
            self.http_rpc(mcp_prov, "tools/list", json!({ "cursor": null }))
                .await?
        } else {
            return Err(UtcpError::Config(
                "MCP provider needs either a command or a URL".to_string(),
            )
            .into());
        };

        let tools = Self::parse_tools(&result);
        debug!(provider = %mcp_prov.name, tools = tools.len(), "mcp discovery");
        Ok(tools)
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        let mcp_prov = Self::expect_mcp(prov)?;
        if let Some(session) = self.sessions.lock().await.remove(&mcp_prov.name) {
            session.shutdown().await;
        }
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        _last_event_id: Option<&str>,
    ) -> Result<Value> {
        let mcp_prov = Self::expect_mcp(prov)?;
        let params = json!({ "name": tool_name, "arguments": args });

        if mcp_prov.is_stdio() {
            let session = self.session(mcp_prov).await?;
            session.request("tools/call", params).await
        } else {
            self.http_rpc(mcp_prov, "tools/call", params).await
        }
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        let mcp_prov = Self::expect_mcp(prov)?;

        if mcp_prov.is_stdio() {
            let session = self.session(mcp_prov).await?;
            let (tx, rx) = mpsc::channel(16);
            *session.notifications.lock().await = Some(tx.clone());

            let call_session = session.clone();
            let tool_name = tool_name.to_string();
            tokio::spawn(async move {
                let result = call_session
                    .request("tools/call", json!({ "name": tool_name, "arguments": args }))
                    .await;
                let _ = tx.send(result).await;
                *call_session.notifications.lock().await = None;
            });
            return Ok(boxed_channel_stream(rx, None));
        }

        self.http_stream(mcp_prov, tool_name, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::Json;
    use axum::http::Response;
    use axum::routing::post;
    use axum::Router;
    use bytes::Bytes;
    use std::io::Write;
    use std::net::TcpListener;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn spawn_app(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });
        format!("http://{addr}")
    }

    /// Line-oriented fake MCP server. Request ids are deterministic
    /// (initialize=1, tools/list=2, tools/call=3), so replies hardcode them.
    fn write_stdio_server(dir: &TempDir) -> Vec<String> {
        let path = dir.path().join("mcp-server.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      echo '{{"jsonrpc":"2.0","id":1,"result":{{"protocolVersion":"2024-11-05","capabilities":{{}}}}}}'
      ;;
    *'"method":"tools/list"'*)
      echo '{{"jsonrpc":"2.0","id":2,"result":{{"tools":[{{"name":"echo","description":"Echo text","inputSchema":{{"type":"object"}}}}]}}}}'
      ;;
    *'"method":"tools/call"'*)
      echo '{{"jsonrpc":"2.0","method":"notifications/progress","params":{{"progress":1}}}}'
      echo '{{"jsonrpc":"2.0","id":3,"result":{{"content":[{{"type":"text","text":"done"}}]}}}}'
      ;;
  esac
done
"#
        )
        .unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        vec![path.to_str().unwrap().to_string()]
    }

    #[tokio::test]
    async fn stdio_register_call_and_notification_stream() {
        let dir = TempDir::new().unwrap();
        let command = write_stdio_server(&dir);
        let prov = Provider::Mcp(McpProvider::new_stdio("mcp".into(), command));

        let transport = McpTransport::new();
        let tools = transport.register_tool_provider(&prov).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].description, "Echo text");

        // Stream surfaces the progress notification, then the call result.
        let mut args = HashMap::new();
        args.insert("text".to_string(), json!("hi"));
        let mut stream = transport
            .call_tool_stream("echo", args, &prov)
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, json!({ "notification": { "progress": 1 } }));
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second["content"][0]["text"], json!("done"));
        assert_eq!(stream.next().await.unwrap(), None);
        stream.close().await.unwrap();

        transport.deregister_tool_provider(&prov).await.unwrap();
        assert!(transport.sessions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn http_register_and_call_speak_json_rpc() {
        async fn handler(Json(request): Json<Value>) -> Json<Value> {
            match request["method"].as_str().unwrap() {
                "tools/list" => Json(json!({
                    "jsonrpc": "2.0", "id": request["id"],
                    "result": { "tools": [
                        { "name": "lookup", "description": "Lookup", "inputSchema": { "type": "object" } }
                    ]}
                })),
                "tools/call" => Json(json!({
                    "jsonrpc": "2.0", "id": request["id"],
                    "result": { "called": request["params"]["name"], "args": request["params"]["arguments"] }
                })),
                other => panic!("unexpected method {other}"),
            }
        }

        let base = spawn_app(Router::new().route("/mcp", post(handler)));
        let prov = Provider::Mcp(McpProvider::new_http("mcp".into(), format!("{base}/mcp"), None));

        let transport = McpTransport::new();
        let tools = transport.register_tool_provider(&prov).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "lookup");

        let mut args = HashMap::new();
        args.insert("q".to_string(), json!("x"));
        let value = transport.call_tool("lookup", args, &prov, None).await.unwrap();
        assert_eq!(value["called"], json!("lookup"));
        assert_eq!(value["args"], json!({ "q": "x" }));
    }

    #[tokio::test]
    async fn http_stream_parses_sse_framed_rpc() {
        async fn handler(Json(_): Json<Value>) -> Response<Body> {
            let frames = tokio_stream::iter(vec![
                Ok::<Bytes, std::convert::Infallible>(Bytes::from_static(
                    b"data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/log\",\"params\":{\"msg\":\"working\"}}\n\n",
                )),
                Ok(Bytes::from_static(
                    b"data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n",
                )),
            ]);
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::wrap_stream(frames))
                .unwrap()
        }

        let base = spawn_app(Router::new().route("/mcp", post(handler)));
        let prov = Provider::Mcp(McpProvider::new_http("mcp".into(), format!("{base}/mcp"), None));

        let mut stream = McpTransport::new()
            .call_tool_stream("job", HashMap::new(), &prov)
            .await
            .unwrap();
        assert_eq!(
            stream.next().await.unwrap(),
            Some(json!({ "notification": { "msg": "working" } }))
        );
        assert_eq!(stream.next().await.unwrap(), Some(json!({ "ok": true })));
        assert_eq!(stream.next().await.unwrap(), None);
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn json_rpc_error_bodies_are_protocol_errors() {
        async fn handler(Json(request): Json<Value>) -> Json<Value> {
            Json(json!({
                "jsonrpc": "2.0", "id": request["id"],
                "error": { "code": -32601, "message": "no such tool" }
            }))
        }
        let base = spawn_app(Router::new().route("/mcp", post(handler)));
        let prov = Provider::Mcp(McpProvider::new_http("mcp".into(), format!("{base}/mcp"), None));

        let err = McpTransport::new()
            .call_tool("ghost", HashMap::new(), &prov, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Protocol(_))
        ));
        assert!(err.to_string().contains("no such tool"));
    }

    #[tokio::test]
    async fn provider_without_command_or_url_is_a_config_error() {
        let mcp = McpProvider {
            name: "empty".into(),
            auth: None,
            url: None,
            headers: None,
            command: None,
            env_vars: None,
            working_dir: None,
        };
        let err = McpTransport::new()
            .register_tool_provider(&Provider::Mcp(mcp))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Config(_))
        ));
    }

    #[tokio::test]
    async fn wrong_variant_is_rejected() {
        let prov = Provider::Text(crate::providers::TextProvider::new("t".into()));
        let err = McpTransport::new()
            .register_tool_provider(&prov)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::TransportMismatch { .. })
        ));
    }
}
