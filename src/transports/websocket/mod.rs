use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::auth::Auth;
use crate::errors::UtcpError;
use crate::providers::{Provider, ProviderType, WebSocketProvider};
use crate::tools::{Tool, UtcpManual};
use crate::transports::stream::{boxed_slice_stream, StreamResult};
use crate::transports::{bare_tool_name, ClientTransport};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Driver for WebSocket providers. Discovery sends the literal `"manual"`
/// message; calls dial `<url>/<tool>`, send the arguments as one JSON text
/// frame, and collect the peer's frames until it closes the connection.
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }

    fn expect_ws<'a>(prov: &'a Provider) -> Result<&'a WebSocketProvider> {
        match prov {
            Provider::Websocket(p) => Ok(p),
            other => Err(UtcpError::mismatch(
                ProviderType::Websocket,
                other.provider_type(),
            )),
        }
    }

    fn apply_auth_to_url(url: &str, auth: &Auth) -> String {
        if let Auth::ApiKey(api_key) = auth {
            if api_key.location.to_ascii_lowercase() == "query" {
                let separator = if url.contains('?') { '&' } else { '?' };
                return format!("{url}{separator}{}={}", api_key.var_name, api_key.api_key);
            }
        }
        url.to_string()
    }

    fn apply_auth_headers(req: &mut Request<()>, auth: &Auth) -> Result<()> {
        match auth {
            Auth::ApiKey(api_key) => {
                match api_key.location.to_ascii_lowercase().as_str() {
                    "header" => {
                        let name = HeaderName::from_str(&api_key.var_name)?;
                        req.headers_mut()
                            .insert(name, HeaderValue::from_str(&api_key.api_key)?);
                    }
                    "cookie" => {
                        let cookie = format!("{}={}", api_key.var_name, api_key.api_key);
                        req.headers_mut()
                            .insert("cookie", HeaderValue::from_str(&cookie)?);
                    }
                    // Query auth was applied to the URL already.
                    _ => {}
                }
                Ok(())
            }
            Auth::Basic(basic) => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", basic.username, basic.password));
                req.headers_mut().insert(
                    "authorization",
                    HeaderValue::from_str(&format!("Basic {encoded}"))?,
                );
                Ok(())
            }
            Auth::OAuth2(_) => Err(UtcpError::Unsupported(
                "OAuth2 is not supported by the WebSocket transport".to_string(),
            )
            .into()),
        }
    }

    fn build_request(prov: &WebSocketProvider, url: &str) -> Result<Request<()>> {
        let mut url = url.to_string();
        if let Some(auth) = &prov.auth {
            url = Self::apply_auth_to_url(&url, auth);
        }

        let mut req = url.into_client_request()?;
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                let name = HeaderName::from_str(k)?;
                req.headers_mut().insert(name, HeaderValue::from_str(v)?);
            }
        }
        if let Some(protocol) = &prov.protocol {
            req.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_str(protocol)?,
            );
        }
        if let Some(auth) = &prov.auth {
            Self::apply_auth_headers(&mut req, auth)?;
        }
        Ok(req)
    }

    async fn connect(prov: &WebSocketProvider, url: &str) -> Result<WsStream> {
        let req = Self::build_request(prov, url)?;
        let timeout = prov
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(HANDSHAKE_TIMEOUT);
        let (ws, _) = tokio::time::timeout(timeout, connect_async(req))
            .await
            .map_err(|_| UtcpError::Cancelled(format!("WebSocket handshake with {url} timed out")))?
            .map_err(|e| UtcpError::Io(format!("WebSocket handshake with {url} failed: {e}")))?;
        Ok(ws)
    }

    fn call_url(prov: &WebSocketProvider, tool_name: &str) -> String {
        let call_name = bare_tool_name(tool_name, &prov.name);
        let mut base = prov.url.trim_end_matches('/').to_string();
        // Discovery endpoints conventionally live under /tools; calls do not.
        if base.ends_with("/tools") {
            base.truncate(base.len() - "/tools".len());
        }
        format!("{base}/{call_name}")
    }

    /// Send the arguments and collect every reply frame until the peer
    /// closes. Returns the decoded frames in arrival order.
    async fn exchange(
        prov: &WebSocketProvider,
        tool_name: &str,
        args: &HashMap<String, Value>,
    ) -> Result<Vec<Value>> {
        let url = Self::call_url(prov, tool_name);
        let mut ws = Self::connect(prov, &url).await?;
        ws.send(Message::Text(serde_json::to_string(args)?)).await?;

        let mut frames = Vec::new();
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let value = serde_json::from_str::<Value>(&text)
                        .unwrap_or_else(|_| Value::String(text));
                    frames.push(value);
                }
                Ok(Message::Binary(bin)) => {
                    let text = String::from_utf8(bin)
                        .map_err(|e| UtcpError::Protocol(format!("non-UTF8 frame: {e}")))?;
                    let value = serde_json::from_str::<Value>(&text)
                        .unwrap_or_else(|_| Value::String(text));
                    frames.push(value);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    return Err(UtcpError::Io(format!("WebSocket receive failed: {err}")).into())
                }
            }
        }
        Ok(frames)
    }
}

#[async_trait]
impl ClientTransport for WebSocketTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let ws_prov = Self::expect_ws(prov)?;
        let mut ws = Self::connect(ws_prov, &ws_prov.url).await?;

        ws.send(Message::Text("manual".to_string())).await?;
        let Some(reply) = ws.next().await else {
            return Ok(Vec::new());
        };
        let Message::Text(text) = reply? else {
            return Err(
                UtcpError::Protocol("expected a text frame carrying the manual".to_string()).into(),
            );
        };

        let document: Value = serde_json::from_str(&text)
            .map_err(|e| UtcpError::Protocol(format!("invalid manual JSON: {e}")))?;
        Ok(UtcpManual::from_document(&document)
            .map(|m| m.tools)
            .unwrap_or_default())
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        Self::expect_ws(prov)?;
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        _last_event_id: Option<&str>,
    ) -> Result<Value> {
        let ws_prov = Self::expect_ws(prov)?;
        let frames = Self::exchange(ws_prov, tool_name, &args).await?;
        Ok(Value::Array(frames))
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        let ws_prov = Self::expect_ws(prov)?;
        let frames = Self::exchange(ws_prov, tool_name, &args).await?;
        Ok(boxed_slice_stream(frames))
    }
}
