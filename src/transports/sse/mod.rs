use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{header, Client, RequestBuilder};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::auth::Auth;
use crate::errors::UtcpError;
use crate::providers::{Provider, ProviderType, SseProvider};
use crate::tools::{Tool, UtcpManual};
use crate::transports::http::error_for_status;
use crate::transports::stream::{boxed_channel_stream, boxed_slice_stream, StreamResult};
use crate::transports::{bare_tool_name, ClientTransport};

/// Driver for Server-Sent Events providers. Calls POST the arguments and
/// parse the response per the EventSource line protocol: `data:` lines
/// accumulate, a blank line commits one JSON event, `id:` lines update the
/// last-event-id used for resumption.
pub struct SseTransport {
    client: Client,
}

impl SseTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn expect_sse<'a>(prov: &'a Provider) -> Result<&'a SseProvider> {
        match prov {
            Provider::Sse(p) => Ok(p),
            other => Err(UtcpError::mismatch(ProviderType::Sse, other.provider_type())),
        }
    }

    fn apply_auth(builder: RequestBuilder, auth: &Auth) -> Result<RequestBuilder> {
        match auth {
            Auth::ApiKey(api_key) => match api_key.location.to_ascii_lowercase().as_str() {
                "header" => Ok(builder.header(&api_key.var_name, &api_key.api_key)),
                "query" => Ok(builder.query(&[(api_key.var_name.clone(), api_key.api_key.clone())])),
                "cookie" => Ok(builder.header(
                    header::COOKIE,
                    format!("{}={}", api_key.var_name, api_key.api_key),
                )),
                other => Err(anyhow!("Unsupported API key location: {other}")),
            },
            Auth::Basic(basic) => Ok(builder.basic_auth(&basic.username, Some(&basic.password))),
            Auth::OAuth2(_) => Err(UtcpError::Unsupported(
                "OAuth2 is not supported by the SSE transport".to_string(),
            )
            .into()),
        }
    }

    fn build_payload(prov: &SseProvider, args: HashMap<String, Value>) -> Value {
        match &prov.body_field {
            Some(field) => json!({ field: args }),
            None => json!(args),
        }
    }

    fn split_headers_from_args(
        prov: &SseProvider,
        mut args: HashMap<String, Value>,
    ) -> (HashMap<String, String>, HashMap<String, Value>) {
        let mut headers = HashMap::new();
        if let Some(header_fields) = &prov.header_fields {
            for field in header_fields {
                if let Some(value) = args.remove(field) {
                    let header_value = match value {
                        Value::String(s) => s,
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        other => other.to_string(),
                    };
                    headers.insert(field.clone(), header_value);
                }
            }
        }
        (headers, args)
    }

    /// Run the SSE line protocol over the response body, pushing one decoded
    /// JSON value per committed event.
    fn spawn_event_reader(
        mut byte_stream: impl futures::Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
    ) -> mpsc::Receiver<Result<Value>> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut data_buf = String::new();
            let mut last_event_id: Option<String> = None;

            while let Some(chunk) = byte_stream.next().await {
                match chunk {
                    Ok(bytes) => buffer.push_str(&String::from_utf8_lossy(&bytes)),
                    Err(err) => {
                        let _ = tx
                            .send(Err(UtcpError::Io(format!("SSE read failed: {err}")).into()))
                            .await;
                        return;
                    }
                }

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);

                    if let Some(data) = line.strip_prefix("data:") {
                        if !data_buf.is_empty() {
                            data_buf.push('\n');
                        }
                        data_buf.push_str(data.strip_prefix(' ').unwrap_or(data));
                    } else if let Some(id) = line.strip_prefix("id:") {
                        last_event_id = Some(id.trim().to_string());
                    } else if line.is_empty() && !data_buf.is_empty() {
                        let parsed = serde_json::from_str::<Value>(&data_buf).map_err(|e| {
                            anyhow::Error::from(UtcpError::Protocol(format!(
                                "invalid SSE event JSON (last id {:?}): {e}",
                                last_event_id
                            )))
                        });
                        let failed = parsed.is_err();
                        if tx.send(parsed).await.is_err() || failed {
                            return;
                        }
                        data_buf.clear();
                    }
                }
            }

            // Flush a trailing event missing its final blank line.
            if !data_buf.is_empty() {
                let parsed = serde_json::from_str::<Value>(&data_buf)
                    .map_err(|e| UtcpError::Protocol(format!("invalid SSE event JSON: {e}")).into());
                let _ = tx.send(parsed).await;
            }
        });
        rx
    }

    async fn send_call(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &SseProvider,
        last_event_id: Option<&str>,
    ) -> Result<reqwest::Response> {
        let call_name = bare_tool_name(tool_name, &prov.name);
        let url = format!("{}/{}", prov.url.trim_end_matches('/'), call_name);

        let (dynamic_headers, payload_args) = Self::split_headers_from_args(prov, args);
        let payload = Self::build_payload(prov, payload_args);

        let mut builder = self
            .client
            .post(url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(id) = last_event_id {
            builder = builder.header("Last-Event-ID", id);
        }
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }
        for (k, v) in &dynamic_headers {
            builder = builder.header(k, v);
        }
        if let Some(auth) = &prov.auth {
            builder = Self::apply_auth(builder, auth)?;
        }
        if let Some(timeout) = prov.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout));
        }

        error_for_status(builder.json(&payload).send().await?).await
    }

    fn is_event_stream(response: &reqwest::Response) -> bool {
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ClientTransport for SseTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let sse_prov = Self::expect_sse(prov)?;

        let mut builder = self
            .client
            .get(&sse_prov.url)
            .header(header::ACCEPT, "application/json");
        if let Some(headers) = &sse_prov.headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }
        if let Some(auth) = &sse_prov.auth {
            builder = Self::apply_auth(builder, auth)?;
        }

        let response = error_for_status(builder.send().await?).await?;
        let document: Value = response
            .json()
            .await
            .map_err(|e| UtcpError::Protocol(format!("Invalid manual JSON: {e}")))?;
        Ok(UtcpManual::from_document(&document)
            .map(|m| m.tools)
            .unwrap_or_default())
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        Self::expect_sse(prov)?;
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        last_event_id: Option<&str>,
    ) -> Result<Value> {
        let sse_prov = Self::expect_sse(prov)?;
        let response = self.send_call(tool_name, args, sse_prov, last_event_id).await?;

        if !Self::is_event_stream(&response) {
            return Ok(response.json().await?);
        }

        let rx = Self::spawn_event_reader(response.bytes_stream());
        let mut stream = boxed_channel_stream(rx, None);
        let items = crate::transports::stream::collect(stream.as_mut()).await?;
        Ok(Value::Array(items))
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        let sse_prov = Self::expect_sse(prov)?;
        let response = self.send_call(tool_name, args, sse_prov, None).await?;

        if !Self::is_event_stream(&response) {
            let value: Value = response.json().await?;
            return Ok(boxed_slice_stream(vec![value]));
        }

        let rx = Self::spawn_event_reader(response.bytes_stream());
        Ok(boxed_channel_stream(rx, None))
    }
}
