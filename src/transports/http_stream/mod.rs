use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, RequestBuilder};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::auth::Auth;
use crate::errors::UtcpError;
use crate::openapi::OpenApiConverter;
use crate::providers::{HttpStreamProvider, Provider, ProviderType};
use crate::tools::{Tool, UtcpManual};
use crate::transports::http::security::enforce_secure_url;
use crate::transports::http::{body_prefix, error_for_status};
use crate::transports::stream::{boxed_channel_stream, StreamResult};
use crate::transports::{bare_tool_name, ClientTransport};

/// Driver for chunked-HTTP providers: one request, a body containing a
/// sequence of JSON values (NDJSON or JSON text sequence), decoded
/// incrementally and delivered through a bounded channel stream.
pub struct HttpStreamTransport {
    client: Client,
}

impl HttpStreamTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn expect_stream<'a>(prov: &'a Provider) -> Result<&'a HttpStreamProvider> {
        match prov {
            Provider::HttpStream(p) => Ok(p),
            other => Err(UtcpError::mismatch(
                ProviderType::HttpStream,
                other.provider_type(),
            )),
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
                "OAuth2 is handled by the HTTP transport, not the stream transport".to_string(),
            )
            .into()),
        }
    }

    fn build_request(
        &self,
        prov: &HttpStreamProvider,
        url: &str,
        args: &HashMap<String, Value>,
    ) -> Result<RequestBuilder> {
        let method = prov.http_method.to_ascii_uppercase();
        let mut builder = match method.as_str() {
            "GET" => self.client.get(url).query(args),
            "POST" => self.client.post(url).json(args),
            "PUT" => self.client.put(url).json(args),
            "DELETE" => self.client.delete(url).json(args),
            "PATCH" => self.client.patch(url).json(args),
            other => {
                return Err(UtcpError::Config(format!("Unsupported HTTP method: {other}")).into())
            }
        };
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
        Ok(builder)
    }

    async fn open_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &HttpStreamProvider,
    ) -> Result<Box<dyn StreamResult>> {
        enforce_secure_url(&prov.url)?;
        let call_name = bare_tool_name(tool_name, &prov.name);
        let url = format!("{}/{}", prov.url.trim_end_matches('/'), call_name);

        let response = self.build_request(prov, &url, &args)?.send().await?;
        let response = error_for_status(response).await?;

        let mut byte_stream = response.bytes_stream();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = byte_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        // JSON text sequences separate values with RS (0x1E);
                        // drop separators so one decoder handles both framings.
                        buf.extend(bytes.iter().filter(|b| **b != 0x1E));
                        match drain_complete_values(&mut buf) {
                            Ok(values) => {
                                for value in values {
                                    if tx.send(Ok(value)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(Err(UtcpError::Io(format!("stream read failed: {err}")).into()))
                            .await;
                        return;
                    }
                }
            }
            // Trailing bytes that never became a full value are a framing error.
            if !buf.iter().all(|b| b.is_ascii_whitespace()) {
                let _ = tx
                    .send(Err(UtcpError::Protocol(format!(
                        "truncated JSON frame: {}",
                        body_prefix(&String::from_utf8_lossy(&buf))
                    ))
                    .into()))
                    .await;
            }
        });

        Ok(boxed_channel_stream(rx, None))
    }
}

/// Extract every complete JSON value from the front of `buf`, leaving any
/// incomplete tail in place for the next chunk.
fn drain_complete_values(buf: &mut Vec<u8>) -> Result<Vec<Value>> {
    let mut values = Vec::new();
    let mut consumed = 0usize;
    {
        let mut iter = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
        loop {
            match iter.next() {
                Some(Ok(value)) => {
                    values.push(value);
                    consumed = iter.byte_offset();
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    return Err(UtcpError::Protocol(format!("invalid JSON frame: {e}")).into())
                }
                None => break,
            }
        }
    }
    buf.drain(..consumed);
    Ok(values)
}

#[async_trait]
impl ClientTransport for HttpStreamTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let stream_prov = Self::expect_stream(prov)?;
        enforce_secure_url(&stream_prov.url)?;

        let mut builder = self.client.get(&stream_prov.url);
        if let Some(headers) = &stream_prov.headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }
        if let Some(auth) = &stream_prov.auth {
            builder = Self::apply_auth(builder, auth)?;
        }

        let response = error_for_status(builder.send().await?).await?;
        let document: Value = response
            .json()
            .await
            .map_err(|e| UtcpError::Protocol(format!("Invalid manual JSON: {e}")))?;

        if let Some(manual) = UtcpManual::from_document(&document) {
            return Ok(manual.tools);
        }
        let manual = OpenApiConverter::new(
            document,
            Some(stream_prov.url.clone()),
            Some(stream_prov.name.clone()),
        )
        .convert();
        Ok(manual.tools)
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        Self::expect_stream(prov)?;
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        _last_event_id: Option<&str>,
    ) -> Result<Value> {
        let stream_prov = Self::expect_stream(prov)?;
        let mut stream = self.open_stream(tool_name, args, stream_prov).await?;
        let items = crate::transports::stream::collect(stream.as_mut()).await?;
        match items.len() {
            0 => Ok(Value::Null),
            1 => Ok(items.into_iter().next().unwrap()),
            _ => Ok(Value::Array(items)),
        }
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        let stream_prov = Self::expect_stream(prov)?;
        self.open_stream(tool_name, args, stream_prov).await
    }
}
