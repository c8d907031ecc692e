use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::UtcpError;
use crate::providers::{Provider, ProviderType, TcpProvider};
use crate::tools::{Tool, UtcpManual};
use crate::transports::stream::StreamResult;
use crate::transports::ClientTransport;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Driver for raw-TCP providers: one connection per exchange, a single JSON
/// document each way, write half shut down to mark end of request.
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }

    fn expect_tcp<'a>(prov: &'a Provider) -> Result<&'a TcpProvider> {
        match prov {
            Provider::Tcp(p) => Ok(p),
            other => Err(UtcpError::mismatch(ProviderType::Tcp, other.provider_type())),
        }
    }

    fn timeout(prov: &TcpProvider) -> Duration {
        prov.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT)
    }

    async fn round_trip(prov: &TcpProvider, payload: &[u8]) -> Result<Vec<u8>> {
        let address = format!("{}:{}", prov.host, prov.port);
        let exchange = async {
            let mut stream = TcpStream::connect(&address)
                .await
                .map_err(|e| UtcpError::Io(format!("TCP dial {address} failed: {e}")))?;
            stream.write_all(payload).await?;
            stream.flush().await?;
            stream.shutdown().await?;

            let mut response = Vec::new();
            stream.read_to_end(&mut response).await?;
            Ok::<_, anyhow::Error>(response)
        };

        tokio::time::timeout(Self::timeout(prov), exchange)
            .await
            .map_err(|_| UtcpError::Cancelled(format!("TCP exchange with {address} timed out")))?
    }
}

#[async_trait]
impl ClientTransport for TcpTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let tcp_prov = Self::expect_tcp(prov)?;
        let request = serde_json::to_vec(&json!({ "action": "list" }))?;
        let response = Self::round_trip(tcp_prov, &request).await?;
        if response.is_empty() {
            return Ok(Vec::new());
        }

        let document: Value = serde_json::from_slice(&response)
            .map_err(|e| UtcpError::Protocol(format!("invalid TCP manual: {e}")))?;
        Ok(UtcpManual::from_document(&document)
            .map(|m| m.tools)
            .unwrap_or_default())
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        Self::expect_tcp(prov)?;
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        _last_event_id: Option<&str>,
    ) -> Result<Value> {
        let tcp_prov = Self::expect_tcp(prov)?;
        let request = serde_json::to_vec(&json!({ "tool": tool_name, "args": args }))?;
        let response = Self::round_trip(tcp_prov, &request).await?;

        // Peer closing without writing anything is a null result, not an error.
        if response.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&response)
            .map_err(|e| UtcpError::Protocol(format!("invalid TCP response: {e}")).into())
    }

    async fn call_tool_stream(
        &self,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        Self::expect_tcp(prov)?;
        Err(UtcpError::Unsupported("TCP transport does not stream".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_server<F>(handler: F) -> std::net::SocketAddr
    where
        F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut request = Vec::new();
                socket.read_to_end(&mut request).await.unwrap();
                let parsed: Value = serde_json::from_slice(&request).unwrap();
                if let Some(reply) = handler(parsed) {
                    socket
                        .write_all(&serde_json::to_vec(&reply).unwrap())
                        .await
                        .unwrap();
                }
                socket.shutdown().await.ok();
            }
        });
        addr
    }

    #[tokio::test]
    async fn register_sends_list_action_and_parses_manual() {
        let addr = spawn_server(|req| {
            assert_eq!(req, json!({ "action": "list" }));
            Some(json!({
                "version": "1.0",
                "tools": [{ "name": "ping", "description": "Ping" }]
            }))
        })
        .await;

        let prov = Provider::Tcp(TcpProvider::new("tcp".into(), addr.ip().to_string(), addr.port()));
        let tools = TcpTransport::new().register_tool_provider(&prov).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ping");
    }

    #[tokio::test]
    async fn call_round_trips_one_json_document() {
        let addr = spawn_server(|req| {
            assert_eq!(req["tool"], json!("tcp.ping"));
            Some(json!({ "pong": req["args"] }))
        })
        .await;

        let prov = Provider::Tcp(TcpProvider::new("tcp".into(), addr.ip().to_string(), addr.port()));
        let mut args = HashMap::new();
        args.insert("seq".to_string(), json!(1));

        let value = TcpTransport::new()
            .call_tool("tcp.ping", args, &prov, None)
            .await
            .unwrap();
        assert_eq!(value, json!({ "pong": { "seq": 1 } }));
    }

    #[tokio::test]
    async fn eof_before_any_bytes_is_null() {
        let addr = spawn_server(|_| None).await;
        let prov = Provider::Tcp(TcpProvider::new("tcp".into(), addr.ip().to_string(), addr.port()));

        let value = TcpTransport::new()
            .call_tool("tcp.silent", HashMap::new(), &prov, None)
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn dial_failure_is_io_error_and_stream_is_unsupported() {
        // Bind a listener and drop it so the port is dead.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prov = Provider::Tcp(TcpProvider::new("tcp".into(), addr.ip().to_string(), addr.port()));
        let transport = TcpTransport::new();

        let err = transport
            .call_tool("tcp.x", HashMap::new(), &prov, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Io(_))
        ));

        let err = transport
            .call_tool_stream("tcp.x", HashMap::new(), &prov)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Unsupported(_))
        ));
    }
}
