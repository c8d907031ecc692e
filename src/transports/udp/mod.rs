use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::errors::UtcpError;
use crate::providers::{Provider, ProviderType, UdpProvider};
use crate::tools::{Tool, UtcpManual};
use crate::transports::stream::StreamResult;
use crate::transports::ClientTransport;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DATAGRAM: usize = 65_535;

/// Driver for UDP providers: discovery is the ASCII literal `DISCOVER`,
/// calls are one `{tool, args}` datagram answered by one datagram.
pub struct UdpTransport;

impl UdpTransport {
    pub fn new() -> Self {
        Self
    }

    fn expect_udp<'a>(prov: &'a Provider) -> Result<&'a UdpProvider> {
        match prov {
            Provider::Udp(p) => Ok(p),
            other => Err(UtcpError::mismatch(ProviderType::Udp, other.provider_type())),
        }
    }

    async fn exchange(prov: &UdpProvider, payload: &[u8]) -> Result<Vec<u8>> {
        let address = format!("{}:{}", prov.host, prov.port);
        let timeout = prov.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT);

        let round_trip = async {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| UtcpError::Io(format!("UDP bind failed: {e}")))?;
            socket
                .send_to(payload, &address)
                .await
                .map_err(|e| UtcpError::Io(format!("UDP send to {address} failed: {e}")))?;

            let mut buf = vec![0u8; MAX_DATAGRAM];
            let (len, _) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| UtcpError::Io(format!("UDP receive failed: {e}")))?;
            buf.truncate(len);
            Ok::<_, anyhow::Error>(buf)
        };

        tokio::time::timeout(timeout, round_trip)
            .await
            .map_err(|_| UtcpError::Cancelled(format!("UDP exchange with {address} timed out")))?
    }
}

#[async_trait]
impl ClientTransport for UdpTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let udp_prov = Self::expect_udp(prov)?;
        let response = Self::exchange(udp_prov, b"DISCOVER").await?;
        if response.is_empty() {
            return Ok(Vec::new());
        }

        let document: Value = serde_json::from_slice(&response)
            .map_err(|e| UtcpError::Protocol(format!("invalid UDP manual: {e}")))?;
        Ok(UtcpManual::from_document(&document)
            .map(|m| m.tools)
            .unwrap_or_default())
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        Self::expect_udp(prov)?;
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        _last_event_id: Option<&str>,
    ) -> Result<Value> {
        let udp_prov = Self::expect_udp(prov)?;
        let request = serde_json::to_vec(&json!({ "tool": tool_name, "args": args }))?;
        let response = Self::exchange(udp_prov, &request).await?;

        serde_json::from_slice(&response)
            .map_err(|e| UtcpError::Protocol(format!("invalid UDP response: {e}")).into())
    }

    async fn call_tool_stream(
        &self,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        Self::expect_udp(prov)?;
        Err(UtcpError::Unsupported("UDP transport does not stream".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_server<F>(handler: F) -> std::net::SocketAddr
    where
        F: Fn(&[u8]) -> Value + Send + Sync + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let reply = handler(&buf[..len]);
                socket
                    .send_to(&serde_json::to_vec(&reply).unwrap(), peer)
                    .await
                    .ok();
            }
        });
        addr
    }

    #[tokio::test]
    async fn register_sends_discover_literal() {
        let addr = spawn_server(|req| {
            assert_eq!(req, b"DISCOVER");
            json!({
                "version": "1.0",
                "tools": [{ "name": "status", "description": "Status" }]
            })
        })
        .await;

        let prov = Provider::Udp(UdpProvider::new("udp".into(), addr.ip().to_string(), addr.port()));
        let tools = UdpTransport::new().register_tool_provider(&prov).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "status");
    }

    #[tokio::test]
    async fn call_round_trips_one_datagram() {
        let addr = spawn_server(|req| {
            let incoming: Value = serde_json::from_slice(req).unwrap();
            json!({ "received_tool": incoming["tool"], "args": incoming["args"] })
        })
        .await;

        let prov = Provider::Udp(UdpProvider::new("udp".into(), addr.ip().to_string(), addr.port()));
        let mut args = HashMap::new();
        args.insert("value".to_string(), json!("ping"));

        let value = UdpTransport::new()
            .call_tool("udp.echo", args.clone(), &prov, None)
            .await
            .unwrap();
        assert_eq!(value["received_tool"], json!("udp.echo"));
        assert_eq!(value["args"], json!(args));
    }

    #[tokio::test]
    async fn missing_response_times_out_as_cancelled() {
        let mut udp = UdpProvider::new("udp".into(), "127.0.0.1".into(), 9);
        udp.timeout_ms = Some(40);
        let prov = Provider::Udp(udp);

        let err = UdpTransport::new()
            .call_tool("udp.noop", HashMap::new(), &prov, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn stream_is_unsupported_and_variants_are_checked() {
        let transport = UdpTransport::new();
        let prov = Provider::Udp(UdpProvider::new("udp".into(), "127.0.0.1".into(), 9));

        let err = transport
            .call_tool_stream("udp.x", HashMap::new(), &prov)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Unsupported(_))
        ));

        let wrong = Provider::Tcp(crate::providers::TcpProvider::new(
            "t".into(),
            "127.0.0.1".into(),
            9,
        ));
        let err = transport.register_tool_provider(&wrong).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::TransportMismatch { .. })
        ));
    }
}
