pub mod cli;
pub mod graphql;
pub mod grpc;
pub mod http;
pub mod http_stream;
pub mod mcp;
pub mod registry;
pub mod sse;
pub mod stream;
pub mod tcp;
pub mod text;
pub mod udp;
pub mod webrtc;
pub mod websocket;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::providers::Provider;
use crate::tools::Tool;
use crate::transports::stream::StreamResult;

pub use registry::TransportRegistry;

/// Wire-protocol contract every transport driver implements. Drivers receive
/// the full provider union and must reject variants they do not own with a
/// typed `TransportMismatch` error; drivers without a streaming mode return a
/// typed `Unsupported` error from `call_tool_stream` rather than omitting it.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Discover the provider's tools (fetch/parse its manual).
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>>;

    /// Release any per-provider resources (connections, child processes).
    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()>;

    /// Unary invocation. `last_event_id` is forwarded by drivers that support
    /// resumption (SSE); others ignore it.
    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        last_event_id: Option<&str>,
    ) -> Result<Value>;

    /// Streaming invocation.
    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>>;
}

/// Strip the `"<provider>."` prefix from a registered tool name, yielding the
/// name the remote side knows.
pub(crate) fn bare_tool_name<'a>(tool_name: &'a str, provider_name: &str) -> &'a str {
    tool_name
        .strip_prefix(provider_name)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(tool_name)
}
