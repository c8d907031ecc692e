use std::collections::HashMap;
use std::sync::Arc;

use crate::providers::ProviderType;
use crate::transports::ClientTransport;

/// Transport drivers keyed by provider type. Built once at client creation;
/// the same provider type always dispatches to the same driver instance for
/// the lifetime of the process.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    map: HashMap<ProviderType, Arc<dyn ClientTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry covering every built-in wire protocol.
    pub fn with_default_transports() -> Self {
        let mut reg = Self::new();
        reg.register(
            ProviderType::Http,
            Arc::new(crate::transports::http::HttpTransport::new()),
        );
        reg.register(
            ProviderType::HttpStream,
            Arc::new(crate::transports::http_stream::HttpStreamTransport::new()),
        );
        reg.register(
            ProviderType::Sse,
            Arc::new(crate::transports::sse::SseTransport::new()),
        );
        reg.register(
            ProviderType::Cli,
            Arc::new(crate::transports::cli::CliTransport::new()),
        );
        reg.register(
            ProviderType::Websocket,
            Arc::new(crate::transports::websocket::WebSocketTransport::new()),
        );
        reg.register(
            ProviderType::Grpc,
            Arc::new(crate::transports::grpc::GrpcTransport::new()),
        );
        reg.register(
            ProviderType::Graphql,
            Arc::new(crate::transports::graphql::GraphQlTransport::new()),
        );
        reg.register(
            ProviderType::Tcp,
            Arc::new(crate::transports::tcp::TcpTransport::new()),
        );
        reg.register(
            ProviderType::Udp,
            Arc::new(crate::transports::udp::UdpTransport::new()),
        );
        reg.register(
            ProviderType::Webrtc,
            Arc::new(crate::transports::webrtc::WebRtcTransport::new()),
        );
        reg.register(
            ProviderType::Mcp,
            Arc::new(crate::transports::mcp::McpTransport::new()),
        );
        reg.register(
            ProviderType::Text,
            Arc::new(crate::transports::text::TextTransport::new()),
        );
        reg
    }

    pub fn register(&mut self, key: ProviderType, transport: Arc<dyn ClientTransport>) {
        self.map.insert(key, transport);
    }

    pub fn get(&self, key: ProviderType) -> Option<Arc<dyn ClientTransport>> {
        self.map.get(&key).cloned()
    }

    pub fn as_map(&self) -> HashMap<ProviderType, Arc<dyn ClientTransport>> {
        self.map.clone()
    }
}
