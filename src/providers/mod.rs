pub mod cli;
pub mod graphql;
pub mod grpc;
pub mod http;
pub mod http_stream;
pub mod mcp;
pub mod sse;
pub mod tcp;
pub mod text;
pub mod udp;
pub mod webrtc;
pub mod websocket;

use serde::{Deserialize, Serialize};

use crate::auth::Auth;

pub use cli::CliProvider;
pub use graphql::GraphqlProvider;
pub use grpc::GrpcProvider;
pub use http::HttpProvider;
pub use http_stream::HttpStreamProvider;
pub use mcp::McpProvider;
pub use sse::SseProvider;
pub use tcp::TcpProvider;
pub use text::{TextProvider, TextTemplate};
pub use udp::UdpProvider;
pub use webrtc::{IceServer, WebRtcProvider};
pub use websocket::WebSocketProvider;

/// Discriminant of the provider union; also the transport-registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Http,
    HttpStream,
    Sse,
    Cli,
    Websocket,
    Grpc,
    Graphql,
    Tcp,
    Udp,
    Webrtc,
    Mcp,
    Text,
}

impl ProviderType {
    pub fn as_key(&self) -> &'static str {
        match self {
            ProviderType::Http => "http",
            ProviderType::HttpStream => "http_stream",
            ProviderType::Sse => "sse",
            ProviderType::Cli => "cli",
            ProviderType::Websocket => "websocket",
            ProviderType::Grpc => "grpc",
            ProviderType::Graphql => "graphql",
            ProviderType::Tcp => "tcp",
            ProviderType::Udp => "udp",
            ProviderType::Webrtc => "webrtc",
            ProviderType::Mcp => "mcp",
            ProviderType::Text => "text",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_key())
    }
}

/// Configuration of a tool source, dispatched on the `provider_type` tag.
///
/// Every variant shares the `name`/`auth` header; accessors below centralize
/// that access so transports and the client never switch over raw documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider_type", rename_all = "snake_case")]
pub enum Provider {
    Http(HttpProvider),
    HttpStream(HttpStreamProvider),
    Sse(SseProvider),
    Cli(CliProvider),
    Websocket(WebSocketProvider),
    Grpc(GrpcProvider),
    Graphql(GraphqlProvider),
    Tcp(TcpProvider),
    Udp(UdpProvider),
    Webrtc(WebRtcProvider),
    Mcp(McpProvider),
    Text(TextProvider),
}

impl Provider {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            Provider::Http(_) => ProviderType::Http,
            Provider::HttpStream(_) => ProviderType::HttpStream,
            Provider::Sse(_) => ProviderType::Sse,
            Provider::Cli(_) => ProviderType::Cli,
            Provider::Websocket(_) => ProviderType::Websocket,
            Provider::Grpc(_) => ProviderType::Grpc,
            Provider::Graphql(_) => ProviderType::Graphql,
            Provider::Tcp(_) => ProviderType::Tcp,
            Provider::Udp(_) => ProviderType::Udp,
            Provider::Webrtc(_) => ProviderType::Webrtc,
            Provider::Mcp(_) => ProviderType::Mcp,
            Provider::Text(_) => ProviderType::Text,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Provider::Http(p) => &p.name,
            Provider::HttpStream(p) => &p.name,
            Provider::Sse(p) => &p.name,
            Provider::Cli(p) => &p.name,
            Provider::Websocket(p) => &p.name,
            Provider::Grpc(p) => &p.name,
            Provider::Graphql(p) => &p.name,
            Provider::Tcp(p) => &p.name,
            Provider::Udp(p) => &p.name,
            Provider::Webrtc(p) => &p.name,
            Provider::Mcp(p) => &p.name,
            Provider::Text(p) => &p.name,
        }
    }

    pub fn set_name(&mut self, name: String) {
        match self {
            Provider::Http(p) => p.name = name,
            Provider::HttpStream(p) => p.name = name,
            Provider::Sse(p) => p.name = name,
            Provider::Cli(p) => p.name = name,
            Provider::Websocket(p) => p.name = name,
            Provider::Grpc(p) => p.name = name,
            Provider::Graphql(p) => p.name = name,
            Provider::Tcp(p) => p.name = name,
            Provider::Udp(p) => p.name = name,
            Provider::Webrtc(p) => p.name = name,
            Provider::Mcp(p) => p.name = name,
            Provider::Text(p) => p.name = name,
        }
    }

    pub fn auth(&self) -> Option<&Auth> {
        match self {
            Provider::Http(p) => p.auth.as_ref(),
            Provider::HttpStream(p) => p.auth.as_ref(),
            Provider::Sse(p) => p.auth.as_ref(),
            Provider::Cli(p) => p.auth.as_ref(),
            Provider::Websocket(p) => p.auth.as_ref(),
            Provider::Grpc(p) => p.auth.as_ref(),
            Provider::Graphql(p) => p.auth.as_ref(),
            Provider::Tcp(p) => p.auth.as_ref(),
            Provider::Udp(p) => p.auth.as_ref(),
            Provider::Webrtc(p) => p.auth.as_ref(),
            Provider::Mcp(p) => p.auth.as_ref(),
            Provider::Text(p) => p.auth.as_ref(),
        }
    }

    /// Provider names may not contain `.` (reserved as the tool-name
    /// separator); dots are replaced with underscores at registration.
    pub fn sanitize_name(&mut self) {
        let name = self.name();
        if name.contains('.') {
            let sanitized = name.replace('.', "_");
            self.set_name(sanitized);
        }
    }
}
