use serde::{Deserialize, Serialize};

use crate::auth::Auth;

/// Provider reached over gRPC. The default service is the UTCP tool service;
/// `gnmi.gNMI` providers are routed to the gNMI capability/subscribe flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcProvider {
    #[serde(default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    pub host: String,
    pub port: u16,
    #[serde(default = "GrpcProvider::default_service")]
    pub service_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    #[serde(default)]
    pub use_ssl: bool,
    /// gNMI target; attached as channel authority, outgoing metadata, and
    /// the subscription prefix when set.
    #[serde(default)]
    pub target: String,
}

impl GrpcProvider {
    pub const GNMI_SERVICE: &'static str = "gnmi.gNMI";

    pub fn new(name: String, host: String, port: u16, auth: Option<Auth>) -> Self {
        Self {
            name,
            auth,
            host,
            port,
            service_name: Self::default_service(),
            method_name: None,
            use_ssl: false,
            target: String::new(),
        }
    }

    fn default_service() -> String {
        "utcp.UtcpService".to_string()
    }

    pub fn is_gnmi(&self) -> bool {
        self.service_name == Self::GNMI_SERVICE
    }
}
