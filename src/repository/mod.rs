pub mod in_memory;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::providers::Provider;
use crate::tools::Tool;

/// Keyed storage of providers and their discovered tools. Tool keys are
/// fully-qualified (`provider.tool`) names.
#[async_trait]
pub trait ToolRepository: Send + Sync {
    async fn save_provider_with_tools(&self, prov: Arc<Provider>, tools: Vec<Tool>) -> Result<()>;
    async fn get_provider(&self, name: &str) -> Result<Option<Arc<Provider>>>;
    async fn get_providers(&self) -> Result<Vec<Arc<Provider>>>;
    async fn get_tool(&self, full_name: &str) -> Result<Option<Tool>>;
    async fn get_tools(&self) -> Result<Vec<Tool>>;
    async fn get_tools_by_provider(&self, provider_name: &str) -> Result<Vec<Tool>>;
    async fn remove_provider(&self, name: &str) -> Result<()>;
    async fn remove_tool(&self, full_name: &str) -> Result<()>;
}
