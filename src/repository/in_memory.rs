use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::UtcpError;
use crate::providers::Provider;
use crate::repository::ToolRepository;
use crate::tools::Tool;

/// Default in-memory repository. Providers and their tool lists live and die
/// together; nothing is persisted across process restarts.
#[derive(Default)]
pub struct InMemoryToolRepository {
    providers: RwLock<HashMap<String, Arc<Provider>>>,
    tools: RwLock<HashMap<String, Vec<Tool>>>, // provider_name -> tools
}

impl InMemoryToolRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ToolRepository for InMemoryToolRepository {
    async fn save_provider_with_tools(&self, prov: Arc<Provider>, tools: Vec<Tool>) -> Result<()> {
        let provider_name = prov.name().to_string();

        let mut providers = self.providers.write().await;
        providers.insert(provider_name.clone(), prov);

        let mut tools_lock = self.tools.write().await;
        tools_lock.insert(provider_name, tools);

        Ok(())
    }

    async fn get_provider(&self, name: &str) -> Result<Option<Arc<Provider>>> {
        let providers = self.providers.read().await;
        Ok(providers.get(name).cloned())
    }

    async fn get_providers(&self) -> Result<Vec<Arc<Provider>>> {
        let providers = self.providers.read().await;
        Ok(providers.values().cloned().collect())
    }

    async fn get_tool(&self, full_name: &str) -> Result<Option<Tool>> {
        let tools = self.tools.read().await;
        if let Some((provider_name, _)) = full_name.split_once('.') {
            if let Some(list) = tools.get(provider_name) {
                return Ok(list.iter().find(|t| t.name == full_name).cloned());
            }
        }
        Ok(tools
            .values()
            .flatten()
            .find(|t| t.name == full_name)
            .cloned())
    }

    async fn get_tools(&self) -> Result<Vec<Tool>> {
        let tools = self.tools.read().await;
        let mut all = Vec::new();
        for list in tools.values() {
            all.extend(list.clone());
        }
        Ok(all)
    }

    async fn get_tools_by_provider(&self, provider_name: &str) -> Result<Vec<Tool>> {
        let tools = self.tools.read().await;
        match tools.get(provider_name) {
            Some(list) => Ok(list.clone()),
            None => Err(UtcpError::ProviderNotFound(provider_name.to_string()).into()),
        }
    }

    async fn remove_provider(&self, name: &str) -> Result<()> {
        let mut providers = self.providers.write().await;
        if providers.remove(name).is_none() {
            return Err(UtcpError::ProviderNotFound(name.to_string()).into());
        }
        let mut tools = self.tools.write().await;
        tools.remove(name);
        Ok(())
    }

    async fn remove_tool(&self, full_name: &str) -> Result<()> {
        let mut tools = self.tools.write().await;
        for list in tools.values_mut() {
            if let Some(pos) = list.iter().position(|t| t.name == full_name) {
                list.remove(pos);
                return Ok(());
            }
        }
        Err(UtcpError::ToolNotFound(full_name.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::TcpProvider;

    fn provider(name: &str) -> Arc<Provider> {
        Arc::new(Provider::Tcp(TcpProvider::new(
            name.to_string(),
            "127.0.0.1".into(),
            9000,
        )))
    }

    #[tokio::test]
    async fn save_get_and_remove_round_trip() {
        let repo = InMemoryToolRepository::new();
        let tools = vec![Tool::new("demo.echo", "Echo"), Tool::new("demo.add", "Add")];
        repo.save_provider_with_tools(provider("demo"), tools)
            .await
            .unwrap();

        assert!(repo.get_provider("demo").await.unwrap().is_some());
        assert_eq!(repo.get_tools().await.unwrap().len(), 2);
        assert_eq!(repo.get_tools_by_provider("demo").await.unwrap().len(), 2);

        let tool = repo.get_tool("demo.echo").await.unwrap().unwrap();
        assert_eq!(tool.description, "Echo");
        assert!(repo.get_tool("demo.missing").await.unwrap().is_none());

        repo.remove_tool("demo.add").await.unwrap();
        assert_eq!(repo.get_tools_by_provider("demo").await.unwrap().len(), 1);

        repo.remove_provider("demo").await.unwrap();
        assert!(repo.get_provider("demo").await.unwrap().is_none());
        assert!(repo.get_tools_by_provider("demo").await.is_err());
    }

    #[tokio::test]
    async fn removing_unknown_entries_is_a_typed_error() {
        let repo = InMemoryToolRepository::new();
        let err = repo.remove_provider("ghost").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::ProviderNotFound(_))
        ));

        let err = repo.remove_tool("ghost.tool").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::ToolNotFound(_))
        ));
    }
}
