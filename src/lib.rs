//! Client runtime for the Universal Tool Calling Protocol (UTCP).
//!
//! The [`UtcpClient`] multiplexer routes namespaced tool names
//! (`provider.tool`) to transport drivers, one per wire protocol, and keeps
//! two caches coherent with the tool repository: provider-name → discovered
//! tools, and full tool name → resolution (provider snapshot, transport
//! handle, remote call name).

pub mod auth;
pub mod config;
pub mod errors;
pub mod grpcpb;
pub mod loader;
pub mod openapi;
pub mod providers;
pub mod repository;
pub mod search;
pub mod tools;
pub mod transports;
pub mod variables;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::errors::UtcpError;
use crate::providers::{Provider, ProviderType};
use crate::repository::ToolRepository;
use crate::tools::{Tool, ToolSearchStrategy};
use crate::transports::stream::{boxed_slice_stream, StreamResult};
use crate::transports::{ClientTransport, TransportRegistry};

const DEFAULT_CHAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-facing contract of the multiplexer; implemented by [`UtcpClient`]
/// and mockable in embedding code.
#[async_trait]
pub trait UtcpClientInterface: Send + Sync {
    async fn register_tool_provider(&self, prov: Provider) -> Result<Vec<Tool>>;
    async fn register_tool_provider_with_tools(
        &self,
        prov: Provider,
        tools: Vec<Tool>,
    ) -> Result<Vec<Tool>>;
    async fn deregister_tool_provider(&self, provider_name: &str) -> Result<()>;
    async fn call_tool(&self, tool_name: &str, args: HashMap<String, Value>) -> Result<Value>;
    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
    ) -> Result<Box<dyn StreamResult>>;
    async fn search_tools(&self, query: &str, limit: usize) -> Result<Vec<Tool>>;
}

/// One step of a sequential tool chain.
#[derive(Debug, Clone)]
pub struct ToolCallStep {
    pub tool_name: String,
    pub inputs: HashMap<String, Value>,
    /// Merge accumulated prior results (keyed by tool name) into the inputs,
    /// without overriding explicitly provided keys.
    pub use_previous: bool,
}

impl ToolCallStep {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            inputs: HashMap::new(),
            use_previous: false,
        }
    }

    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_previous(mut self) -> Self {
        self.use_previous = true;
        self
    }
}

/// Why a chain stopped early.
#[derive(Debug)]
pub struct ChainFailure {
    pub step_index: usize,
    pub tool_name: String,
    pub elapsed: Duration,
    pub error: anyhow::Error,
}

/// Chain output: results per completed step, plus the failure that aborted
/// the chain, if any.
#[derive(Debug)]
pub struct ChainOutcome {
    pub results: HashMap<String, Value>,
    pub failure: Option<ChainFailure>,
}

#[derive(Clone)]
struct ResolvedTool {
    provider: Arc<Provider>,
    transport: Arc<dyn ClientTransport>,
    call_name: String,
    tool: Tool,
}

pub struct UtcpClient {
    config: ClientConfig,
    transports: TransportRegistry,
    tool_repository: Arc<dyn ToolRepository>,
    search_strategy: Arc<dyn ToolSearchStrategy>,

    provider_tools_cache: RwLock<HashMap<String, Vec<Tool>>>,
    resolution_cache: RwLock<HashMap<String, ResolvedTool>>,
}

impl UtcpClient {
    /// Create a client with the default transport set and load the
    /// configured providers file, if any. Per-provider load failures are
    /// logged and skipped.
    pub async fn new(
        config: ClientConfig,
        repository: Arc<dyn ToolRepository>,
        search_strategy: Arc<dyn ToolSearchStrategy>,
    ) -> Result<Self> {
        Self::with_transports(
            config,
            repository,
            search_strategy,
            TransportRegistry::with_default_transports(),
        )
        .await
    }

    pub async fn with_transports(
        config: ClientConfig,
        repository: Arc<dyn ToolRepository>,
        search_strategy: Arc<dyn ToolSearchStrategy>,
        transports: TransportRegistry,
    ) -> Result<Self> {
        let client = Self {
            config,
            transports,
            tool_repository: repository,
            search_strategy,
            provider_tools_cache: RwLock::new(HashMap::new()),
            resolution_cache: RwLock::new(HashMap::new()),
        };

        if let Some(path) = client.config.providers_file_path.clone() {
            let loaded = loader::load_providers_from_file(&path, &client.config).await?;
            for warning in &loaded.warnings {
                warn!(index = warning.index, error = %warning.error, "provider skipped at load");
            }
            for provider in loaded.providers {
                let name = provider.name().to_string();
                if let Err(error) = client.register_tool_provider(provider).await {
                    warn!(provider = %name, %error, "provider registration failed at load");
                }
            }
        }

        Ok(client)
    }

    fn transport_for(&self, provider_type: ProviderType) -> Result<Arc<dyn ClientTransport>> {
        self.transports.get(provider_type).ok_or_else(|| {
            UtcpError::Config(format!("no transport registered for provider type '{provider_type}'"))
                .into()
        })
    }

    /// Re-run variable substitution over a provider's serialized form.
    async fn substitute_provider(&self, provider: &Provider) -> Result<Provider> {
        let mut raw = serde_json::to_value(provider)?;
        variables::substitute(&mut raw, &self.config).await;
        Ok(serde_json::from_value(raw)?)
    }

    /// MCP servers know their tools by bare name; every other transport
    /// receives the prefixed name unchanged.
    fn call_name_for(provider_type: ProviderType, tool_name: &str) -> String {
        match provider_type {
            ProviderType::Mcp => tool_name
                .split_once('.')
                .map(|(_, bare)| bare.to_string())
                .unwrap_or_else(|| tool_name.to_string()),
            _ => tool_name.to_string(),
        }
    }

    fn prefix_tools(provider: &Provider, tools: Vec<Tool>) -> Vec<Tool> {
        let prefix = format!("{}.", provider.name());
        tools
            .into_iter()
            .map(|mut tool| {
                if !tool.name.starts_with(&prefix) {
                    tool.name = format!("{prefix}{}", tool.name.trim_start_matches('.'));
                }
                if tool.provider.is_none() {
                    tool.provider = Some(provider.clone());
                }
                tool
            })
            .collect()
    }

    /// Install a provider and its tools into the repository and both caches.
    /// The caches are updated under both write locks so a concurrent reader
    /// never observes one without the other.
    async fn install(
        &self,
        provider: Provider,
        transport: Arc<dyn ClientTransport>,
        tools: Vec<Tool>,
    ) -> Result<Vec<Tool>> {
        let provider = Arc::new(provider);
        self.tool_repository
            .save_provider_with_tools(provider.clone(), tools.clone())
            .await?;

        let mut provider_tools = self.provider_tools_cache.write().await;
        let mut resolutions = self.resolution_cache.write().await;
        provider_tools.insert(provider.name().to_string(), tools.clone());
        for tool in &tools {
            // Tools may carry their own call template (per-path URLs from
            // OpenAPI conversion, per-tool call endpoints from manuals);
            // dispatch follows that snapshot when present.
            let dispatch = match &tool.provider {
                Some(own) => Arc::new(own.clone()),
                None => provider.clone(),
            };
            let transport = if dispatch.provider_type() == provider.provider_type() {
                transport.clone()
            } else {
                self.transport_for(dispatch.provider_type())?
            };
            resolutions.insert(
                tool.name.clone(),
                ResolvedTool {
                    call_name: Self::call_name_for(dispatch.provider_type(), &tool.name),
                    provider: dispatch,
                    transport,
                    tool: tool.clone(),
                },
            );
        }
        Ok(tools)
    }

    async fn resolve(&self, tool_name: &str) -> Result<ResolvedTool> {
        {
            let cache = self.resolution_cache.read().await;
            if let Some(resolved) = cache.get(tool_name) {
                return Ok(resolved.clone());
            }
        }

        let (provider_name, _) = tool_name
            .split_once('.')
            .filter(|(prefix, _)| !prefix.is_empty())
            .ok_or_else(|| {
                UtcpError::ToolNotFound(format!(
                    "malformed tool name '{tool_name}' (expected provider.tool)"
                ))
            })?;

        let provider = self
            .tool_repository
            .get_provider(provider_name)
            .await?
            .ok_or_else(|| UtcpError::ProviderNotFound(provider_name.to_string()))?;
        let tool = self
            .tool_repository
            .get_tool(tool_name)
            .await?
            .ok_or_else(|| UtcpError::ToolNotFound(tool_name.to_string()))?;

        // Resolve against a fresh deep clone so re-substitution can never
        // mutate the repository-owned provider. A tool-level call template
        // takes precedence over the registered provider.
        let dispatch = match &tool.provider {
            Some(own) => own.clone(),
            None => provider.as_ref().clone(),
        };
        let provider = Arc::new(self.substitute_provider(&dispatch).await?);
        let transport = self.transport_for(provider.provider_type())?;

        let resolved = ResolvedTool {
            call_name: Self::call_name_for(provider.provider_type(), tool_name),
            provider,
            transport,
            tool,
        };

        let mut cache = self.resolution_cache.write().await;
        cache.insert(tool_name.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Execute a sequence of tool calls under one deadline. Results
    /// accumulate keyed by tool name; the first failure aborts the chain and
    /// is reported with its step index and elapsed time.
    pub async fn call_tool_chain(
        &self,
        steps: &[ToolCallStep],
        timeout: Option<Duration>,
    ) -> ChainOutcome {
        let deadline = timeout.unwrap_or(DEFAULT_CHAIN_TIMEOUT);
        let started = Instant::now();
        let mut results: HashMap<String, Value> = HashMap::new();

        for (step_index, step) in steps.iter().enumerate() {
            let mut inputs = step.inputs.clone();
            if step.use_previous {
                for (name, value) in &results {
                    inputs.entry(name.clone()).or_insert_with(|| value.clone());
                }
            }

            let remaining = deadline.saturating_sub(started.elapsed());
            let outcome = if remaining.is_zero() {
                Err(UtcpError::Cancelled("chain deadline exhausted".to_string()).into())
            } else {
                match tokio::time::timeout(remaining, self.call_tool(&step.tool_name, inputs)).await
                {
                    Ok(result) => result,
                    Err(_) => {
                        Err(UtcpError::Cancelled("chain deadline exhausted".to_string()).into())
                    }
                }
            };

            match outcome {
                Ok(value) => {
                    results.insert(step.tool_name.clone(), value);
                }
                Err(error) => {
                    return ChainOutcome {
                        results,
                        failure: Some(ChainFailure {
                            step_index,
                            tool_name: step.tool_name.clone(),
                            elapsed: started.elapsed(),
                            error,
                        }),
                    }
                }
            }
        }

        ChainOutcome {
            results,
            failure: None,
        }
    }
}

#[async_trait]
impl UtcpClientInterface for UtcpClient {
    async fn register_tool_provider(&self, prov: Provider) -> Result<Vec<Tool>> {
        self.register_tool_provider_with_tools(prov, Vec::new()).await
    }

    async fn register_tool_provider_with_tools(
        &self,
        prov: Provider,
        tools_override: Vec<Tool>,
    ) -> Result<Vec<Tool>> {
        let mut provider = self.substitute_provider(&prov).await?;
        provider.sanitize_name();
        if provider.name().is_empty() {
            return Err(UtcpError::Config("provider name must not be empty".to_string()).into());
        }
        if let Some(auth) = provider.auth() {
            auth.validate().map_err(UtcpError::Auth)?;
        }

        let transport = self.transport_for(provider.provider_type())?;
        let tools = if tools_override.is_empty() {
            transport.register_tool_provider(&provider).await?
        } else {
            tools_override
        };

        let tools = Self::prefix_tools(&provider, tools);
        debug!(provider = %provider.name(), tools = tools.len(), "provider registered");
        self.install(provider, transport, tools).await
    }

    async fn deregister_tool_provider(&self, provider_name: &str) -> Result<()> {
        let provider = self
            .tool_repository
            .get_provider(provider_name)
            .await?
            .ok_or_else(|| UtcpError::ProviderNotFound(provider_name.to_string()))?;

        let transport = self.transport_for(provider.provider_type())?;
        // Transport-side teardown is best-effort; local state always goes.
        if let Err(error) = transport.deregister_tool_provider(&provider).await {
            warn!(provider = %provider_name, %error, "transport deregistration failed");
        }

        self.tool_repository.remove_provider(provider_name).await?;

        let prefix = format!("{provider_name}.");
        let mut provider_tools = self.provider_tools_cache.write().await;
        let mut resolutions = self.resolution_cache.write().await;
        provider_tools.remove(provider_name);
        resolutions.retain(|tool_name, resolved| {
            !tool_name.starts_with(&prefix) && resolved.provider.name() != provider_name
        });
        Ok(())
    }

    async fn call_tool(&self, tool_name: &str, args: HashMap<String, Value>) -> Result<Value> {
        let resolved = self.resolve(tool_name).await?;
        if let Some(handler) = &resolved.tool.handler {
            return handler(args);
        }
        resolved
            .transport
            .call_tool(&resolved.call_name, args, &resolved.provider, None)
            .await
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
    ) -> Result<Box<dyn StreamResult>> {
        let resolved = self.resolve(tool_name).await?;
        if let Some(handler) = &resolved.tool.handler {
            let value = handler(args)?;
            return Ok(boxed_slice_stream(vec![value]));
        }
        resolved
            .transport
            .call_tool_stream(&resolved.call_name, args, &resolved.provider)
            .await
    }

    async fn search_tools(&self, query: &str, limit: usize) -> Result<Vec<Tool>> {
        self.search_strategy.search_tools(query, limit).await
    }
}
