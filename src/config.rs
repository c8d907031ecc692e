use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::variables::VariableLoader;

/// Client configuration: inline variables, the variable-loader chain, and an
/// optional providers file registered at construction.
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub variables: HashMap<String, String>,
    pub providers_file_path: Option<PathBuf>,
    pub variable_loaders: Vec<Arc<dyn VariableLoader>>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_providers_file(mut self, path: PathBuf) -> Self {
        self.providers_file_path = Some(path);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_variables(mut self, vars: HashMap<String, String>) -> Self {
        self.variables.extend(vars);
        self
    }

    pub fn with_variable_loader(mut self, loader: Arc<dyn VariableLoader>) -> Self {
        self.variable_loaders.push(loader);
        self
    }

    /// Layered lookup: inline variables, then each loader in registration
    /// order (first non-empty value wins), then the process environment.
    pub async fn get_variable(&self, key: &str) -> Option<String> {
        if let Some(val) = self.variables.get(key) {
            if !val.is_empty() {
                return Some(val.clone());
            }
        }

        for loader in &self.variable_loaders {
            match loader.get(key).await {
                Ok(Some(val)) if !val.is_empty() => return Some(val),
                _ => {}
            }
        }

        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::DotEnvLoader;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn inline_variables_win_over_loaders_and_env() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "SHARED=from_dotenv").unwrap();

        let config = ClientConfig::new()
            .with_variable("SHARED", "inline")
            .with_variable_loader(Arc::new(DotEnvLoader::new(file.path().to_path_buf())));

        assert_eq!(config.get_variable("SHARED").await.as_deref(), Some("inline"));
    }

    #[tokio::test]
    async fn loader_chain_is_consulted_in_order() {
        let mut first = NamedTempFile::new().unwrap();
        writeln!(first, "KEY=first").unwrap();
        let mut second = NamedTempFile::new().unwrap();
        writeln!(second, "KEY=second\nONLY_SECOND=yes").unwrap();

        let config = ClientConfig::new()
            .with_variable_loader(Arc::new(DotEnvLoader::new(first.path().to_path_buf())))
            .with_variable_loader(Arc::new(DotEnvLoader::new(second.path().to_path_buf())));

        assert_eq!(config.get_variable("KEY").await.as_deref(), Some("first"));
        assert_eq!(
            config.get_variable("ONLY_SECOND").await.as_deref(),
            Some("yes")
        );
        assert_eq!(config.get_variable("MISSING_ENTIRELY").await, None);
    }
}
