//! Variable substitution over JSON-shaped provider configurations.
//!
//! Tokens of the form `${NAME}` or `$NAME` are replaced anywhere a string
//! occurs in the config tree. Lookup is layered (inline config variables,
//! registered loaders in order, process environment); tokens no source can
//! resolve are left verbatim so partially configured providers still load.
//! Values are never re-expanded, so substitution cannot cycle.

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::config::ClientConfig;
use crate::errors::UtcpError;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

/// External variable source (.env file, secret store, ...). `Ok(None)` means
/// "not found here", letting the chain continue.
#[async_trait]
pub trait VariableLoader: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<String>>;
}

/// Loader for `.env`-style files: `KEY=VALUE` lines, `#` comments permitted.
pub struct DotEnvLoader {
    file_path: PathBuf,
}

impl DotEnvLoader {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path }
    }

    async fn load(&self) -> Result<HashMap<String, String>> {
        let contents = tokio::fs::read_to_string(&self.file_path).await?;
        let mut vars = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                vars.insert(
                    key.trim().to_string(),
                    value.trim().trim_matches('"').to_string(),
                );
            }
        }
        Ok(vars)
    }
}

#[async_trait]
impl VariableLoader for DotEnvLoader {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        let vars = self.load().await?;
        Ok(vars.get(name).cloned())
    }
}

/// Collect every token name appearing in string values of the tree.
fn collect_token_names(value: &Value, names: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            for caps in TOKEN_RE.captures_iter(s) {
                if let Some(name) = caps.get(1).or_else(|| caps.get(2)) {
                    names.insert(name.as_str().to_string());
                }
            }
        }
        Value::Object(obj) => {
            for v in obj.values() {
                collect_token_names(v, names);
            }
        }
        Value::Array(arr) => {
            for v in arr {
                collect_token_names(v, names);
            }
        }
        _ => {}
    }
}

fn rewrite(value: &mut Value, resolved: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            let replaced = TOKEN_RE.replace_all(s, |caps: &Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match resolved.get(name) {
                    Some(val) => val.clone(),
                    // Unresolved tokens stay verbatim.
                    None => caps.get(0).unwrap().as_str().to_string(),
                }
            });
            if let std::borrow::Cow::Owned(new) = replaced {
                *s = new;
            }
        }
        Value::Object(obj) => {
            for v in obj.values_mut() {
                rewrite(v, resolved);
            }
        }
        Value::Array(arr) => {
            for v in arr {
                rewrite(v, resolved);
            }
        }
        _ => {}
    }
}

/// Substitute every resolvable token in `value` using the config's layered
/// lookup chain. Names are gathered first and resolved once each, then the
/// tree is rewritten in a single pure pass; resolved values are not
/// re-expanded.
pub async fn substitute(value: &mut Value, config: &ClientConfig) {
    let mut names = HashSet::new();
    collect_token_names(value, &mut names);
    if names.is_empty() {
        return;
    }

    let mut resolved = HashMap::new();
    for name in names {
        if let Some(val) = config.get_variable(&name).await {
            resolved.insert(name, val);
        }
    }

    rewrite(value, &resolved);
}

/// Strict single lookup; errors with the variable name when no source in the
/// chain supplies a non-empty value.
pub async fn get_required(name: &str, config: &ClientConfig) -> Result<String> {
    config
        .get_variable(name)
        .await
        .ok_or_else(|| UtcpError::VariableNotFound(name.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn substitutes_both_token_forms_recursively() {
        let config = ClientConfig::new()
            .with_variable("BASE", "https://x")
            .with_variable("TOKEN", "abc");

        let mut doc = json!({
            "url": "${BASE}/api",
            "headers": { "Authorization": "Bearer $TOKEN" },
            "nested": [ { "again": "${BASE}" }, 42, true ]
        });

        substitute(&mut doc, &config).await;
        assert_eq!(doc["url"], "https://x/api");
        assert_eq!(doc["headers"]["Authorization"], "Bearer abc");
        assert_eq!(doc["nested"][0]["again"], "https://x");
        assert_eq!(doc["nested"][1], 42);
    }

    #[tokio::test]
    async fn unresolved_tokens_are_left_verbatim() {
        let config = ClientConfig::new();
        let mut doc = json!({ "url": "${NOT_SET_ANYWHERE_12345}/api" });
        substitute(&mut doc, &config).await;
        assert_eq!(doc["url"], "${NOT_SET_ANYWHERE_12345}/api");
    }

    #[tokio::test]
    async fn substitution_is_a_fixed_point_without_tokens() {
        let config = ClientConfig::new().with_variable("A", "1");
        let original = json!({
            "url": "https://example.com",
            "note": "costs 5 dollars, no placeholders",
            "n": 3
        });
        let mut doc = original.clone();
        substitute(&mut doc, &config).await;
        assert_eq!(doc, original);
    }

    #[tokio::test]
    async fn values_are_not_transitively_expanded() {
        let config = ClientConfig::new()
            .with_variable("OUTER", "$INNER")
            .with_variable("INNER", "secret");

        let mut doc = json!({ "v": "${OUTER}" });
        substitute(&mut doc, &config).await;
        // The substituted value still reads "$INNER"; no second pass runs.
        assert_eq!(doc["v"], "$INNER");
    }

    #[tokio::test]
    async fn get_required_reports_missing_variable() {
        let config = ClientConfig::new();
        let err = get_required("ABSENT_VAR", &config).await.unwrap_err();
        match err.downcast_ref::<UtcpError>() {
            Some(UtcpError::VariableNotFound(name)) => assert_eq!(name, "ABSENT_VAR"),
            other => panic!("expected VariableNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn dotenv_loader_parses_comments_and_quotes() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# comment line").unwrap();
        writeln!(file, "KEY=\"quoted value\"").unwrap();
        writeln!(file, "PLAIN=raw").unwrap();
        writeln!(file).unwrap();

        let loader = DotEnvLoader::new(file.path().to_path_buf());
        assert_eq!(
            loader.get("KEY").await.unwrap().as_deref(),
            Some("quoted value")
        );
        assert_eq!(loader.get("PLAIN").await.unwrap().as_deref(), Some("raw"));
        assert_eq!(loader.get("NOPE").await.unwrap(), None);
    }
}
