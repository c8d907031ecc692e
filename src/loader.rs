//! Provider loading from JSON documents.
//!
//! Three document shapes are accepted: a top-level array of providers, an
//! object with a `providers` field (array or single object), or a bare
//! provider object. Variable substitution runs on the raw mappings before
//! decoding, names are defaulted or sanitized, and per-entry failures are
//! collected as warnings so one bad provider never aborts a load.

use anyhow::Result;
use serde_json::Value;
use std::path::Path;
use tracing::warn;

use crate::config::ClientConfig;
use crate::errors::UtcpError;
use crate::providers::Provider;
use crate::variables;

/// A provider entry that failed to decode, kept for reporting.
#[derive(Debug)]
pub struct LoadWarning {
    pub index: usize,
    pub error: anyhow::Error,
}

/// Result of parsing a providers document: decoded providers plus warnings
/// for the entries that were skipped.
#[derive(Debug)]
pub struct LoadedProviders {
    pub providers: Vec<Provider>,
    pub warnings: Vec<LoadWarning>,
}

pub async fn load_providers_from_file(
    path: impl AsRef<Path>,
    config: &ClientConfig,
) -> Result<LoadedProviders> {
    let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| UtcpError::Io(format!("failed to read providers file: {e}")))?;
    load_providers_from_str(&contents, config).await
}

pub async fn load_providers_from_str(
    contents: &str,
    config: &ClientConfig,
) -> Result<LoadedProviders> {
    let document: Value = serde_json::from_str(contents)
        .map_err(|e| UtcpError::Config(format!("invalid providers JSON: {e}")))?;
    let entries = provider_entries(document)?;

    let mut providers = Vec::new();
    let mut warnings = Vec::new();
    for (index, mut entry) in entries.into_iter().enumerate() {
        variables::substitute(&mut entry, config).await;
        match decode_provider(entry, index) {
            Ok(provider) => providers.push(provider),
            Err(error) => {
                warn!(index, %error, "skipping provider entry");
                warnings.push(LoadWarning { index, error });
            }
        }
    }

    Ok(LoadedProviders {
        providers,
        warnings,
    })
}

/// Split the accepted document shapes into individual provider objects.
fn provider_entries(document: Value) -> Result<Vec<Value>> {
    match document {
        Value::Array(entries) => Ok(entries),
        Value::Object(obj) => {
            if let Some(providers) = obj.get("providers") {
                match providers {
                    Value::Array(entries) => Ok(entries.clone()),
                    Value::Object(_) => Ok(vec![providers.clone()]),
                    _ => Err(UtcpError::Config(
                        "'providers' must be an array or object".to_string(),
                    )
                    .into()),
                }
            } else {
                Ok(vec![Value::Object(obj)])
            }
        }
        _ => Err(UtcpError::Config("providers document must be an array or object".to_string()).into()),
    }
}

/// Decode one substituted entry into a provider, defaulting a missing name
/// to `<provider_type>_<index>` and sanitizing dots out of explicit names.
fn decode_provider(mut entry: Value, index: usize) -> Result<Provider> {
    let obj = entry
        .as_object_mut()
        .ok_or_else(|| UtcpError::Config(format!("provider entry {index} is not an object")))?;

    let provider_type = obj
        .get("provider_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| UtcpError::Config(format!("provider entry {index} is missing provider_type")))?
        .to_string();

    if obj.get("name").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
        obj.insert(
            "name".to_string(),
            Value::String(format!("{provider_type}_{index}")),
        );
    }

    let mut provider: Provider = serde_json::from_value(entry)
        .map_err(|e| UtcpError::Config(format!("provider entry {index}: {e}")))?;
    provider.sanitize_name();
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderType;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn parses_array_object_and_bare_shapes() {
        let config = ClientConfig::new();

        let array = json!([
            { "provider_type": "http", "url": "https://a.example/tools" },
            { "provider_type": "cli", "command_name": "ls" }
        ])
        .to_string();
        let loaded = load_providers_from_str(&array, &config).await.unwrap();
        assert_eq!(loaded.providers.len(), 2);
        assert!(loaded.warnings.is_empty());

        let wrapped = json!({ "providers": [
            { "provider_type": "sse", "name": "events", "url": "https://a.example/sse" }
        ]})
        .to_string();
        let loaded = load_providers_from_str(&wrapped, &config).await.unwrap();
        assert_eq!(loaded.providers.len(), 1);
        assert_eq!(loaded.providers[0].provider_type(), ProviderType::Sse);

        let single_wrapped = json!({ "providers":
            { "provider_type": "udp", "name": "metrics", "host": "h", "port": 9 }
        })
        .to_string();
        let loaded = load_providers_from_str(&single_wrapped, &config).await.unwrap();
        assert_eq!(loaded.providers.len(), 1);

        let bare = json!({ "provider_type": "tcp", "host": "h", "port": 7 }).to_string();
        let loaded = load_providers_from_str(&bare, &config).await.unwrap();
        assert_eq!(loaded.providers.len(), 1);
        assert_eq!(loaded.providers[0].name(), "tcp_0");
    }

    #[tokio::test]
    async fn substitutes_variables_before_decoding() {
        let config = ClientConfig::new().with_variable("BASE", "https://x");
        let doc = json!({ "provider_type": "http", "name": "api", "url": "${BASE}/api" }).to_string();

        let loaded = load_providers_from_str(&doc, &config).await.unwrap();
        match &loaded.providers[0] {
            Provider::Http(http) => assert_eq!(http.url, "https://x/api"),
            other => panic!("unexpected provider {other:?}"),
        }
    }

    #[tokio::test]
    async fn names_are_defaulted_and_sanitized() {
        let config = ClientConfig::new();
        let doc = json!([
            { "provider_type": "cli", "command_name": "true" },
            { "provider_type": "cli", "name": "dot.ted.name", "command_name": "true" }
        ])
        .to_string();

        let loaded = load_providers_from_str(&doc, &config).await.unwrap();
        assert_eq!(loaded.providers[0].name(), "cli_0");
        assert_eq!(loaded.providers[1].name(), "dot_ted_name");
    }

    #[tokio::test]
    async fn bad_entries_become_warnings_not_failures() {
        let config = ClientConfig::new();
        let doc = json!([
            { "provider_type": "carrier_pigeon", "name": "bird" },
            { "provider_type": "tcp", "name": "ok", "host": "h", "port": 1 },
            { "provider_type": "http" , "name": "missing-url" }
        ])
        .to_string();

        let loaded = load_providers_from_str(&doc, &config).await.unwrap();
        assert_eq!(loaded.providers.len(), 1);
        assert_eq!(loaded.providers[0].name(), "ok");
        assert_eq!(loaded.warnings.len(), 2);
        assert_eq!(loaded.warnings[0].index, 0);
        assert_eq!(loaded.warnings[1].index, 2);
    }

    #[tokio::test]
    async fn loads_from_a_file_on_disk() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "providers": [
                {{ "provider_type": "websocket", "name": "ws", "url": "wss://a.example/ws" }}
            ]}}"#
        )
        .unwrap();

        let config = ClientConfig::new();
        let loaded = load_providers_from_file(file.path(), &config).await.unwrap();
        assert_eq!(loaded.providers.len(), 1);
        assert_eq!(loaded.providers[0].provider_type(), ProviderType::Websocket);
    }

    #[tokio::test]
    async fn scalar_document_is_a_config_error() {
        let config = ClientConfig::new();
        let err = load_providers_from_str("42", &config).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Config(_))
        ));
    }
}
