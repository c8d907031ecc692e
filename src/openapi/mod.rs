//! OpenAPI (v2 "swagger" / v3) to UTCP manual conversion.
//!
//! The HTTP driver falls back to this converter when a discovery endpoint
//! serves an OpenAPI document instead of a UTCP manual: one tool per
//! path+method, inputs aggregated from parameters and the request body,
//! outputs taken from the 200/201 response, and security schemes mapped to
//! auth variants whose secrets are variable tokens resolved at call time.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::auth::{ApiKeyAuth, Auth, BasicAuth, OAuth2Auth};
use crate::providers::{HttpProvider, Provider};
use crate::tools::{Tool, ToolSchema, UtcpManual};

pub struct OpenApiConverter {
    spec: Value,
    spec_url: Option<String>,
    provider_name: String,
}

impl OpenApiConverter {
    pub fn new(spec: Value, spec_url: Option<String>, provider_name: Option<String>) -> Self {
        let provider_name = provider_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| derive_provider_name(&spec));
        Self {
            spec,
            spec_url,
            provider_name,
        }
    }

    pub fn convert(&self) -> UtcpManual {
        let mut tools = Vec::new();
        let base_url = self.base_url();

        if let Some(paths) = self.spec.get("paths").and_then(|v| v.as_object()) {
            for (raw_path, raw_item) in paths {
                let Some(path_item) = raw_item.as_object() else {
                    continue;
                };
                for (method, raw_op) in path_item {
                    let lower = method.to_ascii_lowercase();
                    if !matches!(lower.as_str(), "get" | "post" | "put" | "delete" | "patch") {
                        continue;
                    }
                    if let Some(op) = raw_op.as_object() {
                        if let Ok(tool) = self.create_tool(raw_path, &lower, op, &base_url) {
                            tools.push(tool);
                        }
                    }
                }
            }
        }

        let mut manual = UtcpManual::new(tools);
        manual.provider_name = Some(self.provider_name.clone());
        manual.original_url = self.spec_url.clone();
        manual
    }

    fn base_url(&self) -> String {
        if let Some(url) = self
            .spec
            .get("servers")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|s| s.get("url"))
            .and_then(|v| v.as_str())
            .filter(|u| !u.is_empty())
        {
            return url.to_string();
        }

        if let Some(host) = self.spec.get("host").and_then(|v| v.as_str()) {
            let scheme = self
                .spec
                .get("schemes")
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
                .and_then(|v| v.as_str())
                .unwrap_or("https");
            let base_path = self
                .spec
                .get("basePath")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            return format!("{scheme}://{host}{base_path}");
        }

        if let Some(spec_url) = &self.spec_url {
            if let Some(idx) = spec_url.find("://") {
                if let Some(end) = spec_url[idx + 3..].find('/') {
                    return spec_url[..idx + 3 + end].to_string();
                }
                return spec_url.clone();
            }
        }

        "/".to_string()
    }

    fn resolve_ref(&self, reference: &str) -> Result<Value> {
        let pointer = reference
            .strip_prefix('#')
            .ok_or_else(|| anyhow!("only local refs supported, got {reference}"))?;
        self.spec
            .pointer(pointer)
            .cloned()
            .ok_or_else(|| anyhow!("unresolved ref {reference}"))
    }

    fn resolved(&self, value: &Value) -> Value {
        if let Some(reference) = value.get("$ref").and_then(|v| v.as_str()) {
            self.resolve_ref(reference).unwrap_or_else(|_| value.clone())
        } else {
            value.clone()
        }
    }

    fn create_tool(
        &self,
        path: &str,
        method: &str,
        op: &Map<String, Value>,
        base_url: &str,
    ) -> Result<Tool> {
        let name = op
            .get("operationId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{method}{}", path.replace(['/', '{', '}'], "_")));

        let description = op
            .get("summary")
            .or_else(|| op.get("description"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut properties: HashMap<String, Value> = HashMap::new();
        let mut required: Vec<String> = Vec::new();
        let mut header_fields: Vec<String> = Vec::new();
        let mut body_field: Option<String> = None;

        if let Some(params) = op.get("parameters").and_then(|v| v.as_array()) {
            for raw_param in params {
                let param = self.resolved(raw_param);
                let Some(name) = param.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                let location = param.get("in").and_then(|v| v.as_str()).unwrap_or("query");
                if location == "header" {
                    header_fields.push(name.to_string());
                }
                if location == "body" {
                    // OpenAPI v2 body parameter.
                    body_field = Some(name.to_string());
                }
                let schema = param
                    .get("schema")
                    .map(|s| self.resolved(s))
                    .unwrap_or_else(|| Value::Object(Map::new()));
                properties.insert(name.to_string(), schema);
                if param.get("required").and_then(|v| v.as_bool()).unwrap_or(false) {
                    required.push(name.to_string());
                }
            }
        }

        // OpenAPI v3 request body: aggregate its schema properties directly.
        if let Some(request_body) = op.get("requestBody") {
            let request_body = self.resolved(request_body);
            if let Some(schema) = request_body
                .get("content")
                .and_then(|c| c.get("application/json"))
                .and_then(|m| m.get("schema"))
            {
                let schema = self.resolved(schema);
                if let Some(props) = schema.get("properties").and_then(|v| v.as_object()) {
                    for (k, v) in props {
                        properties.insert(k.clone(), self.resolved(v));
                    }
                }
                if let Some(req) = schema.get("required").and_then(|v| v.as_array()) {
                    required.extend(req.iter().filter_map(|v| v.as_str().map(String::from)));
                }
            }
        }

        let inputs = ToolSchema {
            properties: if properties.is_empty() {
                None
            } else {
                Some(properties)
            },
            required: if required.is_empty() {
                None
            } else {
                Some(required)
            },
            ..ToolSchema::object()
        };

        let outputs = self.response_schema(op);
        let auth = self.map_security(op);

        let mut provider = HttpProvider::new(
            self.provider_name.clone(),
            join_url(base_url, path),
            method.to_ascii_uppercase(),
            auth,
        );
        if !header_fields.is_empty() {
            provider.header_fields = Some(header_fields);
        }
        provider.body_field = body_field;

        let mut tool = Tool::new(name, description);
        tool.inputs = inputs;
        tool.outputs = outputs;
        tool.tags = op
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        tool.provider = Some(Provider::Http(provider));
        Ok(tool)
    }

    fn response_schema(&self, op: &Map<String, Value>) -> ToolSchema {
        let Some(responses) = op.get("responses").and_then(|v| v.as_object()) else {
            return ToolSchema::object();
        };
        for code in ["200", "201"] {
            let Some(response) = responses.get(code) else {
                continue;
            };
            let response = self.resolved(response);
            let schema = response
                .get("content")
                .and_then(|c| c.get("application/json"))
                .and_then(|m| m.get("schema"))
                .or_else(|| response.get("schema"))
                .map(|s| self.resolved(s));
            if let Some(schema) = schema {
                if let Ok(parsed) = serde_json::from_value::<ToolSchema>(schema) {
                    return parsed;
                }
            }
        }
        ToolSchema::object()
    }

    /// Map the first referenced security scheme to an auth variant. Secrets
    /// become `${...}` variable tokens so the real credentials come from the
    /// client's variable chain at call time.
    fn map_security(&self, op: &Map<String, Value>) -> Option<Auth> {
        let requirement = op
            .get("security")
            .or_else(|| self.spec.get("security"))
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|v| v.as_object())?;
        let scheme_name = requirement.keys().next()?;

        let schemes = self
            .spec
            .pointer("/components/securitySchemes")
            .or_else(|| self.spec.get("securityDefinitions"))
            .and_then(|v| v.as_object())?;
        let scheme = schemes.get(scheme_name)?.as_object()?;

        let prefix = self.provider_name.to_ascii_uppercase().replace(['-', '.'], "_");
        match scheme.get("type").and_then(|v| v.as_str())? {
            "apiKey" => Some(Auth::ApiKey(ApiKeyAuth {
                api_key: format!("${{{prefix}_API_KEY}}"),
                var_name: scheme
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("X-Api-Key")
                    .to_string(),
                location: scheme
                    .get("in")
                    .and_then(|v| v.as_str())
                    .unwrap_or("header")
                    .to_string(),
            })),
            "http" | "basic" => Some(Auth::Basic(BasicAuth::new(
                format!("${{{prefix}_USERNAME}}"),
                format!("${{{prefix}_PASSWORD}}"),
            ))),
            "oauth2" => {
                let token_url = scheme
                    .get("flows")
                    .and_then(|f| f.get("clientCredentials"))
                    .and_then(|f| f.get("tokenUrl"))
                    .or_else(|| scheme.get("tokenUrl"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Some(Auth::OAuth2(OAuth2Auth {
                    token_url,
                    client_id: format!("${{{prefix}_CLIENT_ID}}"),
                    client_secret: format!("${{{prefix}_CLIENT_SECRET}}"),
                    scope: None,
                }))
            }
            _ => None,
        }
    }
}

fn derive_provider_name(spec: &Value) -> String {
    spec.pointer("/info/title")
        .and_then(|v| v.as_str())
        .map(|t| t.to_lowercase().replace([' ', '.'], "_"))
        .unwrap_or_else(|| "openapi".to_string())
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
