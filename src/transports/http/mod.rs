pub mod security;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::auth::{Auth, OAuth2Auth};
use crate::errors::UtcpError;
use crate::openapi::OpenApiConverter;
use crate::providers::{HttpProvider, Provider, ProviderType};
use crate::tools::{Tool, UtcpManual};
use crate::transports::stream::StreamResult;
use crate::transports::ClientTransport;

pub use security::enforce_secure_url;

/// Driver for plain request/response HTTP providers. Discovery accepts a
/// UTCP manual or an OpenAPI document (JSON or YAML); calls template the URL
/// path, then send remaining arguments as a JSON body or query parameters.
pub struct HttpTransport {
    client: Client,
    // OAuth2 access tokens keyed by client_id, process lifetime.
    oauth_tokens: Mutex<HashMap<String, String>>,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .gzip(true)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            oauth_tokens: Mutex::new(HashMap::new()),
        }
    }

    fn expect_http<'a>(prov: &'a Provider) -> Result<&'a HttpProvider> {
        match prov {
            Provider::Http(p) => Ok(p),
            other => Err(UtcpError::mismatch(ProviderType::Http, other.provider_type())),
        }
    }

    /// Replace `{key}` segments with stringified argument values, consuming
    /// the substituted keys from the argument mapping.
    pub(crate) fn template_url(url: &str, args: &mut HashMap<String, Value>) -> String {
        let mut templated = url.to_string();
        let keys: Vec<String> = args.keys().cloned().collect();
        for key in keys {
            let placeholder = format!("{{{key}}}");
            if templated.contains(&placeholder) {
                if let Some(value) = args.remove(&key) {
                    templated = templated.replace(&placeholder, &scalar_to_string(&value));
                }
            }
        }
        templated
    }

    async fn apply_auth(&self, builder: RequestBuilder, auth: &Auth) -> Result<RequestBuilder> {
        match auth {
            Auth::ApiKey(api_key) => match api_key.location.to_ascii_lowercase().as_str() {
                "header" => Ok(builder.header(&api_key.var_name, &api_key.api_key)),
                "query" => Ok(builder.query(&[(api_key.var_name.clone(), api_key.api_key.clone())])),
                "cookie" => {
                    let cookie = format!("{}={}", api_key.var_name, api_key.api_key);
                    Ok(builder.header(header::COOKIE, cookie))
                }
                other => Err(anyhow!("Unsupported API key location: {other}")),
            },
            Auth::Basic(basic) => Ok(builder.basic_auth(&basic.username, Some(&basic.password))),
            Auth::OAuth2(oauth) => {
                let token = self.oauth_token(oauth).await?;
                Ok(builder.bearer_auth(token))
            }
        }
    }

    /// Client-credentials grant. Credentials are passed in the form body
    /// first; on failure the token endpoint is retried with HTTP basic auth.
    async fn oauth_token(&self, auth: &OAuth2Auth) -> Result<String> {
        {
            let cache = self.oauth_tokens.lock().await;
            if let Some(token) = cache.get(&auth.client_id) {
                return Ok(token.clone());
            }
        }

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", auth.client_id.clone()),
            ("client_secret", auth.client_secret.clone()),
        ];
        if let Some(scope) = &auth.scope {
            form.push(("scope", scope.clone()));
        }

        let body_attempt = self
            .client
            .post(&auth.token_url)
            .form(&form)
            .send()
            .await
            .ok();

        let token = match Self::token_from_response(body_attempt).await {
            Some(token) => token,
            None => {
                debug!(token_url = %auth.token_url, "form-body grant failed, retrying with basic auth");
                let mut form = vec![("grant_type", "client_credentials".to_string())];
                if let Some(scope) = &auth.scope {
                    form.push(("scope", scope.clone()));
                }
                let basic_attempt = self
                    .client
                    .post(&auth.token_url)
                    .basic_auth(&auth.client_id, Some(&auth.client_secret))
                    .form(&form)
                    .send()
                    .await
                    .ok();
                Self::token_from_response(basic_attempt).await.ok_or_else(|| {
                    UtcpError::Security(format!(
                        "OAuth2 token retrieval failed for client '{}'",
                        auth.client_id
                    ))
                })?
            }
        };

        let mut cache = self.oauth_tokens.lock().await;
        cache.insert(auth.client_id.clone(), token.clone());
        Ok(token)
    }

    async fn token_from_response(response: Option<reqwest::Response>) -> Option<String> {
        let response = response?;
        if !response.status().is_success() {
            return None;
        }
        let body: Value = response.json().await.ok()?;
        body.get("access_token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    async fn invalidate_token(&self, auth: &Auth) {
        if let Auth::OAuth2(oauth) = auth {
            let mut cache = self.oauth_tokens.lock().await;
            cache.remove(&oauth.client_id);
        }
    }

    fn apply_headers(builder: RequestBuilder, prov: &HttpProvider) -> RequestBuilder {
        let mut builder = builder;
        if let Some(headers) = &prov.headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }
        builder
    }

    fn method_builder(&self, method: &str, url: &str) -> Result<RequestBuilder> {
        match method {
            "GET" => Ok(self.client.get(url)),
            "POST" => Ok(self.client.post(url)),
            "PUT" => Ok(self.client.put(url)),
            "DELETE" => Ok(self.client.delete(url)),
            "PATCH" => Ok(self.client.patch(url)),
            other => Err(UtcpError::Config(format!("Unsupported HTTP method: {other}")).into()),
        }
    }

    async fn send_call(
        &self,
        prov: &HttpProvider,
        url: &str,
        mut args: HashMap<String, Value>,
    ) -> Result<reqwest::Response> {
        let method = prov.http_method.to_ascii_uppercase();
        let mut builder = self.method_builder(&method, url)?;

        // Lift configured header fields out of the payload.
        if let Some(header_fields) = &prov.header_fields {
            for field in header_fields {
                if let Some(value) = args.remove(field) {
                    builder = builder.header(field, scalar_to_string(&value));
                }
            }
        }
        builder = Self::apply_headers(builder, prov);
        if let Some(auth) = &prov.auth {
            builder = self.apply_auth(builder, auth).await?;
        }
        if let Some(timeout) = prov.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout));
        }

        if matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
            let payload = match &prov.body_field {
                Some(field) => json!({ field: args }),
                None => json!(args),
            };
            builder = builder.json(&payload);
        } else {
            for (key, value) in &args {
                builder = builder.query(&[(key, scalar_to_string(value))]);
            }
        }

        Ok(builder.send().await?)
    }
}

/// Non-2xx responses become protocol errors carrying the status line and the
/// start of the body.
pub(crate) async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UtcpError::Protocol(format!("HTTP {status}: {}", body_prefix(&body))).into())
}

pub(crate) fn body_prefix(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(200)
        .map(|(idx, _)| idx)
        .unwrap_or(body.len());
    &body[..end]
}

pub(crate) fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn looks_like_yaml(content_type: Option<&str>, url: &str) -> bool {
    if let Some(ct) = content_type {
        if ct.contains("yaml") || ct.contains("yml") {
            return true;
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.ends_with(".yaml") || path.ends_with(".yml")
}

#[async_trait]
impl ClientTransport for HttpTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let http_prov = Self::expect_http(prov)?;
        enforce_secure_url(&http_prov.url)?;

        let method = http_prov.http_method.to_ascii_uppercase();
        let mut builder = self.method_builder(&method, &http_prov.url)?;
        builder = Self::apply_headers(builder, http_prov);
        if let Some(auth) = &http_prov.auth {
            builder = self.apply_auth(builder, auth).await?;
        }
        if let Some(timeout) = http_prov.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout));
        }

        let response = error_for_status(builder.send().await?).await?;
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.text().await?;

        let document: Value = if looks_like_yaml(content_type.as_deref(), &http_prov.url) {
            serde_yaml::from_str(&body)
                .map_err(|e| UtcpError::Protocol(format!("Invalid YAML manual: {e}")))?
        } else {
            serde_json::from_str(&body)
                .map_err(|e| UtcpError::Protocol(format!("Invalid manual JSON: {e}")))?
        };

        if let Some(manual) = UtcpManual::from_document(&document) {
            debug!(provider = %http_prov.name, tools = manual.tools.len(), "manual discovery");
            // Manual tools without their own call template are invoked at
            // <discovery-url>/<tool>/call with a JSON body.
            let base = http_prov.url.trim_end_matches('/');
            let tools = manual
                .tools
                .into_iter()
                .map(|mut tool| {
                    if tool.provider.is_none() {
                        let mut call_prov = http_prov.clone();
                        call_prov.url = format!("{base}/{}/call", tool.name);
                        call_prov.http_method = "POST".to_string();
                        tool.provider = Some(Provider::Http(call_prov));
                    }
                    tool
                })
                .collect();
            return Ok(tools);
        }

        // Not a UTCP manual; treat the document as an OpenAPI spec.
        let converter = OpenApiConverter::new(
            document,
            Some(http_prov.url.clone()),
            Some(http_prov.name.clone()),
        );
        let manual = converter.convert();
        debug!(provider = %http_prov.name, tools = manual.tools.len(), "openapi discovery");
        Ok(manual.tools)
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        Self::expect_http(prov)?;
        Ok(())
    }

    async fn call_tool(
        &self,
        _tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        _last_event_id: Option<&str>,
    ) -> Result<Value> {
        let http_prov = Self::expect_http(prov)?;
        enforce_secure_url(&http_prov.url)?;

        let mut args = args;
        let url = Self::template_url(&http_prov.url, &mut args);
        enforce_secure_url(&url)?;

        let mut response = self.send_call(http_prov, &url, args.clone()).await?;

        // Expired bearer tokens are refreshed once on demand.
        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(auth @ Auth::OAuth2(_)) = &http_prov.auth {
                self.invalidate_token(auth).await;
                response = self.send_call(http_prov, &url, args).await?;
            }
        }

        let response = error_for_status(response).await?;
        Ok(response.json().await?)
    }

    async fn call_tool_stream(
        &self,
        _tool_name: &str,
        _args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        Self::expect_http(prov)?;
        Err(UtcpError::Unsupported("HTTP transport does not stream".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ApiKeyAuth, BasicAuth};
    use axum::extract::{Json, RawQuery};
    use axum::routing::{get, post};
    use axum::Router;
    use std::net::TcpListener;

    fn spawn_app(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });
        format!("http://{addr}")
    }

    fn http_provider(url: String) -> Provider {
        Provider::Http(HttpProvider::new(
            "api".into(),
            url,
            "POST".into(),
            None,
        ))
    }

    #[test]
    fn template_url_substitutes_and_consumes_args() {
        let mut args = HashMap::new();
        args.insert("id".to_string(), json!(5));
        args.insert("q".to_string(), json!("t"));

        let url = HttpTransport::template_url("http://h/{id}/x", &mut args);
        assert_eq!(url, "http://h/5/x");
        assert!(!args.contains_key("id"));
        assert!(args.contains_key("q"));
    }

    #[tokio::test]
    async fn apply_auth_covers_api_key_locations_and_basic() {
        let transport = HttpTransport::new();

        let header_auth = Auth::ApiKey(ApiKeyAuth {
            api_key: "secret".into(),
            var_name: "X-Key".into(),
            location: "header".into(),
        });
        let req = transport
            .apply_auth(Client::new().get("http://localhost"), &header_auth)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.headers().get("X-Key").unwrap(), "secret");

        let query_auth = Auth::ApiKey(ApiKeyAuth {
            api_key: "secret".into(),
            var_name: "key".into(),
            location: "query".into(),
        });
        let req = transport
            .apply_auth(Client::new().get("http://localhost"), &query_auth)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.url().query(), Some("key=secret"));

        let cookie_auth = Auth::ApiKey(ApiKeyAuth {
            api_key: "c".into(),
            var_name: "session".into(),
            location: "cookie".into(),
        });
        let req = transport
            .apply_auth(Client::new().get("http://localhost"), &cookie_auth)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.headers().get(header::COOKIE).unwrap(), "session=c");

        let basic = Auth::Basic(BasicAuth::new("user".into(), "pass".into()));
        let req = transport
            .apply_auth(Client::new().get("http://localhost"), &basic)
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            req.headers().get(header::AUTHORIZATION).unwrap(),
            "Basic dXNlcjpwYXNz"
        );
    }

    #[tokio::test]
    async fn insecure_urls_fail_before_any_network_call() {
        let transport = HttpTransport::new();
        // Port 9 on an RFC 5737 address: any attempted connection would hang,
        // so an instant Security error proves no request was issued.
        let prov = http_provider("http://192.0.2.1:9/tools".into());

        let err = transport.register_tool_provider(&prov).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Security(_))
        ));

        let err = transport
            .call_tool("api.echo", HashMap::new(), &prov, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Security(_))
        ));
    }

    #[tokio::test]
    async fn wrong_variant_is_a_typed_mismatch() {
        let transport = HttpTransport::new();
        let prov = Provider::Tcp(crate::providers::TcpProvider::new(
            "t".into(),
            "127.0.0.1".into(),
            9,
        ));
        let err = transport.register_tool_provider(&prov).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::TransportMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn register_attaches_call_templates_and_call_posts_body() {
        async fn manual() -> Json<Value> {
            Json(json!({
                "version": "1.0",
                "tools": [{ "name": "echo", "description": "Echo" }]
            }))
        }
        async fn call(Json(payload): Json<Value>) -> Json<Value> {
            Json(json!({ "echo": payload }))
        }

        let base = spawn_app(Router::new().route("/", get(manual)).route("/echo/call", post(call)));
        let prov = Provider::Http(HttpProvider::new("api".into(), base.clone(), "GET".into(), None));

        let transport = HttpTransport::new();
        let tools = transport.register_tool_provider(&prov).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        // Each manual tool gets a per-tool call template under the base URL.
        let call_prov = tools[0].provider.clone().expect("call template attached");
        match &call_prov {
            Provider::Http(http) => {
                assert_eq!(http.url, format!("{base}/echo/call"));
                assert_eq!(http.http_method, "POST");
            }
            other => panic!("unexpected call template {other:?}"),
        }

        let mut args = HashMap::new();
        args.insert("message".to_string(), json!("hi"));
        let result = transport
            .call_tool("api.echo", args, &call_prov, None)
            .await
            .unwrap();
        assert_eq!(result, json!({ "echo": { "message": "hi" } }));
    }

    #[tokio::test]
    async fn get_call_templates_path_and_sends_query() {
        async fn handler(
            axum::extract::Path(id): axum::extract::Path<String>,
            RawQuery(query): RawQuery,
        ) -> Json<Value> {
            Json(json!({ "id": id, "query": query.unwrap_or_default() }))
        }

        let base = spawn_app(Router::new().route("/items/:id/x", get(handler)));
        let prov = Provider::Http(HttpProvider::new(
            "api".into(),
            format!("{base}/items/{{id}}/x"),
            "GET".into(),
            None,
        ));

        let mut args = HashMap::new();
        args.insert("id".to_string(), json!(5));
        args.insert("q".to_string(), json!("t"));

        let result = HttpTransport::new()
            .call_tool("api.get", args, &prov, None)
            .await
            .unwrap();
        assert_eq!(result, json!({ "id": "5", "query": "q=t" }));
    }

    #[tokio::test]
    async fn non_2xx_is_a_protocol_error_with_body_prefix() {
        async fn failing() -> (axum::http::StatusCode, &'static str) {
            (axum::http::StatusCode::BAD_GATEWAY, "upstream exploded")
        }
        let base = spawn_app(Router::new().route("/", get(failing)));
        let prov = Provider::Http(HttpProvider::new("api".into(), base, "GET".into(), None));

        let err = HttpTransport::new()
            .register_tool_provider(&prov)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("502"), "missing status in: {msg}");
        assert!(msg.contains("upstream exploded"), "missing body in: {msg}");
    }

    #[tokio::test]
    async fn oauth2_fetches_caches_and_sends_bearer_token() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        static TOKEN_CALLS: AtomicUsize = AtomicUsize::new(0);

        async fn token(body: String) -> Json<Value> {
            TOKEN_CALLS.fetch_add(1, Ordering::SeqCst);
            assert!(body.contains("grant_type=client_credentials"));
            Json(json!({ "access_token": "tok-123", "token_type": "Bearer" }))
        }
        async fn call(headers: axum::http::HeaderMap, Json(_): Json<Value>) -> Json<Value> {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Json(json!({ "auth": auth }))
        }

        let base = spawn_app(Router::new().route("/token", post(token)).route("/", post(call)));

        let mut http = HttpProvider::new("api".into(), base.clone(), "POST".into(), None);
        http.auth = Some(Auth::OAuth2(OAuth2Auth {
            token_url: format!("{base}/token"),
            client_id: "cid".into(),
            client_secret: "cs".into(),
            scope: None,
        }));
        let prov = Provider::Http(http);

        let transport = Arc::new(HttpTransport::new());
        let result = transport
            .call_tool("api.x", HashMap::new(), &prov, None)
            .await
            .unwrap();
        assert_eq!(result, json!({ "auth": "Bearer tok-123" }));

        // Second call reuses the cached token.
        transport
            .call_tool("api.x", HashMap::new(), &prov, None)
            .await
            .unwrap();
        assert_eq!(TOKEN_CALLS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn header_fields_and_body_field_shape_the_request() {
        async fn call(headers: axum::http::HeaderMap, Json(payload): Json<Value>) -> Json<Value> {
            Json(json!({
                "trace": headers
                    .get("x-trace")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default(),
                "payload": payload
            }))
        }
        let base = spawn_app(Router::new().route("/", post(call)));

        let mut http = HttpProvider::new("api".into(), base, "POST".into(), None);
        http.body_field = Some("data".into());
        http.header_fields = Some(vec!["X-Trace".into()]);
        let prov = Provider::Http(http);

        let mut args = HashMap::new();
        args.insert("X-Trace".to_string(), json!("t-1"));
        args.insert("msg".to_string(), json!("hi"));

        let result = HttpTransport::new()
            .call_tool("api.x", args, &prov, None)
            .await
            .unwrap();
        assert_eq!(result["trace"], "t-1");
        assert_eq!(result["payload"], json!({ "data": { "msg": "hi" } }));
    }

    #[tokio::test]
    async fn streaming_is_unsupported() {
        let prov = http_provider("https://example.com".into());
        let err = HttpTransport::new()
            .call_tool_stream("api.x", HashMap::new(), &prov)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UtcpError>(),
            Some(UtcpError::Unsupported(_))
        ));
    }

    #[test]
    fn body_prefix_truncates_long_bodies() {
        let long = "x".repeat(500);
        assert_eq!(body_prefix(&long).len(), 200);
        assert_eq!(body_prefix("short"), "short");
    }

    #[test]
    fn yaml_detection_uses_content_type_and_suffix() {
        assert!(looks_like_yaml(Some("application/yaml"), "http://h/spec"));
        assert!(looks_like_yaml(None, "https://h/openapi.yaml"));
        assert!(looks_like_yaml(None, "https://h/openapi.yml?v=1"));
        assert!(!looks_like_yaml(Some("application/json"), "https://h/spec"));
    }
}
