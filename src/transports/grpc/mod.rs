use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::Request;

use crate::auth::Auth;
use crate::errors::UtcpError;
use crate::grpcpb::gnmi::g_nmi_client::GNmiClient;
use crate::grpcpb::gnmi::{
    subscribe_request, subscribe_response, subscription_list, typed_value, CapabilityRequest,
    Encoding, Notification, Path, PathElem, Poll, SubscribeRequest, Subscription,
    SubscriptionList, SubscriptionMode, TypedValue,
};
use crate::grpcpb::utcp::utcp_service_client::UtcpServiceClient;
use crate::grpcpb::utcp::{Empty, ToolCallRequest};
use crate::providers::{GrpcProvider, Provider, ProviderType};
use crate::tools::{Tool, ToolSchema};
use crate::transports::stream::{boxed_channel_stream, StreamResult};
use crate::transports::{bare_tool_name, ClientTransport};

pub const GNMI_SUBSCRIBE_TOOL: &str = "gnmi_subscribe";

/// Driver for gRPC providers. Standard providers expose the UTCP tool
/// service; providers whose service is `gnmi.gNMI` expose a single synthetic
/// `gnmi_subscribe` tool backed by the bidirectional Subscribe stream.
pub struct GrpcTransport;

impl GrpcTransport {
    pub fn new() -> Self {
        Self
    }

    fn expect_grpc<'a>(prov: &'a Provider) -> Result<&'a GrpcProvider> {
        match prov {
            Provider::Grpc(p) => Ok(p),
            other => Err(UtcpError::mismatch(ProviderType::Grpc, other.provider_type())),
        }
    }

    async fn connect(prov: &GrpcProvider) -> Result<Channel> {
        if prov.use_ssl {
            return Err(UtcpError::Security(
                "TLS for the gRPC transport is not configured".to_string(),
            )
            .into());
        }
        let mut endpoint = Endpoint::from_shared(format!("http://{}:{}", prov.host, prov.port))
            .map_err(|e| UtcpError::Config(format!("invalid gRPC endpoint: {e}")))?
            .connect_timeout(Duration::from_secs(30));
        if !prov.target.is_empty() {
            // The target doubles as the HTTP/2 authority.
            if let Ok(origin) = Uri::from_str(&format!("http://{}", prov.target)) {
                endpoint = endpoint.origin(origin);
            }
        }
        endpoint
            .connect()
            .await
            .map_err(|e| UtcpError::Io(format!("gRPC dial {}:{} failed: {e}", prov.host, prov.port)).into())
    }

    fn decorate<T>(prov: &GrpcProvider, req: &mut Request<T>) -> Result<()> {
        if !prov.target.is_empty() {
            let value = MetadataValue::from_str(&prov.target)
                .map_err(|e| UtcpError::Config(format!("invalid gNMI target: {e}")))?;
            req.metadata_mut().insert("target", value);
        }
        if let Some(auth) = &prov.auth {
            match auth {
                Auth::Basic(basic) => {
                    let encoded = base64::engine::general_purpose::STANDARD
                        .encode(format!("{}:{}", basic.username, basic.password));
                    let value = MetadataValue::from_str(&format!("Basic {encoded}"))
                        .map_err(|e| UtcpError::Config(format!("invalid auth header: {e}")))?;
                    req.metadata_mut().insert("authorization", value);
                }
                _ => {
                    return Err(UtcpError::Unsupported(
                        "only basic auth is supported for gRPC providers".to_string(),
                    )
                    .into())
                }
            }
        }
        Ok(())
    }

    fn schema_from_json(raw: &str) -> ToolSchema {
        if raw.is_empty() {
            return ToolSchema::object();
        }
        serde_json::from_str(raw).unwrap_or_else(|_| ToolSchema::object())
    }

    async fn register_gnmi(prov: &GrpcProvider) -> Result<Vec<Tool>> {
        let channel = Self::connect(prov).await?;
        let mut client = GNmiClient::new(channel);

        let mut request = Request::new(CapabilityRequest {});
        Self::decorate(prov, &mut request)?;
        let capabilities = client
            .capabilities(request)
            .await
            .map_err(|status| UtcpError::Protocol(format!("gNMI Capabilities failed: {status}")))?
            .into_inner();

        let mut tool = Tool::new(
            GNMI_SUBSCRIBE_TOOL,
            format!(
                "Subscribe to gNMI telemetry paths (gNMI {})",
                capabilities.gnmi_version
            ),
        );
        tool.tags = vec!["gnmi".to_string(), "telemetry".to_string()];
        tool.inputs = ToolSchema {
            properties: Some(HashMap::from([
                ("path".to_string(), json!({ "type": "string" })),
                (
                    "mode".to_string(),
                    json!({ "type": "string", "enum": ["ONCE", "STREAM", "POLL"] }),
                ),
                (
                    "sub_mode".to_string(),
                    json!({ "type": "string", "enum": ["TARGET_DEFINED", "ON_CHANGE", "SAMPLE"] }),
                ),
                ("poll_every_ms".to_string(), json!({ "type": "integer" })),
                ("target".to_string(), json!({ "type": "string" })),
            ])),
            required: Some(vec!["path".to_string()]),
            ..ToolSchema::object()
        };
        Ok(vec![tool])
    }

    async fn register_utcp(prov: &GrpcProvider) -> Result<Vec<Tool>> {
        let channel = Self::connect(prov).await?;
        let mut client = UtcpServiceClient::new(channel);

        let mut request = Request::new(Empty {});
        Self::decorate(prov, &mut request)?;
        let manual = client
            .get_manual(request)
            .await
            .map_err(|status| UtcpError::Protocol(format!("GetManual failed: {status}")))?
            .into_inner();

        Ok(manual
            .tools
            .into_iter()
            .map(|t| {
                let mut tool = Tool::new(t.name, t.description);
                tool.inputs = Self::schema_from_json(&t.inputs_json);
                tool.outputs = Self::schema_from_json(&t.outputs_json);
                tool.tags = if t.tags.is_empty() {
                    vec!["grpc".to_string()]
                } else {
                    t.tags
                };
                tool
            })
            .collect())
    }
}

/// Parse a gNMI path string (`/a/b[name=eth0]/c`) into path elements.
pub(crate) fn parse_gnmi_path(path: &str, target: &str) -> Path {
    let mut elems = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let (name, rest) = match segment.find('[') {
            Some(idx) => (&segment[..idx], &segment[idx..]),
            None => (segment, ""),
        };
        let mut key = HashMap::new();
        let mut remaining = rest;
        while let Some(open) = remaining.find('[') {
            let Some(close) = remaining[open..].find(']') else {
                break;
            };
            let inner = &remaining[open + 1..open + close];
            if let Some((k, v)) = inner.split_once('=') {
                key.insert(k.to_string(), v.to_string());
            }
            remaining = &remaining[open + close + 1..];
        }
        elems.push(PathElem {
            name: name.to_string(),
            key,
        });
    }
    Path {
        origin: String::new(),
        elem: elems,
        target: target.to_string(),
    }
}

pub(crate) fn path_to_string(path: &Path) -> String {
    let mut out = String::new();
    for elem in &path.elem {
        out.push('/');
        out.push_str(&elem.name);
        let mut keys: Vec<_> = elem.key.iter().collect();
        keys.sort();
        for (k, v) in keys {
            out.push_str(&format!("[{k}={v}]"));
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

fn typed_value_to_json(value: &TypedValue) -> Value {
    match &value.value {
        Some(typed_value::Value::StringVal(s)) => json!(s),
        Some(typed_value::Value::IntVal(i)) => json!(i),
        Some(typed_value::Value::UintVal(u)) => json!(u),
        Some(typed_value::Value::BoolVal(b)) => json!(b),
        Some(typed_value::Value::DoubleVal(d)) => json!(d),
        Some(typed_value::Value::AsciiVal(s)) => json!(s),
        Some(typed_value::Value::JsonVal(bytes))
        | Some(typed_value::Value::JsonIetfVal(bytes)) => {
            serde_json::from_slice(bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(bytes).to_string())
            })
        }
        None => Value::Null,
    }
}

fn notification_to_json(notification: &Notification) -> Value {
    let mut obj = Map::new();
    obj.insert("timestamp".to_string(), json!(notification.timestamp));
    if let Some(prefix) = &notification.prefix {
        obj.insert("prefix".to_string(), json!(path_to_string(prefix)));
        if !prefix.target.is_empty() {
            obj.insert("target".to_string(), json!(prefix.target));
        }
    }
    let updates: Vec<Value> = notification
        .update
        .iter()
        .map(|u| {
            json!({
                "path": u.path.as_ref().map(path_to_string).unwrap_or_default(),
                "value": u.val.as_ref().map(typed_value_to_json).unwrap_or(Value::Null),
            })
        })
        .collect();
    obj.insert("updates".to_string(), Value::Array(updates));
    if !notification.delete.is_empty() {
        obj.insert(
            "delete".to_string(),
            Value::Array(notification.delete.iter().map(|p| json!(path_to_string(p))).collect()),
        );
    }
    Value::Object(obj)
}

struct SubscribeSpec {
    path: String,
    mode: subscription_list::Mode,
    sub_mode: SubscriptionMode,
    poll_every: Option<Duration>,
    target: String,
}

impl SubscribeSpec {
    fn from_args(args: &HashMap<String, Value>, prov: &GrpcProvider) -> Result<Self> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UtcpError::Config("gnmi_subscribe requires a 'path' argument".to_string()))?
            .to_string();

        let mode = match args.get("mode").and_then(|v| v.as_str()).unwrap_or("STREAM") {
            "ONCE" => subscription_list::Mode::Once,
            "STREAM" => subscription_list::Mode::Stream,
            "POLL" => subscription_list::Mode::Poll,
            other => {
                return Err(UtcpError::Config(format!("unknown gNMI mode '{other}'")).into())
            }
        };

        let sub_mode = match args.get("sub_mode").and_then(|v| v.as_str()) {
            None | Some("TARGET_DEFINED") => SubscriptionMode::TargetDefined,
            Some("ON_CHANGE") => SubscriptionMode::OnChange,
            Some("SAMPLE") => SubscriptionMode::Sample,
            Some(other) => {
                return Err(
                    UtcpError::Config(format!("unknown gNMI subscription mode '{other}'")).into(),
                )
            }
        };

        let poll_every = args
            .get("poll_every_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis);

        let target = args
            .get("target")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| prov.target.clone());

        Ok(Self {
            path,
            mode,
            sub_mode,
            poll_every,
            target,
        })
    }

    fn initial_request(&self) -> SubscribeRequest {
        let prefix = Path {
            origin: String::new(),
            elem: Vec::new(),
            target: self.target.clone(),
        };
        SubscribeRequest {
            request: Some(subscribe_request::Request::Subscribe(SubscriptionList {
                prefix: Some(prefix),
                subscription: vec![Subscription {
                    path: Some(parse_gnmi_path(&self.path, &self.target)),
                    mode: self.sub_mode as i32,
                    sample_interval: 0,
                    suppress_redundant: false,
                    heartbeat_interval: 0,
                }],
                mode: self.mode as i32,
                encoding: Encoding::JsonIetf as i32,
                updates_only: false,
            })),
        }
    }
}

#[async_trait]
impl ClientTransport for GrpcTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let grpc_prov = Self::expect_grpc(prov)?;
        if grpc_prov.is_gnmi() {
            Self::register_gnmi(grpc_prov).await
        } else {
            Self::register_utcp(grpc_prov).await
        }
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        Self::expect_grpc(prov)?;
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        _last_event_id: Option<&str>,
    ) -> Result<Value> {
        let grpc_prov = Self::expect_grpc(prov)?;
        if grpc_prov.is_gnmi() {
            return Err(UtcpError::Unsupported(
                "gNMI providers only support streaming via gnmi_subscribe".to_string(),
            )
            .into());
        }

        let channel = Self::connect(grpc_prov).await?;
        let mut client = UtcpServiceClient::new(channel);

        let mut request = Request::new(ToolCallRequest {
            tool: tool_name.to_string(),
            args_json: serde_json::to_string(&args)?,
        });
        Self::decorate(grpc_prov, &mut request)?;

        let response = client
            .call_tool(request)
            .await
            .map_err(|status| UtcpError::Protocol(format!("CallTool failed: {status}")))?
            .into_inner();
        if response.result_json.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&response.result_json)
            .unwrap_or_else(|_| Value::String(response.result_json)))
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        let grpc_prov = Self::expect_grpc(prov)?;
        let call_name = bare_tool_name(tool_name, &grpc_prov.name);
        if !grpc_prov.is_gnmi() || call_name != GNMI_SUBSCRIBE_TOOL {
            return Err(UtcpError::Unsupported(format!(
                "gRPC streaming is only available for gNMI Subscribe, not '{call_name}'"
            ))
            .into());
        }

        let spec = SubscribeSpec::from_args(&args, grpc_prov)?;
        let channel = Self::connect(grpc_prov).await?;
        let mut client = GNmiClient::new(channel);

        let (req_tx, req_rx) = mpsc::channel::<SubscribeRequest>(16);
        req_tx
            .send(spec.initial_request())
            .await
            .expect("fresh channel accepts the initial request");

        let mut request = Request::new(ReceiverStream::new(req_rx));
        Self::decorate(grpc_prov, &mut request)?;

        let mut inbound = client
            .subscribe(request)
            .await
            .map_err(|status| UtcpError::Protocol(format!("gNMI Subscribe failed: {status}")))?
            .into_inner();

        // POLL mode: a client-side ticker sends explicit Poll requests.
        if spec.mode == subscription_list::Mode::Poll {
            if let Some(every) = spec.poll_every {
                let poll_tx = req_tx.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(every);
                    ticker.tick().await; // first tick fires immediately
                    loop {
                        ticker.tick().await;
                        let poll = SubscribeRequest {
                            request: Some(subscribe_request::Request::Poll(Poll {})),
                        };
                        if poll_tx.send(poll).await.is_err() {
                            return;
                        }
                    }
                });
            }
        }

        let (out_tx, out_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            // Keeping req_tx alive here keeps the outbound half open for the
            // duration of the subscription.
            let _req_tx = req_tx;
            loop {
                match inbound.message().await {
                    Ok(Some(response)) => {
                        let value = match response.response {
                            Some(subscribe_response::Response::Update(notification)) => {
                                notification_to_json(&notification)
                            }
                            Some(subscribe_response::Response::SyncResponse(done)) => {
                                json!({ "sync_response": done })
                            }
                            None => Value::Null,
                        };
                        if out_tx.send(Ok(value)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        let _ = out_tx
                            .send(Err(UtcpError::Protocol(format!(
                                "gNMI stream error: {status}"
                            ))
                            .into()))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(boxed_channel_stream(out_rx, None))
    }
}
