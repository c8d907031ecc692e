use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::warn;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::errors::UtcpError;
use crate::providers::{Provider, ProviderType, WebRtcProvider};
use crate::tools::{Tool, UtcpManual};
use crate::transports::stream::{boxed_channel_stream, StreamResult};
use crate::transports::{bare_tool_name, ClientTransport};

const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Driver for WebRTC providers. Registration negotiates a peer connection
/// through an HTTP signaling endpoint (offer out, answer + manual + ICE
/// candidates back) and opens a named data channel. Invocations are framed
/// as `{id, tool, args}` and replies are correlated by `id`.
pub struct WebRtcTransport {
    client: Client,
    sessions: Mutex<HashMap<String, Arc<RtcSession>>>,
}

struct RtcSession {
    peer: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    pending: Arc<Mutex<HashMap<u64, mpsc::Sender<Result<Value>>>>>,
    next_id: AtomicU64,
}

impl RtcSession {
    /// Route one data-channel frame to the call that owns its `id`.
    async fn route(pending: &Mutex<HashMap<u64, mpsc::Sender<Result<Value>>>>, raw: &[u8]) {
        let Ok(message) = serde_json::from_slice::<Value>(raw) else {
            return;
        };
        let Some(id) = message.get("id").and_then(|v| v.as_u64()) else {
            return;
        };

        let mut pending = pending.lock().await;
        let Some(sender) = pending.get(&id).cloned() else {
            return;
        };

        if let Some(error) = message.get("error") {
            let _ = sender
                .send(Err(UtcpError::Protocol(format!("WebRTC tool error: {error}")).into()))
                .await;
            pending.remove(&id);
        } else if let Some(result) = message.get("result") {
            let _ = sender.send(Ok(result.clone())).await;
            pending.remove(&id);
        } else if let Some(chunk) = message.get("chunk") {
            let _ = sender.send(Ok(chunk.clone())).await;
        }

        if message.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
            pending.remove(&id);
        }
    }

    async fn begin_call(&self, tool: &str, args: &HashMap<String, Value>) -> Result<mpsc::Receiver<Result<Value>>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        self.pending.lock().await.insert(id, tx);

        let frame = json!({ "id": id, "tool": tool, "args": args });
        self.channel
            .send(&Bytes::from(frame.to_string().into_bytes()))
            .await
            .map_err(|e| UtcpError::Io(format!("data channel send failed: {e}")))?;
        Ok(rx)
    }
}

impl WebRtcTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("failed to build HTTP client"),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn expect_webrtc<'a>(prov: &'a Provider) -> Result<&'a WebRtcProvider> {
        match prov {
            Provider::Webrtc(p) => Ok(p),
            other => Err(UtcpError::mismatch(
                ProviderType::Webrtc,
                other.provider_type(),
            )),
        }
    }

    async fn session(&self, name: &str) -> Result<Arc<RtcSession>> {
        self.sessions
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| {
                UtcpError::ProviderNotFound(format!("WebRTC provider '{name}' is not registered"))
                    .into()
            })
    }

    async fn negotiate(&self, prov: &WebRtcProvider) -> Result<(Arc<RtcSession>, Vec<Tool>)> {
        let config = RTCConfiguration {
            ice_servers: prov
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let api = APIBuilder::new().build();
        let peer = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| UtcpError::Io(format!("peer connection failed: {e}")))?,
        );

        let channel = peer
            .create_data_channel(&prov.channel_label, None)
            .await
            .map_err(|e| UtcpError::Io(format!("data channel creation failed: {e}")))?;

        let pending: Arc<Mutex<HashMap<u64, mpsc::Sender<Result<Value>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let router = pending.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let router = router.clone();
            Box::pin(async move {
                RtcSession::route(&router, &msg.data).await;
            })
        }));

        let opened = Arc::new(Notify::new());
        let opened_signal = opened.clone();
        channel.on_open(Box::new(move || {
            let opened_signal = opened_signal.clone();
            Box::pin(async move {
                opened_signal.notify_one();
            })
        }));

        let offer = peer
            .create_offer(None)
            .await
            .map_err(|e| UtcpError::Io(format!("offer creation failed: {e}")))?;
        // Wait for ICE gathering so the offer carries our host candidates.
        let mut gather_complete = peer.gathering_complete_promise().await;
        peer.set_local_description(offer)
            .await
            .map_err(|e| UtcpError::Io(format!("set_local_description failed: {e}")))?;
        let _ = gather_complete.recv().await;

        let local = peer
            .local_description()
            .await
            .ok_or_else(|| UtcpError::Io("missing local description".to_string()))?;

        let response = self
            .client
            .post(&prov.signaling_server)
            .json(&json!({ "type": "offer", "sdp": local.sdp }))
            .send()
            .await
            .map_err(|e| UtcpError::Io(format!("signaling request failed: {e}")))?;
        let response = crate::transports::http::error_for_status(response).await?;
        let answer_doc: Value = response
            .json()
            .await
            .map_err(|e| UtcpError::Protocol(format!("invalid signaling response: {e}")))?;

        let answer_sdp = answer_doc
            .get("sdp")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UtcpError::Protocol("signaling response missing sdp".to_string()))?;
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| UtcpError::Protocol(format!("invalid answer SDP: {e}")))?;
        peer.set_remote_description(answer)
            .await
            .map_err(|e| UtcpError::Io(format!("set_remote_description failed: {e}")))?;

        if let Some(candidates) = answer_doc.get("candidates").and_then(|v| v.as_array()) {
            for candidate in candidates {
                let Some(candidate) = candidate.as_str() else {
                    continue;
                };
                let init = RTCIceCandidateInit {
                    candidate: candidate.to_string(),
                    ..Default::default()
                };
                if let Err(e) = peer.add_ice_candidate(init).await {
                    warn!("failed to apply ICE candidate: {e}");
                }
            }
        }

        let timeout = prov.timeout_ms.map(Duration::from_millis).unwrap_or(OPEN_TIMEOUT);
        tokio::time::timeout(timeout, opened.notified())
            .await
            .map_err(|_| UtcpError::Cancelled("data channel never opened".to_string()))?;

        let tools = answer_doc
            .get("manual")
            .and_then(UtcpManual::from_document)
            .map(|m| m.tools)
            .unwrap_or_default();

        let session = Arc::new(RtcSession {
            peer,
            channel,
            pending,
            next_id: AtomicU64::new(1),
        });
        Ok((session, tools))
    }
}

#[async_trait]
impl ClientTransport for WebRtcTransport {
    async fn register_tool_provider(&self, prov: &Provider) -> Result<Vec<Tool>> {
        let rtc_prov = Self::expect_webrtc(prov)?;
        let (session, tools) = self.negotiate(rtc_prov).await?;
        self.sessions
            .lock()
            .await
            .insert(rtc_prov.name.clone(), session);
        Ok(tools)
    }

    async fn deregister_tool_provider(&self, prov: &Provider) -> Result<()> {
        let rtc_prov = Self::expect_webrtc(prov)?;
        if let Some(session) = self.sessions.lock().await.remove(&rtc_prov.name) {
            if let Err(e) = session.peer.close().await {
                warn!("failed to close peer connection: {e}");
            }
        }
        Ok(())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
        _last_event_id: Option<&str>,
    ) -> Result<Value> {
        let rtc_prov = Self::expect_webrtc(prov)?;
        let session = self.session(&rtc_prov.name).await?;
        let call_name = bare_tool_name(tool_name, &rtc_prov.name);

        let mut rx = session.begin_call(call_name, &args).await?;
        match rx.recv().await {
            Some(result) => result,
            None => Err(UtcpError::Io("data channel closed mid-call".to_string()).into()),
        }
    }

    async fn call_tool_stream(
        &self,
        tool_name: &str,
        args: HashMap<String, Value>,
        prov: &Provider,
    ) -> Result<Box<dyn StreamResult>> {
        let rtc_prov = Self::expect_webrtc(prov)?;
        let session = self.session(&rtc_prov.name).await?;
        let call_name = bare_tool_name(tool_name, &rtc_prov.name);

        let rx = session.begin_call(call_name, &args).await?;
        Ok(boxed_channel_stream(rx, None))
    }
}
