//! Engine bridge over a single WebSocket.
//!
//! An external sidecar owns the chat wire protocol, encryption and
//! credentials. All devices share one socket; frames are JSON text:
//!
//! - request:   `{"id": n, "device": session_id, "op": "...", "args": {...}}`
//! - response:  `{"id": n, "ok": true, "result": ...}` or `{"id": n, "ok": false, "error": "..."}`
//! - event:     `{"device": session_id, "event": {...}, "jid": "..."}`
//! - bootstrap: `{"device": session_id, "bootstrap": {...}}`
//!
//! The socket is dialed lazily and redialed on the next request after a drop.

use async_trait::async_trait;
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use wamux_core::{
    BootstrapEvent, DeviceHandle, GatewayError, GatewayResult, Jid, MediaKind, MediaRef,
    OutboundMessage, ProtocolConnection, ProtocolEngine, ProtocolEvent, SendResponse,
    SessionStore, UploadHandle,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Capacity of a per-device pairing channel. Codes beyond it are dropped.
const BOOTSTRAP_CAPACITY: usize = 8;

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    device: &'a str,
    op: &'a str,
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        device: String,
        event: ProtocolEvent,
        #[serde(default)]
        jid: Option<Jid>,
    },
    Bootstrap {
        device: String,
        bootstrap: BootstrapEvent,
    },
}

#[derive(Default)]
struct DeviceState {
    connected: bool,
    identity: Option<Jid>,
    inbox: Option<mpsc::UnboundedSender<ProtocolEvent>>,
    bootstrap: Option<mpsc::Sender<BootstrapEvent>>,
}

struct Shared {
    url: String,
    timeout: Duration,
    store: Arc<dyn SessionStore>,
    /// Current socket and the generation it was dialed in.
    sink: tokio::sync::Mutex<Option<(u64, WsSink)>>,
    generation: AtomicU64,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<GatewayResult<Value>>>>,
    devices: Mutex<HashMap<String, DeviceState>>,
}

impl Shared {
    async fn request(self: &Arc<Self>, device: &str, op: &str, args: Value) -> GatewayResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&Request {
            id,
            device,
            op,
            args,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if let Err(e) = self.send_frame(frame).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Connection("engine bridge closed".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                debug!(device, op, "engine request timed out");
                Err(GatewayError::Timeout)
            }
        }
    }

    async fn send_frame(self: &Arc<Self>, frame: String) -> GatewayResult<()> {
        let mut sink = self.sink.lock().await;
        if sink.is_none() {
            *sink = Some(self.dial().await?);
        }
        let Some((_, ws)) = sink.as_mut() else {
            return Err(GatewayError::Connection("engine bridge unavailable".into()));
        };
        if let Err(e) = ws.send(Message::Text(frame)).await {
            *sink = None;
            return Err(GatewayError::Connection(format!("engine bridge write: {e}")));
        }
        Ok(())
    }

    async fn dial(self: &Arc<Self>) -> GatewayResult<(u64, WsSink)> {
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| GatewayError::Connection(format!("engine bridge connect: {e}")))?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        info!(url = %self.url, generation, "engine bridge connected");

        let (sink, stream) = ws.split();
        tokio::spawn(dispatch_loop(self.clone(), stream, generation));
        Ok((generation, sink))
    }

    fn route(&self, frame: Incoming) {
        match frame {
            Incoming::Response {
                id,
                ok,
                result,
                error,
            } => {
                let Some(tx) = self.pending.lock().remove(&id) else {
                    debug!(id, "response for unknown request");
                    return;
                };
                let outcome = if ok {
                    Ok(result)
                } else {
                    Err(GatewayError::Connection(
                        error.unwrap_or_else(|| "engine request failed".into()),
                    ))
                };
                let _ = tx.send(outcome);
            }
            Incoming::Event { device, event, jid } => self.route_event(device, event, jid),
            Incoming::Bootstrap { device, bootstrap } => self.route_bootstrap(&device, bootstrap),
        }
    }

    fn route_event(&self, device: String, event: ProtocolEvent, jid: Option<Jid>) {
        let mut identity_change = None;
        let inbox = {
            let mut devices = self.devices.lock();
            let Some(state) = devices.get_mut(&device) else {
                debug!(device = %device, "event for unknown device");
                return;
            };
            match &event {
                ProtocolEvent::Connected => {
                    state.connected = true;
                    if let Some(jid) = jid {
                        if state.identity.as_ref() != Some(&jid) {
                            state.identity = Some(jid.clone());
                            identity_change = Some(Some(jid));
                        }
                    }
                }
                ProtocolEvent::Disconnected => state.connected = false,
                ProtocolEvent::LoggedOut { .. } => {
                    state.connected = false;
                    if state.identity.take().is_some() {
                        identity_change = Some(None);
                    }
                }
                ProtocolEvent::Message(_) | ProtocolEvent::Receipt(_) => {}
            }
            state.inbox.clone()
        };

        if let Some(identity) = identity_change {
            let store = self.store.clone();
            let device = device.clone();
            tokio::spawn(async move {
                if let Err(e) = store.set_device_identity(&device, identity.as_ref()).await {
                    warn!(session_id = %device, error = %e, "failed to record device identity");
                }
            });
        }

        match inbox {
            Some(inbox) => {
                let _ = inbox.send(event);
            }
            None => debug!(device = %device, "event for unsubscribed device"),
        }
    }

    fn route_bootstrap(&self, device: &str, event: BootstrapEvent) {
        let mut devices = self.devices.lock();
        let Some(state) = devices.get_mut(device) else {
            return;
        };
        let terminal = !matches!(event, BootstrapEvent::Code { .. });
        if let Some(tx) = &state.bootstrap {
            if tx.try_send(event).is_err() {
                debug!(device, "pairing channel full or closed, dropping");
            }
        }
        if terminal {
            state.bootstrap = None;
        }
    }

    /// The socket of `generation` is gone: fail in-flight requests and tell
    /// every connected device.
    async fn on_closed(&self, generation: u64) {
        {
            let mut sink = self.sink.lock().await;
            if matches!(sink.as_ref(), Some((g, _)) if *g == generation) {
                *sink = None;
            }
        }

        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(GatewayError::Connection("engine bridge closed".into())));
        }

        let mut devices = self.devices.lock();
        for state in devices.values_mut() {
            state.bootstrap = None;
            if std::mem::take(&mut state.connected) {
                if let Some(inbox) = &state.inbox {
                    let _ = inbox.send(ProtocolEvent::Disconnected);
                }
            }
        }
        warn!(generation, "engine bridge disconnected");
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut stream: SplitStream<WsStream>, generation: u64) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!("non-utf8 frame from engine bridge");
                    continue;
                }
            },
            Ok(Message::Close(_)) => {
                debug!("engine bridge sent close frame");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "engine bridge read error");
                break;
            }
        };

        match serde_json::from_str::<Incoming>(&text) {
            Ok(frame) => shared.route(frame),
            Err(e) => warn!(error = %e, "malformed frame from engine bridge"),
        }
    }
    shared.on_closed(generation).await;
}

/// `ProtocolEngine` backed by the sidecar bridge.
pub struct BridgeEngine {
    shared: Arc<Shared>,
}

impl BridgeEngine {
    /// `timeout` bounds every request round trip; `store` receives device
    /// identities learned from pushed events.
    pub fn new(url: impl Into<String>, timeout: Duration, store: Arc<dyn SessionStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                timeout,
                store,
                sink: tokio::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                devices: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[async_trait]
impl ProtocolEngine for BridgeEngine {
    async fn open(&self, device: &DeviceHandle) -> GatewayResult<Arc<dyn ProtocolConnection>> {
        self.shared.devices.lock().insert(
            device.session_id.clone(),
            DeviceState {
                identity: device.jid.clone(),
                ..Default::default()
            },
        );
        debug!(session_id = %device.session_id, paired = device.jid.is_some(), "device opened");
        Ok(Arc::new(BridgeConnection {
            device: device.session_id.clone(),
            shared: self.shared.clone(),
        }))
    }
}

/// One device's view of the shared bridge.
pub struct BridgeConnection {
    device: String,
    shared: Arc<Shared>,
}

impl BridgeConnection {
    async fn call(&self, op: &str, args: Value) -> GatewayResult<Value> {
        self.shared.request(&self.device, op, args).await
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DeviceState) -> T) -> Option<T> {
        self.shared.devices.lock().get_mut(&self.device).map(f)
    }
}

#[derive(Deserialize)]
struct Downloaded {
    data: String,
}

#[derive(Deserialize)]
struct GroupInfo {
    name: String,
}

#[async_trait]
impl ProtocolConnection for BridgeConnection {
    async fn connect(&self) -> GatewayResult<()> {
        let jid = self.identity();
        self.call("connect", json!({ "jid": jid })).await.map(|_| ())
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        self.call("disconnect", Value::Null).await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.with_state(|s| s.connected).unwrap_or(false)
    }

    fn identity(&self) -> Option<Jid> {
        self.with_state(|s| s.identity.clone()).flatten()
    }

    fn subscribe(&self, inbox: mpsc::UnboundedSender<ProtocolEvent>) {
        self.with_state(|s| s.inbox = Some(inbox));
    }

    async fn open_bootstrap_channel(&self) -> GatewayResult<mpsc::Receiver<BootstrapEvent>> {
        let (tx, rx) = mpsc::channel(BOOTSTRAP_CAPACITY);
        self.with_state(|s| s.bootstrap = Some(tx));
        if let Err(e) = self.call("bootstrap", Value::Null).await {
            self.with_state(|s| s.bootstrap = None);
            return Err(e);
        }
        Ok(rx)
    }

    async fn send(&self, to: &Jid, message: OutboundMessage) -> GatewayResult<SendResponse> {
        let result = self
            .call("send", json!({ "to": to, "message": message }))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn upload(&self, data: Vec<u8>, kind: MediaKind) -> GatewayResult<UploadHandle> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let result = self
            .call("upload", json!({ "data": encoded, "kind": kind }))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn download(&self, media: &MediaRef) -> GatewayResult<Vec<u8>> {
        let result = self.call("download", json!({ "media": media })).await?;
        let downloaded: Downloaded = serde_json::from_value(result)?;
        base64::engine::general_purpose::STANDARD
            .decode(downloaded.data)
            .map_err(|e| GatewayError::Connection(format!("download payload: {e}")))
    }

    async fn group_name(&self, group: &Jid) -> GatewayResult<String> {
        let result = self.call("group_name", json!({ "jid": group })).await?;
        let info: GroupInfo = serde_json::from_value(result)?;
        Ok(info.name)
    }
}

impl Drop for BridgeConnection {
    fn drop(&mut self) {
        self.shared.devices.lock().remove(&self.device);
    }
}
