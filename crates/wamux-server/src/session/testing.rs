//! In-process doubles for the protocol engine, the event sink and the store.

use crate::store::MemoryStore;
use crate::webhook::EventSink;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wamux_core::{
    BootstrapEvent, DeviceHandle, Event, GatewayError, GatewayResult, Jid, MediaKind, MediaRef,
    OutboundMessage, ProtocolConnection, ProtocolEngine, ProtocolEvent, SendResponse,
    SessionRecord, SessionStore, UploadHandle,
};

pub struct MockConnection {
    connected: AtomicBool,
    identity: Mutex<Option<Jid>>,
    inbox: Mutex<Option<mpsc::UnboundedSender<ProtocolEvent>>>,
    bootstrap: Mutex<Option<mpsc::Sender<BootstrapEvent>>>,
    pub sent: Mutex<Vec<(Jid, OutboundMessage)>>,
    pub uploads: Mutex<Vec<(usize, MediaKind)>>,
    pub connect_calls: AtomicUsize,
    pub disconnect_calls: AtomicUsize,
    /// Bytes returned by `download`. `None` makes downloads fail.
    pub download_data: Mutex<Option<Vec<u8>>>,
    pub group_names: Mutex<HashMap<String, String>>,
    pub fail_connect: AtomicBool,
    pub fail_disconnect: AtomicBool,
    /// How long `disconnect` stalls before returning.
    pub disconnect_delay: Mutex<Duration>,
}

impl MockConnection {
    pub fn new(identity: Option<Jid>) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            identity: Mutex::new(identity),
            inbox: Mutex::new(None),
            bootstrap: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            download_data: Mutex::new(None),
            group_names: Mutex::new(HashMap::new()),
            fail_connect: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            disconnect_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Push a protocol event into the subscribed inbox.
    pub fn push(&self, event: ProtocolEvent) {
        let inbox = self.inbox.lock().clone();
        inbox
            .expect("no inbox subscribed")
            .send(event)
            .expect("inbox closed");
    }

    pub async fn push_bootstrap(&self, event: BootstrapEvent) {
        let tx = self.bootstrap.lock().clone();
        tx.expect("no bootstrap channel open")
            .send(event)
            .await
            .expect("bootstrap channel closed");
    }

    /// Pair (if needed), mark the transport up and push `Connected`.
    pub fn complete_connection(&self, phone: &str) {
        *self.identity.lock() = Some(Jid::for_phone(phone).expect("valid phone"));
        self.connected.store(true, Ordering::SeqCst);
        self.push(ProtocolEvent::Connected);
    }

    /// Drop the transport and push `Disconnected`.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.push(ProtocolEvent::Disconnected);
    }

    pub fn set_transport_connected(&self, up: bool) {
        self.connected.store(up, Ordering::SeqCst);
    }

    pub fn has_bootstrap_channel(&self) -> bool {
        self.bootstrap.lock().is_some()
    }
}

#[async_trait]
impl ProtocolConnection for MockConnection {
    async fn connect(&self) -> GatewayResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("refused".into()));
        }
        Ok(())
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.disconnect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("already closed".into()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn identity(&self) -> Option<Jid> {
        self.identity.lock().clone()
    }

    fn subscribe(&self, inbox: mpsc::UnboundedSender<ProtocolEvent>) {
        *self.inbox.lock() = Some(inbox);
    }

    async fn open_bootstrap_channel(&self) -> GatewayResult<mpsc::Receiver<BootstrapEvent>> {
        let (tx, rx) = mpsc::channel(8);
        *self.bootstrap.lock() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, to: &Jid, message: OutboundMessage) -> GatewayResult<SendResponse> {
        let mut sent = self.sent.lock();
        sent.push((to.clone(), message));
        Ok(SendResponse {
            message_id: format!("MOCK{}", sent.len()),
            timestamp: 1_700_000_000,
        })
    }

    async fn upload(&self, data: Vec<u8>, kind: MediaKind) -> GatewayResult<UploadHandle> {
        self.uploads.lock().push((data.len(), kind));
        Ok(UploadHandle {
            url: "https://mmg.example/u".into(),
            direct_path: "/v/t62/u".into(),
            media_key: "a2V5".into(),
            file_sha256: "c2hh".into(),
            file_enc_sha256: "ZW5j".into(),
        })
    }

    async fn download(&self, _media: &MediaRef) -> GatewayResult<Vec<u8>> {
        self.download_data
            .lock()
            .clone()
            .ok_or_else(|| GatewayError::Connection("media expired".into()))
    }

    async fn group_name(&self, group: &Jid) -> GatewayResult<String> {
        self.group_names
            .lock()
            .get(&group.user)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(group.to_string()))
    }
}

/// Engine that hands out [`MockConnection`]s and remembers them by session id.
#[derive(Default)]
pub struct MockEngine {
    connections: Mutex<HashMap<String, Arc<MockConnection>>>,
    /// Every `open` fails.
    pub fail_open: AtomicBool,
    /// `open` fails for these session ids only.
    pub refused: Mutex<HashSet<String>>,
    /// Disconnect delay given to connections opened from now on.
    pub disconnect_delay: Mutex<Duration>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection(&self, session_id: &str) -> Arc<MockConnection> {
        self.connections
            .lock()
            .get(session_id)
            .cloned()
            .expect("no connection opened for session")
    }

    pub fn opened(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl ProtocolEngine for MockEngine {
    async fn open(&self, device: &DeviceHandle) -> GatewayResult<Arc<dyn ProtocolConnection>> {
        if self.fail_open.load(Ordering::SeqCst) || self.refused.lock().contains(&device.session_id)
        {
            return Err(GatewayError::Connection("engine down".into()));
        }
        let conn = MockConnection::new(device.jid.clone());
        *conn.disconnect_delay.lock() = *self.disconnect_delay.lock();
        self.connections
            .lock()
            .insert(device.session_id.clone(), conn.clone());
        Ok(conn)
    }
}

/// Sink that forwards every event to a channel.
pub struct RecordingSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl RecordingSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn send(&self, event: Event) -> GatewayResult<()> {
        let _ = self.tx.send(event);
        Ok(())
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("sink closed")
}

pub async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<Event>) {
    if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

/// Store that fails the operations switched on; everything else goes to a
/// shared [`MemoryStore`].
pub struct FailingStore {
    pub inner: Arc<MemoryStore>,
    pub fail_upsert: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_list: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_upsert: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
        })
    }

    /// Session upserts and deletes fail.
    pub fn read_only(inner: Arc<MemoryStore>) -> Arc<Self> {
        let store = Self::new(inner);
        store.fail_upsert.store(true, Ordering::SeqCst);
        store.fail_delete.store(true, Ordering::SeqCst);
        store
    }

    fn check(flag: &AtomicBool) -> GatewayResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(GatewayError::Storage("disk full".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FailingStore {
    async fn upsert_session(
        &self,
        id: &str,
        client_id: &str,
        phone_number: &str,
        connected: bool,
    ) -> GatewayResult<()> {
        Self::check(&self.fail_upsert)?;
        self.inner
            .upsert_session(id, client_id, phone_number, connected)
            .await
    }

    async fn get_session(&self, id: &str) -> GatewayResult<Option<SessionRecord>> {
        self.inner.get_session(id).await
    }

    async fn get_session_by_client_id(
        &self,
        client_id: &str,
    ) -> GatewayResult<Option<SessionRecord>> {
        self.inner.get_session_by_client_id(client_id).await
    }

    async fn delete_session(&self, id: &str) -> GatewayResult<()> {
        Self::check(&self.fail_delete)?;
        self.inner.delete_session(id).await
    }

    async fn list_sessions(&self) -> GatewayResult<Vec<SessionRecord>> {
        Self::check(&self.fail_list)?;
        self.inner.list_sessions().await
    }

    async fn new_device(&self, session_id: &str) -> GatewayResult<DeviceHandle> {
        self.inner.new_device(session_id).await
    }

    async fn all_devices(&self) -> GatewayResult<Vec<DeviceHandle>> {
        self.inner.all_devices().await
    }

    async fn delete_device(&self, session_id: &str) -> GatewayResult<()> {
        self.inner.delete_device(session_id).await
    }

    async fn set_device_identity(&self, session_id: &str, jid: Option<&Jid>) -> GatewayResult<()> {
        self.inner.set_device_identity(session_id, jid).await
    }
}
