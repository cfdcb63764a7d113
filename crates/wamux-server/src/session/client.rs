//! One chat session: a state machine around a single protocol connection.
//!
//! Protocol events arrive on an ordered inbox drained by one task per
//! session. Each handler persists durable state first and then hands the
//! normalized event to the sink on a detached task.

use super::media::MediaStorage;
use super::qr::{self, QrSlot};
use crate::webhook::{spawn_delivery, EventSink};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use wamux_core::engine::{MediaAttachment, MessagePayload};
use wamux_core::{
    BootstrapEvent, ConnectionData, ContentKind, DeliveryStatus, Event, GatewayError,
    GatewayResult, InboundMessage, Jid, MediaKind, MessageData, OutboundMessage,
    ProtocolConnection, ProtocolEvent, Receipt, ReceiptType, SessionStore, StatusData,
};

/// Lifecycle states. `LoggedOut` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device identity yet; connecting requires a QR pairing.
    Unbootstrapped,
    /// Pairing codes are being offered.
    Bootstrapping,
    Connected,
    Disconnected,
    LoggedOut,
}

/// Result of the bounded wait behind the connect endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A pairing image (base64 PNG) is ready to scan.
    QrReady(String),
    /// Connected with this phone number.
    Connected(String),
    /// Nothing happened within the wait window.
    Pending,
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn SessionStore>,
    pub sink: Arc<dyn EventSink>,
    pub media: Arc<MediaStorage>,
    /// Deadline for every engine round trip.
    pub io_timeout: Duration,
}

pub struct Session {
    id: String,
    client_id: String,
    conn: Arc<dyn ProtocolConnection>,
    ctx: SessionContext,
    state: watch::Sender<SessionState>,
    qr: QrSlot,
}

/// Normalized content of an inbound message.
#[derive(Debug, PartialEq)]
pub(crate) struct Content<'a> {
    pub kind: ContentKind,
    pub body: String,
    pub quoted_msg_id: Option<String>,
    pub file_name: Option<String>,
    pub attachment: Option<&'a MediaAttachment>,
}

impl Content<'_> {
    fn text(body: &str) -> Self {
        Self {
            kind: ContentKind::Text,
            body: body.to_string(),
            quoted_msg_id: None,
            file_name: None,
            attachment: None,
        }
    }
}

/// Pick the single content kind of a payload, probing in fixed priority
/// order: text, extended text, image, document, audio, video.
pub(crate) fn classify(payload: &MessagePayload) -> Option<Content<'_>> {
    if let Some(text) = payload.conversation.as_deref().filter(|t| !t.is_empty()) {
        return Some(Content::text(text));
    }
    if let Some(ext) = &payload.extended_text {
        return Some(Content {
            quoted_msg_id: ext.quoted_message_id.clone().filter(|q| !q.is_empty()),
            ..Content::text(&ext.text)
        });
    }

    let media = |kind, att: &MediaAttachment, with_caption: bool| Content {
        kind,
        body: if with_caption {
            att.caption.clone().unwrap_or_default()
        } else {
            String::new()
        },
        quoted_msg_id: None,
        file_name: None,
        attachment: None,
    };

    if let Some(att) = &payload.image {
        return Some(Content {
            attachment: Some(att),
            ..media(ContentKind::Image, att, true)
        });
    }
    if let Some(att) = &payload.document {
        return Some(Content {
            file_name: att.file_name.clone(),
            attachment: Some(att),
            ..media(ContentKind::Document, att, true)
        });
    }
    if let Some(att) = &payload.audio {
        return Some(Content {
            attachment: Some(att),
            ..media(ContentKind::Audio, att, false)
        });
    }
    if let Some(att) = &payload.video {
        return Some(Content {
            attachment: Some(att),
            ..media(ContentKind::Video, att, true)
        });
    }
    None
}

fn send_failure(stage: &str, e: GatewayError) -> GatewayError {
    match e {
        GatewayError::Timeout => GatewayError::Timeout,
        other => GatewayError::Send(format!("{stage}: {other}")),
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Build a session around `conn` and start draining its inbox.
    pub fn new(
        id: impl Into<String>,
        client_id: impl Into<String>,
        conn: Arc<dyn ProtocolConnection>,
        ctx: SessionContext,
    ) -> Arc<Self> {
        let initial = if conn.identity().is_some() {
            SessionState::Disconnected
        } else {
            SessionState::Unbootstrapped
        };
        let (state, _) = watch::channel(initial);

        let (tx, rx) = mpsc::unbounded_channel();
        conn.subscribe(tx);

        let session = Arc::new(Self {
            id: id.into(),
            client_id: client_id.into(),
            conn,
            ctx,
            state,
            qr: QrSlot::new(),
        });
        tokio::spawn(run_inbox(Arc::downgrade(&session), rx));
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Phone number of the paired account, empty until pairing resolves.
    pub fn phone_number(&self) -> String {
        self.conn.identity().map(|jid| jid.user).unwrap_or_default()
    }

    /// True only when this session saw `connected` and the transport is up.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected && self.conn.is_connected()
    }

    /// Request a connection. Returns once the request is issued.
    ///
    /// Without a device identity this opens the pairing stream first and
    /// starts a listener that publishes every code it yields.
    pub async fn connect(self: &Arc<Self>) -> GatewayResult<()> {
        if self.state() == SessionState::LoggedOut {
            return Err(GatewayError::LoggedOut(self.id.clone()));
        }

        if self.conn.identity().is_none() {
            let codes = self.conn.open_bootstrap_channel().await?;
            self.conn.connect().await?;
            // A fast `connected` may already have landed on the inbox.
            self.state.send_if_modified(|s| {
                let pending = *s == SessionState::Unbootstrapped;
                if pending {
                    *s = SessionState::Bootstrapping;
                }
                pending
            });
            tokio::spawn(run_bootstrap(Arc::downgrade(self), codes));
            info!(session_id = %self.id, "connect requested, awaiting pairing");
        } else {
            self.conn.connect().await?;
            info!(session_id = %self.id, "reconnect requested");
        }
        Ok(())
    }

    /// Request a close without waiting for it.
    pub async fn disconnect(&self) -> GatewayResult<()> {
        debug!(session_id = %self.id, "disconnect requested");
        self.conn.disconnect().await
    }

    /// Wait up to `timeout` for a pending pairing image.
    pub async fn wait_for_qr(&self, timeout: Duration) -> Option<String> {
        self.qr.take(timeout).await
    }

    /// Wait up to `timeout` for whichever comes first: a pairing image or a
    /// confirmed connection.
    pub async fn wait_for_connection_or_qr(&self, timeout: Duration) -> ConnectOutcome {
        let mut state = self.state.subscribe();
        let connected = async move {
            loop {
                let connected = *state.borrow_and_update() == SessionState::Connected;
                if connected {
                    return;
                }
                if state.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            Some(code) = self.qr.take(timeout) => ConnectOutcome::QrReady(code),
            _ = connected => ConnectOutcome::Connected(self.phone_number()),
            _ = tokio::time::sleep(timeout) => ConnectOutcome::Pending,
        }
    }

    pub async fn send_text(&self, to: &str, text: &str) -> GatewayResult<String> {
        let jid = Jid::for_phone(to).map_err(|e| send_failure("recipient", e))?;
        let message = OutboundMessage::Text {
            text: text.to_string(),
        };
        self.deliver(&jid, message).await
    }

    pub async fn send_image(
        &self,
        to: &str,
        data: Vec<u8>,
        caption: &str,
        mime_type: &str,
    ) -> GatewayResult<String> {
        let jid = Jid::for_phone(to).map_err(|e| send_failure("recipient", e))?;
        let file_length = data.len() as u64;
        let upload = self
            .bounded(self.conn.upload(data, MediaKind::Image))
            .await
            .map_err(|e| send_failure("upload image", e))?;

        let message = OutboundMessage::Image {
            upload,
            mime_type: mime_type.to_string(),
            caption: caption.to_string(),
            file_length,
        };
        self.deliver(&jid, message).await
    }

    pub async fn send_document(
        &self,
        to: &str,
        data: Vec<u8>,
        file_name: &str,
        caption: &str,
        mime_type: &str,
    ) -> GatewayResult<String> {
        let jid = Jid::for_phone(to).map_err(|e| send_failure("recipient", e))?;
        let file_length = data.len() as u64;
        let upload = self
            .bounded(self.conn.upload(data, MediaKind::Document))
            .await
            .map_err(|e| send_failure("upload document", e))?;

        let message = OutboundMessage::Document {
            upload,
            mime_type: mime_type.to_string(),
            file_name: file_name.to_string(),
            caption: caption.to_string(),
            file_length,
        };
        self.deliver(&jid, message).await
    }

    async fn deliver(&self, jid: &Jid, message: OutboundMessage) -> GatewayResult<String> {
        let resp = self
            .bounded(self.conn.send(jid, message))
            .await
            .map_err(|e| send_failure("send", e))?;
        debug!(session_id = %self.id, to = %jid, message_id = %resp.message_id, "message sent");
        Ok(resp.message_id)
    }

    async fn bounded<T, F>(&self, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        tokio::time::timeout(self.ctx.io_timeout, fut).await?
    }

    /// Single entry point for protocol events.
    pub async fn handle_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Message(msg) => self.handle_message(msg).await,
            ProtocolEvent::Receipt(receipt) => self.handle_receipt(receipt),
            ProtocolEvent::Connected => self.handle_connected().await,
            ProtocolEvent::Disconnected => self.handle_disconnected().await,
            ProtocolEvent::LoggedOut { reason } => self.handle_logged_out(reason).await,
        }
    }

    async fn handle_connected(&self) {
        if self.state() == SessionState::LoggedOut {
            debug!(session_id = %self.id, "ignoring connected after logout");
            return;
        }
        self.state.send_replace(SessionState::Connected);
        self.qr.clear();

        let phone = self.phone_number();
        info!(session_id = %self.id, phone = %phone, "session connected");

        self.persist(&phone, true).await;
        self.emit(Event::connection(
            &self.id,
            &self.client_id,
            ConnectionData::connected(phone),
        ));
    }

    async fn handle_disconnected(&self) {
        if self.state() == SessionState::LoggedOut {
            debug!(session_id = %self.id, "ignoring disconnected after logout");
            return;
        }
        self.state.send_replace(SessionState::Disconnected);
        info!(session_id = %self.id, "session disconnected");

        // The stored phone number is cleared on every disconnect.
        self.persist("", false).await;
        self.emit(Event::connection(
            &self.id,
            &self.client_id,
            ConnectionData::disconnected(),
        ));
    }

    async fn handle_logged_out(&self, reason: Option<String>) {
        self.state.send_replace(SessionState::LoggedOut);
        self.qr.clear();
        info!(
            session_id = %self.id,
            reason = reason.as_deref().unwrap_or("unspecified"),
            "session logged out"
        );

        if let Err(e) = self.ctx.store.delete_session(&self.id).await {
            warn!(session_id = %self.id, error = %e, "failed to delete logged-out session record");
        }
        self.emit(Event::connection(
            &self.id,
            &self.client_id,
            ConnectionData::logged_out(),
        ));
    }

    async fn handle_message(&self, msg: InboundMessage) {
        let info = &msg.info;
        if info.chat.is_broadcast() {
            debug!(session_id = %self.id, message_id = %info.id, "skipping broadcast message");
            return;
        }

        // Unrecognized content is still relayed, with no type and an empty body.
        let (kind, content) = match classify(&msg.message) {
            Some(content) => (Some(content.kind), content),
            None => {
                debug!(session_id = %self.id, message_id = %info.id, "message has no recognized content");
                (None, Content::text(""))
            }
        };

        let group_name = if info.is_group {
            match self.bounded(self.conn.group_name(&info.chat)).await {
                Ok(name) => Some(name),
                Err(e) => {
                    debug!(session_id = %self.id, chat = %info.chat, error = %e, "group name lookup failed");
                    None
                }
            }
        } else {
            None
        };

        let mut mime_type = None;
        let mut media_url = None;
        if let Some(att) = content.attachment {
            mime_type = Some(att.mime_type.clone()).filter(|m| !m.is_empty());
            media_url = self.fetch_media(&info.id, att).await;
        }

        let data = MessageData {
            message_id: info.id.clone(),
            from: info.sender.user.clone(),
            to: info.chat.user.clone(),
            body: content.body,
            kind,
            media_url,
            mime_type,
            file_name: content.file_name,
            is_from_me: info.is_from_me,
            is_group: info.is_group,
            group_name,
            push_name: info.push_name.clone(),
            quoted_msg_id: content.quoted_msg_id,
        };
        self.emit(Event::message(&self.id, &self.client_id, data));
    }

    /// Download and store an attachment. Any failure yields `None`.
    async fn fetch_media(&self, message_id: &str, att: &MediaAttachment) -> Option<String> {
        let data = match self.bounded(self.conn.download(&att.media)).await {
            Ok(data) => data,
            Err(e) => {
                warn!(session_id = %self.id, message_id, error = %e, "media download failed");
                return None;
            }
        };
        match self.ctx.media.save(message_id, &att.mime_type, &data).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(session_id = %self.id, message_id, error = %e, "media write failed");
                None
            }
        }
    }

    fn handle_receipt(&self, receipt: Receipt) {
        let status = match receipt.receipt_type {
            ReceiptType::Delivered => DeliveryStatus::Delivered,
            ReceiptType::Read => DeliveryStatus::Read,
            _ => return,
        };
        for message_id in receipt.message_ids {
            self.emit(Event::status(
                &self.id,
                &self.client_id,
                StatusData {
                    message_id,
                    status,
                    to: receipt.chat.user.clone(),
                },
            ));
        }
    }

    fn handle_bootstrap(&self, event: BootstrapEvent) -> bool {
        if self.state() == SessionState::LoggedOut {
            return false;
        }
        match event {
            BootstrapEvent::Code { code } => {
                let image = match qr::render_png_base64(&code) {
                    Ok(image) => image,
                    Err(e) => {
                        warn!(session_id = %self.id, error = %e, "failed to render pairing code");
                        return true;
                    }
                };
                debug!(session_id = %self.id, "pairing code ready");
                self.qr.offer(image.clone());
                self.emit(Event::connection(
                    &self.id,
                    &self.client_id,
                    ConnectionData::qr_ready(image),
                ));
                true
            }
            BootstrapEvent::Success => {
                info!(session_id = %self.id, "pairing succeeded");
                false
            }
            BootstrapEvent::Timeout => {
                info!(session_id = %self.id, "pairing window expired");
                self.end_bootstrap();
                false
            }
            BootstrapEvent::Error { message } => {
                warn!(session_id = %self.id, error = %message, "pairing failed");
                self.end_bootstrap();
                false
            }
        }
    }

    fn end_bootstrap(&self) {
        self.qr.clear();
        self.state.send_if_modified(|s| {
            if *s == SessionState::Bootstrapping {
                *s = SessionState::Unbootstrapped;
                true
            } else {
                false
            }
        });
    }

    async fn persist(&self, phone: &str, connected: bool) {
        if let Err(e) = self
            .ctx
            .store
            .upsert_session(&self.id, &self.client_id, phone, connected)
            .await
        {
            warn!(session_id = %self.id, error = %e, "failed to persist session state");
        }
    }

    fn emit(&self, event: Event) {
        spawn_delivery(self.ctx.sink.clone(), event);
    }
}

async fn run_inbox(session: Weak<Session>, mut inbox: mpsc::UnboundedReceiver<ProtocolEvent>) {
    while let Some(event) = inbox.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_event(event).await;
    }
}

async fn run_bootstrap(session: Weak<Session>, mut codes: mpsc::Receiver<BootstrapEvent>) {
    while let Some(event) = codes.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        if !session.handle_bootstrap(event) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{
        assert_no_event, next_event, FailingStore, MockConnection, RecordingSink,
    };
    use crate::store::MemoryStore;
    use std::sync::atomic::Ordering;
    use wamux_core::engine::{ExtendedText, MessageInfo};
    use wamux_core::{ConnectionStatus, EventType, MediaRef};

    struct Harness {
        session: Arc<Session>,
        conn: Arc<MockConnection>,
        store: Arc<MemoryStore>,
        events: mpsc::UnboundedReceiver<Event>,
        _media_dir: tempfile::TempDir,
    }

    fn harness(identity: Option<&str>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_with_store(identity, store.clone(), store)
    }

    fn harness_with_store(
        identity: Option<&str>,
        store: Arc<dyn SessionStore>,
        memory: Arc<MemoryStore>,
    ) -> Harness {
        let media_dir = tempfile::tempdir().unwrap();
        let (sink, events) = RecordingSink::new();
        let conn = MockConnection::new(identity.map(|p| Jid::for_phone(p).unwrap()));
        let ctx = SessionContext {
            store,
            sink,
            media: Arc::new(MediaStorage::new(media_dir.path().to_path_buf(), "/media")),
            io_timeout: Duration::from_secs(1),
        };
        let session = Session::new("s1", "crm-42", conn.clone(), ctx);
        Harness {
            session,
            conn,
            store: memory,
            events,
            _media_dir: media_dir,
        }
    }

    fn inbound(chat: &str, payload: MessagePayload) -> ProtocolEvent {
        let chat = Jid::parse(chat).unwrap();
        ProtocolEvent::Message(InboundMessage {
            info: MessageInfo {
                id: "3EB0MSG".into(),
                is_group: chat.is_group(),
                chat,
                sender: Jid::for_phone("5511888888888").unwrap(),
                is_from_me: false,
                push_name: "Ana".into(),
                timestamp: 1_700_000_000,
            },
            message: payload,
        })
    }

    fn attachment(mime: &str) -> MediaAttachment {
        MediaAttachment {
            media: MediaRef {
                kind: MediaKind::Image,
                direct_path: "/v/t62/x".into(),
                media_key: "a2V5".into(),
                file_length: 4,
            },
            mime_type: mime.into(),
            caption: Some("look".into()),
            file_name: Some("report.pdf".into()),
        }
    }

    #[test]
    fn test_classify_priority() {
        let payload = MessagePayload {
            conversation: Some("plain".into()),
            extended_text: Some(ExtendedText {
                text: "ext".into(),
                quoted_message_id: Some("Q1".into()),
            }),
            image: Some(attachment("image/jpeg")),
            ..Default::default()
        };
        let content = classify(&payload).unwrap();
        assert_eq!(content.kind, ContentKind::Text);
        assert_eq!(content.body, "plain");
        assert!(content.attachment.is_none());

        let payload = MessagePayload {
            conversation: Some(String::new()),
            extended_text: Some(ExtendedText {
                text: "reply".into(),
                quoted_message_id: Some("Q1".into()),
            }),
            ..Default::default()
        };
        let content = classify(&payload).unwrap();
        assert_eq!(content.kind, ContentKind::Text);
        assert_eq!(content.body, "reply");
        assert_eq!(content.quoted_msg_id.as_deref(), Some("Q1"));
    }

    #[test]
    fn test_classify_media_kinds() {
        let both = MessagePayload {
            image: Some(attachment("image/png")),
            document: Some(attachment("application/pdf")),
            ..Default::default()
        };
        assert_eq!(classify(&both).unwrap().kind, ContentKind::Image);

        let doc = MessagePayload {
            document: Some(attachment("application/pdf")),
            video: Some(attachment("video/mp4")),
            ..Default::default()
        };
        let content = classify(&doc).unwrap();
        assert_eq!(content.kind, ContentKind::Document);
        assert_eq!(content.file_name.as_deref(), Some("report.pdf"));
        assert_eq!(content.body, "look");

        let audio = MessagePayload {
            audio: Some(attachment("audio/ogg; codecs=opus")),
            ..Default::default()
        };
        let content = classify(&audio).unwrap();
        assert_eq!(content.kind, ContentKind::Audio);
        assert_eq!(content.body, "");

        let video = MessagePayload {
            video: Some(attachment("video/mp4")),
            ..Default::default()
        };
        assert_eq!(classify(&video).unwrap().kind, ContentKind::Video);

        assert!(classify(&MessagePayload::default()).is_none());
    }

    #[tokio::test]
    async fn test_connected_persists_then_emits() {
        let mut h = harness(None);
        assert_eq!(h.session.state(), SessionState::Unbootstrapped);

        h.conn.complete_connection("5511999999999");
        let event = next_event(&mut h.events).await;

        let data = event.as_connection().unwrap();
        assert_eq!(data.status, ConnectionStatus::Connected);
        assert_eq!(data.phone_number.as_deref(), Some("5511999999999"));
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.client_id, "crm-42");

        let rec = h.store.get_session("s1").await.unwrap().unwrap();
        assert!(rec.connected);
        assert_eq!(rec.phone_number, "5511999999999");
        assert!(h.session.is_connected());
    }

    #[tokio::test]
    async fn test_disconnected_clears_phone() {
        let mut h = harness(Some("5511999999999"));
        h.conn.complete_connection("5511999999999");
        next_event(&mut h.events).await;

        h.conn.drop_connection();
        let event = next_event(&mut h.events).await;
        assert_eq!(
            event.as_connection().unwrap().status,
            ConnectionStatus::Disconnected
        );

        let rec = h.store.get_session("s1").await.unwrap().unwrap();
        assert!(!rec.connected);
        assert_eq!(rec.phone_number, "");
        assert!(!h.session.is_connected());
        assert_eq!(h.session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_logout_is_terminal() {
        let mut h = harness(Some("5511999999999"));
        h.conn.complete_connection("5511999999999");
        next_event(&mut h.events).await;
        assert!(h.store.get_session("s1").await.unwrap().is_some());

        h.conn.push(ProtocolEvent::LoggedOut {
            reason: Some("revoked".into()),
        });
        let event = next_event(&mut h.events).await;
        assert_eq!(
            event.as_connection().unwrap().status,
            ConnectionStatus::LoggedOut
        );
        assert!(h.store.get_session("s1").await.unwrap().is_none());

        // Late transport events never resurrect the record.
        h.conn.complete_connection("5511999999999");
        h.conn.drop_connection();
        assert_no_event(&mut h.events).await;
        assert!(h.store.get_session("s1").await.unwrap().is_none());
        assert!(!h.session.is_connected());

        let err = h.session.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::LoggedOut(_)));
    }

    #[tokio::test]
    async fn test_storage_failure_still_emits() {
        let memory = Arc::new(MemoryStore::new());
        let store = FailingStore::read_only(memory.clone());
        let mut h = harness_with_store(None, store, memory);
        h.conn.complete_connection("5511999999999");
        let event = next_event(&mut h.events).await;
        assert_eq!(
            event.as_connection().unwrap().status,
            ConnectionStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_broadcast_is_ignored() {
        let mut h = harness(Some("5511999999999"));
        h.conn.push(inbound(
            "status@broadcast",
            MessagePayload {
                conversation: Some("story".into()),
                ..Default::default()
            },
        ));
        // A receipt queued behind it is the first thing the sink sees.
        h.conn.push(ProtocolEvent::Receipt(Receipt {
            chat: Jid::for_phone("5511").unwrap(),
            message_ids: vec!["sentinel".into()],
            receipt_type: ReceiptType::Delivered,
        }));

        let event = next_event(&mut h.events).await;
        assert_eq!(event.event_type, EventType::Status);
        assert_no_event(&mut h.events).await;
    }

    #[tokio::test]
    async fn test_text_message_event() {
        let mut h = harness(Some("5511999999999"));
        h.conn.push(inbound(
            "5511888888888@s.whatsapp.net",
            MessagePayload {
                extended_text: Some(ExtendedText {
                    text: "hello".into(),
                    quoted_message_id: Some("Q9".into()),
                }),
                ..Default::default()
            },
        ));
        let event = next_event(&mut h.events).await;
        let data = event.as_message().unwrap();
        assert_eq!(data.message_id, "3EB0MSG");
        assert_eq!(data.from, "5511888888888");
        assert_eq!(data.to, "5511888888888");
        assert_eq!(data.body, "hello");
        assert_eq!(data.kind, Some(ContentKind::Text));
        assert_eq!(data.quoted_msg_id.as_deref(), Some("Q9"));
        assert_eq!(data.push_name, "Ana");
        assert!(data.media_url.is_none());
        assert!(data.group_name.is_none());
    }

    #[tokio::test]
    async fn test_unrecognized_message_is_relayed_without_type() {
        let mut h = harness(Some("5511999999999"));
        h.conn.push(inbound(
            "5511888888888@s.whatsapp.net",
            MessagePayload::default(),
        ));
        let event = next_event(&mut h.events).await;
        let data = event.as_message().unwrap();
        assert_eq!(data.message_id, "3EB0MSG");
        assert_eq!(data.kind, None);
        assert_eq!(data.body, "");
        assert!(data.media_url.is_none());
        assert!(data.mime_type.is_none());

        let value = serde_json::to_value(&event).unwrap();
        assert!(value["data"].get("type").is_none());
    }

    #[tokio::test]
    async fn test_group_message_with_and_without_name() {
        let mut h = harness(Some("5511999999999"));
        h.conn
            .group_names
            .lock()
            .insert("120363".into(), "Team".into());

        let text = || MessagePayload {
            conversation: Some("hi all".into()),
            ..Default::default()
        };
        h.conn.push(inbound("120363@g.us", text()));
        let event = next_event(&mut h.events).await;
        let data = event.as_message().unwrap();
        assert!(data.is_group);
        assert_eq!(data.group_name.as_deref(), Some("Team"));

        h.conn.push(inbound("999999@g.us", text()));
        let event = next_event(&mut h.events).await;
        assert!(event.as_message().unwrap().group_name.is_none());
    }

    #[tokio::test]
    async fn test_image_is_saved_to_media_dir() {
        let mut h = harness(Some("5511999999999"));
        *h.conn.download_data.lock() = Some(vec![0xff, 0xd8, 0xff, 0xe0]);
        h.conn.push(inbound(
            "5511888888888@s.whatsapp.net",
            MessagePayload {
                image: Some(attachment("image/jpeg")),
                ..Default::default()
            },
        ));

        let event = next_event(&mut h.events).await;
        let data = event.as_message().unwrap();
        assert_eq!(data.kind, Some(ContentKind::Image));
        assert_eq!(data.body, "look");
        assert_eq!(data.mime_type.as_deref(), Some("image/jpeg"));
        let url = data.media_url.as_deref().unwrap();
        assert!(url.starts_with("/media/3EB0MSG_"));
        assert!(url.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_failed_download_still_emits() {
        let mut h = harness(Some("5511999999999"));
        h.conn.push(inbound(
            "5511888888888@s.whatsapp.net",
            MessagePayload {
                document: Some(attachment("application/pdf")),
                ..Default::default()
            },
        ));
        let event = next_event(&mut h.events).await;
        let data = event.as_message().unwrap();
        assert_eq!(data.kind, Some(ContentKind::Document));
        assert_eq!(data.file_name.as_deref(), Some("report.pdf"));
        assert!(data.media_url.is_none());
    }

    #[tokio::test]
    async fn test_read_receipt_fans_out() {
        let mut h = harness(Some("5511999999999"));
        h.conn.push(ProtocolEvent::Receipt(Receipt {
            chat: Jid::for_phone("5511777777777").unwrap(),
            message_ids: vec!["m1".into(), "m2".into()],
            receipt_type: ReceiptType::Read,
        }));

        let mut ids = Vec::new();
        for _ in 0..2 {
            let event = next_event(&mut h.events).await;
            let data = event.as_status().unwrap();
            assert_eq!(data.status, DeliveryStatus::Read);
            assert_eq!(data.to, "5511777777777");
            ids.push(data.message_id.clone());
        }
        ids.sort();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_no_event(&mut h.events).await;
    }

    #[tokio::test]
    async fn test_other_receipts_ignored() {
        let mut h = harness(Some("5511999999999"));
        h.conn.push(ProtocolEvent::Receipt(Receipt {
            chat: Jid::for_phone("5511").unwrap(),
            message_ids: vec!["m1".into()],
            receipt_type: ReceiptType::Played,
        }));
        assert_no_event(&mut h.events).await;
    }

    #[tokio::test]
    async fn test_connect_without_identity_publishes_qr() {
        let mut h = harness(None);
        h.session.connect().await.unwrap();
        assert!(h.conn.has_bootstrap_channel());
        assert_eq!(h.conn.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.state(), SessionState::Bootstrapping);

        h.conn
            .push_bootstrap(BootstrapEvent::Code {
                code: "2@first".into(),
            })
            .await;
        let event = next_event(&mut h.events).await;
        let data = event.as_connection().unwrap();
        assert_eq!(data.status, ConnectionStatus::QrReady);
        let image = data.qr_code.clone().unwrap();

        let outcome = h
            .session
            .wait_for_connection_or_qr(Duration::from_secs(1))
            .await;
        assert_eq!(outcome, ConnectOutcome::QrReady(image));
        assert_eq!(h.session.wait_for_qr(Duration::from_millis(20)).await, None);
    }

    #[tokio::test]
    async fn test_connect_with_identity_reconnects_directly() {
        let h = harness(Some("5511999999999"));
        h.session.connect().await.unwrap();
        assert!(!h.conn.has_bootstrap_channel());
        assert_eq!(h.conn.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let h = harness(None);
        h.conn.fail_connect.store(true, Ordering::SeqCst);
        let err = h.session.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::Connection(_)));
        assert_eq!(h.session.state(), SessionState::Unbootstrapped);
    }

    #[tokio::test]
    async fn test_bootstrap_timeout_resets_state() {
        let h = harness(None);
        h.session.connect().await.unwrap();
        h.conn.push_bootstrap(BootstrapEvent::Timeout).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.session.state(), SessionState::Unbootstrapped);
    }

    #[tokio::test]
    async fn test_wait_reports_connection() {
        let h = harness(Some("5511999999999"));
        h.session.connect().await.unwrap();
        let conn = h.conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            conn.complete_connection("5511999999999");
        });
        let outcome = h
            .session
            .wait_for_connection_or_qr(Duration::from_secs(2))
            .await;
        assert_eq!(outcome, ConnectOutcome::Connected("5511999999999".into()));
    }

    #[tokio::test]
    async fn test_wait_times_out_pending() {
        let h = harness(Some("5511999999999"));
        let outcome = h
            .session
            .wait_for_connection_or_qr(Duration::from_millis(50))
            .await;
        assert_eq!(outcome, ConnectOutcome::Pending);
    }

    #[tokio::test]
    async fn test_is_connected_requires_transport() {
        let mut h = harness(Some("5511999999999"));
        h.conn.complete_connection("5511999999999");
        next_event(&mut h.events).await;
        assert!(h.session.is_connected());

        h.conn.set_transport_connected(false);
        assert!(!h.session.is_connected());
    }

    #[tokio::test]
    async fn test_send_text() {
        let h = harness(Some("5511999999999"));
        let id = h.session.send_text("+5511888888888", "hi").await.unwrap();
        assert!(!id.is_empty());

        let sent = h.conn.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.to_string(), "5511888888888@s.whatsapp.net");
        assert_eq!(sent[0].1.text(), Some("hi"));
        assert!(sent[0].1.upload().is_none());
    }

    #[tokio::test]
    async fn test_send_image_uploads_first() {
        let h = harness(Some("5511999999999"));
        h.session
            .send_image("5511888888888", vec![1, 2, 3], "pic", "image/png")
            .await
            .unwrap();

        assert_eq!(h.conn.uploads.lock()[0], (3, MediaKind::Image));
        let sent = h.conn.sent.lock();
        match &sent[0].1 {
            OutboundMessage::Image {
                mime_type,
                caption,
                file_length,
                ..
            } => {
                assert_eq!(mime_type, "image/png");
                assert_eq!(caption, "pic");
                assert_eq!(*file_length, 3);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_document_carries_file_name() {
        let h = harness(Some("5511999999999"));
        h.session
            .send_document("5511888888888", vec![9; 10], "a.pdf", "", "application/pdf")
            .await
            .unwrap();
        assert_eq!(h.conn.uploads.lock()[0], (10, MediaKind::Document));
        let sent = h.conn.sent.lock();
        match &sent[0].1 {
            OutboundMessage::Document { file_name, .. } => assert_eq!(file_name, "a.pdf"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_to_invalid_address() {
        let h = harness(Some("5511999999999"));
        let err = h.session.send_text("not-a-number", "hi").await.unwrap_err();
        assert!(matches!(err, GatewayError::Send(_)));
        assert!(h.conn.sent.lock().is_empty());
    }
}
