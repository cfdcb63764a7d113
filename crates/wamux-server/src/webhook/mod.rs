//! Outbound event delivery.

pub mod dispatcher;

pub use dispatcher::WebhookDispatcher;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use wamux_core::{ConnectionData, Event, GatewayResult, MessageData, StatusData};

/// Destination for normalized events.
///
/// One attempt per event; implementations never retry or queue.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: Event) -> GatewayResult<()>;

    async fn send_message(
        &self,
        session_id: &str,
        client_id: &str,
        data: MessageData,
    ) -> GatewayResult<()> {
        self.send(Event::message(session_id, client_id, data)).await
    }

    async fn send_status(
        &self,
        session_id: &str,
        client_id: &str,
        data: StatusData,
    ) -> GatewayResult<()> {
        self.send(Event::status(session_id, client_id, data)).await
    }

    async fn send_connection(
        &self,
        session_id: &str,
        client_id: &str,
        data: ConnectionData,
    ) -> GatewayResult<()> {
        self.send(Event::connection(session_id, client_id, data)).await
    }
}

/// Deliver `event` on a detached task. Failures are logged, never returned.
pub fn spawn_delivery(sink: Arc<dyn EventSink>, event: Event) {
    tokio::spawn(async move {
        let event_type = event.event_type.as_str();
        let session_id = event.session_id.clone();
        match sink.send(event).await {
            Ok(()) => debug!(session_id = %session_id, event_type, "event delivered"),
            Err(e) => {
                warn!(session_id = %session_id, event_type, error = %e, "event delivery failed")
            }
        }
    });
}
