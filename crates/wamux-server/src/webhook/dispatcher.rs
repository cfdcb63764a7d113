//! HTTP webhook dispatcher.
//!
//! POSTs each event as JSON with `X-API-Key` and `X-Webhook-Event` headers.
//! Only the response status is inspected.

use super::EventSink;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use wamux_core::{Event, GatewayError, GatewayResult};

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "X-API-Key";
/// Header carrying the envelope `type`.
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event";

pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: Option<String>,
    api_key: Option<String>,
}

impl WebhookDispatcher {
    /// Build a dispatcher. With `url == None` every send is a silent no-op.
    pub fn new(
        url: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Delivery(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }
}

#[async_trait]
impl EventSink for WebhookDispatcher {
    async fn send(&self, event: Event) -> GatewayResult<()> {
        let Some(url) = &self.url else {
            return Ok(());
        };

        let mut request = self
            .client
            .post(url)
            .header(EVENT_TYPE_HEADER, event.event_type.as_str())
            .json(&event);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Delivery(format!("webhook returned {status}")));
        }

        debug!(url = %url, status = %status, "webhook accepted event");
        Ok(())
    }
}
