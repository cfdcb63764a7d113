//! Single-slot QR handoff.
//!
//! The bootstrap listener overwrites the slot with every fresh code; HTTP
//! pollers take it with a deadline. Stale codes are never queued.

use base64::Engine as _;
use image::{ImageFormat, Luma};
use parking_lot::Mutex;
use qrcode::QrCode;
use std::io::Cursor;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use wamux_core::{GatewayError, GatewayResult};

/// Edge length of rendered QR images, in pixels.
pub const QR_IMAGE_SIZE: u32 = 256;

#[derive(Default)]
pub struct QrSlot {
    slot: Mutex<Option<String>>,
    notify: Notify,
}

impl QrSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `code`, replacing any unconsumed one. Never blocks.
    pub fn offer(&self, code: String) {
        *self.slot.lock() = Some(code);
        self.notify.notify_waiters();
    }

    /// Drop any pending code.
    pub fn clear(&self) {
        self.slot.lock().take();
    }

    /// Take the pending code, waiting up to `timeout` for one to arrive.
    pub async fn take(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an offer in between is not missed.
            notified.as_mut().enable();

            if let Some(code) = self.slot.lock().take() {
                return Some(code);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

/// Render a pairing code as a base64-encoded PNG.
pub fn render_png_base64(code: &str) -> GatewayResult<String> {
    let qr = QrCode::new(code.as_bytes())
        .map_err(|e| GatewayError::Other(format!("qr encode: {e}")))?;
    let image = qr
        .render::<Luma<u8>>()
        .min_dimensions(QR_IMAGE_SIZE, QR_IMAGE_SIZE)
        .build();

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| GatewayError::Other(format!("qr png: {e}")))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(png))
}
