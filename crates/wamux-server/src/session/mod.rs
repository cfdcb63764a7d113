//! Session management: lifecycle, protocol event translation, QR handoff,
//! inbound media.

pub mod client;
pub mod manager;
pub mod media;
pub mod qr;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ConnectOutcome, Session, SessionContext};
pub use manager::SessionManager;
pub use media::MediaStorage;
