//! Protocol engine adapters.

pub mod bridge;

pub use bridge::BridgeEngine;
