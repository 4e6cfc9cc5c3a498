#![deny(missing_docs)]

//! Per-application gain for a virtual output device.
//!
//! Captured audio flows from the device registration layer through a
//! lock-free [`RingBuffer`](ring::RingBuffer) to the physical output via the
//! [`PassthroughEngine`](engine::PassthroughEngine). Gains live in a volatile
//! [`GainStore`](store::GainStore) owned by the [`GainService`](service::GainService),
//! which listens on two sockets: a trusted one for the gain-setting client
//! ([`GainClient`](client::GainClient)) and a read-only one for the real-time
//! side, whose [`CacheBridge`](bridge::CacheBridge) keeps a snapshot that the
//! audio thread can read without blocking.

use std::sync::Once;

pub mod bridge;
pub mod client;
pub mod config;
/// Developer-facing terminal console.
pub mod control;
pub mod discovery;
pub mod driver;
pub mod engine;
pub mod error;
pub mod output;
pub mod protocol;
pub mod ring;
pub mod service;
pub mod store;


pub use bridge::{CacheBridge, ConnectionState};
pub use client::{GainClient, ReadOnlyClient};
pub use config::{BridgeConfig, ClientConfig, EngineConfig, ServiceConfig};
pub use engine::{EngineStatus, GainLookup, PassthroughEngine, apply_gain};
pub use error::{ClientError, EngineError, ProtocolError, ServiceError, ValidationError};
pub use ring::RingBuffer;
pub use service::{GainService, ReadCapability, ServiceHandle, WriteCapability};
pub use store::GainStore;

static TRACING_INIT: Once = Once::new();

/// Install the global `tracing` subscriber once per process.
///
/// The level comes from [`config::LOG_ENV`]. Later calls, or a subscriber
/// installed by the host, are left alone.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(config::log_level_from_env())
            .with_writer(std::io::stderr)
            .try_init();
    });
}
