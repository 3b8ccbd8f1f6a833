//! Voicebridge - speech engine bridge daemon
//!
//! This library provides the core pieces of the voicebridge daemon:
//! - A single-client WebSocket control plane (handshake and frame codec
//!   implemented from the wire up)
//! - A supervised speech-engine helper process speaking newline-delimited
//!   JSON over stdio, with restart and heartbeat policies
//! - Lock-free shared-memory audio ring buffers connecting the helper to
//!   the virtual audio device
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Control client                       │
//! │          (WebSocket, JSON text frames)                │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │                 Bridge service                        │
//! │   Session state  │  Restart policy  │  Heartbeats    │
//! └────────────────────┬─────────────────────────────────┘
//!                      │ stdio JSON lines
//! ┌────────────────────▼─────────────────────────────────┐
//! │               Speech engine helper                    │
//! │        STT / TTS  ⇄  shared-memory audio rings        │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod helper;
pub mod protocol;
pub mod ring;
pub mod transport;

pub use bridge::{BridgeService, Shutdown};
pub use config::Config;
pub use error::{Error, Result};
pub use helper::HelperProcess;
pub use protocol::{EngineMode, SessionConfig, SttSource, TtsTarget};
pub use ring::AudioRing;
pub use transport::{Opcode, WireFrame, WsConnection};
