//! Control-plane message vocabulary
//!
//! Both wire surfaces speak newline-free JSON objects tagged by a `type`
//! field: the WebSocket client sends session and speech commands, the helper
//! process exchanges engine lines over stdio. Inbound client messages are
//! validated here into typed values; outbound lines are built with
//! [`serde_json::json!`] so optional fields stay absent rather than null.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::Config;

/// Protocol version reported in the `ready` greeting
pub const PROTOCOL_VERSION: u32 = 1;

/// Stable error codes carried in `error` messages
pub mod codes {
    pub const INVALID_JSON: &str = "invalid_json";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "unknown_message_type";
    pub const SESSION_NOT_CONFIGURED: &str = "session_not_configured";
    pub const INVALID_MODE: &str = "invalid_mode";
    pub const INVALID_STT_SOURCE: &str = "invalid_stt_source";
    pub const INVALID_TTS_TARGET: &str = "invalid_tts_target";
    pub const MISSING_API_KEY: &str = "missing_api_key";
    pub const HELPER_UNAVAILABLE: &str = "helper_unavailable";
    pub const HELPER_EXITED: &str = "helper_exited";
}

/// Which speech engine backs the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Apple,
    Elevenlabs,
}

impl EngineMode {
    /// True when this mode requires an ElevenLabs API key
    #[must_use]
    pub fn needs_api_key(self) -> bool {
        matches!(self, Self::Elevenlabs)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apple => "apple",
            Self::Elevenlabs => "elevenlabs",
        }
    }
}

/// Which virtual device speech-to-text input audio is captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SttSource {
    VirtualMic,
    VirtualSpeaker,
}

/// Which virtual device synthesized audio is delivered to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsTarget {
    VirtualMic,
    VirtualSpeaker,
    Both,
}

/// Validated payload of a `configure_session` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub mode: EngineMode,
    pub stt_source: SttSource,
    pub tts_target: TtsTarget,
}

/// A rejection to report back to the client as an `error` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: &'static str,
    pub message: String,
}

impl Rejection {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl SessionConfig {
    /// Validate a raw `configure_session` payload field by field so each
    /// bad field maps to its own error code.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] naming the first invalid field.
    pub fn from_value(value: &Value) -> Result<Self, Rejection> {
        let mode = match value.get("mode") {
            Some(raw) => serde_json::from_value::<EngineMode>(raw.clone()).map_err(|_| {
                Rejection::new(codes::INVALID_MODE, format!("unsupported mode {raw}"))
            })?,
            None => return Err(Rejection::new(codes::INVALID_MODE, "missing mode field")),
        };
        let stt_source = match value.get("stt_source") {
            Some(raw) => serde_json::from_value::<SttSource>(raw.clone()).map_err(|_| {
                Rejection::new(
                    codes::INVALID_STT_SOURCE,
                    format!("unsupported stt_source {raw}"),
                )
            })?,
            None => {
                return Err(Rejection::new(
                    codes::INVALID_STT_SOURCE,
                    "missing stt_source field",
                ));
            }
        };
        let tts_target = match value.get("tts_target") {
            Some(raw) => serde_json::from_value::<TtsTarget>(raw.clone()).map_err(|_| {
                Rejection::new(
                    codes::INVALID_TTS_TARGET,
                    format!("unsupported tts_target {raw}"),
                )
            })?,
            None => {
                return Err(Rejection::new(
                    codes::INVALID_TTS_TARGET,
                    "missing tts_target field",
                ));
            }
        };
        Ok(Self {
            mode,
            stt_source,
            tts_target,
        })
    }
}

/// True for client message types relayed verbatim to the helper once the
/// session is configured
#[must_use]
pub fn is_forwarded(msg_type: &str) -> bool {
    matches!(
        msg_type,
        "tts_start" | "tts_chunk" | "tts_flush" | "tts_cancel" | "start_stt" | "stop_stt"
    )
}

/// `ready` greeting sent right after a successful upgrade
#[must_use]
pub fn ready_line() -> String {
    json!({"type": "ready", "version": PROTOCOL_VERSION}).to_string()
}

/// Acknowledgement for an applied `configure_session`
#[must_use]
pub fn session_config_applied_line(config: &SessionConfig) -> String {
    json!({"type": "session_config_applied", "mode": config.mode.as_str()}).to_string()
}

/// `error` message with a stable code and a human-readable detail
#[must_use]
pub fn error_line(code: &str, message: &str) -> String {
    json!({"type": "error", "code": code, "message": message}).to_string()
}

/// `pong` echoing the optional id of a client `ping`
#[must_use]
pub fn pong_line(id: Option<&Value>) -> String {
    match id {
        Some(id) => json!({"type": "pong", "id": id}).to_string(),
        None => json!({"type": "pong"}).to_string(),
    }
}

/// Periodic liveness line, same shape on both surfaces
#[must_use]
pub fn heartbeat_line() -> String {
    json!({"type": "heartbeat"}).to_string()
}

/// First line pushed to a freshly started helper: audio shape, ring names,
/// and per-engine settings
#[must_use]
pub fn engine_config_line(config: &Config) -> String {
    let mut elevenlabs = json!({});
    if let Some(key) = &config.elevenlabs_api_key {
        elevenlabs["api_key"] = json!(key);
    }
    let mut apple = json!({});
    if let Some(voice) = &config.apple_voice {
        apple["voice"] = json!(voice);
    }
    json!({
        "type": "engine_config",
        "audio": {
            "sample_rate_hz": config.audio.sample_rate_hz,
            "channels": config.audio.channels,
            "ring_capacity_frames": config.audio.ring_capacity_frames,
        },
        "elevenlabs": elevenlabs,
        "apple": apple,
        "rings": {
            "mic_feed": config.rings.mic_feed,
            "speaker_tap": config.rings.speaker_tap,
        },
    })
    .to_string()
}

/// Session line pushed to the helper when a session is applied or after a
/// restart
#[must_use]
pub fn session_config_line(session: &SessionConfig) -> String {
    json!({
        "type": "session_config",
        "mode": session.mode,
        "stt_source": session.stt_source,
        "tts_target": session.tts_target,
    })
    .to_string()
}
