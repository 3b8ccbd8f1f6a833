//! Configuration for the voicebridge daemon
//!
//! Defaults, then an optional TOML file, then environment overrides for
//! secrets. The engine helper receives the audio and ring sections verbatim
//! in its `engine_config` line.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Default control-plane listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8765";

/// Voicebridge daemon configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the WebSocket control listener binds to
    pub listen_addr: String,

    /// Path to the speech engine helper executable
    pub helper_path: PathBuf,

    /// Audio format shared with the helper and the virtual device
    pub audio: AudioConfig,

    /// Shared-memory ring names
    pub rings: RingConfig,

    /// Locale injected into `start_stt` when the client omits `language`
    pub default_language: String,

    /// ElevenLabs API key; `ELEVENLABS_API_KEY` overrides the file value
    pub elevenlabs_api_key: Option<String>,

    /// Apple voice identifier passed through to the helper
    pub apple_voice: Option<String>,

    /// How many unexpected helper exits are recovered before giving up
    pub restart_budget: u32,
}

/// Fixed PCM contract: interleaved f32 frames
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate_hz: u32,

    /// Channel count per frame
    pub channels: u32,

    /// Ring capacity in frames (one second at the default rate)
    pub ring_capacity_frames: u32,
}

/// Names of the two shared-memory rings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RingConfig {
    /// Ring the helper writes synthesized audio into (virtual mic feed)
    pub mic_feed: String,

    /// Ring the helper reads captured audio from (virtual speaker tap)
    pub speaker_tap: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            helper_path: PathBuf::from("voicebridge-helper"),
            audio: AudioConfig::default(),
            rings: RingConfig::default(),
            default_language: "en-US".to_string(),
            elevenlabs_api_key: None,
            apple_voice: None,
            restart_budget: 1,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 48_000,
            channels: 2,
            ring_capacity_frames: 48_000,
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            mic_feed: "/voicebridge_mic_feed".to_string(),
            speaker_tap: "/voicebridge_speaker_tap".to_string(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, optional TOML file, then env overrides
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration is invalid.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                toml::from_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides (secrets never live in the TOML file)
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ELEVENLABS_API_KEY") {
            if !key.is_empty() {
                self.elevenlabs_api_key = Some(key);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.audio.channels == 0 {
            return Err(Error::Config("audio.channels must be nonzero".to_string()));
        }
        if self.audio.ring_capacity_frames == 0 {
            return Err(Error::Config(
                "audio.ring_capacity_frames must be nonzero".to_string(),
            ));
        }
        if self.rings.mic_feed.is_empty() || self.rings.speaker_tap.is_empty() {
            return Err(Error::Config("ring names must be nonempty".to_string()));
        }
        Ok(())
    }

    /// Whether a nonempty ElevenLabs API key has been resolved
    #[must_use]
    pub fn has_elevenlabs_key(&self) -> bool {
        self.elevenlabs_api_key
            .as_deref()
            .is_some_and(|k| !k.is_empty())
    }
}
