//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - A configuration file (voice_duplex.toml, or any other format the `config` crate detects)
//! - Environment variables (with APP_ prefix, nested fields separated by `__`)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY` (special case for the API key)
//! 2. Environment variables (APP_SERVER__VOICE, APP_AUDIO__CAPTURE_CHUNK_BYTES, etc.)
//! 3. Configuration file (voice_duplex.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The connection and the audio devices are tuned independently, so each
/// gets its own group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
}

/// Streaming connection settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the generative audio service (`ws://` or `wss://`)
/// - `api_key`: appended to the URL as `?key=...` when not empty
/// - `model`: model named in the setup handshake
/// - `voice`: prebuilt synthesized voice requested in the setup handshake
/// - `connect_timeout_secs`: upper bound for the connect attempt
/// - `ping_interval_secs`: keep-alive ping period (reads never time out)
/// - `event_buffer`: capacity of the inbound audio/event broadcast streams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub connect_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub event_buffer: usize,
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `capture_sample_rate`: rate of outbound PCM16 mono chunks (16 kHz)
/// - `playback_sample_rate`: rate assumed for inbound PCM16 mono audio when the MIME type omits it (24 kHz)
/// - `capture_chunk_bytes`: fixed size of every captured chunk; small values bound latency
/// - `capture_queue_chunks`: how many captured chunks may wait for the uplink
/// - `input_device` / `output_device`: device names, empty for the system default
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub capture_chunk_bytes: usize,
    pub capture_queue_chunks: usize,
    pub input_device: String,
    pub output_device: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent".to_string(),
                api_key: String::new(),
                model: "models/gemini-2.0-flash-exp".to_string(),
                voice: "Puck".to_string(),
                connect_timeout_secs: 15,
                ping_interval_secs: 30,
                event_buffer: 256,
            },
            audio: AudioConfig {
                capture_sample_rate: 16000,   // outbound audio
                playback_sample_rate: 24000,  // synthesized audio
                capture_chunk_bytes: 1024,    // 512 samples, 32ms at 16kHz
                capture_queue_chunks: 64,
                input_device: String::new(),
                output_device: String::new(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from voice_duplex.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Override the API key from GEMINI_API_KEY
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__VOICE=Kore`: Override the synthesized voice
    /// - `APP_AUDIO__INPUT_DEVICE=USB Microphone`: Pick a microphone
    /// - `GEMINI_API_KEY=...`: The API key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // required(false) means "don't error if missing"
            .add_source(config::File::with_name("voice_duplex").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("server.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - The endpoint is a WebSocket URL
    /// - Sample rates, timeouts and buffer sizes are not zero
    /// - The capture chunk holds whole 16-bit samples
    pub fn validate(&self) -> Result<()> {
        if !(self.server.url.starts_with("ws://") || self.server.url.starts_with("wss://")) {
            return Err(anyhow::anyhow!("Server url must start with ws:// or wss://"));
        }

        if self.server.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.server.ping_interval_secs == 0 {
            return Err(anyhow::anyhow!("Ping interval must be greater than 0"));
        }

        if self.server.event_buffer == 0 {
            return Err(anyhow::anyhow!("Event buffer must be greater than 0"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_chunk_bytes == 0 || self.audio.capture_chunk_bytes % 2 != 0 {
            return Err(anyhow::anyhow!(
                "Capture chunk size must be a positive, even number of bytes"
            ));
        }

        if self.audio.capture_queue_chunks == 0 {
            return Err(anyhow::anyhow!("Capture queue must hold at least one chunk"));
        }

        Ok(())
    }
}

impl ServerConfig {
    /// Endpoint URL including the API key query parameter.
    pub fn endpoint_url(&self) -> String {
        if self.api_key.is_empty() {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.url, separator, self.api_key)
    }

    /// Endpoint URL safe for logs.
    pub fn redacted_url(&self) -> String {
        if self.api_key.is_empty() {
            self.url.clone()
        } else {
            self.endpoint_url().replace(&self.api_key, "***")
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}
