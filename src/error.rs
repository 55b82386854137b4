//! # Error Handling
//!
//! This module defines the error taxonomy of the voice client and how each
//! error is turned into a message a person can read.
//!
//! ## Error Categories:
//! - **Connect**: the streaming connection could not be established (or failed at the transport level)
//! - **ProtocolDecode**: one inbound frame was malformed; logged and dropped, the stream stays open
//! - **RateLimit**: the server closed the connection because the quota is exhausted
//! - **Disconnected**: any other closure initiated by the server
//! - **DeviceUnavailable**: the microphone or the audio output could not be acquired
//! - **Config**: configuration file or environment variable problems
//!
//! ## Propagation:
//! Decode errors stay local to the frame that caused them. Connection-lifecycle
//! errors are published to the shared error signal (see `state.rs`) and handed
//! back to the caller, who decides whether to reconnect. Device errors abort the
//! affected pipeline only.

use serde::Serialize;
use std::fmt;
use tokio_tungstenite::tungstenite;

/// Custom error types for the application.
///
/// ## Rust Concepts:
/// - **enum**: A type that can be one of several variants
/// - **String**: Each variant holds a description of what went wrong
/// - **#[derive(Debug, Clone)]**: Errors are cloned into the error signal, so they must be `Clone`
///
/// ## Usage Example:
/// ```ignore
/// return Err(AppError::DeviceUnavailable("no input device".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Transport-level failure to establish or keep the connection
    Connect(String),

    /// Malformed or unexpected inbound frame
    ProtocolDecode(String),

    /// Server-classified quota exhaustion
    RateLimit(String),

    /// Unexpected closure other than quota exhaustion
    Disconnected(String),

    /// Microphone or player resource could not be acquired
    DeviceUnavailable(String),

    /// Configuration file or environment variable problems
    Config(String),
}

/// Machine-readable tag for an error, used by observers of the error signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connect,
    ProtocolDecode,
    RateLimit,
    Disconnected,
    DeviceUnavailable,
    Config,
}

impl AppError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Connect(_) => ErrorKind::Connect,
            AppError::ProtocolDecode(_) => ErrorKind::ProtocolDecode,
            AppError::RateLimit(_) => ErrorKind::RateLimit,
            AppError::Disconnected(_) => ErrorKind::Disconnected,
            AppError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            AppError::Config(_) => ErrorKind::Config,
        }
    }

    /// Text shown to the person using the client.
    ///
    /// ## Why separate from Display:
    /// `Display` is for logs and keeps the technical detail. The user message is
    /// what lands in the error signal, so it is phrased for a UI.
    pub fn user_message(&self) -> String {
        match self {
            AppError::RateLimit(_) => "Daily limit exceeded. Please wait or use a new key.".to_string(),
            AppError::Disconnected(reason) => format!("Disconnected: {}", reason),
            AppError::Connect(cause) => format!("Connection failed: {}", cause),
            AppError::DeviceUnavailable(cause) => format!("Audio device unavailable: {}", cause),
            AppError::ProtocolDecode(cause) => format!("Unreadable server message: {}", cause),
            AppError::Config(cause) => format!("Configuration error: {}", cause),
        }
    }
}

/// Implementation of the Display trait for AppError.
///
/// ## Trait Requirements:
/// The Display trait requires one method: `fmt`. This method writes
/// the formatted error message to a formatter.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Connect(msg) => write!(f, "Connect error: {}", msg),
            AppError::ProtocolDecode(msg) => write!(f, "Protocol decode error: {}", msg),
            AppError::RateLimit(msg) => write!(f, "Rate limit error: {}", msg),
            AppError::Disconnected(msg) => write!(f, "Disconnected: {}", msg),
            AppError::DeviceUnavailable(msg) => write!(f, "Device unavailable: {}", msg),
            AppError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// JSON that does not parse is a decode problem with that one frame.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ProtocolDecode(format!("JSON parsing error: {}", err))
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::ProtocolDecode(format!("base64 decoding error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
///
/// ## When this happens:
/// - voice_duplex.toml has invalid syntax
/// - An environment variable holds a value of the wrong type
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<tungstenite::Error> for AppError {
    fn from(err: tungstenite::Error) -> Self {
        AppError::Connect(err.to_string())
    }
}

impl From<cpal::DevicesError> for AppError {
    fn from(err: cpal::DevicesError) -> Self {
        AppError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AppError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AppError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for AppError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        AppError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for AppError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AppError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for AppError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AppError::DeviceUnavailable(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Usage Example:
/// ```ignore
/// fn open_microphone() -> AppResult<Box<dyn Microphone>> {
///     // equivalent to: Result<Box<dyn Microphone>, AppError>
/// }
/// ```
pub type AppResult<T> = Result<T, AppError>;
