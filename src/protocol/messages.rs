//! # Protocol Message Types
//!
//! Serde definitions for the frames exchanged over the streaming socket.
//!
//! ## Outbound (client → server):
//! ```json
//! {"setup": {"model": "...", "generation_config": {...}}}
//! {"realtime_input": {"media_chunks": [{"mime_type": "audio/pcm", "data": "<base64>"}]}}
//! {"client_content": {"turns": [{"role": "user", "parts": [...]}], "turn_complete": true}}
//! ```
//!
//! ## Inbound (server → client):
//! ```json
//! {"server_content": {"model_turn": {"parts": [{"inline_data": {"mime_type": "audio/pcm;rate=24000", "data": "<base64>"}}]}, "turn_complete": false}}
//! {"tool_call": {...}}
//! {"setup_complete": {}}
//! ```
//!
//! The server is known to answer in camelCase as well, so every inbound
//! field also accepts its camelCase alias. Unknown fields are ignored.

use crate::audio::AudioChunk;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame sent to the server.
///
/// ## Rust Concepts:
/// - **Externally tagged enum**: serde writes each variant as `{"<variant>": payload}`,
///   which is exactly the shape of the outbound frames
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
}

#[derive(Debug, Clone, Serialize)]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientContent {
    pub turns: Vec<Turn>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub role: String,
    pub parts: Vec<OutboundPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundPart {
    pub text: String,
}

/// A frame received from the server.
///
/// Every field is optional. A frame may carry content, a tool call, the
/// setup acknowledgement, or any combination.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerMessage {
    #[serde(alias = "serverContent")]
    pub server_content: Option<ServerContent>,
    #[serde(alias = "toolCall")]
    pub tool_call: Option<Value>,
    #[serde(alias = "setupComplete")]
    pub setup_complete: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerContent {
    #[serde(alias = "modelTurn")]
    pub model_turn: Option<ModelTurn>,
    #[serde(alias = "turnComplete")]
    pub turn_complete: bool,
    pub interrupted: bool,
}

/// Parts are kept as raw JSON so that one malformed part does not take
/// the rest of the frame down with it.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Part {
    pub text: Option<String>,
    #[serde(alias = "inlineData")]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
pub struct InlineData {
    #[serde(alias = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

/// Typed view of one inbound message after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Playable PCM16 mono audio
    Audio(AudioChunk),
    /// Text emitted alongside (or instead of) audio
    Text(String),
    /// Function-call request, passed through untouched
    ToolCall(Value),
    /// The model finished its turn
    TurnComplete,
    /// The server acknowledged the setup handshake
    SetupComplete,
    /// The server cut its own reply short
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_frame_shape() {
        let frame = ClientMessage::Setup(Setup {
            model: "models/test".to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: "Puck".to_string(),
                        },
                    },
                },
            },
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["setup"]["model"], "models/test");
        assert_eq!(
            json["setup"]["generation_config"]["speech_config"]["voice_config"]["prebuilt_voice_config"]["voice_name"],
            "Puck"
        );
    }

    #[test]
    fn test_server_message_accepts_camel_case() {
        let text = r#"{"serverContent": {"turnComplete": true}, "setupComplete": {}}"#;
        let message: ServerMessage = serde_json::from_str(text).unwrap();
        assert!(message.server_content.unwrap().turn_complete);
        assert!(message.setup_complete.is_some());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let text = r#"{"usage_metadata": {"tokens": 3}, "server_content": {"grounding": 1}}"#;
        let message: ServerMessage = serde_json::from_str(text).unwrap();
        let content = message.server_content.unwrap();
        assert!(content.model_turn.is_none());
        assert!(!content.turn_complete);
    }
}
