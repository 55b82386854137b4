//! # Protocol Codec
//!
//! Pure translation between structured messages and wire JSON.
//!
//! ## Decoding Policy:
//! - A frame that is not JSON at all is a `ProtocolDecode` error for that frame only
//! - Inside a valid frame, every part is decoded on its own; a bad part is
//!   reported in `DecodedFrame::errors` and the remaining parts still come through
//! - Only parts whose MIME type starts with `audio` become `InboundMessage::Audio`

use crate::audio::AudioChunk;
use crate::error::{AppError, AppResult};
use crate::protocol::messages::{
    ClientContent, ClientMessage, GenerationConfig, InboundMessage, MediaChunk, OutboundPart, Part,
    PrebuiltVoiceConfig, RealtimeInput, ServerMessage, Setup, SpeechConfig, Turn, VoiceConfig,
};
use base64::{engine::general_purpose, Engine as _};

/// MIME type attached to every outbound audio chunk.
pub const OUTBOUND_AUDIO_MIME: &str = "audio/pcm";

/// Result of decoding one inbound frame.
#[derive(Debug, Default)]
pub struct DecodedFrame {
    /// Messages in the order they appear in the frame
    pub messages: Vec<InboundMessage>,
    /// Per-part failures; the frame itself was still usable
    pub errors: Vec<AppError>,
}

/// Build the setup handshake sent right after the connection opens.
pub fn encode_setup(model: &str, voice: &str) -> AppResult<String> {
    let frame = ClientMessage::Setup(Setup {
        model: model.to_string(),
        generation_config: GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: voice.to_string(),
                    },
                },
            },
        },
    });
    Ok(serde_json::to_string(&frame)?)
}

/// Wrap raw PCM bytes into a `realtime_input` frame.
pub fn encode_audio(pcm: &[u8]) -> AppResult<String> {
    let frame = ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: vec![MediaChunk {
            mime_type: OUTBOUND_AUDIO_MIME.to_string(),
            data: general_purpose::STANDARD.encode(pcm),
        }],
    });
    Ok(serde_json::to_string(&frame)?)
}

/// Build a single-turn user text message.
pub fn encode_text_turn(text: &str, turn_complete: bool) -> AppResult<String> {
    let frame = ClientMessage::ClientContent(ClientContent {
        turns: vec![Turn {
            role: "user".to_string(),
            parts: vec![OutboundPart {
                text: text.to_string(),
            }],
        }],
        turn_complete,
    });
    Ok(serde_json::to_string(&frame)?)
}

/// Extract the `rate=` parameter from a MIME type such as `audio/pcm;rate=24000`.
pub fn sample_rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Decode one inbound text frame.
///
/// ## Parameters:
/// - **text**: the raw frame
/// - **default_rate**: sample rate assumed for audio parts whose MIME type has no `rate=`
///
/// ## Returns:
/// - **Ok(DecodedFrame)**: the frame parsed; individual parts may still have failed
/// - **Err(AppError::ProtocolDecode)**: the frame is not a JSON object at all
pub fn decode_server_message(text: &str, default_rate: u32) -> AppResult<DecodedFrame> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut frame = DecodedFrame::default();

    if message.setup_complete.is_some() {
        frame.messages.push(InboundMessage::SetupComplete);
    }

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for raw in turn.parts {
                match serde_json::from_value::<Part>(raw) {
                    Ok(part) => decode_part(part, default_rate, &mut frame),
                    Err(e) => frame.errors.push(e.into()),
                }
            }
        }
        if content.interrupted {
            frame.messages.push(InboundMessage::Interrupted);
        }
        if content.turn_complete {
            frame.messages.push(InboundMessage::TurnComplete);
        }
    }

    if let Some(call) = message.tool_call {
        frame.messages.push(InboundMessage::ToolCall(call));
    }

    Ok(frame)
}

fn decode_part(part: Part, default_rate: u32, frame: &mut DecodedFrame) {
    if let Some(text) = part.text {
        frame.messages.push(InboundMessage::Text(text));
    }

    let Some(inline) = part.inline_data else {
        return;
    };
    if !inline.mime_type.starts_with("audio") {
        return;
    }

    match general_purpose::STANDARD.decode(inline.data.as_bytes()) {
        Ok(pcm) => {
            let rate = sample_rate_from_mime(&inline.mime_type).unwrap_or(default_rate);
            frame.messages.push(InboundMessage::Audio(AudioChunk::new(pcm, rate)));
        }
        Err(e) => frame.errors.push(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::{json, Value};

    fn audio_frame(mime: &str, data: &str) -> String {
        json!({
            "server_content": {
                "model_turn": {"parts": [{"inline_data": {"mime_type": mime, "data": data}}]},
                "turn_complete": false
            }
        })
        .to_string()
    }

    #[test]
    fn test_outbound_audio_frame() {
        let encoded = encode_audio(&[1, 2, 3, 4]).unwrap();
        let json: Value = serde_json::from_str(&encoded).unwrap();
        let chunk = &json["realtime_input"]["media_chunks"][0];
        assert_eq!(chunk["mime_type"], "audio/pcm");
        assert_eq!(chunk["data"], "AQIDBA==");
    }

    /// Bytes sent out come back unchanged when the server echoes the same payload.
    #[test]
    fn test_audio_survives_the_wire() {
        let pcm: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        let encoded = encode_audio(&pcm).unwrap();
        let json: Value = serde_json::from_str(&encoded).unwrap();
        let data = json["realtime_input"]["media_chunks"][0]["data"].as_str().unwrap();

        let decoded = decode_server_message(&audio_frame("audio/pcm", data), 24000).unwrap();
        match &decoded.messages[..] {
            [InboundMessage::Audio(chunk)] => {
                assert_eq!(chunk.bytes(), &pcm[..]);
                assert_eq!(chunk.sample_rate(), 24000);
            }
            other => panic!("unexpected messages: {:?}", other),
        }
    }

    #[test]
    fn test_rate_taken_from_mime() {
        assert_eq!(sample_rate_from_mime("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(sample_rate_from_mime("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(sample_rate_from_mime("audio/pcm"), None);

        let decoded = decode_server_message(&audio_frame("audio/pcm;rate=16000", "AAA="), 24000).unwrap();
        assert!(matches!(&decoded.messages[0], InboundMessage::Audio(c) if c.sample_rate() == 16000));
    }

    #[test]
    fn test_non_audio_inline_data_is_skipped() {
        let decoded = decode_server_message(&audio_frame("image/png", "AAA="), 24000).unwrap();
        assert!(decoded.messages.is_empty());
        assert!(decoded.errors.is_empty());
    }

    #[test]
    fn test_malformed_frame_is_a_decode_error() {
        let err = decode_server_message("{\"server_content\": ", 24000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolDecode);
    }

    #[test]
    fn test_bad_part_does_not_drop_the_frame() {
        let text = json!({
            "server_content": {
                "model_turn": {"parts": [
                    {"inline_data": {"mime_type": "audio/pcm", "data": "***not base64***"}},
                    {"inline_data": {"mime_type": 7}},
                    {"text": "hello"},
                    {"inline_data": {"mime_type": "audio/pcm", "data": "AAE="}}
                ]},
                "turn_complete": true
            }
        })
        .to_string();

        let decoded = decode_server_message(&text, 24000).unwrap();
        assert_eq!(decoded.errors.len(), 2);
        assert_eq!(decoded.messages.len(), 3);
        assert_eq!(decoded.messages[0], InboundMessage::Text("hello".to_string()));
        assert!(matches!(&decoded.messages[1], InboundMessage::Audio(c) if c.bytes() == [0u8, 1]));
        assert_eq!(decoded.messages[2], InboundMessage::TurnComplete);
    }

    #[test]
    fn test_tool_call_and_setup_complete() {
        let text = r#"{"setupComplete": {}, "toolCall": {"function_calls": ["lookup"]}}"#;
        let decoded = decode_server_message(text, 24000).unwrap();
        assert_eq!(decoded.messages[0], InboundMessage::SetupComplete);
        assert!(matches!(&decoded.messages[1], InboundMessage::ToolCall(v) if v["function_calls"][0] == "lookup"));
    }

    #[test]
    fn test_text_turn_frame() {
        let encoded = encode_text_turn("hi", true).unwrap();
        let json: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["client_content"]["turns"][0]["role"], "user");
        assert_eq!(json["client_content"]["turns"][0]["parts"][0]["text"], "hi");
        assert_eq!(json["client_content"]["turn_complete"], true);
    }
}
