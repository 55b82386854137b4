//! # Wire Protocol
//!
//! JSON message schema spoken with the generative audio service.
//!
//! ## Key Components:
//! - **messages**: serde types for every frame sent or received
//! - **codec**: pure transforms between those frames and `AudioChunk`s / typed events
//!
//! Nothing in here performs I/O; the streaming client in `websocket.rs`
//! owns the socket and calls into the codec.

pub mod codec;
pub mod messages;

pub use codec::{decode_server_message, encode_audio, encode_setup, encode_text_turn};
pub use messages::InboundMessage;
