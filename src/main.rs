//! # Voice Duplex - Main Application Entry Point
//!
//! A half-duplex voice client for a real-time generative audio service.
//! Press enter to start talking, press it again to hand the turn to the model.
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (file + environment variables)
//! - **state**: Observable connection, turn and error state plus session metrics
//! - **protocol**: JSON wire messages and their codec
//! - **websocket**: The streaming client (connect, send, receive, close)
//! - **audio**: Capture and playback pipelines and the session coordinator
//! - **device**: Audio device discovery and stream configuration
//! - **error**: Custom error types and user-facing messages
//!
//! ## Console Commands:
//! | input        | action                            |
//! |--------------|-----------------------------------|
//! | (empty line) | toggle talking                    |
//! | `t`          | start talking                     |
//! | `s`          | stop talking                      |
//! | `r`          | reconnect                         |
//! | `c`          | dismiss the current error         |
//! | `m`          | print session metrics             |
//! | `q`          | quit                              |
//! | anything else| sent to the model as a text turn  |

mod audio;
mod config;
mod device;
mod error;
mod protocol;
mod state;
mod websocket;

use anyhow::Result;
use audio::capture::{CaptureConfig, CpalMicrophoneProvider};
use audio::playback::CpalPlayerProvider;
use audio::session::LiveSession;
use config::AppConfig;
use device::{DeviceManager, DeviceSelector};
use state::{AppState, ConnectionState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use websocket::{ClientEvent, StreamingClient};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Opens the live session** (player, coordinator, connection)
/// 4. **Runs the console loop** until `q`, end of input, or a shutdown signal
/// 5. **Tears everything down**, releasing both audio devices and closing the connection
#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-duplex v{}", env!("CARGO_PKG_VERSION"));
    info!("Endpoint: {}", config.server.redacted_url());
    if config.server.api_key.is_empty() {
        warn!("No API key configured; set GEMINI_API_KEY or APP_SERVER__API_KEY");
    }
    log_devices();

    let state = AppState::new();
    let client = StreamingClient::new(
        config.server.clone(),
        config.audio.playback_sample_rate,
        state.clone(),
    );

    let microphone = CpalMicrophoneProvider::new(
        DeviceSelector::from(config.audio.input_device.as_str()),
        config.audio.capture_chunk_bytes,
    );
    let player = CpalPlayerProvider::new(
        DeviceSelector::from(config.audio.output_device.as_str()),
        config.audio.playback_sample_rate,
    );
    let capture = CaptureConfig {
        sample_rate: config.audio.capture_sample_rate,
        chunk_bytes: config.audio.capture_chunk_bytes,
        queue_chunks: config.audio.capture_queue_chunks,
    };

    let observer = spawn_observer(&state, &client);
    let session = LiveSession::open(client, Arc::new(microphone), capture, Arc::new(player)).await;
    info!("Session {} ready. Enter toggles talking, q quits.", session.id());

    setup_signal_handlers();

    tokio::select! {
        result = command_loop(&session) => {
            if let Err(e) = result {
                error!("Console error: {}", e);
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, closing session...");
        }
    }

    session.shutdown().await;
    observer.abort();

    let metrics = state.metrics_snapshot();
    info!(
        "Session ended after {}s: {} chunks sent, {} received, {} turn changes",
        state.uptime_seconds(),
        metrics.audio_chunks_sent,
        metrics.audio_chunks_received,
        metrics.turn_transitions
    );
    Ok(())
}

/// Read console commands until `q` or end of input.
async fn command_loop(session: &LiveSession) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let coordinator = session.coordinator();
    let state = session.client().state();

    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {
                let turn = coordinator.toggle_talking().await;
                info!("Now {}", turn.as_str());
            }
            "t" | "talk" => {
                coordinator.begin_talking().await;
            }
            "s" | "stop" => {
                coordinator.stop_talking().await;
            }
            "r" | "reconnect" => {
                if session.client().connection_state() == ConnectionState::Connected {
                    println!("Already connected");
                } else if let Err(e) = session.reconnect().await {
                    warn!("Reconnect failed: {}", e);
                }
            }
            "c" | "clear" => state.clear_error(),
            "m" | "metrics" => {
                let metrics = serde_json::to_string_pretty(&state.metrics_snapshot())?;
                println!("{}", metrics);
                if let Some(signal) = state.error() {
                    println!("Unacknowledged error: {}", signal.message);
                }
            }
            "q" | "quit" => break,
            text => session.client().send_text(text, true),
        }
    }
    Ok(())
}

/// Print connection, turn and error changes, and dismiss each error once shown.
fn spawn_observer(state: &AppState, client: &StreamingClient) -> JoinHandle<()> {
    let mut connection = state.watch_connection();
    let mut turn = state.watch_turn();
    let mut errors = state.watch_error();
    let mut events = client.events();
    let state = state.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(()) = connection.changed() => {
                    let current = *connection.borrow_and_update();
                    println!("[connection] {:?}", current);
                }
                Ok(()) = turn.changed() => {
                    let current = *turn.borrow_and_update();
                    println!("[turn] {}", current.as_str());
                }
                Ok(()) = errors.changed() => {
                    let signal = errors.borrow_and_update().clone();
                    if let Some(signal) = signal {
                        println!("[error] {}", signal.message);
                        state.acknowledge_error(signal.id);
                    }
                }
                event = events.recv() => match event {
                    Ok(ClientEvent::Text(text)) => println!("[model] {}", text),
                    Ok(ClientEvent::TurnComplete) => println!("[model] (turn complete)"),
                    Ok(ClientEvent::ToolCall(call)) => println!("[tool call] {}", call),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                else => break,
            }
        }
    })
}

fn log_devices() {
    match DeviceManager::list_input_devices() {
        Ok(names) => info!("Input devices: {:?}", names),
        Err(e) => warn!("Could not list input devices: {}", e),
    }
    match DeviceManager::list_output_devices() {
        Ok(names) => info!("Output devices: {:?}", names),
        Err(e) => warn!("Could not list output devices: {}", e),
    }
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voice_duplex=trace")
/// - If not set, defaults to "voice_duplex=debug,tokio_tungstenite=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_duplex=debug,tokio_tungstenite=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set the global shutdown flag on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
