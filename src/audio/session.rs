//! # Duplex Session Coordinator
//!
//! Decides, at every instant, whether the microphone or the speaker owns the
//! conversation. Capture and playback are never both "live".
//!
//! ## Turn States:
//! 1. **Idle**: neither pipeline is active (initial state, and after the user stops talking)
//! 2. **Listening**: the capture pipeline streams the user's voice to the server
//! 3. **Responding**: inbound reply audio is being rendered
//!
//! ## Transitions:
//! | from                | event          | to         | effects                              |
//! |---------------------|----------------|------------|--------------------------------------|
//! | Idle / Responding   | BeginTalking   | Listening  | interrupt playback, start capture    |
//! | Listening           | StopTalking    | Idle       | stop capture                         |
//! | Idle                | AudioArrived   | Responding | forward chunk                        |
//! | Responding          | AudioArrived   | Responding | forward chunk (no transition)        |
//! | Listening           | AudioArrived   | Listening  | drop chunk                           |
//! | Listening           | CaptureEnded   | Idle       | reap capture, report its error       |
//!
//! Every other combination leaves the state alone and does nothing. There is
//! no way back from Responding except the user talking again; an inbound
//! turn-complete is reported, not acted upon.
//!
//! ## Serialization:
//! The transition table is the pure function `next_turn`. One actor task owns
//! the state and applies transitions one at a time, so "is a reply arriving"
//! is read and acted upon in the same step. User commands are polled before
//! inbound audio: when both are ready, the user wins.

use crate::audio::capture::{CaptureConfig, CapturePipeline, CaptureSession, MicrophoneProvider};
use crate::audio::playback::{PlaybackPipeline, PlayerProvider};
use crate::audio::AudioChunk;
use crate::error::AppResult;
use crate::state::AppState;
use crate::websocket::StreamingClient;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which direction currently owns the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTurnState {
    #[default]
    Idle,
    Listening,
    Responding,
}

impl SessionTurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionTurnState::Idle => "idle",
            SessionTurnState::Listening => "listening",
            SessionTurnState::Responding => "responding",
        }
    }
}

/// Inputs to the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// User gesture: start talking
    BeginTalking,
    /// User gesture: done talking
    StopTalking,
    /// User gesture: the single talk button
    ToggleTalking,
    /// One inbound audio chunk arrived
    AudioArrived,
    /// The capture cycle ended on its own (device failure)
    CaptureEnded,
}

/// Side effects the actor performs for a transition, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    InterruptPlayback,
    StartCapture,
    StopCapture,
    ForwardChunk,
    DropChunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: SessionTurnState,
    pub effects: &'static [Effect],
}

/// The transition table.
pub fn next_turn(state: SessionTurnState, event: TurnEvent) -> Transition {
    use Effect::*;
    use SessionTurnState::*;

    let stay = Transition { next: state, effects: &[] };
    let event = match (event, state) {
        (TurnEvent::ToggleTalking, Listening) => TurnEvent::StopTalking,
        (TurnEvent::ToggleTalking, _) => TurnEvent::BeginTalking,
        (event, _) => event,
    };

    match (state, event) {
        (Idle | Responding, TurnEvent::BeginTalking) => Transition {
            next: Listening,
            effects: &[InterruptPlayback, StartCapture],
        },
        (Listening, TurnEvent::StopTalking) | (Listening, TurnEvent::CaptureEnded) => Transition {
            next: Idle,
            effects: &[StopCapture],
        },
        (Idle | Responding, TurnEvent::AudioArrived) => Transition {
            next: Responding,
            effects: &[ForwardChunk],
        },
        (Listening, TurnEvent::AudioArrived) => Transition {
            next: Listening,
            effects: &[DropChunk],
        },
        _ => stay,
    }
}

/// Where captured audio goes.
pub trait AudioUplink: Send + Sync {
    /// Fire-and-forget; dropping the chunk when offline is acceptable.
    fn send_audio(&self, chunk: AudioChunk);
}

enum Command {
    Turn(TurnEvent, oneshot::Sender<SessionTurnState>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the coordinator actor.
///
/// ## Usage Example:
/// ```ignore
/// let coordinator = SessionCoordinator::start(state, capture, playback, client.audio_output(), uplink);
/// coordinator.begin_talking().await;   // Listening, microphone streaming
/// coordinator.stop_talking().await;    // Idle, microphone released
/// coordinator.shutdown().await;
/// ```
pub struct SessionCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    state: AppState,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCoordinator {
    /// Spawn the actor. `playback` is `None` when no output device could be acquired.
    pub fn start(
        state: AppState,
        capture: CapturePipeline,
        playback: Option<PlaybackPipeline>,
        audio: broadcast::Receiver<AudioChunk>,
        uplink: Arc<dyn AudioUplink>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();

        state.set_turn(SessionTurnState::Idle);
        let actor = Actor {
            state: state.clone(),
            turn: SessionTurnState::Idle,
            capture,
            active: None,
            cycles: 0,
            dropped: 0,
            playback,
            uplink,
            ended_tx,
        };
        let task = tokio::spawn(actor.run(command_rx, ended_rx, audio));

        Self {
            commands,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    pub async fn begin_talking(&self) -> SessionTurnState {
        self.send(TurnEvent::BeginTalking).await
    }

    pub async fn stop_talking(&self) -> SessionTurnState {
        self.send(TurnEvent::StopTalking).await
    }

    pub async fn toggle_talking(&self) -> SessionTurnState {
        self.send(TurnEvent::ToggleTalking).await
    }

    /// Apply a user event and return the state once it (and everything it
    /// triggered) has been handled.
    async fn send(&self, event: TurnEvent) -> SessionTurnState {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Turn(event, ack)).is_err() {
            return self.state.turn();
        }
        done.await.unwrap_or_else(|_| self.state.turn())
    }

    /// Stop both pipelines, release their devices and reset to Idle.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// The capture cycle currently owned by the actor.
struct ActiveCapture {
    cycle: u64,
    session: CaptureSession,
}

struct Actor {
    state: AppState,
    turn: SessionTurnState,
    capture: CapturePipeline,
    active: Option<ActiveCapture>,
    cycles: u64,
    /// Reply chunks dropped during the current capture cycle
    dropped: u64,
    playback: Option<PlaybackPipeline>,
    uplink: Arc<dyn AudioUplink>,
    /// Forwarders report the end of their cycle here
    ended_tx: mpsc::UnboundedSender<u64>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut ended: mpsc::UnboundedReceiver<u64>,
        audio: broadcast::Receiver<AudioChunk>,
    ) {
        let mut audio = Some(audio);
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Turn(event, ack)) => {
                        self.handle(event, None).await;
                        let _ = ack.send(self.turn);
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.teardown().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.teardown().await;
                        return;
                    }
                },

                Some(cycle) = ended.recv() => {
                    if self.active.as_ref().is_some_and(|active| active.cycle == cycle) {
                        self.handle(TurnEvent::CaptureEnded, None).await;
                    }
                }

                received = recv_audio(&mut audio) => match received {
                    Ok(chunk) => self.handle(TurnEvent::AudioArrived, Some(chunk)).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Playback fell behind, {} chunks skipped", missed);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Inbound audio stream closed");
                        audio = None;
                    }
                },
            }
        }
    }

    /// Apply `event` and any follow-up it produces.
    async fn handle(&mut self, event: TurnEvent, chunk: Option<AudioChunk>) {
        let mut pending = Some((event, chunk));
        while let Some((event, chunk)) = pending.take() {
            pending = self.apply(event, chunk).await.map(|follow_up| (follow_up, None));
        }
    }

    async fn apply(&mut self, event: TurnEvent, mut chunk: Option<AudioChunk>) -> Option<TurnEvent> {
        let transition = next_turn(self.turn, event);
        let mut follow_up = None;

        for effect in transition.effects {
            match effect {
                Effect::InterruptPlayback => {
                    if let Some(playback) = &self.playback {
                        if let Err(e) = playback.interrupt().await {
                            warn!("Could not interrupt playback: {}", e);
                        }
                    }
                }
                Effect::StartCapture => {
                    if !self.start_capture() {
                        follow_up = Some(TurnEvent::CaptureEnded);
                    }
                }
                Effect::StopCapture => self.stop_capture().await,
                Effect::ForwardChunk => match (&self.playback, chunk.take()) {
                    (Some(playback), Some(chunk)) => playback.enqueue(chunk),
                    (None, Some(_)) => debug!("No playback device, chunk discarded"),
                    _ => {}
                },
                Effect::DropChunk => {
                    if self.dropped == 0 {
                        debug!("Reply audio arrived while listening, dropping it");
                    }
                    self.dropped += 1;
                    self.state.record(|m| m.chunks_dropped_while_listening += 1);
                }
            }
        }

        if transition.next != self.turn {
            info!("Turn: {} -> {}", self.turn.as_str(), transition.next.as_str());
            self.turn = transition.next;
            self.state.set_turn(transition.next);
            self.state.record(|m| m.turn_transitions += 1);
        }
        follow_up
    }

    /// Start a capture cycle and its forwarder. Returns false if capture could not start.
    fn start_capture(&mut self) -> bool {
        let mut session = match self.capture.start() {
            Ok(session) => session,
            Err(e) => {
                warn!("Capture did not start: {}", e);
                self.state.raise_error(&e);
                return false;
            }
        };

        self.cycles += 1;
        self.dropped = 0;
        let cycle = self.cycles;
        let chunks = session.take_chunks();
        let uplink = self.uplink.clone();
        let ended = self.ended_tx.clone();

        tokio::spawn(async move {
            if let Some(mut chunks) = chunks {
                while let Some(chunk) = chunks.next().await {
                    uplink.send_audio(chunk);
                }
            }
            let _ = ended.send(cycle);
        });

        self.active = Some(ActiveCapture { cycle, session });
        self.state.record(|m| m.capture_cycles += 1);
        debug!("Capture cycle {} started", cycle);
        true
    }

    /// Cancel the active cycle and wait until the microphone is released.
    async fn stop_capture(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        if self.dropped > 0 {
            debug!("{} reply chunks dropped during capture cycle {}", self.dropped, active.cycle);
        }
        match active.session.cancel().await {
            Ok(()) => debug!("Capture cycle {} stopped", active.cycle),
            Err(e) => {
                warn!("Capture cycle {} failed: {}", active.cycle, e);
                self.state.raise_error(&e);
            }
        }
    }

    async fn teardown(&mut self) {
        self.stop_capture().await;
        if let Some(playback) = self.playback.take() {
            let _ = playback.interrupt().await;
            playback.shutdown().await;
        }
        if self.turn != SessionTurnState::Idle {
            info!("Turn: {} -> idle (session end)", self.turn.as_str());
        }
        self.turn = SessionTurnState::Idle;
        self.state.set_turn(SessionTurnState::Idle);
    }
}

async fn recv_audio(audio: &mut Option<broadcast::Receiver<AudioChunk>>) -> Result<AudioChunk, RecvError> {
    match audio {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// One user-facing session: the streaming connection plus the coordinator.
///
/// ## Lifecycle:
/// - `open` acquires the player, starts the coordinator and connects; a failed
///   connect leaves the session running so the user can `reconnect`
/// - `shutdown` stops the coordinator (releasing both devices) and closes the connection
pub struct LiveSession {
    id: Uuid,
    client: StreamingClient,
    coordinator: SessionCoordinator,
}

impl LiveSession {
    pub async fn open(
        client: StreamingClient,
        microphone: Arc<dyn MicrophoneProvider>,
        capture: CaptureConfig,
        player: Arc<dyn PlayerProvider>,
    ) -> Self {
        let id = Uuid::new_v4();
        let state = client.state().clone();
        info!(session = %id, "Opening session");

        let playback = match PlaybackPipeline::start(player).await {
            Ok(playback) => Some(playback),
            Err(e) => {
                warn!(session = %id, "Running without playback: {}", e);
                state.raise_error(&e);
                None
            }
        };

        let coordinator = SessionCoordinator::start(
            state,
            CapturePipeline::new(microphone, capture),
            playback,
            client.audio_output(),
            Arc::new(client.clone()),
        );

        if let Err(e) = client.connect().await {
            warn!(session = %id, "Session started offline: {}", e);
        }

        Self { id, client, coordinator }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client(&self) -> &StreamingClient {
        &self.client
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    /// Connect again after a failure. A no-op when still connected.
    pub async fn reconnect(&self) -> AppResult<()> {
        info!(session = %self.id, "Reconnecting");
        self.client.connect().await
    }

    pub async fn shutdown(self) {
        info!(session = %self.id, "Closing session");
        self.coordinator.shutdown().await;
        self.client.disconnect().await;
    }
}
