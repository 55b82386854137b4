//! # Streaming Protocol Client
//!
//! Owns the one persistent WebSocket connection to the generative audio
//! service and turns it into typed events.
//!
//! ## Connection Lifecycle:
//! 1. **Connect**: `connect()` opens the socket under a bounded timeout (no-op when already connected)
//! 2. **Setup**: the setup handshake is the first frame written, before the state becomes `Connected`
//! 3. **Streaming**: a writer task drains outbound frames and sends keep-alive pings;
//!    a reader task decodes inbound frames and fans them out
//! 4. **Close**: server closes are classified into rate-limit or generic disconnect
//!    errors; `disconnect()` closes with 1000 and publishes nothing
//!
//! ## Message Flow:
//! - **Client → Server**: setup, `realtime_input` audio chunks, optional text turns
//! - **Server → Client**: audio parts on `audio_output()`, everything else on `events()`
//!
//! ## Delivery:
//! Both inbound streams are broadcast channels. A subscriber that falls behind
//! misses chunks rather than stalling the reader.
//!
//! There is no automatic reconnection. Whoever owns the client decides when
//! to call `connect()` again.

use crate::audio::session::AudioUplink;
use crate::audio::AudioChunk;
use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::protocol::{decode_server_message, encode_audio, encode_setup, encode_text_turn, InboundMessage};
use crate::state::{AppState, ConnectionState};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code the service uses for exhausted quota.
pub const QUOTA_CLOSE_CODE: u16 = 1011;

/// Reason sent when the user closes the connection.
const USER_CLOSE_REASON: &str = "User disconnected";

/// Reason carried by the error a cancelled `connect()` returns.
const CANCELLED_REASON: &str = "connection attempt cancelled";

/// How long a closing side waits for the close handshake to be flushed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

fn user_close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: USER_CLOSE_REASON.into(),
    }))
}

/// Everything the client reports besides audio.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Opened,
    Closed { code: u16, reason: String },
    Error(AppError),
    SetupComplete,
    Text(String),
    ToolCall(Value),
    TurnComplete,
    Interrupted,
}

/// Map a server-initiated close to an error.
///
/// ## Policy:
/// - code 1011, or a reason mentioning "quota" in any case → `RateLimit`
/// - anything else, including a plain 1000 → `Disconnected`
pub fn classify_close(code: u16, reason: &str) -> AppError {
    if code == QUOTA_CLOSE_CODE || reason.to_lowercase().contains("quota") {
        AppError::RateLimit(format!("{} {}", code, reason).trim().to_string())
    } else if reason.is_empty() {
        AppError::Disconnected(format!("code {}", code))
    } else {
        AppError::Disconnected(reason.to_string())
    }
}

/// Handle to the streaming connection. Cheap to clone.
#[derive(Clone)]
pub struct StreamingClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ServerConfig,
    /// Rate assumed for inbound audio whose MIME type names none
    inbound_rate: u32,
    state: AppState,
    audio_tx: broadcast::Sender<AudioChunk>,
    events_tx: broadcast::Sender<ClientEvent>,
    /// Serializes connect attempts against each other
    attempt: tokio::sync::Mutex<()>,
    /// Wakes an in-flight connect when `disconnect()` is called
    cancel: Notify,
    /// I/O tasks of the current connection
    link: tokio::sync::Mutex<Option<Link>>,
    outbound: Mutex<Outbound>,
}

/// Write side of the current connection.
///
/// `generation` changes on every connect and disconnect; reader tasks of
/// older connections compare against it and stay silent.
#[derive(Default)]
struct Outbound {
    generation: u64,
    sender: Option<mpsc::UnboundedSender<Message>>,
}

struct Link {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl StreamingClient {
    pub fn new(config: ServerConfig, inbound_rate: u32, state: AppState) -> Self {
        let capacity = config.event_buffer.max(1);
        let (audio_tx, _) = broadcast::channel(capacity);
        let (events_tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(ClientInner {
                config,
                inbound_rate,
                state,
                audio_tx,
                events_tx,
                attempt: tokio::sync::Mutex::new(()),
                cancel: Notify::new(),
                link: tokio::sync::Mutex::new(None),
                outbound: Mutex::new(Outbound::default()),
            }),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.inner.state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.connection()
    }

    /// Inbound audio, in arrival order.
    pub fn audio_output(&self) -> broadcast::Receiver<AudioChunk> {
        self.inner.audio_tx.subscribe()
    }

    /// Connection lifecycle and non-audio content.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Open the connection and send the setup handshake.
    ///
    /// A `disconnect()` issued while the attempt is in flight cancels it: the
    /// half-open socket is dropped and nothing is published.
    ///
    /// ## Returns:
    /// - **Ok(())**: connected (or already was)
    /// - **Err(AppError::Connect)**: the attempt failed; the error signal and
    ///   `ConnectionState::Disconnected` have already been published
    /// - **Err(AppError::Disconnected)**: the attempt was cancelled by `disconnect()`
    pub async fn connect(&self) -> AppResult<()> {
        let inner = &self.inner;
        let _attempt = inner.attempt.lock().await;

        let linked = inner.link.lock().await.is_some();
        if linked && inner.state.connection() == ConnectionState::Connected {
            debug!("Already connected");
            return Ok(());
        }
        if let Some(stale) = inner.link.lock().await.take() {
            stale.reader.abort();
            stale.writer.abort();
        }

        let setup = encode_setup(&inner.config.model, &inner.config.voice)?;

        // registered before the generation bump so a racing disconnect is never missed
        let cancelled = inner.cancel.notified();
        tokio::pin!(cancelled);

        let generation = {
            let mut outbound = inner.lock_outbound();
            outbound.generation += 1;
            outbound.sender = None;
            inner.state.set_connection(ConnectionState::Connecting);
            outbound.generation
        };
        info!("Connecting to {}", inner.config.redacted_url());

        let opened = tokio::select! {
            opened = inner.open(setup) => opened,
            _ = &mut cancelled => {
                info!("Connection attempt cancelled");
                return Err(AppError::Disconnected(CANCELLED_REASON.to_string()));
            }
        };

        let (mut sink, source) = match opened {
            Ok(halves) => halves,
            Err(e) => {
                let current = {
                    let outbound = inner.lock_outbound();
                    let current = outbound.generation == generation;
                    if current {
                        inner.state.publish_failure(&e);
                    }
                    current
                };
                if current {
                    error!("Connection failed: {}", e);
                    inner.emit(ClientEvent::Error(e.clone()));
                } else {
                    debug!("Superseded connection attempt failed: {}", e);
                }
                return Err(e);
            }
        };

        let mut link = inner.link.lock().await;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let superseded = {
            let mut outbound = inner.lock_outbound();
            if outbound.generation == generation {
                outbound.sender = Some(out_tx);
                inner.state.set_connection(ConnectionState::Connected);
                false
            } else {
                true
            }
        };
        if superseded {
            drop(link);
            info!("Disconnected while connecting, closing the new connection");
            let _ = timeout(CLOSE_FLUSH_TIMEOUT, sink.send(user_close_frame())).await;
            return Err(AppError::Disconnected(CANCELLED_REASON.to_string()));
        }

        info!("Connected, setup sent (model={}, voice={})", inner.config.model, inner.config.voice);
        inner.emit(ClientEvent::Opened);

        let writer = tokio::spawn(write_loop(sink, out_rx, inner.config.ping_interval()));
        let reader = tokio::spawn(read_loop(self.inner.clone(), source, generation));
        *link = Some(Link { reader, writer });
        Ok(())
    }

    /// Close the connection with a normal-closure code.
    ///
    /// The state becomes `Disconnected` immediately, an in-flight `connect()`
    /// is cancelled, and no error is published. `ClientEvent::Closed` is only
    /// emitted when a live connection was actually closed.
    pub async fn disconnect(&self) {
        let inner = &self.inner;

        let was_open = {
            let mut outbound = inner.lock_outbound();
            outbound.generation += 1;
            let sender = outbound.sender.take();
            if let Some(sender) = &sender {
                let _ = sender.send(user_close_frame());
            }
            inner.state.set_connection(ConnectionState::Disconnected);
            sender.is_some()
        };
        inner.cancel.notify_waiters();

        let old = inner.link.lock().await.take();
        if let Some(old) = old {
            old.reader.abort();
            let writer = old.writer.abort_handle();
            if timeout(CLOSE_FLUSH_TIMEOUT, old.writer).await.is_err() {
                warn!("Close frame not flushed in time");
                writer.abort();
            }
        }

        if was_open {
            info!("Disconnected");
            inner.emit(ClientEvent::Closed {
                code: u16::from(CloseCode::Normal),
                reason: USER_CLOSE_REASON.to_string(),
            });
        } else {
            debug!("Disconnect requested with no live connection");
        }
    }

    /// Send one captured chunk. Silently dropped when not connected.
    pub fn send_audio(&self, chunk: &AudioChunk) {
        let Some(sender) = self.inner.sender() else {
            debug!("Not connected, dropping {} byte chunk", chunk.len());
            return;
        };
        match encode_audio(chunk.bytes()) {
            Ok(frame) => {
                if sender.send(Message::Text(frame)).is_ok() {
                    self.inner.state.record(|m| {
                        m.audio_chunks_sent += 1;
                        m.audio_bytes_sent += chunk.len() as u64;
                    });
                }
            }
            Err(e) => warn!("Failed to encode audio chunk: {}", e),
        }
    }

    /// Send a user text turn. Silently dropped when not connected.
    pub fn send_text(&self, text: &str, turn_complete: bool) {
        let Some(sender) = self.inner.sender() else {
            debug!("Not connected, dropping text turn");
            return;
        };
        match encode_text_turn(text, turn_complete) {
            Ok(frame) => {
                let _ = sender.send(Message::Text(frame));
            }
            Err(e) => warn!("Failed to encode text turn: {}", e),
        }
    }
}

impl AudioUplink for StreamingClient {
    fn send_audio(&self, chunk: AudioChunk) {
        StreamingClient::send_audio(self, &chunk);
    }
}

impl ClientInner {
    fn lock_outbound(&self) -> std::sync::MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Message>> {
        if self.state.connection() != ConnectionState::Connected {
            return None;
        }
        self.lock_outbound().sender.clone()
    }

    fn emit(&self, event: ClientEvent) {
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }

    /// Connect under the timeout and write the setup frame.
    async fn open(&self, setup: String) -> AppResult<(SplitSink<Socket, Message>, SplitStream<Socket>)> {
        let limit = self.config.connect_timeout();
        let (socket, _response) = timeout(limit, connect_async(self.config.endpoint_url()))
            .await
            .map_err(|_| AppError::Connect(format!("timed out after {}s", limit.as_secs())))??;

        let (mut sink, source) = socket.split();
        sink.send(Message::Text(setup)).await?;
        Ok((sink, source))
    }

    /// Decode one inbound frame and fan the results out.
    fn dispatch(&self, text: &str) {
        self.state.record(|m| m.frames_received += 1);

        let frame = match decode_server_message(text, self.inbound_rate) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.state.record(|m| m.decode_errors += 1);
                return;
            }
        };

        for e in &frame.errors {
            warn!("Skipping part: {}", e);
        }
        if !frame.errors.is_empty() {
            let count = frame.errors.len() as u64;
            self.state.record(|m| m.decode_errors += count);
        }

        for message in frame.messages {
            match message {
                InboundMessage::Audio(chunk) => {
                    self.state.record(|m| m.audio_chunks_received += 1);
                    let _ = self.audio_tx.send(chunk);
                }
                InboundMessage::Text(text) => {
                    debug!("Text part: {}", text);
                    self.emit(ClientEvent::Text(text));
                }
                InboundMessage::ToolCall(call) => {
                    debug!("Tool call received");
                    self.emit(ClientEvent::ToolCall(call));
                }
                InboundMessage::TurnComplete => {
                    debug!("Model turn complete");
                    self.emit(ClientEvent::TurnComplete);
                }
                InboundMessage::SetupComplete => {
                    info!("Setup acknowledged by server");
                    self.emit(ClientEvent::SetupComplete);
                }
                InboundMessage::Interrupted => {
                    debug!("Server interrupted its reply");
                    self.emit(ClientEvent::Interrupted);
                }
            }
        }
    }

    /// Publish the end of connection `generation`, unless it was superseded.
    ///
    /// The generation check and the state update happen under the outbound
    /// lock, so a concurrent `disconnect()` either wins completely or not at all.
    fn connection_lost(&self, generation: u64, err: AppError, closed: Option<(u16, String)>) {
        {
            let mut outbound = self.lock_outbound();
            if outbound.generation != generation {
                debug!("Ignoring end of superseded connection: {}", err);
                return;
            }
            outbound.sender = None;
            self.state.publish_failure(&err);
        }

        warn!("Connection lost: {}", err);
        if let Some((code, reason)) = closed {
            self.emit(ClientEvent::Closed { code, reason });
        }
        self.emit(ClientEvent::Error(err));
    }
}

/// Drain outbound frames and keep the connection alive with pings.
async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    ping_every: Duration,
) {
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("Write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    debug!("Ping failed: {}", e);
                    break;
                }
            }
        }
    }
    // completes the close handshake, including a reply to a server close
    if let Ok(Err(e)) = timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await {
        debug!("Close not flushed: {}", e);
    }
}

/// Read until the connection ends. Reads never time out.
async fn read_loop(inner: Arc<ClientInner>, mut source: SplitStream<Socket>, generation: u64) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => inner.dispatch(&text),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => inner.dispatch(&text),
                Err(_) => {
                    warn!("Dropping non-UTF-8 binary frame");
                    inner.state.record(|m| m.decode_errors += 1);
                }
            },
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((u16::from(CloseCode::Status), String::new()));
                info!("Server closed the connection: {} {}", code, reason);
                inner.connection_lost(generation, classify_close(code, &reason), Some((code, reason)));
                finish_close(&mut source).await;
                return;
            }
            // pings are answered by tungstenite itself
            Ok(_) => {}
            Err(e) => {
                inner.connection_lost(generation, AppError::from(e), None);
                return;
            }
        }
    }
    inner.connection_lost(
        generation,
        AppError::Connect("connection closed without a close frame".to_string()),
        None,
    );
}

/// Keep reading after a server close so the queued reply gets flushed,
/// until the server drops the connection.
async fn finish_close(source: &mut SplitStream<Socket>) {
    let drain = async { while let Some(Ok(_)) = source.next().await {} };
    if timeout(CLOSE_FLUSH_TIMEOUT, drain).await.is_err() {
        debug!("Server kept the connection open after closing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::future::Future;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type ServerSocket = WebSocketStream<TcpStream>;

    /// Serve exactly one WebSocket connection on an ephemeral port.
    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let socket = accept_async(tcp).await.unwrap();
            handler(socket).await;
        });
        format!("ws://{}", addr)
    }

    fn client_for(url: String) -> StreamingClient {
        let config = ServerConfig {
            url,
            api_key: String::new(),
            model: "models/test".to_string(),
            voice: "Puck".to_string(),
            connect_timeout_secs: 5,
            ping_interval_secs: 30,
            event_buffer: 16,
        };
        StreamingClient::new(config, 24000, AppState::new())
    }

    async fn next_text(socket: &mut ServerSocket) -> Value {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("expected a text frame, got {:?}", other),
            }
        }
    }

    async fn drain(mut socket: ServerSocket) {
        while let Some(Ok(_)) = socket.next().await {}
    }

    #[test]
    fn test_close_classification() {
        assert_eq!(classify_close(1011, "").kind(), ErrorKind::RateLimit);
        assert_eq!(classify_close(1008, "Quota exceeded").kind(), ErrorKind::RateLimit);
        assert_eq!(classify_close(1000, "bye"), AppError::Disconnected("bye".to_string()));
        assert_eq!(classify_close(1006, "").kind(), ErrorKind::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_sends_setup_first_and_is_idempotent() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let url = serve_once(move |mut socket| async move {
            let setup = next_text(&mut socket).await;
            seen_tx.send(setup).unwrap();
            drain(socket).await;
        })
        .await;

        let client = client_for(url);
        let mut events = client.events();
        client.connect().await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Opened);

        // the server only accepts once, so a second real connect would fail
        client.connect().await.unwrap();

        let setup = seen_rx.recv().await.unwrap();
        assert_eq!(setup["setup"]["model"], "models/test");
        assert_eq!(setup["setup"]["generation_config"]["response_modalities"][0], "AUDIO");
    }

    #[tokio::test]
    async fn test_inbound_audio_is_broadcast_and_bad_frames_are_dropped() {
        let url = serve_once(|mut socket| async move {
            next_text(&mut socket).await;
            socket.send(Message::Text("{broken".to_string())).await.unwrap();
            let audio = r#"{"serverContent": {"modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQI="}}]}}}"#;
            socket.send(Message::Binary(audio.as_bytes().to_vec())).await.unwrap();
            drain(socket).await;
        })
        .await;

        let client = client_for(url);
        let mut audio = client.audio_output();
        client.connect().await.unwrap();

        let chunk = timeout(Duration::from_secs(5), audio.recv()).await.unwrap().unwrap();
        assert_eq!(chunk.bytes(), &[1, 2]);
        assert_eq!(chunk.sample_rate(), 24000);

        let metrics = client.state().metrics_snapshot();
        assert_eq!(metrics.decode_errors, 1);
        assert!(client.state().error().is_none());
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_quota_close_publishes_rate_limit() {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let url = serve_once(move |mut socket| async move {
            next_text(&mut socket).await;
            socket
                .close(Some(CloseFrame {
                    code: CloseCode::from(QUOTA_CLOSE_CODE),
                    reason: "resource exhausted".into(),
                }))
                .await
                .unwrap();
            let reply = socket.next().await;
            let answered = matches!(reply, Some(Ok(Message::Close(_))) | None);
            reply_tx.send((answered, format!("{:?}", reply))).unwrap();
        })
        .await;

        let client = client_for(url);
        let mut errors = client.state().watch_error();
        client.connect().await.unwrap();

        timeout(Duration::from_secs(5), errors.wait_for(|e| e.is_some()))
            .await
            .unwrap()
            .unwrap();
        let signal = client.state().error().unwrap();
        assert_eq!(signal.kind, ErrorKind::RateLimit);
        assert_eq!(signal.message, "Daily limit exceeded. Please wait or use a new key.");
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        // the client answers the close instead of resetting the connection
        let (answered, reply) = timeout(Duration::from_secs(5), reply_rx.recv()).await.unwrap().unwrap();
        assert!(answered, "server saw {}", reply);
    }

    #[tokio::test]
    async fn test_normal_server_close_is_a_disconnect_and_reported_once() {
        let url = serve_once(|mut socket| async move {
            next_text(&mut socket).await;
            socket
                .close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "bye".into(),
                }))
                .await
                .unwrap();
            drain(socket).await;
        })
        .await;

        let client = client_for(url);
        let mut events = client.events();
        client.connect().await.unwrap();

        let mut closed = Vec::new();
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap() {
                ClientEvent::Closed { code, reason } => closed.push((code, reason)),
                ClientEvent::Error(_) => break,
                _ => {}
            }
        }
        assert_eq!(closed, vec![(1000, "bye".to_string())]);

        let signal = client.state().error().unwrap();
        assert_eq!(signal.kind, ErrorKind::Disconnected);
        assert_eq!(signal.message, "Disconnected: bye");
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        // nothing left to close, so no second Closed event
        client.disconnect().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transport_failure_publishes_connect_error() {
        let url = serve_once(|mut socket| async move {
            next_text(&mut socket).await;
            // no close frame, the TCP connection just goes away
            drop(socket);
        })
        .await;

        let client = client_for(url);
        let mut errors = client.state().watch_error();
        client.connect().await.unwrap();

        timeout(Duration::from_secs(5), errors.wait_for(|e| e.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.state().error().unwrap().kind, ErrorKind::Connect);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_a_pending_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept the TCP connection but never answer the WebSocket handshake
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(tcp);
        });

        let client = client_for(format!("ws://{}", addr));
        let mut events = client.events();
        let mut connection = client.state().watch_connection();
        let attempt = tokio::spawn({
            let client = client.clone();
            async move { client.connect().await }
        });
        timeout(Duration::from_secs(5), connection.wait_for(|c| *c == ConnectionState::Connecting))
            .await
            .unwrap()
            .unwrap();

        let started = Instant::now();
        client.disconnect().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        let result = timeout(Duration::from_secs(1), attempt).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Disconnected);
        assert!(client.state().error().is_none());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_text_frames() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let url = serve_once(move |mut socket| async move {
            next_text(&mut socket).await;
            let frame = next_text(&mut socket).await;
            seen_tx.send(frame).unwrap();
            drain(socket).await;
        })
        .await;

        let client = client_for(url);
        client.connect().await.unwrap();
        client.send_text("hello", true);

        let frame = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
        let turn = &frame["client_content"]["turns"][0];
        assert_eq!(turn["role"], "user");
        assert_eq!(turn["parts"][0]["text"], "hello");
        assert_eq!(frame["client_content"]["turn_complete"], true);
    }

    #[tokio::test]
    async fn test_user_disconnect_is_normal_and_silent() {
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();
        let url = serve_once(move |mut socket| async move {
            next_text(&mut socket).await;
            while let Some(Ok(message)) = socket.next().await {
                if let Message::Close(frame) = message {
                    let frame = frame.unwrap();
                    close_tx.send((u16::from(frame.code), frame.reason.to_string())).unwrap();
                    break;
                }
            }
        })
        .await;

        let client = client_for(url);
        client.connect().await.unwrap();
        client.disconnect().await;
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        let (code, reason) = timeout(Duration::from_secs(5), close_rx.recv()).await.unwrap().unwrap();
        assert_eq!(code, 1000);
        assert_eq!(reason, "User disconnected");

        // give the aborted reader a chance to misbehave
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.state().error().is_none());

        // sending after disconnect is a silent no-op
        client.send_audio(&AudioChunk::new(vec![0; 4], 16000));
        assert_eq!(client.state().metrics_snapshot().audio_chunks_sent, 0);
    }

    #[tokio::test]
    async fn test_send_audio_frames() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let url = serve_once(move |mut socket| async move {
            next_text(&mut socket).await;
            let frame = next_text(&mut socket).await;
            seen_tx.send(frame).unwrap();
            drain(socket).await;
        })
        .await;

        let client = client_for(url);
        client.connect().await.unwrap();
        client.send_audio(&AudioChunk::new(vec![1, 2, 3, 4], 16000));

        let frame = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
        let chunk = &frame["realtime_input"]["media_chunks"][0];
        assert_eq!(chunk["mime_type"], "audio/pcm");
        assert_eq!(chunk["data"], "AQIDBA==");
        assert_eq!(client.state().metrics_snapshot().audio_bytes_sent, 4);
    }

    #[tokio::test]
    async fn test_connect_failure_publishes_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(format!("ws://{}", addr));
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connect);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(client.state().error().unwrap().kind, ErrorKind::Connect);
    }
}
