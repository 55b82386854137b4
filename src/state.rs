//! # Observable Session State
//!
//! Shared state that the streaming client, the session coordinator and the
//! console UI all look at. Every value here has exactly one writer:
//!
//! - **ConnectionState**: written by the streaming client on connection lifecycle events
//! - **ErrorSignal**: written by whoever detects a user-visible failure; cleared by the UI
//! - **SessionTurnState**: written only by the session coordinator
//! - **SessionMetrics**: counters bumped from every task
//!
//! ## Why watch channels:
//! `tokio::sync::watch` keeps only the latest value, which is exactly the
//! "latest wins, never queued" contract of the error signal. Observers can
//! either read the current value or `await` the next change.
//!
//! ## Arc<RwLock<T>> Pattern
//! The counters still use the classic shared-state pattern: many tasks
//! increment, the UI occasionally takes a snapshot.

use crate::audio::session::SessionTurnState;
use crate::error::{AppError, ErrorKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::watch;

/// Lifecycle of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A user-visible error. Latest wins; a new error overwrites an unacknowledged one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSignal {
    /// Monotonically increasing id, used to acknowledge exactly this error
    pub id: u64,
    pub kind: ErrorKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Counters collected across the session.
///
/// ## Why these metrics matter:
/// - **decode_errors**: malformed frames are dropped silently, so this is the only trace
/// - **chunks_dropped_while_listening**: reply audio that lost the race against the user
/// - **turn_transitions**: one per real state change, never one per chunk
#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionMetrics {
    pub frames_received: u64,
    pub decode_errors: u64,
    pub audio_chunks_received: u64,
    pub audio_chunks_sent: u64,
    pub audio_bytes_sent: u64,
    pub chunks_dropped_while_listening: u64,
    pub turn_transitions: u64,
    pub capture_cycles: u64,
}

/// The shared state handed to every component.
///
/// ## Thread Safety Pattern:
/// - watch senders are wrapped in `Arc` so clones of `AppState` share them
/// - `send_replace` never fails, even when nobody is subscribed yet
#[derive(Debug, Clone)]
pub struct AppState {
    connection: Arc<watch::Sender<ConnectionState>>,
    error: Arc<watch::Sender<Option<ErrorSignal>>>,
    turn: Arc<watch::Sender<SessionTurnState>>,
    metrics: Arc<RwLock<SessionMetrics>>,
    next_error_id: Arc<AtomicU64>,
    start_time: Instant,
}

impl AppState {
    pub fn new() -> Self {
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        let (error, _) = watch::channel(None);
        let (turn, _) = watch::channel(SessionTurnState::Idle);
        Self {
            connection: Arc::new(connection),
            error: Arc::new(error),
            turn: Arc::new(turn),
            metrics: Arc::new(RwLock::new(SessionMetrics::default())),
            next_error_id: Arc::new(AtomicU64::new(1)),
            start_time: Instant::now(),
        }
    }

    // ---- connection ----

    pub fn connection(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn set_connection(&self, state: ConnectionState) {
        self.connection.send_replace(state);
    }

    /// Record a connection-lifecycle failure.
    ///
    /// ## Ordering:
    /// The connection is marked `Disconnected` before the error becomes
    /// visible, so an observer that sees the error never also sees `Connected`.
    pub fn publish_failure(&self, err: &AppError) {
        self.connection.send_replace(ConnectionState::Disconnected);
        self.raise_error(err);
    }

    // ---- error signal ----

    pub fn error(&self) -> Option<ErrorSignal> {
        self.error.borrow().clone()
    }

    pub fn watch_error(&self) -> watch::Receiver<Option<ErrorSignal>> {
        self.error.subscribe()
    }

    /// Publish a user-visible error, replacing any unacknowledged one.
    pub fn raise_error(&self, err: &AppError) -> ErrorSignal {
        let signal = ErrorSignal {
            id: self.next_error_id.fetch_add(1, Ordering::SeqCst),
            kind: err.kind(),
            message: err.user_message(),
            raised_at: Utc::now(),
        };
        self.error.send_replace(Some(signal.clone()));
        signal
    }

    /// Acknowledge the error with `id`. A newer error is left in place.
    ///
    /// Returns true when the signal was cleared.
    pub fn acknowledge_error(&self, id: u64) -> bool {
        self.error.send_if_modified(|current| match current {
            Some(signal) if signal.id == id => {
                *current = None;
                true
            }
            _ => false,
        })
    }

    pub fn clear_error(&self) {
        self.error.send_replace(None);
    }

    // ---- turn state ----

    pub fn turn(&self) -> SessionTurnState {
        *self.turn.borrow()
    }

    pub fn watch_turn(&self) -> watch::Receiver<SessionTurnState> {
        self.turn.subscribe()
    }

    /// Only the session coordinator calls this.
    pub(crate) fn set_turn(&self, state: SessionTurnState) {
        self.turn.send_replace(state);
    }

    // ---- metrics ----

    /// Apply an update to the counters.
    ///
    /// A poisoned lock only means another thread panicked mid-increment;
    /// the counters are still usable, so the guard is recovered.
    pub fn record<F: FnOnce(&mut SessionMetrics)>(&self, update: F) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }

    pub fn metrics_snapshot(&self) -> SessionMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_marks_disconnected_before_error() {
        let state = AppState::new();
        state.set_connection(ConnectionState::Connected);

        let mut errors = state.watch_error();
        state.publish_failure(&AppError::RateLimit("quota".to_string()));

        assert!(errors.has_changed().unwrap());
        assert_eq!(state.connection(), ConnectionState::Disconnected);
        let signal = state.error().unwrap();
        assert_eq!(signal.kind, ErrorKind::RateLimit);
    }

    #[test]
    fn test_latest_error_wins() {
        let state = AppState::new();
        let first = state.raise_error(&AppError::Connect("refused".to_string()));
        let second = state.raise_error(&AppError::Disconnected("bye".to_string()));

        assert!(second.id > first.id);
        assert_eq!(state.error().unwrap().message, "Disconnected: bye");
    }

    #[test]
    fn test_acknowledging_stale_error_keeps_newer_one() {
        let state = AppState::new();
        let first = state.raise_error(&AppError::Connect("refused".to_string()));
        let second = state.raise_error(&AppError::Disconnected("bye".to_string()));

        assert!(!state.acknowledge_error(first.id));
        assert_eq!(state.error().unwrap().id, second.id);

        assert!(state.acknowledge_error(second.id));
        assert!(state.error().is_none());
        // acknowledging again is harmless and does not bring anything back
        assert!(!state.acknowledge_error(second.id));
        assert!(state.error().is_none());
    }

    #[test]
    fn test_metrics_record() {
        let state = AppState::new();
        state.record(|m| m.decode_errors += 1);
        state.record(|m| m.decode_errors += 1);
        assert_eq!(state.metrics_snapshot().decode_errors, 2);
    }
}
