//! In-memory microphone, player and uplink used by the pipeline and
//! coordinator tests.

use crate::audio::capture::{Microphone, MicrophoneProvider};
use crate::audio::playback::{Player, PlayerProvider};
use crate::audio::session::AudioUplink;
use crate::audio::AudioChunk;
use crate::error::{AppError, AppResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Endless counting byte pattern, 300 bytes per read, one read per millisecond.
pub struct FakeMicrophone {
    next: u8,
    reads: usize,
    fail_after: Option<usize>,
    open: Arc<AtomicUsize>,
}

impl Microphone for FakeMicrophone {
    fn read(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        std::thread::sleep(Duration::from_millis(1));
        self.reads += 1;
        if self.fail_after.is_some_and(|limit| self.reads > limit) {
            return Err(AppError::DeviceUnavailable("unplugged".to_string()));
        }
        let n = buf.len().min(300);
        for slot in &mut buf[..n] {
            *slot = self.next;
            self.next = self.next.wrapping_add(1);
        }
        Ok(n)
    }
}

impl Drop for FakeMicrophone {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeMicrophoneProvider {
    /// Microphones currently held open
    pub open: Arc<AtomicUsize>,
    pub refuse: bool,
    pub fail_after: Option<usize>,
}

impl MicrophoneProvider for FakeMicrophoneProvider {
    fn acquire(&self, _sample_rate: u32) -> AppResult<Box<dyn Microphone>> {
        if self.refuse {
            return Err(AppError::DeviceUnavailable("permission denied".to_string()));
        }
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeMicrophone {
            next: 0,
            reads: 0,
            fail_after: self.fail_after,
            open: self.open.clone(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Enqueued(Vec<u8>),
    Cleared,
    Released,
}

pub struct RecordingPlayer {
    log: Arc<Mutex<Vec<PlayerEvent>>>,
}

impl Player for RecordingPlayer {
    fn enqueue(&mut self, container: Vec<u8>) -> AppResult<()> {
        self.log.lock().unwrap().push(PlayerEvent::Enqueued(container));
        Ok(())
    }

    fn clear(&mut self) -> AppResult<()> {
        self.log.lock().unwrap().push(PlayerEvent::Cleared);
        Ok(())
    }
}

impl Drop for RecordingPlayer {
    fn drop(&mut self) {
        self.log.lock().unwrap().push(PlayerEvent::Released);
    }
}

#[derive(Default)]
pub struct RecordingPlayerProvider {
    pub log: Arc<Mutex<Vec<PlayerEvent>>>,
    pub refuse: bool,
}

impl RecordingPlayerProvider {
    /// PCM payloads enqueued so far, WAV header stripped.
    pub fn played(log: &Mutex<Vec<PlayerEvent>>) -> Vec<Vec<u8>> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                PlayerEvent::Enqueued(container) => Some(container[44..].to_vec()),
                _ => None,
            })
            .collect()
    }
}

impl PlayerProvider for RecordingPlayerProvider {
    fn acquire(&self) -> AppResult<Box<dyn Player>> {
        if self.refuse {
            return Err(AppError::DeviceUnavailable("no output".to_string()));
        }
        Ok(Box::new(RecordingPlayer { log: self.log.clone() }))
    }
}

/// Uplink that keeps every chunk it is given.
#[derive(Default)]
pub struct RecordingUplink {
    pub sent: Mutex<Vec<AudioChunk>>,
}

impl RecordingUplink {
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl AudioUplink for RecordingUplink {
    fn send_audio(&self, chunk: AudioChunk) {
        self.sent.lock().unwrap().push(chunk);
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
