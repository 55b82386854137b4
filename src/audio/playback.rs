//! # Playback Pipeline
//!
//! Renders inbound PCM16 mono chunks (24kHz) without gaps and can drop
//! everything still queued the moment the user starts talking.
//!
//! ## How it works:
//! - Every chunk is wrapped into a self-contained WAV container (see `wav.rs`)
//!   and handed to the player, which appends it to a continuous play queue
//! - The player lives on a dedicated thread and is driven by a command channel,
//!   so enqueue order is exactly arrival order
//! - `interrupt` goes through the same channel: every chunk enqueued before it
//!   is cleared, and it only returns once the player's queue is empty
//!
//! ## Usage Example:
//! ```ignore
//! let playback = PlaybackPipeline::start(provider).await?;
//! playback.enqueue(chunk);         // fire-and-forget
//! playback.interrupt().await?;     // nothing queued so far will be heard
//! playback.shutdown().await;       // player released
//! ```

use crate::audio::processor::{pcm_to_float, LinearResampler};
use crate::audio::wav::wrap_pcm;
use crate::audio::AudioChunk;
use crate::device::{DeviceManager, DeviceSelector};
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// An acquired audio output.
///
/// `enqueue` receives one complete WAV container per call and must start
/// playing it as soon as everything queued before it has finished.
pub trait Player {
    fn enqueue(&mut self, container: Vec<u8>) -> AppResult<()>;
    /// Stop immediately and forget everything queued.
    fn clear(&mut self) -> AppResult<()>;
}

/// Opens the audio output. Called on the playback thread.
pub trait PlayerProvider: Send + Sync {
    fn acquire(&self) -> AppResult<Box<dyn Player>>;
}

enum PlaybackCommand {
    Enqueue(AudioChunk),
    Interrupt(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the playback thread.
pub struct PlaybackPipeline {
    commands: mpsc::UnboundedSender<PlaybackCommand>,
}

impl PlaybackPipeline {
    /// Spawn the playback thread and acquire the player on it.
    ///
    /// ## Errors:
    /// `DeviceUnavailable` when the player cannot be acquired; no thread is left behind.
    pub async fn start(provider: Arc<dyn PlayerProvider>) -> AppResult<Self> {
        let (commands, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || match provider.acquire() {
                Ok(player) => {
                    let _ = ready_tx.send(Ok(()));
                    run_player(player, rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AppError::DeviceUnavailable(format!("cannot spawn playback thread: {}", e)))?;

        ready_rx.await.map_err(|_| {
            AppError::DeviceUnavailable("playback thread exited during startup".to_string())
        })??;

        info!("Playback pipeline ready");
        Ok(Self { commands })
    }

    /// Queue a chunk for playback. Never blocks; empty chunks are ignored.
    pub fn enqueue(&self, chunk: AudioChunk) {
        if chunk.is_empty() {
            return;
        }
        if self.commands.send(PlaybackCommand::Enqueue(chunk)).is_err() {
            debug!("Playback stopped, dropping chunk");
        }
    }

    /// Stop playback and clear everything queued so far.
    pub async fn interrupt(&self) -> AppResult<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(PlaybackCommand::Interrupt(ack))
            .map_err(|_| AppError::DeviceUnavailable("playback stopped".to_string()))?;
        done.await
            .map_err(|_| AppError::DeviceUnavailable("playback stopped".to_string()))
    }

    /// Release the player. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(PlaybackCommand::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

fn run_player(mut player: Box<dyn Player>, mut rx: mpsc::UnboundedReceiver<PlaybackCommand>) {
    let mut queued = 0u64;
    let mut queued_ms = 0u64;
    while let Some(command) = rx.blocking_recv() {
        match command {
            PlaybackCommand::Enqueue(chunk) => {
                let container = wrap_pcm(chunk.bytes(), chunk.sample_rate());
                match player.enqueue(container) {
                    Ok(()) => {
                        queued += 1;
                        queued_ms += chunk.duration_ms();
                    }
                    Err(e) => warn!("Failed to enqueue chunk: {}", e),
                }
            }
            PlaybackCommand::Interrupt(ack) => {
                if let Err(e) = player.clear() {
                    warn!("Failed to clear playback queue: {}", e);
                }
                debug!("Playback interrupted after {} chunks ({} ms)", queued, queued_ms);
                queued = 0;
                queued_ms = 0;
                let _ = ack.send(());
            }
            PlaybackCommand::Shutdown(ack) => {
                let _ = player.clear();
                drop(player);
                let _ = ack.send(());
                return;
            }
        }
    }
    let _ = player.clear();
}

/// Samples waiting to be rendered, already at the output device rate.
///
/// Shared between the playback thread (writer) and the cpal output
/// callback (reader).
#[derive(Debug)]
pub(crate) struct PlaybackQueue {
    samples: VecDeque<f32>,
    output_rate: u32,
    resampler: LinearResampler,
    source_rate: u32,
}

impl PlaybackQueue {
    pub(crate) fn new(output_rate: u32) -> Self {
        Self {
            samples: VecDeque::new(),
            output_rate,
            resampler: LinearResampler::new(output_rate, output_rate),
            source_rate: output_rate,
        }
    }

    /// Decode one WAV container and append its samples.
    pub(crate) fn push_container(&mut self, container: &[u8]) -> AppResult<()> {
        let (header, data) = wav::read(&mut Cursor::new(container))
            .map_err(|e| AppError::ProtocolDecode(format!("unreadable WAV container: {}", e)))?;
        let pcm = data.as_sixteen().ok_or_else(|| {
            AppError::ProtocolDecode(format!("expected 16-bit PCM, got {} bits", header.bits_per_sample))
        })?;

        if header.sampling_rate != self.source_rate {
            self.source_rate = header.sampling_rate;
            self.resampler = LinearResampler::new(self.source_rate, self.output_rate);
        }

        let mut resampled = Vec::with_capacity(pcm.len());
        self.resampler.process(&pcm_to_float(pcm), &mut resampled);
        self.samples.extend(resampled);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<f32> {
        self.samples.pop_front()
    }

    pub(crate) fn clear(&mut self) {
        self.samples.clear();
        self.resampler.reset();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Opens the system audio output through cpal.
pub struct CpalPlayerProvider {
    selector: DeviceSelector,
    sample_rate: u32,
}

impl CpalPlayerProvider {
    pub fn new(selector: DeviceSelector, sample_rate: u32) -> Self {
        Self { selector, sample_rate }
    }
}

impl PlayerProvider for CpalPlayerProvider {
    fn acquire(&self) -> AppResult<Box<dyn Player>> {
        let device = DeviceManager::output_device(&self.selector)?;
        let supported = DeviceManager::output_config(&device, self.sample_rate)?;
        let format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let channels = usize::from(config.channels.max(1));

        info!(
            "Playback config: format={:?} sample_rate={}Hz channels={}",
            format, config.sample_rate.0, channels
        );

        let queue = Arc::new(Mutex::new(PlaybackQueue::new(config.sample_rate.0)));
        let stream = match format {
            SampleFormat::F32 => build_output::<f32>(&device, &config, channels, queue.clone())?,
            SampleFormat::I16 => build_output::<i16>(&device, &config, channels, queue.clone())?,
            SampleFormat::U16 => build_output::<u16>(&device, &config, channels, queue.clone())?,
            other => {
                return Err(AppError::DeviceUnavailable(format!(
                    "unsupported sample format: {:?}",
                    other
                )))
            }
        };
        stream.play()?;

        Ok(Box::new(CpalPlayer {
            _stream: stream,
            queue,
        }))
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    queue: Arc<Mutex<PlaybackQueue>>,
) -> AppResult<cpal::Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
            for frame in data.chunks_mut(channels) {
                // silence while the queue is empty
                let value = T::from_sample(queue.pop().unwrap_or(0.0));
                for slot in frame.iter_mut() {
                    *slot = value;
                }
            }
        },
        |err| warn!("Output stream error: {}", err),
        None,
    )?;
    Ok(stream)
}

/// Live cpal output stream fed from a `PlaybackQueue`.
struct CpalPlayer {
    _stream: cpal::Stream,
    queue: Arc<Mutex<PlaybackQueue>>,
}

impl Player for CpalPlayer {
    fn enqueue(&mut self, container: Vec<u8>) -> AppResult<()> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_container(&container)
    }

    fn clear(&mut self) -> AppResult<()> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }
}
