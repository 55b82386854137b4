//! # Capture Pipeline
//!
//! Turns the microphone into a lazily started, cancellable stream of
//! fixed-size PCM16 mono chunks at 16kHz.
//!
//! ## Lifecycle of one capture cycle:
//! 1. `CapturePipeline::start` spawns a blocking worker; nothing touches the device before that
//! 2. The worker acquires the microphone, reads until a chunk is full, and queues it
//! 3. `CaptureSession::cancel` flips the token; the worker notices between reads,
//!    drops the microphone, and only then completes
//!
//! ## Resource Rules:
//! - At most one cycle runs per pipeline; `start` refuses while the previous
//!   worker still holds the device
//! - Acquisition failure ends the stream immediately with a typed
//!   `DeviceUnavailable` error returned from `finish`/`cancel`
//!
//! ## Thread Safety:
//! The microphone lives entirely on the worker thread. Only the provider,
//! which knows how to open one, has to be `Send + Sync`.

use crate::audio::buffer::ChunkBuffer;
use crate::audio::processor::{append_downmixed, float_to_pcm, i16_to_f32, u16_to_f32, LinearResampler};
use crate::audio::AudioChunk;
use crate::device::{DeviceManager, DeviceSelector};
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// How long the worker waits before retrying a full chunk queue.
const QUEUE_RETRY: Duration = Duration::from_millis(5);

/// An open microphone.
///
/// ## Contract:
/// `read` may block for a short while (tens of milliseconds) waiting for
/// audio. `Ok(0)` means nothing arrived in that time; the caller checks for
/// cancellation and reads again.
pub trait Microphone {
    fn read(&mut self, buf: &mut [u8]) -> AppResult<usize>;
}

/// Opens microphones on demand. Called on the capture worker thread.
pub trait MicrophoneProvider: Send + Sync {
    fn acquire(&self, sample_rate: u32) -> AppResult<Box<dyn Microphone>>;
}

/// Cooperative cancellation flag. Cancelling twice is harmless.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub chunk_bytes: usize,
    pub queue_chunks: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            chunk_bytes: 1024,
            queue_chunks: 64,
        }
    }
}

/// Factory for capture cycles over one microphone provider.
pub struct CapturePipeline {
    provider: Arc<dyn MicrophoneProvider>,
    config: CaptureConfig,
    /// Set while a worker holds (or is about to hold) the device
    busy: Arc<AtomicBool>,
}

impl CapturePipeline {
    pub fn new(provider: Arc<dyn MicrophoneProvider>, config: CaptureConfig) -> Self {
        Self {
            provider,
            config,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Start a new capture cycle.
    ///
    /// ## Errors:
    /// `DeviceUnavailable` if the previous cycle has not released the device yet.
    /// Failures to open the microphone are reported by the returned session instead.
    pub fn start(&self) -> AppResult<CaptureSession> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::DeviceUnavailable(
                "capture is already running".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(self.config.queue_chunks.max(1));
        let cancel = CancelToken::new();
        let provider = self.provider.clone();
        let config = self.config;
        let busy = BusyGuard(self.busy.clone());
        let token = cancel.clone();

        let worker = tokio::task::spawn_blocking(move || {
            let result = run_capture(provider.as_ref(), config, &token, tx);
            drop(busy);
            result
        });

        Ok(CaptureSession {
            cancel,
            chunks: Some(rx),
            worker: Some(worker),
        })
    }
}

/// Clears the busy flag once the worker is completely done with the device.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The worker loop. Returns once cancelled, once the consumer is gone, or on device failure.
fn run_capture(
    provider: &dyn MicrophoneProvider,
    config: CaptureConfig,
    cancel: &CancelToken,
    tx: mpsc::Sender<AudioChunk>,
) -> AppResult<()> {
    let mut mic = provider.acquire(config.sample_rate)?;
    debug!("Microphone acquired");

    let mut buf = vec![0u8; config.chunk_bytes];
    let mut filled = 0;
    let mut sent = 0u64;

    let result = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }

        match mic.read(&mut buf[filled..]) {
            Ok(0) => continue,
            Ok(n) => filled += n,
            Err(e) => break Err(e),
        }

        if filled < buf.len() {
            continue;
        }
        filled = 0;

        let mut chunk = AudioChunk::new(buf.clone(), config.sample_rate);
        let delivered = loop {
            match tx.try_send(chunk) {
                Ok(()) => break true,
                Err(mpsc::error::TrySendError::Closed(_)) => break false,
                Err(mpsc::error::TrySendError::Full(back)) => {
                    if cancel.is_cancelled() {
                        break false;
                    }
                    chunk = back;
                    std::thread::sleep(QUEUE_RETRY);
                }
            }
        };
        if !delivered {
            break Ok(());
        }
        sent += 1;
    };

    // The device must be released before the cycle counts as finished.
    drop(mic);
    debug!("Microphone released after {} chunks", sent);
    result
}

/// Handle to one running capture cycle.
///
/// Dropping the session cancels it; use `cancel().await` when the caller
/// must know the device has been released.
pub struct CaptureSession {
    cancel: CancelToken,
    chunks: Option<mpsc::Receiver<AudioChunk>>,
    worker: Option<JoinHandle<AppResult<()>>>,
}

impl CaptureSession {
    /// The chunk stream. Can be taken once; it ends when the cycle ends.
    pub fn take_chunks(&mut self) -> Option<ReceiverStream<AudioChunk>> {
        self.chunks.take().map(ReceiverStream::new)
    }

    #[cfg(test)]
    fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stop capturing and wait until the microphone has been released.
    ///
    /// Returns the error the cycle hit before it was cancelled, if any.
    pub async fn cancel(mut self) -> AppResult<()> {
        self.cancel.cancel();
        self.chunks.take();
        self.join().await
    }

    /// Wait for the cycle to end on its own (device failure or consumer gone).
    #[cfg(test)]
    async fn finish(mut self) -> AppResult<()> {
        self.join().await
    }

    async fn join(&mut self) -> AppResult<()> {
        match self.worker.take() {
            Some(worker) => worker
                .await
                .map_err(|e| AppError::DeviceUnavailable(format!("capture worker failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens the system microphone through cpal.
pub struct CpalMicrophoneProvider {
    selector: DeviceSelector,
    chunk_bytes: usize,
}

impl CpalMicrophoneProvider {
    pub fn new(selector: DeviceSelector, chunk_bytes: usize) -> Self {
        Self { selector, chunk_bytes }
    }
}

impl MicrophoneProvider for CpalMicrophoneProvider {
    fn acquire(&self, sample_rate: u32) -> AppResult<Box<dyn Microphone>> {
        let device = DeviceManager::input_device(&self.selector)?;
        let supported = DeviceManager::input_config(&device, sample_rate)?;
        let format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let device_rate = config.sample_rate.0;
        let channels = usize::from(config.channels.max(1));

        info!(
            "Capture config: format={:?} sample_rate={}Hz channels={}",
            format, device_rate, channels
        );

        let (sender, receiver) = bounded::<Vec<f32>>(64);
        let failure = Arc::new(Mutex::new(None));

        let stream = match format {
            SampleFormat::F32 => build_input::<f32>(&device, &config, channels, sender, failure.clone(), |s| s)?,
            SampleFormat::I16 => build_input::<i16>(&device, &config, channels, sender, failure.clone(), i16_to_f32)?,
            SampleFormat::U16 => build_input::<u16>(&device, &config, channels, sender, failure.clone(), u16_to_f32)?,
            other => {
                return Err(AppError::DeviceUnavailable(format!(
                    "unsupported sample format: {:?}",
                    other
                )))
            }
        };
        stream.play()?;

        Ok(Box::new(CpalMicrophone {
            _stream: stream,
            frames: receiver,
            failure,
            resampler: LinearResampler::new(device_rate, sample_rate),
            pending: ChunkBuffer::new(self.chunk_bytes),
            scratch: Vec::new(),
        }))
    }
}

fn build_input<T: SizedSample + Send + 'static>(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    sender: Sender<Vec<f32>>,
    failure: Arc<Mutex<Option<String>>>,
    convert: fn(T) -> f32,
) -> AppResult<cpal::Stream> {
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _| {
            let mut frame = Vec::with_capacity(data.len() / channels);
            append_downmixed(&mut frame, data, channels, convert);
            // a full queue means the reader is behind; dropping beats blocking the audio thread
            let _ = sender.try_send(frame);
        },
        move |err| {
            warn!("Input stream error: {}", err);
            *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
        },
        None,
    )?;
    Ok(stream)
}

/// Live cpal input stream. Dropping it stops the stream and releases the device.
struct CpalMicrophone {
    _stream: cpal::Stream,
    frames: Receiver<Vec<f32>>,
    failure: Arc<Mutex<Option<String>>>,
    resampler: LinearResampler,
    pending: ChunkBuffer,
    scratch: Vec<f32>,
}

impl Microphone for CpalMicrophone {
    fn read(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        if let Some(n) = self.pending.next_chunk(buf) {
            return Ok(n);
        }
        if let Some(reason) = self.failure.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Err(AppError::DeviceUnavailable(reason));
        }

        match self.frames.recv_timeout(Duration::from_millis(20)) {
            Ok(frame) => {
                self.scratch.clear();
                self.resampler.process(&frame, &mut self.scratch);
                self.pending.push_samples(&float_to_pcm(&self.scratch));
                Ok(self.pending.next_chunk(buf).unwrap_or(0))
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => Err(AppError::DeviceUnavailable(
                "input stream closed".to_string(),
            )),
        }
    }
}
