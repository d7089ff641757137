//! Audio capture from the local input device
//!
//! The cpal stream lives on a dedicated thread for as long as capture runs.
//! Every callback buffer is copied into a fresh [`Bytes`] before it leaves
//! the callback, since the driver may reuse its buffer before an async send
//! completes. The chunk sink must not block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::bounded;

use crate::audio::buffer::samples_to_pcm;
use crate::audio::device::{select_device, DeviceSelector, Direction};
use crate::audio::AudioFormat;
use crate::error::CaptureError;

/// Receives each captured PCM chunk
pub type ChunkSink = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Receives stream errors raised after capture started
pub type CaptureErrorSink = Arc<dyn Fn(CaptureError) + Send + Sync>;

/// How long to wait for the device thread to report the stream is live
const DEVICE_START_TIMEOUT: Duration = Duration::from_secs(3);

/// Capture counters shared with the device callback
#[derive(Debug, Default)]
struct CaptureCounters {
    chunks: AtomicU64,
    bytes: AtomicU64,
}

/// Local microphone source
pub struct AudioCaptureSource {
    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Where stream errors are reported
    error_sink: Option<CaptureErrorSink>,

    counters: Arc<CaptureCounters>,

    format: Option<AudioFormat>,
}

impl AudioCaptureSource {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_sink: None,
            counters: Arc::new(CaptureCounters::default()),
            format: None,
        }
    }

    /// Report stream errors to `sink` in addition to the log
    pub fn with_error_sink(mut self, sink: CaptureErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Open the selected input device and start delivering chunks to `sink`
    pub fn start(
        &mut self,
        selector: &DeviceSelector,
        format: AudioFormat,
        sink: ChunkSink,
    ) -> Result<(), CaptureError> {
        if self.is_running() {
            return Err(CaptureError::AlreadyRunning);
        }
        // A previous stream may have died on its own; release its thread
        self.stop();

        let device = select_device(selector, Direction::Input)
            .ok_or_else(|| CaptureError::DeviceNotFound(selector.to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let (ready_tx, ready_rx) = bounded::<Result<(), CaptureError>>(1);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let running_for_errors = self.running.clone();
        let error_sink = self.error_sink.clone();
        let counters = self.counters.clone();
        let config = format.stream_config();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        deliver_chunk(data, &sink, &counters);
                    },
                    move |err| report_stream_error(err, &running_for_errors, error_sink.as_ref()),
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(cpal::BuildStreamError::StreamConfigNotSupported) => {
                        let _ = ready_tx.send(Err(CaptureError::UnsupportedFormat(format!(
                            "{} Hz / {} ch / 16-bit",
                            config.sample_rate.0, config.channels
                        ))));
                        return;
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(CaptureError::StreamError(e.to_string())));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(CaptureError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                // Stream is dropped here, stopping capture
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                CaptureError::StreamError(e.to_string())
            })?;

        self.thread_handle = Some(handle);

        match ready_rx.recv_timeout(DEVICE_START_TIMEOUT) {
            Ok(Ok(())) => {
                self.format = Some(format);
                tracing::info!(
                    "Recording started on {} ({} Hz, {} ch)",
                    device_name,
                    format.sample_rate,
                    format.channels
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(CaptureError::StreamError(format!(
                    "{} did not start within {:?}",
                    device_name, DEVICE_START_TIMEOUT
                )))
            }
        }
    }

    /// Stop capturing and release the device. Safe to call at any time.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Recording stopped");
        }
        self.format = None;
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Format of the running capture
    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    /// Chunks delivered since creation
    pub fn chunks_captured(&self) -> u64 {
        self.counters.chunks.load(Ordering::Relaxed)
    }

    /// PCM bytes delivered since creation
    pub fn bytes_captured(&self) -> u64 {
        self.counters.bytes.load(Ordering::Relaxed)
    }
}

impl Default for AudioCaptureSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioCaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Log a stream error and pass it on. A lost device ends capture, so a
/// later start can reopen it.
fn report_stream_error(
    err: cpal::StreamError,
    running: &AtomicBool,
    error_sink: Option<&CaptureErrorSink>,
) {
    let fatal = matches!(err, cpal::StreamError::DeviceNotAvailable);
    tracing::warn!("Capture stream error: {}", err);
    if fatal {
        running.store(false, Ordering::SeqCst);
    }
    if let Some(sink) = error_sink {
        sink(CaptureError::StreamError(err.to_string()));
    }
}

/// Copy one callback buffer into an owned chunk and hand it to the sink
fn deliver_chunk(data: &[i16], sink: &ChunkSink, counters: &CaptureCounters) {
    if data.is_empty() {
        return;
    }
    let chunk = samples_to_pcm(data);
    counters.chunks.fetch_add(1, Ordering::Relaxed);
    counters.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    sink(chunk);
}
