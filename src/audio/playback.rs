//! Per-speaker playback
//!
//! Every remote speaker gets its own [`PlaybackChannel`]: a bounded jitter
//! buffer drained by an output sink. Channels are created lazily on the first
//! chunk from a speaker and reaped once the speaker has been silent for the
//! idle timeout. The table is guarded by a single lock so creation and
//! removal can never race.
//!
//! Opening and closing output devices blocks, so all of it happens on the
//! [`PlaybackThread`]. The network side only queues chunks for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::audio::buffer::{JitterBuffer, SharedJitterBuffer};
use crate::audio::device::{select_device, DeviceSelector, Direction};
use crate::audio::AudioFormat;
use crate::error::PlaybackError;
use crate::protocol::ParticipantId;

/// How long to wait for an output thread to report its stream is live
const DEVICE_START_TIMEOUT: Duration = Duration::from_secs(3);

/// Longest the playback thread sleeps between checks of its flags
const PLAYBACK_POLL: Duration = Duration::from_millis(50);

/// A running output that drains one speaker's buffer
pub trait OutputSink: Send {
    /// Stop output and release the device. Called exactly once per sink.
    fn stop(&mut self);
}

/// Opens output sinks for new speakers
pub trait SinkFactory: Send + Sync {
    fn open(
        &self,
        speaker: &ParticipantId,
        format: AudioFormat,
        buffer: SharedJitterBuffer,
    ) -> Result<Box<dyn OutputSink>, PlaybackError>;
}

/// What happened to an inbound chunk
#[derive(Debug)]
pub enum AudioOutcome {
    /// A new channel was opened and the chunk queued
    Created,
    /// The chunk was queued on an existing channel
    Buffered,
    /// A new channel was registered but its output failed to open.
    /// It stays silent until reaped.
    Unavailable(PlaybackError),
    /// The speaker's channel has no output; the chunk was dropped
    Silenced,
    /// The chunk came from the local participant and was dropped
    SelfEcho,
    /// Zero-length chunk, nothing done
    Empty,
}

/// One speaker's playback state
struct PlaybackChannel {
    buffer: SharedJitterBuffer,
    sink: Option<Box<dyn OutputSink>>,
    last_activity: Instant,
}

impl PlaybackChannel {
    fn release(mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.stop();
        }
        self.buffer.clear();
    }
}

/// Routes inbound audio to per-speaker channels
pub struct PlaybackMultiplexer {
    local_id: ParticipantId,
    format: AudioFormat,
    buffer_duration: Duration,
    idle_timeout: Duration,
    factory: Arc<dyn SinkFactory>,
    channels: Mutex<HashMap<ParticipantId, PlaybackChannel>>,
}

impl PlaybackMultiplexer {
    pub fn new(
        local_id: ParticipantId,
        format: AudioFormat,
        buffer_duration: Duration,
        idle_timeout: Duration,
        factory: Arc<dyn SinkFactory>,
    ) -> Self {
        Self {
            local_id,
            format,
            buffer_duration,
            idle_timeout,
            factory,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a PCM chunk from `sender`
    pub fn on_audio(&self, sender: &ParticipantId, chunk: &[u8]) -> AudioOutcome {
        self.on_audio_at(sender, chunk, Instant::now())
    }

    /// [`Self::on_audio`] with an explicit clock
    pub fn on_audio_at(&self, sender: &ParticipantId, chunk: &[u8], now: Instant) -> AudioOutcome {
        if *sender == self.local_id {
            return AudioOutcome::SelfEcho;
        }
        if chunk.is_empty() {
            return AudioOutcome::Empty;
        }

        let mut channels = self.channels.lock();

        if let Some(channel) = channels.get_mut(sender) {
            channel.last_activity = now;
            if channel.sink.is_none() {
                return AudioOutcome::Silenced;
            }
            channel.buffer.push_pcm(chunk);
            return AudioOutcome::Buffered;
        }

        let buffer = Arc::new(JitterBuffer::for_duration(self.format, self.buffer_duration));
        let (sink, outcome) = match self.factory.open(sender, self.format, buffer.clone()) {
            Ok(sink) => {
                buffer.push_pcm(chunk);
                tracing::info!("Created playback for {}", sender);
                (Some(sink), AudioOutcome::Created)
            }
            Err(e) => {
                tracing::warn!("Playback unavailable for {}: {}", sender, e);
                (None, AudioOutcome::Unavailable(e))
            }
        };

        channels.insert(
            sender.clone(),
            PlaybackChannel {
                buffer,
                sink,
                last_activity: now,
            },
        );
        outcome
    }

    /// Release every channel idle for longer than the timeout
    pub fn idle_reap(&self) -> Vec<ParticipantId> {
        self.reap_at(Instant::now())
    }

    /// [`Self::idle_reap`] with an explicit clock
    pub fn reap_at(&self, now: Instant) -> Vec<ParticipantId> {
        let mut channels = self.channels.lock();

        let idle: Vec<ParticipantId> = channels
            .iter()
            .filter(|(_, channel)| now.saturating_duration_since(channel.last_activity) > self.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &idle {
            if let Some(channel) = channels.remove(id) {
                channel.release();
                tracing::info!("Released playback for {} due to inactivity", id);
            }
        }
        idle
    }

    /// Release every channel. Returns how many were released.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<_> = self.channels.lock().drain().collect();
        let count = drained.len();
        for (_, channel) in drained {
            channel.release();
        }
        if count > 0 {
            tracing::debug!("Released {} playback channels", count);
        }
        count
    }

    /// Number of live channels
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Speakers with a live channel, sorted
    pub fn speakers(&self) -> Vec<ParticipantId> {
        let mut speakers: Vec<_> = self.channels.lock().keys().cloned().collect();
        speakers.sort();
        speakers
    }
}

impl Drop for PlaybackMultiplexer {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// One inbound chunk on its way to the playback thread
pub type SpeakerChunk = (ParticipantId, Bytes);

/// Reported by the playback thread
#[derive(Debug)]
pub enum PlaybackEvent {
    /// A new speaker's output opened
    Opened(ParticipantId),
    /// A new speaker's output failed to open; its channel stays silent
    Unavailable(ParticipantId, PlaybackError),
    /// A silent speaker's channel was released
    Reaped(ParticipantId),
}

pub type PlaybackListener = Arc<dyn Fn(PlaybackEvent) + Send + Sync>;

/// Bounded queue between the dispatch path and the playback thread
pub fn playback_queue(capacity: usize) -> (Sender<SpeakerChunk>, Receiver<SpeakerChunk>) {
    bounded(capacity.max(1))
}

/// Thread that owns every device operation of playback.
///
/// Routes queued chunks into the multiplexer while `call_active` is set,
/// reaps idle speakers every `reap_interval`, and releases all channels
/// whenever the call is inactive and when the thread stops.
pub struct PlaybackThread {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PlaybackThread {
    pub fn spawn(
        multiplexer: Arc<PlaybackMultiplexer>,
        inbound: Receiver<SpeakerChunk>,
        call_active: Arc<AtomicBool>,
        reap_interval: Duration,
        listener: PlaybackListener,
    ) -> Result<Self, PlaybackError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let mut next_reap = Instant::now() + reap_interval;

                while running_for_loop.load(Ordering::Relaxed) {
                    match inbound.recv_timeout(PLAYBACK_POLL) {
                        Ok((sender, chunk)) if call_active.load(Ordering::SeqCst) => {
                            match multiplexer.on_audio(&sender, &chunk) {
                                AudioOutcome::Created => listener(PlaybackEvent::Opened(sender)),
                                AudioOutcome::Unavailable(e) => {
                                    listener(PlaybackEvent::Unavailable(sender, e))
                                }
                                _ => {}
                            }
                        }
                        Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    if !call_active.load(Ordering::SeqCst) && !multiplexer.is_empty() {
                        multiplexer.stop_all();
                    }

                    let now = Instant::now();
                    if now >= next_reap {
                        for id in multiplexer.idle_reap() {
                            listener(PlaybackEvent::Reaped(id));
                        }
                        next_reap = now + reap_interval;
                    }
                }

                multiplexer.stop_all();
                tracing::debug!("Playback thread stopped");
            })
            .map_err(|e| PlaybackError::StreamError(e.to_string()))?;

        Ok(Self {
            running,
            thread_handle: Some(handle),
        })
    }

    /// Stop the thread, releasing every channel. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }
}

impl Drop for PlaybackThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens one cpal output stream per speaker on the selected device
pub struct CpalSinkFactory {
    selector: DeviceSelector,
}

impl CpalSinkFactory {
    pub fn new(selector: DeviceSelector) -> Self {
        Self { selector }
    }
}

impl SinkFactory for CpalSinkFactory {
    fn open(
        &self,
        speaker: &ParticipantId,
        format: AudioFormat,
        buffer: SharedJitterBuffer,
    ) -> Result<Box<dyn OutputSink>, PlaybackError> {
        let device = select_device(&self.selector, Direction::Output)
            .ok_or_else(|| PlaybackError::DeviceNotFound(self.selector.to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), PlaybackError>>(1);
        let label = speaker.to_string();

        let handle = thread::Builder::new()
            .name(format!("playback-{}", label))
            .spawn(move || {
                let stream = match build_output(&device, format, buffer, &label) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(PlaybackError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| PlaybackError::StreamError(e.to_string()))?;

        let mut sink = CpalOutputSink {
            running,
            thread_handle: Some(handle),
        };

        match ready_rx.recv_timeout(DEVICE_START_TIMEOUT) {
            Ok(Ok(())) => {
                tracing::debug!("Output for {} opened on {}", speaker, device_name);
                Ok(Box::new(sink))
            }
            Ok(Err(e)) => {
                sink.stop();
                Err(e)
            }
            Err(_) => {
                sink.stop();
                Err(PlaybackError::Timeout)
            }
        }
    }
}

/// Output stream thread for one speaker
struct CpalOutputSink {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl OutputSink for CpalOutputSink {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalOutputSink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build an output stream at the device's preferred config, converting the
/// speaker's PCM on the fly
fn build_output(
    device: &cpal::Device,
    format: AudioFormat,
    buffer: SharedJitterBuffer,
    label: &str,
) -> Result<cpal::Stream, PlaybackError> {
    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::StreamError(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let resampler = Resampler::new(format, config.sample_rate.0, config.channels);
    match sample_format {
        cpal::SampleFormat::F32 => stream_with::<f32>(device, &config, resampler, buffer, label),
        cpal::SampleFormat::I16 => stream_with::<i16>(device, &config, resampler, buffer, label),
        cpal::SampleFormat::U16 => stream_with::<u16>(device, &config, resampler, buffer, label),
        other => Err(PlaybackError::StreamError(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }
}

fn stream_with<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut resampler: Resampler,
    buffer: SharedJitterBuffer,
    label: &str,
) -> Result<cpal::Stream, PlaybackError>
where
    T: SizedSample + FromSample<i16>,
{
    let label = label.to_string();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                resampler.render(data, &buffer);
            },
            move |err| tracing::error!("Playback stream error for {}: {}", label, err),
            None,
        )
        .map_err(|e| PlaybackError::StreamError(e.to_string()))
}

/// Zero-order-hold rate and channel conversion from the wire format to the
/// device format
struct Resampler {
    source_rate: u64,
    device_rate: u64,
    /// Accumulated source time, in units of 1 / (source_rate * device_rate) s
    phase: u64,
    /// Current source frame
    frame: Vec<i16>,
    out_channels: usize,
}

impl Resampler {
    fn new(source: AudioFormat, device_rate: u32, device_channels: u16) -> Self {
        let device_rate = u64::from(device_rate.max(1));
        Self {
            source_rate: u64::from(source.sample_rate),
            device_rate,
            // Pull a source frame before the first output frame
            phase: device_rate,
            frame: vec![0; usize::from(source.channels.max(1))],
            out_channels: usize::from(device_channels.max(1)),
        }
    }

    fn render<T>(&mut self, out: &mut [T], buffer: &JitterBuffer)
    where
        T: SizedSample + FromSample<i16>,
    {
        let mut starved = false;
        let last_channel = self.frame.len() - 1;

        for out_frame in out.chunks_mut(self.out_channels) {
            while self.phase >= self.device_rate {
                self.phase -= self.device_rate;
                for sample in self.frame.iter_mut() {
                    *sample = match buffer.pop() {
                        Some(s) => s,
                        None => {
                            starved = true;
                            0
                        }
                    };
                }
            }
            self.phase += self.source_rate;

            for (channel, slot) in out_frame.iter_mut().enumerate() {
                *slot = T::from_sample(self.frame[channel.min(last_channel)]);
            }
        }

        if starved {
            buffer.record_underrun();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::samples_to_pcm;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    /// Sink that records how often it was stopped
    struct CountingSink {
        stopped: Arc<AtomicUsize>,
        released: bool,
    }

    impl OutputSink for CountingSink {
        fn stop(&mut self) {
            assert!(!self.released, "sink stopped twice");
            self.released = true;
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
        stopped: Arc<AtomicUsize>,
        fail: AtomicBool,
    }

    impl CountingFactory {
        fn live(&self) -> usize {
            self.opened.load(Ordering::SeqCst) - self.stopped.load(Ordering::SeqCst)
        }
    }

    impl SinkFactory for CountingFactory {
        fn open(
            &self,
            _speaker: &ParticipantId,
            _format: AudioFormat,
            _buffer: SharedJitterBuffer,
        ) -> Result<Box<dyn OutputSink>, PlaybackError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PlaybackError::DeviceNotFound("test".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSink {
                stopped: self.stopped.clone(),
                released: false,
            }))
        }
    }

    const IDLE: Duration = Duration::from_secs(30);

    fn multiplexer(factory: Arc<CountingFactory>) -> PlaybackMultiplexer {
        PlaybackMultiplexer::new(
            ParticipantId::new("me"),
            AudioFormat::speech(),
            Duration::from_millis(250),
            IDLE,
            factory,
        )
    }

    fn chunk() -> bytes::Bytes {
        samples_to_pcm(&[1, 2, 3, 4])
    }

    #[test]
    fn test_first_chunk_creates_channel() {
        let factory = Arc::new(CountingFactory::default());
        let mux = multiplexer(factory.clone());
        let a = ParticipantId::new("a");

        assert!(matches!(mux.on_audio(&a, &chunk()), AudioOutcome::Created));
        assert!(matches!(mux.on_audio(&a, &chunk()), AudioOutcome::Buffered));
        assert_eq!(mux.len(), 1);
        assert_eq!(factory.live(), 1);
    }

    #[test]
    fn test_self_echo_is_dropped() {
        let factory = Arc::new(CountingFactory::default());
        let mux = multiplexer(factory.clone());

        assert!(matches!(
            mux.on_audio(&ParticipantId::new("me"), &chunk()),
            AudioOutcome::SelfEcho
        ));
        assert!(mux.is_empty());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_chunk_is_noop() {
        let factory = Arc::new(CountingFactory::default());
        let mux = multiplexer(factory);
        assert!(matches!(mux.on_audio(&ParticipantId::new("a"), &[]), AudioOutcome::Empty));
        assert!(mux.is_empty());
    }

    #[test]
    fn test_idle_speaker_reaped_and_recreated() {
        let factory = Arc::new(CountingFactory::default());
        let mux = multiplexer(factory.clone());
        let a = ParticipantId::new("a");
        let b = ParticipantId::new("b");
        let t0 = Instant::now();

        mux.on_audio_at(&a, &chunk(), t0);
        mux.on_audio_at(&b, &chunk(), t0);
        for secs in 1..=40 {
            mux.on_audio_at(&a, &chunk(), t0 + Duration::from_secs(secs));
        }

        let reaped = mux.reap_at(t0 + Duration::from_secs(40));
        assert_eq!(reaped, vec![b.clone()]);
        assert_eq!(mux.speakers(), vec![a.clone()]);
        assert_eq!(factory.live(), 1);

        let outcome = mux.on_audio_at(&b, &chunk(), t0 + Duration::from_secs(41));
        assert!(matches!(outcome, AudioOutcome::Created));
        assert_eq!(mux.len(), 2);
        assert_eq!(factory.live(), 2);
    }

    #[test]
    fn test_channel_at_threshold_survives() {
        let factory = Arc::new(CountingFactory::default());
        let mux = multiplexer(factory);
        let a = ParticipantId::new("a");
        let t0 = Instant::now();

        mux.on_audio_at(&a, &chunk(), t0);
        assert!(mux.reap_at(t0 + IDLE).is_empty());
        assert_eq!(mux.reap_at(t0 + IDLE + Duration::from_millis(1)), vec![a]);
    }

    #[test]
    fn test_failed_output_leaves_silent_channel() {
        let factory = Arc::new(CountingFactory::default());
        factory.fail.store(true, Ordering::SeqCst);
        let mux = multiplexer(factory.clone());
        let a = ParticipantId::new("a");
        let t0 = Instant::now();

        assert!(matches!(
            mux.on_audio_at(&a, &chunk(), t0),
            AudioOutcome::Unavailable(PlaybackError::DeviceNotFound(_))
        ));
        // No retry storm while the speaker keeps talking
        factory.fail.store(false, Ordering::SeqCst);
        assert!(matches!(
            mux.on_audio_at(&a, &chunk(), t0 + Duration::from_secs(1)),
            AudioOutcome::Silenced
        ));
        assert_eq!(factory.opened.load(Ordering::SeqCst), 0);

        // Reaped normally, then retried
        mux.reap_at(t0 + Duration::from_secs(60));
        assert!(matches!(
            mux.on_audio_at(&a, &chunk(), t0 + Duration::from_secs(61)),
            AudioOutcome::Created
        ));
    }

    #[test]
    fn test_stop_all_releases_everything() {
        let factory = Arc::new(CountingFactory::default());
        let mux = multiplexer(factory.clone());
        for id in ["a", "b", "c"] {
            mux.on_audio(&ParticipantId::new(id), &chunk());
        }

        assert_eq!(mux.stop_all(), 3);
        assert!(mux.is_empty());
        assert_eq!(factory.live(), 0);
        assert_eq!(mux.stop_all(), 0);
    }

    #[test]
    fn test_concurrent_dispatch_and_reap() {
        let factory = Arc::new(CountingFactory::default());
        let mux = Arc::new(multiplexer(factory.clone()));
        let t0 = Instant::now();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let mux = mux.clone();
                thread::spawn(move || {
                    for i in 0..200u64 {
                        let id = ParticipantId::new(format!("s{}", (i + w) % 5));
                        mux.on_audio_at(&id, &chunk(), t0 + Duration::from_secs(i));
                    }
                })
            })
            .collect();
        let reaper = {
            let mux = mux.clone();
            thread::spawn(move || {
                for i in 0..200u64 {
                    mux.reap_at(t0 + Duration::from_secs(i + 31));
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reaper.join().unwrap();

        assert!(mux.len() <= 5);
        assert_eq!(factory.live(), mux.len());
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn recording_listener() -> (PlaybackListener, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = seen.clone();
        let listener: PlaybackListener = Arc::new(move |event| {
            let line = match event {
                PlaybackEvent::Opened(id) => format!("opened {}", id),
                PlaybackEvent::Unavailable(id, _) => format!("unavailable {}", id),
                PlaybackEvent::Reaped(id) => format!("reaped {}", id),
            };
            out.lock().push(line);
        });
        (listener, seen)
    }

    #[test]
    fn test_playback_thread_opens_and_reaps() {
        let factory = Arc::new(CountingFactory::default());
        let mux = Arc::new(PlaybackMultiplexer::new(
            ParticipantId::new("me"),
            AudioFormat::speech(),
            Duration::from_millis(250),
            Duration::from_millis(50),
            factory.clone(),
        ));
        let (tx, rx) = playback_queue(16);
        let (listener, seen) = recording_listener();
        let mut playback = PlaybackThread::spawn(
            mux.clone(),
            rx,
            Arc::new(AtomicBool::new(true)),
            Duration::from_millis(10),
            listener,
        )
        .unwrap();

        tx.send((ParticipantId::new("a"), chunk())).unwrap();
        assert!(wait_until(|| seen.lock().len() == 2));
        assert_eq!(*seen.lock(), vec!["opened a".to_string(), "reaped a".to_string()]);
        assert!(mux.is_empty());
        assert_eq!(factory.live(), 0);

        playback.stop();
        assert!(!playback.is_running());
    }

    #[test]
    fn test_playback_thread_releases_when_call_ends() {
        let factory = Arc::new(CountingFactory::default());
        let mux = Arc::new(multiplexer(factory.clone()));
        let (tx, rx) = playback_queue(16);
        let call_active = Arc::new(AtomicBool::new(true));
        let (listener, _) = recording_listener();
        let _playback = PlaybackThread::spawn(
            mux.clone(),
            rx,
            call_active.clone(),
            Duration::from_secs(5),
            listener,
        )
        .unwrap();

        tx.send((ParticipantId::new("a"), chunk())).unwrap();
        assert!(wait_until(|| mux.len() == 1));

        call_active.store(false, Ordering::SeqCst);
        assert!(wait_until(|| mux.is_empty()));
        assert_eq!(factory.live(), 0);

        // Audio outside a call is drained and dropped
        tx.send((ParticipantId::new("b"), chunk())).unwrap();
        assert!(wait_until(|| tx.is_empty()));
        thread::sleep(Duration::from_millis(20));
        assert!(mux.is_empty());
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_playback_thread_stop_releases_channels() {
        let factory = Arc::new(CountingFactory::default());
        let mux = Arc::new(multiplexer(factory.clone()));
        let (tx, rx) = playback_queue(16);
        let (listener, _) = recording_listener();
        let mut playback = PlaybackThread::spawn(
            mux.clone(),
            rx,
            Arc::new(AtomicBool::new(true)),
            Duration::from_secs(5),
            listener,
        )
        .unwrap();

        tx.send((ParticipantId::new("a"), chunk())).unwrap();
        tx.send((ParticipantId::new("b"), chunk())).unwrap();
        assert!(wait_until(|| mux.len() == 2));

        playback.stop();
        playback.stop();
        assert!(mux.is_empty());
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn test_resampler_holds_samples_for_higher_device_rate() {
        let buffer = JitterBuffer::new(16);
        buffer.push_pcm(&samples_to_pcm(&[10, 20]));
        let mut resampler = Resampler::new(AudioFormat::speech(), 48_000, 2);

        let mut out = [0i16; 12];
        resampler.render(&mut out, &buffer);
        assert_eq!(out, [10, 10, 10, 10, 10, 10, 20, 20, 20, 20, 20, 20]);
        assert_eq!(buffer.underrun_count(), 0);

        let mut out = [7i16; 2];
        resampler.render(&mut out, &buffer);
        assert_eq!(out, [0, 0]);
        assert_eq!(buffer.underrun_count(), 1);
    }

    #[test]
    fn test_resampler_converts_to_float() {
        let buffer = JitterBuffer::new(4);
        buffer.push_pcm(&samples_to_pcm(&[i16::MIN]));
        let mut resampler = Resampler::new(AudioFormat::speech(), 16_000, 1);

        let mut out = [1.0f32; 1];
        resampler.render(&mut out, &buffer);
        assert_eq!(out[0], -1.0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Audio(u8, u64),
        Reap(u64),
        StopAll,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            6 => (0u8..4, 0u64..120).prop_map(|(s, t)| Op::Audio(s, t)),
            3 => (0u64..120).prop_map(Op::Reap),
            1 => Just(Op::StopAll),
        ]
    }

    proptest! {
        #[test]
        fn prop_one_channel_per_speaker_and_no_leaks(ops in prop::collection::vec(op(), 1..60)) {
            let factory = Arc::new(CountingFactory::default());
            let mux = multiplexer(factory.clone());
            let t0 = Instant::now();

            for op in ops {
                match op {
                    Op::Audio(s, t) => {
                        let id = ParticipantId::new(format!("s{}", s));
                        mux.on_audio_at(&id, &chunk(), t0 + Duration::from_secs(t));
                    }
                    Op::Reap(t) => {
                        mux.reap_at(t0 + Duration::from_secs(t));
                    }
                    Op::StopAll => {
                        mux.stop_all();
                    }
                }
                prop_assert!(mux.len() <= 4);
                prop_assert_eq!(factory.live(), mux.len());
            }
        }
    }
}
