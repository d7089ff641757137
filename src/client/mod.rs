//! Relay client orchestrator
//!
//! [`RelayClient`] wires the connection, codec, capture and playback together
//! and is the only surface the UI talks to.

pub mod dispatch;
pub mod events;

pub use dispatch::{Dispatcher, OnlineSet};
pub use events::{ClientEvent, EventSink, LogNotifier, Notifier, TracingSink};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audio::capture::{CaptureErrorSink, ChunkSink};
use crate::audio::playback::{
    playback_queue, CpalSinkFactory, PlaybackEvent, PlaybackListener, PlaybackThread, SinkFactory,
    SpeakerChunk,
};
use crate::audio::{AudioCaptureSource, PlaybackMultiplexer};
use crate::codec::ProtocolCodec;
use crate::config::ClientConfig;
use crate::constants::PLAYBACK_QUEUE_CHUNKS;
use crate::error::{CaptureError, ConnectError, Error, SendError};
use crate::network::{
    run_supervisor, ConnectionManager, ConnectionState, Connector, FrameHandler, StateListener,
    WebSocketConnector,
};
use crate::protocol::{ParticipantId, SubProtocol};

/// Client lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Background work started by [`RelayClient::start`]
struct Background {
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    playback: Option<PlaybackThread>,
}

impl Background {
    /// Stop everything and wait until none of it can touch the connection
    /// or an audio device again
    async fn shutdown(self) {
        let Background {
            shutdown,
            supervisor,
            playback,
        } = self;
        let _ = shutdown.send(true);
        supervisor.abort();
        let _ = supervisor.await;
        if let Some(mut playback) = playback {
            // Joins output threads
            let _ = tokio::task::spawn_blocking(move || playback.stop()).await;
        }
    }

    /// Best-effort stop for contexts that cannot wait
    fn abort(self) {
        let _ = self.shutdown.send(true);
        self.supervisor.abort();
    }
}

/// Chat and voice client for one relay
pub struct RelayClient {
    config: ClientConfig,
    local_id: ParticipantId,
    codec: ProtocolCodec,
    connection: Arc<ConnectionManager>,
    playback: Arc<PlaybackMultiplexer>,
    /// Consumed by the playback thread while running
    playback_rx: Receiver<SpeakerChunk>,
    capture: Mutex<AudioCaptureSource>,
    online: Arc<OnlineSet>,
    call_active: Arc<AtomicBool>,
    events: Arc<dyn EventSink>,
    state: RwLock<ClientState>,
    background: Mutex<Option<Background>>,
}

impl RelayClient {
    pub fn builder(config: ClientConfig) -> RelayClientBuilder {
        RelayClientBuilder::new(config)
    }

    /// Connect to `address` and start the background loops.
    ///
    /// A refused first connect is not an error: the supervisor keeps
    /// retrying. Only an address that can never work is reported.
    pub async fn start(&self, address: &str) -> Result<(), Error> {
        {
            let mut state = self.state.write();
            if *state != ClientState::Idle {
                tracing::debug!("Client already {:?}", *state);
                return Ok(());
            }
            *state = ClientState::Starting;
        }

        self.log(format!("Connecting to {} as {}", address, self.local_id));

        let initial_failed = match self.connection.connect(address).await {
            Ok(()) => false,
            Err(ConnectError::InvalidAddress(reason)) => {
                {
                    let mut state = self.state.write();
                    if *state == ClientState::Starting {
                        *state = ClientState::Idle;
                    }
                }
                return Err(ConnectError::InvalidAddress(reason).into());
            }
            Err(e) => {
                self.log(format!("Connection failed: {}", e));
                self.connection.mark_reconnecting();
                true
            }
        };

        let mut background = Some(self.spawn_background(address, initial_failed));
        {
            let mut state = self.state.write();
            if *state == ClientState::Starting {
                *self.background.lock() = background.take();
                *state = ClientState::Running;
            }
        }

        // stop() ran while the first connect was pending
        if let Some(abandoned) = background {
            tracing::debug!("Client stopped while starting");
            abandoned.shutdown().await;
            self.connection.close().await;
        }
        Ok(())
    }

    fn spawn_background(&self, address: &str, initial_failed: bool) -> Background {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(run_supervisor(
            self.connection.clone(),
            address.to_string(),
            initial_failed,
            shutdown_rx,
        ));

        let events = self.events.clone();
        let listener: PlaybackListener = Arc::new(move |event| {
            let line = match event {
                PlaybackEvent::Opened(id) => format!("Created playback for {}", id),
                PlaybackEvent::Unavailable(id, e) => {
                    format!("Playback unavailable for {}: {}", id, e)
                }
                PlaybackEvent::Reaped(id) => {
                    format!("Released playback for {} due to inactivity.", id)
                }
            };
            events.on_event(ClientEvent::log(line));
        });
        let playback = match PlaybackThread::spawn(
            self.playback.clone(),
            self.playback_rx.clone(),
            self.call_active.clone(),
            self.config.audio.reap_interval(),
            listener,
        ) {
            Ok(playback) => Some(playback),
            Err(e) => {
                self.log(format!("Playback unavailable: {}", e));
                None
            }
        };

        Background {
            shutdown,
            supervisor,
            playback,
        }
    }

    /// Send a chat message.
    ///
    /// `SendError::NotConnected` is expected while the relay is down and is
    /// not fatal.
    pub fn send_chat(&self, text: &str) -> Result<(), SendError> {
        let frame = self.codec.encode_chat(&self.local_id, text);
        match self.connection.send(frame) {
            Ok(()) => {
                self.log(format!("Sent: {}", text));
                Ok(())
            }
            Err(e) => {
                self.log(format!("Message not sent: {}", e));
                Err(e)
            }
        }
    }

    /// Start capturing and playing call audio
    pub fn start_call(&self) -> Result<(), CaptureError> {
        let mut capture = self.capture.lock();
        if capture.is_running() {
            return Ok(());
        }

        let connection = self.connection.clone();
        let codec = self.codec;
        let sink: ChunkSink = Arc::new(move |chunk: Bytes| {
            // Runs on the capture thread; never wait on the network here
            if let Err(e) = connection.send(codec.encode_audio(chunk)) {
                tracing::trace!("Audio chunk dropped: {}", e);
            }
        });

        self.call_active.store(true, Ordering::SeqCst);
        let audio = &self.config.audio;
        match capture.start(&audio.input_device, audio.format(), sink) {
            Ok(()) => {
                self.log("Recording started");
                Ok(())
            }
            Err(e) => {
                self.call_active.store(false, Ordering::SeqCst);
                self.log(format!("Recording unavailable: {}", e));
                Err(e)
            }
        }
    }

    /// Stop capture. The playback thread releases every channel once it
    /// sees the call has ended. Idempotent.
    pub fn stop_call(&self) {
        let was_active = self.call_active.swap(false, Ordering::SeqCst);
        self.capture.lock().stop();
        if was_active {
            self.log("Call ended");
        }
    }

    /// Tear down capture, playback, background loops and the connection.
    /// Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, ClientState::Idle | ClientState::Stopping) {
                return;
            }
            *state = ClientState::Stopping;
        }

        self.stop_call();

        let background = self.background.lock().take();
        if let Some(background) = background {
            background.shutdown().await;
        }

        if self.codec.protocol() == SubProtocol::Tagged {
            let _ = self.connection.send(self.codec.encode_disconnect(&self.local_id));
        }
        self.connection.close().await;
        self.online.clear();

        *self.state.write() = ClientState::Idle;
        self.log("Disconnected");
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Snapshot of the online set
    pub fn online(&self) -> Vec<ParticipantId> {
        self.online.snapshot()
    }

    pub fn is_call_active(&self) -> bool {
        self.call_active.load(Ordering::SeqCst)
    }

    /// Remote speakers that currently have a playback channel
    pub fn speakers(&self) -> Vec<ParticipantId> {
        self.playback.speakers()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn log(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!("{}", line);
        self.events.on_event(ClientEvent::log(line));
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(background) = self.background.get_mut().take() {
            background.abort();
        }
        // Connection tasks hold the manager, so they must be stopped explicitly
        self.connection.abort();
    }
}

/// Assembles a [`RelayClient`]
pub struct RelayClientBuilder {
    config: ClientConfig,
    participant_id: Option<ParticipantId>,
    connector: Option<Arc<dyn Connector>>,
    sink_factory: Option<Arc<dyn SinkFactory>>,
    events: Option<Arc<dyn EventSink>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl RelayClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            participant_id: None,
            connector: None,
            sink_factory: None,
            events: None,
            notifier: None,
        }
    }

    /// Override the participant id from config or generation
    pub fn participant_id(mut self, id: ParticipantId) -> Self {
        self.participant_id = Some(id);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn sink_factory(mut self, factory: Arc<dyn SinkFactory>) -> Self {
        self.sink_factory = Some(factory);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> RelayClient {
        let config = self.config;
        let local_id = self
            .participant_id
            .or_else(|| config.server.participant_id.clone().map(ParticipantId::from))
            .unwrap_or_else(ParticipantId::generate);
        let codec = ProtocolCodec::new(config.server.protocol);

        let events = self.events.unwrap_or_else(|| Arc::new(TracingSink));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector));
        let sink_factory = self
            .sink_factory
            .unwrap_or_else(|| Arc::new(CpalSinkFactory::new(config.audio.output_device.clone())));

        let online = Arc::new(OnlineSet::new());
        let call_active = Arc::new(AtomicBool::new(false));
        let (audio_tx, playback_rx) = playback_queue(PLAYBACK_QUEUE_CHUNKS);
        let playback = Arc::new(PlaybackMultiplexer::new(
            local_id.clone(),
            config.audio.format(),
            config.audio.jitter_buffer(),
            config.audio.idle_timeout(),
            sink_factory,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            codec,
            local_id.clone(),
            events.clone(),
            notifier,
            online.clone(),
            audio_tx,
            call_active.clone(),
        ));
        let handler: FrameHandler = Arc::new(move |frame| dispatcher.handle_frame(frame));

        let state_events = events.clone();
        let listener: StateListener = Arc::new(move |state| {
            state_events.on_event(ClientEvent::ConnectionChanged(state));
        });

        let connection = Arc::new(
            ConnectionManager::new(
                codec,
                local_id.clone(),
                config.connection.clone(),
                connector,
                handler,
            )
            .with_state_listener(listener),
        );

        let capture_events = events.clone();
        let capture_errors: CaptureErrorSink = Arc::new(move |e| {
            capture_events.on_event(ClientEvent::log(format!("Recording error: {}", e)));
        });

        RelayClient {
            config,
            local_id,
            codec,
            connection,
            playback,
            playback_rx,
            capture: Mutex::new(AudioCaptureSource::new().with_error_sink(capture_errors)),
            online,
            call_active,
            events,
            state: RwLock::new(ClientState::Idle),
            background: Mutex::new(None),
        }
    }
}
