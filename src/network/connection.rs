//! Relay connection management
//!
//! [`ConnectionManager`] owns the single relay connection. Each successful
//! connect spawns three tasks bound to that connection:
//!
//! - a writer draining the outbound queue into the transport sink,
//! - a receive loop forwarding every inbound frame to the frame handler,
//! - a keep-alive ticker on sub-protocols that need one.
//!
//! When the receive loop or the writer fails, the connection is marked
//! [`ConnectionState::Reconnecting`] and the tasks wind down; the supervisor
//! (see [`crate::network::supervisor`]) brings it back.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::ProtocolCodec;
use crate::config::ConnectionConfig;
use crate::error::{ConnectError, SendError};
use crate::network::transport::{Connector, FrameSink, FrameStream};
use crate::protocol::{Frame, ParticipantId, SubProtocol};

/// How long a graceful close waits for queued frames to flush
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Connection state, owned by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Receives every inbound frame. Returning `Break(reason)` drops the
/// connection and hands it to the supervisor.
pub type FrameHandler = Arc<dyn Fn(Frame) -> ControlFlow<String> + Send + Sync>;

/// Observes state transitions
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Tasks belonging to one live connection
struct ConnectionTasks {
    writer: JoinHandle<()>,
    receiver: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
}

impl ConnectionTasks {
    fn abort(&self) {
        self.receiver.abort();
        self.writer.abort();
        if let Some(keepalive) = &self.keepalive {
            keepalive.abort();
        }
    }
}

/// Owner of the relay connection
pub struct ConnectionManager {
    codec: ProtocolCodec,
    local_id: ParticipantId,
    settings: ConnectionConfig,
    connector: Arc<dyn Connector>,
    handler: FrameHandler,
    state_listener: Option<StateListener>,

    state: RwLock<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    tasks: Mutex<Option<ConnectionTasks>>,
    /// Bumped on every connect and close so stale tasks cannot touch state
    generation: AtomicU64,
    /// Serializes connect attempts
    connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        codec: ProtocolCodec,
        local_id: ParticipantId,
        settings: ConnectionConfig,
        connector: Arc<dyn Connector>,
        handler: FrameHandler,
    ) -> Self {
        Self {
            codec,
            local_id,
            settings,
            connector,
            handler,
            state_listener: None,
            state: RwLock::new(ConnectionState::Disconnected),
            outbound: Mutex::new(None),
            tasks: Mutex::new(None),
            generation: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register a state transition observer
    pub fn with_state_listener(mut self, listener: StateListener) -> Self {
        self.state_listener = Some(listener);
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn settings(&self) -> &ConnectionConfig {
        &self.settings
    }

    pub fn codec(&self) -> ProtocolCodec {
        self.codec
    }

    /// Open the transport, handshake if required and start the connection
    /// tasks.
    ///
    /// A fresh connect moves Disconnected -> Connecting -> Connected, falling
    /// back to Disconnected on failure. An attempt made while Reconnecting
    /// stays Reconnecting until it succeeds.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<(), ConnectError> {
        let _guard = self.connect_lock.lock().await;

        let resuming = match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Reconnecting => true,
            ConnectionState::Disconnected | ConnectionState::Connecting => false,
        };
        if !resuming {
            self.set_state(ConnectionState::Connecting);
        }

        tracing::info!("Connecting to {}", address);
        match self.establish(address).await {
            Ok(()) => {
                tracing::info!("Connected to {}", address);
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Connect to {} failed: {}", address, e);
                if !resuming {
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>, address: &str) -> Result<(), ConnectError> {
        let timeout = self.settings.handshake_timeout();

        let (mut sink, mut stream) = tokio::time::timeout(timeout, self.connector.connect(address))
            .await
            .map_err(|_| ConnectError::Refused(format!("no answer within {:?}", timeout)))??;

        let mut leftover = None;
        if let Some(request) = self.codec.handshake_request() {
            sink.send(request).await?;
            let answer = tokio::time::timeout(timeout, next_text(&mut stream))
                .await
                .map_err(|_| ConnectError::HandshakeTimeout)??;
            let rest = self.codec.check_handshake(&answer)?;
            if !rest.is_empty() {
                leftover = Some(Frame::Text(rest.to_string()));
            }
            tracing::debug!("Handshake accepted");
        }

        if self.codec.protocol() == SubProtocol::Tagged {
            sink.send(self.codec.encode_hello(&self.local_id)).await?;
        }

        self.install(sink, stream, leftover);
        Ok(())
    }

    /// Replace any previous connection tasks with tasks for this transport
    fn install(self: &Arc<Self>, sink: FrameSink, stream: FrameStream, leftover: Option<Frame>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.settings.outbound_queue.max(1));

        if let Some(old) = self.tasks.lock().take() {
            old.abort();
        }

        let keepalive = self.codec.encode_ping().map(|ping| {
            tokio::spawn(keepalive_loop(tx.clone(), ping, self.settings.keepalive_interval()))
        });
        let writer = tokio::spawn(write_loop(self.clone(), sink, rx, generation));

        *self.outbound.lock() = Some(tx);
        self.set_state(ConnectionState::Connected);

        // Records that arrived in the same read as the handshake answer
        if let Some(frame) = leftover {
            if let ControlFlow::Break(reason) = (self.handler)(frame) {
                self.connection_lost(generation, &reason);
            }
        }

        let receiver = tokio::spawn(receive_loop(self.clone(), stream, generation));

        *self.tasks.lock() = Some(ConnectionTasks {
            writer,
            receiver,
            keepalive,
        });
    }

    /// Queue a frame for transmission without waiting.
    ///
    /// Fails with [`SendError::NotConnected`] unless the connection is up;
    /// callers treat that as expected rather than fatal.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(SendError::NotConnected)?;
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::NotConnected,
        })
    }

    /// Move a dropped connection into Reconnecting. No-op when connected.
    pub fn mark_reconnecting(&self) {
        let mut state = self.state.write();
        if matches!(*state, ConnectionState::Disconnected | ConnectionState::Connecting) {
            *state = ConnectionState::Reconnecting;
            drop(state);
            self.notify_state(ConnectionState::Reconnecting);
        }
    }

    /// Close the connection, giving queued frames a short grace period to
    /// flush.
    ///
    /// An in-flight connect finishes first, so nothing it installs outlives
    /// the close.
    pub async fn close(&self) {
        let _guard = self.connect_lock.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        let tasks = self.tasks.lock().take();
        let outbound = self.outbound.lock().take();

        if let Some(mut tasks) = tasks {
            tasks.receiver.abort();
            if let Some(keepalive) = &tasks.keepalive {
                keepalive.abort();
            }
            // Writer exits once every sender is gone
            drop(outbound);
            if tokio::time::timeout(CLOSE_GRACE, &mut tasks.writer).await.is_err() {
                tracing::debug!("Writer did not flush within {:?}", CLOSE_GRACE);
                tasks.writer.abort();
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Drop the connection immediately without flushing
    pub fn abort(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.abort();
        }
        self.outbound.lock().take();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Called by connection tasks when the transport fails
    fn connection_lost(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        tracing::warn!("Connection lost: {}", reason);
        self.outbound.lock().take();
        self.set_state(ConnectionState::Reconnecting);
    }

    fn set_state(&self, new: ConnectionState) {
        let changed = {
            let mut state = self.state.write();
            let changed = *state != new;
            *state = new;
            changed
        };
        if changed {
            self.notify_state(new);
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        tracing::debug!("Connection state: {}", state);
        if let Some(listener) = &self.state_listener {
            listener(state);
        }
    }
}

/// Wait for the first text frame, skipping any binary frames
async fn next_text(stream: &mut FrameStream) -> Result<String, ConnectError> {
    loop {
        match stream.next().await {
            Some(Ok(Frame::Text(text))) => return Ok(text),
            Some(Ok(Frame::Binary(_))) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ConnectError::ClosedDuringHandshake),
        }
    }
}

async fn receive_loop(manager: Arc<ConnectionManager>, mut stream: FrameStream, generation: u64) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(frame)) => {
                if let ControlFlow::Break(reason) = (manager.handler)(frame) {
                    break reason;
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "closed by relay".to_string(),
        }
    };
    manager.connection_lost(generation, &reason);
    tracing::debug!("Receive loop exited");
}

async fn write_loop(
    manager: Arc<ConnectionManager>,
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<Frame>,
    generation: u64,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            manager.connection_lost(generation, &format!("send failed: {}", e));
            return;
        }
    }
    let _ = sink.close().await;
}

async fn keepalive_loop(tx: mpsc::Sender<Frame>, ping: Frame, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // First tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(ping.clone()) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::protocol::RECORD_SEPARATOR;
    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;

    /// Far ends of one scripted transport
    struct Remote {
        from_client: fmpsc::UnboundedReceiver<Frame>,
        to_client: fmpsc::UnboundedSender<Result<Frame, TransportError>>,
    }

    /// Accepts every connect, handing the remote ends to the test
    struct LoopbackConnector {
        remotes: Mutex<Vec<Remote>>,
        handshake_answer: Option<String>,
    }

    impl LoopbackConnector {
        fn new(handshake_answer: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                remotes: Mutex::new(Vec::new()),
                handshake_answer: handshake_answer.map(str::to_string),
            })
        }

        fn take_remote(&self) -> Remote {
            self.remotes.lock().remove(0)
        }
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(&self, _address: &str) -> Result<(FrameSink, FrameStream), ConnectError> {
            let (client_tx, from_client) = fmpsc::unbounded();
            let (to_client, client_rx) = fmpsc::unbounded();
            if let Some(answer) = &self.handshake_answer {
                let _ = to_client.unbounded_send(Ok(Frame::Text(answer.clone())));
            }
            self.remotes.lock().push(Remote {
                from_client,
                to_client,
            });
            let sink: FrameSink = Box::pin(client_tx.sink_map_err(|_| TransportError::Closed));
            let stream: FrameStream = Box::pin(client_rx);
            Ok((sink, stream))
        }
    }

    fn collecting_handler() -> (FrameHandler, Arc<Mutex<Vec<Frame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let out = frames.clone();
        let handler: FrameHandler = Arc::new(move |frame| {
            out.lock().push(frame);
            ControlFlow::Continue(())
        });
        (handler, frames)
    }

    fn manager(
        protocol: SubProtocol,
        connector: Arc<LoopbackConnector>,
        handler: FrameHandler,
    ) -> Arc<ConnectionManager> {
        manager_with(protocol, connector, handler, ConnectionConfig::default())
    }

    fn manager_with(
        protocol: SubProtocol,
        connector: Arc<LoopbackConnector>,
        handler: FrameHandler,
        settings: ConnectionConfig,
    ) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(
            ProtocolCodec::new(protocol),
            ParticipantId::new("me"),
            settings,
            connector,
            handler,
        ))
    }

    #[tokio::test]
    async fn test_send_before_connect_is_not_connected() {
        let (handler, _) = collecting_handler();
        let manager = manager(SubProtocol::Tagged, LoopbackConnector::new(None), handler);
        assert_eq!(
            manager.send(Frame::Text("x".into())),
            Err(SendError::NotConnected)
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_then_connected() {
        let connector = LoopbackConnector::new(Some("{}\u{1e}"));
        let (handler, _) = collecting_handler();
        let manager = manager(SubProtocol::Invocation, connector.clone(), handler);

        manager.connect("ws://relay").await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);

        let mut remote = connector.take_remote();
        let first = remote.from_client.next().await.unwrap();
        assert_eq!(first, Frame::Text(format!("{{\"protocol\":\"json\",\"version\":1}}{}", RECORD_SEPARATOR)));
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let connector = LoopbackConnector::new(Some("{\"error\":\"nope\"}\u{1e}"));
        let (handler, _) = collecting_handler();
        let manager = manager(SubProtocol::Invocation, connector, handler);

        let result = manager.connect("ws://relay").await;
        assert!(matches!(result, Err(ConnectError::HandshakeRejected(ref e)) if e == "nope"));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let connector = LoopbackConnector::new(None);
        let (handler, _) = collecting_handler();
        let manager = manager(SubProtocol::Invocation, connector, handler);

        let result = manager.connect("ws://relay").await;
        assert!(matches!(result, Err(ConnectError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn test_records_after_handshake_are_dispatched() {
        let answer = format!("{{}}\u{1e}{{\"type\":1,\"target\":\"ReceiveMessage\",\"arguments\":[\"a\",\"b\"]}}\u{1e}");
        let connector = LoopbackConnector::new(Some(&answer));
        let (handler, frames) = collecting_handler();
        let manager = manager(SubProtocol::Invocation, connector, handler);

        manager.connect("ws://relay").await.unwrap();
        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::Text(t) if t.contains("ReceiveMessage")));
    }

    #[tokio::test]
    async fn test_tagged_sends_hello_and_relays_frames() {
        let connector = LoopbackConnector::new(None);
        let (handler, frames) = collecting_handler();
        let manager = manager(SubProtocol::Tagged, connector.clone(), handler);

        manager.connect("ws://relay").await.unwrap();
        let mut remote = connector.take_remote();
        let hello = remote.from_client.next().await.unwrap();
        assert_eq!(hello, Frame::Text(r#"{"clientId":"me","type":"hello"}"#.to_string()));

        manager.send(Frame::Text("out".into())).unwrap();
        assert_eq!(remote.from_client.next().await.unwrap(), Frame::Text("out".into()));

        remote
            .to_client
            .unbounded_send(Ok(Frame::Binary(bytes::Bytes::from_static(&[1, 2]))))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(frames.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_close_moves_to_reconnecting() {
        let connector = LoopbackConnector::new(None);
        let (handler, _) = collecting_handler();
        let manager = manager(SubProtocol::Tagged, connector.clone(), handler);

        manager.connect("ws://relay").await.unwrap();
        drop(connector.take_remote());

        for _ in 0..50 {
            if manager.state() == ConnectionState::Reconnecting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(
            manager.send(Frame::Text("x".into())),
            Err(SendError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_handler_break_drops_connection() {
        let connector = LoopbackConnector::new(None);
        let handler: FrameHandler = Arc::new(|_| ControlFlow::Break("server close".into()));
        let manager = manager(SubProtocol::Tagged, connector.clone(), handler);

        manager.connect("ws://relay").await.unwrap();
        let remote = connector.take_remote();
        remote.to_client.unbounded_send(Ok(Frame::Text("{}".into()))).unwrap();

        for _ in 0..50 {
            if manager.state() == ConnectionState::Reconnecting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn test_close_flushes_and_disconnects() {
        let connector = LoopbackConnector::new(None);
        let (handler, _) = collecting_handler();
        let manager = manager(SubProtocol::Tagged, connector.clone(), handler);

        manager.connect("ws://relay").await.unwrap();
        manager.send(Frame::Text("bye".into())).unwrap();
        manager.close().await;
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let mut remote = connector.take_remote();
        let _hello = remote.from_client.next().await.unwrap();
        assert_eq!(remote.from_client.next().await.unwrap(), Frame::Text("bye".into()));
        // Sink closed after the flush
        assert!(remote.from_client.next().await.is_none());
    }

    #[tokio::test]
    async fn test_state_listener_sees_transitions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = seen.clone();
        let connector = LoopbackConnector::new(None);
        let (handler, _) = collecting_handler();
        let manager = Arc::new(
            ConnectionManager::new(
                ProtocolCodec::new(SubProtocol::Tagged),
                ParticipantId::new("me"),
                ConnectionConfig::default(),
                connector,
                handler,
            )
            .with_state_listener(Arc::new(move |state| out.lock().push(state))),
        );

        manager.connect("ws://relay").await.unwrap();
        manager.close().await;
        assert_eq!(
            *seen.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_at_configured_period() {
        let connector = LoopbackConnector::new(Some("{}\u{1e}"));
        let (handler, _) = collecting_handler();
        let settings = ConnectionConfig {
            keepalive_interval_ms: 1_000,
            ..ConnectionConfig::default()
        };
        let manager = manager_with(SubProtocol::Invocation, connector.clone(), handler, settings);

        manager.connect("ws://relay").await.unwrap();
        let connected_at = tokio::time::Instant::now();
        let mut remote = connector.take_remote();
        let _handshake = remote.from_client.next().await.unwrap();

        let ping = Frame::Text(format!("{{\"type\":6}}{}", RECORD_SEPARATOR));
        for period in 1..=2u32 {
            assert_eq!(remote.from_client.next().await.unwrap(), ping);
            let elapsed = connected_at.elapsed();
            assert!(elapsed >= Duration::from_secs(1) * period);
            assert!(elapsed < Duration::from_secs(1) * period + Duration::from_millis(10));
        }

        manager.close().await;
        // Sink closed and no further pings
        assert!(remote.from_client.next().await.is_none());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(remote.from_client.next().await.is_none());
    }

    #[tokio::test]
    async fn test_tagged_has_no_keepalive() {
        let connector = LoopbackConnector::new(None);
        let (handler, _) = collecting_handler();
        let settings = ConnectionConfig {
            keepalive_interval_ms: 10,
            ..ConnectionConfig::default()
        };
        let manager = manager_with(SubProtocol::Tagged, connector.clone(), handler, settings);

        manager.connect("ws://relay").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.close().await;

        let mut remote = connector.take_remote();
        let _hello = remote.from_client.next().await.unwrap();
        assert!(remote.from_client.next().await.is_none());
    }

    #[tokio::test]
    async fn test_full_outbound_queue_rejects_without_waiting() {
        let connector = LoopbackConnector::new(None);
        let (handler, _) = collecting_handler();
        let settings = ConnectionConfig {
            outbound_queue: 2,
            ..ConnectionConfig::default()
        };
        let manager = manager_with(SubProtocol::Tagged, connector.clone(), handler, settings);
        manager.connect("ws://relay").await.unwrap();

        // The writer cannot run until this task yields
        assert_eq!(manager.send(Frame::Text("1".into())), Ok(()));
        assert_eq!(manager.send(Frame::Text("2".into())), Ok(()));
        assert_eq!(manager.send(Frame::Text("3".into())), Err(SendError::QueueFull));
        assert!(manager.is_connected());

        let mut remote = connector.take_remote();
        let _hello = remote.from_client.next().await.unwrap();
        assert_eq!(remote.from_client.next().await.unwrap(), Frame::Text("1".into()));
        assert_eq!(remote.from_client.next().await.unwrap(), Frame::Text("2".into()));

        // Room again once the writer drained the queue
        assert_eq!(manager.send(Frame::Text("4".into())), Ok(()));
        assert_eq!(remote.from_client.next().await.unwrap(), Frame::Text("4".into()));
    }
}
