//! Events delivered to the UI collaborator
//!
//! The core only guarantees that each event is delivered once with its data.
//! Crossing onto the UI's own execution context is the sink's job.

use std::fmt;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;

use crate::network::ConnectionState;
use crate::protocol::{ParticipantId, RosterChange};

/// Something the UI should show
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Chat message from a remote participant
    Chat { sender: ParticipantId, text: String },
    /// Timestamped status line
    Log { at: DateTime<Local>, line: String },
    /// A participant joined or left
    Roster {
        participant: ParticipantId,
        change: RosterChange,
    },
    /// Relay connection state changed
    ConnectionChanged(ConnectionState),
}

impl ClientEvent {
    /// Log line stamped with the current local time
    pub fn log(line: impl Into<String>) -> Self {
        ClientEvent::Log {
            at: Local::now(),
            line: line.into(),
        }
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Chat { sender, text } => write!(f, "{}: {}", sender, text),
            ClientEvent::Log { at, line } => write!(f, "[{}] {}", at.format("%H:%M:%S"), line),
            ClientEvent::Roster {
                participant,
                change: RosterChange::Joined,
            } => write!(f, "{} joined", participant),
            ClientEvent::Roster {
                participant,
                change: RosterChange::Left,
            } => write!(f, "{} left", participant),
            ClientEvent::ConnectionChanged(state) => write!(f, "connection {}", state),
        }
    }
}

/// UI callback boundary. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: ClientEvent);
}

impl EventSink for mpsc::UnboundedSender<ClientEvent> {
    fn on_event(&self, event: ClientEvent) {
        // Receiver gone means the UI has shut down
        let _ = self.send(event);
    }
}

/// Sink used when no UI is attached; events only reach the trace log
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: ClientEvent) {
        tracing::debug!("{}", event);
    }
}

/// Desktop notification collaborator. Called once per received chat
/// message; failures are ignored by the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str) -> anyhow::Result<()>;
}

/// Notifier that writes to the log instead of the desktop
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) -> anyhow::Result<()> {
        tracing::info!("{}: {}", title, body);
        Ok(())
    }
}
