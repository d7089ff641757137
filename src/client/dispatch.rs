//! Inbound record dispatch
//!
//! Decoding is pure; every side effect of an inbound record happens here.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Sender;
use dashmap::DashSet;

use crate::audio::playback::SpeakerChunk;
use crate::client::events::{ClientEvent, EventSink, Notifier};
use crate::codec::{ParsedRecord, ProtocolCodec};
use crate::constants::RELAY_SPEAKER;
use crate::protocol::{Frame, ParticipantId, RosterChange};

/// Participants currently known to be online
#[derive(Debug, Default)]
pub struct OnlineSet {
    members: DashSet<ParticipantId>,
}

impl OnlineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the participant was not already online
    pub fn insert(&self, participant: ParticipantId) -> bool {
        self.members.insert(participant)
    }

    /// Returns true if the participant was online
    pub fn remove(&self, participant: &ParticipantId) -> bool {
        self.members.remove(participant).is_some()
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.members.contains(participant)
    }

    /// Sorted copy of the current members
    pub fn snapshot(&self) -> Vec<ParticipantId> {
        let mut members: Vec<_> = self.members.iter().map(|id| id.key().clone()).collect();
        members.sort();
        members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&self) {
        self.members.clear();
    }
}

/// Applies decoded records to the UI, the roster and playback
pub struct Dispatcher {
    codec: ProtocolCodec,
    local_id: ParticipantId,
    events: Arc<dyn EventSink>,
    notifier: Arc<dyn Notifier>,
    online: Arc<OnlineSet>,
    /// Queue into the playback thread
    audio: Sender<SpeakerChunk>,
    call_active: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        codec: ProtocolCodec,
        local_id: ParticipantId,
        events: Arc<dyn EventSink>,
        notifier: Arc<dyn Notifier>,
        online: Arc<OnlineSet>,
        audio: Sender<SpeakerChunk>,
        call_active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            codec,
            local_id,
            events,
            notifier,
            online,
            audio,
            call_active,
        }
    }

    /// Decode one transport frame and dispatch every record in it.
    /// Breaks if the relay asked to close the connection.
    pub fn handle_frame(&self, frame: Frame) -> ControlFlow<String> {
        let mut flow = ControlFlow::Continue(());
        for record in self.codec.decode_frame(&frame) {
            if let ControlFlow::Break(reason) = self.dispatch(record) {
                flow = ControlFlow::Break(reason);
            }
        }
        flow
    }

    pub fn dispatch(&self, record: ParsedRecord) -> ControlFlow<String> {
        match record {
            ParsedRecord::Chat { sender, text } => self.on_chat(sender, text),
            ParsedRecord::Hello { participant } => {
                self.on_roster(participant, RosterChange::Joined)
            }
            ParsedRecord::Disconnect { participant } => {
                self.on_roster(participant, RosterChange::Left)
            }
            ParsedRecord::Audio { sender, payload } => {
                let sender = sender.unwrap_or_else(|| ParticipantId::new(RELAY_SPEAKER));
                self.on_audio(sender, payload);
            }
            ParsedRecord::Ping | ParsedRecord::Ignored => {}
            ParsedRecord::Unknown { kind } => {
                tracing::debug!("Ignoring record of unknown type {}", kind);
            }
            ParsedRecord::Close { error } => {
                let reason = error.unwrap_or_else(|| "closed by relay".to_string());
                self.log(format!("Relay closed the connection: {}", reason));
                return ControlFlow::Break(reason);
            }
            ParsedRecord::Malformed(e) => {
                tracing::warn!("{}", e);
                self.log(format!("Invalid record received: {}", e.segment));
            }
        }
        ControlFlow::Continue(())
    }

    fn on_chat(&self, sender: ParticipantId, text: String) {
        if sender == self.local_id {
            tracing::trace!("Dropping echo of own message");
            return;
        }

        self.log(format!("Received from {}: {}", sender, text));
        if let Err(e) = self
            .notifier
            .notify(&format!("new Message from {}", sender), &text)
        {
            tracing::debug!("Notification failed: {}", e);
        }
        self.events.on_event(ClientEvent::Chat { sender, text });
    }

    fn on_roster(&self, participant: ParticipantId, change: RosterChange) {
        if participant == self.local_id {
            return;
        }
        let changed = match change {
            RosterChange::Joined => self.online.insert(participant.clone()),
            RosterChange::Left => self.online.remove(&participant),
        };
        if changed {
            tracing::info!("{} {:?}", participant, change);
            self.events.on_event(ClientEvent::Roster {
                participant,
                change,
            });
        }
    }

    /// Hand a chunk to the playback thread. Never blocks the receive loop.
    fn on_audio(&self, sender: ParticipantId, payload: Bytes) {
        if !self.call_active.load(Ordering::SeqCst) {
            tracing::trace!("Dropping audio from {}: no active call", sender);
            return;
        }
        if sender == self.local_id || payload.is_empty() {
            return;
        }
        if let Err(e) = self.audio.try_send((sender, payload)) {
            tracing::trace!("Dropping audio chunk: {}", e);
        }
    }

    fn log(&self, line: String) {
        self.events.on_event(ClientEvent::log(line));
    }
}
