//! Relay wire codec
//!
//! Encodes outbound chat/control records, decodes inbound reads into
//! [`ParsedRecord`]s and classifies transport frames. Audio is passed through
//! untouched on the tagged sub-protocol since the transport already
//! demarcates binary messages.

pub mod decoder;
pub mod encoder;

pub use decoder::ParsedRecord;

use bytes::Bytes;

use crate::error::ConnectError;
use crate::protocol::{Frame, ParticipantId, SubProtocol};

/// Stateless codec bound to one sub-protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolCodec {
    protocol: SubProtocol,
}

impl ProtocolCodec {
    pub fn new(protocol: SubProtocol) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> SubProtocol {
        self.protocol
    }

    /// Chat record sent on behalf of `sender`
    pub fn encode_chat(&self, sender: &ParticipantId, text: &str) -> Frame {
        match self.protocol {
            SubProtocol::Invocation => Frame::Text(encoder::chat_invocation(text)),
            SubProtocol::Tagged => Frame::Text(encoder::chat_tagged(sender, text)),
        }
    }

    /// Presence announcement. Tagged records, whichever protocol is selected.
    pub fn encode_hello(&self, participant: &ParticipantId) -> Frame {
        Frame::Text(encoder::hello(participant))
    }

    /// Graceful leave. Tagged records, whichever protocol is selected.
    pub fn encode_disconnect(&self, participant: &ParticipantId) -> Frame {
        Frame::Text(encoder::disconnect(participant))
    }

    /// Wrap one captured PCM chunk for transmission
    pub fn encode_audio(&self, chunk: Bytes) -> Frame {
        match self.protocol {
            SubProtocol::Invocation => Frame::Text(encoder::audio_invocation(&chunk)),
            SubProtocol::Tagged => Frame::Binary(chunk),
        }
    }

    /// Keep-alive record, if the sub-protocol has one
    pub fn encode_ping(&self) -> Option<Frame> {
        match self.protocol {
            SubProtocol::Invocation => Some(Frame::Text(encoder::ping_invocation())),
            SubProtocol::Tagged => None,
        }
    }

    /// Handshake record to send right after the transport opens
    pub fn handshake_request(&self) -> Option<Frame> {
        self.protocol
            .requires_handshake()
            .then(|| Frame::Text(encoder::handshake()))
    }

    /// Validate the handshake answer, returning any trailing records
    pub fn check_handshake<'a>(&self, text: &'a str) -> Result<&'a str, ConnectError> {
        decoder::decode_handshake_response(text)
    }

    /// Decode one text read into records, in wire order
    pub fn decode(&self, text: &str) -> Vec<ParsedRecord> {
        let decode_segment: fn(&str) -> ParsedRecord = match self.protocol {
            SubProtocol::Invocation => decoder::decode_invocation,
            SubProtocol::Tagged => decoder::decode_tagged,
        };
        decoder::split_records(text).map(decode_segment).collect()
    }

    /// Classify a transport frame and decode it
    pub fn decode_frame(&self, frame: &Frame) -> Vec<ParsedRecord> {
        match frame {
            Frame::Text(text) => self.decode(text),
            Frame::Binary(payload) => vec![ParsedRecord::Audio {
                sender: None,
                payload: payload.clone(),
            }],
        }
    }
}
