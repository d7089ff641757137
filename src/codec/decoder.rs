//! Inbound record decoding
//!
//! Decoding is pure: every segment of a read turns into exactly one
//! [`ParsedRecord`], malformed segments included. Acting on records
//! (including dropping pings) is the dispatcher's job.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{ConnectError, ParseError};
use crate::protocol::{
    invocation_type, tagged_type, targets, HandshakeResponse, ParticipantId, RawInvocation,
    TaggedRecord, RECORD_SEPARATOR,
};

/// Typed result of decoding one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRecord {
    /// A participant announced itself
    Hello { participant: ParticipantId },
    /// Chat message from a participant
    Chat { sender: ParticipantId, text: String },
    /// A participant left
    Disconnect { participant: ParticipantId },
    /// Audio chunk; `sender` is `None` when the transport does not attribute it
    Audio {
        sender: Option<ParticipantId>,
        payload: Bytes,
    },
    /// Keep-alive
    Ping,
    /// Server is closing the connection
    Close { error: Option<String> },
    /// Recognized type with missing or undersized arguments
    Ignored,
    /// Well-formed record of a type this client does not handle
    Unknown { kind: String },
    /// Segment failed structural parsing
    Malformed(ParseError),
}

impl ParsedRecord {
    pub fn is_malformed(&self) -> bool {
        matches!(self, ParsedRecord::Malformed(_))
    }
}

/// Split a text read on the record separator, discarding empty segments
pub fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|segment| !segment.is_empty())
}

/// Extract `count` leading string arguments, or `None` if there are fewer
fn string_arguments<'a>(
    segment: &str,
    arguments: &'a [Value],
    count: usize,
) -> Option<Result<Vec<&'a str>, ParseError>> {
    if arguments.len() < count {
        return None;
    }

    let mut out = Vec::with_capacity(count);
    for (index, argument) in arguments.iter().take(count).enumerate() {
        match argument.as_str() {
            Some(value) => out.push(value),
            None => {
                return Some(Err(ParseError::new(
                    segment,
                    format!("argument {} is not a string", index),
                )))
            }
        }
    }
    Some(Ok(out))
}

/// Decode one invocation-protocol segment
pub fn decode_invocation(segment: &str) -> ParsedRecord {
    let record: RawInvocation = match serde_json::from_str(segment) {
        Ok(record) => record,
        Err(e) => return ParsedRecord::Malformed(ParseError::new(segment, e)),
    };

    match record.kind {
        Some(invocation_type::PING) => return ParsedRecord::Ping,
        Some(invocation_type::CLOSE) => return ParsedRecord::Close { error: record.error },
        Some(invocation_type::INVOCATION) | None => {}
        Some(other) => {
            return ParsedRecord::Unknown {
                kind: format!("type {}", other),
            }
        }
    }

    let (target, arguments) = match (record.target.as_deref(), record.arguments.as_deref()) {
        (Some(target), Some(arguments)) if !target.is_empty() => (target, arguments),
        _ => return ParsedRecord::Ignored,
    };

    match target {
        targets::RECEIVE_MESSAGE => match string_arguments(segment, arguments, 2) {
            None => ParsedRecord::Ignored,
            Some(Err(e)) => ParsedRecord::Malformed(e),
            Some(Ok(args)) => ParsedRecord::Chat {
                sender: ParticipantId::new(args[0]),
                text: args[1].to_string(),
            },
        },
        targets::RECEIVE_AUDIO => match string_arguments(segment, arguments, 2) {
            None => ParsedRecord::Ignored,
            Some(Err(e)) => ParsedRecord::Malformed(e),
            Some(Ok(args)) => match STANDARD.decode(args[1]) {
                Ok(payload) => ParsedRecord::Audio {
                    sender: Some(ParticipantId::new(args[0])),
                    payload: Bytes::from(payload),
                },
                Err(e) => ParsedRecord::Malformed(ParseError::new(segment, e)),
            },
        },
        other => ParsedRecord::Unknown {
            kind: other.to_string(),
        },
    }
}

/// Decode one tagged-protocol segment
pub fn decode_tagged(segment: &str) -> ParsedRecord {
    let record: TaggedRecord = match serde_json::from_str(segment) {
        Ok(record) => record,
        Err(e) => return ParsedRecord::Malformed(ParseError::new(segment, e)),
    };

    let client_id = record
        .client_id
        .filter(|id| !id.is_empty())
        .map(ParticipantId::from);

    match (record.kind.as_str(), client_id) {
        (tagged_type::PING, _) => ParsedRecord::Ping,
        (tagged_type::HELLO, Some(participant)) => ParsedRecord::Hello { participant },
        (tagged_type::DISCONNECT, Some(participant)) => ParsedRecord::Disconnect { participant },
        (tagged_type::MESSAGE, Some(sender)) => match record.message {
            Some(text) => ParsedRecord::Chat { sender, text },
            None => ParsedRecord::Ignored,
        },
        (tagged_type::HELLO | tagged_type::DISCONNECT | tagged_type::MESSAGE, None) => {
            ParsedRecord::Ignored
        }
        (other, _) => ParsedRecord::Unknown {
            kind: other.to_string(),
        },
    }
}

/// Check the server's handshake answer.
///
/// Any records trailing the answer in the same read are returned so the
/// caller can dispatch them.
pub fn decode_handshake_response(text: &str) -> Result<&str, ConnectError> {
    let (answer, rest) = match text.split_once(RECORD_SEPARATOR) {
        Some(parts) => parts,
        None => (text, ""),
    };

    let response: HandshakeResponse = serde_json::from_str(answer)
        .map_err(|e| ConnectError::HandshakeRejected(format!("unreadable answer: {}", e)))?;

    match response.error {
        Some(error) => Err(ConnectError::HandshakeRejected(error)),
        None => Ok(rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_discards_empty_segments() {
        let parts: Vec<_> = split_records("\u{1e}a\u{1e}\u{1e}b\u{1e}").collect();
        assert_eq!(parts, vec!["a", "b"]);
    }

    #[test]
    fn test_receive_message() {
        let record =
            decode_invocation(r#"{"type":1,"target":"ReceiveMessage","arguments":["alice","hello"]}"#);
        assert_eq!(
            record,
            ParsedRecord::Chat {
                sender: ParticipantId::new("alice"),
                text: "hello".to_string(),
            }
        );
    }

    #[test]
    fn test_undersized_arguments_ignored() {
        let record = decode_invocation(r#"{"type":1,"target":"ReceiveMessage","arguments":["alice"]}"#);
        assert_eq!(record, ParsedRecord::Ignored);

        let record = decode_invocation(r#"{"type":1,"target":"ReceiveMessage"}"#);
        assert_eq!(record, ParsedRecord::Ignored);
    }

    #[test]
    fn test_ping_and_close() {
        assert_eq!(decode_invocation(r#"{"type":6}"#), ParsedRecord::Ping);
        assert_eq!(
            decode_invocation(r#"{"type":7,"error":"shutting down"}"#),
            ParsedRecord::Close {
                error: Some("shutting down".to_string())
            }
        );
    }

    #[test]
    fn test_receive_audio_attributed() {
        let record =
            decode_invocation(r#"{"type":1,"target":"ReceiveAudio","arguments":["bob","AQL/"]}"#);
        assert_eq!(
            record,
            ParsedRecord::Audio {
                sender: Some(ParticipantId::new("bob")),
                payload: Bytes::from_static(&[0x01, 0x02, 0xff]),
            }
        );
    }

    #[test]
    fn test_non_string_argument_is_malformed() {
        let record = decode_invocation(r#"{"type":1,"target":"ReceiveMessage","arguments":[5,"x"]}"#);
        assert!(record.is_malformed());
    }

    #[test]
    fn test_unknown_target_and_type() {
        assert_eq!(
            decode_invocation(r#"{"type":1,"target":"Other","arguments":[]}"#),
            ParsedRecord::Unknown {
                kind: "Other".to_string()
            }
        );
        assert_eq!(
            decode_invocation(r#"{"type":3,"invocationId":"1"}"#),
            ParsedRecord::Unknown {
                kind: "type 3".to_string()
            }
        );
    }

    #[test]
    fn test_tagged_variants() {
        assert_eq!(
            decode_tagged(r#"{"type":"hello","clientId":"c1"}"#),
            ParsedRecord::Hello {
                participant: ParticipantId::new("c1")
            }
        );
        assert_eq!(
            decode_tagged(r#"{"type":"disconnect","clientId":"c1"}"#),
            ParsedRecord::Disconnect {
                participant: ParticipantId::new("c1")
            }
        );
        assert_eq!(
            decode_tagged(r#"{"type":"message","clientId":"c1","message":"m"}"#),
            ParsedRecord::Chat {
                sender: ParticipantId::new("c1"),
                text: "m".to_string()
            }
        );
        assert_eq!(decode_tagged(r#"{"type":"message","clientId":"c1"}"#), ParsedRecord::Ignored);
        assert_eq!(decode_tagged(r#"{"type":"hello"}"#), ParsedRecord::Ignored);
        assert_eq!(
            decode_tagged(r#"{"type":"typing","clientId":"c1"}"#),
            ParsedRecord::Unknown {
                kind: "typing".to_string()
            }
        );
        assert!(decode_tagged(r#"{"clientId":"c1"}"#).is_malformed());
    }

    #[test]
    fn test_handshake_response() {
        assert_eq!(decode_handshake_response("{}\u{1e}").unwrap(), "");

        let rest = decode_handshake_response("{}\u{1e}{\"type\":6}\u{1e}").unwrap();
        assert_eq!(rest, "{\"type\":6}\u{1e}");

        let err = decode_handshake_response("{\"error\":\"bad protocol\"}\u{1e}").unwrap_err();
        assert!(matches!(err, ConnectError::HandshakeRejected(msg) if msg == "bad protocol"));

        assert!(decode_handshake_response("garbage").is_err());
    }
}
