//! Outbound record encoding
//!
//! Records are built with `serde_json::json!`, whose `Display` output is the
//! compact form the relay expects.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;

use crate::protocol::{invocation_type, tagged_type, targets, ParticipantId, RECORD_SEPARATOR};

/// Append the record separator to a serialized record
fn terminate(mut record: String) -> String {
    record.push(RECORD_SEPARATOR);
    record
}

/// `{"protocol":"json","version":1}` followed by the separator
pub fn handshake() -> String {
    terminate(json!({ "protocol": "json", "version": 1 }).to_string())
}

/// Generic invocation record
pub fn invocation(target: &str, arguments: &[&str]) -> String {
    terminate(
        json!({
            "type": invocation_type::INVOCATION,
            "target": target,
            "arguments": arguments,
        })
        .to_string(),
    )
}

/// Chat message for the invocation sub-protocol
pub fn chat_invocation(text: &str) -> String {
    invocation(targets::SEND_MESSAGE, &[text])
}

/// Audio chunk for the invocation sub-protocol.
///
/// The hub encodes binary arguments as base64 strings in its JSON form.
pub fn audio_invocation(chunk: &[u8]) -> String {
    let encoded = STANDARD.encode(chunk);
    invocation(targets::SEND_AUDIO, &[encoded.as_str()])
}

/// Keep-alive record for the invocation sub-protocol
pub fn ping_invocation() -> String {
    terminate(json!({ "type": invocation_type::PING }).to_string())
}

/// Tagged record; `message` is omitted when `None`
pub fn tagged(kind: &str, client_id: &ParticipantId, message: Option<&str>) -> String {
    let mut record = json!({
        "type": kind,
        "clientId": client_id.as_str(),
    });
    if let Some(message) = message {
        record["message"] = json!(message);
    }
    record.to_string()
}

/// Tagged `hello` record announcing this participant
pub fn hello(client_id: &ParticipantId) -> String {
    tagged(tagged_type::HELLO, client_id, None)
}

/// Tagged `disconnect` record
pub fn disconnect(client_id: &ParticipantId) -> String {
    tagged(tagged_type::DISCONNECT, client_id, None)
}

/// Tagged chat record
pub fn chat_tagged(client_id: &ParticipantId, text: &str) -> String {
    tagged(tagged_type::MESSAGE, client_id, Some(text))
}
