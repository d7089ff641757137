//! Frame transport
//!
//! A [`Connector`] opens one duplex channel to the relay and hands back a
//! frame sink and a frame stream. Transport-level control (WebSocket ping,
//! pong and close frames) is handled here and never reaches the codec.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, Message};

use crate::error::{ConnectError, TransportError};
use crate::protocol::Frame;

/// Outbound half of a transport
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Inbound half of a transport. Ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// Opens transports to the relay
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<(FrameSink, FrameStream), ConnectError>;
}

/// WebSocket transport (`ws://` or `wss://`)
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, address: &str) -> Result<(FrameSink, FrameStream), ConnectError> {
        let request = address
            .into_client_request()
            .map_err(|e| ConnectError::InvalidAddress(format!("{}: {}", address, e)))?;

        let (socket, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(classify_connect_error)?;
        tracing::debug!("WebSocket upgrade answered with {}", response.status());

        let (write, read) = socket.split();

        let sink: FrameSink = Box::pin(
            write.with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_message(frame)))),
        );
        let stream: FrameStream =
            Box::pin(read.filter_map(|message| future::ready(from_message(message))));

        Ok((sink, stream))
    }
}

fn classify_connect_error(error: tungstenite::Error) -> ConnectError {
    match error {
        tungstenite::Error::Io(e) => ConnectError::Refused(e.to_string()),
        tungstenite::Error::Url(e) => ConnectError::InvalidAddress(e.to_string()),
        tungstenite::Error::Http(response) => {
            ConnectError::Refused(format!("upgrade rejected with {}", response.status()))
        }
        other => ConnectError::Transport(other.into()),
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
    }
}

fn from_message(message: Result<Message, tungstenite::Error>) -> Option<Result<Frame, TransportError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
        Ok(Message::Close(close)) => {
            if let Some(close) = close {
                tracing::debug!("Relay sent close: {} {}", close.code, close.reason);
            }
            Some(Err(TransportError::Closed))
        }
        // Pongs are queued by tungstenite itself
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
        Err(e) => Some(Err(e.into())),
    }
}
