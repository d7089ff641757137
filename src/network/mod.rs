//! Network subsystem: relay transport, connection ownership and reconnection

pub mod connection;
pub mod supervisor;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState, FrameHandler, StateListener};
pub use supervisor::run_supervisor;
pub use transport::{Connector, FrameSink, FrameStream, WebSocketConnector};
