//! # Voice Relay
//!
//! Real-time chat and voice client for a message relay.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         UI collaborator                              │
//! │   start / stop / send_chat / start_call / stop_call    ClientEvent   │
//! └──────────────┬───────────────────────────────────────────▲───────────┘
//!                │                                           │
//!                ▼                                           │
//! ┌──────────────────────────────────────────────────────────┴───────────┐
//! │                     RelayClient (client)                             │
//! │                                                                      │
//! │  ┌──────────────┐   chunks    ┌──────────────┐                       │
//! │  │ Capture      │ ──────────▶ │ Protocol     │                       │
//! │  │ thread (cpal)│  try_send   │ Codec        │                       │
//! │  └──────────────┘             └──────┬───────┘                       │
//! │                                      ▼                               │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │            ConnectionManager (network::connection)              │  │
//! │  │   writer task ◀── outbound queue     receive loop ──▶ Dispatcher│  │
//! │  │   keep-alive task                    supervisor (reconnect)     │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! │                                                          │           │
//! │                         audio by sender                  ▼           │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │              PlaybackMultiplexer (audio::playback)             │  │
//! │  │   speaker A          speaker B          speaker C              │  │
//! │  │  ┌─────────┐        ┌─────────┐        ┌─────────┐             │  │
//! │  │  │ Jitter  │        │ Jitter  │        │ Jitter  │  idle reaper│  │
//! │  │  │ Buffer  │        │ Buffer  │        │ Buffer  │             │  │
//! │  │  └────┬────┘        └────┬────┘        └────┬────┘             │  │
//! │  │       ▼                  ▼                  ▼                  │  │
//! │  │   output thread      output thread      output thread          │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

pub use client::{ClientEvent, ClientState, RelayClient, RelayClientBuilder};
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Relay endpoint used when none is configured
    pub const DEFAULT_SERVER_URL: &str = "ws://localhost:5000/chathub";

    /// Default sample rate for speech audio
    pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Per-speaker playback buffer in milliseconds
    pub const DEFAULT_JITTER_BUFFER_MS: u32 = 250;

    /// Speakers silent this long lose their playback channel
    pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

    /// Idle reaper period
    pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 5;

    /// Supervisor connection check period
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;

    /// Wait after a failed connect
    pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 5_000;

    pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

    /// Keep-alive period for the invocation sub-protocol
    pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 15_000;

    /// Outbound frames queued before sends fail
    pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

    /// Inbound chunks waiting for the playback thread before new ones drop
    pub const PLAYBACK_QUEUE_CHUNKS: usize = 256;

    /// Speaker id for binary audio that arrives without sender attribution
    pub const RELAY_SPEAKER: &str = "relay";
}
