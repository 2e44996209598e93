#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::empty_docs,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

//! RFC 6455 WebSocket engine: frame codec, fragment aggregation, the HTTP upgrade handshake,
//! an async client and a readiness-driven threaded server.

pub mod client;
pub mod config;
mod error;
pub mod frames;
pub mod handshake;
mod protocol;
mod role;
pub mod server;

pub use client::{ChannelHandler, Event, MessageHandler, NoopHandler, State, WebSocketClient};
pub use config::{ClientConfig, ServerConfig};
pub use error::{CloseReason, Error, FrameError, HandshakeError, Result};
pub use frames::{Frame, FrameAggregator, FrameCursor, FrameState, Merged, Opcode, decode, encode};
pub use protocol::Message;
pub use server::{Router, ServerHandle, WebSocketServer};
