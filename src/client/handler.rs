use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::{CloseReason, Error, Message};

/// Callbacks driven by the client's read task. Every method has a no-op default.
///
/// Text and binary callbacks may return a message to send back on the same connection.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_open(&self) {}

    async fn on_text(&self, _text: String) -> Option<Message> { None }

    async fn on_binary(&self, _bytes: Vec<u8>) -> Option<Message> { None }

    /// `latency` is set when the pong answered our latest keepalive ping.
    async fn on_pong(&self, _payload: Vec<u8>, _latency: Option<u16>) {}

    /// `None` when the transport went away without a close handshake.
    async fn on_close(&self, _reason: Option<CloseReason>) {}

    async fn on_error(&self, _error: Error) {}
}

/// Ignores everything.
pub struct NoopHandler;

#[async_trait]
impl MessageHandler for NoopHandler {}

/// `Event`s are produced by [`ChannelHandler`] for callers that would rather poll.
#[derive(Debug)]
pub enum Event {
    Message(Message),
    /// Pong event with its latency in milliseconds, if it answered our ping.
    Pong(Option<u16>),
    /// The connection has been closed.
    Closed(Option<CloseReason>),
    /// An error on the connection, rendered as text.
    Error(String),
}

/// Forwards every callback into a channel.
pub struct ChannelHandler {
    tx: Sender<Event>,
}

impl ChannelHandler {
    #[must_use]
    pub fn new(tx: Sender<Event>) -> Self { Self { tx } }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn on_text(&self, text: String) -> Option<Message> {
        let _ = self.tx.send(Event::Message(Message::Text(text))).await;
        None
    }

    async fn on_binary(&self, bytes: Vec<u8>) -> Option<Message> {
        let _ = self.tx.send(Event::Message(Message::Binary(bytes))).await;
        None
    }

    async fn on_pong(&self, _payload: Vec<u8>, latency: Option<u16>) {
        let _ = self.tx.send(Event::Pong(latency)).await;
    }

    async fn on_close(&self, reason: Option<CloseReason>) {
        let _ = self.tx.send(Event::Closed(reason)).await;
    }

    async fn on_error(&self, error: Error) {
        let _ = self.tx.send(Event::Error(error.to_string())).await;
    }
}
