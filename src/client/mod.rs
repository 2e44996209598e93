//! Asynchronous client engine.
//!
//! A [`WebSocketClient`] owns one connection. Once open, a read task dispatches incoming frames
//! to the [`MessageHandler`] and an optional keepalive task pings the server on an interval.
//! Writes from the caller, the read task and the keepalive task share one lock, so frames never
//! interleave on the wire.

mod handler;
mod inner;
mod recv_loop;
mod transport;

use std::{net::SocketAddr, sync::Arc};

pub use handler::{ChannelHandler, Event, MessageHandler, NoopHandler};
pub use inner::State;
use inner::{ClientInner, Origin, StateCell};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::oneshot,
    task::JoinHandle,
    time::{MissedTickBehavior, interval, timeout},
};
use transport::Target;

use crate::{
    CloseReason,
    config::ClientConfig,
    error::{Error, HandshakeError, Result},
    frames::{FrameCursor, Opcode},
    handshake::{self, MAX_REQUEST_LEN},
    protocol::Message,
};

pub struct WebSocketClient {
    config: ClientConfig,
    handler: Arc<dyn MessageHandler>,
    state: Arc<StateCell>,
    inner: Option<Arc<ClientInner>>,
}

impl WebSocketClient {
    /// Creates a disconnected client.
    pub fn new(config: ClientConfig, handler: impl MessageHandler + 'static) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            state: Arc::new(StateCell::new(State::Disconnected)),
            inner: None,
        }
    }

    /// Creates a client and connects it to `url`.
    ///
    /// # Errors
    /// See [`WebSocketClient::connect`].
    pub async fn open(
        url: &str,
        config: ClientConfig,
        handler: impl MessageHandler + 'static,
    ) -> Result<Self> {
        let mut client = Self::new(config, handler);
        client.connect(url).await?;
        Ok(client)
    }

    #[must_use]
    pub fn state(&self) -> State { self.state.load() }

    /// Connects to a `ws://` or `wss://` url and performs the opening handshake.
    ///
    /// On success the read and keepalive tasks are running and `on_open` has been called.
    ///
    /// # Errors
    /// Fails on an unparsable url, transport or TLS errors, and a rejected handshake. The
    /// client is left `Disconnected` and may try again.
    pub async fn connect(&mut self, url: &str) -> Result<()> {
        match self.state.load() {
            State::Disconnected | State::Closed => {}
            _ => return Err(Error::AlreadyConnected),
        }
        if let Some(old) = self.inner.take() {
            old.abort_tasks(Origin::User);
        }

        self.state.store(State::Connecting);
        match self.establish(url).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(url, error = %e, "connect failed");
                self.state.store(State::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&mut self, url: &str) -> Result<()> {
        let target = Target::parse(url)?;
        let conn = transport::open(&target, self.config.connect_timeout, self.config.tls.clone()).await?;
        let (mut reader, mut writer) = tokio::io::split(conn.stream);

        let key = handshake::generate_key();
        let request = handshake::build_request(
            &target.authority,
            &target.resource,
            &key,
            &self.config.protocols,
            &self.config.extra_headers,
        );
        timeout(self.config.write_timeout, writer.write_all(request.as_bytes())).await??;
        tracing::debug!(url, "sent upgrade request");

        let mut buf = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        let end = loop {
            if let Some(end) = handshake::find_header_end(&buf) {
                break end;
            }
            if buf.len() > MAX_REQUEST_LEN {
                return Err(HandshakeError::RequestTooLarge(MAX_REQUEST_LEN).into());
            }
            let n = timeout(self.config.connect_timeout, reader.read(&mut chunk)).await??;
            if n == 0 {
                return Err(HandshakeError::MalformedResponse.into());
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        let response = handshake::parse_response(&buf[..end], &key)?;

        let mut cursor = FrameCursor::new(self.config.max_frame_size);
        cursor.push_bytes(&buf[end..]);

        let inner = Arc::new(ClientInner::new(
            writer,
            Arc::clone(&self.state),
            Arc::clone(&self.handler),
            self.config.clone(),
            conn.local_addr,
            conn.peer_addr,
            response.protocol,
        ));
        self.state.store(State::Open);
        tracing::info!(url, local = %conn.local_addr, protocol = ?inner.protocol, "connected");
        inner.handler.on_open().await;

        let reader = tokio::spawn(recv_loop::recv_loop(Arc::clone(&inner), reader, cursor));
        let keepalive = self.config.keepalive.map(|period| keepalive(Arc::clone(&inner), period));
        inner.set_tasks(reader, keepalive);
        self.inner = Some(inner);
        Ok(())
    }

    fn open_inner(&self) -> Result<&Arc<ClientInner>> { self.inner.as_ref().ok_or(Error::Closed) }

    /// # Errors
    /// [`Error::Closed`] unless the connection is open, or the write error.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.open_inner()?.send(text.as_bytes(), Opcode::Text).await
    }

    /// # Errors
    /// [`Error::Closed`] unless the connection is open, or the write error.
    pub async fn send_binary(&self, bytes: &[u8]) -> Result<()> {
        self.open_inner()?.send(bytes, Opcode::Bin).await
    }

    /// # Errors
    /// [`Error::Closed`] unless the connection is open, or the write error.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.open_inner()?.send(msg.as_bytes(), msg.opcode()).await
    }

    /// Sends a Ping carrying a fresh nonce. The matching Pong updates [`WebSocketClient::latency`].
    ///
    /// # Errors
    /// [`Error::Closed`] unless the connection is open, or the write error.
    pub async fn ping(&self) -> Result<()> {
        if self.state.load() != State::Open {
            return Err(Error::Closed);
        }
        self.open_inner()?.ping().await
    }

    /// Average round trip of the last five answered pings, in milliseconds.
    #[must_use]
    pub fn latency(&self) -> Option<u16> { self.inner.as_ref()?.ping_stats.lock().average() }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.inner.as_ref().map(|i| i.local_addr) }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.inner.as_ref().map(|i| i.peer_addr) }

    /// Subprotocol the server selected, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> { self.inner.as_ref()?.protocol.as_deref() }

    /// Closes with 1000.
    ///
    /// # Errors
    /// See [`WebSocketClient::close_reason`].
    pub async fn close(&self) -> Result<()> { self.close_reason(CloseReason::Normal, "").await }

    /// Sends a Close frame and waits up to the close timeout for the server's reply, then shuts
    /// the transport down either way.
    ///
    /// # Errors
    /// [`Error::Closed`] if the connection is not open, or the error from writing the Close frame.
    pub async fn close_reason(&self, reason: CloseReason, text: &str) -> Result<()> {
        let inner = self.open_inner()?;
        if !self.state.transition(State::Open, State::Closing) {
            return Err(Error::Closed);
        }

        let (tx, rx) = oneshot::channel();
        *inner.close_tx.lock() = Some(tx);
        tracing::info!(reason = ?reason, "closing connection");

        if let Err(e) = inner.send_close(reason, text).await {
            inner.teardown(Some(reason), Origin::User).await;
            return Err(e);
        }

        let reply = match timeout(inner.config.close_timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!("no close reply before timeout");
                None
            }
        };
        inner.teardown(reply.or(Some(reason)), Origin::User).await;
        Ok(())
    }

    /// Tears the connection down immediately without a close handshake.
    pub async fn quit(&self) {
        if let Some(inner) = &self.inner {
            inner.teardown(None, Origin::User).await;
        }
    }
}

impl Drop for WebSocketClient {
    // best-effort close, needs a runtime to send it
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        if inner.state.load() == State::Open {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    inner.state.store(State::Closing);
                    let _ = inner.send_close(CloseReason::GoingAway, "").await;
                    inner.teardown(Some(CloseReason::GoingAway), Origin::User).await;
                });
                return;
            }
        }
        inner.abort_tasks(Origin::User);
    }
}

// Ping the server every `period` until the connection leaves the Open state
fn keepalive(inner: Arc<ClientInner>, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if inner.state.load() != State::Open {
                break;
            }
            tracing::trace!("keepalive ping");
            if let Err(e) = inner.ping().await {
                tracing::warn!(error = %e, "keepalive ping failed");
                inner.teardown(None, Origin::Keepalive).await;
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_disconnected() {
        let client = WebSocketClient::new(ClientConfig::default(), NoopHandler);
        assert_eq!(client.state(), State::Disconnected);
        assert!(matches!(client.send_text("hi").await, Err(Error::Closed)));
        assert!(matches!(client.close().await, Err(Error::Closed)));
        assert_eq!(client.latency(), None);
        assert_eq!(client.local_addr(), None);
    }

    #[tokio::test]
    async fn bad_url_leaves_client_disconnected() {
        let mut client = WebSocketClient::new(ClientConfig::default(), NoopHandler);
        let err = client.connect("http://localhost/").await.unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
        assert_eq!(client.state(), State::Disconnected);
    }
}
