use std::{sync::Arc, time::Duration};

/// Outbound data frames are split at this size.
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 32 * 1024;
/// Largest inbound frame payload accepted before closing with 1009.
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
/// How long a graceful close waits for the peer's Close reply.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client engine settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Interval between keepalive pings, `None` disables them.
    pub keepalive: Option<Duration>,
    pub connect_timeout: Duration,
    /// Deadline for a single socket read. Expiry is not fatal, the read loop keeps waiting.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub close_timeout: Duration,
    pub max_frame_payload: usize,
    pub max_frame_size: u64,
    pub max_message_size: usize,
    /// Offered through `Sec-WebSocket-Protocol`.
    pub protocols: Vec<String>,
    pub extra_headers: Vec<(String, String)>,
    /// TLS settings for `wss://`. Defaults to the webpki root store.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keepalive: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            close_timeout: CLOSE_TIMEOUT,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            protocols: Vec::new(),
            extra_headers: Vec::new(),
            tls: None,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// How long [`close`](crate::WebSocketClient::close) waits for the server's reply.
    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Server engine settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interval between keepalive broadcasts, `None` disables them.
    pub keepalive: Option<Duration>,
    /// Deadline for reading the upgrade request.
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Threads performing upgrades.
    pub upgrade_workers: usize,
    /// Accepted sockets waiting for an upgrade worker. Beyond this, new sockets get a 503.
    pub upgrade_queue: usize,
    /// Upper bound on one wait of the readiness loop, so shutdown is noticed.
    pub poll_timeout: Duration,
    pub max_frame_payload: usize,
    pub max_frame_size: u64,
    pub max_message_size: usize,
    /// Subprotocols the server agrees to, first match against the client's offer wins.
    pub protocols: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            keepalive: Some(Duration::from_secs(30)),
            handshake_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            upgrade_workers: 4,
            upgrade_queue: 64,
            poll_timeout: Duration::from_millis(250),
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            protocols: Vec::new(),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    #[must_use]
    pub fn with_upgrade_workers(mut self, workers: usize) -> Self {
        self.upgrade_workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_upgrade_queue(mut self, queue: usize) -> Self {
        self.upgrade_queue = queue;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }
}
