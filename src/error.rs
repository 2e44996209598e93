use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Close reason codes as specified in
/// [RFC 6455](https://www.rfc-editor.org/rfc/rfc6455.html#section-7.4)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Normal close
    Normal,
    /// Going away
    GoingAway,
    /// Websocket protocol violation
    ProtoError,
    /// Unsupported data type
    DataType,
    /// Invalid UTF-8 in Text message
    DataError,
    /// Generic policy violation
    Policy,
    /// Messages are too big
    TooBig,
    /// Expected extension was not negotiated, only ever sent by clients
    Extension,
    /// An unexpected condition that prevented the request from being fulfilled
    Unexpected,
    /// Registered (3000-3999) or private use (4000-4999) code, passed through untouched
    Application(u16),
}

impl CloseReason {
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtoError => 1002,
            Self::DataType => 1003,
            Self::DataError => 1007,
            Self::Policy => 1008,
            Self::TooBig => 1009,
            Self::Extension => 1010,
            Self::Unexpected => 1011,
            Self::Application(code) => code,
        }
    }

    /// Maps a code seen on the wire to a reason. Reserved codes (1004-1006, 1015) and anything
    /// outside the assigned ranges become [`CloseReason::ProtoError`].
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtoError,
            1003 => Self::DataType,
            1007 => Self::DataError,
            1008 => Self::Policy,
            1009 => Self::TooBig,
            1010 => Self::Extension,
            1011 => Self::Unexpected,
            3000..=4999 => Self::Application(code),
            _ => Self::ProtoError,
        }
    }

    /// Whether `code` may legally appear in a received Close frame.
    #[must_use]
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

/// Converts a reason code to bytes of the appropriate endianness.
impl From<CloseReason> for [u8; 2] {
    fn from(value: CloseReason) -> Self { value.code().to_be_bytes() }
}

impl From<[u8; 2]> for CloseReason {
    fn from(bytes: [u8; 2]) -> Self { Self::from_code(u16::from_be_bytes(bytes)) }
}

/// Crate level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure other than a deadline expiring.
    #[error("i/o error: {0}")]
    Io(#[source] io::Error),
    /// A read or write deadline expired. The operation may be retried.
    #[error("operation timed out")]
    Timeout,
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    /// The connection is no longer open.
    #[error("connection closed")]
    Closed,
    #[error("client is already connected")]
    AlreadyConnected,
}

impl Error {
    /// Deadline expiry is the only retryable failure.
    #[must_use]
    pub fn is_timeout(&self) -> bool { matches!(self, Self::Timeout) }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            _ => Self::Io(e),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self { Self::Timeout }
}

/// Errors that can occur while negotiating the HTTP upgrade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("request too short")]
    RequestTooShort,
    #[error("request exceeded {0} bytes without terminating")]
    RequestTooLarge(usize),
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),
    #[error("unsupported method {0:?}")]
    InvalidMethod(String),
    #[error("unsupported http version {0:?}")]
    InvalidHttpVersion(String),
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("header {0} appeared more than once")]
    DuplicateHeader(&'static str),
    #[error("missing required header(s): {0}")]
    MissingRequiredHeader(String),
    #[error("connection header does not request an upgrade: {0:?}")]
    InvalidConnection(String),
    #[error("upgrade header does not name websocket: {0:?}")]
    InvalidUpgrade(String),
    #[error("unsupported websocket version {0:?}")]
    UnsupportedVersion(String),
    #[error("sec-websocket-key must be 24 characters, got {0:?}")]
    InvalidKey(String),
    /// Server returned an unexpected HTTP status line.
    #[error("unexpected status line {0:?}")]
    StatusLine(String),
    /// A response header did not match expectations.
    #[error("header {field}: expected {expected:?}, got {got:?}")]
    Header {
        /// The name of the header field.
        field: &'static str,
        /// The expected value.
        expected: String,
        /// The actual value, if any.
        got: Option<String>,
    },
    /// The server's 101 response was not valid HTTP.
    #[error("malformed response")]
    MalformedResponse,
}

impl HandshakeError {
    /// HTTP status code and reason phrase to reject the request with.
    #[must_use]
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Self::InvalidMethod(_) => (405, "Method Not Allowed"),
            Self::UnsupportedVersion(_) => (426, "Upgrade Required"),
            Self::RequestTooLarge(_) => (431, "Request Header Fields Too Large"),
            _ => (400, "Bad Request"),
        }
    }
}

/// Frame level protocol violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    #[error("frame masking does not match the sender's role")]
    MaskDirection,
    #[error("control frame is fragmented")]
    FragmentedControl,
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(u64),
    #[error("close payload of a single byte")]
    ShortClosePayload,
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("invalid utf-8 in payload")]
    InvalidUtf8,
    #[error("payload of {0} bytes exceeds the configured limit")]
    TooLarge(u64),
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new message started before the previous one finished")]
    UnfinishedMessage,
}

impl FrameError {
    /// Status code to close the connection with.
    #[must_use]
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::InvalidUtf8 => CloseReason::DataError,
            Self::TooLarge(_) => CloseReason::TooBig,
            _ => CloseReason::ProtoError,
        }
    }
}
