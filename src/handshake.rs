//! HTTP/1.1 upgrade negotiation, both directions.

use std::fmt::Write as _;

use base64::engine::{Engine, general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;

type Result<T> = std::result::Result<T, HandshakeError>;

pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Anything shorter cannot carry the five required headers.
const MIN_REQUEST_LEN: usize = 144;
const MIN_HEADERS_LEN: usize = 128;
/// Upper bound on the header block before the request is rejected.
pub const MAX_REQUEST_LEN: usize = 8 * 1024;

const HOST: u8 = 1 << 0;
const CONNECTION: u8 = 1 << 1;
const UPGRADE: u8 = 1 << 2;
const KEY: u8 = 1 << 3;
const VERSION: u8 = 1 << 4;
const REQUIRED: u8 = HOST | CONNECTION | UPGRADE | KEY | VERSION;

const REQUIRED_NAMES: [(u8, &str); 5] = [
    (HOST, "Host"),
    (CONNECTION, "Connection"),
    (UPGRADE, "Upgrade"),
    (KEY, "Sec-WebSocket-Key"),
    (VERSION, "Sec-WebSocket-Version"),
];

/// A parsed and validated client upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub method: String,
    /// Request target, path plus optional query.
    pub uri: String,
    /// Every header in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
    pub host: String,
    pub key: String,
    pub version: String,
    pub extensions: Option<String>,
    /// Offered subprotocols, in order of preference.
    pub protocols: Vec<String>,
}

impl Handshake {
    /// First header named `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> { find_header(&self.headers, name) }

    /// Request path without the query string.
    #[must_use]
    pub fn path(&self) -> &str { self.uri.split('?').next().unwrap_or_default() }

    /// The accept nonce to answer this request with.
    #[must_use]
    pub fn accept_key(&self) -> String { compute_accept_key(&self.key) }
}

/// The server's 101 response, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub headers: Vec<(String, String)>,
    pub protocol: Option<String>,
}

/// Index just past the `\r\n\r\n` that ends an HTTP header block.
#[must_use]
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

pub fn parse_request(bytes: &[u8]) -> Result<Handshake> {
    if bytes.len() < MIN_REQUEST_LEN {
        return Err(HandshakeError::RequestTooShort);
    }
    let line_end = bytes
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| HandshakeError::MalformedRequestLine(String::from_utf8_lossy(bytes).into()))?;
    if bytes.len() - (line_end + 2) < MIN_HEADERS_LEN {
        return Err(HandshakeError::RequestTooShort);
    }

    let text = std::str::from_utf8(bytes)
        .map_err(|_| HandshakeError::MalformedHeader("request is not valid UTF-8".into()))?;
    let (request_line, rest) = text.split_at(line_end);
    let (method, uri) = parse_request_line(request_line)?;

    let mut seen = 0u8;
    let mut handshake = Handshake {
        method,
        uri,
        headers: Vec::new(),
        host: String::new(),
        key: String::new(),
        version: String::new(),
        extensions: None,
        protocols: Vec::new(),
    };
    let mut connection = String::new();
    let mut upgrade = String::new();
    let mut terminated = false;

    for line in rest[2..].split("\r\n") {
        if line.is_empty() {
            terminated = true;
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::MalformedHeader(line.into()))?;
        let (name, value) = (name.trim(), value.trim());

        let slot = match name.to_ascii_lowercase().as_str() {
            "host" => Some((HOST, &mut handshake.host)),
            "connection" => Some((CONNECTION, &mut connection)),
            "upgrade" => Some((UPGRADE, &mut upgrade)),
            "sec-websocket-key" => Some((KEY, &mut handshake.key)),
            "sec-websocket-version" => Some((VERSION, &mut handshake.version)),
            "sec-websocket-extensions" => {
                let joined = match handshake.extensions.take() {
                    Some(prev) => format!("{prev}, {value}"),
                    None => value.to_string(),
                };
                handshake.extensions = Some(joined);
                None
            }
            "sec-websocket-protocol" => {
                handshake.protocols.extend(tokens(value).map(str::to_string));
                None
            }
            _ => None,
        };

        if let Some((bit, field)) = slot {
            if seen & bit != 0 {
                return Err(HandshakeError::DuplicateHeader(required_name(bit)));
            }
            seen |= bit;
            *field = value.to_string();
        }
        handshake.headers.push((name.to_string(), value.to_string()));
    }

    if !terminated {
        return Err(HandshakeError::MalformedHeader("header block not terminated".into()));
    }
    if seen != REQUIRED {
        let missing: Vec<&str> = REQUIRED_NAMES
            .iter()
            .filter(|(bit, _)| seen & bit == 0)
            .map(|(_, name)| *name)
            .collect();
        return Err(HandshakeError::MissingRequiredHeader(missing.join(", ")));
    }

    if !has_token(&connection, "upgrade") {
        return Err(HandshakeError::InvalidConnection(connection));
    }
    if !has_token(&upgrade, "websocket") {
        return Err(HandshakeError::InvalidUpgrade(upgrade));
    }
    if handshake.version != "13" {
        return Err(HandshakeError::UnsupportedVersion(handshake.version));
    }
    if handshake.key.len() != 24 {
        return Err(HandshakeError::InvalidKey(handshake.key));
    }

    tracing::debug!(uri = handshake.uri, host = handshake.host, "parsed upgrade request");
    Ok(handshake)
}

fn parse_request_line(line: &str) -> Result<(String, String)> {
    let mut parts = line.split_whitespace();
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeError::MalformedRequestLine(line.into()));
    };
    if method != "GET" {
        return Err(HandshakeError::InvalidMethod(method.into()));
    }
    if version != "HTTP/1.1" {
        return Err(HandshakeError::InvalidHttpVersion(version.into()));
    }
    Ok((method.into(), uri.into()))
}

fn required_name(bit: u8) -> &'static str {
    REQUIRED_NAMES
        .iter()
        .find(|(b, _)| *b == bit)
        .map_or("", |(_, name)| name)
}

fn tokens(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|t| !t.is_empty())
}

fn has_token(value: &str, token: &str) -> bool { tokens(value).any(|t| t.eq_ignore_ascii_case(token)) }

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// `base64(SHA-1(key + GUID))`
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// 16 random bytes, base64 encoded to 24 characters.
#[must_use]
pub fn generate_key() -> String {
    let mut key_bytes = [0u8; 16];
    rand::fill(&mut key_bytes);
    BASE64.encode(key_bytes)
}

#[must_use]
pub fn build_response(accept_key: &str, protocol: Option<&str>) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n"
    );
    if let Some(protocol) = protocol {
        let _ = write!(response, "Sec-WebSocket-Protocol: {protocol}\r\n");
    }
    response.push_str("\r\n");
    response
}

/// First protocol in the client's offer that the server accepts.
#[must_use]
pub fn select_protocol<'a>(offered: &'a [String], accepted: &[String]) -> Option<&'a str> {
    offered
        .iter()
        .find(|p| accepted.iter().any(|a| a.eq_ignore_ascii_case(p)))
        .map(String::as_str)
}

/// The 4xx (or 503) reply for a request that will not be upgraded.
#[must_use]
pub fn build_error_response(status: u16, reason: &str, body: &str) -> String {
    let mut response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Connection: close\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n",
        body.len()
    );
    if status == 426 {
        response.push_str("Sec-WebSocket-Version: 13\r\n");
    }
    response.push_str("\r\n");
    response.push_str(body);
    response
}

#[must_use]
pub fn build_rejection(err: &HandshakeError) -> String {
    let (status, reason) = err.status();
    build_error_response(status, reason, &err.to_string())
}

/// Client upgrade request for `resource` (path plus query) on `host`.
#[must_use]
pub fn build_request(
    host: &str,
    resource: &str,
    key: &str,
    protocols: &[String],
    extra_headers: &[(String, String)],
) -> String {
    let mut req = format!(
        "GET {resource} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         User-Agent: wust-engine/{}\r\n",
        env!("CARGO_PKG_VERSION")
    );
    if !protocols.is_empty() {
        let _ = write!(req, "Sec-WebSocket-Protocol: {}\r\n", protocols.join(", "));
    }
    for (name, value) in extra_headers {
        let _ = write!(req, "{name}: {value}\r\n");
    }
    req.push_str("\r\n");
    req
}

/// Validates the server's response head (everything up to and including the blank line)
/// against the key the request was sent with.
pub fn parse_response(head: &[u8], key: &str) -> Result<HandshakeResponse> {
    let text = std::str::from_utf8(head).map_err(|_| HandshakeError::MalformedResponse)?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();

    let mut status_parts = status_line.split_whitespace();
    if status_parts.next().is_none() || status_parts.next() != Some("101") {
        return Err(HandshakeError::StatusLine(status_line.into()));
    }

    // collect headers, stopping at the blank line
    let mut headers = Vec::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or(HandshakeError::MalformedResponse)?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    expect_token(&headers, "Upgrade", "websocket")?;
    expect_token(&headers, "Connection", "upgrade")?;

    // validate key was processed properly
    let expected_accept = compute_accept_key(key);
    match find_header(&headers, "Sec-WebSocket-Accept") {
        Some(x) if x == expected_accept => {}
        got => {
            return Err(HandshakeError::Header {
                field: "Sec-WebSocket-Accept",
                expected: expected_accept,
                got: got.map(str::to_string),
            });
        }
    }

    let protocol = find_header(&headers, "Sec-WebSocket-Protocol").map(str::to_string);
    Ok(HandshakeResponse { headers, protocol })
}

fn expect_token(headers: &[(String, String)], field: &'static str, expected: &str) -> Result<()> {
    match find_header(headers, field) {
        Some(v) if has_token(v, expected) => Ok(()),
        got => Err(HandshakeError::Header {
            field,
            expected: expected.into(),
            got: got.map(str::to_string),
        }),
    }
}
