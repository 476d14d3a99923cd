//! HTTP/1.1 upgrade handshake.
//!
//! The server reads the request head (up to the blank line), validates the
//! upgrade headers and answers `101 Switching Protocols` with the accept token.
//! Any bytes that arrived after the head belong to the WebSocket stream and are
//! handed to the frame decoder by the caller.

use base64::Engine;
use sha1::{Digest, Sha1};
use url::Url;

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Compute `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
pub fn compute_accept_token(sec_websocket_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sec_websocket_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Handshake errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Request line or a header line could not be parsed
    Malformed(String),
    /// Head exceeded the configured size before the blank line arrived
    HeadTooLarge(usize),
    /// `Upgrade: websocket` missing or different
    NotWebSocket,
    /// `Sec-WebSocket-Key` missing or empty
    MissingKey,
}

impl HandshakeError {
    /// HTTP status line used to refuse the request.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            HandshakeError::HeadTooLarge(_) => (431, "Request Header Fields Too Large"),
            _ => (400, "Bad Request"),
        }
    }
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::Malformed(e) => write!(f, "Malformed request head: {e}"),
            HandshakeError::HeadTooLarge(n) => write!(f, "Request head exceeds {n} bytes"),
            HandshakeError::NotWebSocket => write!(f, "Upgrade header is not websocket"),
            HandshakeError::MissingKey => write!(f, "Missing Sec-WebSocket-Key header"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Offset just past the `\r\n\r\n` that ends a request head.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a request head (request line + header lines, terminator optional).
    pub fn parse(raw: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| HandshakeError::Malformed("head is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HandshakeError::Malformed("empty request line".into()))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(HandshakeError::Malformed(format!("bad request line: {request_line}")));
        };
        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::Malformed(format!("bad HTTP version: {version}")));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HandshakeError::Malformed(format!("bad header line: {line}")))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            headers,
        })
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the client asked for a protocol upgrade at all.
    pub fn wants_upgrade(&self) -> bool {
        self.header("upgrade").is_some()
    }

    /// Declared body length (0 when absent or unparsable).
    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Request target resolved against a dummy origin.
    pub fn url(&self) -> Result<Url, HandshakeError> {
        let base = Url::parse("http://localhost/")
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        base.join(&self.target)
            .map_err(|e| HandshakeError::Malformed(format!("bad target {}: {e}", self.target)))
    }

    /// Validate the upgrade headers and return the accept token.
    pub fn accept_websocket(&self) -> Result<String, HandshakeError> {
        let is_websocket = self
            .header("upgrade")
            .map(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("websocket")))
            .unwrap_or(false);
        if !is_websocket {
            return Err(HandshakeError::NotWebSocket);
        }

        let key = self
            .header("sec-websocket-key")
            .filter(|k| !k.is_empty())
            .ok_or(HandshakeError::MissingKey)?;
        Ok(compute_accept_token(key))
    }
}

/// `101 Switching Protocols` response for an accepted upgrade.
pub fn switching_protocols_response(accept_token: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_token}\r\n\r\n"
    )
}

/// Bodyless status response that closes the connection.
pub fn status_response(code: u16, reason: &str) -> String {
    format!("HTTP/1.1 {code} {reason}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
}

/// JSON response that closes the connection.
pub fn json_response(code: u16, reason: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {code} {reason}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Normalise a path for suffix matching: trailing slashes removed.
pub fn path_matches(path: &str, suffix: &str) -> bool {
    let path = path.trim_end_matches('/');
    let suffix = suffix.trim_end_matches('/');
    !suffix.is_empty() && path.ends_with(suffix)
}
