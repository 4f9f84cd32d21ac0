//! Start-line plus headers, read from and written to the wire

use super::{decode_latin1, encode_latin1, HeaderFields};
use crate::error::{ProxyError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::warn;

/// Upper bound for the header section of a single message
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// A raw HTTP message head: start-line and header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub start_line: String,
    pub fields: HeaderFields,
}

#[derive(Default)]
struct HeadParser {
    start_line: Option<String>,
    fields: HeaderFields,
    raw: Vec<u8>,
}

impl HeadParser {
    /// Consume one line including its `\n`; yields the message at the blank line
    fn feed(&mut self, line: &[u8]) -> Option<HttpMessage> {
        self.raw.extend_from_slice(line);
        let text = trim_line_end(line);

        if self.start_line.is_none() {
            // some clients send a stray CRLF after a POST body
            if !text.is_empty() {
                self.start_line = Some(decode_latin1(text));
            }
            return None;
        }

        if text.is_empty() {
            return Some(HttpMessage {
                start_line: self.start_line.take().unwrap_or_default(),
                fields: std::mem::take(&mut self.fields),
            });
        }

        match split_field(text) {
            Some((name, value)) => self.fields.add(&decode_latin1(name), decode_latin1(value)),
            None => warn!("ignoring malformed header line: {}", decode_latin1(text)),
        }
        None
    }

    fn premature_end(&self) -> ProxyError {
        ProxyError::PrematureEnd(decode_latin1(&self.raw))
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn split_field(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&b| b == b':')?;
    if colon == 0 {
        return None;
    }
    let value = &line[colon + 1..];
    let skip = value
        .iter()
        .take_while(|&&b| b == b' ' || b == b'\t')
        .count();
    Some((&line[..colon], &value[skip..]))
}

impl HttpMessage {
    /// Read one message head from a buffered stream
    ///
    /// # Returns
    /// * `Err(ProxyError::PrematureEnd)` if the stream ends before the blank
    ///   line, carrying whatever was read
    /// * `Err(ProxyError::HeaderTooLarge)` past [`MAX_HEADER_BYTES`]
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        let mut parser = HeadParser::default();
        let mut line = Vec::new();
        loop {
            let remaining = MAX_HEADER_BYTES.saturating_sub(parser.raw.len());
            if remaining == 0 {
                return Err(ProxyError::HeaderTooLarge(MAX_HEADER_BYTES));
            }

            line.clear();
            let mut limited = (&mut *reader).take(remaining as u64);
            let n = limited.read_until(b'\n', &mut line).await?;
            if line.last() != Some(&b'\n') {
                parser.raw.extend_from_slice(&line);
                if n == remaining {
                    return Err(ProxyError::HeaderTooLarge(MAX_HEADER_BYTES));
                }
                return Err(parser.premature_end());
            }

            if let Some(message) = parser.feed(&line) {
                return Ok(message);
            }
        }
    }

    /// Parse a complete message head held in memory
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut parser = HeadParser::default();
        for line in bytes.split_inclusive(|&b| b == b'\n') {
            if line.last() != Some(&b'\n') {
                parser.raw.extend_from_slice(line);
                break;
            }
            if let Some(message) = parser.feed(line) {
                return Ok(message);
            }
        }
        Err(parser.premature_end())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = encode_latin1(&self.start_line);
        out.extend_from_slice(b"\r\n");
        self.fields.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Request head: `METHOD URI VERSION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    method: String,
    uri: String,
    version: String,
    fields: HeaderFields,
    keep_alive: Option<bool>,
}

impl RequestHeader {
    pub fn new(method: &str, uri: &str, version: &str) -> Self {
        RequestHeader {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
            fields: HeaderFields::new(),
            keep_alive: None,
        }
    }

    pub fn from_message(message: HttpMessage) -> Result<Self> {
        let mut parts = message.start_line.split(' ');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(uri), Some(version), None)
                if !method.is_empty() && !uri.is_empty() && version.starts_with("HTTP/") =>
            {
                Ok(RequestHeader {
                    method: method.to_string(),
                    uri: uri.to_string(),
                    version: version.to_string(),
                    fields: message.fields,
                    keep_alive: None,
                })
            }
            _ => Err(ProxyError::MalformedStartLine(message.start_line)),
        }
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        Self::from_message(HttpMessage::read_from(reader).await?)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Self::from_message(HttpMessage::parse(bytes)?)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: &str) {
        self.uri = uri.to_string();
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &HeaderFields {
        &self.fields
    }

    pub fn headers_mut(&mut self) -> &mut HeaderFields {
        &mut self.fields
    }

    pub fn start_line(&self) -> String {
        format!("{} {} {}", self.method, self.uri, self.version)
    }

    /// Whether the browser allows this connection to be reused
    ///
    /// HTTP/1.0 needs an explicit `keep-alive`; later versions persist
    /// unless `close` is sent. The answer is latched by
    /// [`strip_hop_by_hop`](Self::strip_hop_by_hop) before the
    /// `Connection` field disappears.
    pub fn client_can_keep_alive(&self) -> bool {
        if let Some(keep_alive) = self.keep_alive {
            return keep_alive;
        }
        let fields = &self.fields;
        let said = |token: &str| {
            fields.connection_has(token)
                || fields
                    .get("Proxy-Connection")
                    .is_some_and(|v| v.trim().eq_ignore_ascii_case(token))
        };
        if self.version == "HTTP/1.0" || self.version == "HTTP/0.9" {
            said("keep-alive")
        } else {
            !said("close")
        }
    }

    /// Remove hop-by-hop fields before the request is relayed
    pub fn strip_hop_by_hop(&mut self) {
        self.keep_alive = Some(self.client_can_keep_alive());
        self.fields.remove_hop_by_hop();
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        HttpMessage {
            start_line: self.start_line(),
            fields: self.fields.clone(),
        }
        .to_bytes()
    }
}

/// Response head: `VERSION STATUS REASON`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    version: String,
    status: u16,
    reason: String,
    fields: HeaderFields,
}

impl ResponseHeader {
    /// An `HTTP/1.1` response with no fields
    pub fn new(status: u16, reason: &str) -> Self {
        ResponseHeader {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason.to_string(),
            fields: HeaderFields::new(),
        }
    }

    pub fn from_message(message: HttpMessage) -> Result<Self> {
        let mut parts = message.start_line.splitn(3, ' ');
        let version = parts.next().filter(|v| v.starts_with("HTTP/"));
        let status = parts.next().and_then(|s| s.parse::<u16>().ok());
        match (version, status) {
            (Some(version), Some(status)) => Ok(ResponseHeader {
                version: version.to_string(),
                status,
                reason: parts.next().unwrap_or_default().to_string(),
                fields: message.fields,
            }),
            _ => Err(ProxyError::MalformedStartLine(message.start_line)),
        }
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin + ?Sized,
    {
        Self::from_message(HttpMessage::read_from(reader).await?)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Self::from_message(HttpMessage::parse(bytes)?)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_version(&mut self, version: &str) {
        self.version = version.to_string();
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn set_status(&mut self, status: u16, reason: &str) {
        self.status = status;
        self.reason = reason.to_string();
    }

    pub fn headers(&self) -> &HeaderFields {
        &self.fields
    }

    pub fn headers_mut(&mut self) -> &mut HeaderFields {
        &mut self.fields
    }

    pub fn start_line(&self) -> String {
        format!("{} {} {}", self.version, self.status, self.reason)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        HttpMessage {
            start_line: self.start_line(),
            fields: self.fields.clone(),
        }
        .to_bytes()
    }
}
