use std::collections::HashMap;

use bytes::{Buf, BytesMut};

use crate::http::request::{Method, Request, find_header};

/// Largest body accepted, and the largest header block buffered while
/// waiting for the blank line.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    UnsupportedTransferEncoding,
    TooLarge,
}

/// An HTTP response received from a peer. RPC clients occasionally answer a
/// server-initiated call on the same socket.
#[derive(Debug, Clone)]
pub struct IncomingResponse {
    pub version: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl IncomingResponse {
    pub fn header(&self, key: &str) -> Option<&str> {
        find_header(&self.headers, key)
    }
}

#[derive(Debug, Clone)]
pub enum HttpMessage {
    Request(Request),
    Response(IncomingResponse),
}

enum StartLine {
    Request {
        method: Method,
        path: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
    },
}

struct Head {
    start: StartLine,
    headers: HashMap<String, String>,
    content_length: usize,
}

impl Head {
    fn into_message(self, body: Vec<u8>) -> HttpMessage {
        match self.start {
            StartLine::Request {
                method,
                path,
                version,
            } => HttpMessage::Request(Request {
                method,
                path,
                version,
                headers: self.headers,
                body,
            }),
            StartLine::Response { version, status } => HttpMessage::Response(IncomingResponse {
                version,
                status,
                headers: self.headers,
                body,
            }),
        }
    }
}

/// Incremental HTTP/1.x parser fed from a connection's read buffer.
///
/// The head is consumed from the buffer as soon as it is complete; the body is
/// taken once `Content-Length` bytes are available. After a message is
/// returned the parser is ready for the next one on the same connection.
#[derive(Default)]
pub struct HttpParser {
    pending: Option<Head>,
    /// Bytes of the buffer already searched for the end of the head.
    scanned: usize,
}

impl HttpParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a head has been consumed and the body is still outstanding.
    pub fn processing_started(&self) -> bool {
        self.pending.is_some()
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.scanned = 0;
    }

    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<Option<HttpMessage>, ParseError> {
        if self.pending.is_none() {
            let Some(headers_end) = find_headers_end(buf, self.scanned) else {
                if buf.len() > MAX_MESSAGE_SIZE {
                    return Err(ParseError::TooLarge);
                }
                self.scanned = buf.len();
                return Ok(None);
            };
            self.scanned = 0;
            let head = parse_head(&buf[..headers_end])?;
            buf.advance(headers_end + 4);
            self.pending = Some(head);
        }

        let needed = self
            .pending
            .as_ref()
            .map(|head| head.content_length)
            .unwrap_or(0);
        if buf.len() < needed {
            return Ok(None);
        }

        let body = buf.split_to(needed).to_vec();
        Ok(self.pending.take().map(|head| head.into_message(body)))
    }
}

fn parse_head(header_bytes: &[u8]) -> Result<Head, ParseError> {
    let headers_str = std::str::from_utf8(header_bytes).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");
    let first_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let start = parse_start_line(first_line)?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        headers.insert(key.trim().to_string(), value.trim().to_string());
    }

    if find_header(&headers, "Transfer-Encoding")
        .is_some_and(|v| !v.eq_ignore_ascii_case("identity"))
    {
        return Err(ParseError::UnsupportedTransferEncoding);
    }

    let content_length = find_header(&headers, "Content-Length")
        .map(|v| v.parse::<usize>().map_err(|_| ParseError::InvalidContentLength))
        .transpose()?
        .unwrap_or(0);
    if content_length > MAX_MESSAGE_SIZE {
        return Err(ParseError::TooLarge);
    }

    Ok(Head {
        start,
        headers,
        content_length,
    })
}

fn parse_start_line(line: &str) -> Result<StartLine, ParseError> {
    let mut parts = line.split_whitespace();
    let first = parts.next().ok_or(ParseError::InvalidRequest)?;

    if first.starts_with("HTTP/") {
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or(ParseError::InvalidRequest)?;
        return Ok(StartLine::Response {
            version: first.to_string(),
            status,
        });
    }

    let method = Method::from_str(first).ok_or(ParseError::InvalidMethod)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    Ok(StartLine::Request {
        method,
        path: path.to_string(),
        version: version.to_string(),
    })
}

/// Searches for the blank line, starting just before `from` so a terminator
/// split across two reads is still found.
fn find_headers_end(buf: &[u8], from: usize) -> Option<usize> {
    let start = from.saturating_sub(3).min(buf.len());
    buf[start..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| start + pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_terminator_split_across_reads() {
        let mut parser = HttpParser::new();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: example.com\r\n\r"[..]);
        assert!(parser.feed(&mut buf).unwrap().is_none());
        assert_eq!(parser.scanned, buf.len());

        buf.extend_from_slice(b"\n");
        let Some(HttpMessage::Request(req)) = parser.feed(&mut buf).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(req.header("host"), Some("example.com"));
        assert_eq!(parser.scanned, 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn search_resumes_where_it_stopped() {
        let buf = b"xxxx\r\n\r\nyyyy\r\n\r\n";
        assert_eq!(find_headers_end(buf, 0), Some(4));
        assert_eq!(find_headers_end(buf, 11), Some(12));
        assert_eq!(find_headers_end(buf, 100), None);
    }

    #[test]
    fn body_arrives_in_pieces() {
        let mut parser = HttpParser::new();
        let mut buf = BytesMut::from(&b"POST /RPC2 HTTP/1.1\r\nContent-Length: 6\r\n\r\nab"[..]);

        assert!(parser.feed(&mut buf).unwrap().is_none());
        assert!(parser.processing_started());

        buf.extend_from_slice(b"cdef");
        let Some(HttpMessage::Request(req)) = parser.feed(&mut buf).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(req.body, b"abcdef");
        assert!(!parser.processing_started());
        assert!(buf.is_empty());
    }
}
