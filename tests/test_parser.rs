use bytes::BytesMut;
use rpcmux::http::parser::{HttpMessage, HttpParser, MAX_MESSAGE_SIZE, ParseError};
use rpcmux::http::request::{Method, Request};

/// Feeds `bytes` to a fresh parser and expects one complete request.
fn parse_request(bytes: &[u8]) -> (Request, BytesMut) {
    let mut buf = BytesMut::from(bytes);
    match HttpParser::new().feed(&mut buf) {
        Ok(Some(HttpMessage::Request(request))) => (request, buf),
        other => panic!("expected a request, got {:?}", other),
    }
}

fn parse_error(bytes: &[u8]) -> ParseError {
    let mut buf = BytesMut::from(bytes);
    HttpParser::new().feed(&mut buf).unwrap_err()
}

#[test]
fn test_parse_simple_get_request() {
    let (parsed, rest) = parse_request(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

    assert_eq!(parsed.method, Method::GET);
    assert_eq!(parsed.path, "/");
    assert_eq!(parsed.version, "HTTP/1.1");
    assert_eq!(parsed.header("host"), Some("example.com"));
    assert!(rest.is_empty());
}

#[test]
fn test_parse_xml_rpc_post() {
    let body = b"<methodCall><methodName>system.listMethods</methodName></methodCall>";
    let mut req = format!(
        "POST /RPC2 HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    req.extend_from_slice(body);

    let (parsed, rest) = parse_request(&req);
    assert_eq!(parsed.method, Method::POST);
    assert_eq!(parsed.path, "/RPC2");
    assert_eq!(parsed.content_type(), "text/xml");
    assert_eq!(parsed.body, body.to_vec());
    assert!(rest.is_empty());
}

#[test]
fn test_parse_incomplete_request_missing_blank_line() {
    let mut parser = HttpParser::new();
    let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: example.com\r\n"[..]);
    assert!(parser.feed(&mut buf).unwrap().is_none());
    assert!(!parser.processing_started());

    buf.extend_from_slice(b"\r\n");
    assert!(parser.feed(&mut buf).unwrap().is_some());
}

#[test]
fn test_parse_invalid_http_method() {
    assert_eq!(parse_error(b"INVALID / HTTP/1.1\r\n\r\n"), ParseError::InvalidMethod);
}

#[test]
fn test_parse_malformed_header() {
    assert_eq!(
        parse_error(b"GET / HTTP/1.1\r\nBrokenHeader\r\n\r\n"),
        ParseError::InvalidHeader
    );
}

#[test]
fn test_parse_invalid_content_length() {
    assert_eq!(
        parse_error(b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n"),
        ParseError::InvalidContentLength
    );
}

#[test]
fn test_chunked_encoding_rejected() {
    assert_eq!(
        parse_error(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"),
        ParseError::UnsupportedTransferEncoding
    );
}

#[test]
fn test_oversized_head_rejected() {
    let mut parser = HttpParser::new();
    let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nX-Filler: "[..]);
    assert!(parser.feed(&mut buf).unwrap().is_none());

    buf.extend_from_slice(&vec![b'a'; MAX_MESSAGE_SIZE]);
    assert_eq!(parser.feed(&mut buf).unwrap_err(), ParseError::TooLarge);
}

#[test]
fn test_oversized_body_rejected_before_buffering() {
    let req = format!(
        "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        MAX_MESSAGE_SIZE + 1
    );
    let mut buf = BytesMut::from(req.as_bytes());
    let mut parser = HttpParser::new();
    assert_eq!(parser.feed(&mut buf).unwrap_err(), ParseError::TooLarge);
}

#[test]
fn test_incremental_parser_waits_for_body() {
    let mut parser = HttpParser::new();
    let mut buf = BytesMut::from(&b"POST /RPC2 HTTP/1.0\r\nContent-Length: 5\r\n\r\nhe"[..]);

    assert!(parser.feed(&mut buf).unwrap().is_none());
    assert!(parser.processing_started());

    buf.extend_from_slice(b"lloGET");
    let message = parser.feed(&mut buf).unwrap().unwrap();
    let HttpMessage::Request(request) = message else {
        panic!("expected a request");
    };
    assert_eq!(request.body, b"hello".to_vec());
    assert!(!request.keep_alive());
    assert!(!parser.processing_started());
    assert_eq!(&buf[..], b"GET");
}

#[test]
fn test_incremental_parser_reads_responses() {
    let mut parser = HttpParser::new();
    let mut buf = BytesMut::from(
        &b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}"[..],
    );

    match parser.feed(&mut buf).unwrap() {
        Some(HttpMessage::Response(response)) => {
            assert_eq!(response.status, 200);
            assert_eq!(response.header("content-type"), Some("application/json"));
            assert_eq!(response.body, b"{}".to_vec());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(buf.is_empty());
}

#[test]
fn test_parse_request_with_binary_body() {
    let (parsed, _) = parse_request(b"POST /upload HTTP/1.1\r\nContent-Length: 4\r\n\r\n\x00\x01\x02\x03");
    assert_eq!(parsed.body, vec![0, 1, 2, 3]);
}
