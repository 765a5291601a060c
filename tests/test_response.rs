use rpcmux::http::response::{Response, ResponseBuilder, StatusCode};
use rpcmux::http::writer::serialize_response;

#[test]
fn test_status_code_as_u16() {
    assert_eq!(StatusCode::SwitchingProtocols.as_u16(), 101);
    assert_eq!(StatusCode::Ok.as_u16(), 200);
    assert_eq!(StatusCode::MovedPermanently.as_u16(), 301);
    assert_eq!(StatusCode::BadRequest.as_u16(), 400);
    assert_eq!(StatusCode::Unauthorized.as_u16(), 401);
    assert_eq!(StatusCode::NotFound.as_u16(), 404);
    assert_eq!(StatusCode::InternalServerError.as_u16(), 500);
}

#[test]
fn test_status_code_reason_phrase() {
    assert_eq!(StatusCode::SwitchingProtocols.reason_phrase(), "Switching Protocols");
    assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    assert_eq!(StatusCode::MovedPermanently.reason_phrase(), "Moved Permanently");
    assert_eq!(StatusCode::BadRequest.reason_phrase(), "Bad Request");
}

#[test]
fn test_response_builder_auto_content_length() {
    let body = b"This is the body".to_vec();
    let response = ResponseBuilder::new(StatusCode::Ok).body(body.clone()).build();

    assert_eq!(response.header("content-length"), Some("16"));
    assert_eq!(response.body, body);
}

#[test]
fn test_response_builder_preserves_custom_content_length() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Length", "999")
        .body(b"test".to_vec())
        .build();

    assert_eq!(response.header("Content-Length"), Some("999"));
    assert_eq!(response.headers.len(), 1);
}

#[test]
fn test_response_builder_replaces_duplicate_header() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", "text/plain")
        .header("content-type", "text/xml")
        .build();

    assert_eq!(response.headers.len(), 2);
    assert_eq!(response.header("Content-Type"), Some("text/xml"));
}

#[test]
fn test_switching_protocols_has_no_content_length() {
    let response = ResponseBuilder::new(StatusCode::SwitchingProtocols)
        .header("Upgrade", "websocket")
        .build();

    assert_eq!(response.header("Content-Length"), None);
}

#[test]
fn test_xml_rpc_reply_layout() {
    let response = Response::rpc("text/xml", b"<methodResponse/>", true);
    let bytes = serialize_response(&response);
    let body = "<?xml version=\"1.0\"?><methodResponse/>\r\n";

    let expected = format!(
        "HTTP/1.1 200 OK\r\nConnection: Keep-Alive\r\nContent-Type: text/xml\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    assert_eq!(String::from_utf8(bytes).unwrap(), expected);
}

#[test]
fn test_json_rpc_reply_has_no_prolog() {
    let response = Response::rpc("application/json", b"{}", false);

    assert_eq!(response.header("Connection"), Some("close"));
    assert_eq!(response.body, b"{}\r\n".to_vec());
}

#[test]
fn test_error_pages_close_the_connection() {
    for response in [Response::bad_request(), Response::not_found(), Response::internal_error()] {
        assert_eq!(response.header("Connection"), Some("close"));
        assert!(response.header("Content-Type").unwrap().starts_with("text/html"));
        let body = String::from_utf8(response.body.clone()).unwrap();
        assert!(body.contains(&response.status.as_u16().to_string()));
    }
}

#[test]
fn test_unauthorized_carries_realm() {
    let response = Response::unauthorized("rpcmux");

    assert_eq!(response.status, StatusCode::Unauthorized);
    assert_eq!(response.header("WWW-Authenticate"), Some("Basic realm=\"rpcmux\""));
}

#[test]
fn test_redirect_sets_location() {
    let response = Response::redirect("https://example.com/ui");

    assert_eq!(response.status, StatusCode::MovedPermanently);
    assert_eq!(response.header("Location"), Some("https://example.com/ui"));
    assert_eq!(response.header("Connection"), Some("close"));
}
