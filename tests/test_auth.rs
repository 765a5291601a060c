use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rpcmux::auth::{AuthError, AuthGate, AuthType, Authenticator};
use rpcmux::http::request::{Method, RequestBuilder};
use rpcmux::rpc::RpcHeader;

struct Users;

impl Authenticator for Users {
    fn verify_password(&self, user: &str, password: &str) -> bool {
        user == "admin" && password == "secret"
    }

    fn verify_session(&self, token: &str) -> Option<String> {
        (token == "abc123").then(|| "admin".to_string())
    }
}

fn gate(auth_type: AuthType) -> AuthGate {
    AuthGate::new(auth_type, Some(Arc::new(Users)))
}

fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
}

#[test]
fn test_none_is_always_authorized() {
    let mut gate = AuthGate::new(AuthType::None, None);
    let request = RequestBuilder::new().method(Method::POST).path("/").build().unwrap();

    assert!(gate.is_authorized());
    assert!(gate.check_http(&request).is_ok());
    assert!(gate.check_binary(None).is_ok());
}

#[test]
fn test_http_basic_is_sticky() {
    let mut gate = gate(AuthType::Basic);
    let good = RequestBuilder::new()
        .method(Method::POST)
        .path("/")
        .header("Authorization", basic("admin", "secret"))
        .build()
        .unwrap();
    let bare = RequestBuilder::new().method(Method::POST).path("/").build().unwrap();

    assert_eq!(
        gate.check_http(&bare),
        Err(AuthError::MissingCredentials("authorization header"))
    );
    gate.check_http(&good).unwrap();
    assert_eq!(gate.user(), Some("admin"));
    assert!(gate.check_http(&bare).is_ok());
}

#[test]
fn test_http_basic_wrong_password() {
    let mut gate = gate(AuthType::Basic);
    let request = RequestBuilder::new()
        .method(Method::POST)
        .path("/")
        .header("Authorization", basic("admin", "guess"))
        .build()
        .unwrap();

    assert_eq!(
        gate.check_http(&request),
        Err(AuthError::InvalidCredentials("admin".into()))
    );
    assert!(!gate.is_authorized());
}

#[test]
fn test_http_session_cookie() {
    let mut gate = gate(AuthType::Session);
    let request = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .header("Cookie", "session=abc123")
        .build()
        .unwrap();
    let stale = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .header("Cookie", "session=old")
        .build()
        .unwrap();

    assert_eq!(gate.check_http(&stale), Err(AuthError::InvalidSession));
    gate.check_http(&request).unwrap();
    assert_eq!(gate.user(), Some("admin"));
}

#[test]
fn test_binary_checks_every_packet() {
    let gate = gate(AuthType::Basic);
    let header = RpcHeader {
        authorization: Some(basic("admin", "secret")),
    };

    assert!(gate.check_binary(Some(&header)).is_ok());
    assert!(!gate.is_authorized());
    assert!(gate.check_binary(None).is_err());
}

#[test]
fn test_websocket_password_login() {
    let mut gate = gate(AuthType::Basic);

    assert!(matches!(
        gate.check_websocket(b"not json"),
        Err(AuthError::Malformed(_))
    ));
    assert_eq!(
        gate.check_websocket(br#"{"user":"admin","password":"nope"}"#),
        Err(AuthError::InvalidCredentials("admin".into()))
    );
    gate.check_websocket(br#"{"user":"admin","password":"secret"}"#).unwrap();
    assert!(gate.is_authorized());
}

#[test]
fn test_websocket_session_owner_must_match() {
    let mut gate = gate(AuthType::Session);

    assert_eq!(
        gate.check_websocket(br#"{"user":"mallory","token":"abc123"}"#),
        Err(AuthError::InvalidSession)
    );
    gate.check_websocket(br#"{"user":"admin","token":"abc123"}"#).unwrap();
    assert_eq!(gate.user(), Some("admin"));
}

#[test]
fn test_missing_authenticator() {
    let mut gate = AuthGate::new(AuthType::Basic, None);
    assert_eq!(
        gate.check_websocket(br#"{"user":"admin","password":"secret"}"#),
        Err(AuthError::NoAuthenticator)
    );
}
