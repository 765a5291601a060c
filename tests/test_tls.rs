use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertifiedKey, generate_simple_self_signed};
use rpcmux::config::TlsConfig;
use rpcmux::{ClientInfo, RpcResult, RpcServer, ServerConfig, Value};
use rustls::pki_types::{CertificateDer, ServerName};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

const WAIT: Duration = Duration::from_secs(5);

fn double(_: &ClientInfo, params: Vec<Value>) -> RpcResult {
    Ok(json!(params.first().and_then(Value::as_i64).unwrap_or(0) * 2))
}

/// A TLS server on a loopback port, plus the certificate clients should trust.
async fn tls_server() -> (RpcServer, CertificateDer<'static>) {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cfg = ServerConfig {
        listen_address: "127.0.0.1".to_string(),
        port: 0,
        tls: Some(TlsConfig {
            cert_data: Some(cert.pem()),
            key_data: Some(key_pair.serialize_pem()),
            ..TlsConfig::default()
        }),
        ..ServerConfig::default()
    };

    let server = RpcServer::new(cfg).unwrap();
    server.register_method("double", double).unwrap();
    server.start().await.unwrap();
    (server, cert.der().clone())
}

fn connector(trusted: CertificateDer<'static>) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(trusted).unwrap();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_tls_request_ends_with_close_notify() {
    let (server, cert) = tls_server().await;
    let tcp = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    let mut stream = connector(cert)
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();

    let body = r#"{"id":3,"method":"double","params":[21]}"#;
    let request = format!(
        "POST / HTTP/1.1\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // A clean end of stream is only reported after the peer's close-notify.
    let mut reply = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    let reply = String::from_utf8(reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\nConnection: close\r\n"));
    let (_, body) = reply.split_once("\r\n\r\n").unwrap();
    let body: Value = serde_json::from_str(body.trim_end()).unwrap();
    assert_eq!(body["result"], json!(42));

    assert!(server.registry().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_failed_handshake_discards_connection() {
    let (server, cert) = tls_server().await;

    let mut plain = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    plain
        .write_all(b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let mut sink = Vec::new();
    // The server may answer with an alert before closing.
    let _ = timeout(WAIT, plain.read_to_end(&mut sink)).await.unwrap();

    eventually("registry to drop the handle", || server.registry().is_empty()).await;
    assert!(server.get_client_info().is_empty());
    assert_eq!(server.connection_count(), 0);

    // The acceptor is unaffected.
    let tcp = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    let stream = connector(cert)
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    eventually("the TLS client to be published", || server.connection_count() == 1).await;
    assert_eq!(server.registry().len(), 1);
    drop(stream);

    server.stop().await;
    assert!(server.registry().is_empty());
}

#[test]
fn test_unusable_certificate_fails_construction() {
    let cfg = ServerConfig {
        tls: Some(TlsConfig {
            cert_data: Some("not a certificate".to_string()),
            key_data: Some("not a key".to_string()),
            ..TlsConfig::default()
        }),
        ..ServerConfig::default()
    };
    assert!(matches!(RpcServer::new(cfg), Err(rpcmux::ServerError::Tls(_))));
}
