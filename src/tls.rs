//! TLS material and the accept-time handshake.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::ServerConnection;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpStream;

use crate::config::TlsConfig;
use crate::error::{ConnectionError, ServerError};
use crate::transport::TlsStream;

/// Build the rustls server configuration from files or inline PEM.
///
/// Inline data wins over a file path when both are set. DH parameters are
/// accepted for compatibility and ignored: rustls only offers (EC)DHE groups
/// it manages itself.
pub fn build_server_config(cfg: &TlsConfig) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    let cert_pem = read_pem("certificate", cfg.cert_data.as_deref(), cfg.cert_file.as_deref())?;
    let key_pem = read_pem("private key", cfg.key_data.as_deref(), cfg.key_file.as_deref())?;

    if cfg.dh_param_data.is_some() || cfg.dh_param_file.is_some() {
        tracing::warn!("DH parameters are ignored, key exchange groups are negotiated by rustls");
    }

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("cannot parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(ServerError::Tls("no certificate found in PEM data".into()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| ServerError::Tls(format!("cannot parse private key: {}", e)))?
        .ok_or_else(|| ServerError::Tls("no private key found in PEM data".into()))?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

fn read_pem(
    what: &str,
    data: Option<&str>,
    file: Option<&std::path::Path>,
) -> Result<Vec<u8>, ServerError> {
    if let Some(data) = data {
        return Ok(data.as_bytes().to_vec());
    }
    let Some(path) = file else {
        return Err(ServerError::Tls(format!("no {} configured", what)));
    };
    std::fs::read(path)
        .map_err(|e| ServerError::Tls(format!("cannot read {} {}: {}", what, path.display(), e)))
}

/// Run the server side of the TLS handshake on a freshly accepted stream.
pub async fn handshake(
    stream: TcpStream,
    config: Arc<rustls::ServerConfig>,
    limit: Duration,
) -> Result<TlsStream, ConnectionError> {
    let session = ServerConnection::new(config)?;
    let mut tls = TlsStream::new(stream, Arc::new(Mutex::new(session)));

    match tokio::time::timeout(limit, tls.complete_handshake()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ConnectionError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "TLS handshake timed out",
            )));
        }
    }

    Ok(tls)
}
