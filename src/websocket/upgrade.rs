//! HTTP to WebSocket upgrade negotiation.
//!
//! The role of an upgraded connection comes from the `Sec-WebSocket-Protocol`
//! header or from the first path segment:
//!
//! | path / protocol          | role                                   |
//! |--------------------------|----------------------------------------|
//! | `server`, `nodeserver`   | served locally as JSON-RPC             |
//! | `client`, `nodeclient`   | handed off to the outbound RPC client  |
//!
//! The remainder of the path (or the whole path for `/<id>`) is the client id.

use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::http::request::Request;
use crate::http::response::{Response, ResponseBuilder, StatusCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The peer calls methods on us.
    Server,
    /// We call methods on the peer; the socket belongs to the outbound client.
    Client,
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upgrade {
    pub role: Role,
    /// `nodeserver`/`nodeclient` flavour.
    pub node: bool,
    /// Lower-cased; empty when the path carries none.
    pub client_id: String,
    /// Lower-cased protocol as requested, echoed back when present.
    pub protocol: Option<String>,
    pub accept_key: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UpgradeError {
    #[error("unsupported upgrade type {0:?}")]
    NotWebSocket(String),

    #[error("no websocket protocol specified")]
    MissingProtocol,

    #[error("no websocket key specified")]
    MissingKey,

    #[error("unknown websocket protocol {0:?}, known protocols are \"server\" and \"client\"")]
    UnknownProtocol(String),
}

/// Resolve role, client id and accept token for an upgrade request.
pub fn negotiate(request: &Request) -> Result<Upgrade, UpgradeError> {
    let upgrade = request.header("Upgrade").unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(UpgradeError::NotWebSocket(upgrade.to_string()));
    }

    let path = request.path.as_str();
    let header_protocol = request.header("Sec-WebSocket-Protocol");
    if header_protocol.is_none() && (path.is_empty() || path == "/") {
        return Err(UpgradeError::MissingProtocol);
    }
    let key = request
        .header("Sec-WebSocket-Key")
        .ok_or(UpgradeError::MissingKey)?;

    let protocol = header_protocol
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty());
    let (path_protocol, client_id) = split_path(path);

    let wants = |name: &str| protocol.as_deref() == Some(name) || path_protocol == Some(name);
    let (role, node) = if wants("server") {
        (Role::Server, false)
    } else if wants("nodeserver") {
        (Role::Server, true)
    } else if wants("client") {
        (Role::Client, false)
    } else if wants("nodeclient") {
        (Role::Client, true)
    } else {
        return Err(UpgradeError::UnknownProtocol(
            protocol.or(path_protocol.map(str::to_string)).unwrap_or_default(),
        ));
    };

    Ok(Upgrade {
        role,
        node,
        client_id,
        protocol,
        accept_key: derive_accept_key(key.trim().as_bytes()),
    })
}

/// Split a request path into an optional role segment and the client id.
fn split_path(path: &str) -> (Option<&'static str>, String) {
    const ROLES: [&str; 4] = ["server", "client", "nodeserver", "nodeclient"];

    let segment_end = path.get(1..).and_then(|rest| rest.find('/')).map(|i| i + 1);
    for role in ROLES {
        let end = role.len() + 1;
        let matches_len = path.len() == end || segment_end == Some(end);
        if matches_len && path.get(1..end) == Some(role) {
            let id = path.get(end + 1..).unwrap_or_default();
            return (Some(role), id.to_ascii_lowercase());
        }
    }

    let id = path.get(1..).unwrap_or_default();
    (None, id.to_ascii_lowercase())
}

impl Upgrade {
    /// The `101 Switching Protocols` reply.
    pub fn response(&self) -> Response {
        let mut builder = ResponseBuilder::new(StatusCode::SwitchingProtocols)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Accept", self.accept_key.clone());
        if let Some(protocol) = &self.protocol {
            builder = builder.header("Sec-WebSocket-Protocol", protocol.clone());
        }
        builder.build()
    }
}
