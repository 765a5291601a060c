//! Contracts for the subsystems the server hands work to.
//!
//! None of these are implemented here. The server is usable without any of
//! them: missing fallback answers "method not found", a missing web server
//! answers 400, a missing outbound client registry closes client-role
//! WebSocket connections.

use std::sync::Arc;

use bytes::BytesMut;

use crate::http::request::Request;
use crate::http::response::Response;
use crate::registry::{DescriptorRegistry, Handle};
use crate::rpc::{ClientInfo, RpcResult, Value};
use crate::transport::Transport;

/// Target for methods that are not registered locally.
pub trait RpcFallback: Send + Sync + 'static {
    fn call_rpc_method(&self, method: &str, params: Vec<Value>) -> RpcResult;
}

/// Serves GET/HEAD and non-RPC POST requests.
pub trait WebServer: Send + Sync + 'static {
    fn handle(&self, request: &Request, client: &ClientInfo) -> Response;
}

/// Takes over client-role WebSocket connections after the upgrade.
pub trait OutboundClients: Send + Sync + 'static {
    fn add_websocket_server(&self, connection: HandedOffConnection);
}

/// A live, upgraded connection whose ownership moves to the outbound client.
///
/// The registry entry stays live; the new owner closes it through `registry`
/// when done.
pub struct HandedOffConnection {
    pub transport: Transport,
    pub handle: Handle,
    pub registry: Arc<DescriptorRegistry>,
    pub client_id: String,
    pub address: String,
    pub port: u16,
    pub node_client: bool,
    /// Bytes already read past the upgrade request.
    pub pending: BytesMut,
}
