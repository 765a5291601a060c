//! RPC values, faults and per-client metadata shared by every wire format.

pub mod binary;
pub mod codec;
pub mod dispatcher;
pub mod method;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use serde_json::Value;

pub use codec::{CodecError, JsonCodec, MethodCall, RpcCodec, RpcHeader};
pub use dispatcher::{Dispatcher, Outcome};
pub use method::RpcMethod;

/// Generic application failure, also used for undecodable packets.
pub const APPLICATION_ERROR: i32 = -32500;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const SERVER_STOPPED: i32 = 100_000;

/// An application error encoded into an RPC reply.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("RPC fault {code}: {message}")]
pub struct RpcFault {
    pub code: i32,
    pub message: String,
}

impl RpcFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(APPLICATION_ERROR, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Requested method {:?} not found.", method))
    }

    pub fn server_stopped() -> Self {
        Self::new(SERVER_STOPPED, "Server is stopped.")
    }
}

pub type RpcResult = Result<Value, RpcFault>;

/// Wire format a connection settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Unknown,
    Binary,
    Xml,
    Json,
    WebSocket,
}

/// Snapshot of a live connection, handed to RPC methods and to
/// [`crate::RpcServer::get_client_info`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: u64,
    pub address: String,
    pub port: u16,
    pub wire_format: WireFormat,
    /// Id taken from the WebSocket upgrade path, lower-cased.
    pub websocket_client_id: String,
    /// Set through the built-in `setClientType` call.
    pub addon: bool,
    /// Speaks the legacy binary RPC dialect.
    pub legacy: bool,
    pub websocket: bool,
    pub node_client: bool,
    /// Server-role WebSocket peers run JSON, keep-alive, new format and
    /// peer subscription from the start.
    pub init_json_mode: bool,
    pub init_keep_alive: bool,
    pub init_new_format: bool,
    pub init_subscribe_peers: bool,
}

/// One decoded call, alive for a single dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub method_name: String,
    pub params: Vec<Value>,
    /// JSON-RPC `id`, `null` for the other formats.
    pub message_id: Value,
    pub response_format: WireFormat,
}
