//! rpcmux - multi-protocol RPC socket server
//!
//! Serves the binary "Bin" protocol, XML-RPC and JSON-RPC over HTTP, and
//! JSON-RPC over WebSocket on a single listening port.

pub mod auth;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod tls;
pub mod transport;
pub mod websocket;

pub use config::ServerConfig;
pub use error::{ConnectionError, ServerError};
pub use registry::{DescriptorRegistry, Handle};
pub use rpc::{ClientInfo, RpcFault, RpcResult, Value};
pub use server::{RpcServer, RpcServerBuilder};
