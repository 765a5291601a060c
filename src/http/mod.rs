//! HTTP/1.x plumbing for RPC traffic.
//!
//! - **`parser`**: incremental parser for requests and peer responses
//! - **`request`**: request representation and header helpers
//! - **`response`**: outgoing responses with a builder
//! - **`writer`**: serializes responses to bytes
//!
//! The per-connection loop that drives these lives in
//! `server::reader`, since an HTTP exchange is only one of the wire
//! formats a connection may speak.

pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
