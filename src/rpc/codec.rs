//! Payload codecs.
//!
//! The binary and XML-RPC grammars live outside this crate and plug in through
//! [`RpcCodec`]. JSON-RPC is built in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::rpc::{RpcFault, RpcResult};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("could not decode RPC packet: {0}")]
    Malformed(String),

    #[error("could not decode RPC packet. \"method\" not found in JSON.")]
    MissingMethod,

    #[error("no codec configured for {0}")]
    Unavailable(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub method: String,
    pub params: Vec<Value>,
}

/// Header block of a binary RPC packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcHeader {
    /// Raw `Authorization` value, e.g. `Basic dXNlcjpwYXNz`.
    pub authorization: Option<String>,
}

pub trait RpcCodec: Send + Sync {
    fn decode_request(&self, packet: &[u8]) -> Result<MethodCall, CodecError>;

    /// Decode a reply a peer sent to one of our calls.
    fn decode_response(&self, packet: &[u8]) -> Result<RpcResult, CodecError>;

    fn encode_response(&self, result: &RpcResult) -> Vec<u8>;

    fn decode_header(&self, _packet: &[u8]) -> Option<RpcHeader> {
        None
    }
}

/// A decoded JSON-RPC request object.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRequest {
    pub id: Value,
    pub method: Option<String>,
    pub params: Vec<Value>,
    /// The object carries a `user` key, i.e. it is an auth packet.
    pub has_user: bool,
}

#[derive(Serialize)]
struct Envelope<'a> {
    jsonrpc: &'static str,
    id: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RpcFault>,
}

#[derive(Deserialize)]
struct ReplyEnvelope {
    #[serde(default)]
    result: Value,
    error: Option<RpcFault>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn decode_request(&self, packet: &[u8]) -> Result<JsonRequest, CodecError> {
        let value: Value = serde_json::from_slice(packet)?;
        let Value::Object(object) = value else {
            return Err(CodecError::Malformed("JSON-RPC request is not an object".into()));
        };
        Ok(Self::request_from_object(object))
    }

    fn request_from_object(mut object: Map<String, Value>) -> JsonRequest {
        let params = match object.remove("params") {
            Some(Value::Array(params)) => params,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        };
        JsonRequest {
            id: object.remove("id").unwrap_or(Value::Null),
            method: object
                .get("method")
                .and_then(Value::as_str)
                .map(str::to_string),
            params,
            has_user: object.contains_key("user"),
        }
    }

    pub fn decode_response(&self, packet: &[u8]) -> Result<RpcResult, CodecError> {
        let reply: ReplyEnvelope = serde_json::from_slice(packet)?;
        Ok(match reply.error {
            Some(fault) => Err(fault),
            None => Ok(reply.result),
        })
    }

    pub fn encode_response(&self, result: &RpcResult, id: &Value) -> Vec<u8> {
        let envelope = Envelope {
            jsonrpc: "2.0",
            id,
            result: result.as_ref().ok(),
            error: result.as_ref().err(),
        };
        // Serializing a Value tree cannot fail.
        serde_json::to_vec(&envelope).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_request_fields() {
        let req = JsonCodec
            .decode_request(br#"{"jsonrpc":"2.0","id":7,"method":"ping","params":[1,"a"]}"#)
            .unwrap();
        assert_eq!(req.id, json!(7));
        assert_eq!(req.method.as_deref(), Some("ping"));
        assert_eq!(req.params, vec![json!(1), json!("a")]);
        assert!(!req.has_user);
    }

    #[test]
    fn missing_params_is_empty() {
        let req = JsonCodec.decode_request(br#"{"method":"listDevices"}"#).unwrap();
        assert!(req.params.is_empty());
        assert_eq!(req.id, Value::Null);
    }

    #[test]
    fn encodes_fault_envelope() {
        let out = JsonCodec.encode_response(&Err(RpcFault::application("boom")), &json!(3));
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["id"], json!(3));
        assert_eq!(v["error"]["code"], json!(-32500));
        assert!(v.get("result").is_none());
    }

    #[test]
    fn decodes_peer_reply() {
        let ok = JsonCodec.decode_response(br#"{"id":1,"result":true}"#).unwrap();
        assert_eq!(ok, Ok(json!(true)));
        let err = JsonCodec
            .decode_response(br#"{"id":1,"error":{"code":-1,"message":"x"}}"#)
            .unwrap();
        assert_eq!(err, Err(RpcFault::new(-1, "x")));
    }
}
