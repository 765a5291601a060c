//! Method lookup, invocation and reply encoding.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::collaborators::RpcFallback;
use crate::error::ServerError;
use crate::health::{HealthMonitor, TickSource};
use crate::http::response::Response;
use crate::http::writer::serialize_response;
use crate::rpc::codec::{CodecError, JsonCodec, RpcCodec, RpcHeader};
use crate::rpc::method::RpcMethod;
use crate::rpc::{ClientInfo, PendingRequest, RpcFault, RpcResult, Value, WireFormat};
use crate::websocket::frame::{self, Opcode};

const SET_CLIENT_TYPE: &str = "setClientType";

/// Payload codecs by wire format. JSON is always available.
#[derive(Clone, Default)]
pub struct Codecs {
    pub binary: Option<Arc<dyn RpcCodec>>,
    pub legacy_binary: Option<Arc<dyn RpcCodec>>,
    pub xml: Option<Arc<dyn RpcCodec>>,
    pub json: JsonCodec,
}

/// What the reader should do after a packet was dispatched.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Bytes to write back, already framed for the wire format.
    Reply(Vec<u8>),
    NoReply,
    Close,
}

enum Decoded {
    Call(PendingRequest),
    Reject { message_id: Value, fault: RpcFault },
    Close,
}

pub struct Dispatcher {
    methods: RwLock<HashMap<String, Arc<dyn RpcMethod>>>,
    fallback: Option<Arc<dyn RpcFallback>>,
    codecs: Codecs,
    health: Arc<HealthMonitor>,
    stopped: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        codecs: Codecs,
        fallback: Option<Arc<dyn RpcFallback>>,
        health: Arc<HealthMonitor>,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            fallback,
            codecs,
            health,
            stopped,
        }
    }

    pub fn register(&self, name: &str, method: Arc<dyn RpcMethod>) -> Result<(), ServerError> {
        let mut methods = self.methods.write();
        if methods.contains_key(name) {
            return Err(ServerError::DuplicateMethod(name.to_string()));
        }
        methods.insert(name.to_string(), method);
        Ok(())
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    fn binary_codec(&self, legacy: bool) -> Option<&Arc<dyn RpcCodec>> {
        if legacy {
            self.codecs.legacy_binary.as_ref().or(self.codecs.binary.as_ref())
        } else {
            self.codecs.binary.as_ref()
        }
    }

    fn codec_for(&self, client: &ClientInfo, format: WireFormat) -> Result<&Arc<dyn RpcCodec>, CodecError> {
        match format {
            WireFormat::Binary => self
                .binary_codec(client.legacy)
                .ok_or(CodecError::Unavailable("binary RPC")),
            _ => self.codecs.xml.as_ref().ok_or(CodecError::Unavailable("XML-RPC")),
        }
    }

    /// Header block of a binary packet, for per-request authentication.
    pub fn binary_header(&self, client: &ClientInfo, packet: &[u8]) -> Option<RpcHeader> {
        self.binary_codec(client.legacy)?.decode_header(packet)
    }

    /// Decode, execute and encode one request packet.
    pub async fn dispatch(
        &self,
        client: &mut ClientInfo,
        packet: &[u8],
        format: WireFormat,
        keep_alive: bool,
    ) -> Outcome {
        if self.stopped.load(Ordering::SeqCst) {
            return Outcome::NoReply;
        }
        if client.wire_format == WireFormat::Unknown {
            client.wire_format = match format {
                WireFormat::WebSocket => WireFormat::Json,
                other => other,
            };
        }

        let request = match self.decode(client, packet, format) {
            Decoded::Call(request) => request,
            Decoded::Reject { message_id, fault } => {
                tracing::warn!(client_id = client.id, error = %fault, "Could not decode RPC packet");
                return self.reply(client, format, &message_id, &Err(fault), keep_alive);
            }
            Decoded::Close => return Outcome::Close,
        };

        if request.method_name == SET_CLIENT_TYPE {
            if request.params.first().and_then(Value::as_i64) == Some(1) {
                tracing::info!(client_id = client.id, "Client type set to add-on");
                client.addon = true;
            }
            return self.reply(client, format, &request.message_id, &Ok(Value::Null), keep_alive);
        }

        tracing::debug!(
            client_id = client.id,
            method = %request.method_name,
            format = ?format,
            "RPC method called"
        );
        let result = self
            .invoke(client, &request.method_name, request.params, TickSource::Dispatch)
            .await;
        self.reply(client, request.response_format, &request.message_id, &result, keep_alive)
    }

    fn decode(&self, client: &ClientInfo, packet: &[u8], format: WireFormat) -> Decoded {
        let reject = |message_id: Value, e: CodecError| Decoded::Reject {
            message_id,
            fault: RpcFault::application(e.to_string()),
        };

        match format {
            WireFormat::Json | WireFormat::WebSocket => {
                let request = match self.codecs.json.decode_request(packet) {
                    Ok(request) => request,
                    Err(e) => return reject(Value::Null, e),
                };
                if request.has_user {
                    tracing::warn!(
                        client_id = client.id,
                        "WebSocket auth packet received but auth is disabled for WebSockets, closing connection"
                    );
                    return Decoded::Close;
                }
                let Some(method_name) = request.method else {
                    return reject(request.id, CodecError::MissingMethod);
                };
                Decoded::Call(PendingRequest {
                    method_name,
                    params: request.params,
                    message_id: request.id,
                    response_format: format,
                })
            }
            WireFormat::Binary | WireFormat::Xml => {
                let call = self
                    .codec_for(client, format)
                    .and_then(|codec| codec.decode_request(packet));
                match call {
                    Ok(call) => Decoded::Call(PendingRequest {
                        method_name: call.method,
                        params: call.params,
                        message_id: Value::Null,
                        response_format: format,
                    }),
                    Err(e) => reject(Value::Null, e),
                }
            }
            WireFormat::Unknown => reject(Value::Null, CodecError::Malformed("unknown wire format".into())),
        }
    }

    /// Run a method: locally on the blocking pool, else through the fallback.
    pub async fn invoke(
        &self,
        client: &ClientInfo,
        name: &str,
        params: Vec<Value>,
        source: TickSource,
    ) -> RpcResult {
        let local = self.methods.read().get(name).cloned();

        let Some(method) = local else {
            let Some(fallback) = self.fallback.clone() else {
                return Err(RpcFault::method_not_found(name));
            };
            let name = name.to_string();
            return tokio::task::spawn_blocking(move || fallback.call_rpc_method(&name, params))
                .await
                .unwrap_or_else(|e| {
                    tracing::error!(error = %e, "RPC fallback failed");
                    Err(RpcFault::application("Unknown application error."))
                });
        };

        let _tick = self.health.track(source);
        let client = client.clone();
        match tokio::task::spawn_blocking(move || method.invoke(&client, params)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(fault)) => {
                tracing::warn!(method = %name, code = fault.code, error = %fault.message, "RPC method failed");
                Err(RpcFault::application(fault.message))
            }
            Err(e) => {
                tracing::error!(method = %name, error = %e, "RPC method failed");
                Err(RpcFault::application("Unknown application error."))
            }
        }
    }

    /// Direct entry point for other subsystems.
    pub async fn call_method(&self, name: &str, params: Vec<Value>) -> RpcResult {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RpcFault::server_stopped());
        }
        self.invoke(&ClientInfo::default(), name, params, TickSource::Direct)
            .await
    }

    fn reply(
        &self,
        client: &ClientInfo,
        format: WireFormat,
        message_id: &Value,
        result: &RpcResult,
        keep_alive: bool,
    ) -> Outcome {
        match self.encode(client, format, message_id, result, keep_alive) {
            Some(bytes) => Outcome::Reply(bytes),
            None => Outcome::NoReply,
        }
    }

    /// Frame a result for the wire format the request arrived in.
    pub fn encode(
        &self,
        client: &ClientInfo,
        format: WireFormat,
        message_id: &Value,
        result: &RpcResult,
        keep_alive: bool,
    ) -> Option<Vec<u8>> {
        match format {
            WireFormat::Binary => {
                let codec = self.binary_codec(client.legacy)?;
                Some(codec.encode_response(result))
            }
            WireFormat::Xml => {
                let response = match &self.codecs.xml {
                    Some(codec) => Response::rpc("text/xml", &codec.encode_response(result), keep_alive),
                    None => Response::bad_request(),
                };
                Some(serialize_response(&response))
            }
            WireFormat::Json => {
                let payload = self.codecs.json.encode_response(result, message_id);
                Some(serialize_response(&Response::rpc(
                    "application/json",
                    &payload,
                    keep_alive,
                )))
            }
            WireFormat::WebSocket => {
                let payload = self.codecs.json.encode_response(result, message_id);
                match frame::encode(Opcode::Text, &payload) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        tracing::error!(error = %e, "Could not frame WebSocket reply");
                        None
                    }
                }
            }
            WireFormat::Unknown => None,
        }
    }

    /// Decode and log a reply a peer sent on this connection.
    pub fn log_response(&self, client: &ClientInfo, packet: &[u8], format: WireFormat) {
        let decoded = match format {
            WireFormat::Json | WireFormat::WebSocket => self.codecs.json.decode_response(packet),
            other => self
                .codec_for(client, other)
                .and_then(|codec| codec.decode_response(packet)),
        };
        match decoded {
            Ok(result) => tracing::info!(client_id = client.id, response = ?result, "RPC response received"),
            Err(e) => tracing::warn!(client_id = client.id, error = %e, "Could not decode RPC response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Codecs::default(),
            None,
            Arc::new(HealthMonitor::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn reply_json(outcome: Outcome) -> Value {
        let Outcome::Reply(bytes) = outcome else {
            panic!("expected a reply, got {:?}", outcome);
        };
        let frame = &bytes[2..];
        serde_json::from_slice(frame).unwrap()
    }

    #[tokio::test]
    async fn set_client_type_marks_addon() {
        let d = dispatcher();
        let mut client = ClientInfo::default();
        let outcome = d
            .dispatch(
                &mut client,
                br#"{"id":1,"method":"setClientType","params":[1]}"#,
                WireFormat::WebSocket,
                true,
            )
            .await;
        assert!(client.addon);
        assert_eq!(reply_json(outcome)["result"], Value::Null);
    }

    #[tokio::test]
    async fn unknown_method_without_fallback() {
        let d = dispatcher();
        let mut client = ClientInfo::default();
        let outcome = d
            .dispatch(&mut client, br#"{"id":2,"method":"nope"}"#, WireFormat::WebSocket, true)
            .await;
        assert_eq!(reply_json(outcome)["error"]["code"], json!(-32601));
    }

    #[tokio::test]
    async fn user_key_closes_connection() {
        let d = dispatcher();
        let mut client = ClientInfo::default();
        let outcome = d
            .dispatch(&mut client, br#"{"user":"a","password":"b"}"#, WireFormat::WebSocket, true)
            .await;
        assert_eq!(outcome, Outcome::Close);
    }

    #[tokio::test]
    async fn xml_without_codec_is_rejected() {
        let d = dispatcher();
        let mut client = ClientInfo::default();
        let outcome = d
            .dispatch(&mut client, b"<methodCall/>", WireFormat::Xml, false)
            .await;
        let Outcome::Reply(bytes) = outcome else {
            panic!("expected a reply");
        };
        assert!(bytes.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(client.wire_format, WireFormat::Xml);
    }

    #[tokio::test]
    async fn local_method_is_ticked() {
        let health = Arc::new(HealthMonitor::new());
        let d = Dispatcher::new(
            Codecs::default(),
            None,
            Arc::clone(&health),
            Arc::new(AtomicBool::new(false)),
        );
        let sum = |_: &ClientInfo, params: Vec<Value>| -> RpcResult {
            Ok(json!(params.iter().filter_map(Value::as_i64).sum::<i64>()))
        };
        d.register("sum", Arc::new(sum)).unwrap();
        assert!(matches!(
            d.register("sum", Arc::new(sum)),
            Err(ServerError::DuplicateMethod(_))
        ));

        assert_eq!(d.call_method("sum", vec![json!(2), json!(5)]).await, Ok(json!(7)));
        let snapshot = health.snapshot();
        assert!(snapshot.direct.completed);
        assert!(snapshot.direct.timestamp_ms > 0);
    }

    #[tokio::test]
    async fn panicking_method_becomes_application_fault() {
        let d = dispatcher();
        let boom = |_: &ClientInfo, _: Vec<Value>| -> RpcResult { panic!("boom") };
        d.register("boom", Arc::new(boom)).unwrap();

        let fault = d.call_method("boom", vec![]).await.unwrap_err();
        assert_eq!(fault.code, crate::rpc::APPLICATION_ERROR);
    }

    #[tokio::test]
    async fn method_fault_is_reported_as_application_error() {
        let d = dispatcher();
        let fails = |_: &ClientInfo, _: Vec<Value>| -> RpcResult { Err(RpcFault::new(42, "disk full")) };
        d.register("fails", Arc::new(fails)).unwrap();

        let fault = d.call_method("fails", vec![]).await.unwrap_err();
        assert_eq!(fault, RpcFault::application("disk full"));

        let mut client = ClientInfo::default();
        let outcome = d
            .dispatch(&mut client, br#"{"id":9,"method":"fails"}"#, WireFormat::WebSocket, true)
            .await;
        assert_eq!(reply_json(outcome)["error"]["code"], json!(-32500));
    }

    #[tokio::test]
    async fn stopped_dispatcher_refuses_direct_calls() {
        let stopped = Arc::new(AtomicBool::new(true));
        let d = Dispatcher::new(
            Codecs::default(),
            None,
            Arc::new(HealthMonitor::new()),
            stopped,
        );

        let fault = d.call_method("anything", vec![]).await.unwrap_err();
        assert_eq!(fault, RpcFault::server_stopped());
    }
}
