//! Per-connection read loop.
//!
//! ```text
//!   ┌──────────┐  "Bin"            ┌────────┐
//!   │          │ ────────────────▶ │ Binary │ ──┐
//!   │          │  GET/HEAD/POST/   ├────────┤   │ complete message:
//!   │   Idle   │ ────────────────▶ │  Http  │ ──┤ auth, dispatch,
//!   │ (sniff)  │  HTTP/1.          ├────────┤   │ write reply,
//!   │          │  upgraded         │   WS   │ ──┤ back to Idle
//!   └──────────┘ ────────────────▶ └────────┘   │
//!        ▲──────────────────────────────────────┘
//! ```
//!
//! The loop ends on EOF, fatal I/O, a protocol or auth failure, the stop flag,
//! or when the connection's registry handle is no longer valid.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::BytesMut;
use tokio::time::timeout;

use crate::auth::{AuthGate, AuthType};
use crate::collaborators::HandedOffConnection;
use crate::error::ConnectionError;
use crate::http::parser::{HttpMessage, HttpParser, IncomingResponse, ParseError};
use crate::http::request::{Method, Request};
use crate::http::response::Response;
use crate::http::writer::serialize_response;
use crate::rpc::binary::{BinaryPacket, BinaryRpcFramer, SIGNATURE};
use crate::rpc::{Outcome, WireFormat};
use crate::server::Shared;
use crate::server::connection::ConnectionRecord;
use crate::transport::Transport;
use crate::websocket::frame::{self, Frame, FrameParser, Opcode};
use crate::websocket::upgrade::{self, Role, Upgrade};

const HTTP_SIGNATURES: [&[u8]; 4] = [b"GET ", b"HEAD ", b"POST", b"HTTP/1."];
const REALM: &str = "rpcmux";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Idle,
    Binary,
    Http,
    WebSocket,
}

#[derive(Debug, PartialEq, Eq)]
enum Sniff {
    Found(Framing),
    NeedMore,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
    /// The transport now belongs to the outbound client registry.
    HandOff,
}

type FlowResult = Result<Flow, ConnectionError>;

/// Classify the first unconsumed bytes of a message.
fn sniff(buf: &[u8], upgraded: bool) -> Sniff {
    if buf.starts_with(SIGNATURE) {
        return Sniff::Found(Framing::Binary);
    }
    if HTTP_SIGNATURES.iter().any(|&sig| buf.starts_with(sig)) {
        return Sniff::Found(Framing::Http);
    }
    if upgraded {
        return Sniff::Found(Framing::WebSocket);
    }
    let is_prefix = |sig: &[u8]| buf.len() < sig.len() && sig.starts_with(buf);
    if is_prefix(SIGNATURE) || HTTP_SIGNATURES.iter().any(|&sig| is_prefix(sig)) {
        Sniff::NeedMore
    } else {
        Sniff::Unknown
    }
}

pub(crate) async fn run(shared: Arc<Shared>, record: Arc<ConnectionRecord>, transport: Transport) {
    let mut reader = ConnectionReader::new(shared, record, transport);
    let result = reader.read_loop().await;
    reader.teardown(result).await;
}

struct ConnectionReader {
    shared: Arc<Shared>,
    record: Arc<ConnectionRecord>,
    /// `None` once handed off.
    transport: Option<Transport>,
    buffer: BytesMut,
    framing: Framing,
    binary: BinaryRpcFramer,
    http: HttpParser,
    websocket: FrameParser,
    upgraded: bool,
    close_sent: bool,
    awaiting_handoff: Option<Upgrade>,
    auth: Option<AuthGate>,
    websocket_auth: Option<AuthGate>,
}

impl ConnectionReader {
    fn new(shared: Arc<Shared>, record: Arc<ConnectionRecord>, transport: Transport) -> Self {
        Self {
            shared,
            record,
            transport: Some(transport),
            buffer: BytesMut::with_capacity(4096),
            framing: Framing::Idle,
            binary: BinaryRpcFramer::new(),
            http: HttpParser::new(),
            websocket: FrameParser::new(),
            upgraded: false,
            close_sent: false,
            awaiting_handoff: None,
            auth: None,
            websocket_auth: None,
        }
    }

    async fn read_loop(&mut self) -> FlowResult {
        let read_timeout = self.shared.config.timeouts.read();
        loop {
            if self.shared.stopped.load(Ordering::SeqCst)
                || !self.shared.registry.is_valid(&self.record.handle)
            {
                return Ok(Flow::Close);
            }
            let Some(transport) = self.transport.as_mut() else {
                return Ok(Flow::HandOff);
            };

            let n = match timeout(read_timeout, transport.read_buf(&mut self.buffer)).await {
                Err(_) => continue,
                Ok(Ok(0)) => return Err(ConnectionError::Closed),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
            };
            tracing::trace!(client_id = self.record.id, bytes = n, "Packet received");

            match self.process_buffer().await? {
                Flow::Continue => {}
                other => return Ok(other),
            }
        }
    }

    /// Handle every complete message in the buffer.
    async fn process_buffer(&mut self) -> FlowResult {
        while !self.buffer.is_empty() {
            if self.framing == Framing::Idle {
                match sniff(&self.buffer, self.upgraded) {
                    Sniff::Found(framing) => self.framing = framing,
                    Sniff::NeedMore => return Ok(Flow::Continue),
                    Sniff::Unknown => {
                        tracing::error!(
                            client_id = self.record.id,
                            packet = %String::from_utf8_lossy(&self.buffer),
                            "Uninterpretable packet received, closing connection"
                        );
                        return Ok(Flow::Close);
                    }
                }
            }

            let flow = match self.framing {
                Framing::Idle => Flow::Continue,
                Framing::Binary => match self.binary.feed(&mut self.buffer)? {
                    None => return Ok(Flow::Continue),
                    Some(packet) => {
                        self.framing = Framing::Idle;
                        self.handle_binary(packet).await?
                    }
                },
                Framing::Http => match self.http.feed(&mut self.buffer) {
                    Ok(None) => return Ok(Flow::Continue),
                    Ok(Some(message)) => {
                        self.framing = Framing::Idle;
                        self.handle_http(message).await?
                    }
                    Err(e) => return self.reject_http(e).await,
                },
                Framing::WebSocket => match self.websocket.feed(&mut self.buffer)? {
                    None => return Ok(Flow::Continue),
                    Some(frame) => {
                        self.framing = Framing::Idle;
                        self.handle_frame(frame).await?
                    }
                },
            };

            if flow != Flow::Continue {
                return Ok(flow);
            }
        }
        Ok(Flow::Continue)
    }

    async fn reject_http(&mut self, e: ParseError) -> FlowResult {
        match e {
            ParseError::TooLarge => tracing::error!(
                client_id = self.record.id,
                "HTTP request larger than 10 MiB rejected"
            ),
            other => tracing::error!(
                client_id = self.record.id,
                error = ?other,
                "Could not process HTTP packet"
            ),
        }
        self.http.reset();
        self.buffer.clear();
        self.framing = Framing::Idle;
        self.write(&serialize_response(&Response::bad_request())).await?;
        Ok(Flow::Close)
    }

    async fn handle_binary(&mut self, packet: BinaryPacket) -> FlowResult {
        if !self.shared.config.formats.binary_rpc {
            tracing::debug!(client_id = self.record.id, "Binary RPC disabled, packet ignored");
            return Ok(Flow::Continue);
        }
        let info = self.record.info();
        if packet.is_response {
            self.shared
                .dispatcher
                .log_response(&info, &packet.bytes, WireFormat::Binary);
            return Ok(Flow::Continue);
        }

        let auth_type = self.shared.config.auth_type;
        if auth_type != AuthType::None {
            let header = self.shared.dispatcher.binary_header(&info, &packet.bytes);
            let gate = self.auth_gate();
            gate.check_binary(header.as_ref())?;
            tracing::debug!(client_id = self.record.id, "Binary RPC packet authorized");
        }

        self.dispatch(&packet.bytes, WireFormat::Binary, true).await
    }

    async fn handle_http(&mut self, message: HttpMessage) -> FlowResult {
        match message {
            HttpMessage::Response(response) => {
                self.log_http_response(&response);
                Ok(Flow::Continue)
            }
            HttpMessage::Request(request) => self.handle_request(request).await,
        }
    }

    fn log_http_response(&self, response: &IncomingResponse) {
        let format = match response.header("Content-Type") {
            Some(ct) if ct.starts_with("application/json") => WireFormat::Json,
            _ => WireFormat::Xml,
        };
        self.shared
            .dispatcher
            .log_response(&self.record.info(), &response.body, format);
    }

    async fn handle_request(&mut self, request: Request) -> FlowResult {
        let config = &self.shared.config;

        // Upgrades come before HTTP auth; websocket auth runs after the upgrade.
        if config.formats.websocket && request.wants_upgrade() {
            return self.handle_upgrade(&request).await;
        }

        if config.auth_type != AuthType::None {
            let auth_type = config.auth_type;
            if let Err(e) = self.auth_gate().check_http(&request) {
                tracing::error!(
                    client_id = self.record.id,
                    host = request.header("Host").unwrap_or_default(),
                    error = %e,
                    "Authorization failed, closing connection"
                );
                if auth_type == AuthType::Basic {
                    let _ = self.write(&serialize_response(&Response::unauthorized(REALM))).await;
                }
                return Ok(Flow::Close);
            }
        }

        let keep_alive = request.keep_alive();
        match request.method {
            Method::GET | Method::HEAD => {
                if let Some(target) = self.shared.config.redirect_to.clone() {
                    self.write(&serialize_response(&Response::redirect(&target)))
                        .await?;
                    return Ok(Flow::Close);
                }
                self.serve_web(request, keep_alive).await
            }
            Method::POST => {
                let formats = self.shared.config.formats;
                let content_type = request.content_type();
                let format = if content_type == "application/json" || request.body.first() == Some(&b'{') {
                    WireFormat::Json
                } else {
                    WireFormat::Xml
                };
                let rpc_content = matches!(
                    content_type.as_str(),
                    "" | "text/xml" | "application/json"
                );
                let enabled = match format {
                    WireFormat::Json => formats.json_rpc,
                    _ => formats.xml_rpc,
                };
                if rpc_content && enabled && !request.body.is_empty() {
                    self.dispatch(&request.body, format, keep_alive).await
                } else {
                    self.serve_web(request, keep_alive).await
                }
            }
        }
    }

    async fn serve_web(&mut self, request: Request, keep_alive: bool) -> FlowResult {
        let Some(web_server) = self.shared.web_server.clone() else {
            self.write(&serialize_response(&Response::bad_request())).await?;
            return Ok(Flow::Close);
        };

        let info = self.record.info();
        let response = tokio::task::spawn_blocking(move || web_server.handle(&request, &info))
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Web server failed");
                Response::internal_error()
            });
        let closes = response
            .header("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"));

        self.write(&serialize_response(&response)).await?;
        Ok(if keep_alive && !closes { Flow::Continue } else { Flow::Close })
    }

    async fn handle_upgrade(&mut self, request: &Request) -> FlowResult {
        let upgrade = match upgrade::negotiate(request) {
            Ok(upgrade) => upgrade,
            Err(e) => {
                tracing::error!(client_id = self.record.id, error = %e, "WebSocket upgrade refused");
                return Ok(Flow::Close);
            }
        };

        self.write(&serialize_response(&upgrade.response())).await?;
        self.upgraded = true;
        self.record.update(|info| {
            info.wire_format = WireFormat::WebSocket;
            info.websocket = true;
            info.websocket_client_id = upgrade.client_id.clone();
            match upgrade.role {
                Role::Server => {
                    info.init_json_mode = true;
                    info.init_keep_alive = true;
                    info.init_new_format = true;
                    info.init_subscribe_peers = true;
                }
                Role::Client => info.node_client = upgrade.node,
            }
        });
        tracing::info!(
            client_id = self.record.id,
            websocket_client_id = %upgrade.client_id,
            role = ?upgrade.role,
            "Connection upgraded to WebSocket"
        );

        if upgrade.role == Role::Client {
            if self.shared.config.websocket_auth_type == AuthType::None {
                return self.hand_off(upgrade);
            }
            self.awaiting_handoff = Some(upgrade);
        }
        Ok(Flow::Continue)
    }

    async fn handle_frame(&mut self, frame: Frame) -> FlowResult {
        match frame.opcode {
            Opcode::Close => {
                self.write(&frame::encode(Opcode::Close, &frame.payload)?).await?;
                self.close_sent = true;
                Ok(Flow::Close)
            }
            Opcode::Ping => {
                self.write(&frame::encode(Opcode::Pong, &frame.payload)?).await?;
                Ok(Flow::Continue)
            }
            Opcode::Pong | Opcode::Continuation => Ok(Flow::Continue),
            Opcode::Text | Opcode::Binary => {
                if self.shared.config.websocket_auth_type != AuthType::None
                    && !self.websocket_gate().is_authorized()
                {
                    return self.authorize_websocket(&frame.payload).await;
                }
                self.dispatch(&frame.payload, WireFormat::WebSocket, true).await
            }
        }
    }

    async fn authorize_websocket(&mut self, payload: &[u8]) -> FlowResult {
        if let Err(e) = self.websocket_gate().check_websocket(payload) {
            tracing::error!(
                client_id = self.record.id,
                address = %self.record.info().address,
                error = %e,
                "WebSocket authentication failed, closing connection"
            );
            self.write(&frame::close_frame()?).await?;
            self.close_sent = true;
            return Ok(Flow::Close);
        }

        let user = self.websocket_gate().user().unwrap_or_default().to_string();
        tracing::info!(
            client_id = self.record.id,
            user = %user,
            "WebSocket client authorized"
        );
        match self.awaiting_handoff.take() {
            Some(upgrade) => self.hand_off(upgrade),
            None => Ok(Flow::Continue),
        }
    }

    fn hand_off(&mut self, upgrade: Upgrade) -> FlowResult {
        let Some(outbound) = self.shared.outbound.clone() else {
            tracing::error!(
                client_id = self.record.id,
                "No outbound client registry for client-role WebSocket, closing connection"
            );
            return Ok(Flow::Close);
        };
        let Some(transport) = self.transport.take() else {
            return Err(ConnectionError::HandOff("transport already released".into()));
        };

        let info = self.record.info();
        tracing::info!(
            client_id = self.record.id,
            websocket_client_id = %upgrade.client_id,
            "Transferring client to outbound RPC client"
        );
        outbound.add_websocket_server(HandedOffConnection {
            transport,
            handle: self.record.handle,
            registry: Arc::clone(&self.shared.registry),
            client_id: upgrade.client_id,
            address: info.address,
            port: info.port,
            node_client: upgrade.node,
            pending: std::mem::take(&mut self.buffer),
        });
        Ok(Flow::HandOff)
    }

    async fn dispatch(&mut self, packet: &[u8], format: WireFormat, keep_alive: bool) -> FlowResult {
        let mut info = self.record.info();
        let outcome = self
            .shared
            .dispatcher
            .dispatch(&mut info, packet, format, keep_alive)
            .await;
        self.record.update(|current| {
            current.addon = info.addon;
            current.wire_format = info.wire_format;
        });

        match outcome {
            Outcome::Reply(bytes) => {
                self.write(&bytes).await?;
                Ok(if keep_alive { Flow::Continue } else { Flow::Close })
            }
            Outcome::NoReply if keep_alive => Ok(Flow::Continue),
            Outcome::NoReply | Outcome::Close => Ok(Flow::Close),
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        match timeout(self.shared.config.timeouts.write(), transport.write_all(bytes)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write timed out",
            ))),
        }
    }

    fn auth_gate(&mut self) -> &mut AuthGate {
        let shared = &self.shared;
        self.auth.get_or_insert_with(|| {
            AuthGate::new(shared.config.auth_type, shared.authenticator.clone())
        })
    }

    fn websocket_gate(&mut self) -> &mut AuthGate {
        let shared = &self.shared;
        self.websocket_auth.get_or_insert_with(|| {
            AuthGate::new(shared.config.websocket_auth_type, shared.authenticator.clone())
        })
    }

    async fn teardown(mut self, result: FlowResult) {
        let id = self.record.id;
        match &result {
            Ok(Flow::HandOff) => {
                self.record.mark_closed();
                return;
            }
            Ok(_) => tracing::debug!(client_id = id, "Connection closed"),
            Err(e) if e.is_disconnect() => tracing::debug!(client_id = id, "Client disconnected"),
            Err(ConnectionError::Auth(e)) => {
                tracing::error!(client_id = id, error = %e, "Authorization failed, closing connection")
            }
            Err(e) => tracing::warn!(client_id = id, error = %e, "Closing connection"),
        }

        if self.upgraded && !self.close_sent && !matches!(result, Err(ConnectionError::Closed)) {
            if let Ok(close) = frame::close_frame() {
                let _ = self.write(&close).await;
            }
        }
        self.shared.registry.shutdown(&self.record.handle);
        if let Some(mut transport) = self.transport.take() {
            transport.finish().await;
        }
        self.record.mark_closed();
    }
}
