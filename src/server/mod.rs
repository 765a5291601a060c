//! The RPC server: acceptor, per-connection readers and their bookkeeping.
//!
//! ```text
//!   listener ──accept──▶ ConnectionRecord ──spawn──▶ reader
//!                              │                        │
//!                              │        closed flag ◀───┘
//!                              ▼
//!                       GarbageCollector (join + remove)
//! ```

pub mod connection;
pub mod gc;
pub mod listener;
pub(crate) mod reader;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::collaborators::{OutboundClients, RpcFallback, WebServer};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::registry::DescriptorRegistry;
use crate::rpc::dispatcher::{Codecs, Dispatcher};
use crate::rpc::{ClientInfo, RpcCodec, RpcMethod, RpcResult, Value};
use crate::tls;

use gc::{ConnectionMap, GarbageCollector};

const STOP_POLL: Duration = Duration::from_millis(100);

/// State shared by the acceptor and every reader task.
pub(crate) struct Shared {
    pub config: ServerConfig,
    pub registry: Arc<DescriptorRegistry>,
    pub connections: ConnectionMap,
    pub next_id: AtomicU64,
    pub dispatcher: Dispatcher,
    pub stopped: Arc<AtomicBool>,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub web_server: Option<Arc<dyn WebServer>>,
    pub outbound: Option<Arc<dyn OutboundClients>>,
    pub gc: GarbageCollector,
    pub local_addr: Mutex<Option<SocketAddr>>,
}

pub struct RpcServerBuilder {
    config: ServerConfig,
    codecs: Codecs,
    fallback: Option<Arc<dyn RpcFallback>>,
    outbound: Option<Arc<dyn OutboundClients>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    web_server: Option<Arc<dyn WebServer>>,
}

impl RpcServerBuilder {
    pub fn binary_codec(mut self, codec: Arc<dyn RpcCodec>) -> Self {
        self.codecs.binary = Some(codec);
        self
    }

    /// Codec for peers listed in `legacy_clients`.
    pub fn legacy_binary_codec(mut self, codec: Arc<dyn RpcCodec>) -> Self {
        self.codecs.legacy_binary = Some(codec);
        self
    }

    pub fn xml_codec(mut self, codec: Arc<dyn RpcCodec>) -> Self {
        self.codecs.xml = Some(codec);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn RpcFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn outbound_clients(mut self, outbound: Arc<dyn OutboundClients>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn web_server(mut self, web_server: Arc<dyn WebServer>) -> Self {
        self.web_server = Some(web_server);
        self
    }

    /// Validate the configuration and load TLS material, if any.
    pub fn build(self) -> Result<RpcServer> {
        self.config.validate()?;
        let tls = self
            .config
            .tls
            .as_ref()
            .map(tls::build_server_config)
            .transpose()?;

        let health = Arc::new(HealthMonitor::new());
        let stopped = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher::new(
            self.codecs,
            self.fallback,
            Arc::clone(&health),
            Arc::clone(&stopped),
        );

        Ok(RpcServer {
            shared: Arc::new(Shared {
                config: self.config,
                registry: Arc::new(DescriptorRegistry::new()),
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dispatcher,
                stopped,
                tls,
                authenticator: self.authenticator,
                web_server: self.web_server,
                outbound: self.outbound,
                gc: GarbageCollector::new(),
                local_addr: Mutex::new(None),
            }),
            health,
            acceptor: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }
}

pub struct RpcServer {
    shared: Arc<Shared>,
    health: Arc<HealthMonitor>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl RpcServer {
    pub fn builder(config: ServerConfig) -> RpcServerBuilder {
        RpcServerBuilder {
            config,
            codecs: Codecs::default(),
            fallback: None,
            outbound: None,
            authenticator: None,
            web_server: None,
        }
    }

    /// A server with no codecs or collaborators beyond the built-in JSON.
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Register a local method. Only allowed before [`start`](Self::start).
    pub fn register_method(&self, name: &str, method: impl RpcMethod) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }
        self.shared.dispatcher.register(name, Arc::new(method))
    }

    /// Bind and start accepting. A failed first bind is retried in the
    /// background every 5 seconds.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyStarted);
        }
        self.shared.stopped.store(false, Ordering::SeqCst);

        let listener = match listener::bind(&self.shared.config) {
            Ok(listener) => {
                *self.shared.local_addr.lock() = listener.local_addr().ok();
                Some(listener)
            }
            Err(e) => {
                tracing::error!(error = %e, "Could not bind listening socket, retrying in 5 seconds");
                None
            }
        };

        let task = tokio::spawn(listener::run(Arc::clone(&self.shared), listener));
        *self.acceptor.lock() = Some(task);
        Ok(())
    }

    /// Stop accepting, shut every connection down and wait until all reader
    /// tasks have been reclaimed.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping RPC server");
        self.shared.stopped.store(true, Ordering::SeqCst);

        let acceptor = self.acceptor.lock().take();
        if let Some(task) = acceptor {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Acceptor task ended abnormally");
            }
        }

        let handles: Vec<_> = self
            .shared
            .connections
            .lock()
            .values()
            .map(|record| record.handle)
            .collect();
        for handle in &handles {
            self.shared.registry.shutdown(handle);
        }

        loop {
            self.shared.gc.collect(&self.shared.connections).await;
            if self.shared.connections.lock().is_empty() {
                break;
            }
            tokio::time::sleep(STOP_POLL).await;
        }

        *self.shared.local_addr.lock() = None;
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("RPC server stopped");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// Connections that are open and not yet closed.
    pub fn connection_count(&self) -> usize {
        self.shared
            .connections
            .lock()
            .values()
            .filter(|record| !record.is_closed())
            .count()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn is_stalled(&self, max_age: Duration) -> bool {
        self.health.is_stalled(max_age)
    }

    /// Call a method directly, bypassing the sockets.
    pub async fn call_method(&self, name: &str, params: Vec<Value>) -> RpcResult {
        self.shared.dispatcher.call_method(name, params).await
    }

    /// Snapshot of every connection that is not closed, ordered by id.
    pub fn get_client_info(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .shared
            .connections
            .lock()
            .values()
            .filter(|record| !record.is_closed())
            .map(|record| record.info())
            .collect();
        clients.sort_by_key(|client| client.id);
        clients
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}
