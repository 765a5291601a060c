use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry::Handle;
use crate::rpc::ClientInfo;
use crate::server::Shared;
use crate::server::connection::ConnectionRecord;
use crate::server::reader;
use crate::tls;
use crate::transport::{SocketDescriptor, Transport};

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const BIND_RETRY: Duration = Duration::from_secs(5);

/// Bind the listening socket with `SO_REUSEADDR` and the configured backlog.
pub fn bind(cfg: &ServerConfig) -> Result<TcpListener, ServerError> {
    let address = cfg.listen_addr();
    let bind_err = |source: std::io::Error| ServerError::Bind {
        address: address.clone(),
        source,
    };

    let addr: SocketAddr = address
        .to_socket_addrs()
        .map_err(bind_err)?
        .next()
        .ok_or_else(|| ServerError::Config(format!("{} does not resolve", address)))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket
        .listen(cfg.backlog.min(i32::MAX as u32) as i32)
        .map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    TcpListener::from_std(socket.into()).map_err(bind_err)
}

/// Accept loop. Runs until the stop flag is set.
pub(crate) async fn run(shared: Arc<Shared>, listener: Option<TcpListener>) {
    let listener = match listener {
        Some(listener) => listener,
        None => match bind_with_retry(&shared).await {
            Some(listener) => listener,
            None => return,
        },
    };
    if let Ok(addr) = listener.local_addr() {
        *shared.local_addr.lock() = Some(addr);
        info!("RPC server listening on {}", addr);
    }

    while !shared.stopped.load(Ordering::SeqCst) {
        let (stream, peer) = match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
            Err(_) => {
                let count = shared.connections.lock().len();
                if shared.gc.due(count, shared.config.max_connections, true) {
                    shared.gc.collect(&shared.connections).await;
                }
                continue;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
            Ok(Ok(accepted)) => accepted,
        };

        admit(&shared, stream, peer).await;
    }
    info!("RPC server acceptor stopped");
}

async fn bind_with_retry(shared: &Shared) -> Option<TcpListener> {
    loop {
        match bind(&shared.config) {
            Ok(listener) => return Some(listener),
            Err(e) => error!(error = %e, "Could not bind listening socket, retrying in 5 seconds"),
        }
        let mut waited = Duration::ZERO;
        while waited < BIND_RETRY {
            if shared.stopped.load(Ordering::SeqCst) {
                return None;
            }
            tokio::time::sleep(ACCEPT_POLL).await;
            waited += ACCEPT_POLL;
        }
    }
}

async fn admit(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let max = shared.config.max_connections;
    if shared.connections.lock().len() >= max {
        shared.gc.collect(&shared.connections).await;
    }
    if shared.connections.lock().len() >= max {
        error!(peer = %peer, max, "Too many open connections, rejecting client");
        if let Ok(descriptor) = SocketDescriptor::new(&stream) {
            let handle = shared.registry.add(descriptor);
            shared.registry.shutdown(&handle);
        }
        return;
    }

    let descriptor = match SocketDescriptor::new(&stream) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Could not register client socket");
            return;
        }
    };
    let handle = shared.registry.add(descriptor);
    if handle.is_placeholder() {
        return;
    }

    let transport = match &shared.tls {
        None => Transport::Plain(stream),
        Some(config) => {
            match tls::handshake(stream, Arc::clone(config), shared.config.timeouts.handshake()).await {
                Ok(tls_stream) => {
                    let transport = Transport::Tls(tls_stream);
                    if let Some(closer) = transport.session_closer() {
                        shared.registry.attach_tls(&handle, closer);
                    }
                    transport
                }
                Err(e) => {
                    error!(peer = %peer, error = %e, "TLS handshake failed");
                    shared.registry.shutdown(&handle);
                    return;
                }
            }
        }
    };

    spawn_reader(shared, handle, peer, transport);

    let count = shared.connections.lock().len();
    if shared.gc.due(count, max, false) {
        shared.gc.collect(&shared.connections).await;
    }
}

fn spawn_reader(shared: &Arc<Shared>, handle: Handle, peer: SocketAddr, transport: Transport) {
    let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
    let address = peer.ip().to_string();
    let info = ClientInfo {
        id,
        legacy: shared.config.is_legacy_client(&address),
        address,
        port: peer.port(),
        ..ClientInfo::default()
    };
    let record = Arc::new(ConnectionRecord::new(id, handle, info));

    let mut connections = shared.connections.lock();
    let task = tokio::spawn(reader::run(
        Arc::clone(shared),
        Arc::clone(&record),
        transport,
    ));
    record.set_task(task);
    connections.insert(id, record);
    info!(client_id = id, peer = %peer, tls = shared.tls.is_some(), "Connection accepted");
}
