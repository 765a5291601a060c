//! Per-connection byte streams and their registry-side control objects.
//!
//! A connection's reader owns the [`Transport`]. The descriptor registry owns
//! a [`SocketDescriptor`] (a duplicate of the socket) and, for TLS
//! connections, a [`SessionCloser`] sharing the rustls session. That lets the
//! registry shut a connection down from another task while the reader stays
//! the only writer on the wire.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use rustls::ServerConnection;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::registry::{Descriptor, RawDescriptor, TlsSession};

const TLS_CHUNK: usize = 16 * 1024;

pub enum Transport {
    Plain(TcpStream),
    Tls(TlsStream),
}

impl Transport {
    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(s) => &s.stream,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Registry-side TLS handle, if this is a TLS connection.
    pub fn session_closer(&self) -> Option<SessionCloser> {
        match self {
            Transport::Plain(_) => None,
            Transport::Tls(s) => Some(SessionCloser(Arc::clone(&s.session))),
        }
    }

    /// Append whatever is available to `buf`. Returns 0 once the peer closed.
    ///
    /// Cancel-safe: bytes are never lost when the future is dropped.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read_buf(buf).await,
            Transport::Tls(s) => s.read_buf(buf).await,
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Transport::Plain(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
            Transport::Tls(s) => s.write_all(data).await,
        }
    }

    /// Flush anything the TLS session still has queued, close-notify included.
    pub async fn finish(&mut self) {
        if let Transport::Tls(s) = self {
            if let Err(e) = s.flush_session().await {
                tracing::debug!(error = %e, "Could not flush TLS session on close");
            }
        }
    }
}

/// A TCP stream driven through a shared rustls session.
pub struct TlsStream {
    stream: TcpStream,
    session: Arc<Mutex<ServerConnection>>,
    outgoing: BytesMut,
}

impl TlsStream {
    pub(crate) fn new(stream: TcpStream, session: Arc<Mutex<ServerConnection>>) -> Self {
        Self {
            stream,
            session,
            outgoing: BytesMut::new(),
        }
    }

    pub(crate) async fn complete_handshake(&mut self) -> io::Result<()> {
        loop {
            let handshaking = {
                let mut session = self.session.lock();
                drain_tls(&mut session, &mut self.outgoing)?;
                session.is_handshaking()
            };
            self.flush_outgoing().await?;
            if !handshaking {
                return Ok(());
            }
            if self.read_tls_records().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during TLS handshake",
                ));
            }
        }
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        loop {
            {
                let mut session = self.session.lock();
                let mut chunk = [0u8; 4096];
                match session.reader().read(&mut chunk) {
                    Ok(0) => return Ok(0),
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        return Ok(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                    Err(e) => return Err(e),
                }
                drain_tls(&mut session, &mut self.outgoing)?;
            }

            self.flush_outgoing().await?;
            if self.read_tls_records().await? == 0 {
                return Ok(0);
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(TLS_CHUNK) {
            {
                let mut session = self.session.lock();
                session.writer().write_all(chunk)?;
                drain_tls(&mut session, &mut self.outgoing)?;
            }
            self.flush_outgoing().await?;
        }
        self.stream.flush().await
    }

    async fn flush_session(&mut self) -> io::Result<()> {
        {
            let mut session = self.session.lock();
            drain_tls(&mut session, &mut self.outgoing)?;
        }
        self.flush_outgoing().await
    }

    /// Read one batch of raw bytes and feed it to the session.
    async fn read_tls_records(&mut self) -> io::Result<usize> {
        let mut raw = [0u8; 4096];
        let n = self.stream.read(&mut raw).await?;
        if n == 0 {
            return Ok(0);
        }

        let mut session = self.session.lock();
        let mut pending = &raw[..n];
        while !pending.is_empty() {
            session.read_tls(&mut pending)?;
            if let Err(e) = session.process_new_packets() {
                // Send the alert before reporting the failure.
                let _ = drain_tls(&mut session, &mut self.outgoing);
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        }
        Ok(n)
    }

    /// Each `write_buf` call either writes and advances or does nothing, so
    /// dropping this future mid-way leaves `outgoing` consistent.
    async fn flush_outgoing(&mut self) -> io::Result<()> {
        while !self.outgoing.is_empty() {
            let n = self.stream.write_buf(&mut self.outgoing).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed while writing",
                ));
            }
        }
        Ok(())
    }
}

fn drain_tls(session: &mut ServerConnection, outgoing: &mut BytesMut) -> io::Result<()> {
    let mut writer = (&mut *outgoing).writer();
    while session.wants_write() {
        session.write_tls(&mut writer)?;
    }
    Ok(())
}

/// Registry-side view of a connection's socket.
///
/// Holds a duplicate of the descriptor so the registry can shut the
/// connection down while the reader owns the stream. Keyed by the original
/// descriptor number.
pub struct SocketDescriptor {
    raw: RawDescriptor,
    socket: socket2::Socket,
}

impl SocketDescriptor {
    pub fn new(stream: &TcpStream) -> io::Result<Self> {
        let socket = socket2::SockRef::from(stream).try_clone()?;
        Ok(Self {
            raw: raw_descriptor(stream),
            socket,
        })
    }
}

impl Descriptor for SocketDescriptor {
    fn raw(&self) -> RawDescriptor {
        self.raw
    }

    fn shutdown(&self) -> io::Result<()> {
        self.socket.shutdown(Shutdown::Read)
    }
}

#[cfg(unix)]
fn raw_descriptor(stream: &TcpStream) -> RawDescriptor {
    use std::os::fd::AsRawFd;
    stream.as_raw_fd() as RawDescriptor
}

#[cfg(windows)]
fn raw_descriptor(stream: &TcpStream) -> RawDescriptor {
    use std::os::windows::io::AsRawSocket;
    stream.as_raw_socket() as RawDescriptor
}

/// Registry-side handle on a connection's TLS session.
///
/// Close-notify is only queued here; the reader owning the stream flushes
/// it in [`Transport::finish`].
pub struct SessionCloser(Arc<Mutex<ServerConnection>>);

impl TlsSession for SessionCloser {
    fn close_notify(&mut self) {
        self.0.lock().send_close_notify();
    }
}
