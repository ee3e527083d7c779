//! The transport seam: non-blocking sockets and their factories.
//!
//! The crate never performs byte-level I/O itself; everything goes
//! through [`Socket`]. Implementations wrap an OS socket (and its TLS
//! session, when there is one) behind interior mutability, the way file
//! descriptors already behave. Readiness is delivered from the outside:
//! when the embedder's event loop sees the socket become readable or
//! writable, it calls the matching method on the bound dispatcher.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::cancel::Cancellable;
use crate::status::Status;

/// Result of one non-blocking socket operation.
#[derive(Debug)]
pub enum IoStatus {
    /// Bytes were transferred.
    Ok(usize),
    /// The operation would block; retry on the matching readiness event.
    WouldBlock,
    /// The peer closed the stream.
    Eof,
    /// A hard transport error.
    Err(io::Error),
}

/// Events reported while a client connection is being established, in
/// the order they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    Resolving,
    Resolved,
    Connecting,
    Connected,
    ProxyNegotiating,
    ProxyNegotiated,
    TlsHandshaking,
    TlsHandshaked,
    /// The connection is fully usable, including any tunnel and TLS
    /// steps.
    Complete,
}

/// A non-blocking (or blocking, for synchronous sessions) transport
/// socket.
pub trait Socket: Send + Sync {
    /// Performs the TCP connect. Blocking implementations return the
    /// final status; the sentinels distinguish resolve and connect
    /// failures.
    fn connect(&self, cancellable: &Cancellable) -> Status;

    fn read(&self, buf: &mut [u8], cancellable: &Cancellable) -> IoStatus;

    /// Reads at most up to (and including) the first occurrence of
    /// `delim`, or until `buf` is full. The flag reports whether the
    /// delimiter was seen.
    fn read_until(
        &self,
        buf: &mut [u8],
        delim: &[u8],
        cancellable: &Cancellable,
    ) -> (IoStatus, bool);

    fn write(&self, buf: &[u8], cancellable: &Cancellable) -> IoStatus;

    /// Idempotent.
    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Whether unread bytes (or an unread EOF) are pending. Used to
    /// infer that an idle peer hung up.
    fn has_pending_input(&self) -> bool;

    /// Prepares a TLS session for `server_name`. The handshake itself is
    /// performed by [`Socket::handshake`].
    fn start_tls(&self, server_name: &str) -> bool;

    fn handshake(&self, cancellable: &Cancellable) -> Status;

    fn is_tls(&self) -> bool;
}

/// Builds unconnected sockets for a remote endpoint.
pub trait SocketFactory: Send + Sync {
    fn new_socket(&self, addr: &RemoteAddr) -> Arc<dyn Socket>;
}

/// The remote endpoint a socket should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr {
    pub host: String,
    pub port: u16,
}

impl RemoteAddr {
    pub fn new<H: Into<String>>(host: H, port: u16) -> RemoteAddr {
        RemoteAddr {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
