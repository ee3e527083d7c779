//! A single HTTP or HTTPS connection: socket establishment, TLS, tunnel
//! event bracketing, and disconnection.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::cancel::Cancellable;
use crate::dispatch::{Client, Dispatcher};
use crate::socket::{RemoteAddr, Socket, SocketEvent, SocketFactory};
use crate::status::Status;

/// Where in its lifecycle a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    /// The peer hung up while the connection was idle. Inferred lazily
    /// by [`Connection::state`].
    RemoteDisconnected,
    Disconnected,
}

/// Typed observer for connection lifecycle signals. The pool implements
/// this to learn when a socket is ready for its dispatcher and when the
/// dispatcher must be reclaimed.
pub trait ConnectionObserver: Send + Sync {
    fn event(&self, _event: SocketEvent) {}
    fn connected(&self, _socket: &Arc<dyn Socket>) {}
    fn disconnected(&self) {}
}

/// A shareable connection handle.
pub type ConnectionHandle = Arc<Mutex<Connection>>;

/// One client connection. Owns the socket it creates; the bound
/// dispatcher is an observer of it, never an owner.
pub struct Connection {
    factory: Arc<dyn SocketFactory>,
    socket: Option<Arc<dyn Socket>>,
    /// The server (or proxy) this connection dials.
    remote_addr: RemoteAddr,
    /// For CONNECT tunnels: the HTTPS origin on the far side of the
    /// proxy.
    tunnel_addr: Option<RemoteAddr>,
    via_proxy: bool,
    ssl: bool,
    ssl_fallback: bool,
    state: ConnectionState,
    observer: Option<Arc<dyn ConnectionObserver>>,
    dispatcher: Option<Weak<Mutex<Dispatcher<Client>>>>,
}

impl Connection {
    pub fn new(factory: Arc<dyn SocketFactory>, remote_addr: RemoteAddr) -> Connection {
        Connection {
            factory,
            socket: None,
            remote_addr,
            tunnel_addr: None,
            via_proxy: false,
            ssl: false,
            ssl_fallback: false,
            state: ConnectionState::New,
            observer: None,
            dispatcher: None,
        }
    }

    /// Marks this connection as tunneling to `addr` through its remote
    /// (which is then a proxy).
    pub fn set_tunnel_addr(&mut self, addr: RemoteAddr) {
        self.tunnel_addr = Some(addr);
    }

    pub fn tunnel_addr(&self) -> Option<&RemoteAddr> {
        self.tunnel_addr.as_ref()
    }

    pub fn set_via_proxy(&mut self, via_proxy: bool) {
        self.via_proxy = via_proxy;
    }

    pub fn is_via_proxy(&self) -> bool {
        self.via_proxy
    }

    /// Whether this connection speaks TLS to its destination.
    pub fn set_ssl(&mut self, ssl: bool) {
        self.ssl = ssl;
    }

    /// Set after a TLS-version-incompatible handshake failure; the
    /// caller is expected to retry with the legacy protocol.
    pub fn ssl_fallback(&self) -> bool {
        self.ssl_fallback
    }

    pub fn set_observer(&mut self, observer: Arc<dyn ConnectionObserver>) {
        self.observer = Some(observer);
    }

    pub(crate) fn bind_dispatcher(&mut self, dispatcher: Weak<Mutex<Dispatcher<Client>>>) {
        self.dispatcher = Some(dispatcher);
    }

    pub fn socket(&self) -> Option<Arc<dyn Socket>> {
        self.socket.clone()
    }

    fn emit(&self, event: SocketEvent) {
        trace!("connection event {:?}", event);
        if let Some(ref observer) = self.observer {
            observer.event(event);
        }
    }

    /// Creates the socket and performs the TCP connect, plus the TLS
    /// handshake right away when the scheme wants TLS and there is no
    /// tunnel to negotiate first. `Complete` is withheld until any
    /// tunnel-plus-TLS step has finished.
    ///
    /// Failures through a proxy come back proxified so callers can tell
    /// which hop failed.
    pub fn connect(&mut self, cancellable: &Cancellable) -> Status {
        if self.socket.is_some() {
            return Status::Malformed;
        }
        self.state = ConnectionState::Connecting;

        let socket = self.factory.new_socket(&self.remote_addr);
        self.socket = Some(socket.clone());

        self.emit(SocketEvent::Resolving);
        self.emit(SocketEvent::Resolved);
        self.emit(SocketEvent::Connecting);
        let mut status = socket.connect(cancellable);

        if status.is_successful() {
            self.emit(SocketEvent::Connected);
            if self.ssl && self.tunnel_addr.is_none() {
                if !socket.start_tls(&self.remote_addr.host) {
                    status = Status::SslFailed;
                } else {
                    self.emit(SocketEvent::TlsHandshaking);
                    status = socket.handshake(cancellable);
                    if status.is_successful() {
                        self.emit(SocketEvent::TlsHandshaked);
                    } else if status == Status::TlsFailed {
                        self.ssl_fallback = true;
                        status = Status::TryAgain;
                    }
                }
            }
        }

        if status.is_successful() {
            if !(self.ssl && self.tunnel_addr.is_some()) {
                self.emit(SocketEvent::Complete);
            }
            self.state = ConnectionState::Connected;
            if let Some(observer) = self.observer.clone() {
                observer.connected(&socket);
            }
        } else {
            debug!("connect to {} failed: {}", self.remote_addr, status);
            if let Some(socket) = self.socket.take() {
                socket.disconnect();
            }
        }

        if self.via_proxy {
            status = status.proxify();
        }
        status
    }

    /// Brackets the CONNECT request the session is about to drive
    /// through the bound dispatcher.
    pub fn tunnel_started(&mut self) {
        self.emit(SocketEvent::ProxyNegotiating);
    }

    /// The CONNECT roundtrip ended with `status`.
    pub fn tunnel_finished(&mut self, status: Status) {
        if status.is_successful() {
            self.emit(SocketEvent::ProxyNegotiated);
        }
    }

    /// Performs the TLS handshake on an already-connected socket, the
    /// post-CONNECT path. The server name is the tunnel destination if
    /// there is one, the remote otherwise.
    pub fn start_tls(&mut self, cancellable: &Cancellable) -> Status {
        let socket = match self.socket.clone() {
            Some(socket) => socket,
            None => return Status::SslFailed,
        };
        let server_name = self
            .tunnel_addr
            .as_ref()
            .unwrap_or(&self.remote_addr)
            .host
            .clone();
        if !socket.start_tls(&server_name) {
            return Status::SslFailed;
        }
        self.emit(SocketEvent::TlsHandshaking);
        let mut status = socket.handshake(cancellable);
        if status.is_successful() {
            self.emit(SocketEvent::TlsHandshaked);
            if self.tunnel_addr.is_some() {
                self.emit(SocketEvent::Complete);
            }
        } else if status == Status::TlsFailed {
            self.ssl_fallback = true;
            status = Status::TryAgain;
        }
        status
    }

    /// Disconnects the socket and notifies the observer, exactly once.
    pub fn disconnect(&mut self) {
        let was_connected = self.state != ConnectionState::Disconnected;
        if was_connected {
            self.state = ConnectionState::Disconnected;
        }
        if let Some(socket) = self.socket.take() {
            socket.disconnect();
        }
        if was_connected {
            if let Some(observer) = self.observer.clone() {
                observer.disconnected();
            }
        }
    }

    /// The connection state, with lazy remote-disconnect inference: a
    /// readable socket with nothing in flight means the peer hung up.
    pub fn state(&mut self) -> ConnectionState {
        if self.state == ConnectionState::Connected {
            let queue_empty = self
                .dispatcher
                .as_ref()
                .and_then(|weak| weak.upgrade())
                .map(|disp| {
                    disp.lock()
                        .map(|disp| disp.is_queue_empty())
                        .unwrap_or(true)
                })
                .unwrap_or(true);
            let pending = self
                .socket
                .as_ref()
                .map(|s| s.has_pending_input())
                .unwrap_or(false);
            if queue_empty && pending {
                self.state = ConnectionState::RemoteDisconnected;
            }
        }
        self.state
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("tunnel_addr", &self.tunnel_addr)
            .field("ssl", &self.ssl)
            .field("state", &self.state)
            .finish()
    }
}
