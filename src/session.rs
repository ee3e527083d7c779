//! A thin synchronous session driver over the pool.
//!
//! This is the blocking-I/O flavor: sockets handed out by the factory
//! are expected to block, so a message admitted to a dispatcher runs to
//! completion inline. The session adds the pieces the pool does not
//! know about: proxy routing, the CONNECT-plus-TLS tunnel dance for
//! https-via-proxy, waiting for a connection slot under the per-host
//! cap, and the one-shot re-queue of restartable messages.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use http::{Method, Uri};
use tracing::{debug, warn};

use crate::cancel::Cancellable;
use crate::connection::{Connection, ConnectionHandle};
use crate::dispatch::{DispatchEvent, Restart};
use crate::message::{Completion, Message, MessageId, MessageObserver, NullObserver};
use crate::pool::{DispatcherHandle, Origin, Pool, PoolObserver};
use crate::socket::{RemoteAddr, SocketFactory};
use crate::status::Status;

/// Resolves which proxy, if any, a request should go through.
pub trait ProxyResolver: Send + Sync {
    fn proxy_for(&self, msg: &Message) -> Option<Origin>;
}

struct SessionState {
    restarts: Vec<Restart>,
}

struct SessionShared {
    state: Mutex<SessionState>,
    cond: Condvar,
}

/// The session driver. Cheap to clone; clones share the pool and the
/// wait state.
#[derive(Clone)]
pub struct Session {
    pool: Pool,
    factory: Arc<dyn SocketFactory>,
    proxy_resolver: Option<Arc<dyn ProxyResolver>>,
    shared: Arc<SessionShared>,
}

struct SessionPoolObserver {
    shared: Arc<SessionShared>,
}

impl PoolObserver for SessionPoolObserver {
    fn message_restart(&self, restart: Restart) {
        debug!("message {:?} queued for restart", restart.msg.id());
        self.shared.state.lock().unwrap().restarts.push(restart);
        self.shared.cond.notify_all();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("pool", &self.pool).finish()
    }
}

impl Session {
    pub fn new(pool: Pool, factory: Arc<dyn SocketFactory>) -> Session {
        let shared = Arc::new(SessionShared {
            state: Mutex::new(SessionState {
                restarts: Vec::new(),
            }),
            cond: Condvar::new(),
        });
        pool.set_observer(Arc::new(SessionPoolObserver {
            shared: shared.clone(),
        }));
        Session {
            pool,
            factory,
            proxy_resolver: None,
            shared,
        }
    }

    pub fn set_proxy_resolver(&mut self, resolver: Arc<dyn ProxyResolver>) {
        self.proxy_resolver = Some(resolver);
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Wakes up every blocked `send`, so it can re-check its state.
    pub fn kick(&self) {
        self.shared.cond.notify_all();
    }

    pub fn send(&self, msg: Message, observer: Box<dyn MessageObserver>) -> (Message, Status) {
        self.send_with(msg, observer, Cancellable::new())
    }

    /// Sends one message and blocks until it completes, retrying once
    /// when the dispatcher reports it restartable.
    pub fn send_with(
        &self,
        msg: Message,
        observer: Box<dyn MessageObserver>,
        cancellable: Cancellable,
    ) -> (Message, Status) {
        let id = msg.id();
        let slot: Arc<Mutex<Option<(Message, Status)>>> = Arc::new(Mutex::new(None));

        let mut attempts = 0u32;
        let mut pending: Option<(Message, Box<dyn MessageObserver>, Completion)> = {
            let slot = slot.clone();
            let shared = self.shared.clone();
            Some((
                msg,
                observer,
                Box::new(move |msg: Message, status: Status| {
                    *slot.lock().unwrap() = Some((msg, status));
                    shared.cond.notify_all();
                }),
            ))
        };

        while let Some((msg, observer, completion)) = pending.take() {
            attempts += 1;
            if attempts > 2 {
                // Restarted once already; don't retry forever.
                return (msg, Status::IoError);
            }

            let origin = match Origin::from_uri(&msg.uri) {
                Some(origin) => origin,
                None => return (msg, Status::Malformed),
            };
            let proxy = self
                .proxy_resolver
                .as_ref()
                .and_then(|r| r.proxy_for(&msg));
            let via_https = origin.is_https();
            let via_proxy = proxy.is_some();

            let (disp, conn) =
                match self.acquire(&msg, &origin, proxy.as_ref(), via_https, via_proxy, &cancellable)
                {
                    Ok(pair) => pair,
                    Err(status) => return (msg, status),
                };

            disp.lock()
                .unwrap()
                .process_message(msg, cancellable.clone(), observer, completion);
            self.drive(&origin, &disp, &conn);

            loop {
                if let Some((msg, status)) = slot.lock().unwrap().take() {
                    return (msg, status);
                }
                if let Some(restart) = self.take_restart(id) {
                    pending = Some((restart.msg, restart.observer, restart.completion));
                    break;
                }
                if cancellable.is_cancelled() {
                    disp.lock().unwrap().cancel_message(id, Status::Cancelled);
                    self.drive(&origin, &disp, &conn);
                    continue;
                }
                // Paused, or completing on another thread.
                let guard = self.shared.state.lock().unwrap();
                let _guard = self
                    .shared
                    .cond
                    .wait_timeout(guard, Duration::from_millis(50))
                    .unwrap();
            }
        }

        unreachable!("send loop ended without a result")
    }

    /// Drains a dispatcher's events and routes them: restarts and
    /// pipelining trouble to the pool, socket closure to the bound
    /// connection. Never called with the dispatcher lock held.
    pub fn drive(&self, origin: &Origin, disp: &DispatcherHandle, conn: &Option<ConnectionHandle>) {
        let events = disp.lock().unwrap().take_events();
        let mut rest = Vec::new();
        let mut socket_closed = false;
        let mut idle_timeout = false;
        for event in events {
            match event {
                DispatchEvent::SocketClosed => socket_closed = true,
                DispatchEvent::IdleTimeout => idle_timeout = true,
                other => rest.push(other),
            }
        }
        self.pool.handle_events(origin, rest);
        if socket_closed || idle_timeout {
            let conn = conn
                .clone()
                .or_else(|| self.pool.connection_for(disp));
            if let Some(conn) = conn {
                conn.lock().unwrap().disconnect();
            }
        }
    }

    /// Readiness forwarding for embedders running non-blocking sockets:
    /// advance the dispatcher, then route whatever fell out.
    pub fn readable(&self, origin: &Origin, disp: &DispatcherHandle) {
        disp.lock().unwrap().readable();
        self.drive(origin, disp, &None);
    }

    pub fn writable(&self, origin: &Origin, disp: &DispatcherHandle) {
        disp.lock().unwrap().writable();
        self.drive(origin, disp, &None);
    }

    fn take_restart(&self, id: MessageId) -> Option<Restart> {
        let mut state = self.shared.state.lock().unwrap();
        let pos = state.restarts.iter().position(|r| r.msg.id() == id)?;
        Some(state.restarts.remove(pos))
    }

    /// Finds or opens a dispatcher for `msg`, waiting for a slot when
    /// the per-host cap (or the advisory global cap) is reached.
    fn acquire(
        &self,
        msg: &Message,
        origin: &Origin,
        proxy: Option<&Origin>,
        via_https: bool,
        via_proxy: bool,
        cancellable: &Cancellable,
    ) -> Result<(DispatcherHandle, Option<ConnectionHandle>), Status> {
        loop {
            if cancellable.is_cancelled() {
                return Err(Status::Cancelled);
            }
            if let Some(disp) = self.pool.get_dispatcher(msg, via_https, via_proxy) {
                let conn = self.pool.connection_for(&disp);
                return Ok((disp, conn));
            }
            let config = self.pool.config();
            if self.pool.host_dispatcher_count(origin) < config.max_dispatchers_per_host
                && self.pool.total_dispatchers() < config.max_dispatchers
            {
                return self
                    .open_connection(origin, proxy, via_https, cancellable)
                    .map(|(disp, conn)| (disp, Some(conn)));
            }
            let guard = self.shared.state.lock().unwrap();
            let _guard = self
                .shared
                .cond
                .wait_timeout(guard, Duration::from_millis(50))
                .unwrap();
        }
    }

    /// Opens a connection for `origin` (through `proxy` if given),
    /// allocating and wiring its dispatcher, and drives the CONNECT
    /// tunnel plus TLS handshake for https-via-proxy routes.
    fn open_connection(
        &self,
        origin: &Origin,
        proxy: Option<&Origin>,
        via_https: bool,
        cancellable: &Cancellable,
    ) -> Result<(DispatcherHandle, ConnectionHandle), Status> {
        let remote = match proxy {
            Some(proxy) => RemoteAddr::new(proxy.host.clone(), proxy.port),
            None => RemoteAddr::new(origin.host.clone(), origin.port),
        };
        let conn = Arc::new(Mutex::new(Connection::new(self.factory.clone(), remote)));
        {
            let mut c = conn.lock().unwrap();
            c.set_via_proxy(proxy.is_some());
            if via_https {
                c.set_ssl(true);
                if proxy.is_some() {
                    c.set_tunnel_addr(RemoteAddr::new(origin.host.clone(), origin.port));
                }
            }
        }

        // Requests through a CONNECT tunnel use the origin-form target,
        // so only a plain proxy route marks the dispatcher as proxied.
        let disp = self
            .pool
            .alloc_dispatcher(origin, &conn, proxy.is_some() && !via_https);

        let mut status = conn.lock().unwrap().connect(cancellable);
        if status == Status::TryAgain {
            // The TLS fallback is recorded on the connection; one retry.
            status = conn.lock().unwrap().connect(cancellable);
        }
        if !status.is_successful() {
            return Err(status);
        }

        if via_https && proxy.is_some() {
            let status = self.tunnel(origin, &conn, &disp, cancellable);
            if !status.is_successful() {
                warn!("tunnel to {} failed: {}", origin, status);
                conn.lock().unwrap().disconnect();
                return Err(status);
            }
        }

        Ok((disp, conn))
    }

    /// Issues the CONNECT roundtrip through the freshly bound
    /// dispatcher, then upgrades the socket to TLS.
    fn tunnel(
        &self,
        origin: &Origin,
        conn: &ConnectionHandle,
        disp: &DispatcherHandle,
        cancellable: &Cancellable,
    ) -> Status {
        conn.lock().unwrap().tunnel_started();

        let uri = format!("https://{}:{}/", origin.host, origin.port);
        let uri: Uri = match uri.parse() {
            Ok(uri) => uri,
            Err(_) => return Status::Malformed,
        };
        let connect_msg = Message::new(Method::CONNECT, uri);

        let slot: Arc<Mutex<Option<Status>>> = Arc::new(Mutex::new(None));
        let completion = {
            let slot = slot.clone();
            Box::new(move |_msg: Message, status: Status| {
                *slot.lock().unwrap() = Some(status);
            })
        };
        disp.lock().unwrap().process_message(
            connect_msg,
            cancellable.clone(),
            Box::new(NullObserver),
            completion,
        );
        self.drive(origin, disp, &Some(conn.clone()));

        let status = slot.lock().unwrap().take().unwrap_or(Status::IoError);
        conn.lock().unwrap().tunnel_finished(status);
        if !status.is_successful() {
            return status;
        }
        conn.lock().unwrap().start_tls(cancellable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{EventLog, MockFactory, MockSocket};
    use crate::pool::PoolConfig;
    use crate::socket::Socket;

    fn session_with(factory: Arc<MockFactory>) -> Session {
        Session::new(Pool::new(PoolConfig::default()), factory)
    }

    #[test]
    fn blocking_get_roundtrip() {
        let _ = pretty_env_logger::try_init();
        let factory = MockFactory::new();
        let socket = MockSocket::new();
        socket.read_data(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        factory.push(socket.clone());

        let session = session_with(factory);
        let log = EventLog::new();
        let msg = Message::new(Method::GET, "http://example.com/".parse().unwrap());
        let (msg, status) = session.send(msg, log.observer());

        assert_eq!(status, Status::OK);
        assert_eq!(&msg.response_body.flatten()[..], b"hello");
        let written = socket.written();
        assert!(written.starts_with(b"GET / HTTP/1.1\r\nHost: example.com\r\n"));
        assert_eq!(
            log.events(),
            vec!["wrote_headers", "wrote_body", "got_headers", "got_chunk", "got_body", "finished"]
        );
        // Keep-alive: the connection survives the exchange.
        assert!(socket.is_connected());
        assert_eq!(session.pool().total_dispatchers(), 1);
    }

    #[test]
    fn close_response_disconnects_and_reclaims() {
        let factory = MockFactory::new();
        let socket = MockSocket::new();
        socket.read_data(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
        factory.push(socket.clone());

        let session = session_with(factory);
        let msg = Message::new(Method::GET, "http://example.com/".parse().unwrap());
        let (_msg, status) = session.send(msg, Box::new(crate::message::NullObserver));

        assert_eq!(status, Status::OK);
        assert!(!socket.is_connected());
        assert_eq!(session.pool().total_dispatchers(), 0);
        assert_eq!(session.pool().idle_count(), 1);
    }

    #[test]
    fn https_via_proxy_tunnels_then_sends() {
        let _ = pretty_env_logger::try_init();
        let factory = MockFactory::new();
        let socket = MockSocket::new();
        // CONNECT response, then the real response after the TLS
        // upgrade.
        socket.read_data(b"HTTP/1.1 200 Connection established\r\n\r\n");
        socket.read_data(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        factory.push(socket.clone());

        struct Always(Origin);
        impl ProxyResolver for Always {
            fn proxy_for(&self, _msg: &Message) -> Option<Origin> {
                Some(self.0.clone())
            }
        }

        let mut session = session_with(factory);
        session.set_proxy_resolver(Arc::new(Always(Origin::new("http", "proxy.test", 3128))));

        let msg = Message::new(Method::GET, "https://origin.test/".parse().unwrap());
        let (_msg, status) = session.send(msg, Box::new(crate::message::NullObserver));

        assert_eq!(status, Status::OK);
        assert!(socket.is_tls());
        assert_eq!(socket.tls_server_name().as_deref(), Some("origin.test"));
        let written = socket.written();
        assert!(written.starts_with(b"CONNECT origin.test:443 HTTP/1.1\r\n"));
        // The real request goes origin-form over the tunnel, not
        // absolute-form.
        let tail = &written[written.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4..];
        assert!(tail.starts_with(b"GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn connect_failure_propagates_proxified() {
        let factory = MockFactory::new();
        let socket = MockSocket::new();
        socket.fail_connect(Status::CantConnect);
        factory.push(socket);

        struct Always(Origin);
        impl ProxyResolver for Always {
            fn proxy_for(&self, _msg: &Message) -> Option<Origin> {
                Some(self.0.clone())
            }
        }
        let mut session = session_with(factory);
        session.set_proxy_resolver(Arc::new(Always(Origin::new("http", "proxy.test", 3128))));

        let msg = Message::new(Method::GET, "http://example.com/".parse().unwrap());
        let (_msg, status) = session.send(msg, Box::new(crate::message::NullObserver));
        assert_eq!(status, Status::CantConnectProxy);
    }
}
