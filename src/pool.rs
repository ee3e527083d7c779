//! Client connection pooling: per-origin dispatcher accounting,
//! selection, allocation, and idle reclamation.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use http::Uri;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionHandle, ConnectionObserver};
use crate::dispatch::{Client, DispatchEvent, Dispatcher, Restart};
use crate::headers;
use crate::message::Message;
use crate::socket::Socket;
use crate::status::Status;

/// A shareable dispatcher handle.
pub type DispatcherHandle = Arc<Mutex<Dispatcher<Client>>>;

/// The (scheme, host, port) tuple identifying a remote HTTP endpoint.
///
/// Hosts are normalized so two spellings of the same endpoint compare
/// equal: ASCII is lowercased, everything else goes through IDN→ASCII
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn new(scheme: &str, host: &str, port: u16) -> Origin {
        Origin {
            scheme: scheme.to_ascii_lowercase(),
            host: normalize_host(host),
            port,
        }
    }

    pub fn from_uri(uri: &Uri) -> Option<Origin> {
        let host = uri.host()?;
        let scheme = uri.scheme_str().unwrap_or("http");
        let port = uri
            .port_u16()
            .unwrap_or_else(|| headers::scheme_default_port(uri));
        Some(Origin::new(scheme, host, port))
    }

    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    pub(crate) fn key(&self) -> HostKey {
        HostKey {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

fn normalize_host(host: &str) -> String {
    if host.is_ascii() {
        host.to_ascii_lowercase()
    } else {
        idna::domain_to_ascii(host).unwrap_or_else(|_| host.to_lowercase())
    }
}

/// Connection accounting is keyed by (host, port); the scheme matters
/// for origin identity but not for which record carries the host's
/// dispatchers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct HostKey {
    host: String,
    port: u16,
}

struct HostEntry {
    disp: DispatcherHandle,
    conn: Weak<Mutex<Connection>>,
}

struct HostRecord {
    entries: Vec<HostEntry>,
    /// Sticky: once a dispatcher reports the peer cannot pipeline, this
    /// stays false for the lifetime of the record.
    supports_pipelining: bool,
    max_pipelined: usize,
    /// Reserved slot for an alternate-protocol engine on this origin.
    alt_dispatcher: Option<DispatcherHandle>,
    alt_protocol_version: Option<u32>,
}

/// Pool-level tunables.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Advisory global cap on dispatchers; counted by the session, not
    /// enforced by selection.
    pub max_dispatchers: usize,
    /// Per-host cap consulted by selection and the session.
    pub max_dispatchers_per_host: usize,
    /// Queue depth applied to dispatchers; 1 disables pipelining.
    pub max_pipelined: usize,
    /// Socket read buffer size per dispatcher.
    pub response_block_size: usize,
    /// Per-dispatcher idle timer.
    pub idle_timeout: Duration,
    /// Open new connections up to the per-host cap before reusing or
    /// pipelining existing ones.
    pub prefer_new_connections: bool,
    /// Take the first usable candidate instead of the least loaded.
    pub use_first_available: bool,
    pub pipeline_via_proxy: bool,
    pub pipeline_via_https: bool,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_dispatchers: 10,
            max_dispatchers_per_host: 2,
            max_pipelined: 4,
            response_block_size: 8192,
            idle_timeout: Duration::from_secs(3),
            prefer_new_connections: false,
            use_first_available: false,
            pipeline_via_proxy: false,
            pipeline_via_https: false,
        }
    }
}

/// Typed observer the session implements against the pool.
pub trait PoolObserver: Send + Sync {
    /// A message interrupted mid-flight can be re-queued on a fresh
    /// connection. Fired at most once per admission of a message.
    fn message_restart(&self, restart: Restart);
}

struct PoolInner {
    hosts: HashMap<HostKey, HostRecord>,
    idle: VecDeque<DispatcherHandle>,
    config: PoolConfig,
}

impl PoolInner {
    fn record_mut(&mut self, key: HostKey) -> &mut HostRecord {
        let max_pipelined = self.config.max_pipelined;
        self.hosts.entry(key).or_insert_with(|| HostRecord {
            entries: Vec::new(),
            supports_pipelining: true,
            max_pipelined,
            alt_dispatcher: None,
            alt_protocol_version: None,
        })
    }
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    observer: Mutex<Option<Arc<dyn PoolObserver>>>,
}

/// The dispatcher pool. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Pool {
        Pool {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(PoolInner {
                    hosts: HashMap::new(),
                    idle: VecDeque::new(),
                    config,
                }),
                observer: Mutex::new(None),
            }),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn PoolObserver>) {
        *self.shared.observer.lock().unwrap() = Some(observer);
    }

    pub fn config(&self) -> PoolConfig {
        self.shared.inner.lock().unwrap().config
    }

    /// Picks a live dispatcher for `msg`, or `None` when the caller
    /// should allocate a new one (or wait for a slot).
    ///
    /// Pipelining is avoided per request when the route is proxied or
    /// TLS without the matching opt-in, when the host is blacklisted,
    /// or when the request itself asks for `Connection: close`; such
    /// requests only share a connection with an empty queue. The
    /// decision is communicated to the chosen dispatcher.
    pub fn get_dispatcher(
        &self,
        msg: &Message,
        via_https: bool,
        via_proxy: bool,
    ) -> Option<DispatcherHandle> {
        let origin = Origin::from_uri(&msg.uri)?;
        let chosen = {
            let mut inner = self.shared.inner.lock().unwrap();
            let config = inner.config;
            let record = inner.record_mut(origin.key());

            if let Some(ref alt) = record.alt_dispatcher {
                return Some(alt.clone());
            }

            if config.prefer_new_connections
                && record.entries.len() < config.max_dispatchers_per_host
            {
                return None;
            }

            let dont_pipeline = (via_proxy && !config.pipeline_via_proxy)
                || (via_https && !config.pipeline_via_https)
                || !record.supports_pipelining
                || headers::connection_contains(&msg.request_headers, "close");

            let mut best: Option<(usize, usize)> = None;
            for (idx, entry) in record.entries.iter().enumerate() {
                let disp = entry.disp.lock().unwrap();
                let usable = disp.socket().is_some()
                    && ((dont_pipeline && disp.is_queue_empty())
                        || (!dont_pipeline && !disp.is_queue_full()));
                if !usable {
                    continue;
                }
                let len = disp.queue_length();
                let better = best.map(|(_, best_len)| len < best_len).unwrap_or(true);
                if better {
                    best = Some((idx, len));
                    if config.use_first_available || len == 0 {
                        break;
                    }
                }
            }

            let (idx, _) = best?;
            let disp = record.entries[idx].disp.clone();
            disp.lock().unwrap().set_pipelining_support(!dont_pipeline);
            disp
        };
        trace!("reusing dispatcher for {}", origin);
        Some(chosen)
    }

    /// Takes a dispatcher off the idle-reuse FIFO (or builds a fresh
    /// one), configures it for `origin`, registers it in the host
    /// record, and wires it to `conn`'s lifecycle: the socket installs
    /// on connect, the dispatcher is reclaimed on disconnect, and an
    /// idle timeout disconnects the connection.
    ///
    /// The caller must not hold `conn`'s lock.
    pub fn alloc_dispatcher(
        &self,
        origin: &Origin,
        conn: &ConnectionHandle,
        via_proxy: bool,
    ) -> DispatcherHandle {
        let disp = {
            let mut inner = self.shared.inner.lock().unwrap();
            let config = inner.config;
            let disp = inner
                .idle
                .pop_front()
                .unwrap_or_else(|| Arc::new(Mutex::new(Dispatcher::new())));
            let record = inner.record_mut(origin.key());
            {
                let mut d = disp.lock().unwrap();
                d.configure(origin.clone(), via_proxy);
                d.set_max_pipelined(record.max_pipelined);
                d.set_response_block_size(config.response_block_size);
                d.set_idle_timeout(config.idle_timeout);
            }
            record.entries.push(HostEntry {
                disp: disp.clone(),
                conn: Arc::downgrade(conn),
            });
            disp
        };

        let observer = Arc::new(PoolConnectionObserver {
            pool: self.clone(),
            disp: Arc::downgrade(&disp),
            origin: origin.clone(),
        });
        {
            let mut c = conn.lock().unwrap();
            c.set_observer(observer);
            c.bind_dispatcher(Arc::downgrade(&disp));
        }
        debug!("allocated dispatcher for {}", origin);
        disp
    }

    /// Moves a disconnected dispatcher from its host record to the
    /// idle-reuse FIFO and unbinds its socket, which drains its queues
    /// into restarts.
    fn reclaim(&self, origin: &Origin, disp: &DispatcherHandle) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if let Some(record) = inner.hosts.get_mut(&origin.key()) {
                record.entries.retain(|e| !Arc::ptr_eq(&e.disp, disp));
            }
            inner.idle.push_back(disp.clone());
        }
        let events = {
            let mut d = disp.lock().unwrap();
            d.set_socket(None);
            d.take_events()
        };
        self.handle_events(origin, events);
        debug!("dispatcher for {} reclaimed to idle pool", origin);
    }

    /// Routes drained dispatcher events: restarts to the pool observer,
    /// pipelining trouble to the host blacklist.
    pub fn handle_events(&self, origin: &Origin, events: Vec<DispatchEvent>) {
        for event in events {
            match event {
                DispatchEvent::Restart(restart) => {
                    let observer = self.shared.observer.lock().unwrap().clone();
                    match observer {
                        Some(observer) => observer.message_restart(restart),
                        None => {
                            // Nobody to re-queue it; the completion must
                            // still fire exactly once.
                            debug!("restartable message dropped; no pool observer");
                            let Restart {
                                msg, completion, ..
                            } = restart;
                            completion(msg, Status::IoError);
                        }
                    }
                }
                DispatchEvent::PipeliningNotSupported => self.disable_pipelining(origin),
                DispatchEvent::IdleTimeout | DispatchEvent::SocketClosed => {}
            }
        }
    }

    /// Blacklists pipelining for the host, permanently for the record's
    /// lifetime.
    pub fn disable_pipelining(&self, origin: &Origin) {
        let mut inner = self.shared.inner.lock().unwrap();
        let record = inner.record_mut(origin.key());
        if record.supports_pipelining {
            debug!("pipelining disabled for {}", origin);
            record.supports_pipelining = false;
        }
    }

    pub fn supports_pipelining(&self, origin: &Origin) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.record_mut(origin.key()).supports_pipelining
    }

    /// Fires expired idle timers and disconnects the affected
    /// connections, which reclaims their dispatchers.
    pub fn reap_idle(&self, now: Instant) {
        let mut expired: Vec<ConnectionHandle> = Vec::new();
        {
            let inner = self.shared.inner.lock().unwrap();
            for record in inner.hosts.values() {
                for entry in &record.entries {
                    let mut d = entry.disp.lock().unwrap();
                    if d.check_idle(now) {
                        if let Some(conn) = entry.conn.upgrade() {
                            expired.push(conn);
                        }
                    }
                }
            }
        }
        for conn in expired {
            conn.lock().unwrap().disconnect();
        }
    }

    /// The next idle deadline across all live dispatchers, for embedders
    /// scheduling their own timer.
    pub fn next_idle_deadline(&self) -> Option<Instant> {
        let inner = self.shared.inner.lock().unwrap();
        let mut next: Option<Instant> = None;
        for record in inner.hosts.values() {
            for entry in &record.entries {
                if let Some(at) = entry.disp.lock().unwrap().idle_deadline() {
                    next = Some(match next {
                        Some(cur) if cur <= at => cur,
                        _ => at,
                    });
                }
            }
        }
        next
    }

    /// The connection a live dispatcher is currently bound to.
    pub fn connection_for(&self, disp: &DispatcherHandle) -> Option<ConnectionHandle> {
        let inner = self.shared.inner.lock().unwrap();
        for record in inner.hosts.values() {
            for entry in &record.entries {
                if Arc::ptr_eq(&entry.disp, disp) {
                    return entry.conn.upgrade();
                }
            }
        }
        None
    }

    pub fn host_dispatcher_count(&self, origin: &Origin) -> usize {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .hosts
            .get(&origin.key())
            .map(|r| r.entries.len())
            .unwrap_or(0)
    }

    pub fn total_dispatchers(&self) -> usize {
        let inner = self.shared.inner.lock().unwrap();
        inner.hosts.values().map(|r| r.entries.len()).sum()
    }

    pub fn idle_count(&self) -> usize {
        self.shared.inner.lock().unwrap().idle.len()
    }

    /// Applies a new queue depth to the pool and to every live and idle
    /// dispatcher.
    pub fn set_max_pipelined(&self, value: usize) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.config.max_pipelined == value {
            return;
        }
        inner.config.max_pipelined = value;
        for record in inner.hosts.values_mut() {
            record.max_pipelined = value;
            for entry in &record.entries {
                entry.disp.lock().unwrap().set_max_pipelined(value);
            }
        }
        for disp in &inner.idle {
            disp.lock().unwrap().set_max_pipelined(value);
        }
    }

    /// Applies a queue depth override for one origin's dispatchers.
    pub fn set_max_pipelined_for_host(&self, origin: &Origin, value: usize) {
        let mut inner = self.shared.inner.lock().unwrap();
        let record = inner.record_mut(origin.key());
        record.max_pipelined = value;
        for entry in &record.entries {
            entry.disp.lock().unwrap().set_max_pipelined(value);
        }
    }

    /// Applies a new read block size to the pool and to every live and
    /// idle dispatcher.
    pub fn set_response_block_size(&self, value: usize) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.config.response_block_size == value {
            return;
        }
        inner.config.response_block_size = value;
        for record in inner.hosts.values() {
            for entry in &record.entries {
                entry.disp.lock().unwrap().set_response_block_size(value);
            }
        }
        for disp in &inner.idle {
            disp.lock().unwrap().set_response_block_size(value);
        }
    }

    pub fn set_idle_timeout(&self, value: Duration) {
        self.shared.inner.lock().unwrap().config.idle_timeout = value;
    }

    /// Registers an alternate-protocol engine for an origin; selection
    /// returns it ahead of any HTTP/1 dispatcher.
    pub fn set_alt_protocol(
        &self,
        origin: &Origin,
        version: u32,
        disp: Option<DispatcherHandle>,
    ) {
        let mut inner = self.shared.inner.lock().unwrap();
        let record = inner.record_mut(origin.key());
        record.alt_protocol_version = Some(version);
        record.alt_dispatcher = disp;
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock().unwrap();
        f.debug_struct("Pool")
            .field("hosts", &inner.hosts.len())
            .field("idle", &inner.idle.len())
            .field("config", &inner.config)
            .finish()
    }
}

struct PoolConnectionObserver {
    pool: Pool,
    disp: Weak<Mutex<Dispatcher<Client>>>,
    origin: Origin,
}

impl ConnectionObserver for PoolConnectionObserver {
    fn connected(&self, socket: &Arc<dyn Socket>) {
        if let Some(disp) = self.disp.upgrade() {
            disp.lock().unwrap().set_socket(Some(socket.clone()));
        }
    }

    fn disconnected(&self) {
        if let Some(disp) = self.disp.upgrade() {
            self.pool.reclaim(&self.origin, &disp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Cancellable;
    use crate::mock::MockFactory;
    use http::Method;

    fn msg(uri: &str) -> Message {
        Message::new(Method::GET, uri.parse().unwrap())
    }

    fn connected_pair(pool: &Pool, origin: &Origin) -> (ConnectionHandle, DispatcherHandle) {
        let factory = MockFactory::new();
        let conn = Arc::new(Mutex::new(Connection::new(
            factory.clone(),
            crate::socket::RemoteAddr::new(origin.host.clone(), origin.port),
        )));
        let disp = pool.alloc_dispatcher(origin, &conn, false);
        let status = conn.lock().unwrap().connect(&Cancellable::new());
        assert_eq!(status, Status::OK);
        (conn, disp)
    }

    #[test]
    fn origin_normalization() {
        let a = Origin::from_uri(&"http://Example.COM/a".parse().unwrap()).unwrap();
        let b = Origin::from_uri(&"http://example.com:80/b".parse().unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.port, 80);

        let tls = Origin::from_uri(&"https://example.com/".parse().unwrap()).unwrap();
        assert_eq!(tls.port, 443);
        assert!(tls.is_https());
        assert_ne!(a, tls);
    }

    #[test]
    fn no_dispatcher_without_connections() {
        let pool = Pool::new(PoolConfig::default());
        assert!(pool.get_dispatcher(&msg("http://example.com/"), false, false).is_none());
    }

    #[test]
    fn reuses_idle_live_dispatcher() {
        let pool = Pool::new(PoolConfig::default());
        let origin = Origin::from_uri(&"http://example.com/".parse().unwrap()).unwrap();
        let (_conn, disp) = connected_pair(&pool, &origin);

        let chosen = pool
            .get_dispatcher(&msg("http://example.com/"), false, false)
            .expect("should reuse the live dispatcher");
        assert!(Arc::ptr_eq(&chosen, &disp));
    }

    #[test]
    fn prefer_new_connections_under_cap() {
        let mut config = PoolConfig::default();
        config.prefer_new_connections = true;
        let pool = Pool::new(config);
        let origin = Origin::from_uri(&"http://example.com/".parse().unwrap()).unwrap();
        let (_conn, _disp) = connected_pair(&pool, &origin);

        // One dispatcher, cap is two: the caller should open another.
        assert!(pool.get_dispatcher(&msg("http://example.com/"), false, false).is_none());
    }

    #[test]
    fn pipelining_blacklist_is_sticky() {
        let pool = Pool::new(PoolConfig::default());
        let origin = Origin::from_uri(&"http://example.com/".parse().unwrap()).unwrap();
        assert!(pool.supports_pipelining(&origin));
        pool.disable_pipelining(&origin);
        assert!(!pool.supports_pipelining(&origin));
        // Nothing ever flips it back.
        pool.handle_events(&origin, vec![]);
        assert!(!pool.supports_pipelining(&origin));
    }

    #[test]
    fn disconnect_reclaims_to_idle_fifo() {
        let pool = Pool::new(PoolConfig::default());
        let origin = Origin::from_uri(&"http://example.com/".parse().unwrap()).unwrap();
        let (conn, disp) = connected_pair(&pool, &origin);
        assert_eq!(pool.host_dispatcher_count(&origin), 1);
        assert_eq!(pool.idle_count(), 0);

        conn.lock().unwrap().disconnect();

        assert_eq!(pool.host_dispatcher_count(&origin), 0);
        assert_eq!(pool.idle_count(), 1);
        assert!(disp.lock().unwrap().socket().is_none());

        // The same dispatcher object comes back for the next origin.
        let origin2 = Origin::from_uri(&"http://other.test/".parse().unwrap()).unwrap();
        let (_conn2, disp2) = connected_pair(&pool, &origin2);
        assert!(Arc::ptr_eq(&disp, &disp2));
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn idle_reaping_disconnects_and_reclaims() {
        let pool = Pool::new(PoolConfig::default());
        let origin = Origin::from_uri(&"http://example.com/".parse().unwrap()).unwrap();
        let (_conn, disp) = connected_pair(&pool, &origin);

        let deadline = disp
            .lock()
            .unwrap()
            .idle_deadline()
            .expect("fresh binding arms the idle timer");

        // Before the deadline nothing happens.
        pool.reap_idle(deadline - std::time::Duration::from_secs(1));
        assert_eq!(pool.host_dispatcher_count(&origin), 1);

        pool.reap_idle(deadline);
        assert_eq!(pool.host_dispatcher_count(&origin), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn tunables_propagate_to_live_dispatchers() {
        let pool = Pool::new(PoolConfig::default());
        let origin = Origin::from_uri(&"http://example.com/".parse().unwrap()).unwrap();
        let (_conn, disp) = connected_pair(&pool, &origin);

        pool.set_max_pipelined(7);
        pool.set_response_block_size(4096);
        let d = disp.lock().unwrap();
        assert_eq!(d.max_pipelined(), 7);
        assert_eq!(d.response_block_size(), 4096);
    }

    #[test]
    fn connection_close_requests_get_their_own_connection() {
        let mut config = PoolConfig::default();
        config.max_pipelined = 4;
        let pool = Pool::new(config);
        let origin = Origin::from_uri(&"http://example.com/".parse().unwrap()).unwrap();
        let (_conn, disp) = connected_pair(&pool, &origin);

        // Make the dispatcher non-empty.
        disp.lock()
            .unwrap()
            .queue_message(msg("http://example.com/busy"));

        let mut close_msg = msg("http://example.com/");
        close_msg
            .request_headers
            .insert(http::header::CONNECTION, "close".parse().unwrap());
        assert!(pool.get_dispatcher(&close_msg, false, false).is_none());

        // A pipelinable request can still share it.
        assert!(pool.get_dispatcher(&msg("http://example.com/"), false, false).is_some());
    }
}
