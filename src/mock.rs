//! Scripted sockets and observers for tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::cancel::Cancellable;
use crate::connection::ConnectionObserver;
use crate::message::{Message, MessageObserver};
use crate::socket::{IoStatus, RemoteAddr, Socket, SocketEvent, SocketFactory};
use crate::status::Status;

enum ReadStep {
    Data(Vec<u8>),
    WouldBlock,
    Eof,
    Error(io::Error),
}

struct MockInner {
    steps: VecDeque<ReadStep>,
    current: Vec<u8>,
    written: Vec<u8>,
    write_budget: Option<usize>,
    connected: bool,
    connect_status: Status,
    handshake_status: Status,
    tls: bool,
    tls_server_name: Option<String>,
}

/// A socket whose reads follow a script and whose writes are captured.
/// Without explicit blocking steps it behaves like a blocking socket
/// that always has the scripted bytes ready.
pub(crate) struct MockSocket {
    inner: Mutex<MockInner>,
}

impl MockSocket {
    pub(crate) fn new() -> Arc<MockSocket> {
        Arc::new(MockSocket {
            inner: Mutex::new(MockInner {
                steps: VecDeque::new(),
                current: Vec::new(),
                written: Vec::new(),
                write_budget: None,
                connected: false,
                connect_status: Status::OK,
                handshake_status: Status::OK,
                tls: false,
                tls_server_name: None,
            }),
        })
    }

    pub(crate) fn read_data(&self, data: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .steps
            .push_back(ReadStep::Data(data.to_vec()));
    }

    pub(crate) fn read_would_block(&self) {
        self.inner
            .lock()
            .unwrap()
            .steps
            .push_back(ReadStep::WouldBlock);
    }

    pub(crate) fn read_eof(&self) {
        self.inner.lock().unwrap().steps.push_back(ReadStep::Eof);
    }

    pub(crate) fn read_error(&self, error: io::Error) {
        self.inner
            .lock()
            .unwrap()
            .steps
            .push_back(ReadStep::Error(error));
    }

    pub(crate) fn fail_connect(&self, status: Status) {
        self.inner.lock().unwrap().connect_status = status;
    }

    pub(crate) fn fail_handshake(&self, status: Status) {
        self.inner.lock().unwrap().handshake_status = status;
    }

    /// Allows `bytes` more bytes to be written before writes report
    /// `WouldBlock`. The first call switches the socket from unlimited
    /// writes to budgeted ones.
    pub(crate) fn block_in(&self, bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.write_budget = Some(inner.write_budget.unwrap_or(0) + bytes);
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.inner.lock().unwrap().written.clone()
    }

    pub(crate) fn connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    pub(crate) fn tls_server_name(&self) -> Option<String> {
        self.inner.lock().unwrap().tls_server_name.clone()
    }

    pub(crate) fn mark_connected(&self) {
        self.inner.lock().unwrap().connected = true;
    }

    fn fill(inner: &mut MockInner) -> Option<IoStatus> {
        while inner.current.is_empty() {
            match inner.steps.front() {
                Some(ReadStep::Eof) => return Some(IoStatus::Eof),
                None => return Some(IoStatus::WouldBlock),
                _ => {}
            }
            match inner.steps.pop_front() {
                Some(ReadStep::Data(data)) => inner.current = data,
                Some(ReadStep::WouldBlock) => return Some(IoStatus::WouldBlock),
                Some(ReadStep::Error(e)) => return Some(IoStatus::Err(e)),
                _ => return Some(IoStatus::WouldBlock),
            }
        }
        None
    }
}

impl Socket for MockSocket {
    fn connect(&self, _cancellable: &Cancellable) -> Status {
        let mut inner = self.inner.lock().unwrap();
        if inner.connect_status.is_successful() {
            inner.connected = true;
        }
        inner.connect_status
    }

    fn read(&self, buf: &mut [u8], _cancellable: &Cancellable) -> IoStatus {
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = MockSocket::fill(&mut inner) {
            return status;
        }
        let n = std::cmp::min(buf.len(), inner.current.len());
        buf[..n].copy_from_slice(&inner.current[..n]);
        inner.current.drain(..n);
        IoStatus::Ok(n)
    }

    fn read_until(
        &self,
        buf: &mut [u8],
        delim: &[u8],
        _cancellable: &Cancellable,
    ) -> (IoStatus, bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = MockSocket::fill(&mut inner) {
            return (status, false);
        }
        let cap = std::cmp::min(buf.len(), inner.current.len());
        let mut end = cap;
        let mut got_delim = false;
        if !delim.is_empty() && inner.current.len() >= delim.len() {
            for i in 0..cap {
                if inner.current[i..].starts_with(delim) {
                    end = std::cmp::min(cap, i + delim.len());
                    got_delim = end == i + delim.len();
                    break;
                }
            }
        }
        buf[..end].copy_from_slice(&inner.current[..end]);
        inner.current.drain(..end);
        (IoStatus::Ok(end), got_delim)
    }

    fn write(&self, buf: &[u8], _cancellable: &Cancellable) -> IoStatus {
        let mut inner = self.inner.lock().unwrap();
        let n = match inner.write_budget {
            Some(budget) => {
                if budget == 0 {
                    return IoStatus::WouldBlock;
                }
                let n = std::cmp::min(budget, buf.len());
                inner.write_budget = Some(budget - n);
                n
            }
            None => buf.len(),
        };
        inner.written.extend_from_slice(&buf[..n]);
        IoStatus::Ok(n)
    }

    fn disconnect(&self) {
        self.inner.lock().unwrap().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    fn has_pending_input(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if !inner.current.is_empty() {
            return true;
        }
        match inner.steps.front() {
            Some(ReadStep::Data(_)) | Some(ReadStep::Eof) => true,
            _ => false,
        }
    }

    fn start_tls(&self, server_name: &str) -> bool {
        self.inner.lock().unwrap().tls_server_name = Some(server_name.to_string());
        true
    }

    fn handshake(&self, _cancellable: &Cancellable) -> Status {
        let mut inner = self.inner.lock().unwrap();
        if inner.handshake_status.is_successful() {
            inner.tls = true;
        }
        inner.handshake_status
    }

    fn is_tls(&self) -> bool {
        self.inner.lock().unwrap().tls
    }
}

/// Hands out pre-scripted sockets in order, creating blank ones when
/// the queue runs dry.
pub(crate) struct MockFactory {
    queued: Mutex<VecDeque<Arc<MockSocket>>>,
}

impl MockFactory {
    pub(crate) fn new() -> Arc<MockFactory> {
        Arc::new(MockFactory {
            queued: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn push(&self, socket: Arc<MockSocket>) {
        self.queued.lock().unwrap().push_back(socket);
    }
}

impl SocketFactory for MockFactory {
    fn new_socket(&self, _addr: &RemoteAddr) -> Arc<dyn Socket> {
        self.queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(MockSocket::new)
    }
}

/// Records message callbacks as readable labels.
#[derive(Clone)]
pub(crate) struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub(crate) fn new() -> EventLog {
        EventLog {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn observer(&self) -> Box<dyn MessageObserver> {
        Box::new(Recorder {
            events: self.events.clone(),
        })
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, label: &str) {
        self.events.lock().unwrap().push(label.to_string());
    }
}

impl MessageObserver for Recorder {
    fn got_headers(&mut self, _msg: &mut Message) {
        self.push("got_headers");
    }
    fn got_informational(&mut self, _msg: &mut Message) {
        self.push("got_informational");
    }
    fn got_chunk(&mut self, _msg: &mut Message, _chunk: &Bytes) {
        self.push("got_chunk");
    }
    fn got_body(&mut self, _msg: &mut Message) {
        self.push("got_body");
    }
    fn content_sniffed(&mut self, _msg: &mut Message, content_type: &str) {
        self.push(&format!("content_sniffed:{}", content_type));
    }
    fn wrote_headers(&mut self, _msg: &mut Message) {
        self.push("wrote_headers");
    }
    fn wrote_informational(&mut self, _msg: &mut Message) {
        self.push("wrote_informational");
    }
    fn wrote_chunk(&mut self, _msg: &mut Message) {
        self.push("wrote_chunk");
    }
    fn wrote_body(&mut self, _msg: &mut Message) {
        self.push("wrote_body");
    }
    fn restarted(&mut self, _msg: &mut Message) {
        self.push("restarted");
    }
    fn finished(&mut self, _msg: &mut Message) {
        self.push("finished");
    }
}

/// Records connection lifecycle events.
pub(crate) struct ConnEvents {
    events: Arc<Mutex<Vec<SocketEvent>>>,
    connected: Arc<Mutex<usize>>,
    disconnected: Arc<Mutex<usize>>,
}

impl ConnEvents {
    pub(crate) fn new() -> Arc<ConnEvents> {
        Arc::new(ConnEvents {
            events: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(0)),
            disconnected: Arc::new(Mutex::new(0)),
        })
    }

    pub(crate) fn events(&self) -> Vec<SocketEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn connected_count(&self) -> usize {
        *self.connected.lock().unwrap()
    }

    pub(crate) fn disconnected_count(&self) -> usize {
        *self.disconnected.lock().unwrap()
    }
}

impl ConnectionObserver for ConnEvents {
    fn event(&self, event: SocketEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn connected(&self, _socket: &Arc<dyn Socket>) {
        *self.connected.lock().unwrap() += 1;
    }

    fn disconnected(&self) {
        *self.disconnected.lock().unwrap() += 1;
    }
}
