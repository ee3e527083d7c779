//! The per-connection I/O dispatcher.
//!
//! A dispatcher owns one socket and drives a queue of messages through
//! the request/response state machine, serializing writes and reads so
//! that pipelined exchanges stay ordered. It has no run loop of its own:
//! the embedder delivers socket readiness through [`Dispatcher::readable`]
//! and [`Dispatcher::writable`], and drains [`DispatchEvent`]s after
//! driving it.

pub(crate) mod item;

mod client;

pub use self::client::Client;

use std::cmp;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Method;
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::body::MessageBody;
use crate::cancel::Cancellable;
use crate::error::Error;
use crate::headers::Encoding;
use crate::message::{Completion, Message, MessageId, MessageObserver};
use crate::pool::Origin;
use crate::socket::{IoStatus, Socket};
use crate::status::Status;

use self::item::{IoState, Item};

pub(crate) const MAX_PIPELINED_CONSTRAINT: usize = 20;
pub(crate) const RESPONSE_BLOCK_SIZE_CONSTRAINT: usize = 65536;
const MAX_PIPELINED_DEFAULT: usize = 1;
const RESPONSE_BLOCK_SIZE_DEFAULT: usize = 8192;

/// Number of seconds after which we close a connection that hasn't been
/// used.
const IDLE_TIMEOUT_DEFAULT: Duration = Duration::from_secs(3);

const EOL: &[u8] = b"\r\n";

mod sealed {
    pub trait Sealed {}
}

/// Which side of the exchange a dispatcher plays.
///
/// The client role serializes request heads and parses response heads; a
/// symmetric server role would invert the two around the same base state
/// machine.
pub trait Role: sealed::Sealed + Send + Sync + Sized + 'static {
    #[doc(hidden)]
    fn start(disp: &mut Dispatcher<Self>, key: usize);
    #[doc(hidden)]
    fn read(disp: &mut Dispatcher<Self>, key: usize) -> bool;
    #[doc(hidden)]
    fn write(disp: &mut Dispatcher<Self>, key: usize) -> bool;
    #[doc(hidden)]
    fn is_queue_full(_disp: &Dispatcher<Self>) -> bool {
        false
    }
}

impl sealed::Sealed for Client {}

/// Everything a resurrectable message needs to be re-queued on a fresh
/// connection.
pub struct Restart {
    pub msg: Message,
    pub cancellable: Cancellable,
    pub observer: Box<dyn MessageObserver>,
    pub completion: Completion,
}

impl fmt::Debug for Restart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Restart").field("msg", &self.msg).finish()
    }
}

/// Out-of-band notifications produced while the dispatcher advances.
/// Drained with [`Dispatcher::take_events`] by whoever is driving it.
#[derive(Debug)]
pub enum DispatchEvent {
    /// An interrupted message that can safely be retried on a fresh
    /// connection.
    Restart(Restart),
    /// The idle timer fired; the owner should disconnect the bound
    /// connection.
    IdleTimeout,
    /// This dispatcher discovered its peer cannot pipeline.
    PipeliningNotSupported,
    /// The dispatcher closed its socket (connection-close response,
    /// cancellation mid-body, or a fatal I/O error).
    SocketClosed,
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

pub(crate) enum WriteSrc {
    Scratch,
    Chunk,
    Eol,
}

/// Socket-facing half of the dispatcher, split out so the role state
/// machines can borrow it alongside one item.
pub(crate) struct IoCore {
    socket: Option<Arc<dyn Socket>>,
    origin: Option<Origin>,
    pub(crate) via_proxy: bool,
    read_buf: Vec<u8>,
    max_pipelined: usize,
    response_block_size: usize,
    idle_timeout: Duration,
    idle_at: Option<Instant>,
    pub(crate) finished_requests: u32,
    pipelining_supported: bool,
    events: Vec<DispatchEvent>,
}

impl IoCore {
    fn socket(&self) -> Option<Arc<dyn Socket>> {
        self.socket.clone()
    }

    /// Attempts to write the unwritten remainder of `src`. See the note
    /// at `read_metadata` for the return value.
    pub(crate) fn write_data(&mut self, item: &mut Item, src: WriteSrc, body: bool) -> bool {
        let socket = match self.socket() {
            Some(socket) => socket,
            None => return false,
        };
        loop {
            let status = {
                let data: &[u8] = match src {
                    WriteSrc::Scratch => &item.write_buf,
                    WriteSrc::Chunk => item.write_chunk.as_ref().map(|c| &c[..]).unwrap_or(b""),
                    WriteSrc::Eol => EOL,
                };
                if item.written >= data.len() {
                    break;
                }
                socket.write(&data[item.written..], &item.cancellable)
            };
            match status {
                IoStatus::Ok(n) => {
                    item.written += n;
                    if body {
                        item.write_length = item.write_length.saturating_sub(n as u64);
                        item.observer.wrote_body_data(&mut item.msg, n);
                        if item.after_callback() {
                            return false;
                        }
                    }
                }
                IoStatus::WouldBlock => {
                    item.write_blocked = true;
                    return false;
                }
                IoStatus::Eof => {
                    item.record_io_error(Error::new_incomplete());
                    return false;
                }
                IoStatus::Err(e) => {
                    item.record_io_error(Error::new_io(e));
                    return false;
                }
            }
        }
        item.written = 0;
        true
    }

    /// Accumulates metadata lines into the item's metadata buffer: one
    /// line at a time, or up to and including the blank line terminating
    /// a header block.
    ///
    /// Returns true when the wanted metadata is complete; false when the
    /// item blocked, errored, or was interrupted, with the matching item
    /// flag set.
    pub(crate) fn read_metadata(&mut self, item: &mut Item, to_blank: bool) -> bool {
        let socket = match self.socket() {
            Some(socket) => socket,
            None => return false,
        };
        loop {
            let (status, read_got_lf) =
                socket.read_until(&mut self.read_buf, b"\n", &item.cancellable);
            let mut got_lf = read_got_lf;
            let nread;
            match status {
                IoStatus::Ok(n) => {
                    nread = n;
                    item.read_meta_buf.extend_from_slice(&self.read_buf[..n]);
                }
                IoStatus::Eof => {
                    // Deal with servers that don't send the final chunk
                    // or the trailer block.
                    if item.read_state == IoState::ChunkSize && item.read_meta_buf.is_empty() {
                        item.read_meta_buf.extend_from_slice(b"0\r\n");
                        got_lf = true;
                        nread = 3;
                    } else if item.read_state == IoState::Trailers && item.read_meta_buf.is_empty()
                    {
                        item.read_meta_buf.extend_from_slice(b"\r\n");
                        got_lf = true;
                        nread = 2;
                    } else {
                        item.record_io_error(Error::new_incomplete());
                        return false;
                    }
                }
                IoStatus::WouldBlock => {
                    item.read_blocked = true;
                    return false;
                }
                IoStatus::Err(e) => {
                    item.record_io_error(Error::new_io(e));
                    return false;
                }
            }
            if got_lf {
                if !to_blank {
                    break;
                }
                let buf = &item.read_meta_buf;
                if nread == 1 && buf.len() >= 2 && &buf[buf.len() - 2..] == b"\n\n" {
                    break;
                } else if nread == 2 && buf.len() >= 3 && &buf[buf.len() - 3..] == b"\n\r\n" {
                    break;
                }
            }
        }
        true
    }

    /// Reads body bytes until the current framing is satisfied, pushing
    /// each block through decoding, sniffing, and delivery.
    pub(crate) fn read_body_chunk(&mut self, item: &mut Item) -> bool {
        if !self.handle_sniffing(item, false) {
            return false;
        }
        let socket = match self.socket() {
            Some(socket) => socket,
            None => return false,
        };
        let read_to_eof = item.read_encoding == Encoding::Eof;
        while read_to_eof || item.read_length > 0 {
            let cap = if read_to_eof {
                self.read_buf.len()
            } else {
                cmp::min(self.read_buf.len() as u64, item.read_length) as usize
            };
            match socket.read(&mut self.read_buf[..cap], &item.cancellable) {
                IoStatus::Ok(n) if n > 0 => {
                    if !read_to_eof {
                        item.read_length -= n as u64;
                    }
                    let chunk = Bytes::copy_from_slice(&self.read_buf[..n]);
                    let chunk = if item.msg.flags.content_decoded && item.msg.has_decoders() {
                        match item.msg.decode_chunk(chunk) {
                            Some(chunk) => chunk,
                            None => continue,
                        }
                    } else {
                        chunk
                    };
                    if chunk.is_empty() {
                        continue;
                    }
                    item.msg.response_body.got_chunk(&chunk);
                    if item.need_content_sniffed {
                        if let Some(sniff) = item.sniff_data.as_mut() {
                            sniff.append(chunk);
                        }
                        item.need_got_chunk = true;
                        if !self.handle_sniffing(item, false) {
                            return false;
                        }
                        continue;
                    }
                    item.observer.got_chunk(&mut item.msg, &chunk);
                    if item.after_callback() {
                        return false;
                    }
                }
                IoStatus::Ok(_) | IoStatus::Eof => {
                    if item.read_eof_ok {
                        item.read_length = 0;
                        return true;
                    }
                    item.record_io_error(Error::new_incomplete());
                    return false;
                }
                IoStatus::WouldBlock => {
                    item.read_blocked = true;
                    return false;
                }
                IoStatus::Err(e) => {
                    item.record_io_error(Error::new_io(e));
                    return false;
                }
            }
        }
        true
    }

    /// Buffers initial body bytes for the message's sniffer, firing
    /// `content_sniffed` once enough is seen (or the body ended) and
    /// then re-delivering the buffered bytes as one chunk.
    pub(crate) fn handle_sniffing(&mut self, item: &mut Item, done_reading: bool) -> bool {
        if !item.msg.has_sniffer() {
            return true;
        }
        if item.sniff_data.is_none() {
            item.sniff_data = Some(MessageBody::new());
            item.need_content_sniffed = true;
        }
        if item.need_content_sniffed {
            let mut sniffer = match item.msg.take_sniffer() {
                Some(sniffer) => sniffer,
                None => return true,
            };
            let wanted = sniffer.bytes_wanted() as u64;
            let have = item.sniff_data.as_ref().map(|s| s.len()).unwrap_or(0);
            if have < wanted && !done_reading {
                item.msg.put_sniffer(sniffer);
                return true;
            }
            item.need_content_sniffed = false;
            let data = item
                .sniff_data
                .as_ref()
                .map(|s| s.flatten())
                .unwrap_or_default();
            let content_type = sniffer.sniff(&item.msg, &data);
            item.msg.put_sniffer(sniffer);
            item.observer.content_sniffed(&mut item.msg, &content_type);
            if item.after_callback() {
                return false;
            }
        }
        if item.need_got_chunk {
            item.need_got_chunk = false;
            let data = item
                .sniff_data
                .as_ref()
                .map(|s| s.flatten())
                .unwrap_or_default();
            item.observer.got_chunk(&mut item.msg, &data);
            if item.after_callback() {
                return false;
            }
        }
        true
    }
}

/// The per-connection I/O dispatcher. See the module docs.
pub struct Dispatcher<T: Role = Client> {
    io: IoCore,
    items: Slab<Item>,
    read_queue: VecDeque<usize>,
    write_queue: VecDeque<usize>,
    paused_queue: Vec<usize>,
    pending_input: VecDeque<Message>,
    _role: PhantomData<T>,
}

impl<T: Role> Dispatcher<T> {
    pub fn new() -> Dispatcher<T> {
        Dispatcher {
            io: IoCore {
                socket: None,
                origin: None,
                via_proxy: false,
                read_buf: vec![0; RESPONSE_BLOCK_SIZE_DEFAULT],
                max_pipelined: MAX_PIPELINED_DEFAULT,
                response_block_size: RESPONSE_BLOCK_SIZE_DEFAULT,
                idle_timeout: IDLE_TIMEOUT_DEFAULT,
                idle_at: None,
                finished_requests: 0,
                pipelining_supported: true,
                events: Vec::new(),
            },
            items: Slab::new(),
            read_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
            paused_queue: Vec::new(),
            pending_input: VecDeque::new(),
            _role: PhantomData,
        }
    }

    pub(crate) fn configure(&mut self, origin: Origin, via_proxy: bool) {
        self.io.origin = Some(origin);
        self.io.via_proxy = via_proxy;
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.io.origin.as_ref()
    }

    pub fn is_via_proxy(&self) -> bool {
        self.io.via_proxy
    }

    pub fn socket(&self) -> Option<Arc<dyn Socket>> {
        self.io.socket.clone()
    }

    /// Binds (or unbinds, with `None`) the socket this dispatcher
    /// drives.
    ///
    /// Rebinding drains the active queues: every in-progress item that
    /// was neither cancelled nor errored comes back out as a
    /// [`DispatchEvent::Restart`] so the session can re-queue it. Paused
    /// items survive a rebind to a new socket; unbinding drains them
    /// too. Counters and tunables reset to their defaults, so a pool
    /// reconfigures the dispatcher after rebinding.
    pub fn set_socket(&mut self, socket: Option<Arc<dyn Socket>>) {
        if let (Some(old), Some(new)) = (&self.io.socket, &socket) {
            if Arc::ptr_eq(old, new) {
                return;
            }
        }
        if self.io.socket.is_some() {
            self.reset();
        }
        self.io.socket = socket;

        while let Some(&key) = self.read_queue.front() {
            self.cleanup_item(key);
        }
        while let Some(&key) = self.write_queue.front() {
            self.cleanup_item(key);
        }
        if self.io.socket.is_none() {
            while let Some(&key) = self.paused_queue.first() {
                self.cleanup_item(key);
            }
        }

        if self.io.socket.is_some() {
            self.update_idle();
        }
    }

    fn reset(&mut self) {
        self.io.idle_at = None;
        self.io.max_pipelined = MAX_PIPELINED_DEFAULT;
        if self.io.response_block_size != RESPONSE_BLOCK_SIZE_DEFAULT {
            self.io.response_block_size = RESPONSE_BLOCK_SIZE_DEFAULT;
            self.io.read_buf = vec![0; RESPONSE_BLOCK_SIZE_DEFAULT];
        }
        self.io.finished_requests = 0;
        self.io.pipelining_supported = true;
        self.io.via_proxy = false;
    }

    /// Parks a message in the pending-input queue. It counts toward the
    /// queue length but is not driven until
    /// [`Dispatcher::process_queued`].
    pub fn queue_message(&mut self, msg: Message) {
        self.pending_input.push_back(msg);
        self.update_idle();
    }

    /// Admits a previously queued message. Returns false if `id` is not
    /// in the pending-input queue.
    pub fn process_queued(
        &mut self,
        id: MessageId,
        cancellable: Cancellable,
        observer: Box<dyn MessageObserver>,
        completion: Completion,
    ) -> bool {
        let pos = match self.pending_input.iter().position(|m| m.id() == id) {
            Some(pos) => pos,
            None => return false,
        };
        match self.pending_input.remove(pos) {
            Some(msg) => {
                self.process_message(msg, cancellable, observer, completion);
                true
            }
            None => false,
        }
    }

    /// Admits a message: creates its I/O item, links it into the read
    /// and write queues, and starts driving it.
    pub fn process_message(
        &mut self,
        msg: Message,
        cancellable: Cancellable,
        observer: Box<dyn MessageObserver>,
        completion: Completion,
    ) {
        if self.io.socket.is_none() {
            warn!("process_message on a detached dispatcher");
            completion(msg, Status::IoError);
            return;
        }
        trace!("admitting message {:?}", msg.id());
        let key = self
            .items
            .insert(Item::new(msg, cancellable, observer, completion));
        self.read_queue.push_back(key);
        self.write_queue.push_back(key);
        self.update_idle();
        T::start(self, key);
    }

    /// Advances the head of the read queue, then gives the write queue a
    /// chance, for as long as both make progress.
    pub fn process_input_queue(&mut self) {
        while self.process_queue(Direction::Read) && self.process_queue(Direction::Write) {}
    }

    /// Advances the head of the write queue, then gives the read queue a
    /// chance, for as long as both make progress.
    pub fn process_output_queue(&mut self) {
        while self.process_queue(Direction::Write) && self.process_queue(Direction::Read) {}
    }

    fn process_queue(&mut self, dir: Direction) -> bool {
        if self.io.socket.is_none() {
            return false;
        }
        let mut finished = 0usize;
        let mut wait_continue = false;

        loop {
            let key = {
                let queue = match dir {
                    Direction::Read => &self.read_queue,
                    Direction::Write => &self.write_queue,
                };
                match queue.front() {
                    Some(&key) => key,
                    None => break,
                }
            };
            {
                let item = &self.items[key];
                let (state, blocked) = match dir {
                    Direction::Read => (item.read_state, item.read_blocked),
                    Direction::Write => (item.write_state, item.write_blocked),
                };
                if item.cancelled || item.paused || blocked || state == IoState::Blocking {
                    break;
                }
            }

            let done = match dir {
                Direction::Read => T::read(self, key),
                Direction::Write => T::write(self, key),
            };

            // A callback may have left a cancel intent behind.
            if self.items.get(key).map(|i| i.cancelled).unwrap_or(false) {
                self.cleanup_item(key);
                continue;
            }

            if done {
                finished += 1;
                match dir {
                    Direction::Read => {
                        self.read_queue.pop_front();
                    }
                    Direction::Write => {
                        self.write_queue.pop_front();
                    }
                }
                self.update_idle();
                if self.items[key].is_finished() {
                    let keepalive = self.items[key].msg.is_keepalive();
                    self.io.finished_requests += 1;
                    self.cleanup_item(key);
                    if !keepalive {
                        self.set_pipelining_support(false);
                        self.close_socket();
                        break;
                    }
                }
            } else {
                let item = &self.items[key];
                if item.io_error {
                    self.item_error(key);
                } else {
                    let state = match dir {
                        Direction::Read => item.read_state,
                        Direction::Write => item.write_state,
                    };
                    if state == IoState::Blocking {
                        wait_continue = true;
                    }
                }
                break;
            }
        }

        finished > 0 || wait_continue
    }

    /// Readiness entry point: the socket became readable.
    pub fn readable(&mut self) {
        let connected = self
            .io
            .socket
            .as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(false);
        if !connected {
            return;
        }
        let key = match self.read_queue.front() {
            Some(&key) => key,
            None => return,
        };
        if self.items[key].read_blocked {
            self.items[key].read_blocked = false;
            self.process_input_queue();
        } else {
            warn!("unexpected readable signal from socket");
        }
    }

    /// Readiness entry point: the socket became writable.
    pub fn writable(&mut self) {
        if self.io.socket.is_none() {
            return;
        }
        let key = match self.write_queue.front() {
            Some(&key) => key,
            None => {
                debug!("socket is writable but output queue is empty");
                return;
            }
        };
        if self.items[key].write_blocked {
            self.items[key].write_blocked = false;
            self.process_output_queue();
        } else {
            warn!("unexpected writable signal from socket");
        }
    }

    pub fn pause_message(&mut self, id: MessageId) {
        if let Some(key) = self.key_of(id) {
            self.pause_item(key);
        }
    }

    pub(crate) fn pause_item(&mut self, key: usize) {
        let (read_state, write_state) = {
            let item = &self.items[key];
            (item.read_state, item.write_state)
        };
        // An item that hasn't started either direction parks in the
        // paused queue so it doesn't clog the active heads.
        if read_state == IoState::NotStarted
            && write_state == IoState::NotStarted
            && !self.paused_queue.contains(&key)
        {
            self.unlink(key);
            self.paused_queue.push(key);
            self.update_idle();
        }
        self.items[key].paused = true;
    }

    pub fn unpause_message(&mut self, id: MessageId) {
        let key = match self.key_of(id) {
            Some(key) => key,
            None => return,
        };
        if self.io.socket.is_none() {
            return;
        }
        if !self.items[key].paused {
            return;
        }
        self.items[key].paused = false;

        let (read_state, write_state) = {
            let item = &self.items[key];
            (item.read_state, item.write_state)
        };
        if read_state == IoState::NotStarted && write_state == IoState::NotStarted {
            if let Some(pos) = self.paused_queue.iter().position(|&k| k == key) {
                self.paused_queue.remove(pos);
                self.read_queue.push_back(key);
                self.write_queue.push_back(key);
                self.update_idle();
            }
        }

        if write_state.is_active() {
            self.process_output_queue();
        } else if read_state.is_active() {
            self.process_input_queue();
        } else {
            self.process_output_queue();
        }
    }

    /// Cancels an in-flight message: the item leaves every queue and the
    /// completion fires with `status`. If the item had started I/O the
    /// socket is closed, since the rest of a pipelined conversation on
    /// it cannot be recovered.
    pub fn cancel_message(&mut self, id: MessageId, status: Status) {
        let key = match self.key_of(id) {
            Some(key) => key,
            None => return,
        };
        if self.items[key].cancelled {
            return;
        }
        self.items[key].cancelled = true;
        self.items[key].msg.status = status;
        self.cleanup_item(key);
    }

    fn key_of(&self, id: MessageId) -> Option<usize> {
        self.items
            .iter()
            .find(|(_, item)| item.id() == id)
            .map(|(key, _)| key)
    }

    fn unlink(&mut self, key: usize) {
        if let Some(pos) = self.read_queue.iter().position(|&k| k == key) {
            self.read_queue.remove(pos);
        }
        if let Some(pos) = self.write_queue.iter().position(|&k| k == key) {
            self.write_queue.remove(pos);
        }
        if let Some(pos) = self.paused_queue.iter().position(|&k| k == key) {
            self.paused_queue.remove(pos);
        }
    }

    /// Unlinks and destroys an item. Items that were in progress and
    /// neither cancelled nor errored come back out as restarts; everyone
    /// else gets their completion callback, exactly once.
    fn cleanup_item(&mut self, key: usize) {
        if !self.items.contains(key) {
            return;
        }
        self.unlink(key);
        self.update_idle();
        let mut item = self.items.remove(key);

        let done = item.is_finished();
        let midstream = item.has_started() && item.read_state < IoState::Finishing;
        if midstream && self.io.socket.is_some() {
            self.close_socket();
        }

        if !done && !item.io_error && !item.cancelled {
            trace!("item {:?} interrupted, signaling restart", item.id());
            item.observer.restarted(&mut item.msg);
            let Item {
                msg,
                cancellable,
                observer,
                completion,
                ..
            } = item;
            if let Some(completion) = completion {
                self.io.events.push(DispatchEvent::Restart(Restart {
                    msg,
                    cancellable,
                    observer,
                    completion,
                }));
            }
        } else {
            let status = item.final_status();
            item.observer.finished(&mut item.msg);
            let Item {
                msg, completion, ..
            } = item;
            if let Some(completion) = completion {
                completion(msg, status);
            }
        }
    }

    /// Error policy for a failed item: an idempotent GET that hasn't
    /// seen any response bytes, on a connection that already served at
    /// least one request, is silently restartable (the server likely
    /// closed an idle pipelined connection). Timeouts never restart.
    fn item_error(&mut self, key: usize) {
        let restart = {
            let item = &self.items[key];
            let timed_out = item
                .error
                .as_ref()
                .map(|e| e.is_timeout())
                .unwrap_or(false);
            item.read_state <= IoState::Headers
                && item.read_meta_buf.is_empty()
                && self.io.finished_requests > 0
                && !timed_out
                && item.msg.method == Method::GET
        };
        if restart {
            debug!("connection got closed, but the request can be retried");
            let item = &mut self.items[key];
            item.io_error = false;
            item.error = None;
            self.cleanup_item(key);
        } else {
            let item = &mut self.items[key];
            if !item.msg.status.is_transport_error() {
                item.msg.status = Status::IoError;
            }
            self.cleanup_item(key);
        }
    }

    fn close_socket(&mut self) {
        if let Some(socket) = self.io.socket.clone() {
            socket.disconnect();
            self.io.events.push(DispatchEvent::SocketClosed);
        }
    }

    pub fn queue_length(&self) -> usize {
        self.pending_input.len()
            + self.paused_queue.len()
            + cmp::max(self.read_queue.len(), self.write_queue.len())
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue_length() == 0
    }

    pub fn is_queue_full(&self) -> bool {
        self.io.max_pipelined > 0
            && (self.queue_length() >= self.io.max_pipelined || T::is_queue_full(self))
    }

    pub fn is_pipelining_supported(&self) -> bool {
        self.io.pipelining_supported
    }

    /// Communicates the per-request pipelining decision. Turning
    /// pipelining off forces the queue depth back to one and notifies
    /// the pool, which blacklists the host.
    pub fn set_pipelining_support(&mut self, value: bool) {
        if self.io.pipelining_supported == value {
            return;
        }
        self.io.pipelining_supported = value;
        if !value {
            self.io.max_pipelined = 1;
            self.io.events.push(DispatchEvent::PipeliningNotSupported);
        }
    }

    pub fn max_pipelined(&self) -> usize {
        self.io.max_pipelined
    }

    pub fn set_max_pipelined(&mut self, value: usize) {
        if self.io.pipelining_supported
            && value <= MAX_PIPELINED_CONSTRAINT
            && value != self.io.max_pipelined
        {
            self.io.max_pipelined = value;
        }
    }

    pub fn response_block_size(&self) -> usize {
        self.io.response_block_size
    }

    pub fn set_response_block_size(&mut self, value: usize) {
        if value > 0
            && value <= RESPONSE_BLOCK_SIZE_CONSTRAINT
            && value != self.io.response_block_size
        {
            self.io.response_block_size = value;
            self.io.read_buf = vec![0; value];
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.io.idle_timeout
    }

    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.io.idle_timeout = timeout;
    }

    pub fn finished_requests(&self) -> u32 {
        self.io.finished_requests
    }

    /// When the armed idle timer would fire, if any.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.io.idle_at
    }

    /// Fires the idle timer if its deadline has passed. Returns whether
    /// it fired; the event queue then carries [`DispatchEvent::IdleTimeout`].
    pub fn check_idle(&mut self, now: Instant) -> bool {
        match self.io.idle_at {
            Some(at) if at <= now => {
                self.io.idle_at = None;
                self.io.events.push(DispatchEvent::IdleTimeout);
                true
            }
            _ => false,
        }
    }

    fn update_idle(&mut self) {
        if self.is_queue_empty() {
            if self.io.socket.is_some()
                && self.io.idle_at.is_none()
                && self.io.idle_timeout > Duration::from_secs(0)
            {
                self.io.idle_at = Some(Instant::now() + self.io.idle_timeout);
            }
        } else {
            self.io.idle_at = None;
        }
    }

    /// Drains the out-of-band events produced since the last drain.
    pub fn take_events(&mut self) -> Vec<DispatchEvent> {
        std::mem::replace(&mut self.io.events, Vec::new())
    }

    /// Whether `id` is currently in flight (or pending) on this
    /// dispatcher.
    pub fn is_msg_in_progress(&self, id: MessageId) -> bool {
        self.key_of(id).is_some() || self.pending_input.iter().any(|m| m.id() == id)
    }

    pub(crate) fn parts(&mut self, key: usize) -> (&mut IoCore, &mut Item) {
        (&mut self.io, &mut self.items[key])
    }
}

impl<T: Role> Default for Dispatcher<T> {
    fn default() -> Dispatcher<T> {
        Dispatcher::new()
    }
}

impl<T: Role> fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("origin", &self.io.origin)
            .field("has_socket", &self.io.socket.is_some())
            .field("read_queue", &self.read_queue.len())
            .field("write_queue", &self.write_queue.len())
            .field("paused_queue", &self.paused_queue.len())
            .field("pending_input", &self.pending_input.len())
            .field("max_pipelined", &self.io.max_pipelined)
            .finish()
    }
}
