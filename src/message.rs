//! The request/response message object and its callback surface.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};

use crate::body::MessageBody;
use crate::decode::Converter;
use crate::status::Status;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one message across the session, pool, and dispatcher
/// layers, for as long as the message exists.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MessageId(u64);

/// Per-message behavior switches.
#[derive(Debug, Clone, Copy)]
pub struct MessageFlags {
    /// Written request-body chunks stay retained so the exchange can be
    /// replayed on a fresh connection. Clear it for streamed bodies:
    /// each fully flushed chunk is then released from the body as it
    /// goes out.
    pub can_rebuild: bool,
    /// Response body chunks are run through the converter chain. Cleared
    /// when a converter fails permanently.
    pub content_decoded: bool,
}

impl Default for MessageFlags {
    fn default() -> MessageFlags {
        MessageFlags {
            can_rebuild: true,
            content_decoded: false,
        }
    }
}

/// One HTTP request/response exchange.
///
/// The session owns the message until it hands it to a dispatcher; it
/// gets it back through the completion callback (or through a restart,
/// for re-queuing on a fresh connection).
pub struct Message {
    id: MessageId,
    pub method: Method,
    pub uri: Uri,
    /// The HTTP version in effect for this exchange. Starts at 1.1 and
    /// is downgraded if the server answers with something lower.
    pub http_version: Version,
    pub status: Status,
    pub reason_phrase: Option<String>,
    pub request_headers: HeaderMap,
    pub response_headers: HeaderMap,
    pub request_body: MessageBody,
    pub response_body: MessageBody,
    pub flags: MessageFlags,
    decoders: Vec<Box<dyn Converter>>,
    sniffer: Option<Box<dyn ContentSniffer>>,
    pause_intent: bool,
    cancel_intent: Option<Status>,
}

impl Message {
    pub fn new(method: Method, uri: Uri) -> Message {
        Message {
            id: MessageId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            method,
            uri,
            http_version: Version::HTTP_11,
            status: Status::None,
            reason_phrase: None,
            request_headers: HeaderMap::new(),
            response_headers: HeaderMap::new(),
            request_body: MessageBody::new(),
            response_body: MessageBody::new(),
            flags: MessageFlags::default(),
            decoders: Vec::new(),
            sniffer: None,
            pause_intent: false,
            cancel_intent: None,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Appends a streaming content decoder. Decoders run in order over
    /// every response body chunk.
    pub fn add_decoder(&mut self, decoder: Box<dyn Converter>) {
        self.decoders.push(decoder);
        self.flags.content_decoded = true;
    }

    pub(crate) fn has_decoders(&self) -> bool {
        !self.decoders.is_empty()
    }

    /// Installs a content sniffer; initial body bytes are buffered until
    /// the sniffer has seen enough, then delivered in one piece.
    pub fn set_sniffer(&mut self, sniffer: Box<dyn ContentSniffer>) {
        self.sniffer = Some(sniffer);
    }

    pub(crate) fn has_sniffer(&self) -> bool {
        self.sniffer.is_some()
    }

    pub(crate) fn take_sniffer(&mut self) -> Option<Box<dyn ContentSniffer>> {
        self.sniffer.take()
    }

    pub(crate) fn put_sniffer(&mut self, sniffer: Box<dyn ContentSniffer>) {
        self.sniffer = Some(sniffer);
    }

    pub(crate) fn decoders_mut(&mut self) -> (&mut Vec<Box<dyn Converter>>, &mut MessageFlags) {
        (&mut self.decoders, &mut self.flags)
    }

    /// Requests cancellation of the in-flight exchange. Honored by the
    /// dispatcher when the current callback returns.
    pub fn cancel(&mut self, status: Status) {
        self.cancel_intent = Some(status);
    }

    /// Requests a pause of the in-flight exchange. Honored by the
    /// dispatcher when the current callback returns.
    pub fn pause(&mut self) {
        self.pause_intent = true;
    }

    pub(crate) fn take_cancel_intent(&mut self) -> Option<Status> {
        self.cancel_intent.take()
    }

    pub(crate) fn take_pause_intent(&mut self) -> bool {
        let paused = self.pause_intent;
        self.pause_intent = false;
        paused
    }

    /// Clears the response side, making the message ready to receive a
    /// (new) final response. Used when informational responses arrive.
    pub fn cleanup_response(&mut self) {
        self.response_headers.clear();
        self.response_body.truncate();
        self.status = Status::None;
        self.reason_phrase = None;
    }

    /// Whether the connection may be reused after this exchange.
    pub fn is_keepalive(&self) -> bool {
        crate::headers::is_keepalive(self)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("status", &self.status)
            .finish()
    }
}

/// Typed observer for the callbacks the dispatcher fires while a message
/// moves through its state machines. All methods default to no-ops.
///
/// Observers run while the dispatcher is advancing its queues, so they
/// must not call back into the dispatcher; the reentrancy-safe way to
/// pause or cancel from inside a callback is [`Message::pause`] and
/// [`Message::cancel`].
pub trait MessageObserver: Send {
    fn got_headers(&mut self, _msg: &mut Message) {}
    fn got_informational(&mut self, _msg: &mut Message) {}
    fn got_chunk(&mut self, _msg: &mut Message, _chunk: &Bytes) {}
    fn got_body(&mut self, _msg: &mut Message) {}
    fn content_sniffed(&mut self, _msg: &mut Message, _content_type: &str) {}
    fn wrote_headers(&mut self, _msg: &mut Message) {}
    fn wrote_informational(&mut self, _msg: &mut Message) {}
    fn wrote_chunk(&mut self, _msg: &mut Message) {}
    fn wrote_body_data(&mut self, _msg: &mut Message, _len: usize) {}
    fn wrote_body(&mut self, _msg: &mut Message) {}
    fn restarted(&mut self, _msg: &mut Message) {}
    fn finished(&mut self, _msg: &mut Message) {}
}

/// An observer that ignores everything.
#[derive(Debug, Default)]
pub struct NullObserver;

impl MessageObserver for NullObserver {}

/// Fired exactly once when an item leaves the dispatcher for good,
/// handing the message back together with its final status.
pub type Completion = Box<dyn FnOnce(Message, Status) + Send>;

/// Infers a Content-Type from the initial bytes of a response body. The
/// sniffing policy itself lives outside this crate.
pub trait ContentSniffer: Send {
    /// How many body bytes to buffer before sniffing.
    fn bytes_wanted(&self) -> usize {
        512
    }

    fn sniff(&mut self, msg: &Message, data: &Bytes) -> String;
}
