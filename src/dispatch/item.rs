//! Per-message I/O state while a message is in flight on a dispatcher.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::body::MessageBody;
use crate::cancel::Cancellable;
use crate::error::Error;
use crate::headers::Encoding;
use crate::message::{Completion, Message, MessageId, MessageObserver};
use crate::status::Status;

/// Progression of one direction (read or write) of an in-flight message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum IoState {
    NotStarted,
    Headers,
    /// Parked around an `Expect: 100-continue` handshake.
    Blocking,
    Body,
    ChunkSize,
    Chunk,
    ChunkEnd,
    Trailers,
    Finishing,
    Done,
}

impl IoState {
    /// Whether this direction has work it could do right now.
    pub(crate) fn is_active(self) -> bool {
        match self {
            IoState::NotStarted | IoState::Blocking | IoState::Done => false,
            _ => true,
        }
    }
}

/// The body state an encoding leads to after the headers.
pub(crate) fn body_state(encoding: Encoding) -> IoState {
    if encoding.is_chunked() {
        IoState::ChunkSize
    } else {
        IoState::Body
    }
}

/// One in-flight message plus all of its I/O bookkeeping. Created when a
/// message is admitted, destroyed on completion, cancellation, or
/// restart.
pub(crate) struct Item {
    pub(crate) msg: Message,
    pub(crate) cancellable: Cancellable,
    pub(crate) observer: Box<dyn MessageObserver>,
    pub(crate) completion: Option<Completion>,

    pub(crate) read_state: IoState,
    pub(crate) write_state: IoState,

    pub(crate) read_encoding: Encoding,
    pub(crate) write_encoding: Encoding,
    pub(crate) read_length: u64,
    pub(crate) write_length: u64,
    pub(crate) write_body_offset: u64,
    /// Bytes of the current outgoing buffer already written.
    pub(crate) written: usize,

    /// Accumulates header blocks and chunk-size lines.
    pub(crate) read_meta_buf: BytesMut,
    /// Serialized outgoing metadata (head, chunk-size lines, CRLFs).
    pub(crate) write_buf: Vec<u8>,
    pub(crate) write_chunk: Option<Bytes>,

    pub(crate) sniff_data: Option<MessageBody>,
    pub(crate) need_content_sniffed: bool,
    pub(crate) need_got_chunk: bool,

    pub(crate) read_blocked: bool,
    pub(crate) write_blocked: bool,
    pub(crate) paused: bool,
    pub(crate) cancelled: bool,
    pub(crate) io_error: bool,
    pub(crate) error: Option<Error>,

    /// EOF is an acceptable end of the response body.
    pub(crate) read_eof_ok: bool,
}

impl Item {
    pub(crate) fn new(
        msg: Message,
        cancellable: Cancellable,
        observer: Box<dyn MessageObserver>,
        completion: Completion,
    ) -> Item {
        Item {
            msg,
            cancellable,
            observer,
            completion: Some(completion),
            read_state: IoState::NotStarted,
            write_state: IoState::NotStarted,
            read_encoding: Encoding::None,
            write_encoding: Encoding::None,
            read_length: 0,
            write_length: 0,
            write_body_offset: 0,
            written: 0,
            read_meta_buf: BytesMut::new(),
            write_buf: Vec::new(),
            write_chunk: None,
            sniff_data: None,
            need_content_sniffed: false,
            need_got_chunk: false,
            read_blocked: false,
            write_blocked: false,
            paused: false,
            cancelled: false,
            io_error: false,
            error: None,
            read_eof_ok: false,
        }
    }

    pub(crate) fn id(&self) -> MessageId {
        self.msg.id()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.read_state == IoState::Done && self.write_state == IoState::Done
    }

    pub(crate) fn has_started(&self) -> bool {
        self.read_state != IoState::NotStarted || self.write_state != IoState::NotStarted
    }

    /// Applies pause/cancel intents a callback left on the message.
    /// Returns true when the state machine must stop advancing this
    /// item.
    pub(crate) fn after_callback(&mut self) -> bool {
        if let Some(status) = self.msg.take_cancel_intent() {
            self.cancelled = true;
            self.msg.status = status;
        }
        if self.msg.take_pause_intent() {
            self.paused = true;
        }
        self.cancelled || self.paused
    }

    pub(crate) fn record_io_error(&mut self, error: Error) {
        self.io_error = true;
        self.error = Some(error);
    }

    /// The status the completion callback should report.
    pub(crate) fn final_status(&self) -> Status {
        self.msg.status
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("msg", &self.msg.id())
            .field("read_state", &self.read_state)
            .field("write_state", &self.write_state)
            .field("read_blocked", &self.read_blocked)
            .field("write_blocked", &self.write_blocked)
            .field("paused", &self.paused)
            .field("cancelled", &self.cancelled)
            .field("io_error", &self.io_error)
            .finish()
    }
}
