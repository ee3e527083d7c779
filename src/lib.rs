//! # weft
//!
//! An HTTP/1.x client-side connection management and I/O dispatch core.
//!
//! weft sits between a high-level session, which enqueues request
//! messages and observes their completion, and a transport socket
//! layer, which performs byte-level reads and writes, TLS handshakes,
//! and proxy tunneling. It multiplexes many outstanding requests over a
//! bounded pool of persistent connections per origin, driving each
//! request through a precise read/write state machine while honoring
//! keep-alive, pipelining policy, chunked transfer encoding, content
//! decoding, expect-continue handshakes, idle timeouts, and CONNECT
//! tunnels.
//!
//! The crate brings no runtime of its own. Sockets implement the
//! [`socket::Socket`] contract; readiness is delivered by calling
//! [`dispatch::Dispatcher::readable`] and
//! [`dispatch::Dispatcher::writable`], and blocking sockets simply
//! drive each exchange to completion inline, which is what
//! [`session::Session`] builds on.
//!
//! The layering, bottom up:
//!
//! - [`dispatch`]: the per-connection engine, serializing writes and
//!   reads of one or more pipelined messages over a single socket;
//! - [`connection`]: socket establishment, TLS, tunnel event
//!   bracketing, disconnection;
//! - [`pool`]: per-origin connection accounting, selection, idle reuse,
//!   and the sticky pipelining blacklist;
//! - [`session`]: a thin blocking driver adding proxy routing, tunnel
//!   negotiation, and restart re-queuing.

#![deny(missing_debug_implementations)]

pub mod body;
mod cancel;
pub mod connection;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod headers;
pub mod message;
pub mod pool;
pub mod session;
pub mod socket;
pub mod status;

#[cfg(test)]
mod mock;

pub use crate::body::MessageBody;
pub use crate::cancel::Cancellable;
pub use crate::error::{Error, Result};
pub use crate::headers::Encoding;
pub use crate::message::{Message, MessageId, MessageObserver};
pub use crate::pool::{Origin, Pool, PoolConfig};
pub use crate::session::Session;
pub use crate::status::Status;
