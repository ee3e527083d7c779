//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type often returned from methods that can have weft `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP streams.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Kind {
    Parse(Parse),
    /// An `io::Error` that occurred while trying to read or write to a
    /// network stream.
    Io,
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Parse {
    Status,
    Version,
    Header,
    TooLarge,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        match self.inner.kind {
            Kind::Parse(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error was caused by socket I/O.
    pub fn is_io(&self) -> bool {
        self.inner.kind == Kind::Io
    }

    /// Returns true if the connection closed before a message could
    /// complete.
    pub fn is_incomplete_message(&self) -> bool {
        self.inner.kind == Kind::IncompleteMessage
    }

    /// Returns true if the underlying I/O cause was a timeout.
    pub fn is_timeout(&self) -> bool {
        self.io_cause()
            .map(|io| io.kind() == io::ErrorKind::TimedOut)
            .unwrap_or(false)
    }

    /// Returns the underlying `io::Error`, if this error was caused by
    /// one.
    pub fn io_cause(&self) -> Option<&io::Error> {
        if self.inner.kind != Kind::Io {
            return None;
        }
        self.inner
            .cause
            .as_ref()
            .and_then(|cause| cause.downcast_ref::<io::Error>())
    }

    fn description_str(&self) -> &'static str {
        match self.inner.kind {
            Kind::Parse(Parse::Status) => "invalid status line",
            Kind::Parse(Parse::Version) => "invalid HTTP version",
            Kind::Parse(Parse::Header) => "invalid header",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Io => "error reading or writing a socket",
            Kind::IncompleteMessage => "connection closed before message completed",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("weft::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description_str(), cause)
        } else {
            f.write_str(self.description_str())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header,
            httparse::Error::Status => Parse::Status,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}
