//! Exchange outcomes: HTTP statuses plus transport sentinels.

use std::fmt;

use http::StatusCode;

/// The outcome of an I/O step or of a whole message exchange.
///
/// A parsed response carries its HTTP status verbatim; everything else is
/// a transport-layer sentinel produced before (or instead of) a status
/// line ever arriving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No status has been assigned yet.
    None,
    /// A real HTTP status from a parsed response.
    Http(StatusCode),
    /// The peer sent bytes that could not be parsed as HTTP, or framing
    /// headers this implementation cannot honor.
    Malformed,
    /// A socket error interrupted the exchange.
    IoError,
    /// The exchange was cancelled by the caller.
    Cancelled,
    /// A blocking socket operation timed out.
    TimedOut,
    /// The remote hostname could not be resolved.
    CantResolve,
    /// The proxy hostname could not be resolved.
    CantResolveProxy,
    /// The TCP connection to the remote could not be established.
    CantConnect,
    /// The TCP connection to the proxy could not be established.
    CantConnectProxy,
    /// TLS could not be started on the socket.
    SslFailed,
    /// The TLS handshake itself failed.
    TlsFailed,
    /// The operation should be retried by the caller, e.g. after a TLS
    /// version fallback was recorded.
    TryAgain,
}

impl Status {
    /// The plain success status, `200 OK`.
    pub const OK: Status = Status::Http(StatusCode::OK);

    pub fn is_informational(&self) -> bool {
        match *self {
            Status::Http(code) => code.is_informational(),
            _ => false,
        }
    }

    pub fn is_successful(&self) -> bool {
        match *self {
            Status::Http(code) => code.is_success(),
            _ => false,
        }
    }

    /// Whether this is a transport-layer sentinel rather than an HTTP
    /// status.
    pub fn is_transport_error(&self) -> bool {
        match *self {
            Status::None | Status::Http(_) => false,
            _ => true,
        }
    }

    /// Remaps origin-server failures to their proxy equivalents, so
    /// callers connecting through a proxy can tell which hop failed.
    pub fn proxify(self) -> Status {
        match self {
            Status::CantResolve => Status::CantResolveProxy,
            Status::CantConnect => Status::CantConnectProxy,
            other => other,
        }
    }

    pub fn code(&self) -> Option<StatusCode> {
        match *self {
            Status::Http(code) => Some(code),
            _ => None,
        }
    }
}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Status {
        Status::Http(code)
    }
}

impl Default for Status {
    fn default() -> Status {
        Status::None
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Status::None => f.write_str("no status"),
            Status::Http(code) => write!(f, "{}", code),
            Status::Malformed => f.write_str("malformed response"),
            Status::IoError => f.write_str("connection terminated unexpectedly"),
            Status::Cancelled => f.write_str("cancelled"),
            Status::TimedOut => f.write_str("timed out"),
            Status::CantResolve => f.write_str("cannot resolve hostname"),
            Status::CantResolveProxy => f.write_str("cannot resolve proxy hostname"),
            Status::CantConnect => f.write_str("cannot connect to destination"),
            Status::CantConnectProxy => f.write_str("cannot connect to proxy"),
            Status::SslFailed => f.write_str("TLS could not be started"),
            Status::TlsFailed => f.write_str("TLS handshake failed"),
            Status::TryAgain => f.write_str("try again"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Status;
    use http::StatusCode;

    #[test]
    fn proxify_remaps_origin_failures() {
        assert_eq!(Status::CantResolve.proxify(), Status::CantResolveProxy);
        assert_eq!(Status::CantConnect.proxify(), Status::CantConnectProxy);
        assert_eq!(Status::OK.proxify(), Status::OK);
        assert_eq!(Status::TlsFailed.proxify(), Status::TlsFailed);
    }

    #[test]
    fn transport_errors() {
        assert!(Status::IoError.is_transport_error());
        assert!(Status::Malformed.is_transport_error());
        assert!(!Status::None.is_transport_error());
        assert!(!Status::Http(StatusCode::BAD_GATEWAY).is_transport_error());
    }
}
