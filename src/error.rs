//! Error taxonomy shared by every layer of the client.

use std::fmt;
use std::io;

use thiserror::Error;

/// The closed set of error conditions surfaced by this crate.
///
/// The first block maps one-to-one onto errno values, using the naming of
/// the C++ `std::errc` taxonomy. Then come resolver failures (`Ai*`, after
/// getaddrinfo), TLS failures (`Ssl*`), and a few conditions of our own:
/// clean end of stream, SOCKS5h handshake deviations, and WebSocket
/// protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrKind {
    /// EPIPE.
    #[error("broken_pipe")]
    BrokenPipe,
    /// ECONNABORTED.
    #[error("connection_aborted")]
    ConnectionAborted,
    /// ECONNREFUSED.
    #[error("connection_refused")]
    ConnectionRefused,
    /// ECONNRESET.
    #[error("connection_reset")]
    ConnectionReset,
    /// ENOSYS.
    #[error("function_not_supported")]
    FunctionNotSupported,
    /// EHOSTUNREACH.
    #[error("host_unreachable")]
    HostUnreachable,
    /// EINTR.
    #[error("interrupted")]
    Interrupted,
    /// EINVAL, or a malformed protocol message.
    #[error("invalid_argument")]
    InvalidArgument,
    /// EIO, and the fallback for any unrecognized I/O failure.
    #[error("io_error")]
    IoError,
    /// EMSGSIZE: a payload too large for its framing.
    #[error("message_size")]
    MessageSize,
    /// ENETDOWN.
    #[error("network_down")]
    NetworkDown,
    /// ENETRESET.
    #[error("network_reset")]
    NetworkReset,
    /// ENETUNREACH.
    #[error("network_unreachable")]
    NetworkUnreachable,
    /// EINPROGRESS.
    #[error("operation_in_progress")]
    OperationInProgress,
    /// EAGAIN / EWOULDBLOCK.
    #[error("operation_would_block")]
    OperationWouldBlock,
    /// ETIMEDOUT, including expiry of the configured I/O timeout.
    #[error("timed_out")]
    TimedOut,
    /// EOVERFLOW.
    #[error("value_too_large")]
    ValueTooLarge,
    /// Resolver failure not covered by a more specific `Ai*` kind.
    #[error("ai_generic")]
    AiGeneric,
    /// EAI_AGAIN: temporary resolver failure.
    #[error("ai_again")]
    AiAgain,
    /// EAI_FAIL: permanent resolver failure.
    #[error("ai_fail")]
    AiFail,
    /// EAI_NONAME: the hostname does not resolve to any address.
    #[error("ai_noname")]
    AiNoname,
    /// TLS failure not covered by a more specific `Ssl*` kind.
    #[error("ssl_generic")]
    SslGeneric,
    /// The TLS layer needs the transport to become readable.
    #[error("ssl_want_read")]
    SslWantRead,
    /// The TLS layer needs the transport to become writeable.
    #[error("ssl_want_write")]
    SslWantWrite,
    /// A syscall failed underneath the TLS layer.
    #[error("ssl_syscall")]
    SslSyscall,
    /// The peer closed the stream.
    #[error("eof")]
    Eof,
    /// The SOCKS5h proxy deviated from RFC 1928.
    #[error("socks5h")]
    Socks5h,
    /// The peer deviated from RFC 6455.
    #[error("ws_proto")]
    WsProto,
}

/// Error type carried across every layer boundary: a structured [`ErrKind`]
/// plus an optional human-readable cause. The kind is never collapsed to a
/// boolean before [`Client::run`](crate::client::Client::run) returns.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrKind,
    cause: Option<String>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {cause}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create an error with no cause string.
    pub fn new(kind: ErrKind) -> Self {
        Error { kind, cause: None }
    }

    /// Create an error with a cause string.
    pub fn with_cause(kind: ErrKind, cause: impl Into<String>) -> Self {
        Error {
            kind,
            cause: Some(cause.into()),
        }
    }

    /// The structured kind of this error.
    pub fn kind(&self) -> ErrKind {
        self.kind
    }

    /// The cause string, if one was recorded.
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            kind: map_io_error(&err),
            cause: Some(err.to_string()),
        }
    }
}

/// Canonical `io::ErrorKind` → [`ErrKind`] mapping. Recognized kinds map
/// one-to-one; everything else collapses to [`ErrKind::IoError`].
pub fn map_io_error(err: &io::Error) -> ErrKind {
    use io::ErrorKind::*;
    match err.kind() {
        BrokenPipe => ErrKind::BrokenPipe,
        ConnectionAborted => ErrKind::ConnectionAborted,
        ConnectionRefused => ErrKind::ConnectionRefused,
        ConnectionReset => ErrKind::ConnectionReset,
        Unsupported => ErrKind::FunctionNotSupported,
        HostUnreachable => ErrKind::HostUnreachable,
        Interrupted => ErrKind::Interrupted,
        InvalidInput | InvalidData => ErrKind::InvalidArgument,
        NetworkDown => ErrKind::NetworkDown,
        NetworkUnreachable => ErrKind::NetworkUnreachable,
        WouldBlock => ErrKind::OperationWouldBlock,
        TimedOut => ErrKind::TimedOut,
        UnexpectedEof => ErrKind::Eof,
        _ => ErrKind::IoError,
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
