//! Error and Result types shared across the dispatch core.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type returned from methods that can produce a [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents the error taxonomy described by the dispatch core: malformed
/// wire messages, routing failures, auth failures, proxy I/O failures, key
/// store failures, and fatal startup failures.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Malformed message on either wire dialect. Local to the reading
    /// session; never propagates past it.
    Protocol(Protocol),
    /// Deadline expired on a socket read/write.
    Timeout,
    /// A task's model/node cannot be determined or is not served.
    Route,
    /// Bearer token missing, malformed, or insufficient role.
    Auth,
    /// I/O failure during the bidirectional proxy stream.
    Proxy,
    /// Key-store lookup/insert failure.
    Store,
    /// Listener bind or persistent-store init failure at startup.
    Fatal,
}

#[derive(Debug)]
pub(crate) enum Protocol {
    /// Read hit EOF before a complete message arrived.
    Eof,
    /// A single line exceeded the configured line ceiling.
    LineTooLong,
    /// The header block exceeded the configured ceiling.
    HeadersTooLarge,
    /// A chunked/fixed body ended before its announced length.
    PrematureEof,
    /// Request-line, status-line, or header could not be parsed.
    Malformed,
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

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// True if this was a malformed-message error local to the reading side.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    pub fn is_route(&self) -> bool {
        matches!(self.inner.kind, Kind::Route)
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.inner.kind, Kind::Auth)
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.inner.kind, Kind::Proxy)
    }

    pub fn is_store(&self) -> bool {
        matches!(self.inner.kind, Kind::Store)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.inner.kind, Kind::Fatal)
    }

    pub(crate) fn protocol(p: Protocol) -> Error {
        Error::new(Kind::Protocol(p))
    }

    pub(crate) fn eof() -> Error {
        Error::protocol(Protocol::Eof)
    }

    pub(crate) fn premature_eof() -> Error {
        Error::protocol(Protocol::PrematureEof)
    }

    pub(crate) fn malformed() -> Error {
        Error::protocol(Protocol::Malformed)
    }

    pub(crate) fn too_large() -> Error {
        Error::protocol(Protocol::HeadersTooLarge)
    }

    pub(crate) fn line_too_long() -> Error {
        Error::protocol(Protocol::LineTooLong)
    }

    pub(crate) fn timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn route() -> Error {
        Error::new(Kind::Route)
    }

    pub(crate) fn auth() -> Error {
        Error::new(Kind::Auth)
    }

    pub(crate) fn proxy<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Proxy).with(cause)
    }

    pub(crate) fn store<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Store).with(cause)
    }

    pub(crate) fn fatal<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Fatal).with(cause)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Protocol(Protocol::Eof) => "connection closed before message completed",
            Kind::Protocol(Protocol::LineTooLong) => "message line exceeded the configured limit",
            Kind::Protocol(Protocol::HeadersTooLarge) => "header block exceeded the configured limit",
            Kind::Protocol(Protocol::PrematureEof) => "body ended before its announced length",
            Kind::Protocol(Protocol::Malformed) => "malformed message",
            Kind::Timeout => "operation timed out",
            Kind::Route => "task's routing key cannot be served",
            Kind::Auth => "missing, malformed, or insufficient bearer token",
            Kind::Proxy => "I/O failure proxying a task",
            Kind::Store => "key store lookup or insert failed",
            Kind::Fatal => "fatal startup failure",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("hive::Error");
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
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
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

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::eof()
        } else {
            Error::proxy(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_of() {
        assert_eq!(std::mem::size_of::<Error>(), std::mem::size_of::<usize>());
    }

    #[test]
    fn classifies_protocol_errors() {
        assert!(Error::eof().is_protocol());
        assert!(Error::malformed().is_protocol());
        assert!(!Error::route().is_protocol());
    }

    #[test]
    fn display_includes_cause() {
        let e = Error::proxy(io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone"));
        assert!(e.to_string().contains("pipe gone"));
    }
}
