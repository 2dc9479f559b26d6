//! Error surface of the crate.
//!
//! Everything funnels into [`Error`]; [`Result`] is the crate-wide alias.
//! Server-side failures decoded from an Exception packet are kept as a
//! structured [`ServerException`] so callers can match on code and name.

/// Alias for a [`Result`] with the error type [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A structured error decoded from a server Exception packet.
///
/// The query that triggered it is over, but the connection remains usable
/// for a subsequent query.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{name} ({code}): {message}")]
pub struct ServerException {
    pub code:        i32,
    pub name:        String,
    pub message:     String,
    pub stack_trace: String,
    /// Server exceptions can chain a cause.
    pub nested:      Option<Box<ServerException>>,
}

/// Block integrity hash mismatch.
///
/// `actual` is the hash computed over the received frame, `reference` the
/// hash the server transmitted. Sizes are taken from the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error(
    "corrupted data: {actual:032x} (actual), {reference:032x} (reference), compressed size: {raw_size}, data size: {data_size}"
)]
pub struct CorruptedDataError {
    pub actual:    u128,
    pub reference: u128,
    pub raw_size:  usize,
    pub data_size: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operation attempted on a closed connection.
    #[error("connection closed")]
    Closed,
    /// The query required a protocol feature the server did not advertise.
    /// Fatal, not retriable against this server.
    #[error("{feature} not supported by server revision {revision}")]
    UnsupportedFeature { feature: &'static str, revision: u64 },
    /// The server aborted the query. The connection stays usable.
    #[error(transparent)]
    Server(#[from] ServerException),
    /// Hash mismatch while decoding a compressed frame. The connection is
    /// poisoned and closed.
    #[error(transparent)]
    CorruptedData(#[from] CorruptedDataError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Unexpected packet code or malformed framing. The connection is
    /// poisoned and closed.
    #[error("protocol: {0}")]
    Protocol(String),
    /// The caller's scope was canceled mid-query. Carries the outcome of
    /// the best-effort cancel flush, if it failed.
    #[error("canceled: {reason}")]
    Canceled { reason: &'static str, flush: Option<Box<Error>> },
    /// Contextual wrapper added at boundaries (`send query`, `flush`,
    /// `decode block`, `handler`).
    #[error("{context}: {source}")]
    Wrapped {
        context: &'static str,
        #[source]
        source:  Box<Error>,
    },
}

impl Error {
    /// Innermost error, unwrapping contextual layers.
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Error::Wrapped { source, .. } = err {
            err = source;
        }
        err
    }

    /// Whether this error is (or wraps) a server exception.
    pub fn is_exception(&self) -> bool { matches!(self.root(), Error::Server(_)) }

    /// The server exception carried by this error, if any.
    pub fn as_exception(&self) -> Option<&ServerException> {
        match self.root() {
            Error::Server(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this error is a soft network timeout that the read loop may
    /// retry (the server may still be computing).
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(
            self.root(),
            Error::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            )
        )
    }

    /// Attach a boundary label.
    pub(crate) fn context(self, context: &'static str) -> Error {
        Error::Wrapped { context, source: Box::new(self) }
    }
}

pub(crate) trait ResultExt<T> {
    fn context(self, context: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}

impl<T> ResultExt<T> for std::io::Result<T> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|e| Error::from(e).context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_predicate_unwraps_context() {
        let exc = ServerException {
            code:        62,
            name:        "SYNTAX_ERROR".into(),
            message:     "Syntax error".into(),
            stack_trace: String::new(),
            nested:      None,
        };
        let err = Error::from(exc).context("handle packet").context("packet loop");
        assert!(err.is_exception());
        assert_eq!(err.as_exception().unwrap().code, 62);
        assert!(err.to_string().starts_with("packet loop: "));
    }

    #[test]
    fn timeout_detection() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "read"));
        assert!(err.is_timeout());
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn corrupted_data_formats_hashes() {
        let err = CorruptedDataError { actual: 1, reference: 2, raw_size: 34, data_size: 100 };
        let text = err.to_string();
        assert!(text.contains("compressed size: 34"));
        assert!(text.contains("data size: 100"));
    }
}
