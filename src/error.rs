//! Error taxonomy (spec §7).
//!
//! Errors are classified along two independent axes: a [`ErrorCategory`],
//! which callers can match on, and a set of [`ErrorTag`]s, which retry
//! logic consults instead of matching on category directly (categories
//! grow; tags are the stable contract for "should I retry this").

use std::fmt;

/// Top-level error type returned by every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-side usage error: wrong destination type, calling a method
    /// that needs a feature the connected server doesn't have, a client
    /// used after close, etc.
    #[error("interface error: {0}")]
    Interface(String),

    /// The connection failed outright and isn't expected to recover on its
    /// own (e.g. auth failure surfaced as a connection error, or a
    /// configuration error discovered at dial time).
    #[error("client connection error: {0}")]
    ClientConnectionFailed(String),

    /// A transient failure (ECONNREFUSED, ECONNRESET, EADDRINUSE, ENOENT,
    /// DNS failure) that a fresh dial is likely to recover from.
    #[error("client connection error (temporary): {0}")]
    ClientConnectionFailedTemporarily(String),

    /// The connection attempt or an in-flight read/write exceeded its
    /// deadline.
    #[error("client connection timeout: {0}")]
    ClientConnectionTimeout(String),

    /// An operation was attempted on a connection already marked closed.
    #[error("client connection closed")]
    ClientConnectionClosed,

    /// A malformed message was received: bad length, bad tag, truncated
    /// payload, descriptor id mismatch.
    #[error("binary protocol error: {0}")]
    BinaryProtocol(String),

    /// A message arrived that's well-formed but not valid in the current
    /// state (e.g. an unrecognized `ParameterStatus` name).
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// A caller-supplied argument didn't match what the descriptor/codec
    /// required (missing required value, unknown state key, wrong type).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `AtMostOne` cardinality was requested, zero rows came back, and the
    /// destination isn't optional-capable.
    #[error("no data: {0}")]
    NoData(String),

    /// The server reported a cardinality (e.g. `Many`) incompatible with
    /// what the caller asked for (e.g. `AtMostOne`).
    #[error("result cardinality mismatch: {0}")]
    ResultCardinalityMismatch(String),

    /// The query requires a capability the client has disabled, e.g.
    /// transaction control statements on a non-transactional client.
    #[error("disabled capability: {0}")]
    DisabledCapability(String),

    /// A transaction-control command failed for a reason other than a
    /// conflict (e.g. COMMIT after a failed action).
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The server reported a serialization/deadlock conflict; retriable
    /// per [`RetryRule`](crate::retry::RetryRule) when the query was
    /// read-only or the action itself is retried.
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    /// Authentication was rejected (bad password, unsupported SASL
    /// mechanism, malformed challenge).
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The resolved [`ConnectionConfig`](crate::config::ConnectionConfig)
    /// or TLS material couldn't be used (e.g. unparseable CA PEM).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Wraps an underlying I/O error that doesn't have a clearer
    /// classification yet. Call sites should prefer constructing one of
    /// the `ClientConnection*` variants via [`Error::from_io`] instead of
    /// letting this leak to callers.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The stable classification surface. New [`Error`] variants may be added
/// over time; this enum is the thing retry/reconnect logic matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Interface,
    ClientConnectionFailed,
    ClientConnectionFailedTemporarily,
    ClientConnectionTimeout,
    ClientConnectionClosed,
    BinaryProtocol,
    UnexpectedMessage,
    InvalidArgument,
    NoData,
    ResultCardinalityMismatch,
    DisabledCapability,
    Transaction,
    TransactionConflict,
    Authentication,
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tags consulted by retry/reconnect logic. Orthogonal to [`ErrorCategory`]:
/// a single category always carries the same tags, but the tags are what
/// [`ReconnectingConnection`](crate::connection::reconnecting::ReconnectingConnection)
/// and [`Transactable`](crate::connection::transactable::Transactable) key off of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    /// A fresh attempt (reconnect-and-retry, or backoff-and-retry inside a
    /// transaction) has a reasonable chance of succeeding.
    ShouldRetry,
    /// The underlying socket is unusable and must be replaced before any
    /// further operation is attempted.
    ShouldReconnect,
}

impl Error {
    /// Classifies this error. See spec §7.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Interface(_) => ErrorCategory::Interface,
            Error::ClientConnectionFailed(_) => ErrorCategory::ClientConnectionFailed,
            Error::ClientConnectionFailedTemporarily(_) => {
                ErrorCategory::ClientConnectionFailedTemporarily
            }
            Error::ClientConnectionTimeout(_) => ErrorCategory::ClientConnectionTimeout,
            Error::ClientConnectionClosed => ErrorCategory::ClientConnectionClosed,
            Error::BinaryProtocol(_) => ErrorCategory::BinaryProtocol,
            Error::UnexpectedMessage(_) => ErrorCategory::UnexpectedMessage,
            Error::InvalidArgument(_) => ErrorCategory::InvalidArgument,
            Error::NoData(_) => ErrorCategory::NoData,
            Error::ResultCardinalityMismatch(_) => ErrorCategory::ResultCardinalityMismatch,
            Error::DisabledCapability(_) => ErrorCategory::DisabledCapability,
            Error::Transaction(_) => ErrorCategory::Transaction,
            Error::TransactionConflict(_) => ErrorCategory::TransactionConflict,
            Error::Authentication(_) => ErrorCategory::Authentication,
            Error::Configuration(_) => ErrorCategory::Configuration,
            // An unclassified IO error is conservatively treated as a
            // non-temporary connection failure; callers that can tell more
            // (timeouts, ECONNRESET, ...) should use `from_io` instead.
            Error::Io(_) => ErrorCategory::ClientConnectionFailed,
        }
    }

    /// Returns true if this error carries `tag`.
    pub fn has_tag(&self, tag: ErrorTag) -> bool {
        match (self.category(), tag) {
            (
                ErrorCategory::ClientConnectionFailed
                | ErrorCategory::ClientConnectionFailedTemporarily
                | ErrorCategory::ClientConnectionClosed,
                ErrorTag::ShouldReconnect,
            ) => true,
            (
                ErrorCategory::ClientConnectionFailedTemporarily
                | ErrorCategory::TransactionConflict,
                ErrorTag::ShouldRetry,
            ) => true,
            _ => false,
        }
    }

    /// Classifies a raw I/O error into the appropriate `ClientConnection*`
    /// variant, per spec §4.5's failure model.
    pub fn from_io(err: std::io::Error) -> Error {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut => Error::ClientConnectionTimeout(err.to_string()),
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::AddrInUse
            | ErrorKind::NotFound => Error::ClientConnectionFailedTemporarily(err.to_string()),
            _ => Error::ClientConnectionFailed(err.to_string()),
        }
    }

    /// Renders an error-response header (spec §6) into a multi-line
    /// message with a caret under `position_start` on the line starting at
    /// `line_start`, followed by `hint` if present.
    pub fn display_with_caret(
        message: &str,
        query_text: Option<&str>,
        hint: Option<&str>,
        position_start: Option<u32>,
        line_start: Option<u32>,
    ) -> String {
        let mut out = String::new();
        out.push_str(message);

        if let (Some(text), Some(pos)) = (query_text, position_start) {
            let pos = pos as usize;
            if pos <= text.len() {
                let line = text[..pos]
                    .rfind('\n')
                    .map(|i| &text[i + 1..])
                    .unwrap_or(&text[..pos]);
                let rest_of_line = text[pos..].lines().next().unwrap_or("");

                out.push('\n');
                out.push_str(line);
                out.push_str(rest_of_line);
                out.push('\n');
                out.push_str(&" ".repeat(line.chars().count()));
                out.push('^');

                if let Some(line_no) = line_start {
                    out.push_str(&format!("  (line {line_no})"));
                }
            }
        }

        if let Some(hint) = hint {
            out.push_str("\nhint: ");
            out.push_str(hint);
        }

        out
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_connection_errors_should_reconnect_and_retry() {
        let err = Error::ClientConnectionFailedTemporarily("refused".into());
        assert!(err.has_tag(ErrorTag::ShouldReconnect));
        assert!(err.has_tag(ErrorTag::ShouldRetry));
    }

    #[test]
    fn closed_connection_should_reconnect_but_not_retry() {
        let err = Error::ClientConnectionClosed;
        assert!(err.has_tag(ErrorTag::ShouldReconnect));
        assert!(!err.has_tag(ErrorTag::ShouldRetry));
    }

    #[test]
    fn transaction_conflict_should_retry_but_not_reconnect() {
        let err = Error::TransactionConflict("serialization failure".into());
        assert!(err.has_tag(ErrorTag::ShouldRetry));
        assert!(!err.has_tag(ErrorTag::ShouldReconnect));
    }

    #[test]
    fn invalid_argument_is_terminal() {
        let err = Error::InvalidArgument("state.config.unknown_key".into());
        assert!(!err.has_tag(ErrorTag::ShouldRetry));
        assert!(!err.has_tag(ErrorTag::ShouldReconnect));
    }

    #[test]
    fn io_timeout_classifies_as_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline exceeded");
        let err = Error::from_io(io);
        assert_eq!(err.category(), ErrorCategory::ClientConnectionTimeout);
    }

    #[test]
    fn caret_points_at_position() {
        let msg = Error::display_with_caret(
            "invalid reference",
            Some("select * from\n  bogus"),
            Some("did you mean `bogus_table`?"),
            Some(17),
            Some(2),
        );
        assert!(msg.contains("^"));
        assert!(msg.contains("hint: did you mean"));
    }
}
