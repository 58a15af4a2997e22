//! Error types for direct-postgres.

use thiserror::Error;

use crate::cancel::CancelCause;

/// Result type for direct-postgres operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Server-sent error or notice, with the full protocol field set.
///
/// The same structure carries `ErrorResponse` and `NoticeResponse` payloads;
/// notices are delivered through the notice callback, errors through
/// [`Error::Server`].
#[derive(Debug, Clone, Default)]
pub struct PgError {
    /// Severity (localized): ERROR, FATAL, PANIC, WARNING, NOTICE, ...
    pub severity: Option<String>,
    /// Severity (non-localized, PostgreSQL 9.6+)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Position in internal query
    pub internal_position: Option<u32>,
    /// Failed internal command text
    pub internal_query: Option<String>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Data type name
    pub data_type: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Source file name
    pub file: Option<String>,
    /// Source line number
    pub line: Option<u32>,
    /// Source routine name
    pub routine: Option<String>,
}

impl PgError {
    /// SQLSTATE code, or `""` when the server sent none.
    pub fn sqlstate(&self) -> &str {
        self.code.as_deref().unwrap_or_default()
    }

    /// Non-localized severity when available, localized otherwise.
    pub fn severity(&self) -> &str {
        self.severity_non_localized
            .as_deref()
            .or(self.severity.as_deref())
            .unwrap_or_default()
    }

    /// FATAL and PANIC responses terminate the backend; the connection
    /// cannot be reused after one.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity(), "FATAL" | "PANIC")
    }
}

impl std::fmt::Display for PgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (SQLSTATE {})",
            self.severity(),
            self.message.as_deref().unwrap_or_default(),
            self.sqlstate()
        )?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PgError {}

/// Composite connect failure: one cause per attempted endpoint.
#[derive(Debug)]
pub struct ConnectError {
    /// `(endpoint description, cause)` in attempt order.
    pub attempts: Vec<(String, Error)>,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to connect to any endpoint")?;
        for (endpoint, cause) in &self.attempts {
            write!(f, "\n  {endpoint}: {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConnectError {}

/// Error type for direct-postgres.
#[derive(Debug, Error)]
pub enum Error {
    /// Server error response. Statement-level; the connection stays usable.
    #[error("{0}")]
    Server(PgError),

    /// All connect attempts failed; per-endpoint causes inside.
    #[error("{0}")]
    Connect(ConnectError),

    /// Connection config could not be parsed.
    #[error("invalid connection config: {0}")]
    Config(String),

    /// An operation is already in progress on this connection.
    #[error("connection busy")]
    Lock,

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,

    /// The cancellation token had already fired before any bytes were sent.
    #[error("operation was canceled before it started: {0}")]
    AlreadyCanceled(CancelCause),

    /// The operation was canceled mid-flight. The connection is closed.
    #[error("operation canceled: {0}")]
    Canceled(CancelCause),

    /// Parameter count exceeds the two-byte wire limit.
    #[error("extended protocol limited to 65535 parameters")]
    TooManyParams,

    /// Transport write failed. Always fatal to the connection.
    #[error("write failed: {0}")]
    Write(std::io::Error),

    /// Transport read or dial failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS negotiation or record-layer failure.
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Authentication failed before the server accepted the session.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Caller misuse (embedded NUL, missing backend key, ...).
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// Feature or protocol capability this client does not speak.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Malformed message or protocol-order violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// The no-bytes-sent marker.
    ///
    /// When true, the failed operation is guaranteed not to have written to
    /// the transport, so the server state is unchanged and the caller may
    /// retry (on this connection for [`Error::Lock`], elsewhere otherwise).
    pub fn is_safe_to_retry(&self) -> bool {
        matches!(
            self,
            Error::Lock
                | Error::Closed
                | Error::AlreadyCanceled(_)
                | Error::TooManyParams
                | Error::Config(_)
                | Error::InvalidUsage(_)
        )
    }

    /// Returns true if the error leaves the connection unusable.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::Write(_) | Error::Tls(_) | Error::Canceled(_) => true,
            Error::Server(err) => err.is_fatal(),
            Error::Protocol(_) => true,
            _ => false,
        }
    }

    /// SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(err) => Some(err.sqlstate()),
            _ => None,
        }
    }

    /// Borrow the server error fields if this is a server error.
    pub fn as_pg_error(&self) -> Option<&PgError> {
        match self {
            Error::Server(err) => Some(err),
            _ => None,
        }
    }
}
