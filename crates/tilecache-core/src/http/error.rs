//! Transport error type and its classification for logging.

/// Error returned by a single tile GET (curl failure, HTTP error, or bad redirect).
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Curl reported an error (timeout, connection, etc.).
    #[error("{0}")]
    Curl(#[from] curl::Error),
    /// HTTP response had a non-2xx, non-redirect status.
    #[error("HTTP {0}")]
    Http(u32),
    /// Redirect status without a usable `Location` header.
    #[error("HTTP {0} redirect without Location header")]
    MissingLocation(u32),
    /// `Location` header could not be resolved against the request URL.
    #[error("invalid redirect target {target:?}: {source}")]
    InvalidRedirect {
        target: String,
        #[source]
        source: url::ParseError,
    },
}

/// High-level classification of a transport error.
///
/// Every kind is retried by the queue sets (the per-job retry counter is the
/// only bound); the kind is recorded in logs so throttling and dead hosts can
/// be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation timed out (connect/read).
    Timeout,
    /// Server asked us to slow down (e.g. 429, 503).
    Throttled,
    /// Network-level failure (connection reset, DNS, etc.).
    Connection,
    /// Server-side failure (5xx other than 503).
    Http5xx(u16),
    /// Tile does not exist or access is denied (4xx).
    Http4xx(u16),
    /// Anything else (malformed redirects, unexpected statuses).
    Other,
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Curl(e) => classify_curl_error(e),
            FetchError::Http(code) => classify_http_status(*code),
            FetchError::MissingLocation(_) | FetchError::InvalidRedirect { .. } => ErrorKind::Other,
        }
    }
}

/// Classify an HTTP status code.
pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code as u16),
        400..=499 => ErrorKind::Http4xx(code as u16),
        _ => ErrorKind::Other,
    }
}

/// Classify a curl error.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
    {
        return ErrorKind::Connection;
    }
    ErrorKind::Other
}
