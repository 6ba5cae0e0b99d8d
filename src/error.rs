use thiserror::Error;

/// Unified error type for the broker, grounded in the short `errmsg` kinds the
/// checker and pool use for metrics and retry decisions.
#[derive(Error, Debug)]
pub enum RotaError {
    #[error("connection failed: {0}")]
    ProxyConnError(String),

    #[error("connection timed out")]
    ProxyTimeoutError,

    #[error("connection was reset while sending")]
    ProxySendError(String),

    #[error("connection was reset while receiving")]
    ProxyRecvError(String),

    #[error("empty response from proxy")]
    ProxyEmptyRecvError,

    #[error("bad status: {0}")]
    BadStatusError(String),

    #[error("response could not be parsed as HTTP")]
    BadResponseError,

    #[error("malformed start line: {0}")]
    BadStatusLine(String),

    #[error("stream forwarding failed: {0}")]
    ErrorOnStream(String),

    #[error("DNS resolution failed for {host}")]
    ResolveError { host: String },

    #[error("proxy pool exhausted")]
    NoProxyError,

    #[error("no working judge available for any requested protocol scheme")]
    NoJudgesAvailable,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, RotaError>;

impl RotaError {
    /// Short error-kind string used by `Proxy::log` to bucket `stat.errors`
    /// and by `show_stats` reporting, matching the taxonomy of metrics keys.
    pub fn errmsg(&self) -> &'static str {
        match self {
            RotaError::ProxyConnError(_) => "connection_failed",
            RotaError::ProxyTimeoutError => "connection_timeout",
            RotaError::ProxySendError(_) | RotaError::ProxyRecvError(_) => "connection_is_reset",
            RotaError::ProxyEmptyRecvError => "empty_response",
            RotaError::BadStatusError(_) => "bad_status",
            RotaError::BadResponseError => "bad_response",
            RotaError::BadStatusLine(_) => "bad_status_line",
            RotaError::ErrorOnStream(_) => "error_on_stream",
            RotaError::ResolveError { .. } => "resolve_failed",
            RotaError::NoProxyError => "no_proxy",
            _ => "internal",
        }
    }
}

impl From<reqwest::Error> for RotaError {
    fn from(err: reqwest::Error) -> Self {
        RotaError::Http(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RotaError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RotaError::ProxyTimeoutError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errmsg_mapping_matches_taxonomy() {
        assert_eq!(
            RotaError::ProxyConnError("refused".into()).errmsg(),
            "connection_failed"
        );
        assert_eq!(RotaError::ProxyTimeoutError.errmsg(), "connection_timeout");
        assert_eq!(
            RotaError::ProxySendError("reset".into()).errmsg(),
            "connection_is_reset"
        );
        assert_eq!(RotaError::ProxyEmptyRecvError.errmsg(), "empty_response");
        assert_eq!(
            RotaError::BadStatusError("500".into()).errmsg(),
            "bad_status"
        );
        assert_eq!(RotaError::BadResponseError.errmsg(), "bad_response");
        assert_eq!(RotaError::NoProxyError.errmsg(), "no_proxy");
    }
}
