use thiserror::Error;

/// Error kinds recognised by the request-servicing core.
///
/// Upstream errors are retriable against alternate next-hops before they
/// surface; cache errors never surface; hook errors short-circuit to the
/// response-emission state.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    ParseError(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("upstream closed before {expected} bytes ({received} received)")]
    UpstreamTruncated { expected: u64, received: u64 },

    #[error("client aborted")]
    ClientAbort,

    #[error("hook error (status {status})")]
    HookError { status: u16 },

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status emitted to the client for this error, if any.
    ///
    /// `UpstreamTruncated` and `ClientAbort` return `None`: the response
    /// status is already on the wire when they occur.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProxyError::ParseError(_) => Some(400),
            ProxyError::UpstreamUnreachable(_) => Some(502),
            ProxyError::UpstreamTimeout(_) => Some(504),
            ProxyError::HookError { status } => Some(*status),
            ProxyError::UpstreamTruncated { .. } | ProxyError::ClientAbort => None,
            // Cache outages are transparent; anything that still surfaces a
            // status here is an internal failure.
            ProxyError::CacheUnavailable(_) => None,
            ProxyError::ConfigError(_) | ProxyError::Io(_) | ProxyError::Internal(_) => Some(500),
        }
    }

    /// Plain-text body for the error response. Diagnostics go to the log
    /// sink, not to the client.
    pub fn body(&self) -> Vec<u8> {
        let status = self.status_code().unwrap_or(500);
        let reason = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Error");
        format!("{status} {reason}\r\n").into_bytes()
    }

    /// Stable tag for log correlation.
    pub fn tag(&self) -> &'static str {
        match self {
            ProxyError::ParseError(_) => "parse_error",
            ProxyError::UpstreamUnreachable(_) => "upstream_unreachable",
            ProxyError::UpstreamTimeout(_) => "upstream_timeout",
            ProxyError::UpstreamTruncated { .. } => "upstream_truncated",
            ProxyError::ClientAbort => "client_abort",
            ProxyError::HookError { .. } => "hook_error",
            ProxyError::CacheUnavailable(_) => "cache_unavailable",
            ProxyError::ConfigError(_) => "config_error",
            ProxyError::Io(_) => "io_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}
