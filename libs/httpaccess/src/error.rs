use std::time::Duration;
use thiserror::Error;

/// Boxed error used for transport causes
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL scheme is not http or https
    UnsupportedScheme,
}

/// Failure raised while exchanging bytes with the remote side.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// Connect, response-header or body read exceeded the configured timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Network, DNS, TLS or proxy tunnel failure
    #[error("{0}")]
    Io(#[source] BoxError),

    /// Internal service failure (buffer worker died, channel closed)
    #[error("service unavailable: internal failure")]
    ServiceClosed,
}

/// HTTP access error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpAccessError {
    /// The request could not be delivered or its response could not be read.
    ///
    /// `url` is always password-redacted.
    #[error("Error connecting to '{url}': {source}")]
    AccessFailed {
        url: String,
        #[source]
        source: TransportError,
    },

    /// The response status was rejected by the response validator.
    ///
    /// `url` is always password-redacted. `body` holds the response body, or a
    /// placeholder when it could not be read.
    #[error(
        "Invalid response status {status} for '{url}'\nResponse body :\n>>>\n{body}\n<<<"
    )]
    InvalidResponseStatus {
        status: u16,
        url: String,
        body: String,
    },

    /// Local file or output sink failure
    #[error("{context}: {source}")]
    LocalResource {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid URL
    ///
    /// Use the `kind` field for programmatic matching. The `reason` field is a
    /// diagnostic message intended for logging only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        url: String,
        kind: InvalidUriKind,
        reason: String,
    },

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// JSON serialization failed
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Charset name is not one of the supported charsets
    #[error("Unsupported charset '{0}'")]
    UnsupportedCharset(String),

    /// Configuration rejected at service construction
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The request authenticator refused to sign the request
    #[error("Request authentication failed: {0}")]
    Authentication(#[source] BoxError),

    /// TLS initialization failed
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),
}

impl HttpAccessError {
    /// Status code carried by an [`HttpAccessError::InvalidResponseStatus`]
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::InvalidResponseStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Response body captured by an [`HttpAccessError::InvalidResponseStatus`]
    #[must_use]
    pub fn response_body(&self) -> Option<&str> {
        match self {
            Self::InvalidResponseStatus { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Returns `true` when the failure is a transport timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::AccessFailed {
                source: TransportError::Timeout(_),
                ..
            }
        )
    }

    pub(crate) fn local(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::LocalResource {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_status_message_embeds_body() {
        let err = HttpAccessError::InvalidResponseStatus {
            status: 500,
            url: "http://localhost/x".to_owned(),
            body: "boom".to_owned(),
        };

        let msg = err.to_string();
        assert!(msg.starts_with("Invalid response status 500 for 'http://localhost/x'"));
        assert!(msg.ends_with("\nResponse body :\n>>>\nboom\n<<<"));
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.response_body(), Some("boom"));
    }

    #[test]
    fn test_timeout_detection() {
        let err = HttpAccessError::AccessFailed {
            url: "http://localhost".to_owned(),
            source: TransportError::Timeout(Duration::from_millis(5)),
        };
        assert!(err.is_timeout());
        assert!(err.status().is_none());

        let err = HttpAccessError::AccessFailed {
            url: "http://localhost".to_owned(),
            source: TransportError::ServiceClosed,
        };
        assert!(!err.is_timeout());
    }
}
