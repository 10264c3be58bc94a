//! Error types for dispatched platform calls.
//!
//! Every failure a call can end with is a variant of [`Error`]. Variants keep
//! the platform's `errcode`/`errmsg` and the raw response where one exists, so
//! a failed call can be diagnosed without re-running it. [`Error::kind`]
//! collapses the variants into the coarse [`ErrorKind`] taxonomy used for
//! recovery decisions.

use crate::interceptor::Phase;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::sync::Arc;

/// Boxed error returned by interceptor hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or duplicate credentials, unresolvable identity, bad URLs.
    Configuration,
    /// Network-level failure or a non-2xx HTTP status.
    Transport,
    /// The token endpoint failed, or the platform kept rejecting the token.
    Token,
    /// A business endpoint answered with a non-zero `errcode`.
    Api,
    /// An interceptor hook failed.
    Interceptor,
    /// The call was cancelled or ran past its deadline.
    Cancellation,
    /// The request body could not be serialized.
    Serialization,
    /// The response body could not be decoded.
    Deserialization,
}

/// The error type for dispatched calls.
///
/// `Error` is `Clone`: underlying causes are held behind `Arc` so a single
/// failed token fetch can be handed to every caller waiting on it.
///
/// # Examples
///
/// ```no_run
/// use wecom_dispatch::{Client, Context, Error};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .corp_id("ww0123456789")
///     .default_secret("secret")
///     .build()?;
///
/// match client.get::<serde_json::Value>(&Context::new(), "/cgi-bin/user/get").await {
///     Ok(response) => println!("user: {:?}", response.data),
///     Err(Error::Api { errcode, errmsg, .. }) => {
///         eprintln!("platform rejected the call: {errcode} {errmsg}");
///     }
///     Err(e) => eprintln!("call failed ({:?}): {e}", e.kind()),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Invalid client configuration, or the call selected an identity the
    /// configuration does not know.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A network-level error occurred (connection refused, DNS, timeout...).
    #[error("Transport error: {source}")]
    Transport {
        /// The underlying `reqwest` error.
        source: Arc<reqwest::Error>,
    },

    /// The server answered with a non-2xx HTTP status.
    #[error("HTTP error {status}: {raw_response}")]
    Http {
        /// The HTTP status code
        status: StatusCode,
        /// The raw response body
        raw_response: String,
        /// The response headers
        headers: HeaderMap,
    },

    /// Obtaining or using an access token failed.
    ///
    /// Raised when the token endpoint returns a non-zero `errcode` or a
    /// malformed payload, and when a business endpoint still rejects the
    /// token after one refresh.
    #[error("Token error {errcode}: {errmsg}")]
    Token {
        /// The platform error code (`-1` for malformed payloads)
        errcode: i64,
        /// The platform error message
        errmsg: String,
    },

    /// A business endpoint returned a non-zero `errcode`.
    #[error("API error {errcode}: {errmsg}")]
    Api {
        /// The platform error code
        errcode: i64,
        /// The platform error message
        errmsg: String,
        /// The full envelope as received
        raw_response: Bytes,
    },

    /// An interceptor hook failed.
    #[error("Interceptor error in {phase} hook #{index}: {source}")]
    Interceptor {
        /// The phase the failing hook was registered for
        phase: Phase,
        /// Registration index of the hook within its phase
        index: usize,
        /// The error returned by the hook
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// The call's cancellation token fired.
    #[error("Call cancelled")]
    Cancelled,

    /// The call ran past its deadline.
    #[error("Call deadline exceeded")]
    DeadlineExceeded,

    /// Failed to serialize the request body.
    #[error("Failed to serialize request: {0}")]
    Serialization(String),

    /// Failed to decode the response body.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    Deserialization {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// All transport retries were used up.
    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        /// The number of attempts made
        attempts: usize,
        /// The last error encountered
        last_error: Box<Error>,
    },

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport {
            source: Arc::new(err),
        }
    }
}

impl Error {
    pub(crate) fn token(errcode: i64, errmsg: impl Into<String>) -> Self {
        Error::Token {
            errcode,
            errmsg: errmsg.into(),
        }
    }

    /// Returns the coarse [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::InvalidUrl(_) => ErrorKind::Configuration,
            Error::Transport { .. } | Error::Http { .. } => ErrorKind::Transport,
            Error::MaxRetriesExceeded { .. } => ErrorKind::Transport,
            Error::Token { .. } => ErrorKind::Token,
            Error::Api { .. } => ErrorKind::Api,
            Error::Interceptor { .. } => ErrorKind::Interceptor,
            Error::Cancelled | Error::DeadlineExceeded => ErrorKind::Cancellation,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Deserialization { .. } => ErrorKind::Deserialization,
        }
    }

    /// Returns `true` if a transport retry may help.
    ///
    /// Network errors, 5xx statuses and 429 are retryable. Platform errcodes
    /// never are; token rejection has its own one-shot recovery.
    ///
    /// # Examples
    ///
    /// ```
    /// use wecom_dispatch::Error;
    /// use http::StatusCode;
    ///
    /// let err = Error::Http {
    ///     status: StatusCode::BAD_GATEWAY,
    ///     raw_response: "upstream down".to_string(),
    ///     headers: http::HeaderMap::new(),
    /// };
    /// assert!(err.is_retryable());
    ///
    /// let err = Error::Token { errcode: 40001, errmsg: "invalid credential".into() };
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Http { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Returns the platform `errcode`, if the error carries one.
    pub fn errcode(&self) -> Option<i64> {
        match self {
            Error::Token { errcode, .. } | Error::Api { errcode, .. } => Some(*errcode),
            Error::MaxRetriesExceeded { last_error, .. } => last_error.errcode(),
            _ => None,
        }
    }

    /// Returns the platform `errmsg`, if the error carries one.
    pub fn errmsg(&self) -> Option<&str> {
        match self {
            Error::Token { errmsg, .. } | Error::Api { errmsg, .. } => Some(errmsg),
            Error::MaxRetriesExceeded { last_error, .. } => last_error.errmsg(),
            _ => None,
        }
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::Deserialization { status, .. } => Some(*status),
            Error::MaxRetriesExceeded { last_error, .. } => last_error.status(),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&[u8]> {
        match self {
            Error::Http { raw_response, .. } => Some(raw_response.as_bytes()),
            Error::Deserialization { raw_response, .. } => Some(raw_response.as_bytes()),
            Error::Api { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }
}

/// A specialized `Result` type for dispatched calls.
pub type Result<T> = std::result::Result<T, Error>;
