//! Successful call results.
//!
//! [`Response`] pairs the decoded data with details of how it was obtained:
//! raw envelope, HTTP status, headers, latency across all attempts, and
//! whether a token refresh was needed along the way.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::time::Duration;

/// A successful call.
///
/// # Type Parameters
///
/// * `T` - The type of the decoded data; [`Bytes`] for
///   [`Client::execute`](crate::Client::execute).
///
/// # Examples
///
/// ```no_run
/// use wecom_dispatch::{Client, Context};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct User {
///     userid: String,
///     name: String,
/// }
///
/// # async fn example() -> Result<(), wecom_dispatch::Error> {
/// let client = Client::builder()
///     .corp_id("ww0123456789")
///     .default_secret("secret")
///     .build()?;
///
/// let ctx = Context::new().with_trace_id("req-1");
/// let response = client
///     .get_with_query::<User>(&ctx, "/cgi-bin/user/get", [("userid", "zhangsan")])
///     .await?;
///
/// println!("User: {}", response.data.name);
/// println!("Took {:?} over {} attempt(s)", response.latency, response.attempts);
/// if response.token_refreshed {
///     println!("Token was refreshed mid-call");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// Decoded payload.
    pub data: T,
    /// Envelope bytes of the final attempt.
    pub raw_body: Bytes,
    /// Status of the final attempt.
    pub status: StatusCode,
    /// Headers of the final attempt.
    pub headers: HeaderMap,
    /// Wall time of the whole call, token fetches and retry pauses included.
    pub latency: Duration,
    /// Business requests sent. Each transport resend and the token-refresh
    /// resend count, so `1` means the first request went through.
    pub attempts: usize,
    /// The first token was rejected and the call went through with a
    /// refreshed one.
    pub token_refreshed: bool,
}

impl<T> Response<T> {
    /// Assembles a response for a call that went through without a token
    /// refresh.
    pub fn new(
        data: T,
        raw_body: Bytes,
        status: StatusCode,
        headers: HeaderMap,
        latency: Duration,
        attempts: usize,
    ) -> Self {
        Response {
            data,
            raw_body,
            status,
            headers,
            latency,
            attempts,
            token_refreshed: false,
        }
    }

    /// Replaces the data, keeping the call details.
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        let Response {
            data,
            raw_body,
            status,
            headers,
            latency,
            attempts,
            token_refreshed,
        } = self;
        Response {
            data: f(data),
            raw_body,
            status,
            headers,
            latency,
            attempts,
            token_refreshed,
        }
    }

    /// Returns `true` if more than one HTTP request was sent.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// A response header as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
