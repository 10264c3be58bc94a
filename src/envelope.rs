//! The `{errcode, errmsg, ...}` envelope shared by every platform response.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

/// The common response wrapper.
///
/// `errcode == 0` means success. Endpoint-specific fields are kept in
/// [`ResponseEnvelope::fields`].
///
/// # Examples
///
/// ```
/// use wecom_dispatch::ResponseEnvelope;
///
/// let envelope: ResponseEnvelope =
///     serde_json::from_str(r#"{"errcode":0,"errmsg":"ok","userid":"zhangsan"}"#).unwrap();
/// assert!(envelope.is_success());
/// assert_eq!(envelope.fields["userid"], "zhangsan");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Platform error code; absent is treated as `0`.
    #[serde(default)]
    pub errcode: i64,
    /// Platform error message.
    #[serde(default)]
    pub errmsg: String,
    /// Endpoint-specific fields.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ResponseEnvelope {
    /// Returns `true` if `errcode` is `0`.
    pub fn is_success(&self) -> bool {
        self.errcode == 0
    }
}

/// An HTTP response before envelope decoding, as seen by raw-response hooks.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The undecoded body.
    pub body: Bytes,
}

impl RawResponse {
    /// Returns a header value by name, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

/// Payload of the token issuance endpoint.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenPayload {
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}
