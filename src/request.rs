//! Canonical requests.
//!
//! A [`RequestBuilder`] holds the endpoint-specific parts of a call (method,
//! path, query, extra headers). Each attempt turns it into an immutable
//! [`CanonicalRequest`] carrying the token that attempt resolved; a retry
//! builds a new one rather than editing the old.

use crate::config::{Credential, CredentialKey};
use crate::{Error, Result};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use std::time::Duration;
use url::Url;

/// Query parameter carrying the access token.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Header carrying the call's trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// The endpoint-specific half of a request.
///
/// # Examples
///
/// ```
/// use wecom_dispatch::RequestBuilder;
/// use http::Method;
///
/// let request = RequestBuilder::new(Method::GET, "/cgi-bin/user/get")
///     .query("userid", "zhangsan");
/// assert_eq!(request.path(), "/cgi-bin/user/get");
/// ```
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
}

impl RequestBuilder {
    /// Creates a builder for `method` on `path` (relative to the base URL).
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    /// Appends a query parameter. Order is preserved.
    ///
    /// An `access_token` parameter is ignored; the dispatcher supplies it.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if key != ACCESS_TOKEN_PARAM {
            self.query.push((key, value.into()));
        }
        self
    }

    /// Appends several query parameters.
    pub fn query_pairs<K, V>(self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        params
            .into_iter()
            .fold(self, |builder, (k, v)| builder.query(k, v))
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::Configuration(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::Configuration(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Builds the request for one attempt, attaching `token` and serializing
    /// `body` to JSON.
    ///
    /// # Errors
    ///
    /// Fails only with [`Error::Serialization`].
    pub fn build<B>(
        &self,
        credential: &Credential,
        token: &str,
        body: Option<&B>,
    ) -> Result<CanonicalRequest>
    where
        B: Serialize + ?Sized,
    {
        let body = body
            .map(|b| serde_json::to_vec(b).map(Bytes::from))
            .transpose()
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let mut query = self.query.clone();
        query.push((ACCESS_TOKEN_PARAM.to_string(), token.to_string()));

        Ok(CanonicalRequest {
            method: self.method.clone(),
            path: self.path.clone(),
            query,
            headers: self.headers.clone(),
            body,
            credential: credential.key().clone(),
        })
    }
}

/// A fully resolved request for one attempt. Never mutated once built.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
    credential: CredentialKey,
}

impl CanonicalRequest {
    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query parameters in order, `access_token` last.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// The token attached to this request.
    pub fn token(&self) -> Option<&str> {
        self.query
            .iter()
            .rev()
            .find(|(k, _)| k == ACCESS_TOKEN_PARAM)
            .map(|(_, v)| v.as_str())
    }

    /// The serialized JSON body, if any.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// The credential the token belongs to.
    pub fn credential(&self) -> &CredentialKey {
        &self.credential
    }

    /// Materializes this request as a `reqwest::Request` against `base_url`.
    pub(crate) fn to_http(
        &self,
        http_client: &reqwest::Client,
        base_url: &Url,
        trace_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Request> {
        let mut url = base_url.clone();
        url.set_path(&self.path);
        url.query_pairs_mut().extend_pairs(&self.query);

        let mut request = http_client
            .request(self.method.clone(), url)
            .headers(self.headers.clone());

        if let Some(trace_id) = trace_id {
            request = request.header(TRACE_ID_HEADER, trace_id);
        }

        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        if let Some(body) = &self.body {
            request = request
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        request
            .build()
            .map_err(|e| Error::Configuration(format!("Invalid request: {}", e)))
    }
}
