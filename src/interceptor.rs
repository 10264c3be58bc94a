//! Interceptor hooks run at three points of every call.
//!
//! Hooks observe (and, before the request, mutate) a call without changing
//! how the dispatcher proceeds. Each phase keeps its own list; hooks run in
//! registration order and the first failing hook stops the rest of its
//! phase.
//!
//! Any closure with the right signature is a hook:
//!
//! ```
//! use wecom_dispatch::{Client, Hook};
//!
//! # fn example() -> Result<(), wecom_dispatch::Error> {
//! let client = Client::builder()
//!     .corp_id("ww0123456789")
//!     .default_secret("secret")
//!     .hook(Hook::before_request(|_ctx, req: &mut reqwest::Request| {
//!         req.headers_mut()
//!             .insert("x-client", http::HeaderValue::from_static("billing"));
//!         Ok(())
//!     }))
//!     .hook(Hook::after_decode(|ctx, envelope| {
//!         tracing::info!(trace_id = ?ctx.trace_id(), errcode = envelope.errcode, "call finished");
//!         Ok(())
//!     }))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use crate::context::Context;
use crate::envelope::{RawResponse, ResponseEnvelope};
use crate::error::BoxError;
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// The point in a call at which a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// After the request is materialized, before any network I/O.
    BeforeRequest,
    /// After the HTTP response arrives, before the envelope is decoded.
    RawResponse,
    /// After the envelope is decoded.
    AfterDecode,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::BeforeRequest => "before-request",
            Phase::RawResponse => "raw-response",
            Phase::AfterDecode => "after-decode",
        })
    }
}

/// Sees the materialized request, token already attached. May edit headers.
/// An error aborts the call before it reaches the network.
pub trait BeforeRequest: Send + Sync {
    /// Inspects or edits `request`.
    fn before_request(&self, ctx: &Context, request: &mut reqwest::Request)
        -> std::result::Result<(), BoxError>;
}

/// Sees the undecoded response. An error aborts the call.
pub trait RawResponseHook: Send + Sync {
    /// Inspects `response`.
    fn on_raw_response(&self, ctx: &Context, response: &RawResponse)
        -> std::result::Result<(), BoxError>;
}

/// Sees the decoded envelope of a finished call. An error replaces the
/// call's result with [`Error::Interceptor`], even when the envelope was a
/// success, but the call itself is not retried.
pub trait AfterDecode: Send + Sync {
    /// Inspects `envelope`.
    fn after_decode(&self, ctx: &Context, envelope: &ResponseEnvelope)
        -> std::result::Result<(), BoxError>;
}

impl<F> BeforeRequest for F
where
    F: Fn(&Context, &mut reqwest::Request) -> std::result::Result<(), BoxError> + Send + Sync,
{
    fn before_request(
        &self,
        ctx: &Context,
        request: &mut reqwest::Request,
    ) -> std::result::Result<(), BoxError> {
        self(ctx, request)
    }
}

impl<F> RawResponseHook for F
where
    F: Fn(&Context, &RawResponse) -> std::result::Result<(), BoxError> + Send + Sync,
{
    fn on_raw_response(
        &self,
        ctx: &Context,
        response: &RawResponse,
    ) -> std::result::Result<(), BoxError> {
        self(ctx, response)
    }
}

impl<F> AfterDecode for F
where
    F: Fn(&Context, &ResponseEnvelope) -> std::result::Result<(), BoxError> + Send + Sync,
{
    fn after_decode(
        &self,
        ctx: &Context,
        envelope: &ResponseEnvelope,
    ) -> std::result::Result<(), BoxError> {
        self(ctx, envelope)
    }
}

/// A hook tagged with the phase it runs in.
#[derive(Clone)]
pub enum Hook {
    /// See [`BeforeRequest`].
    BeforeRequest(Arc<dyn BeforeRequest>),
    /// See [`RawResponseHook`].
    RawResponse(Arc<dyn RawResponseHook>),
    /// See [`AfterDecode`].
    AfterDecode(Arc<dyn AfterDecode>),
}

impl Hook {
    /// Wraps a before-request closure.
    ///
    /// Types implementing [`BeforeRequest`] directly can be registered with
    /// `Hook::BeforeRequest(Arc::new(hook))`.
    pub fn before_request<F>(f: F) -> Self
    where
        F: Fn(&Context, &mut reqwest::Request) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        Hook::BeforeRequest(Arc::new(f))
    }

    /// Wraps a raw-response closure.
    pub fn raw_response<F>(f: F) -> Self
    where
        F: Fn(&Context, &RawResponse) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        Hook::RawResponse(Arc::new(f))
    }

    /// Wraps an after-decode closure.
    pub fn after_decode<F>(f: F) -> Self
    where
        F: Fn(&Context, &ResponseEnvelope) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        Hook::AfterDecode(Arc::new(f))
    }

    /// The phase this hook runs in.
    pub fn phase(&self) -> Phase {
        match self {
            Hook::BeforeRequest(_) => Phase::BeforeRequest,
            Hook::RawResponse(_) => Phase::RawResponse,
            Hook::AfterDecode(_) => Phase::AfterDecode,
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hook({})", self.phase())
    }
}

/// Ordered hook lists, one per [`Phase`].
#[derive(Clone, Default)]
pub struct InterceptorChain {
    before_request: Vec<Arc<dyn BeforeRequest>>,
    raw_response: Vec<Arc<dyn RawResponseHook>>,
    after_decode: Vec<Arc<dyn AfterDecode>>,
}

impl InterceptorChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `hook` to the list of its phase.
    pub fn push(&mut self, hook: Hook) {
        match hook {
            Hook::BeforeRequest(h) => self.before_request.push(h),
            Hook::RawResponse(h) => self.raw_response.push(h),
            Hook::AfterDecode(h) => self.after_decode.push(h),
        }
    }

    /// Number of hooks registered for `phase`.
    pub fn len(&self, phase: Phase) -> usize {
        match phase {
            Phase::BeforeRequest => self.before_request.len(),
            Phase::RawResponse => self.raw_response.len(),
            Phase::AfterDecode => self.after_decode.len(),
        }
    }

    /// Returns `true` if no hook is registered in any phase.
    pub fn is_empty(&self) -> bool {
        self.before_request.is_empty() && self.raw_response.is_empty() && self.after_decode.is_empty()
    }

    pub(crate) fn run_before_request(
        &self,
        ctx: &Context,
        request: &mut reqwest::Request,
    ) -> Result<()> {
        for (index, hook) in self.before_request.iter().enumerate() {
            hook.before_request(ctx, request)
                .map_err(|e| failed(Phase::BeforeRequest, index, e))?;
        }
        Ok(())
    }

    pub(crate) fn run_raw_response(&self, ctx: &Context, response: &RawResponse) -> Result<()> {
        for (index, hook) in self.raw_response.iter().enumerate() {
            hook.on_raw_response(ctx, response)
                .map_err(|e| failed(Phase::RawResponse, index, e))?;
        }
        Ok(())
    }

    pub(crate) fn run_after_decode(&self, ctx: &Context, envelope: &ResponseEnvelope) -> Result<()> {
        for (index, hook) in self.after_decode.iter().enumerate() {
            hook.after_decode(ctx, envelope)
                .map_err(|e| failed(Phase::AfterDecode, index, e))?;
        }
        Ok(())
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("before_request", &self.before_request.len())
            .field("raw_response", &self.raw_response.len())
            .field("after_decode", &self.after_decode.len())
            .finish()
    }
}

fn failed(phase: Phase, index: usize, source: BoxError) -> Error {
    tracing::warn!(%phase, index, error = %source, "Interceptor hook failed");
    Error::Interceptor {
        phase,
        index,
        source: Arc::from(source),
    }
}

/// Logs materialized requests and decoded envelopes at debug level.
///
/// Installed by [`ClientBuilder::debug`](crate::ClientBuilder::debug). The
/// `access_token` query parameter is redacted.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks;

impl TracingHooks {
    /// The hooks to register, one per phase it observes.
    pub fn hooks() -> [Hook; 2] {
        [
            Hook::BeforeRequest(Arc::new(TracingHooks)),
            Hook::AfterDecode(Arc::new(TracingHooks)),
        ]
    }
}

impl BeforeRequest for TracingHooks {
    fn before_request(
        &self,
        ctx: &Context,
        request: &mut reqwest::Request,
    ) -> std::result::Result<(), BoxError> {
        let mut url = request.url().clone();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                let v = if k == crate::request::ACCESS_TOKEN_PARAM {
                    "<redacted>".to_string()
                } else {
                    v.into_owned()
                };
                (k.into_owned(), v)
            })
            .collect();
        url.query_pairs_mut().clear().extend_pairs(pairs);

        let body = request
            .body()
            .and_then(|b| b.as_bytes())
            .map(String::from_utf8_lossy);

        tracing::debug!(
            method = %request.method(),
            url = %url,
            trace_id = ctx.trace_id(),
            body = body.as_deref(),
            "Dispatching request"
        );
        Ok(())
    }
}

impl AfterDecode for TracingHooks {
    fn after_decode(
        &self,
        ctx: &Context,
        envelope: &ResponseEnvelope,
    ) -> std::result::Result<(), BoxError> {
        tracing::debug!(
            errcode = envelope.errcode,
            errmsg = %envelope.errmsg,
            trace_id = ctx.trace_id(),
            "Decoded envelope"
        );
        Ok(())
    }
}
