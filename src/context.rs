//! Per-call context: identity selection, trace id and cancellation.
//!
//! A [`Context`] is passed explicitly to every call. It never mutates the
//! shared client configuration; it only picks which registered agent the call
//! acts as and how long the caller is willing to wait.

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a call selects a registered agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSelector {
    /// Select by numeric agent id.
    Id(i64),
    /// Select by registered agent name.
    Name(String),
}

/// Per-call options.
///
/// All fields are optional. With none set, the call uses the client's
/// default credential, carries no trace id and can only be stopped by
/// dropping its future.
///
/// # Examples
///
/// ```
/// use wecom_dispatch::Context;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// let cancel = CancellationToken::new();
/// let ctx = Context::new()
///     .with_agent_name("study")
///     .with_trace_id("req-7f3a")
///     .with_cancellation(cancel.clone())
///     .with_timeout(Duration::from_secs(5));
///
/// assert_eq!(ctx.trace_id(), Some("req-7f3a"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    agent_id: Option<i64>,
    agent_name: Option<String>,
    trace_id: Option<String>,
    cancellation: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Context {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acts as the agent registered under `agent_id`.
    pub fn with_agent_id(mut self, agent_id: i64) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    /// Acts as the agent registered under `name`.
    ///
    /// An agent id set with [`Context::with_agent_id`] takes precedence.
    pub fn with_agent_name(mut self, name: impl Into<String>) -> Self {
        self.agent_name = Some(name.into());
        self
    }

    /// Attaches an opaque trace id, sent as the `X-Trace-Id` header and
    /// recorded on log events.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Stops the call when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Fails the call with [`Error::DeadlineExceeded`] once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The agent this call selected, id first.
    pub fn agent(&self) -> Option<AgentSelector> {
        match (self.agent_id, &self.agent_name) {
            (Some(id), _) => Some(AgentSelector::Id(id)),
            (None, Some(name)) => Some(AgentSelector::Name(name.clone())),
            (None, None) => None,
        }
    }

    /// The trace id, if one was attached.
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// The cancellation token, if one was attached.
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// The deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the cancellation error if the call must not proceed.
    pub(crate) fn check(&self) -> Result<()> {
        if self.cancellation.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Runs `fut` until it completes, the token is cancelled or the deadline
    /// passes, whichever comes first. `fut` is dropped on cancellation.
    pub(crate) async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;

        let cancelled = async {
            match &self.cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
            result = fut => result,
        }
    }
}
