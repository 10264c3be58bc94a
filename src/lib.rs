//! # wecom-dispatch - dispatch core for an enterprise platform API
//!
//! Every endpoint of the platform takes an `access_token` query parameter and
//! answers with a `{"errcode": .., "errmsg": .., ...}` envelope. This crate is
//! the shared core those endpoint calls go through: it obtains and caches
//! tokens per application identity, runs interceptor hooks, recovers from
//! token expiry and transient transport failures, and threads a per-call
//! [`Context`] (selected agent, trace id, cancellation) through it all.
//!
//! ## Quick Start
//!
//! ```no_run
//! use wecom_dispatch::{AgentCredential, Client, Context};
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Deserialize)]
//! struct Department {
//!     id: u64,
//!     name: String,
//! }
//!
//! #[derive(Deserialize)]
//! struct DepartmentList {
//!     department: Vec<Department>,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wecom_dispatch::Error> {
//!     let client = Client::builder()
//!         .corp_id("ww0123456789")
//!         .default_secret("contacts-secret")
//!         .agent(AgentCredential::new(100001, "customer-secret", "customer"))
//!         .agent(AgentCredential::new(100002, "study-secret", "study"))
//!         .retry_count(2)
//!         .build()?;
//!
//!     // Uses the organization's default secret.
//!     let departments = client
//!         .get::<DepartmentList>(&Context::new(), "/cgi-bin/department/list")
//!         .await?;
//!     for d in &departments.data.department {
//!         println!("{} {}", d.id, d.name);
//!     }
//!
//!     // Acts as the "study" agent.
//!     let ctx = Context::new().with_agent_name("study").with_trace_id("job-42");
//!     client
//!         .post::<_, serde_json::Value>(
//!             &ctx,
//!             "/cgi-bin/message/send",
//!             &json!({ "touser": "@all", "msgtype": "text", "agentid": 100002,
//!                      "text": { "content": "hello" } }),
//!         )
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Recovery
//!
//! - An errcode in the token-invalid set (default `40014`, `42001`) evicts the
//!   cached token and re-runs the call once with a fresh one. A second
//!   rejection is final.
//! - Transport failures (connection, timeout, 5xx, 429) are retried per the
//!   [`RetryStrategy`]; none by default.
//! - Any other non-zero errcode is returned as [`Error::Api`] untouched.
//!
//! ## Tokens
//!
//! [`TokenCache`] keeps one token per (corp id, agent id). Concurrent calls
//! that need a new token share one fetch, and a fetch is never aborted by a
//! caller that stops waiting.

mod client;
pub mod config;
mod context;
mod envelope;
mod error;
pub mod interceptor;
mod request;
mod response;
pub mod retry;
pub mod token;

pub use client::{Client, ClientBuilder};
pub use config::{AgentCredential, ClientConfig, Credential, CredentialKey};
pub use context::{AgentSelector, Context};
pub use envelope::{RawResponse, ResponseEnvelope};
pub use error::{BoxError, Error, ErrorKind, Result};
pub use interceptor::{Hook, InterceptorChain, Phase};
pub use request::{CanonicalRequest, RequestBuilder};
pub use response::Response;
pub use retry::RetryStrategy;
pub use token::TokenCache;
