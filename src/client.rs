//! The dispatcher: one logical platform call, end to end.
//!
//! [`Client`] is the entry point every endpoint wrapper goes through. Use
//! [`ClientBuilder`] to configure and create clients.
//!
//! A call runs as a loop over attempts. Each attempt resolves a token, builds
//! a fresh [`CanonicalRequest`](crate::CanonicalRequest), runs the hooks,
//! sends it and decodes the envelope. The loop keeps two independent budgets:
//! one token refresh per call, and the transport retries allowed by the
//! configured [`RetryStrategy`].

use crate::{
    config::{
        AgentCredential, ClientConfig, Credential, DEFAULT_BASE_URL, DEFAULT_REFRESH_MARGIN,
        DEFAULT_TOKEN_INVALID_CODES, DEFAULT_TOKEN_PATH,
    },
    context::Context,
    envelope::{RawResponse, ResponseEnvelope},
    interceptor::{Hook, InterceptorChain, TracingHooks},
    request::RequestBuilder,
    retry::RetryStrategy,
    token::TokenCache,
    Error, Response, Result,
};
use bytes::Bytes;
use http::Method;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// A client for the platform API.
///
/// Cheap to clone; clones share the configuration, the HTTP connection pool
/// and the token cache. Independent clients never share tokens.
///
/// # Examples
///
/// ```no_run
/// use wecom_dispatch::{AgentCredential, Client, Context, RequestBuilder};
/// use http::Method;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), wecom_dispatch::Error> {
/// let client = Client::builder()
///     .corp_id("ww0123456789")
///     .agent(AgentCredential::new(1000002, "agent-secret", "notify"))
///     .retry_count(2)
///     .build()?;
///
/// let ctx = Context::new().with_agent_name("notify");
/// let message = json!({
///     "touser": "@all",
///     "msgtype": "text",
///     "agentid": 1000002,
///     "text": { "content": "deploy finished" },
/// });
/// let response = client
///     .execute(&ctx, &RequestBuilder::new(Method::POST, "/cgi-bin/message/send"), Some(&message))
///     .await?;
/// println!("envelope: {:?}", response.raw_body);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http_client: reqwest::Client,
    config: ClientConfig,
    tokens: TokenCache,
}

/// One decoded business response and the token it was sent with.
struct Exchange {
    token: String,
    raw: RawResponse,
    envelope: ResponseEnvelope,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The immutable configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The token cache owned by this client.
    pub fn token_cache(&self) -> &TokenCache {
        &self.inner.tokens
    }

    /// Executes one logical call and returns the raw envelope on success.
    ///
    /// Only two failures are recovered here: a token rejection (one refresh
    /// and retry per call) and transport failures (per the retry strategy).
    /// Everything else is returned as is.
    ///
    /// # Errors
    ///
    /// * [`Error::Configuration`] - the context selects an unknown agent; no
    ///   request is sent.
    /// * [`Error::Api`] - the endpoint returned a non-zero errcode.
    /// * [`Error::Token`] - the token could not be obtained, or was rejected
    ///   again after a refresh.
    /// * [`Error::Interceptor`] - a hook failed.
    /// * [`Error::Cancelled`] / [`Error::DeadlineExceeded`] - the context
    ///   stopped the call.
    /// * transport errors, wrapped in [`Error::MaxRetriesExceeded`] when
    ///   retries were configured and used up.
    pub async fn execute<B>(
        &self,
        ctx: &Context,
        request: &RequestBuilder,
        body: Option<&B>,
    ) -> Result<Response<Bytes>>
    where
        B: Serialize + ?Sized,
    {
        let config = &self.inner.config;
        let start_time = Instant::now();
        let credential = config.resolve(ctx)?;

        let mut attempts = 0;
        let mut transport_failures = 0;
        let mut token_refreshed = false;

        loop {
            match self
                .attempt(ctx, &credential, request, body, &mut attempts)
                .await
            {
                Ok(exchange) => {
                    let Exchange {
                        token,
                        raw,
                        envelope,
                    } = exchange;

                    if config.is_token_invalid(envelope.errcode) {
                        if token_refreshed {
                            tracing::warn!(
                                errcode = envelope.errcode,
                                credential = %credential.key(),
                                path = %request.path(),
                                trace_id = ctx.trace_id(),
                                "Token rejected again after refresh"
                            );
                            return Err(Error::token(envelope.errcode, envelope.errmsg));
                        }

                        tracing::info!(
                            errcode = envelope.errcode,
                            credential = %credential.key(),
                            trace_id = ctx.trace_id(),
                            "Token rejected - refreshing and retrying once"
                        );
                        self.inner.tokens.invalidate_token(&credential, &token);
                        token_refreshed = true;
                        continue;
                    }

                    let hooks = config.interceptors.run_after_decode(ctx, &envelope);

                    if !envelope.is_success() {
                        tracing::warn!(
                            errcode = envelope.errcode,
                            errmsg = %envelope.errmsg,
                            method = %request.method(),
                            path = %request.path(),
                            trace_id = ctx.trace_id(),
                            "Platform returned an error"
                        );
                        return Err(Error::Api {
                            errcode: envelope.errcode,
                            errmsg: envelope.errmsg,
                            raw_response: raw.body,
                        });
                    }
                    hooks?;

                    let mut response = Response::new(
                        raw.body.clone(),
                        raw.body,
                        raw.status,
                        raw.headers,
                        start_time.elapsed(),
                        attempts,
                    );
                    response.token_refreshed = token_refreshed;
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    transport_failures += 1;
                    tracing::warn!(
                        error = %e,
                        attempt = transport_failures,
                        method = %request.method(),
                        path = %request.path(),
                        trace_id = ctx.trace_id(),
                        "Request failed"
                    );

                    let Some(delay) = config.retry_strategy.delay_for_attempt(transport_failures)
                    else {
                        if config.retry_strategy.max_retries() == 0 {
                            return Err(e);
                        }
                        return Err(Error::MaxRetriesExceeded {
                            attempts: transport_failures,
                            last_error: Box::new(e),
                        });
                    };

                    tracing::info!(
                        delay_ms = delay.as_millis(),
                        attempt = transport_failures,
                        "Retrying request after delay"
                    );
                    ctx.guard(async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One pass from token lookup to decoded envelope.
    async fn attempt<B>(
        &self,
        ctx: &Context,
        credential: &Credential,
        request: &RequestBuilder,
        body: Option<&B>,
        attempts: &mut usize,
    ) -> Result<Exchange>
    where
        B: Serialize + ?Sized,
    {
        let config = &self.inner.config;

        let token = ctx.guard(self.inner.tokens.get_token(credential)).await?;
        let canonical = request.build(credential, &token, body)?;
        let mut http_request = canonical.to_http(
            &self.inner.http_client,
            &config.base_url,
            ctx.trace_id(),
            config.timeout,
        )?;

        config
            .interceptors
            .run_before_request(ctx, &mut http_request)?;

        ctx.check()?;
        *attempts += 1;
        tracing::debug!(
            method = %canonical.method(),
            path = %canonical.path(),
            credential = %canonical.credential(),
            attempt = *attempts,
            trace_id = ctx.trace_id(),
            "Executing HTTP request"
        );

        let sent_at = Instant::now();
        let raw = ctx
            .guard(async {
                let response = self.inner.http_client.execute(http_request).await?;
                let status = response.status();
                let headers = response.headers().clone();
                let body = response.bytes().await?;
                Ok(RawResponse {
                    status,
                    headers,
                    body,
                })
            })
            .await?;

        tracing::info!(
            status = raw.status.as_u16(),
            latency_ms = sent_at.elapsed().as_millis(),
            attempt = *attempts,
            trace_id = ctx.trace_id(),
            "Received HTTP response"
        );

        config.interceptors.run_raw_response(ctx, &raw)?;

        if !raw.status.is_success() {
            let raw_response = String::from_utf8_lossy(&raw.body).into_owned();
            if raw.status.is_client_error() {
                tracing::error!(status = raw.status.as_u16(), response = %raw_response, "Client error (4xx)");
            } else {
                tracing::warn!(status = raw.status.as_u16(), response = %raw_response, "Server error (5xx)");
            }
            return Err(Error::Http {
                status: raw.status,
                raw_response,
                headers: raw.headers,
            });
        }

        let envelope = serde_json::from_slice::<ResponseEnvelope>(&raw.body).map_err(|e| {
            let raw_response = String::from_utf8_lossy(&raw.body).into_owned();
            tracing::error!(error = %e, raw_response = %raw_response, "Failed to decode envelope");
            Error::Deserialization {
                raw_response,
                serde_error: e.to_string(),
                status: raw.status,
            }
        })?;

        Ok(Exchange {
            token,
            raw,
            envelope,
        })
    }

    /// Executes a call and decodes the envelope into `Res`.
    ///
    /// `Res` sees the whole envelope, so it can declare the endpoint fields
    /// it needs and ignore `errcode`/`errmsg`.
    pub async fn call<B, Res>(
        &self,
        ctx: &Context,
        request: &RequestBuilder,
        body: Option<&B>,
    ) -> Result<Response<Res>>
    where
        B: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let response = self.execute(ctx, request, body).await?;

        match serde_json::from_slice::<Res>(&response.data) {
            Ok(data) => Ok(response.map(|_| data)),
            Err(e) => {
                let raw_response = String::from_utf8_lossy(&response.raw_body).into_owned();
                tracing::error!(
                    error = %e,
                    raw_response = %raw_response,
                    "Failed to deserialize response"
                );
                Err(Error::Deserialization {
                    raw_response,
                    serde_error: e.to_string(),
                    status: response.status,
                })
            }
        }
    }

    /// Makes a GET request to `path`.
    pub async fn get<Res>(&self, ctx: &Context, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let request = RequestBuilder::new(Method::GET, path);
        self.call::<(), Res>(ctx, &request, None).await
    }

    /// Makes a GET request to `path` with query parameters.
    pub async fn get_with_query<Res>(
        &self,
        ctx: &Context,
        path: impl Into<String>,
        query: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let request = RequestBuilder::new(Method::GET, path).query_pairs(query);
        self.call::<(), Res>(ctx, &request, None).await
    }

    /// Makes a POST request to `path` with a JSON body.
    pub async fn post<B, Res>(
        &self,
        ctx: &Context,
        path: impl Into<String>,
        body: &B,
    ) -> Result<Response<Res>>
    where
        B: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let request = RequestBuilder::new(Method::POST, path);
        self.call(ctx, &request, Some(body)).await
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use wecom_dispatch::{AgentCredential, ClientBuilder, RetryStrategy};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), wecom_dispatch::Error> {
/// let client = ClientBuilder::new()
///     .corp_id("ww0123456789")
///     .default_secret("contacts-secret")
///     .agent(AgentCredential::new(100001, "s-customer", "customer"))
///     .agent(AgentCredential::new(100002, "s-study", "study").with_description("training bot"))
///     .timeout(Duration::from_secs(10))
///     .retry_strategy(RetryStrategy::Linear {
///         delay: Duration::from_millis(250),
///         max_retries: 2,
///     })
///     .token_invalid_codes([40014, 42001, 42009])
///     .debug(true)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    corp_id: Option<String>,
    default_secret: Option<String>,
    agents: Vec<AgentCredential>,
    retry_strategy: RetryStrategy,
    token_invalid_codes: HashSet<i64>,
    refresh_margin: Duration,
    token_path: String,
    timeout: Option<Duration>,
    interceptors: InterceptorChain,
    http_client: Option<reqwest::Client>,
    debug: bool,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            corp_id: None,
            default_secret: None,
            agents: Vec::new(),
            retry_strategy: RetryStrategy::None,
            token_invalid_codes: DEFAULT_TOKEN_INVALID_CODES.into_iter().collect(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            token_path: DEFAULT_TOKEN_PATH.to_string(),
            timeout: None,
            interceptors: InterceptorChain::new(),
            http_client: None,
            debug: false,
        }
    }

    /// Sets the platform base URL. Defaults to [`DEFAULT_BASE_URL`].
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Sets the organization id. Required.
    pub fn corp_id(mut self, corp_id: impl Into<String>) -> Self {
        self.corp_id = Some(corp_id.into());
        self
    }

    /// Sets the organization-level secret used when a call selects no agent.
    pub fn default_secret(mut self, secret: impl Into<String>) -> Self {
        self.default_secret = Some(secret.into());
        self
    }

    /// Registers an agent. Ids and names must be unique; duplicates fail
    /// [`ClientBuilder::build`].
    pub fn agent(mut self, agent: AgentCredential) -> Self {
        self.agents.push(agent);
        self
    }

    /// Registers several agents.
    pub fn agents(mut self, agents: impl IntoIterator<Item = AgentCredential>) -> Self {
        self.agents.extend(agents);
        self
    }

    /// Sets the retry strategy for transport failures.
    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    /// Retries transport failures `count` times with a fixed delay.
    pub fn retry_count(self, count: usize) -> Self {
        self.retry_strategy(RetryStrategy::fixed(count))
    }

    /// Replaces the set of errcodes that mean "token rejected".
    ///
    /// Defaults to [`DEFAULT_TOKEN_INVALID_CODES`].
    pub fn token_invalid_codes(mut self, codes: impl IntoIterator<Item = i64>) -> Self {
        self.token_invalid_codes = codes.into_iter().collect();
        self
    }

    /// How long before expiry a cached token is refreshed.
    pub fn refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Path of the token endpoint. Defaults to [`DEFAULT_TOKEN_PATH`].
    pub fn token_path(mut self, path: impl Into<String>) -> Self {
        self.token_path = path.into();
        self
    }

    /// Sets the per-request timeout, applied to token fetches as well.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Registers a hook. Hooks of one phase run in registration order.
    ///
    /// A failing after-decode hook turns an otherwise successful call into
    /// [`Error::Interceptor`] and the decoded payload is not returned. The
    /// request is not resent. Hooks that only observe (metrics, audit) should
    /// log their own failures and return `Ok(())`.
    pub fn hook(mut self, hook: Hook) -> Self {
        self.interceptors.push(hook);
        self
    }

    /// Registers several hooks in order.
    pub fn hooks(mut self, hooks: impl IntoIterator<Item = Hook>) -> Self {
        for hook in hooks {
            self.interceptors.push(hook);
        }
        self
    }

    /// Uses an existing `reqwest::Client` instead of building one.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Logs every request (token redacted) and decoded envelope at debug
    /// level via [`TracingHooks`].
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if the corp id is missing, no credential is
    /// configured, agent ids or names are duplicated, or the HTTP client
    /// cannot be built.
    pub fn build(mut self) -> Result<Client> {
        let corp_id = self
            .corp_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Configuration("corp id is required".to_string()))?;

        if self.default_secret.is_none() && self.agents.is_empty() {
            return Err(Error::Configuration(
                "a default secret or at least one agent is required".to_string(),
            ));
        }

        let (agents_by_id, agents_by_name) = ClientConfig::index_agents(&self.agents)?;

        let base_url = match self.base_url {
            Some(url) => url,
            None => Url::parse(DEFAULT_BASE_URL)?,
        };
        let mut token_endpoint = base_url.clone();
        token_endpoint.set_path(&self.token_path);

        let http_client = match self.http_client {
            Some(client) => client,
            None => reqwest::Client::builder().build().map_err(|e| {
                Error::Configuration(format!("Failed to build HTTP client: {}", e))
            })?,
        };

        if self.debug {
            for hook in TracingHooks::hooks() {
                self.interceptors.push(hook);
            }
        }

        let tokens = TokenCache::new(
            http_client.clone(),
            token_endpoint,
            self.refresh_margin,
            self.timeout,
        );

        let config = ClientConfig {
            base_url,
            corp_id,
            default_secret: self.default_secret,
            agents: self.agents,
            agents_by_id,
            agents_by_name,
            retry_strategy: self.retry_strategy,
            token_invalid_codes: self.token_invalid_codes,
            refresh_margin: self.refresh_margin,
            token_path: self.token_path,
            timeout: self.timeout,
            interceptors: Arc::new(self.interceptors),
            debug: self.debug,
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                http_client,
                config,
                tokens,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
