//! Access-token cache with single-flight refresh.
//!
//! One entry per [`CredentialKey`]. A lookup that finds no fresh token
//! either joins the fetch already in flight for that key or starts one. The
//! fetch runs on its own task, so a caller that gives up waiting never aborts
//! it and the result still lands in the cache for everyone else.
//!
//! The map is sharded ([`DashMap`]); a shard lock is only held while a slot is
//! inspected or updated, never across network I/O.

use crate::config::{Credential, CredentialKey};
use crate::envelope::TokenPayload;
use crate::{Error, Result};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

type Flight = Shared<BoxFuture<'static, Result<CachedToken>>>;

/// A token as stored in the cache.
#[derive(Clone, PartialEq, Eq)]
pub struct CachedToken {
    value: String,
    expires_at: Instant,
    margin: Duration,
}

impl CachedToken {
    /// Creates a token expiring `ttl` after `issued_at`, or `None` if that
    /// instant is not representable.
    ///
    /// The refresh margin is capped at half the ttl so a token is always
    /// usable right after it is issued.
    pub fn new(
        value: impl Into<String>,
        issued_at: Instant,
        ttl: Duration,
        margin: Duration,
    ) -> Option<Self> {
        Some(Self {
            value: value.into(),
            expires_at: issued_at.checked_add(ttl)?,
            margin: margin.min(ttl / 2),
        })
    }

    /// The token string.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// When the platform stops accepting the token.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Returns `true` while `now < expires_at - margin`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at
            .checked_sub(self.margin)
            .is_some_and(|refresh_at| now < refresh_at)
    }
}

impl fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("margin", &self.margin)
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    token: Option<CachedToken>,
    flight: Option<(u64, Flight)>,
}

/// Shared, concurrency-safe token cache.
///
/// Cloning is cheap; clones share entries.
#[derive(Clone)]
pub struct TokenCache {
    inner: Arc<Inner>,
}

struct Inner {
    http_client: reqwest::Client,
    endpoint: Url,
    margin: Duration,
    timeout: Option<Duration>,
    slots: DashMap<CredentialKey, Slot>,
    fetches: AtomicU64,
    next_flight: AtomicU64,
}

impl TokenCache {
    /// Creates an empty cache fetching from `endpoint`
    /// (`?corpid=..&corpsecret=..` is appended per credential).
    pub fn new(
        http_client: reqwest::Client,
        endpoint: Url,
        margin: Duration,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                http_client,
                endpoint,
                margin,
                timeout,
                slots: DashMap::new(),
                fetches: AtomicU64::new(0),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a fresh token for `credential`, fetching one if needed.
    ///
    /// Concurrent callers for the same credential share a single fetch. A
    /// failed fetch is reported to every caller waiting on it and leaves the
    /// entry empty, so the next call tries again.
    ///
    /// # Errors
    ///
    /// [`Error::Token`] if the endpoint rejects the credential or answers
    /// with a malformed payload; a transport error if it cannot be reached.
    pub async fn get_token(&self, credential: &Credential) -> Result<String> {
        let flight = {
            let mut slot = self
                .inner
                .slots
                .entry(credential.key().clone())
                .or_default();

            if let Some(token) = slot.token.as_ref().filter(|t| t.is_fresh(Instant::now())) {
                return Ok(token.value.clone());
            }

            let in_flight = slot.flight.as_ref().map(|(_, flight)| flight.clone());
            match in_flight {
                Some(flight) => {
                    tracing::debug!(credential = %credential.key(), "Joining in-flight token fetch");
                    flight
                }
                None => {
                    let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                    let flight = self.start_fetch(credential.clone(), id);
                    slot.flight = Some((id, flight.clone()));
                    flight
                }
            }
        };

        flight.await.map(|token| token.value)
    }

    fn start_fetch(&self, credential: Credential, id: u64) -> Flight {
        self.inner.fetches.fetch_add(1, Ordering::Relaxed);
        let guard = FlightGuard {
            inner: self.inner.clone(),
            key: credential.key().clone(),
            id,
        };

        let handle = tokio::spawn(async move {
            let result = guard.inner.fetch(&credential).await;
            guard.land(result.as_ref().ok());
            result
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                Err(Error::token(-1, format!("token fetch task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }

    /// Forces the entry for `credential` to be treated as expired.
    pub fn invalidate(&self, credential: &Credential) {
        if let Some(mut slot) = self.inner.slots.get_mut(credential.key()) {
            slot.token = None;
            tracing::debug!(credential = %credential.key(), "Token invalidated");
        }
    }

    /// Invalidates the entry only if it still holds `token`.
    ///
    /// Returns `true` if the entry was cleared. A caller that saw `token`
    /// rejected must not evict a newer token another call already fetched.
    pub fn invalidate_token(&self, credential: &Credential, token: &str) -> bool {
        let Some(mut slot) = self.inner.slots.get_mut(credential.key()) else {
            return false;
        };
        if slot.token.as_ref().is_some_and(|t| t.value == token) {
            slot.token = None;
            tracing::debug!(credential = %credential.key(), "Rejected token invalidated");
            true
        } else {
            false
        }
    }

    /// The cached token for `key`, fresh or not.
    pub fn cached(&self, key: &CredentialKey) -> Option<CachedToken> {
        self.inner.slots.get(key).and_then(|slot| slot.token.clone())
    }

    /// Number of fetches started since the cache was created.
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::Relaxed)
    }
}

/// Owned by a fetch task. Clears the slot's in-flight marker when the task
/// ends, however it ends, so a panicking fetch cannot wedge its key.
struct FlightGuard {
    inner: Arc<Inner>,
    key: CredentialKey,
    id: u64,
}

impl FlightGuard {
    /// Clears the marker if it still belongs to this flight, storing `token`
    /// when there is one.
    fn land(&self, token: Option<&CachedToken>) {
        if let Some(mut slot) = self.inner.slots.get_mut(&self.key) {
            if matches!(&slot.flight, Some((current, _)) if *current == self.id) {
                slot.flight = None;
                if let Some(token) = token {
                    slot.token = Some(token.clone());
                }
            }
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.land(None);
    }
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("entries", &self.inner.slots.len())
            .field("fetches", &self.fetch_count())
            .finish()
    }
}

impl Inner {
    async fn fetch(&self, credential: &Credential) -> Result<CachedToken> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("corpid", credential.corp_id())
            .append_pair("corpsecret", credential.secret());

        tracing::debug!(credential = %credential.key(), "Fetching access token");

        let issued_at = Instant::now();
        let mut request = self.http_client.get(url);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let result: Result<CachedToken> = async {
            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;

            if !status.is_success() {
                return Err(Error::Http {
                    status,
                    raw_response: String::from_utf8_lossy(&body).into_owned(),
                    headers,
                });
            }

            let payload: TokenPayload = serde_json::from_slice(&body)
                .map_err(|e| Error::token(-1, format!("malformed token payload: {e}")))?;

            if payload.errcode != 0 {
                return Err(Error::token(payload.errcode, payload.errmsg));
            }

            let value = payload
                .access_token
                .filter(|t| !t.is_empty())
                .ok_or_else(|| Error::token(-1, "token payload without access_token"))?;

            let ttl = match payload.expires_in {
                Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
                _ => return Err(Error::token(-1, "token payload without positive expires_in")),
            };

            CachedToken::new(value, issued_at, ttl, self.margin).ok_or_else(|| {
                Error::token(-1, format!("expires_in {} out of range", ttl.as_secs()))
            })
        }
        .await;

        match &result {
            Ok(token) => tracing::info!(
                credential = %credential.key(),
                expires_in_secs = token.expires_at.saturating_duration_since(issued_at).as_secs(),
                "Access token fetched"
            ),
            Err(e) => tracing::warn!(
                credential = %credential.key(),
                error = %e,
                "Access token fetch failed"
            ),
        }

        result
    }
}
