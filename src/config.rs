//! Client configuration and credential resolution.

use crate::context::{AgentSelector, Context};
use crate::interceptor::InterceptorChain;
use crate::retry::RetryStrategy;
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default platform host.
pub const DEFAULT_BASE_URL: &str = "https://qyapi.weixin.qq.com";

/// Default token issuance path.
pub const DEFAULT_TOKEN_PATH: &str = "/cgi-bin/gettoken";

/// Default refresh margin: tokens are refreshed this long before they expire.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Errcodes meaning "invalid access token" (40014) and "access token
/// expired" (42001).
pub const DEFAULT_TOKEN_INVALID_CODES: [i64; 2] = [40014, 42001];

/// An application identity registered under the organization.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentCredential {
    /// Numeric agent id.
    pub id: i64,
    /// Agent secret used to obtain tokens.
    pub secret: String,
    /// Registered name, used for selection by name.
    pub name: String,
    /// Free-form description.
    pub description: String,
}

impl AgentCredential {
    /// Creates an agent credential with an empty description.
    pub fn new(id: i64, secret: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            secret: secret.into(),
            name: name.into(),
            description: String::new(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Debug for AgentCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentCredential")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Token cache key: one token per (corp id, agent id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    /// Organization id.
    pub corp_id: String,
    /// Agent id, `None` for the organization's default secret.
    pub agent_id: Option<i64>,
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.agent_id {
            Some(id) => write!(f, "{}/{}", self.corp_id, id),
            None => write!(f, "{}/default", self.corp_id),
        }
    }
}

/// The identity a single call acts as, resolved from a [`Context`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    key: CredentialKey,
    secret: String,
    name: Option<String>,
}

impl Credential {
    /// Creates a credential directly.
    pub fn new(corp_id: impl Into<String>, agent_id: Option<i64>, secret: impl Into<String>) -> Self {
        Self {
            key: CredentialKey {
                corp_id: corp_id.into(),
                agent_id,
            },
            secret: secret.into(),
            name: None,
        }
    }

    fn for_agent(corp_id: &str, agent: &AgentCredential) -> Self {
        Self {
            key: CredentialKey {
                corp_id: corp_id.to_string(),
                agent_id: Some(agent.id),
            },
            secret: agent.secret.clone(),
            name: Some(agent.name.clone()),
        }
    }

    /// The token cache key.
    pub fn key(&self) -> &CredentialKey {
        &self.key
    }

    /// Organization id.
    pub fn corp_id(&self) -> &str {
        &self.key.corp_id
    }

    /// Agent id, if this is an agent credential.
    pub fn agent_id(&self) -> Option<i64> {
        self.key.agent_id
    }

    /// Agent name, if this is an agent credential.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("key", &self.key)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Immutable configuration shared by every call made through a client.
///
/// Built by [`ClientBuilder`](crate::ClientBuilder).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) base_url: Url,
    pub(crate) corp_id: String,
    pub(crate) default_secret: Option<String>,
    pub(crate) agents: Vec<AgentCredential>,
    pub(crate) agents_by_id: HashMap<i64, usize>,
    pub(crate) agents_by_name: HashMap<String, usize>,
    pub(crate) retry_strategy: RetryStrategy,
    pub(crate) token_invalid_codes: HashSet<i64>,
    pub(crate) refresh_margin: Duration,
    pub(crate) token_path: String,
    pub(crate) timeout: Option<Duration>,
    pub(crate) interceptors: Arc<InterceptorChain>,
    pub(crate) debug: bool,
}

impl ClientConfig {
    /// Indexes `agents` by id and name, rejecting duplicates of either.
    pub(crate) fn index_agents(
        agents: &[AgentCredential],
    ) -> Result<(HashMap<i64, usize>, HashMap<String, usize>)> {
        let mut by_id = HashMap::with_capacity(agents.len());
        let mut by_name = HashMap::with_capacity(agents.len());

        for (i, agent) in agents.iter().enumerate() {
            if by_id.insert(agent.id, i).is_some() {
                return Err(Error::Configuration(format!(
                    "duplicate agent id {}",
                    agent.id
                )));
            }
            if !agent.name.is_empty() && by_name.insert(agent.name.clone(), i).is_some() {
                return Err(Error::Configuration(format!(
                    "duplicate agent name {:?}",
                    agent.name
                )));
            }
        }

        Ok((by_id, by_name))
    }

    /// Picks the credential a call acts as.
    ///
    /// Order: agent selected by id, agent selected by name, then the default
    /// credential (the default secret if configured, otherwise the only
    /// registered agent). An explicit selection that matches nothing is an
    /// error rather than a fallback.
    pub fn resolve(&self, ctx: &Context) -> Result<Credential> {
        match ctx.agent() {
            Some(AgentSelector::Id(id)) => self
                .agent_by_id(id)
                .map(|agent| Credential::for_agent(&self.corp_id, agent))
                .ok_or_else(|| Error::Configuration(format!("no agent registered with id {id}"))),
            Some(AgentSelector::Name(name)) => self
                .agent_by_name(&name)
                .map(|agent| Credential::for_agent(&self.corp_id, agent))
                .ok_or_else(|| {
                    Error::Configuration(format!("no agent registered with name {name:?}"))
                }),
            None => self.default_credential(),
        }
    }

    fn default_credential(&self) -> Result<Credential> {
        if let Some(secret) = &self.default_secret {
            return Ok(Credential::new(self.corp_id.clone(), None, secret.clone()));
        }
        match self.agents.as_slice() {
            [agent] => Ok(Credential::for_agent(&self.corp_id, agent)),
            [] => Err(Error::Configuration(
                "no default secret and no agents configured".to_string(),
            )),
            _ => Err(Error::Configuration(
                "several agents configured and none selected".to_string(),
            )),
        }
    }

    /// Looks up a registered agent by id.
    pub fn agent_by_id(&self, id: i64) -> Option<&AgentCredential> {
        self.agents_by_id.get(&id).map(|&i| &self.agents[i])
    }

    /// Looks up a registered agent by name.
    pub fn agent_by_name(&self, name: &str) -> Option<&AgentCredential> {
        self.agents_by_name.get(name).map(|&i| &self.agents[i])
    }

    /// All registered agents, in registration order.
    pub fn agents(&self) -> &[AgentCredential] {
        &self.agents
    }

    /// Organization id.
    pub fn corp_id(&self) -> &str {
        &self.corp_id
    }

    /// Base URL every path is resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Returns `true` if `errcode` means the access token was rejected.
    pub fn is_token_invalid(&self, errcode: i64) -> bool {
        self.token_invalid_codes.contains(&errcode)
    }

    /// The transport retry strategy.
    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry_strategy
    }

    /// How long before expiry cached tokens are refreshed.
    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    /// Path of the token endpoint.
    pub fn token_path(&self) -> &str {
        &self.token_path
    }

    /// Per-request timeout, if one is set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The registered hooks.
    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    /// Whether debug logging of requests and envelopes is on.
    pub fn debug(&self) -> bool {
        self.debug
    }
}
