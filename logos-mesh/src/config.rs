//! Client configuration.
//!
//! A [`MeshConfig`] is immutable once built. Every field is validated in
//! [`MeshConfigBuilder::build`]; later code never re-checks it.
//!
//! ```text
//! MeshConfig::builder("ws-1")            MeshConfig::from_json(r#"{"workspaceId":"ws-1"}"#)
//!     .token("dev_abc")                          │
//!     .topology(Topology::Hybrid)                │ serde (camelCase, ms durations)
//!     .build()? ◄────────────────────────────────┘
//! ```

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::MeshError;

pub const PRODUCTION_SERVER_URL: &str = "wss://sync.logos.app";
pub const LOCAL_SERVER_URL: &str = "ws://localhost:8787";

/// Token prefixes that mark a local or development credential.
const LOCAL_TOKEN_PREFIXES: [&str; 3] = ["dev_", "local_", "test_"];

/// How traffic between participants is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// All traffic via the relay.
    Star,
    /// Direct links to every peer.
    Mesh,
    /// Direct links where possible, relay fallback.
    #[default]
    Hybrid,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Star => "star",
            Self::Mesh => "mesh",
            Self::Hybrid => "hybrid",
        })
    }
}

/// Exponential backoff with jitter for relay and signaling reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier per attempt, at least 1.0.
    pub growth: f64,
    /// Fraction in `[0, 1)`; the delay is scaled by a factor drawn from
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            growth: 2.0,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Unjittered delay: `min(max_delay, base_delay * growth^attempt)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.growth.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rng.random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        self.enabled && attempts < self.max_attempts
    }
}

/// Produces the credential sent with every connection. `None` connects
/// anonymously.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Reads the token from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenProvider for EnvToken {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|t| !t.is_empty())
    }
}

/// Validated, immutable client configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub workspace_id: String,
    pub token: Option<String>,
    pub user_id: String,
    /// Identity of this client within the workspace mesh.
    pub peer_id: String,
    pub server_url: Url,
    pub reconnect: ReconnectPolicy,
    pub connection_timeout: Duration,
    /// `Duration::ZERO` disables the heartbeat.
    pub heartbeat_interval: Duration,
    /// 0 means unbounded.
    pub max_queue_size: usize,
    pub topology: Topology,
    /// Direct peer ceiling before falling back to star.
    pub max_direct_peers: usize,
    /// Failed direct handshakes tolerated before falling back to star.
    pub direct_failure_threshold: u32,
    pub handshake_timeout: Duration,
    /// `Duration::ZERO` disables metrics rounds.
    pub metrics_interval: Duration,
    /// How long a peer has to answer a metrics ping.
    pub ping_timeout: Duration,
    pub debug: bool,
}

impl MeshConfig {
    pub fn builder(workspace_id: impl Into<String>) -> MeshConfigBuilder {
        MeshConfigBuilder::new(workspace_id)
    }

    /// Parse the camelCase host configuration object.
    pub fn from_json(json: &str) -> Result<Self, MeshError> {
        let raw: RawConfig = serde_json::from_str(json)
            .map_err(|e| MeshError::Configuration(format!("invalid JSON: {e}")))?;
        raw.into_builder().build()
    }

    /// `<server>/ws?workspace_id=<id>&token=<token>`
    pub fn relay_url(&self) -> Url {
        let mut url = self.endpoint("ws");
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("workspace_id", &self.workspace_id);
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
        }
        url
    }

    /// `<server>/signal?workspace_id=<id>&peer_id=<peer>&token=<token>`
    pub fn signaling_url(&self) -> Url {
        let mut url = self.endpoint("signal");
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("workspace_id", &self.workspace_id);
            query.append_pair("peer_id", &self.peer_id);
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
        }
        url
    }

    fn endpoint(&self, segment: &str) -> Url {
        let mut url = self.server_url.clone();
        let path = format!("{}/{segment}", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_query(None);
        url
    }

    /// Storage key of the persisted offline queue.
    pub fn queue_storage_key(&self) -> String {
        format!("logos-mesh/{}/queue", self.workspace_id)
    }
}

/// Whether a token looks like a local/dev credential.
pub fn is_local_token(token: &str) -> bool {
    LOCAL_TOKEN_PREFIXES.iter().any(|p| token.starts_with(p))
}

/// Builder for [`MeshConfig`].
pub struct MeshConfigBuilder {
    workspace_id: String,
    token: Option<String>,
    token_provider: Option<Box<dyn TokenProvider>>,
    user_id: Option<String>,
    peer_id: Option<String>,
    server_url: Option<String>,
    reconnect: ReconnectPolicy,
    connection_timeout: Duration,
    heartbeat_interval: Duration,
    max_queue_size: usize,
    topology: Topology,
    max_direct_peers: usize,
    direct_failure_threshold: u32,
    handshake_timeout: Duration,
    metrics_interval: Duration,
    ping_timeout: Duration,
    debug: bool,
}

impl MeshConfigBuilder {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            token: None,
            token_provider: None,
            user_id: None,
            peer_id: None,
            server_url: None,
            reconnect: ReconnectPolicy::default(),
            connection_timeout: Duration::from_millis(10_000),
            heartbeat_interval: Duration::from_millis(30_000),
            max_queue_size: 1000,
            topology: Topology::default(),
            max_direct_peers: 30,
            direct_failure_threshold: 3,
            handshake_timeout: Duration::from_millis(15_000),
            metrics_interval: Duration::from_millis(10_000),
            ping_timeout: Duration::from_millis(5_000),
            debug: false,
        }
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Resolve the token from a provider at build time. An explicit
    /// [`token`](Self::token) takes precedence.
    pub fn token_provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.token_provider = Some(Box::new(provider));
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.enabled = enabled;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    pub fn reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect.base_delay = delay;
        self
    }

    pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.max_delay = delay;
        self
    }

    pub fn reconnect_growth(mut self, growth: f64) -> Self {
        self.reconnect.growth = growth;
        self
    }

    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect.jitter = jitter;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn max_direct_peers(mut self, peers: usize) -> Self {
        self.max_direct_peers = peers;
        self
    }

    pub fn direct_failure_threshold(mut self, failures: u32) -> Self {
        self.direct_failure_threshold = failures;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn build(self) -> Result<MeshConfig, MeshError> {
        let invalid = |msg: &str| Err(MeshError::Configuration(msg.to_string()));

        let workspace_id = self.workspace_id.trim().to_string();
        if workspace_id.is_empty() {
            return invalid("workspaceId must not be empty");
        }

        let token = self
            .token
            .or_else(|| self.token_provider.as_ref().and_then(|p| p.token()))
            .filter(|t| !t.is_empty());

        let server_url = match self.server_url {
            Some(raw) => Url::parse(&raw)
                .map_err(|e| MeshError::Configuration(format!("invalid serverUrl '{raw}': {e}")))?,
            None => {
                let default = match token.as_deref() {
                    Some(t) if is_local_token(t) => LOCAL_SERVER_URL,
                    _ => PRODUCTION_SERVER_URL,
                };
                Url::parse(default)
                    .map_err(|e| MeshError::Configuration(format!("invalid default url: {e}")))?
            }
        };
        if !matches!(server_url.scheme(), "ws" | "wss") {
            return Err(MeshError::Configuration(format!(
                "serverUrl must use ws:// or wss://, got '{}'",
                server_url.scheme()
            )));
        }

        let reconnect = self.reconnect;
        if reconnect.base_delay.is_zero() {
            return invalid("reconnectBaseDelay must be positive");
        }
        if reconnect.base_delay > reconnect.max_delay {
            return invalid("reconnectBaseDelay must not exceed maxReconnectDelay");
        }
        if !(reconnect.growth >= 1.0 && reconnect.growth.is_finite()) {
            return invalid("reconnect growth must be a finite factor >= 1");
        }
        if !(0.0..1.0).contains(&reconnect.jitter) {
            return invalid("reconnect jitter must be in [0, 1)");
        }
        if self.connection_timeout.is_zero() {
            return invalid("connectionTimeout must be positive");
        }
        if self.handshake_timeout.is_zero() {
            return invalid("handshakeTimeout must be positive");
        }
        if self.ping_timeout.is_zero() {
            return invalid("pingTimeout must be positive");
        }
        if !self.metrics_interval.is_zero() && self.ping_timeout >= self.metrics_interval {
            return invalid("pingTimeout must be shorter than metricsInterval");
        }

        let peer_id = match self.peer_id {
            Some(id) if id.trim().is_empty() => return invalid("peerId must not be empty"),
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        if peer_id == crate::protocol::BROADCAST_ADDRESS {
            return invalid("peerId must not be the broadcast address");
        }
        let user_id = self
            .user_id
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(MeshConfig {
            workspace_id,
            token,
            user_id,
            peer_id,
            server_url,
            reconnect,
            connection_timeout: self.connection_timeout,
            heartbeat_interval: self.heartbeat_interval,
            max_queue_size: self.max_queue_size,
            topology: self.topology,
            max_direct_peers: self.max_direct_peers,
            direct_failure_threshold: self.direct_failure_threshold,
            handshake_timeout: self.handshake_timeout,
            metrics_interval: self.metrics_interval,
            ping_timeout: self.ping_timeout,
            debug: self.debug,
        })
    }
}

/// Host configuration object; durations in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawConfig {
    workspace_id: String,
    token: Option<String>,
    user_id: Option<String>,
    peer_id: Option<String>,
    server_url: Option<String>,
    auto_reconnect: Option<bool>,
    max_reconnect_attempts: Option<u32>,
    reconnect_base_delay: Option<u64>,
    max_reconnect_delay: Option<u64>,
    reconnect_growth: Option<f64>,
    reconnect_jitter: Option<f64>,
    connection_timeout: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_queue_size: Option<usize>,
    topology: Option<Topology>,
    max_direct_peers: Option<usize>,
    direct_failure_threshold: Option<u32>,
    handshake_timeout: Option<u64>,
    metrics_interval: Option<u64>,
    ping_timeout: Option<u64>,
    debug: Option<bool>,
}

impl RawConfig {
    fn into_builder(self) -> MeshConfigBuilder {
        let ms = Duration::from_millis;
        let mut b = MeshConfigBuilder::new(self.workspace_id);
        b.token = self.token;
        b.user_id = self.user_id;
        b.peer_id = self.peer_id;
        b.server_url = self.server_url;
        if let Some(v) = self.auto_reconnect {
            b.reconnect.enabled = v;
        }
        if let Some(v) = self.max_reconnect_attempts {
            b.reconnect.max_attempts = v;
        }
        if let Some(v) = self.reconnect_base_delay {
            b.reconnect.base_delay = ms(v);
        }
        if let Some(v) = self.max_reconnect_delay {
            b.reconnect.max_delay = ms(v);
        }
        if let Some(v) = self.reconnect_growth {
            b.reconnect.growth = v;
        }
        if let Some(v) = self.reconnect_jitter {
            b.reconnect.jitter = v;
        }
        if let Some(v) = self.connection_timeout {
            b.connection_timeout = ms(v);
        }
        if let Some(v) = self.heartbeat_interval {
            b.heartbeat_interval = ms(v);
        }
        if let Some(v) = self.max_queue_size {
            b.max_queue_size = v;
        }
        if let Some(v) = self.topology {
            b.topology = v;
        }
        if let Some(v) = self.max_direct_peers {
            b.max_direct_peers = v;
        }
        if let Some(v) = self.direct_failure_threshold {
            b.direct_failure_threshold = v;
        }
        if let Some(v) = self.handshake_timeout {
            b.handshake_timeout = ms(v);
        }
        if let Some(v) = self.metrics_interval {
            b.metrics_interval = ms(v);
        }
        if let Some(v) = self.ping_timeout {
            b.ping_timeout = ms(v);
        }
        if let Some(v) = self.debug {
            b.debug = v;
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::builder("ws-1").build().unwrap();
        assert_eq!(config.server_url.as_str(), "wss://sync.logos.app/");
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(1000));
        assert_eq!(config.reconnect.max_delay, Duration::from_millis(30_000));
        assert_eq!(config.connection_timeout, Duration::from_millis(10_000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(30_000));
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.max_direct_peers, 30);
        assert!(!config.debug);
        assert!(!config.user_id.is_empty());
        assert_ne!(config.user_id, config.peer_id);
    }

    #[test]
    fn test_empty_workspace_rejected() {
        let err = MeshConfig::builder("  ").build().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_invalid_combinations_rejected() {
        assert!(MeshConfig::builder("w")
            .reconnect_base_delay(Duration::from_secs(60))
            .max_reconnect_delay(Duration::from_secs(1))
            .build()
            .is_err());
        assert!(MeshConfig::builder("w").reconnect_jitter(1.0).build().is_err());
        assert!(MeshConfig::builder("w").reconnect_growth(0.5).build().is_err());
        assert!(MeshConfig::builder("w")
            .connection_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(MeshConfig::builder("w").server_url("https://x").build().is_err());
        assert!(MeshConfig::builder("w").server_url("not a url").build().is_err());
        assert!(MeshConfig::builder("w").peer_id("*").build().is_err());
    }

    #[test]
    fn test_ping_window_must_fit_metrics_interval() {
        let err = MeshConfig::builder("w")
            .metrics_interval(Duration::from_secs(2))
            .ping_timeout(Duration::from_secs(2))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("pingTimeout"));
        assert!(MeshConfig::builder("w")
            .metrics_interval(Duration::from_secs(1))
            .ping_timeout(Duration::from_secs(5))
            .build()
            .is_err());
        // Metrics disabled: any window is fine.
        assert!(MeshConfig::builder("w")
            .metrics_interval(Duration::ZERO)
            .ping_timeout(Duration::from_secs(30))
            .build()
            .is_ok());
    }

    #[test]
    fn test_local_token_selects_localhost() {
        let config = MeshConfig::builder("w").token("dev_123").build().unwrap();
        assert_eq!(config.server_url.host_str(), Some("localhost"));
        assert_eq!(config.server_url.port(), Some(8787));
        assert_eq!(config.server_url.scheme(), "ws");

        let config = MeshConfig::builder("w").token("prod_123").build().unwrap();
        assert_eq!(config.server_url.scheme(), "wss");
    }

    #[test]
    fn test_explicit_server_url_wins() {
        let config = MeshConfig::builder("w")
            .token("dev_123")
            .server_url("wss://relay.example.com/base/")
            .build()
            .unwrap();
        assert_eq!(
            config.relay_url().as_str(),
            "wss://relay.example.com/base/ws?workspace_id=w&token=dev_123"
        );
    }

    #[test]
    fn test_urls_are_query_encoded() {
        let config = MeshConfig::builder("team a&b")
            .token("t=1")
            .peer_id("p1")
            .server_url("ws://localhost:9000")
            .build()
            .unwrap();
        assert_eq!(
            config.relay_url().as_str(),
            "ws://localhost:9000/ws?workspace_id=team+a%26b&token=t%3D1"
        );
        assert_eq!(
            config.signaling_url().as_str(),
            "ws://localhost:9000/signal?workspace_id=team+a%26b&peer_id=p1&token=t%3D1"
        );
    }

    #[test]
    fn test_token_provider() {
        let config = MeshConfig::builder("w")
            .token_provider(StaticToken("local_x".into()))
            .build()
            .unwrap();
        assert_eq!(config.token.as_deref(), Some("local_x"));
        assert_eq!(config.server_url.host_str(), Some("localhost"));

        let config = MeshConfig::builder("w")
            .token_provider(EnvToken::new("LOGOS_MESH_TEST_UNSET_TOKEN_VAR"))
            .build()
            .unwrap();
        assert_eq!(config.token, None);
        assert!(!config.relay_url().as_str().contains("token="));
    }

    #[test]
    fn test_from_json() {
        let config = MeshConfig::from_json(
            r#"{
                "workspaceId": "ws-9",
                "token": "test_abc",
                "autoReconnect": false,
                "maxReconnectAttempts": 3,
                "reconnectBaseDelay": 50,
                "maxReconnectDelay": 400,
                "heartbeatInterval": 0,
                "maxQueueSize": 2,
                "topology": "mesh",
                "debug": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.workspace_id, "ws-9");
        assert!(!config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(50));
        assert!(config.heartbeat_interval.is_zero());
        assert_eq!(config.max_queue_size, 2);
        assert_eq!(config.topology, Topology::Mesh);
        assert!(config.debug);
        assert_eq!(config.server_url.host_str(), Some("localhost"));
    }

    #[test]
    fn test_from_json_errors() {
        assert!(MeshConfig::from_json("{").is_err());
        assert!(MeshConfig::from_json(r#"{"token":"x"}"#).is_err());
        assert!(MeshConfig::from_json(r#"{"workspaceId":"w","topology":"ring"}"#).is_err());
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = ReconnectPolicy::default();
        let mut prev = Duration::ZERO;
        for attempt in 0..40 {
            let d = policy.base_delay(attempt);
            assert!(d >= prev);
            assert!(d <= policy.max_delay);
            prev = d;
        }
        assert_eq!(policy.base_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.base_delay(10), Duration::from_millis(30_000));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = ReconnectPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..12 {
            let base = policy.base_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let d = policy.delay(attempt, &mut rng).as_secs_f64();
                assert!(d >= base * (1.0 - policy.jitter) - 1e-9);
                assert!(d <= base * (1.0 + policy.jitter) + 1e-9);
            }
        }
    }

    #[test]
    fn test_allows() {
        let mut policy = ReconnectPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
        policy.enabled = false;
        assert!(!policy.allows(0));
    }
}
