use crate::lifecycle::{LifecycleConfig, PullPolicy};
use crate::pool::PoolConfig;
use crate::proxy::{Origin, RedirectPolicy};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

/// Signing secret used when none is configured. Tokens signed with it are
/// forgeable by anyone who has read this source.
pub const DEV_JWT_SECRET: &str = "mandelbrot-dev-secret-do-not-use-in-prod";

/// Gateway configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen address; an empty host (":9090") means all interfaces
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Origin clients use to reach the gateway, e.g. `https://gw.example.com`.
    /// Derived from `listen` when unset.
    pub external_url: Option<String>,

    /// Seconds in-flight connections get to finish on shutdown (default: 10)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Seconds a client has to send request headers (default: 30)
    #[serde(default = "default_header_read_timeout")]
    pub header_read_timeout_secs: u64,

    /// Maximum idle connections to the backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle backend connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            external_url: None,
            drain_timeout_secs: default_drain_timeout(),
            header_read_timeout_secs: default_header_read_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

fn default_listen() -> String {
    ":9090".to_string()
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_header_read_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// HMAC secret for signing and verifying tokens
    #[serde(default = "default_secret")]
    pub secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
        }
    }
}

fn default_secret() -> String {
    DEV_JWT_SECRET.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Image to run (default: lechgu/mandelbrot)
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// Port the backend listens on inside the container (default: 80)
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Loopback port the container port is published on (default: 8080)
    #[serde(default = "default_host_port")]
    pub host_port: u16,

    /// Docker endpoint, e.g. `unix:///var/run/docker.sock` or `tcp://host:2375`
    pub docker_host: Option<String>,

    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Seconds to wait for the backend to answer its root path (default: 30)
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Seconds the container gets to exit before it is killed (default: 10)
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Seconds the whole stop-and-remove sequence may take (default: 30)
    #[serde(default = "default_stop_deadline")]
    pub stop_deadline_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            container_name: default_container_name(),
            container_port: default_container_port(),
            host_port: default_host_port(),
            docker_host: None,
            pull_policy: PullPolicy::default(),
            ready_timeout_secs: default_ready_timeout(),
            stop_grace_secs: default_stop_grace(),
            stop_deadline_secs: default_stop_deadline(),
        }
    }
}

fn default_image() -> String {
    "lechgu/mandelbrot".to_string()
}

fn default_container_name() -> String {
    "mandelbrot-auth-proxy".to_string()
}

fn default_container_port() -> u16 {
    80
}

fn default_host_port() -> u16 {
    8080
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_stop_grace() -> u64 {
    10
}

fn default_stop_deadline() -> u64 {
    30
}

impl BackendConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn stop_deadline(&self) -> Duration {
        Duration::from_secs(self.stop_deadline_secs)
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        let mut config = LifecycleConfig::new(&self.image, self.container_port, self.host_port);
        config.container_name = self.container_name.clone();
        config.pull_policy = self.pull_policy;
        config.stop_grace = Duration::from_secs(self.stop_grace_secs);
        config
    }
}

/// How backend redirects reach the client
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    /// Pass redirects through, rewriting backend `Location` headers
    #[default]
    Rewrite,
    /// Follow redirects inside the gateway
    Follow,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    #[serde(default)]
    pub redirect_policy: RedirectMode,

    /// Hop limit when following redirects (default: 10)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Seconds to wait for a backend response; unset means no limit
    pub request_timeout_secs: Option<u64>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            redirect_policy: RedirectMode::default(),
            max_redirects: default_max_redirects(),
            request_timeout_secs: None,
        }
    }
}

fn default_max_redirects() -> usize {
    10
}

impl ProxyConfig {
    pub fn redirect_policy(&self) -> RedirectPolicy {
        match self.redirect_policy {
            RedirectMode::Rewrite => RedirectPolicy::Rewrite,
            RedirectMode::Follow => RedirectPolicy::Follow {
                max_hops: self.max_redirects,
            },
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Unknown names fall back to `info`
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    pub fn load_with_env<F>(path: Option<&Path>, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
                })?;
                toml::from_str(&content).map_err(|e| {
                    anyhow::anyhow!("Invalid config file '{}': {}", path.display(), e)
                })?
            }
            None => Config::default(),
        };

        config.apply_env(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Apply `LISTEN_ADDR`, `MANDELBROT_IMAGE`, `CONTAINER_PORT`, `HOST_PORT`,
    /// `JWT_SECRET` and `LOG_LEVEL`. Empty values and unparsable ports are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(listen) = get("LISTEN_ADDR") {
            self.server.listen = listen;
        }
        if let Some(image) = get("MANDELBROT_IMAGE") {
            self.backend.image = image;
        }
        if let Some(port) = get("CONTAINER_PORT").and_then(|v| v.parse().ok()) {
            self.backend.container_port = port;
        }
        if let Some(port) = get("HOST_PORT").and_then(|v| v.parse().ok()) {
            self.backend.host_port = port;
        }
        if let Some(secret) = get("JWT_SECRET") {
            self.auth.secret = secret;
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.log.level = LogLevel::parse_lenient(&level);
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.auth.secret.is_empty() {
            errors.push("auth.secret must not be empty".to_string());
        }
        if self.backend.container_port == 0 {
            errors.push("backend.container_port must not be 0".to_string());
        }
        if self.backend.host_port == 0 {
            errors.push("backend.host_port must not be 0".to_string());
        }
        if self.backend.image.is_empty() {
            errors.push("backend.image must not be empty".to_string());
        }
        if self.backend.stop_deadline_secs <= self.backend.stop_grace_secs {
            errors.push(format!(
                "backend.stop_deadline_secs ({}) must exceed backend.stop_grace_secs ({})",
                self.backend.stop_deadline_secs, self.backend.stop_grace_secs
            ));
        }
        if self.proxy.redirect_policy == RedirectMode::Follow && self.proxy.max_redirects == 0 {
            errors.push("proxy.max_redirects must be at least 1 when following redirects".to_string());
        }
        if let Err(e) = self.bind_addr() {
            errors.push(e.to_string());
        }
        if let Err(e) = self.external_origin() {
            errors.push(e.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.auth.secret == DEV_JWT_SECRET
    }

    /// Socket address to bind; `":9090"` binds all interfaces
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let listen = self.server.listen.as_str();
        let candidate = match listen.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => listen.to_string(),
        };

        if let Ok(addr) = candidate.parse() {
            return Ok(addr);
        }

        candidate
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| anyhow::anyhow!("server.listen '{}' is not a valid address", listen))
    }

    /// Origin clients see; backend redirects are rewritten to it
    pub fn external_origin(&self) -> anyhow::Result<Origin> {
        match &self.server.external_url {
            Some(url) => Origin::parse(url)
                .map_err(|e| anyhow::anyhow!("server.external_url: {}", e)),
            None => Origin::from_listen_addr(&self.server.listen)
                .map_err(|e| anyhow::anyhow!("server.listen: {}", e)),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.server.pool_idle_timeout_secs),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.server.drain_timeout_secs)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.server.header_read_timeout_secs)
    }
}
