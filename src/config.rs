use std::time::Duration;

use crate::stealth::Fingerprint;

/// Configuration for one browser session in the pool.
#[derive(Clone)]
pub struct SessionConfig {
    pub headless: bool,
    pub stealth: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub chrome_path: Option<String>,
    /// Proxy for this session. When stealth is on and this is `None`,
    /// the pool pulls one from its proxy rotator at launch time.
    pub proxy: Option<ProxyConfig>,
    /// Fingerprint applied in stealth mode. When `None` and stealth is on,
    /// the pool generates one from the built-in templates with jitter.
    pub fingerprint: Option<Fingerprint>,
    /// Default timeout for driver operations (default: 30s).
    pub default_timeout: Duration,
}

/// Proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g. "http://host:port", "socks5://host:port")
    pub server: String,
    /// Optional username for proxy authentication
    pub username: Option<String>,
    /// Optional password for proxy authentication
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            username: None,
            password: None,
        }
    }

    /// Host:port portion of the server URL, used by the rotator's
    /// connectivity probe. Scheme and inline credentials are stripped.
    pub fn host_port(&self) -> &str {
        let without_scheme = self
            .server
            .rsplit("://")
            .next()
            .unwrap_or(&self.server);
        without_scheme
            .rsplit('@')
            .next()
            .unwrap_or(without_scheme)
            .trim_end_matches('/')
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            stealth: true,
            viewport_width: 1920,
            viewport_height: 1080,
            chrome_path: None,
            proxy: None,
            fingerprint: None,
            default_timeout: Duration::from_secs(30),
        }
    }
}

pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    pub fn stealth(mut self, stealth: bool) -> Self {
        self.config.stealth = stealth;
        self
    }

    pub fn viewport(mut self, width: u32, height: u32) -> Self {
        self.config.viewport_width = width;
        self.config.viewport_height = height;
        self
    }

    pub fn chrome_path(mut self, path: impl Into<String>) -> Self {
        self.config.chrome_path = Some(path.into());
        self
    }

    /// Set the default timeout for driver operations.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Pin an explicit fingerprint instead of generating one per session.
    pub fn fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.config.fingerprint = Some(fingerprint);
        self
    }

    /// Set a proxy server (e.g. "http://host:port", "socks5://host:port").
    pub fn proxy(mut self, server: impl Into<String>) -> Self {
        self.config.proxy = Some(ProxyConfig::new(server));
        self
    }

    /// Set a proxy server with authentication.
    pub fn proxy_with_auth(
        mut self,
        server: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.config.proxy = Some(ProxyConfig {
            server: server.into(),
            username: Some(username.into()),
            password: Some(password.into()),
        });
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the session pool itself.
#[derive(Clone)]
pub struct PoolConfig {
    /// Hard cap on concurrently live sessions. Creating a session at the
    /// cap evicts the least-recently-active one first.
    pub max_sessions: usize,
    /// Sessions idle longer than this are evicted by the rotation timer.
    pub max_idle_age: Duration,
    /// How often the rotation timer scans for stale sessions.
    pub rotation_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            max_idle_age: Duration::from_secs(10 * 60),
            rotation_interval: Duration::from_secs(60),
        }
    }
}
