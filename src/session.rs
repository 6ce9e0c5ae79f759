use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chrome::ChromeDriver;
use crate::config::{PoolConfig, ProxyConfig, SessionConfig};
use crate::driver::{BrowserDriver, PageDriver};
use crate::error::{Error, Result};
use crate::stealth::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PageId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Launches browser instances for the pool. Production uses
/// [`ChromeLauncher`]; tests inject an in-memory implementation.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, config: &SessionConfig) -> Result<Arc<dyn BrowserDriver>>;
}

/// Launches real Chrome instances via chromiumoxide.
pub struct ChromeLauncher;

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn launch(&self, config: &SessionConfig) -> Result<Arc<dyn BrowserDriver>> {
        Ok(Arc::new(ChromeDriver::launch(config).await?))
    }
}

struct SessionEntry {
    config: SessionConfig,
    driver: Arc<dyn BrowserDriver>,
    pages: HashMap<PageId, Arc<dyn PageDriver>>,
    created_at: Instant,
    last_activity: Instant,
}

/// Point-in-time view of a pooled session.
#[derive(Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub stealth: bool,
    pub page_ids: Vec<PageId>,
    pub age: Duration,
    pub idle_for: Duration,
}

/// Owns browser session lifecycle: create, reuse, evict. LRU eviction keeps
/// the pool at or below its configured maximum; a rotation timer retires
/// sessions idle beyond `max_idle_age`.
pub struct SessionPool {
    config: PoolConfig,
    launcher: Arc<dyn SessionLauncher>,
    rotator: Option<Arc<ProxyRotator>>,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    rotation_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionPool {
    /// Create a pool and start its rotation timer. Must be called inside a
    /// tokio runtime.
    pub fn new(config: PoolConfig, launcher: Arc<dyn SessionLauncher>) -> Arc<Self> {
        Self::with_rotator(config, launcher, None)
    }

    pub fn with_rotator(
        config: PoolConfig,
        launcher: Arc<dyn SessionLauncher>,
        rotator: Option<Arc<ProxyRotator>>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            launcher,
            rotator,
            sessions: Mutex::new(HashMap::new()),
            rotation_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&pool);
        let interval = pool.config.rotation_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(pool) => pool.rotate_stale().await,
                    None => break,
                }
            }
        });
        *pool.rotation_task.lock() = Some(task);
        pool
    }

    /// Launch a new session, evicting the least-recently-active one first if
    /// the pool is at capacity. A failed launch registers nothing.
    pub async fn create_session(&self, config: SessionConfig) -> Result<SessionId> {
        let config = self.enhance_config(config);

        let evicted = {
            let mut sessions = self.sessions.lock();
            self.evict_lru_locked(&mut sessions)
        };
        for (id, entry) in evicted {
            info!(session = %id, "evicting least-recently-active session");
            Self::close_entry(entry).await;
        }

        let driver = self.launcher.launch(&config).await?;
        let id = SessionId(Uuid::new_v4().to_string());
        let now = Instant::now();

        // A concurrent create may have refilled the pool while we launched.
        let evicted = {
            let mut sessions = self.sessions.lock();
            let evicted = self.evict_lru_locked(&mut sessions);
            sessions.insert(
                id.clone(),
                SessionEntry {
                    config,
                    driver,
                    pages: HashMap::new(),
                    created_at: now,
                    last_activity: now,
                },
            );
            evicted
        };
        for (evicted_id, entry) in evicted {
            info!(session = %evicted_id, "evicting least-recently-active session");
            Self::close_entry(entry).await;
        }

        debug!(session = %id, "session created");
        Ok(id)
    }

    /// Look up a session. Touches its activity clock.
    pub fn get_session(&self, id: &SessionId) -> Option<SessionInfo> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(id)?;
        let idle_for = entry.last_activity.elapsed();
        entry.last_activity = Instant::now();
        Some(SessionInfo {
            id: id.clone(),
            stealth: entry.config.stealth,
            page_ids: entry.pages.keys().cloned().collect(),
            age: entry.created_at.elapsed(),
            idle_for,
        })
    }

    /// Open a new page in a session, navigated to `url`.
    pub async fn create_page(&self, session_id: &SessionId, url: &str) -> Result<PageId> {
        let driver = {
            let mut sessions = self.sessions.lock();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            entry.last_activity = Instant::now();
            Arc::clone(&entry.driver)
        };

        let page = driver.new_page(url).await?;
        let page_id = PageId(Uuid::new_v4().to_string());

        let orphaned = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(session_id) {
                Some(entry) => {
                    entry.last_activity = Instant::now();
                    entry.pages.insert(page_id.clone(), page.clone());
                    None
                }
                // Session was closed while the page was opening.
                None => Some(page),
            }
        };
        if let Some(page) = orphaned {
            let _ = page.close().await;
            return Err(Error::SessionNotFound(session_id.to_string()));
        }

        debug!(session = %session_id, page = %page_id, "page created");
        Ok(page_id)
    }

    /// Fetch a page handle. Touches the session's activity clock.
    pub fn get_page(&self, session_id: &SessionId, page_id: &PageId) -> Option<Arc<dyn PageDriver>> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(session_id)?;
        entry.last_activity = Instant::now();
        entry.pages.get(page_id).cloned()
    }

    /// Close a session and all its pages. Closing an absent or
    /// already-closed session is a no-op.
    pub async fn close_session(&self, id: &SessionId) -> Result<()> {
        let entry = self.sessions.lock().remove(id);
        if let Some(entry) = entry {
            Self::close_entry(entry).await;
            debug!(session = %id, "session closed");
        }
        Ok(())
    }

    /// Close everything and stop the rotation timer.
    pub async fn shutdown(&self) {
        if let Some(task) = self.rotation_task.lock().take() {
            task.abort();
        }
        let entries: Vec<_> = self.sessions.lock().drain().collect();
        for (id, entry) in entries {
            debug!(session = %id, "closing session on shutdown");
            Self::close_entry(entry).await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Evict sessions idle longer than the configured max age. Called by the
    /// rotation timer, public so callers can force a sweep.
    pub async fn rotate_stale(&self) {
        let stale: Vec<(SessionId, SessionEntry)> = {
            let mut sessions = self.sessions.lock();
            let stale_ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, e)| e.last_activity.elapsed() > self.config.max_idle_age)
                .map(|(id, _)| id.clone())
                .collect();
            stale_ids
                .into_iter()
                .filter_map(|id| sessions.remove(&id).map(|e| (id, e)))
                .collect()
        };
        for (id, entry) in stale {
            info!(session = %id, "rotating out idle session");
            Self::close_entry(entry).await;
        }
    }

    /// Fill in stealth collateral the caller left unspecified.
    fn enhance_config(&self, mut config: SessionConfig) -> SessionConfig {
        if config.stealth {
            if config.fingerprint.is_none() {
                config.fingerprint = Some(Fingerprint::generate());
            }
            if config.proxy.is_none() {
                if let Some(ref rotator) = self.rotator {
                    config.proxy = rotator.next();
                }
            }
        }
        config
    }

    /// While at or over capacity, pop the least-recently-active sessions.
    /// Returns them for closing outside the lock; browser I/O never happens
    /// inside the critical section.
    fn evict_lru_locked(
        &self,
        sessions: &mut HashMap<SessionId, SessionEntry>,
    ) -> Vec<(SessionId, SessionEntry)> {
        let mut evicted = Vec::new();
        while sessions.len() >= self.config.max_sessions {
            let lru = sessions
                .iter()
                .min_by_key(|(_, e)| e.last_activity)
                .map(|(id, _)| id.clone());
            match lru {
                Some(id) => {
                    if let Some(entry) = sessions.remove(&id) {
                        evicted.push((id, entry));
                    }
                }
                None => break,
            }
        }
        evicted
    }

    /// Pages first, then the browser itself.
    async fn close_entry(entry: SessionEntry) {
        for (page_id, page) in entry.pages {
            if let Err(e) = page.close().await {
                warn!(page = %page_id, "failed to close page: {e}");
            }
        }
        if let Err(e) = entry.driver.close().await {
            warn!("failed to close browser: {e}");
        }
    }
}

/// Health classification of one proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyHealth {
    Responsive,
    Degraded,
    Failed,
    /// Not probed yet.
    Unknown,
}

#[derive(Clone)]
struct ProxyEntry {
    config: ProxyConfig,
    health: ProxyHealth,
    latency: Duration,
}

/// Tracks proxy health via periodic TCP connect probes and hands out the
/// lowest-latency healthy entry, falling back to degraded ones.
pub struct ProxyRotator {
    entries: Mutex<Vec<ProxyEntry>>,
    probe_timeout: Duration,
    degraded_threshold: Duration,
    check_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProxyRotator {
    pub fn new(proxies: Vec<ProxyConfig>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(
                proxies
                    .into_iter()
                    .map(|config| ProxyEntry {
                        config,
                        health: ProxyHealth::Unknown,
                        latency: Duration::MAX,
                    })
                    .collect(),
            ),
            probe_timeout: Duration::from_secs(5),
            degraded_threshold: Duration::from_millis(750),
            check_task: Mutex::new(None),
        })
    }

    /// Start periodic health checks. Stops when the rotator is dropped.
    pub fn start_health_checks(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(rotator) => rotator.check_all().await,
                    None => break,
                }
            }
        });
        *self.check_task.lock() = Some(task);
    }

    /// Probe every proxy once and update health/latency.
    pub async fn check_all(&self) {
        let targets: Vec<(usize, String)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .enumerate()
                .map(|(i, e)| (i, e.config.host_port().to_string()))
                .collect()
        };

        for (index, addr) in targets {
            let started = Instant::now();
            let outcome =
                tokio::time::timeout(self.probe_timeout, tokio::net::TcpStream::connect(&addr))
                    .await;
            let (health, latency) = match outcome {
                Ok(Ok(_)) => {
                    let latency = started.elapsed();
                    if latency <= self.degraded_threshold {
                        (ProxyHealth::Responsive, latency)
                    } else {
                        (ProxyHealth::Degraded, latency)
                    }
                }
                Ok(Err(e)) => {
                    debug!(proxy = %addr, "proxy probe failed: {e}");
                    (ProxyHealth::Failed, Duration::MAX)
                }
                Err(_) => (ProxyHealth::Failed, Duration::MAX),
            };

            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(index) {
                entry.health = health;
                entry.latency = latency;
            }
        }
    }

    /// Lowest-latency responsive proxy, else lowest-latency degraded one,
    /// else none. Unprobed entries count as responsive so a cold rotator can
    /// still serve.
    pub fn next(&self) -> Option<ProxyConfig> {
        let entries = self.entries.lock();
        let best_of = |health: ProxyHealth| {
            entries
                .iter()
                .filter(|e| e.health == health)
                .min_by_key(|e| e.latency)
                .map(|e| e.config.clone())
        };
        best_of(ProxyHealth::Responsive)
            .or_else(|| {
                entries
                    .iter()
                    .find(|e| e.health == ProxyHealth::Unknown)
                    .map(|e| e.config.clone())
            })
            .or_else(|| best_of(ProxyHealth::Degraded))
    }

    pub fn health_of(&self, server: &str) -> Option<ProxyHealth> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.config.server == server)
            .map(|e| e.health)
    }
}

impl Drop for ProxyRotator {
    fn drop(&mut self) {
        if let Some(task) = self.check_task.lock().take() {
            task.abort();
        }
    }
}
