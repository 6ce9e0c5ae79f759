use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{join_all, select_all, BoxFuture};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::driver::{PageDriver, Selector};
use crate::error::{Error, Result};

const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);
const MIN_INTERVAL: Duration = Duration::from_millis(50);
const MAX_INTERVAL: Duration = Duration::from_secs(1);

/// EMA weight for new delay observations.
const EMA_ALPHA: f64 = 0.3;
/// Patterns below this confidence don't influence polling.
const CONFIDENCE_FLOOR: f64 = 0.3;
/// Observed delays are capped before entering the store, so one pathological
/// page load can't poison the average.
const MAX_RECORDED_DELAY: Duration = Duration::from_secs(30);

type CustomPredicate =
    Arc<dyn Fn(Arc<dyn PageDriver>) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// A condition the waiter polls for.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitCondition {
    /// At least one visible match for the selector.
    ElementVisible { selector: Selector },
    /// No requests in flight and the DOM has stopped churning.
    NetworkIdle,
    /// The document HTML contains the given text.
    TextPresent { text: String },
    /// The page URL contains the given fragment.
    UrlContains { fragment: String },
    /// Caller-supplied async predicate. Not serializable.
    #[serde(skip)]
    Custom {
        name: String,
        predicate: CustomPredicate,
    },
}

impl WaitCondition {
    pub fn element_visible(selector: Selector) -> Self {
        WaitCondition::ElementVisible { selector }
    }

    pub fn text(text: impl Into<String>) -> Self {
        WaitCondition::TextPresent { text: text.into() }
    }

    pub fn url_contains(fragment: impl Into<String>) -> Self {
        WaitCondition::UrlContains {
            fragment: fragment.into(),
        }
    }

    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(Arc<dyn PageDriver>) -> BoxFuture<'static, Result<bool>> + Send + Sync + 'static,
    {
        WaitCondition::Custom {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Stable description of the condition. The pattern store scopes it per
    /// host, so the same condition learns separately on different sites.
    pub fn signature(&self) -> String {
        match self {
            WaitCondition::ElementVisible { selector } => format!("element:{selector}"),
            WaitCondition::NetworkIdle => "network_idle".to_string(),
            WaitCondition::TextPresent { text } => format!("text:{text}"),
            WaitCondition::UrlContains { fragment } => format!("url:{fragment}"),
            WaitCondition::Custom { name, .. } => format!("custom:{name}"),
        }
    }

    async fn check(&self, page: &Arc<dyn PageDriver>) -> Result<bool> {
        match self {
            WaitCondition::ElementVisible { selector } => {
                let elements = page.locate(selector).await?;
                Ok(elements.iter().any(|e| e.visible))
            }
            WaitCondition::NetworkIdle => Ok(page.activity().await?.is_idle()),
            WaitCondition::TextPresent { text } => Ok(page.content().await?.contains(text)),
            WaitCondition::UrlContains { fragment } => Ok(page.url().await?.contains(fragment)),
            WaitCondition::Custom { predicate, .. } => predicate(page.clone()).await,
        }
    }
}

impl fmt::Debug for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WaitCondition({})", self.signature())
    }
}

/// Learned timing for one wait signature.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct LearnedPattern {
    /// Exponential moving average of observed satisfaction delays.
    pub ema_delay: Duration,
    /// How much the average can be trusted, in [0,1].
    pub confidence: f64,
    /// Total observations, used for eviction.
    pub observations: u64,
}

/// Bounded store of learned wait timings, shared across waiter instances.
/// When full, the least-frequently-observed pattern is evicted.
pub struct PatternStore {
    patterns: Mutex<HashMap<String, LearnedPattern>>,
    capacity: usize,
}

impl PatternStore {
    pub fn new() -> Self {
        Self::with_capacity(512)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            patterns: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record how long a condition took to become true. Failed waits count
    /// too; they lower confidence rather than shift the average.
    pub fn record(&self, signature: &str, elapsed: Duration, success: bool) {
        let elapsed = elapsed.min(MAX_RECORDED_DELAY);
        let mut patterns = self.patterns.lock();

        if !patterns.contains_key(signature) && patterns.len() >= self.capacity {
            if let Some(victim) = patterns
                .iter()
                .min_by_key(|(_, p)| p.observations)
                .map(|(k, _)| k.clone())
            {
                trace!(pattern = %victim, "evicting least-observed wait pattern");
                patterns.remove(&victim);
            }
        }

        let entry = patterns.entry(signature.to_string()).or_insert(LearnedPattern {
            ema_delay: elapsed,
            confidence: 0.0,
            observations: 0,
        });
        entry.observations += 1;
        if success {
            let old = entry.ema_delay.as_secs_f64();
            let blended = old * (1.0 - EMA_ALPHA) + elapsed.as_secs_f64() * EMA_ALPHA;
            entry.ema_delay = Duration::from_secs_f64(blended);
            entry.confidence = (entry.confidence + 0.1).min(1.0);
        } else {
            entry.confidence = (entry.confidence - 0.2).max(0.05);
        }
    }

    /// Predicted satisfaction delay and its confidence, if known.
    pub fn predict(&self, signature: &str) -> Option<LearnedPattern> {
        self.patterns.lock().get(signature).copied()
    }

    pub fn len(&self) -> usize {
        self.patterns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.lock().is_empty()
    }
}

impl Default for PatternStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls wait conditions with an interval adapted to learned timings and
/// current page activity, instead of a fixed sleep.
pub struct AdaptiveWaiter {
    store: Arc<PatternStore>,
}

impl AdaptiveWaiter {
    pub fn new() -> Self {
        Self {
            store: Arc::new(PatternStore::new()),
        }
    }

    pub fn with_store(store: Arc<PatternStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    /// Wait until the condition holds. Returns how long it took. Timing is
    /// recorded in the pattern store whether the wait succeeds or not.
    pub async fn wait_for(
        &self,
        page: &Arc<dyn PageDriver>,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<Duration> {
        let signature = condition.signature();
        // Timings are learned per site. "Loading complete" on one host says
        // nothing about another.
        let key = match page.url().await {
            Ok(url) => pattern_key(&url, &signature),
            Err(_) => signature.clone(),
        };
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            match condition.check(page).await {
                Ok(true) => {
                    let elapsed = started.elapsed();
                    debug!(condition = %signature, ?elapsed, "wait satisfied");
                    self.store.record(&key, elapsed, true);
                    return Ok(elapsed);
                }
                Ok(false) => {}
                // Transient check failures (mid-navigation, detached frame)
                // are treated as "not yet".
                Err(e) => trace!(condition = %signature, error = %e, "check failed, retrying"),
            }

            let now = Instant::now();
            if now >= deadline {
                self.store.record(&key, started.elapsed(), false);
                return Err(Error::WaitTimeout(signature));
            }

            let interval = self
                .next_interval(page, &key, started.elapsed())
                .await
                .min(deadline - now);
            tokio::time::sleep(interval).await;
        }
    }

    /// Wait until any one of the conditions holds. Returns the index of the
    /// winner and the elapsed time.
    pub async fn wait_for_any(
        &self,
        page: &Arc<dyn PageDriver>,
        conditions: &[WaitCondition],
        timeout: Duration,
    ) -> Result<(usize, Duration)> {
        if conditions.is_empty() {
            return Err(Error::WaitTimeout("no conditions given".into()));
        }

        let futures: Vec<BoxFuture<'_, Result<Duration>>> = conditions
            .iter()
            .map(|c| {
                let fut: BoxFuture<'_, Result<Duration>> =
                    Box::pin(self.wait_for(page, c, timeout));
                fut
            })
            .collect();

        let (result, index, _rest) = select_all(futures).await;
        result.map(|elapsed| (index, elapsed))
    }

    /// Wait for every condition and return each outcome in input order. A
    /// condition that times out does not cut the others short.
    pub async fn wait_for_all(
        &self,
        page: &Arc<dyn PageDriver>,
        conditions: &[WaitCondition],
        timeout: Duration,
    ) -> Vec<Result<Duration>> {
        let futures = conditions.iter().map(|c| self.wait_for(page, c, timeout));
        join_all(futures).await
    }

    /// Blend the learned prediction with current page activity into the
    /// next poll interval.
    async fn next_interval(
        &self,
        page: &Arc<dyn PageDriver>,
        key: &str,
        elapsed: Duration,
    ) -> Duration {
        let mut interval = DEFAULT_INTERVAL;

        if let Some(pattern) = self.store.predict(key) {
            if pattern.confidence >= CONFIDENCE_FLOOR && elapsed < pattern.ema_delay {
                // Well before the predicted time there is little point in
                // polling densely.
                interval = (pattern.ema_delay - elapsed) / 4;
            }
        }

        // A busy page is about to change; poll faster so we notice.
        if let Ok(activity) = page.activity().await {
            if activity.score() > 0.5 {
                interval /= 2;
            }
        }

        interval.clamp(MIN_INTERVAL, MAX_INTERVAL)
    }
}

impl Default for AdaptiveWaiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Pattern store key: the page host joined with the condition signature.
fn pattern_key(url: &str, signature: &str) -> String {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let authority = rest.split('/').next().unwrap_or(rest);
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        signature.to_string()
    } else {
        format!("{host}|{signature}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_learns_and_gains_confidence() {
        let store = PatternStore::new();
        store.record("text:welcome", Duration::from_millis(400), true);
        store.record("text:welcome", Duration::from_millis(600), true);
        let pattern = store.predict("text:welcome").unwrap();
        assert_eq!(pattern.observations, 2);
        assert!(pattern.confidence > 0.1);
        // EMA sits between the two observations.
        assert!(pattern.ema_delay > Duration::from_millis(400));
        assert!(pattern.ema_delay < Duration::from_millis(600));
    }

    #[test]
    fn failed_wait_lowers_confidence_without_moving_average() {
        let store = PatternStore::new();
        store.record("network_idle", Duration::from_millis(300), true);
        let before = store.predict("network_idle").unwrap();
        store.record("network_idle", Duration::from_secs(5), false);
        let after = store.predict("network_idle").unwrap();
        assert!(after.confidence < before.confidence);
        assert_eq!(after.ema_delay, before.ema_delay);
    }

    #[test]
    fn store_evicts_least_observed_at_capacity() {
        let store = PatternStore::with_capacity(2);
        store.record("a", Duration::from_millis(100), true);
        store.record("a", Duration::from_millis(100), true);
        store.record("b", Duration::from_millis(100), true);
        store.record("c", Duration::from_millis(100), true);
        assert_eq!(store.len(), 2);
        // "b" had the fewest observations once "c" arrived.
        assert!(store.predict("a").is_some());
        assert!(store.predict("b").is_none());
        assert!(store.predict("c").is_some());
    }

    #[test]
    fn pattern_keys_are_scoped_per_host() {
        let sig = WaitCondition::text("ready").signature();
        let a = pattern_key("https://app.example.test/login", &sig);
        let b = pattern_key("https://other.test/login", &sig);
        assert_eq!(a, "app.example.test|text:ready");
        assert_ne!(a, b);
        // Credentials and ports don't fragment the key.
        assert_eq!(
            pattern_key("http://user:pw@app.example.test:8080/x", &sig),
            "app.example.test|text:ready"
        );
        // An unparseable URL falls back to the bare signature.
        assert_eq!(pattern_key("", &sig), sig);
    }

    #[test]
    fn signatures_distinguish_conditions() {
        let a = WaitCondition::text("hello").signature();
        let b = WaitCondition::text("world").signature();
        let c = WaitCondition::NetworkIdle.signature();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
