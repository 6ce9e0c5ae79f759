use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace};

use crate::driver::{BoundingBox, LoadState, PageDriver, Selector};
use crate::error::{Error, ErrorKind, Result};
use crate::resolver::{ElementCandidate, ElementDescription, ElementResolver, SelectorSource};
use crate::retry::RetryPolicy;

/// Letters typed fastest by touch typists; everything else gets the full
/// base delay.
const HIGH_FREQUENCY: &str = "etaoinshrdlu";
const BASE_KEY_DELAY_MS: u64 = 80;
const THINKING_PAUSE_CHANCE: f64 = 0.10;
const TYPO_CHANCE: f64 = 0.02;

/// How long to wait for the page to settle after an action before checking
/// postconditions.
const STABILITY_TIMEOUT: Duration = Duration::from_secs(2);
const STABILITY_FALLBACK: Duration = Duration::from_millis(300);

/// Per-action knobs. The defaults suit interactive automation; workflows
/// override retry and timeout per step.
#[derive(Debug, Clone)]
pub struct ActionOptions {
    /// Budget for a single attempt, not the whole retry loop.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Scroll the target into view before interacting.
    pub scroll_into_view: bool,
    /// Curved pointer paths and variable typing cadence.
    pub humanize: bool,
    /// Clear the field before typing.
    pub clear: bool,
    /// Check postconditions after the action.
    pub validate: bool,
}

impl Default for ActionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            scroll_into_view: true,
            humanize: true,
            clear: true,
            validate: true,
        }
    }
}

impl ActionOptions {
    pub fn fast() -> Self {
        Self {
            humanize: false,
            retry: RetryPolicy::none(),
            ..Self::default()
        }
    }
}

/// Outcome of one action, retries included. Attempt failures surface here
/// rather than as `Err`; the caller decides what a failed action means.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Failed attempts. An action that never succeeds reports its full
    /// attempt budget here; one that succeeds first try reports zero.
    pub retry_count: u32,
    pub duration: Duration,
    /// Extracted value, for actions that produce one.
    pub value: Option<serde_json::Value>,
}

impl ActionResult {
    fn ok(retry_count: u32, duration: Duration, value: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            error: None,
            error_kind: None,
            retry_count,
            duration,
            value,
        }
    }

    fn failed(error: Error, retry_count: u32, duration: Duration) -> Self {
        Self {
            success: false,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
            retry_count,
            duration,
            value: None,
        }
    }
}

/// Executes pointer and keyboard actions with resolution, retries, optional
/// human-like pacing, and postcondition checks.
pub struct ActionExecutor {
    resolver: Arc<ElementResolver>,
    /// Last pointer position, so trajectories start where the previous one
    /// ended instead of teleporting from the origin.
    pointer: Mutex<(f64, f64)>,
}

impl ActionExecutor {
    pub fn new(resolver: Arc<ElementResolver>) -> Self {
        Self {
            resolver,
            pointer: Mutex::new((0.0, 0.0)),
        }
    }

    pub fn resolver(&self) -> &Arc<ElementResolver> {
        &self.resolver
    }

    /// Click the element matching a description.
    pub async fn click(
        &self,
        page: &Arc<dyn PageDriver>,
        description: &ElementDescription,
        options: &ActionOptions,
    ) -> ActionResult {
        self.run(options, |_| {
            let page = page.clone();
            let description = description.clone();
            let options = options.clone();
            async move {
                let candidate = self.resolve(&page, &description).await?;
                let url_before = page.url().await.unwrap_or_default();

                if candidate.source == SelectorSource::Visual {
                    let bbox = candidate.element.bounding_box.ok_or_else(|| {
                        Error::NotInteractable(description.description.clone())
                    })?;
                    self.pointer_click(&page, bbox, options.humanize).await?;
                } else {
                    self.click_candidate(&page, &candidate, &options).await?;
                }

                self.settle(&page).await;

                if options.validate && candidate.source != SelectorSource::Visual {
                    let url_after = page.url().await.unwrap_or_default();
                    if url_after == url_before {
                        let still_there = page
                            .locate(&candidate.selector)
                            .await
                            .map(|els| !els.is_empty())
                            .unwrap_or(false);
                        if !still_there {
                            return Err(Error::ActionValidationFailed(format!(
                                "click on '{}' left no trace: element gone and url unchanged",
                                description.description
                            )));
                        }
                    }
                }
                Ok(None)
            }
        })
        .await
    }

    /// Type text into the element matching a description.
    pub async fn type_text(
        &self,
        page: &Arc<dyn PageDriver>,
        description: &ElementDescription,
        text: &str,
        options: &ActionOptions,
    ) -> ActionResult {
        self.run(options, |_| {
            let page = page.clone();
            let description = description.clone();
            let text = text.to_string();
            let options = options.clone();
            async move {
                let candidate = self.resolve(&page, &description).await?;
                if !candidate.element.interactable() {
                    return Err(Error::NotInteractable(description.description.clone()));
                }
                let selector = &candidate.selector;
                let index = candidate.element.index;

                if options.scroll_into_view {
                    page.scroll_into_view(selector, index).await?;
                }
                if options.clear {
                    page.clear_input(selector, index).await?;
                }

                if options.humanize {
                    self.type_humanized(&page, selector, index, &text).await?;
                } else {
                    page.type_chunk(selector, index, &text).await?;
                }

                if options.validate {
                    let value = page.input_value(selector, index).await?;
                    if !value.contains(&text) {
                        return Err(Error::ActionValidationFailed(format!(
                            "typed text not present in '{}' after input",
                            description.description
                        )));
                    }
                }
                Ok(None)
            }
        })
        .await
    }

    /// Press a named key (e.g. "Enter") on the element matching a
    /// description.
    pub async fn press(
        &self,
        page: &Arc<dyn PageDriver>,
        description: &ElementDescription,
        key: &str,
        options: &ActionOptions,
    ) -> ActionResult {
        self.run(options, |_| {
            let page = page.clone();
            let description = description.clone();
            let key = key.to_string();
            async move {
                let candidate = self.resolve(&page, &description).await?;
                page.press_key(&candidate.selector, candidate.element.index, &key)
                    .await?;
                self.settle(&page).await;
                Ok(None)
            }
        })
        .await
    }

    /// Scroll the viewport by a pixel delta.
    pub async fn scroll(
        &self,
        page: &Arc<dyn PageDriver>,
        dx: f64,
        dy: f64,
        options: &ActionOptions,
    ) -> ActionResult {
        self.run(options, |_| {
            let page = page.clone();
            async move {
                if dy.abs() > 400.0 {
                    // Large scrolls happen in flicks, not one jump.
                    let steps = ((dy.abs() / 400.0).ceil() as u32).min(8);
                    let step_dy = dy / steps as f64;
                    let step_dx = dx / steps as f64;
                    for _ in 0..steps {
                        page.scroll_by(step_dx, step_dy).await?;
                        let ms = rand::thread_rng().gen_range(40..120);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                } else {
                    page.scroll_by(dx, dy).await?;
                }
                Ok(None)
            }
        })
        .await
    }

    /// Bring the element matching a description into the viewport.
    pub async fn scroll_to_element(
        &self,
        page: &Arc<dyn PageDriver>,
        description: &ElementDescription,
        options: &ActionOptions,
    ) -> ActionResult {
        self.run(options, |_| {
            let page = page.clone();
            let description = description.clone();
            async move {
                let candidate = self.resolve(&page, &description).await?;
                page.scroll_into_view(&candidate.selector, candidate.element.index)
                    .await?;
                Ok(None)
            }
        })
        .await
    }

    /// Scroll to the bottom of the document.
    pub async fn scroll_to_bottom(
        &self,
        page: &Arc<dyn PageDriver>,
        options: &ActionOptions,
    ) -> ActionResult {
        self.run(options, |_| {
            let page = page.clone();
            async move {
                page.evaluate("window.scrollTo(0, document.body.scrollHeight)")
                    .await?;
                Ok(None)
            }
        })
        .await
    }

    /// Extract the visible text of the element matching a description. The
    /// text lands in [`ActionResult::value`].
    pub async fn extract_text(
        &self,
        page: &Arc<dyn PageDriver>,
        description: &ElementDescription,
        options: &ActionOptions,
    ) -> ActionResult {
        self.run(options, |_| {
            let page = page.clone();
            let description = description.clone();
            async move {
                let candidate = self.resolve(&page, &description).await?;
                Ok(Some(serde_json::Value::String(candidate.element.text)))
            }
        })
        .await
    }

    async fn resolve(
        &self,
        page: &Arc<dyn PageDriver>,
        description: &ElementDescription,
    ) -> Result<ElementCandidate> {
        self.resolver
            .find_element(page, description)
            .await?
            .ok_or_else(|| Error::ElementNotFound(description.description.clone()))
    }

    async fn click_candidate(
        &self,
        page: &Arc<dyn PageDriver>,
        candidate: &ElementCandidate,
        options: &ActionOptions,
    ) -> Result<()> {
        let selector = &candidate.selector;
        let index = candidate.element.index;

        if options.scroll_into_view {
            page.scroll_into_view(selector, index).await?;
        }

        // Re-locate after scrolling so the box reflects the final layout.
        let bbox = if options.humanize {
            page.locate(selector)
                .await?
                .into_iter()
                .find(|e| e.index == index)
                .and_then(|e| e.bounding_box)
        } else {
            None
        };

        match bbox {
            Some(bbox) => self.pointer_click(page, bbox, true).await,
            None => page.click_element(selector, index).await,
        }
    }

    /// Move the pointer along a curved path and click inside the box.
    async fn pointer_click(
        &self,
        page: &Arc<dyn PageDriver>,
        bbox: BoundingBox,
        humanize: bool,
    ) -> Result<()> {
        let target = target_point(&bbox, humanize);

        if humanize {
            let from = *self.pointer.lock();
            for (x, y) in trajectory(from, target) {
                page.move_mouse(x, y).await?;
                let ms = rand::thread_rng().gen_range(8..20);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }

        page.click_at(target.0, target.1).await?;
        *self.pointer.lock() = target;
        Ok(())
    }

    async fn type_humanized(
        &self,
        page: &Arc<dyn PageDriver>,
        selector: &Selector,
        index: usize,
        text: &str,
    ) -> Result<()> {
        for ch in text.chars() {
            let (pause, typo) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_bool(THINKING_PAUSE_CHANCE),
                    rng.gen_bool(TYPO_CHANCE),
                )
            };

            if pause {
                let ms = rand::thread_rng().gen_range(200..600);
                trace!(ms, "thinking pause");
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }

            if typo && ch.is_ascii_alphabetic() {
                let wrong = neighbor_key(ch);
                page.type_chunk(selector, index, &wrong.to_string()).await?;
                tokio::time::sleep(key_delay(wrong)).await;
                page.press_key(selector, index, "Backspace").await?;
                tokio::time::sleep(key_delay(ch)).await;
            }

            page.type_chunk(selector, index, &ch.to_string()).await?;
            tokio::time::sleep(key_delay(ch)).await;
        }
        Ok(())
    }

    /// Give the page a chance to settle after an interaction. Timing out
    /// here is not a failure.
    async fn settle(&self, page: &Arc<dyn PageDriver>) {
        if page
            .wait_for_load_state(LoadState::NetworkIdle, STABILITY_TIMEOUT)
            .await
            .is_err()
        {
            tokio::time::sleep(STABILITY_FALLBACK).await;
        }
    }

    /// Retry loop shared by all actions. Attempt failures become a failed
    /// `ActionResult`, never an `Err`.
    async fn run<'a, F, Fut>(&'a self, options: &ActionOptions, mut attempt_fn: F) -> ActionResult
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<Option<serde_json::Value>>> + 'a,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        let mut last_error: Option<Error> = None;

        loop {
            attempt += 1;
            match tokio::time::timeout(options.timeout, attempt_fn(attempt)).await {
                Ok(Ok(value)) => {
                    return ActionResult::ok(attempt - 1, started.elapsed(), value);
                }
                Ok(Err(e)) => {
                    debug!(attempt, error = %e, "action attempt failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    debug!(attempt, "action attempt timed out");
                    last_error = Some(Error::WaitTimeout(format!(
                        "action attempt exceeded {:?}",
                        options.timeout
                    )));
                }
            }

            if !options.retry.allows_retry(attempt) {
                break;
            }
            tokio::time::sleep(options.retry.backoff.jittered_delay(attempt)).await;
        }

        let error = last_error.unwrap_or_else(|| Error::ActionValidationFailed("no attempt ran".into()));
        ActionResult::failed(error, attempt, started.elapsed())
    }
}

/// Delay after a keystroke: common letters come faster, everything gets a
/// random multiplier.
fn key_delay(ch: char) -> Duration {
    let mut base = BASE_KEY_DELAY_MS as f64;
    if HIGH_FREQUENCY.contains(ch.to_ascii_lowercase()) {
        base *= 0.7;
    }
    let multiplier = rand::thread_rng().gen_range(0.6..1.4);
    Duration::from_millis((base * multiplier) as u64)
}

/// A plausible mistyped neighbor on a QWERTY layout.
fn neighbor_key(ch: char) -> char {
    let rows = ["qwertyuiop", "asdfghjkl", "zxcvbnm"];
    let lower = ch.to_ascii_lowercase();
    for row in rows {
        if let Some(pos) = row.find(lower) {
            let neighbor = if pos + 1 < row.len() {
                row.as_bytes()[pos + 1]
            } else {
                row.as_bytes()[pos - 1]
            };
            return neighbor as char;
        }
    }
    lower
}

/// Pick the click point: dead center when mechanical, a random point in the
/// central region when humanized.
fn target_point(bbox: &BoundingBox, humanize: bool) -> (f64, f64) {
    let (cx, cy) = bbox.center();
    if !humanize || bbox.width < 4.0 || bbox.height < 4.0 {
        return (cx, cy);
    }
    let mut rng = rand::thread_rng();
    let dx = rng.gen_range(-0.3..0.3) * bbox.width;
    let dy = rng.gen_range(-0.3..0.3) * bbox.height;
    (cx + dx, cy + dy)
}

/// Quadratic bezier path from `from` to `to` with a perpendicular bow and
/// per-step jitter. Step count scales with distance.
fn trajectory(from: (f64, f64), to: (f64, f64)) -> Vec<(f64, f64)> {
    let (x0, y0) = from;
    let (x1, y1) = to;
    let distance = ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
    if distance < 2.0 {
        return vec![to];
    }

    let mut rng = rand::thread_rng();
    let steps = ((distance / 60.0).ceil() as usize).clamp(6, 24);

    // Control point off the midpoint, perpendicular to the travel line.
    let bow = rng.gen_range(-0.25..0.25) * distance;
    let mid_x = (x0 + x1) / 2.0 - (y1 - y0) / distance * bow;
    let mid_y = (y0 + y1) / 2.0 + (x1 - x0) / distance * bow;

    let mut points = Vec::with_capacity(steps);
    for i in 1..=steps {
        let t = i as f64 / steps as f64;
        let inv = 1.0 - t;
        let mut x = inv * inv * x0 + 2.0 * inv * t * mid_x + t * t * x1;
        let mut y = inv * inv * y0 + 2.0 * inv * t * mid_y + t * t * y1;
        if i < steps {
            x += rng.gen_range(-2.0..2.0);
            y += rng.gen_range(-2.0..2.0);
        } else {
            x = x1;
            y = y1;
        }
        points.push((x, y));
    }
    points
}
