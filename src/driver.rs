use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Selector syntax understood by a page driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorSyntax {
    Css,
    XPath,
}

/// A concrete locator expression, ready to run against a live page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Selector {
    pub syntax: SelectorSyntax,
    pub expr: String,
}

impl Selector {
    pub fn css(expr: impl Into<String>) -> Self {
        Self {
            syntax: SelectorSyntax::Css,
            expr: expr.into(),
        }
    }

    pub fn xpath(expr: impl Into<String>) -> Self {
        Self {
            syntax: SelectorSyntax::XPath,
            expr: expr.into(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.syntax {
            SelectorSyntax::Css => write!(f, "{}", self.expr),
            SelectorSyntax::XPath => write!(f, "xpath={}", self.expr),
        }
    }
}

/// Axis-aligned bounding box in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Snapshot of one located DOM element.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ElementInfo {
    /// Selector that located this element.
    pub selector: Selector,
    /// Index within the selector's match list.
    pub index: usize,
    pub tag: String,
    pub text: String,
    pub attributes: HashMap<String, String>,
    pub bounding_box: Option<BoundingBox>,
    pub visible: bool,
    pub enabled: bool,
}

impl ElementInfo {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Visible, enabled and laid out — i.e. a pointer action can land on it.
    pub fn interactable(&self) -> bool {
        self.visible && self.enabled && self.bounding_box.is_some()
    }
}

/// Point-in-time measure of how busy a page is, blended by the adaptive
/// waiter into its poll interval.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct PageActivity {
    /// Network requests currently in flight.
    pub inflight_requests: u32,
    /// DOM mutations observed per second over the recent sampling window.
    pub mutations_per_second: f64,
}

impl PageActivity {
    /// Normalized activity in [0,1]: 0 = fully idle, 1 = churning.
    pub fn score(&self) -> f64 {
        let net = (self.inflight_requests as f64 / 4.0).min(1.0);
        let dom = (self.mutations_per_second / 20.0).min(1.0);
        (net.max(dom)).clamp(0.0, 1.0)
    }

    pub fn is_idle(&self) -> bool {
        self.inflight_requests == 0 && self.mutations_per_second < 1.0
    }
}

/// Page load milestones a caller can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    DomContentLoaded,
    Load,
    NetworkIdle,
}

/// One launched browser instance. The pool owns these; everything above the
/// pool only sees pages.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open a new page (tab) navigated to the given URL.
    async fn new_page(&self, url: &str) -> Result<Arc<dyn PageDriver>>;

    /// Close the browser and all its pages. Must be idempotent.
    async fn close(&self) -> Result<()>;
}

/// One navigable document. All methods are suspension points; the driver
/// must not reorder operations issued by a single caller.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    async fn reload(&self) -> Result<()>;

    async fn url(&self) -> Result<String>;

    /// Full HTML content of the document.
    async fn content(&self) -> Result<String>;

    /// Resolve a selector to element snapshots. An empty list is a valid
    /// outcome, not an error.
    async fn locate(&self, selector: &Selector) -> Result<Vec<ElementInfo>>;

    /// Click the nth match of the selector via the driver's own semantics
    /// (used when a pointer trajectory is not wanted).
    async fn click_element(&self, selector: &Selector, index: usize) -> Result<()>;

    /// Move the pointer to page coordinates. Trajectory steps call this
    /// repeatedly.
    async fn move_mouse(&self, x: f64, y: f64) -> Result<()>;

    /// Press and release the primary button at page coordinates.
    async fn click_at(&self, x: f64, y: f64) -> Result<()>;

    /// Type a chunk of text (often a single character) into the nth match.
    async fn type_chunk(&self, selector: &Selector, index: usize, chunk: &str) -> Result<()>;

    /// Press a named key (e.g. "Enter", "Backspace") on the nth match.
    async fn press_key(&self, selector: &Selector, index: usize, key: &str) -> Result<()>;

    /// Clear the value of the nth matching input.
    async fn clear_input(&self, selector: &Selector, index: usize) -> Result<()>;

    /// Current value of the nth matching input.
    async fn input_value(&self, selector: &Selector, index: usize) -> Result<String>;

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()>;

    async fn scroll_into_view(&self, selector: &Selector, index: usize) -> Result<()>;

    /// PNG screenshot of the viewport.
    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// Evaluate a JavaScript expression, returning its JSON value.
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value>;

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> Result<()>;

    /// Sample current page activity (network + DOM churn).
    async fn activity(&self) -> Result<PageActivity>;

    async fn close(&self) -> Result<()>;
}
