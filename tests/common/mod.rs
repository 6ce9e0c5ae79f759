#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use agentic_autopilot::config::SessionConfig;
use agentic_autopilot::driver::{
    BoundingBox, BrowserDriver, ElementInfo, LoadState, PageActivity, PageDriver, Selector,
};
use agentic_autopilot::error::Result;
use agentic_autopilot::session::SessionLauncher;

/// An in-memory element. A selector matches it when any of its tokens
/// appears as a substring of the selector expression (case-insensitive),
/// which is enough for the resolver's generated selectors to find it.
#[derive(Debug, Clone)]
pub struct MockElement {
    pub tokens: Vec<String>,
    pub tag: String,
    pub text: String,
    pub attributes: HashMap<String, String>,
    pub bbox: BoundingBox,
    pub visible: bool,
    pub enabled: bool,
}

impl MockElement {
    fn base(tag: &str, token: &str) -> Self {
        Self {
            tokens: vec![token.to_lowercase()],
            tag: tag.to_string(),
            text: String::new(),
            attributes: HashMap::new(),
            bbox: BoundingBox {
                x: 50.0,
                y: 50.0,
                width: 120.0,
                height: 32.0,
            },
            visible: true,
            enabled: true,
        }
    }

    pub fn button(token: &str, text: &str) -> Self {
        let mut el = Self::base("button", token);
        el.text = text.to_string();
        el
    }

    pub fn link(token: &str, text: &str) -> Self {
        let mut el = Self::base("a", token);
        el.text = text.to_string();
        el.attributes.insert("href".into(), "#".into());
        el
    }

    pub fn input(token: &str) -> Self {
        let mut el = Self::base("input", token);
        el.attributes.insert("placeholder".into(), token.to_string());
        el
    }

    pub fn token(mut self, token: &str) -> Self {
        self.tokens.push(token.to_lowercase());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn matches(&self, selector: &Selector) -> bool {
        let expr = selector.expr.to_lowercase();
        self.tokens.iter().any(|t| expr.contains(t.as_str()))
    }
}

/// Scriptable in-memory page driver.
pub struct MockPage {
    pub elements: Mutex<Vec<MockElement>>,
    /// Elements that appear the next time the page reloads.
    pub appear_after_reload: Mutex<Vec<MockElement>>,
    pub url: Mutex<String>,
    pub html: Mutex<String>,
    pub activity: Mutex<PageActivity>,
    /// Typed input values, keyed by (selector expression, match index).
    pub inputs: Mutex<HashMap<(String, usize), String>>,
    /// URL the page moves to when something is clicked.
    pub url_after_click: Mutex<Option<String>>,
    /// Simulates a page that tears its DOM down on click without
    /// navigating anywhere.
    pub vanish_on_click: AtomicBool,
    pub locate_calls: AtomicUsize,
    pub click_count: AtomicUsize,
    pub reload_count: AtomicUsize,
    pub navigations: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

impl MockPage {
    pub fn new() -> Arc<Self> {
        Self::with_elements(Vec::new())
    }

    pub fn with_elements(elements: Vec<MockElement>) -> Arc<Self> {
        Arc::new(Self {
            elements: Mutex::new(elements),
            appear_after_reload: Mutex::new(Vec::new()),
            url: Mutex::new("https://example.test/".to_string()),
            html: Mutex::new("<html><body></body></html>".to_string()),
            activity: Mutex::new(PageActivity::default()),
            inputs: Mutex::new(HashMap::new()),
            url_after_click: Mutex::new(None),
            vanish_on_click: AtomicBool::new(false),
            locate_calls: AtomicUsize::new(0),
            click_count: AtomicUsize::new(0),
            reload_count: AtomicUsize::new(0),
            navigations: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn as_driver(self: &Arc<Self>) -> Arc<dyn PageDriver> {
        self.clone()
    }

    fn register_click(&self) {
        self.click_count.fetch_add(1, Ordering::SeqCst);
        if let Some(url) = self.url_after_click.lock().clone() {
            *self.url.lock() = url;
        }
        if self.vanish_on_click.load(Ordering::SeqCst) {
            self.elements.lock().clear();
        }
    }
}

#[async_trait]
impl PageDriver for MockPage {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.navigations.lock().push(url.to_string());
        *self.url.lock() = url.to_string();
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.reload_count.fetch_add(1, Ordering::SeqCst);
        let appearing: Vec<MockElement> = self.appear_after_reload.lock().drain(..).collect();
        self.elements.lock().extend(appearing);
        Ok(())
    }

    async fn url(&self) -> Result<String> {
        Ok(self.url.lock().clone())
    }

    async fn content(&self) -> Result<String> {
        Ok(self.html.lock().clone())
    }

    async fn locate(&self, selector: &Selector) -> Result<Vec<ElementInfo>> {
        self.locate_calls.fetch_add(1, Ordering::SeqCst);
        let elements = self.elements.lock();
        Ok(elements
            .iter()
            .filter(|e| e.matches(selector))
            .enumerate()
            .map(|(index, e)| ElementInfo {
                selector: selector.clone(),
                index,
                tag: e.tag.clone(),
                text: e.text.clone(),
                attributes: e.attributes.clone(),
                bounding_box: Some(e.bbox),
                visible: e.visible,
                enabled: e.enabled,
            })
            .collect())
    }

    async fn click_element(&self, _selector: &Selector, _index: usize) -> Result<()> {
        self.register_click();
        Ok(())
    }

    async fn move_mouse(&self, _x: f64, _y: f64) -> Result<()> {
        Ok(())
    }

    async fn click_at(&self, _x: f64, _y: f64) -> Result<()> {
        self.register_click();
        Ok(())
    }

    async fn type_chunk(&self, selector: &Selector, index: usize, chunk: &str) -> Result<()> {
        let mut inputs = self.inputs.lock();
        inputs
            .entry((selector.expr.clone(), index))
            .or_default()
            .push_str(chunk);
        Ok(())
    }

    async fn press_key(&self, selector: &Selector, index: usize, key: &str) -> Result<()> {
        if key == "Backspace" {
            let mut inputs = self.inputs.lock();
            if let Some(value) = inputs.get_mut(&(selector.expr.clone(), index)) {
                value.pop();
            }
        }
        Ok(())
    }

    async fn clear_input(&self, selector: &Selector, index: usize) -> Result<()> {
        self.inputs
            .lock()
            .insert((selector.expr.clone(), index), String::new());
        Ok(())
    }

    async fn input_value(&self, selector: &Selector, index: usize) -> Result<String> {
        Ok(self
            .inputs
            .lock()
            .get(&(selector.expr.clone(), index))
            .cloned()
            .unwrap_or_default())
    }

    async fn scroll_by(&self, _dx: f64, _dy: f64) -> Result<()> {
        Ok(())
    }

    async fn scroll_into_view(&self, _selector: &Selector, _index: usize) -> Result<()> {
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn evaluate(&self, _expression: &str) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn wait_for_load_state(&self, _state: LoadState, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn activity(&self) -> Result<PageActivity> {
        Ok(*self.activity.lock())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory browser for pool tests.
pub struct MockBrowser {
    pub closed: AtomicBool,
    pub pages: Mutex<Vec<Arc<MockPage>>>,
}

impl MockBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            pages: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl BrowserDriver for MockBrowser {
    async fn new_page(&self, url: &str) -> Result<Arc<dyn PageDriver>> {
        let page = MockPage::new();
        *page.url.lock() = url.to_string();
        self.pages.lock().push(page.clone());
        Ok(page)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Launcher that hands out mock browsers and remembers them.
pub struct MockLauncher {
    pub launched: Mutex<Vec<Arc<MockBrowser>>>,
}

impl MockLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            launched: Mutex::new(Vec::new()),
        })
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().len()
    }
}

#[async_trait]
impl SessionLauncher for MockLauncher {
    async fn launch(&self, _config: &SessionConfig) -> Result<Arc<dyn BrowserDriver>> {
        let browser = MockBrowser::new();
        self.launched.lock().push(browser.clone());
        Ok(browser)
    }
}
