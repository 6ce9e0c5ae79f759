use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser as CrBrowser, BrowserConfig as CrBrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, AuthChallengeResponseResponse, ContinueWithAuthParams, EnableParams, EventAuthRequired,
    EventRequestPaused,
};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::{Page as CrPage, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::driver::{
    BoundingBox, BrowserDriver, ElementInfo, LoadState, PageActivity, PageDriver, Selector,
    SelectorSyntax,
};
use crate::error::{Error, Result};
use crate::stealth;

/// Chrome flags that improve performance without affecting functionality.
const PERF_ARGS: &[&str] = &[
    "disable-gpu",
    "disable-extensions",
    "metrics-recording-only",
    "mute-audio",
    "no-default-browser-check",
    "disable-client-side-phishing-detection",
    "disable-popup-blocking",
    "disable-prompt-on-repost",
];

/// Cap on how many matches `locate` reports per selector.
const MAX_LOCATED: usize = 50;

/// Chromium-backed implementation of [`BrowserDriver`].
pub struct ChromeDriver {
    browser: AsyncMutex<CrBrowser>,
    stealth_script: Option<String>,
    proxy_auth: Option<(Arc<str>, Arc<str>)>,
    default_timeout: Duration,
    closed: AtomicBool,
    _handler_task: tokio::task::JoinHandle<()>,
}

impl ChromeDriver {
    /// Launch a Chrome instance for the given session configuration.
    /// A failed launch leaves nothing behind.
    pub async fn launch(config: &SessionConfig) -> Result<Self> {
        let mut builder = CrBrowserConfig::builder();

        if config.headless {
            builder = builder.new_headless_mode().no_sandbox();
        } else {
            builder = builder.with_head().no_sandbox();
        }

        for arg in PERF_ARGS {
            builder = builder.arg(*arg);
        }

        // chromiumoxide adds the `--` prefix itself, so keys must not include it.
        let stealth_script = if config.stealth {
            let fingerprint = config
                .fingerprint
                .clone()
                .unwrap_or_else(stealth::Fingerprint::generate);
            for arg in stealth::stealth_key_args() {
                builder = builder.arg(arg);
            }
            for (key, value) in stealth::stealth_kv_args(&fingerprint) {
                builder = builder.arg((key, value.as_str()));
            }
            Some(stealth::stealth_script(&fingerprint))
        } else {
            None
        };

        if let Some(ref proxy) = config.proxy {
            builder = builder.arg(("proxy-server", proxy.server.as_str()));
        }

        if let Some(ref path) = config.chrome_path {
            builder = builder.chrome_executable(path);
        }

        builder = builder.viewport(Viewport {
            width: config.viewport_width,
            height: config.viewport_height,
            device_scale_factor: None,
            emulating_mobile: false,
            is_landscape: false,
            has_touch: false,
        });

        let cr_config = builder
            .build()
            .map_err(|e| Error::LaunchFailed(e.to_string()))?;

        let (browser, mut handler) = CrBrowser::launch(cr_config)
            .await
            .map_err(|e| Error::LaunchFailed(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(_event) = handler.next().await {}
        });

        let proxy_auth = config.proxy.as_ref().and_then(|p| match (&p.username, &p.password) {
            (Some(u), Some(p)) => Some((Arc::from(u.as_str()), Arc::from(p.as_str()))),
            _ => None,
        });

        Ok(Self {
            browser: AsyncMutex::new(browser),
            stealth_script,
            proxy_auth,
            default_timeout: config.default_timeout,
            closed: AtomicBool::new(false),
            _handler_task: handler_task,
        })
    }

    /// Set up proxy authentication handlers for a page, answering 407
    /// challenges with the configured credentials.
    async fn setup_proxy_auth(
        cr_page: &CrPage,
        username: &Arc<str>,
        password: &Arc<str>,
    ) -> Result<()> {
        // Listeners must be subscribed before the fetch domain is enabled.
        let mut auth_events = cr_page
            .event_listener::<EventAuthRequired>()
            .await
            .map_err(|e| Error::LaunchFailed(format!("Failed to listen for auth events: {e}")))?;

        let mut pause_events = cr_page.event_listener::<EventRequestPaused>().await.map_err(|e| {
            Error::LaunchFailed(format!("Failed to listen for request paused events: {e}"))
        })?;

        let enable_params = EnableParams::builder().handle_auth_requests(true).build();
        cr_page
            .execute(enable_params)
            .await
            .map_err(|e| Error::LaunchFailed(format!("Failed to enable fetch for proxy auth: {e}")))?;

        let username = Arc::clone(username);
        let password = Arc::clone(password);
        let page_clone = cr_page.clone();

        tokio::spawn(async move {
            while let Some(event) = auth_events.next().await {
                let auth_response = match fetch::AuthChallengeResponse::builder()
                    .response(AuthChallengeResponseResponse::ProvideCredentials)
                    .username(username.as_ref())
                    .password(password.as_ref())
                    .build()
                {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("failed to build proxy auth response: {e}");
                        continue;
                    }
                };
                let params = ContinueWithAuthParams::new(event.request_id.clone(), auth_response);
                let _ = page_clone.execute(params).await;
            }
        });

        let page_clone2 = cr_page.clone();
        tokio::spawn(async move {
            while let Some(event) = pause_events.next().await {
                let params = fetch::ContinueRequestParams::new(event.request_id.clone());
                let _ = page_clone2.execute(params).await;
            }
        });

        Ok(())
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn new_page(&self, url: &str) -> Result<Arc<dyn PageDriver>> {
        let cr_page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| Error::NavigationError(e.to_string()))?
        };

        // Activity monitor and stealth evasions must run before site JS.
        let monitor = AddScriptToEvaluateOnNewDocumentParams::new(MONITOR_JS);
        cr_page
            .execute(monitor)
            .await
            .map_err(|e| Error::JsError(format!("Failed to inject activity monitor: {e}")))?;

        if let Some(ref script) = self.stealth_script {
            let params = AddScriptToEvaluateOnNewDocumentParams::new(script.as_str());
            cr_page
                .execute(params)
                .await
                .map_err(|e| Error::JsError(format!("Failed to inject stealth scripts: {e}")))?;
        }

        if let Some((ref username, ref password)) = self.proxy_auth {
            Self::setup_proxy_auth(&cr_page, username, password).await?;
        }

        cr_page
            .goto(url)
            .await
            .map_err(|e| Error::NavigationError(e.to_string()))?;

        Ok(Arc::new(ChromePage {
            inner: cr_page,
            default_timeout: self.default_timeout,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut browser = self.browser.lock().await;
        browser.close().await.map_err(Error::CdpError)?;
        Ok(())
    }
}

/// Chromium-backed implementation of [`PageDriver`].
pub struct ChromePage {
    inner: CrPage,
    default_timeout: Duration,
}

impl ChromePage {
    /// Evaluate JS that returns `JSON.stringify(...)` and decode it.
    async fn eval_json(&self, js: String) -> Result<serde_json::Value> {
        let result = self
            .inner
            .evaluate(js)
            .await
            .map_err(|e| Error::JsError(e.to_string()))?;
        let json_str: String = result
            .into_value()
            .map_err(|e| Error::JsError(e.to_string()))?;
        serde_json::from_str(&json_str).map_err(|e| Error::JsError(e.to_string()))
    }

    /// JS expression producing an array of nodes for a selector. Invalid
    /// selectors yield an empty array, never a thrown error.
    fn nodes_js(selector: &Selector) -> String {
        let expr = serde_json::to_string(&selector.expr).unwrap_or_else(|_| "\"\"".into());
        match selector.syntax {
            SelectorSyntax::Css => format!(
                "(() => {{ try {{ return Array.from(document.querySelectorAll({expr})); }} catch (e) {{ return []; }} }})"
            ),
            SelectorSyntax::XPath => format!(
                "(() => {{ try {{ const out = []; const it = document.evaluate({expr}, document, null, \
                 XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null); \
                 for (let i = 0; i < it.snapshotLength; i++) out.push(it.snapshotItem(i)); \
                 return out; }} catch (e) {{ return []; }} }})"
            ),
        }
    }

    /// Run a JS statement against the nth match. `body` sees `el` and must
    /// produce the `value` field of the JSON reply.
    async fn with_node(&self, selector: &Selector, index: usize, body: &str) -> Result<serde_json::Value> {
        let nodes = Self::nodes_js(selector);
        let js = format!(
            "(() => {{ const el = {nodes}()[{index}]; if (!el) return JSON.stringify({{ ok: false }}); \
             const value = (() => {{ {body} }})(); \
             return JSON.stringify({{ ok: true, value }}); }})()"
        );
        let reply = self.eval_json(js).await?;
        if reply["ok"].as_bool() != Some(true) {
            return Err(Error::ElementNotFound(format!("{selector} [{index}]")));
        }
        Ok(reply["value"].clone())
    }

    async fn dispatch_key(&self, key: &str) -> Result<()> {
        let code = match key {
            "Backspace" => Some(8),
            "Tab" => Some(9),
            "Enter" => Some(13),
            "Escape" => Some(27),
            "Delete" => Some(46),
            _ => None,
        };

        for event_type in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let mut builder = DispatchKeyEventParams::builder().r#type(event_type).key(key);
            if let Some(code) = code {
                builder = builder.windows_virtual_key_code(code);
            }
            let params = builder
                .build()
                .map_err(|e| Error::JsError(format!("failed to build key event: {e}")))?;
            self.inner.execute(params).await.map_err(Error::CdpError)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.inner
            .goto(url)
            .await
            .map_err(|e| Error::NavigationError(e.to_string()))?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.inner
            .reload()
            .await
            .map_err(|e| Error::NavigationError(e.to_string()))?;
        Ok(())
    }

    async fn url(&self) -> Result<String> {
        self.inner
            .url()
            .await
            .map_err(|e| Error::NavigationError(e.to_string()))?
            .ok_or_else(|| Error::NavigationError("No URL found".into()))
    }

    async fn content(&self) -> Result<String> {
        self.inner
            .content()
            .await
            .map_err(|e| Error::JsError(e.to_string()))
    }

    async fn locate(&self, selector: &Selector) -> Result<Vec<ElementInfo>> {
        let nodes = Self::nodes_js(selector);
        let js = format!(
            r#"(() => {{
                const nodes = {nodes}();
                return JSON.stringify(nodes.slice(0, {MAX_LOCATED}).map(el => {{
                    const r = el.getBoundingClientRect();
                    const style = window.getComputedStyle(el);
                    const attrs = {{}};
                    for (const a of el.attributes || []) attrs[a.name] = a.value;
                    const visible = !!(r.width || r.height)
                        && style.visibility !== 'hidden' && style.display !== 'none';
                    return {{
                        tag: el.tagName ? el.tagName.toLowerCase() : '',
                        text: ((el.innerText || el.value || '') + '').trim().slice(0, 300),
                        attrs,
                        box: {{ x: r.x, y: r.y, width: r.width, height: r.height }},
                        visible,
                        enabled: !el.disabled,
                    }};
                }}));
            }})()"#
        );

        #[derive(serde::Deserialize)]
        struct RawElement {
            tag: String,
            text: String,
            attrs: std::collections::HashMap<String, String>,
            r#box: BoundingBox,
            visible: bool,
            enabled: bool,
        }

        let value = self.eval_json(js).await?;
        let raw: Vec<RawElement> =
            serde_json::from_value(value).map_err(|e| Error::JsError(e.to_string()))?;

        Ok(raw
            .into_iter()
            .enumerate()
            .map(|(index, el)| ElementInfo {
                selector: selector.clone(),
                index,
                tag: el.tag,
                text: el.text,
                attributes: el.attrs,
                bounding_box: (el.r#box.width > 0.0 || el.r#box.height > 0.0).then_some(el.r#box),
                visible: el.visible,
                enabled: el.enabled,
            })
            .collect())
    }

    async fn click_element(&self, selector: &Selector, index: usize) -> Result<()> {
        match selector.syntax {
            SelectorSyntax::Css => {
                let elements = self
                    .inner
                    .find_elements(selector.expr.as_str())
                    .await
                    .map_err(|e| Error::ElementNotFound(e.to_string()))?;
                let element = elements
                    .get(index)
                    .ok_or_else(|| Error::ElementNotFound(format!("{selector} [{index}]")))?;
                element.click().await.map_err(Error::CdpError)?;
            }
            SelectorSyntax::XPath => {
                self.with_node(selector, index, "el.click(); return true;").await?;
            }
        }
        Ok(())
    }

    async fn move_mouse(&self, x: f64, y: f64) -> Result<()> {
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(x.floor().max(0.0))
            .y(y.floor().max(0.0))
            .build()
            .map_err(|e| Error::JsError(format!("failed to build mouse event: {e}")))?;
        self.inner.execute(params).await.map_err(Error::CdpError)?;
        Ok(())
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<()> {
        self.move_mouse(x, y).await?;

        let x = x.floor().max(0.0);
        let y = y.floor().max(0.0);
        let down = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MousePressed)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(|e| Error::JsError(format!("failed to build mouse event: {e}")))?;
        self.inner.execute(down).await.map_err(Error::CdpError)?;

        // Small press-release gap so the page sees a plausible click.
        tokio::time::sleep(Duration::from_millis(40)).await;

        let up = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseReleased)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(|e| Error::JsError(format!("failed to build mouse event: {e}")))?;
        self.inner.execute(up).await.map_err(Error::CdpError)?;
        Ok(())
    }

    async fn type_chunk(&self, selector: &Selector, index: usize, chunk: &str) -> Result<()> {
        self.with_node(selector, index, "el.focus(); return true;").await?;
        let params = InsertTextParams::new(chunk);
        self.inner.execute(params).await.map_err(Error::CdpError)?;
        Ok(())
    }

    async fn press_key(&self, selector: &Selector, index: usize, key: &str) -> Result<()> {
        self.with_node(selector, index, "el.focus(); return true;").await?;
        self.dispatch_key(key).await
    }

    async fn clear_input(&self, selector: &Selector, index: usize) -> Result<()> {
        self.with_node(
            selector,
            index,
            "el.value = ''; \
             el.dispatchEvent(new Event('input', { bubbles: true })); \
             el.dispatchEvent(new Event('change', { bubbles: true })); \
             return true;",
        )
        .await?;
        Ok(())
    }

    async fn input_value(&self, selector: &Selector, index: usize) -> Result<String> {
        let value = self
            .with_node(selector, index, "return (el.value || '') + '';")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn scroll_by(&self, dx: f64, dy: f64) -> Result<()> {
        let js = format!("window.scrollBy({dx}, {dy})");
        self.inner
            .evaluate(js)
            .await
            .map_err(|e| Error::JsError(e.to_string()))?;
        Ok(())
    }

    async fn scroll_into_view(&self, selector: &Selector, index: usize) -> Result<()> {
        self.with_node(
            selector,
            index,
            "el.scrollIntoView({ block: 'center', inline: 'center' }); return true;",
        )
        .await?;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        self.inner
            .screenshot(params)
            .await
            .map_err(|e| Error::ScreenshotError(e.to_string()))
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value> {
        let result = self
            .inner
            .evaluate(expression)
            .await
            .map_err(|e| Error::JsError(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> Result<()> {
        let timeout = if timeout.is_zero() { self.default_timeout } else { timeout };
        let deadline = Instant::now() + timeout;
        let interval = Duration::from_millis(100);

        loop {
            let ready = match state {
                LoadState::DomContentLoaded => {
                    let v = self.evaluate("document.readyState").await?;
                    matches!(v.as_str(), Some("interactive") | Some("complete"))
                }
                LoadState::Load => {
                    let v = self.evaluate("document.readyState").await?;
                    v.as_str() == Some("complete")
                }
                LoadState::NetworkIdle => {
                    let v = self.evaluate("document.readyState").await?;
                    v.as_str() == Some("complete") && self.activity().await?.is_idle()
                }
            };
            if ready {
                return Ok(());
            }
            if Instant::now() + interval > deadline {
                debug!(?state, "load state not reached before deadline");
                return Err(Error::WaitTimeout(format!("load state {state:?}")));
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn activity(&self) -> Result<PageActivity> {
        let value = self.eval_json(ACTIVITY_READ_JS.to_string()).await?;
        Ok(PageActivity {
            inflight_requests: value["inflight"].as_u64().unwrap_or(0) as u32,
            mutations_per_second: value["rate"].as_f64().unwrap_or(0.0),
        })
    }

    async fn close(&self) -> Result<()> {
        self.inner.clone().close().await.map_err(Error::CdpError)?;
        Ok(())
    }
}

/// Installed before site JS on every page: counts in-flight fetch/XHR
/// requests and timestamps DOM mutations so `activity()` can report a rate.
static MONITOR_JS: &str = r#"
(() => {
    if (window.__apMonitor) return;
    const m = { inflight: 0, mutations: [] };
    window.__apMonitor = m;

    const origFetch = window.fetch;
    window.fetch = function(...args) {
        m.inflight++;
        return origFetch.apply(this, args).finally(() => {
            m.inflight = Math.max(0, m.inflight - 1);
        });
    };

    const origSend = XMLHttpRequest.prototype.send;
    XMLHttpRequest.prototype.send = function(...args) {
        m.inflight++;
        this.addEventListener('loadend', () => {
            m.inflight = Math.max(0, m.inflight - 1);
        });
        return origSend.apply(this, args);
    };

    const observer = new MutationObserver(muts => {
        m.mutations.push([Date.now(), muts.length]);
        if (m.mutations.length > 200) m.mutations.splice(0, m.mutations.length - 200);
    });
    const start = () => observer.observe(document.documentElement, {
        childList: true, subtree: true, attributes: true, characterData: true,
    });
    if (document.documentElement) start();
    else document.addEventListener('DOMContentLoaded', start);
})()
"#;

static ACTIVITY_READ_JS: &str = r#"
(() => {
    const m = window.__apMonitor;
    if (!m) return JSON.stringify({ inflight: 0, rate: 0 });
    const now = Date.now();
    const recent = m.mutations
        .filter(entry => now - entry[0] < 1000)
        .reduce((sum, entry) => sum + entry[1], 0);
    return JSON.stringify({ inflight: m.inflight, rate: recent });
})()
"#;
