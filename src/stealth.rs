use rand::seq::SliceRandom;
use rand::Rng;

/// A set of spoofed client-identifying properties applied to one stealth
/// session. Generated from templates with per-field jitter so no two
/// sessions are identical.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint {
    pub os: String,
    pub user_agent: String,
    /// navigator.platform value matching the OS.
    pub platform: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub hardware_concurrency: u32,
    /// IANA timezone name, e.g. "America/New_York".
    pub timezone: String,
    /// Minutes west of UTC, as reported by getTimezoneOffset().
    pub timezone_offset_minutes: i32,
    pub languages: Vec<String>,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub fonts: Vec<String>,
    /// Per-session canvas readback noise amplitude.
    pub canvas_noise: f64,
}

struct Template {
    os: &'static str,
    platform: &'static str,
    user_agents: &'static [&'static str],
    screens: &'static [(u32, u32)],
    timezones: &'static [(&'static str, i32)],
    webgl: &'static [(&'static str, &'static str)],
    fonts: &'static [&'static str],
}

const MACOS: Template = Template {
    os: "macos",
    platform: "MacIntel",
    user_agents: &[
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/145.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/144.0.0.0 Safari/537.36",
    ],
    screens: &[(1440, 900), (1512, 982), (1728, 1117), (2560, 1440)],
    timezones: &[
        ("America/New_York", 300),
        ("America/Los_Angeles", 480),
        ("America/Chicago", 360),
    ],
    webgl: &[
        ("Intel Inc.", "Intel Iris OpenGL Engine"),
        ("Apple Inc.", "Apple M2"),
        ("Apple Inc.", "Apple M3"),
    ],
    fonts: &[
        "Helvetica Neue", "Arial", "Times New Roman", "Courier New", "Menlo",
        "Monaco", "Geneva", "Georgia", "Avenir", "Futura",
    ],
};

const WINDOWS: Template = Template {
    os: "windows",
    platform: "Win32",
    user_agents: &[
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/145.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/144.0.0.0 Safari/537.36",
    ],
    screens: &[(1920, 1080), (1536, 864), (2560, 1440), (1366, 768)],
    timezones: &[
        ("Europe/London", 0),
        ("Europe/Berlin", -60),
        ("America/New_York", 300),
    ],
    webgl: &[
        ("Google Inc. (NVIDIA)", "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0, D3D11)"),
        ("Google Inc. (Intel)", "ANGLE (Intel, Intel(R) UHD Graphics 630 Direct3D11 vs_5_0 ps_5_0, D3D11)"),
        ("Google Inc. (AMD)", "ANGLE (AMD, AMD Radeon RX 6700 XT Direct3D11 vs_5_0 ps_5_0, D3D11)"),
    ],
    fonts: &[
        "Segoe UI", "Arial", "Calibri", "Cambria", "Consolas", "Georgia",
        "Tahoma", "Times New Roman", "Verdana", "Trebuchet MS",
    ],
};

const LINUX: Template = Template {
    os: "linux",
    platform: "Linux x86_64",
    user_agents: &[
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/145.0.0.0 Safari/537.36",
    ],
    screens: &[(1920, 1080), (2560, 1440), (1680, 1050)],
    timezones: &[("Europe/Amsterdam", -60), ("America/Denver", 420)],
    webgl: &[
        ("Mesa", "Mesa Intel(R) UHD Graphics (TGL GT2)"),
        ("Mesa", "llvmpipe (LLVM 15.0.7, 256 bits)"),
    ],
    fonts: &[
        "DejaVu Sans", "Liberation Sans", "Ubuntu", "Noto Sans", "FreeSans",
        "DejaVu Serif", "Liberation Mono",
    ],
};

const TEMPLATES: &[&Template] = &[&MACOS, &WINDOWS, &LINUX];

const CONCURRENCY_CHOICES: &[u32] = &[4, 8, 8, 12, 16];

impl Fingerprint {
    /// Generate a fingerprint from a random template with field-level
    /// jitter. Two calls are overwhelmingly unlikely to collide.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let tpl = TEMPLATES.choose(&mut rng).unwrap_or(&&MACOS);

        let &(screen_width, screen_height) = tpl.screens.choose(&mut rng).unwrap_or(&(1920, 1080));
        let &(timezone, tz_offset) = tpl
            .timezones
            .choose(&mut rng)
            .unwrap_or(&("America/New_York", 300));
        let &(webgl_vendor, webgl_renderer) = tpl
            .webgl
            .choose(&mut rng)
            .unwrap_or(&("Intel Inc.", "Intel Iris OpenGL Engine"));
        let user_agent = tpl.user_agents.choose(&mut rng).copied().unwrap_or("");

        // Drop a couple of fonts at random so the enumerable set differs
        // between sessions.
        let mut fonts: Vec<String> = tpl.fonts.iter().map(|f| f.to_string()).collect();
        fonts.shuffle(&mut rng);
        let keep = fonts.len().saturating_sub(rng.gen_range(0..3));
        fonts.truncate(keep.max(4));
        fonts.sort();

        Self {
            os: tpl.os.to_string(),
            user_agent: user_agent.to_string(),
            platform: tpl.platform.to_string(),
            screen_width,
            screen_height,
            hardware_concurrency: *CONCURRENCY_CHOICES.choose(&mut rng).unwrap_or(&8),
            timezone: timezone.to_string(),
            timezone_offset_minutes: tz_offset,
            languages: vec!["en-US".to_string(), "en".to_string()],
            webgl_vendor: webgl_vendor.to_string(),
            webgl_renderer: webgl_renderer.to_string(),
            fonts,
            canvas_noise: rng.gen_range(0.0001..0.001),
        }
    }
}

/// Chrome launch arguments for stealth mode.
/// Note: chromiumoxide adds `--` prefix automatically, so keys must NOT include `--`.
pub fn stealth_key_args() -> Vec<&'static str> {
    vec![
        "disable-infobars",
        "disable-default-apps",
        "disable-component-update",
        "no-first-run",
    ]
}

/// Key-value stealth args. The user agent comes from the session
/// fingerprint so subframes and service workers inherit it too.
pub fn stealth_kv_args(fingerprint: &Fingerprint) -> Vec<(&'static str, String)> {
    vec![
        ("disable-blink-features", "AutomationControlled".to_string()),
        ("user-agent", fingerprint.user_agent.clone()),
    ]
}

/// Evasion script parameterized by the session fingerprint, to be injected
/// so it runs before any site JS.
pub fn stealth_script(fp: &Fingerprint) -> String {
    let languages = serde_json::to_string(&fp.languages).unwrap_or_else(|_| "[\"en-US\"]".into());
    let platform = serde_json::to_string(&fp.platform).unwrap_or_default();
    let vendor = serde_json::to_string(&fp.webgl_vendor).unwrap_or_default();
    let renderer = serde_json::to_string(&fp.webgl_renderer).unwrap_or_default();
    let timezone = serde_json::to_string(&fp.timezone).unwrap_or_default();
    format!(
        r#"{base}
// === fingerprint overrides ===
Object.defineProperty(navigator, 'languages', {{
    get: () => {languages},
    configurable: true,
}});
Object.defineProperty(navigator, 'platform', {{
    get: () => {platform},
    configurable: true,
}});
Object.defineProperty(navigator, 'hardwareConcurrency', {{
    get: () => {concurrency},
    configurable: true,
}});
Object.defineProperty(screen, 'width', {{ get: () => {sw}, configurable: true }});
Object.defineProperty(screen, 'height', {{ get: () => {sh}, configurable: true }});
Object.defineProperty(screen, 'availWidth', {{ get: () => {sw}, configurable: true }});
Object.defineProperty(screen, 'availHeight', {{ get: () => {sh} - 25, configurable: true }});

// === timezone ===
const origTzOffset = Date.prototype.getTimezoneOffset;
Date.prototype.getTimezoneOffset = function() {{ return {tz_offset}; }};
const origResolved = Intl.DateTimeFormat.prototype.resolvedOptions;
Intl.DateTimeFormat.prototype.resolvedOptions = function() {{
    const opts = origResolved.call(this);
    opts.timeZone = {timezone};
    return opts;
}};

// === WebGL vendor/renderer ===
const getParameterOrig = WebGLRenderingContext.prototype.getParameter;
WebGLRenderingContext.prototype.getParameter = function(param) {{
    if (param === 0x9245) return {vendor};
    if (param === 0x9246) return {renderer};
    return getParameterOrig.call(this, param);
}};
if (window.WebGL2RenderingContext) {{
    const getParameterOrig2 = WebGL2RenderingContext.prototype.getParameter;
    WebGL2RenderingContext.prototype.getParameter = function(param) {{
        if (param === 0x9245) return {vendor};
        if (param === 0x9246) return {renderer};
        return getParameterOrig2.call(this, param);
    }};
}}

// === canvas noise ===
(function() {{
    const noise = {canvas_noise};
    const origToDataURL = HTMLCanvasElement.prototype.toDataURL;
    HTMLCanvasElement.prototype.toDataURL = function(...args) {{
        try {{
            const ctx = this.getContext('2d');
            if (ctx && this.width > 0 && this.height > 0) {{
                const img = ctx.getImageData(0, 0, this.width, this.height);
                for (let i = 0; i < img.data.length; i += 997) {{
                    img.data[i] = img.data[i] ^ (noise * 255 > Math.random() ? 1 : 0);
                }}
                ctx.putImageData(img, 0, 0);
            }}
        }} catch (e) {{}}
        return origToDataURL.apply(this, args);
    }};
}})();
"#,
        base = BASE_EVASIONS,
        languages = languages,
        platform = platform,
        concurrency = fp.hardware_concurrency,
        sw = fp.screen_width,
        sh = fp.screen_height,
        tz_offset = fp.timezone_offset_minutes,
        timezone = timezone,
        vendor = vendor,
        renderer = renderer,
        canvas_noise = fp.canvas_noise,
    )
}

/// Fingerprint-independent evasions, shared by every stealth session.
static BASE_EVASIONS: &str = r#"
// === navigator.webdriver ===
// Real non-automated Chrome has webdriver = false on Navigator.prototype.
// Headless/automated Chrome sets it to true. We redefine it on the prototype
// to return false, matching a real browser exactly.
Object.defineProperty(Navigator.prototype, 'webdriver', {
    get: () => false,
    configurable: true,
    enumerable: true,
});

// === window.chrome runtime ===
if (!window.chrome) {
    window.chrome = {
        runtime: {
            onConnect: undefined,
            onMessage: undefined,
            connect: function() {},
            sendMessage: function() {},
        },
        loadTimes: function() {
            return {};
        },
        csi: function() {
            return {};
        },
    };
}

// === navigator.plugins (must pass instanceof PluginArray check) ===
(function() {
    const makeFnNative = (fn, name) => {
        const p = new Proxy(fn, {
            get: (target, key) => {
                if (key === 'toString') return () => `function ${name}() { [native code] }`;
                return Reflect.get(target, key);
            }
        });
        return p;
    };

    const fakePlugins = Object.create(PluginArray.prototype);
    const pluginData = [
        { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer', description: 'Portable Document Format', length: 1 },
        { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai', description: '', length: 1 },
        { name: 'Native Client', filename: 'internal-nacl-plugin', description: '', length: 1 },
    ];
    pluginData.forEach((p, i) => {
        const plugin = Object.create(Plugin.prototype);
        Object.defineProperties(plugin, {
            name: { value: p.name, enumerable: true },
            filename: { value: p.filename, enumerable: true },
            description: { value: p.description, enumerable: true },
            length: { value: p.length, enumerable: true },
        });
        fakePlugins[i] = plugin;
    });
    Object.defineProperty(fakePlugins, 'length', { value: 3, enumerable: true });

    fakePlugins.item = makeFnNative(function item(i) { return this[i] || null; }, 'item');
    fakePlugins.namedItem = makeFnNative(function namedItem(name) {
        for (let i = 0; i < this.length; i++) { if (this[i].name === name) return this[i]; }
        return null;
    }, 'namedItem');
    fakePlugins.refresh = makeFnNative(function refresh() {}, 'refresh');

    Object.defineProperty(navigator, 'plugins', {
        get: () => fakePlugins,
        configurable: true,
    });

    const fakeMimeTypes = Object.create(MimeTypeArray.prototype);
    Object.defineProperty(fakeMimeTypes, 'length', { value: 2, enumerable: true });
    Object.defineProperty(navigator, 'mimeTypes', {
        get: () => fakeMimeTypes,
        configurable: true,
    });
})();

// === Permissions.query ===
const originalQuery = window.Permissions && window.Permissions.prototype.query;
if (originalQuery) {
    window.Permissions.prototype.query = function(parameters) {
        if (parameters.name === 'notifications') {
            return Promise.resolve({ state: Notification.permission });
        }
        return originalQuery.call(this, parameters);
    };
}

// === iframe contentWindow ===
try {
    const iframeProto = HTMLIFrameElement.prototype;
    const origContentWindow = Object.getOwnPropertyDescriptor(iframeProto, 'contentWindow');
    if (origContentWindow) {
        Object.defineProperty(iframeProto, 'contentWindow', {
            get: function() {
                const w = origContentWindow.get.call(this);
                if (w && !w.chrome) {
                    w.chrome = window.chrome;
                }
                return w;
            },
            configurable: true,
        });
    }
} catch(e) {}

// === window.outerWidth/outerHeight ===
if (window.outerWidth === 0) {
    Object.defineProperty(window, 'outerWidth', {
        get: () => window.innerWidth,
        configurable: true,
    });
}
if (window.outerHeight === 0) {
    Object.defineProperty(window, 'outerHeight', {
        get: () => window.innerHeight + 85,
        configurable: true,
    });
}

// === navigator.connection ===
if (!navigator.connection) {
    Object.defineProperty(navigator, 'connection', {
        get: () => ({
            effectiveType: '4g',
            rtt: 50,
            downlink: 10,
            saveData: false,
        }),
        configurable: true,
    });
}
"#;
