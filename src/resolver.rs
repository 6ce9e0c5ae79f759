use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::driver::{BoundingBox, ElementInfo, PageDriver, Selector};
use crate::error::Result;

/// Confidence discount applied to externally generated selector candidates;
/// predictions from the language collaborator are less trusted than local
/// strategies.
const GENERATED_DISCOUNT: f64 = 0.7;

/// How much page HTML the suggester gets to look at.
const SNAPSHOT_MAX_LEN: usize = 20_000;

/// The kind of element a description is expected to resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Button,
    Link,
    Input,
    Textarea,
    Checkbox,
    Radio,
    Select,
    Image,
    Any,
}

impl ElementKind {
    /// Tag names that can satisfy this kind.
    fn tags(&self) -> &'static [&'static str] {
        match self {
            ElementKind::Button => &["button", "input", "a"],
            ElementKind::Link => &["a"],
            ElementKind::Input => &["input", "textarea"],
            ElementKind::Textarea => &["textarea"],
            ElementKind::Checkbox => &["input"],
            ElementKind::Radio => &["input"],
            ElementKind::Select => &["select"],
            ElementKind::Image => &["img"],
            ElementKind::Any => &[],
        }
    }

    /// Preferred tags for text/path expression generation.
    fn primary_tags(&self) -> &'static [&'static str] {
        match self {
            ElementKind::Button => &["button", "a"],
            ElementKind::Link => &["a"],
            ElementKind::Input => &["input", "textarea"],
            ElementKind::Textarea => &["textarea"],
            ElementKind::Checkbox | ElementKind::Radio => &["input"],
            ElementKind::Select => &["select"],
            ElementKind::Image => &["img"],
            ElementKind::Any => &["*"],
        }
    }

    fn aria_role(&self) -> Option<&'static str> {
        match self {
            ElementKind::Button => Some("button"),
            ElementKind::Link => Some("link"),
            ElementKind::Input | ElementKind::Textarea => Some("textbox"),
            ElementKind::Checkbox => Some("checkbox"),
            ElementKind::Radio => Some("radio"),
            ElementKind::Select => Some("combobox"),
            ElementKind::Image => Some("img"),
            ElementKind::Any => None,
        }
    }

    /// Kinds acted on with a pointer rather than the keyboard.
    pub fn is_clickable(&self) -> bool {
        matches!(
            self,
            ElementKind::Button
                | ElementKind::Link
                | ElementKind::Checkbox
                | ElementKind::Radio
                | ElementKind::Any
        )
    }

    /// Whether a located element is an acceptable instance of this kind.
    fn accepts(&self, info: &ElementInfo) -> bool {
        if *self == ElementKind::Any {
            return true;
        }
        let tag = info.tag.as_str();
        if info.attr("role") == self.aria_role() && info.attr("role").is_some() {
            return true;
        }
        if !self.tags().contains(&tag) {
            return false;
        }
        match self {
            ElementKind::Button => {
                tag != "input"
                    || matches!(info.attr("type"), Some("submit") | Some("button") | Some("reset") | None)
            }
            ElementKind::Checkbox => tag != "input" || info.attr("type") == Some("checkbox"),
            ElementKind::Radio => tag != "input" || info.attr("type") == Some("radio"),
            ElementKind::Input => {
                tag != "input"
                    || !matches!(info.attr("type"), Some("checkbox") | Some("radio") | Some("hidden"))
            }
            _ => true,
        }
    }
}

/// Fuzzy description of a UI element, as produced by a caller or planner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ElementDescription {
    pub description: String,
    pub kind: ElementKind,
    /// Known attribute values, matched exactly when present.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Text expected near the element, used for path-based anchoring.
    #[serde(default)]
    pub nearby_text: Option<String>,
}

impl ElementDescription {
    pub fn new(description: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            description: description.into(),
            kind,
            attributes: BTreeMap::new(),
            nearby_text: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn near(mut self, text: impl Into<String>) -> Self {
        self.nearby_text = Some(text.into());
        self
    }

    fn cache_key(&self) -> CacheKey {
        (
            self.description.clone(),
            self.kind,
            self.attributes.clone(),
            self.nearby_text.clone(),
        )
    }
}

/// Which strategy produced a selector hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorSource {
    /// Test ids, ARIA labels, placeholders, names.
    Semantic,
    /// Exact or word-level text content matching.
    Text,
    /// CSS patterns keyed by expected kind and idiom class names.
    Structural,
    /// Absolute / contains-text / positional path expressions.
    Path,
    /// Produced by the external language collaborator.
    Generated,
    /// Screenshot-based last-resort detection.
    Visual,
}

/// A scored selector hypothesis, not yet checked against the live page.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoredSelector {
    pub source: SelectorSource,
    pub selector: Selector,
    pub confidence: f64,
}

/// A located element matched against a description.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ElementCandidate {
    pub selector: Selector,
    pub source: SelectorSource,
    /// Always within [0,1].
    pub confidence: f64,
    pub element: ElementInfo,
}

/// Selector suggestion from the language collaborator.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SuggestedSelector {
    pub selector: Selector,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// External language-understanding collaborator: receives a page snapshot
/// plus the description and returns additional scored candidates. Treated as
/// opaque; failures and malformed output count as "no candidates".
#[async_trait]
pub trait SelectorSuggester: Send + Sync {
    async fn suggest(
        &self,
        description: &ElementDescription,
        page_snapshot: &str,
    ) -> Result<Vec<SuggestedSelector>>;
}

/// Screenshot-based element detection, used only when every selector
/// strategy came up empty. Absence of a detection is a valid outcome.
#[async_trait]
pub trait VisualDetector: Send + Sync {
    async fn detect(
        &self,
        screenshot: &[u8],
        description: &ElementDescription,
    ) -> Result<Option<BoundingBox>>;
}

type CacheKey = (String, ElementKind, BTreeMap<String, String>, Option<String>);

/// Resolves fuzzy element descriptions against a live page via ranked
/// multi-strategy search. Generated selector lists are cached per
/// description for the lifetime of the resolver instance.
pub struct ElementResolver {
    suggester: Option<Arc<dyn SelectorSuggester>>,
    visual: Option<Arc<dyn VisualDetector>>,
    cache: Mutex<HashMap<CacheKey, Vec<ScoredSelector>>>,
}

impl ElementResolver {
    pub fn new() -> Self {
        Self {
            suggester: None,
            visual: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_suggester(mut self, suggester: Arc<dyn SelectorSuggester>) -> Self {
        self.suggester = Some(suggester);
        self
    }

    pub fn with_visual_detector(mut self, visual: Arc<dyn VisualDetector>) -> Self {
        self.visual = Some(visual);
        self
    }

    /// Drop all cached selector lists.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Find the best live element for a description. `Ok(None)` means the
    /// page genuinely has no matching element; it is not an error.
    pub async fn find_element(
        &self,
        page: &Arc<dyn PageDriver>,
        description: &ElementDescription,
    ) -> Result<Option<ElementCandidate>> {
        let candidates = self.candidates(page, description).await?;

        for scored in &candidates {
            let located = page.locate(&scored.selector).await.unwrap_or_default();
            for element in located {
                if validate(description, &element) {
                    debug!(
                        selector = %scored.selector,
                        source = ?scored.source,
                        confidence = scored.confidence,
                        "resolved element"
                    );
                    return Ok(Some(ElementCandidate {
                        selector: scored.selector.clone(),
                        source: scored.source,
                        confidence: scored.confidence,
                        element,
                    }));
                }
            }
        }

        self.visual_fallback(page, description).await
    }

    /// Find all live elements for a description. The highest-ranked
    /// selector that yields any validated match contributes all of its
    /// matches; lower-ranked selectors are ignored, so one element is never
    /// reported twice under different selectors.
    pub async fn find_elements(
        &self,
        page: &Arc<dyn PageDriver>,
        description: &ElementDescription,
    ) -> Result<Vec<ElementCandidate>> {
        let candidates = self.candidates(page, description).await?;

        for scored in &candidates {
            let located = page.locate(&scored.selector).await.unwrap_or_default();
            let matches: Vec<ElementCandidate> = located
                .into_iter()
                .filter(|element| validate(description, element))
                .map(|element| ElementCandidate {
                    selector: scored.selector.clone(),
                    source: scored.source,
                    confidence: scored.confidence,
                    element,
                })
                .collect();
            if !matches.is_empty() {
                return Ok(matches);
            }
        }

        Ok(Vec::new())
    }

    /// Generate (or fetch from cache) the ranked selector list for a
    /// description. All strategies run concurrently; the merged list is
    /// sorted by confidence descending with all values clamped to [0,1].
    async fn candidates(
        &self,
        page: &Arc<dyn PageDriver>,
        description: &ElementDescription,
    ) -> Result<Vec<ScoredSelector>> {
        let key = description.cache_key();
        if let Some(cached) = self.cache.lock().get(&key) {
            return Ok(cached.clone());
        }

        let generated = async {
            let Some(ref suggester) = self.suggester else {
                return Vec::new();
            };
            let snapshot = match page.content().await {
                Ok(mut html) => {
                    // Truncation must land on a char boundary.
                    let mut cut = SNAPSHOT_MAX_LEN.min(html.len());
                    while !html.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    html.truncate(cut);
                    html
                }
                Err(e) => {
                    warn!("page snapshot for suggester failed: {e}");
                    String::new()
                }
            };
            match suggester.suggest(description, &snapshot).await {
                Ok(suggestions) => suggestions
                    .into_iter()
                    .map(|s| ScoredSelector {
                        source: SelectorSource::Generated,
                        selector: s.selector,
                        confidence: s.confidence * GENERATED_DISCOUNT,
                    })
                    .collect(),
                Err(e) => {
                    warn!("selector suggester failed, continuing without it: {e}");
                    Vec::new()
                }
            }
        };

        let (semantic, text, structural, path, generated) = tokio::join!(
            async { semantic_candidates(description) },
            async { text_candidates(description) },
            async { structural_candidates(description) },
            async { path_candidates(description) },
            generated,
        );

        let mut all: Vec<ScoredSelector> = semantic
            .into_iter()
            .chain(text)
            .chain(structural)
            .chain(path)
            .chain(generated)
            .map(|mut s| {
                s.confidence = s.confidence.clamp(0.0, 1.0);
                s
            })
            .collect();

        // Stable sort keeps generation order among equal confidences, which
        // makes ranking deterministic for identical inputs.
        all.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        self.cache.lock().insert(key, all.clone());
        Ok(all)
    }

    async fn visual_fallback(
        &self,
        page: &Arc<dyn PageDriver>,
        description: &ElementDescription,
    ) -> Result<Option<ElementCandidate>> {
        let Some(ref visual) = self.visual else {
            return Ok(None);
        };
        let screenshot = page.screenshot().await?;
        let detected = match visual.detect(&screenshot, description).await {
            Ok(d) => d,
            Err(e) => {
                warn!("visual detection failed, treating as not found: {e}");
                None
            }
        };
        Ok(detected.map(|bounding_box| ElementCandidate {
            selector: Selector::css("*"),
            source: SelectorSource::Visual,
            confidence: 0.3,
            element: ElementInfo {
                selector: Selector::css("*"),
                index: 0,
                tag: String::new(),
                text: String::new(),
                attributes: Default::default(),
                bounding_box: Some(bounding_box),
                visible: true,
                enabled: true,
            },
        }))
    }
}

impl Default for ElementResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Post-resolution validation: kind compatibility, interactability, and
/// text agreement with the description.
fn validate(description: &ElementDescription, element: &ElementInfo) -> bool {
    if !description.kind.accepts(element) {
        return false;
    }
    if !element.visible || !element.enabled {
        return false;
    }

    let wanted = description.description.trim().to_lowercase();
    if wanted.is_empty() {
        return true;
    }

    let text = element.text.to_lowercase();
    if text.contains(&wanted) || wanted.contains(&text) {
        return true;
    }

    // Inputs rarely carry matching inner text; their labeling attributes
    // stand in for it.
    for attr in ["aria-label", "placeholder", "name", "title", "alt"] {
        if let Some(value) = element.attr(attr) {
            let value = value.to_lowercase();
            if value.contains(&wanted) || (wanted.contains(&value) && !value.is_empty()) {
                return true;
            }
        }
    }

    if description.kind.is_clickable() {
        return wanted
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .any(|w| text.contains(w));
    }

    false
}

fn attr_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// XPath has no escape sequence for quotes; mixed-quote strings need the
/// concat() form.
fn xpath_literal(value: &str) -> String {
    if !value.contains('"') {
        return format!("\"{value}\"");
    }
    if !value.contains('\'') {
        return format!("'{value}'");
    }
    let parts: Vec<String> = value
        .split('"')
        .map(|part| format!("\"{part}\""))
        .collect();
    format!("concat({})", parts.join(", '\"', "))
}

fn slug(description: &str, separator: char) -> String {
    description
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(&separator.to_string())
}

/// Test ids, ARIA attributes, placeholders and names for the expected kind.
fn semantic_candidates(description: &ElementDescription) -> Vec<ScoredSelector> {
    let mut out = Vec::new();
    let push = |out: &mut Vec<ScoredSelector>, expr: String, confidence: f64| {
        out.push(ScoredSelector {
            source: SelectorSource::Semantic,
            selector: Selector::css(expr),
            confidence,
        });
    };

    // Caller-supplied attributes are the strongest signal we have.
    for (name, value) in &description.attributes {
        push(
            &mut out,
            format!("[{}=\"{}\"]", name, attr_escape(value)),
            0.95,
        );
    }

    let text = description.description.trim();
    if text.is_empty() {
        return out;
    }
    let escaped = attr_escape(text);
    let kebab = slug(text, '-');
    let snake = slug(text, '_');

    push(&mut out, format!("[data-testid*=\"{kebab}\"]"), 0.9);
    if snake != kebab {
        push(&mut out, format!("[data-testid*=\"{snake}\"]"), 0.9);
    }
    push(&mut out, format!("[data-test*=\"{kebab}\"]"), 0.88);
    push(&mut out, format!("[aria-label*=\"{escaped}\" i]"), 0.85);

    if let Some(role) = description.kind.aria_role() {
        push(
            &mut out,
            format!("[role=\"{role}\"][aria-label*=\"{escaped}\" i]"),
            0.85,
        );
    }

    match description.kind {
        ElementKind::Input | ElementKind::Textarea => {
            push(&mut out, format!("input[placeholder*=\"{escaped}\" i]"), 0.85);
            push(&mut out, format!("textarea[placeholder*=\"{escaped}\" i]"), 0.82);
            push(&mut out, format!("input[name*=\"{snake}\"]"), 0.8);
            push(&mut out, format!("input[name*=\"{kebab}\"]"), 0.78);
        }
        ElementKind::Button => {
            push(&mut out, format!("button[name*=\"{snake}\"]"), 0.75);
            push(&mut out, format!("input[type=\"submit\"][value*=\"{escaped}\" i]"), 0.8);
        }
        ElementKind::Link => {
            push(&mut out, format!("a[title*=\"{escaped}\" i]"), 0.75);
        }
        ElementKind::Image => {
            push(&mut out, format!("img[alt*=\"{escaped}\" i]"), 0.85);
        }
        _ => {}
    }

    push(&mut out, format!("[id*=\"{kebab}\"]"), 0.7);
    if snake != kebab {
        push(&mut out, format!("[id*=\"{snake}\"]"), 0.7);
    }

    out
}

/// Exact then word-level text-content matching, expressed as XPath.
fn text_candidates(description: &ElementDescription) -> Vec<ScoredSelector> {
    let text = description.description.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let literal = xpath_literal(text);
    let mut out = Vec::new();
    let push = |out: &mut Vec<ScoredSelector>, expr: String, confidence: f64| {
        out.push(ScoredSelector {
            source: SelectorSource::Text,
            selector: Selector::xpath(expr),
            confidence,
        });
    };

    for tag in description.kind.primary_tags() {
        push(
            &mut out,
            format!("//{tag}[normalize-space(.)={literal}]"),
            0.85,
        );
        push(&mut out, format!("//{tag}[contains(., {literal})]"), 0.7);
    }

    // Word-level partial matches come last; long words only, to keep the
    // false-positive rate tolerable.
    for word in text.split_whitespace().filter(|w| w.len() > 3).take(3) {
        let word_literal = xpath_literal(word);
        for tag in description.kind.primary_tags() {
            push(
                &mut out,
                format!("//{tag}[contains(., {word_literal})]"),
                0.55,
            );
        }
    }

    out
}

/// CSS patterns keyed by expected kind and common idiom class names.
fn structural_candidates(description: &ElementDescription) -> Vec<ScoredSelector> {
    let mut out = Vec::new();
    let push = |out: &mut Vec<ScoredSelector>, expr: &str, confidence: f64| {
        out.push(ScoredSelector {
            source: SelectorSource::Structural,
            selector: Selector::css(expr),
            confidence,
        });
    };

    let kebab = slug(description.description.trim(), '-');
    if !kebab.is_empty() {
        push(&mut out, &format!(".{kebab}"), 0.45);
        push(&mut out, &format!("#{kebab}"), 0.55);
    }

    match description.kind {
        ElementKind::Button => {
            push(&mut out, "button[type=\"submit\"]", 0.5);
            push(&mut out, "input[type=\"submit\"]", 0.5);
            push(&mut out, ".btn", 0.4);
            push(&mut out, ".button", 0.4);
            push(&mut out, "button", 0.35);
        }
        ElementKind::Input => {
            push(&mut out, "input[type=\"text\"]", 0.4);
            push(&mut out, "input[type=\"search\"]", 0.4);
            push(&mut out, ".form-control", 0.35);
            push(&mut out, "input:not([type=\"hidden\"])", 0.3);
        }
        ElementKind::Textarea => push(&mut out, "textarea", 0.45),
        ElementKind::Link => {
            push(&mut out, "nav a", 0.32);
            push(&mut out, "a[href]", 0.3);
        }
        ElementKind::Checkbox => push(&mut out, "input[type=\"checkbox\"]", 0.5),
        ElementKind::Radio => push(&mut out, "input[type=\"radio\"]", 0.5),
        ElementKind::Select => push(&mut out, "select", 0.45),
        ElementKind::Image => push(&mut out, "img", 0.3),
        ElementKind::Any => {}
    }

    out
}

/// Path expressions: attribute paths, contains-text paths, nearby-text
/// anchoring, and positional first/last/middle forms.
fn path_candidates(description: &ElementDescription) -> Vec<ScoredSelector> {
    let mut out = Vec::new();
    let push = |out: &mut Vec<ScoredSelector>, expr: String, confidence: f64| {
        out.push(ScoredSelector {
            source: SelectorSource::Path,
            selector: Selector::xpath(expr),
            confidence,
        });
    };

    let text = description.description.trim();
    let lowered = text.to_lowercase();
    let tags = description.kind.primary_tags();
    let tag = tags.first().copied().unwrap_or("*");

    if !text.is_empty() {
        let snake = slug(text, '_');
        push(&mut out, format!("//{tag}[@name=\"{snake}\"]"), 0.45);
        let literal = xpath_literal(text);
        push(&mut out, format!("//*[contains(text(), {literal})]"), 0.4);
    }

    if let Some(ref nearby) = description.nearby_text {
        let literal = xpath_literal(nearby.trim());
        push(
            &mut out,
            format!("//*[contains(text(), {literal})]/following::{tag}[1]"),
            0.5,
        );
    }

    // Positional expressions; boosted when the description itself asks for
    // a position in a list.
    let positional_boost = |needle: &str| if lowered.contains(needle) { 0.25 } else { 0.0 };
    push(
        &mut out,
        format!("(//{tag})[1]"),
        0.35 + positional_boost("first"),
    );
    push(
        &mut out,
        format!("(//{tag})[last()]"),
        0.3 + positional_boost("last"),
    );
    push(
        &mut out,
        format!("(//{tag})[position() = ceiling(last() div 2)]"),
        0.25 + positional_boost("middle"),
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xpath_literal_handles_mixed_quotes() {
        assert_eq!(xpath_literal("plain"), "\"plain\"");
        assert_eq!(xpath_literal("it's"), "\"it's\"");
        assert_eq!(xpath_literal("say \"hi\""), "'say \"hi\"'");
        // Both quote kinds force the concat form.
        let mixed = xpath_literal("it's \"fine\"");
        assert!(mixed.starts_with("concat("));
        assert!(mixed.contains("\"it's \""));
    }

    #[test]
    fn slug_normalizes_whitespace_and_case() {
        assert_eq!(slug("  Add To  Cart ", '-'), "add-to-cart");
        assert_eq!(slug("Sign Up", '_'), "sign_up");
    }

    #[test]
    fn all_generated_confidences_are_in_unit_range() {
        let description = ElementDescription::new("first search box", ElementKind::Input)
            .with_attribute("name", "q")
            .near("Results");
        let all: Vec<ScoredSelector> = semantic_candidates(&description)
            .into_iter()
            .chain(text_candidates(&description))
            .chain(structural_candidates(&description))
            .chain(path_candidates(&description))
            .collect();
        assert!(!all.is_empty());
        for scored in all {
            assert!(scored.confidence >= 0.0 && scored.confidence <= 1.0);
        }
    }

    #[test]
    fn kind_compatibility_checks_tag_and_type() {
        let mut info = ElementInfo {
            selector: Selector::css("input"),
            index: 0,
            tag: "input".into(),
            text: String::new(),
            attributes: Default::default(),
            bounding_box: None,
            visible: true,
            enabled: true,
        };
        info.attributes.insert("type".into(), "checkbox".into());
        assert!(ElementKind::Checkbox.accepts(&info));
        assert!(!ElementKind::Input.accepts(&info));
        assert!(!ElementKind::Link.accepts(&info));
        assert!(ElementKind::Any.accepts(&info));
    }
}
