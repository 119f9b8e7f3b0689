//! Slow-click and multi-click detection
//!
//! A click on an interactive element is kept pending until a periodic sweep
//! decides what happened after it. If the page mutated within `threshold` or
//! scrolled within `scroll_timeout`, the click "worked". If nothing happened
//! before `timeout` the click is reported as `ui.slowClickDetected`. A
//! working click that was repeated on the same element is reported as
//! `ui.multiClick`.
//!
//! All timestamps are epoch milliseconds.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::defaults::CLICK_CHECK_INTERVAL;
use crate::config::SlowClickConfig;
use crate::recording::{Breadcrumb, EventKind, IncrementalSource, MouseInteraction, NodeId, RecordingEvent};

/// Two clicks on the same node closer than this are one click
const DUPLICATE_CLICK_WINDOW: u64 = 1_000;

/// An element as resolved from the recorder's node mirror
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DomNode {
    pub id: NodeId,
    /// Lowercase tag name
    pub tag_name: String,
    pub attributes: BTreeMap<String, String>,
    pub parent: Option<Arc<DomNode>>,
}

impl DomNode {
    pub fn new(id: NodeId, tag_name: &str) -> Self {
        Self {
            id,
            tag_name: tag_name.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            parent: None,
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_parent(mut self, parent: Arc<DomNode>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn has_class(&self, class: &str) -> bool {
        self.attribute("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }

    /// Closest `button` or `a`, starting with the node itself
    pub fn closest_interactive(self: &Arc<Self>) -> Arc<DomNode> {
        let mut current = Some(self.clone());
        while let Some(node) = current {
            if node.tag_name == "button" || node.tag_name == "a" {
                return node;
            }
            current = node.parent.clone();
        }
        self.clone()
    }

    /// Match against a comma-separated list of compound selectors
    pub fn matches(&self, selectors: &str) -> bool {
        selectors
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .any(|selector| match parse_compound(selector) {
                Some(parts) => parts.iter().all(|part| part.matches(self)),
                None => {
                    tracing::debug!("Ignoring unsupported selector {selector:?}");
                    false
                }
            })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SelectorPart {
    Tag(String),
    Id(String),
    Class(String),
    Attribute(String, Option<String>),
}

impl SelectorPart {
    fn matches(&self, node: &DomNode) -> bool {
        match self {
            SelectorPart::Tag(tag) => tag == "*" || node.tag_name == *tag,
            SelectorPart::Id(id) => node.attribute("id") == Some(id.as_str()),
            SelectorPart::Class(class) => node.has_class(class),
            SelectorPart::Attribute(name, None) => node.attributes.contains_key(name),
            SelectorPart::Attribute(name, Some(value)) => node.attribute(name) == Some(value.as_str()),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn take_ident(input: &str) -> (&str, &str) {
    let end = input
        .find(|c: char| !is_ident_char(c))
        .unwrap_or(input.len());
    input.split_at(end)
}

fn parse_compound(selector: &str) -> Option<Vec<SelectorPart>> {
    let mut parts = Vec::new();
    let mut rest = selector;

    if rest.starts_with('*') {
        parts.push(SelectorPart::Tag("*".to_string()));
        rest = &rest[1..];
    } else {
        let (tag, tail) = take_ident(rest);
        if !tag.is_empty() {
            parts.push(SelectorPart::Tag(tag.to_ascii_lowercase()));
        }
        rest = tail;
    }

    while let Some(first) = rest.chars().next() {
        match first {
            '#' | '.' => {
                let (name, tail) = take_ident(&rest[1..]);
                if name.is_empty() {
                    return None;
                }
                parts.push(if first == '#' {
                    SelectorPart::Id(name.to_string())
                } else {
                    SelectorPart::Class(name.to_string())
                });
                rest = tail;
            }
            '[' => {
                let close = rest.find(']')?;
                let body = &rest[1..close];
                let part = match body.split_once('=') {
                    Some((name, value)) => {
                        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                        SelectorPart::Attribute(name.trim().to_string(), Some(value.to_string()))
                    }
                    None => SelectorPart::Attribute(body.trim().to_string(), None),
                };
                parts.push(part);
                rest = &rest[close + 1..];
            }
            _ => return None,
        }
    }

    (!parts.is_empty()).then_some(parts)
}

/// Whether clicks on `node` are never considered for slow-click detection
pub fn ignore_element(node: &DomNode, ignore_selector: &str) -> bool {
    match node.tag_name.as_str() {
        "a" => {
            let opens_elsewhere = node.attribute("target").is_some_and(|t| t != "_self");
            if node.attributes.contains_key("download") || opens_elsewhere {
                return true;
            }
        }
        "button" => {}
        "input" => {
            if !matches!(node.attribute("type"), Some("submit" | "button")) {
                return true;
            }
        }
        _ => return true,
    }

    !ignore_selector.is_empty() && node.matches(ignore_selector)
}

/// Where the detector reports its breadcrumbs
pub trait BreadcrumbSink: Send + Sync {
    fn add_breadcrumb(&self, breadcrumb: Breadcrumb);

    /// Current page URL, attached to generated breadcrumbs
    fn current_url(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
struct ClickInfo {
    timestamp: u64,
    click_breadcrumb: Breadcrumb,
    click_count: u32,
    node: Arc<DomNode>,
    mutation_after: Option<u64>,
    scroll_after: Option<u64>,
}

#[derive(Default)]
struct DetectorState {
    clicks: Vec<ClickInfo>,
    last_mutation: Option<u64>,
    last_scroll: Option<u64>,
    listening: bool,
    sweep: Option<JoinHandle<()>>,
}

struct DetectorInner {
    config: SlowClickConfig,
    clock: Clock,
    sink: Arc<dyn BreadcrumbSink>,
    state: Mutex<DetectorState>,
}

pub struct ClickDetector {
    inner: Arc<DetectorInner>,
}

impl ClickDetector {
    pub fn new(config: SlowClickConfig, clock: Clock, sink: Arc<dyn BreadcrumbSink>) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                config,
                clock,
                sink,
                state: Mutex::new(DetectorState::default()),
            }),
        }
    }

    pub fn add_listeners(&self) {
        self.inner.state.lock().listening = true;
    }

    /// Stop listening and forget all pending clicks
    pub fn remove_listeners(&self) {
        let mut state = self.inner.state.lock();
        if let Some(sweep) = state.sweep.take() {
            sweep.abort();
        }
        *state = DetectorState::default();
    }

    /// Start tracking a `ui.click` breadcrumb on `node`
    pub fn handle_click(&self, breadcrumb: &Breadcrumb, node: Arc<DomNode>) {
        if breadcrumb.category != "ui.click" || ignore_element(&node, &self.inner.config.ignore_selector) {
            return;
        }

        let click = ClickInfo {
            timestamp: breadcrumb.timestamp_ms(),
            click_breadcrumb: breadcrumb.clone(),
            click_count: 0,
            node,
            mutation_after: None,
            scroll_after: None,
        };

        let mut state = self.inner.state.lock();
        let duplicate = state.clicks.iter().any(|existing| {
            existing.node.id == click.node.id
                && existing.timestamp.abs_diff(click.timestamp) < DUPLICATE_CLICK_WINDOW
        });
        if duplicate {
            return;
        }

        state.clicks.push(click);
        if state.clicks.len() == 1 {
            self.schedule_sweep(&mut state);
        }
    }

    /// Count a recorder click on every pending click of the closest interactive element
    pub fn register_click(&self, node: &Arc<DomNode>) {
        let target = node.closest_interactive();
        let mut state = self.inner.state.lock();
        for click in state.clicks.iter_mut().filter(|c| c.node.id == target.id) {
            click.click_count += 1;
        }
    }

    pub fn register_mutation(&self, timestamp: u64) {
        self.inner.state.lock().last_mutation = Some(timestamp);
    }

    pub fn register_scroll(&self, timestamp: u64) {
        self.inner.state.lock().last_scroll = Some(timestamp);
    }

    /// A window opened by the page counts as a reaction to the click
    pub fn register_window_open(&self) {
        let now = self.inner.clock.now_ms();
        let mut state = self.inner.state.lock();
        if state.listening {
            state.last_mutation = Some(now);
        }
    }

    /// Number of clicks still waiting for a verdict
    pub fn pending_clicks(&self) -> usize {
        self.inner.state.lock().clicks.len()
    }

    /// Run one sweep now
    pub fn check_clicks(&self) {
        self.inner.check_clicks();
    }

    fn schedule_sweep(&self, state: &mut DetectorState) {
        if let Some(sweep) = state.sweep.take() {
            sweep.abort();
        }
        let inner = self.inner.clone();
        state.sweep = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(CLICK_CHECK_INTERVAL)).await;
                if !inner.check_clicks() {
                    break;
                }
            }
        }));
    }
}

impl DetectorInner {
    /// Returns whether clicks remain pending
    fn check_clicks(&self) -> bool {
        let now = self.clock.now_ms();
        let timeout = self.config.timeout;

        let (finished, remaining) = {
            let mut state = self.state.lock();
            let last_mutation = state.last_mutation;
            let last_scroll = state.last_scroll;

            for click in state.clicks.iter_mut() {
                if click.mutation_after.is_none() {
                    click.mutation_after = last_mutation
                        .filter(|&m| click.timestamp <= m)
                        .map(|m| m - click.timestamp);
                }
                if click.scroll_after.is_none() {
                    click.scroll_after = last_scroll
                        .filter(|&s| click.timestamp <= s)
                        .map(|s| s - click.timestamp);
                }
            }

            let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.clicks)
                .into_iter()
                .partition(|click| click.timestamp.saturating_add(timeout) <= now);
            state.clicks = pending;
            (finished, state.clicks.len())
        };

        for click in &finished {
            self.generate_breadcrumb(click);
        }
        remaining > 0
    }

    fn generate_breadcrumb(&self, click: &ClickInfo) {
        let config = &self.config;
        let had_scroll = click.scroll_after.is_some_and(|s| s <= config.scroll_timeout);
        let had_mutation = click.mutation_after.is_some_and(|m| m <= config.threshold);
        let origin = &click.click_breadcrumb;

        let mut data = origin.data.clone();
        if let Some(url) = self.sink.current_url() {
            data.insert("url".to_string(), Value::String(url));
        }

        let category = if !had_scroll && !had_mutation {
            let time_after_click = click.mutation_after.unwrap_or(config.timeout).min(config.timeout);
            let end_reason = if time_after_click < config.timeout {
                "mutation"
            } else {
                "timeout"
            };
            data.insert("timeAfterClickMs".to_string(), json!(time_after_click));
            data.insert("endReason".to_string(), json!(end_reason));
            data.insert("clickCount".to_string(), json!(click.click_count.max(1)));
            "ui.slowClickDetected"
        } else if click.click_count > 1 {
            data.insert("clickCount".to_string(), json!(click.click_count));
            data.insert("metric".to_string(), json!(true));
            "ui.multiClick"
        } else {
            return;
        };

        tracing::debug!(node_id = click.node.id, "{category}");
        self.sink.add_breadcrumb(Breadcrumb {
            kind: Some("default".to_string()),
            category: category.to_string(),
            message: origin.message.clone(),
            timestamp: origin.timestamp,
            data,
        });
    }
}

impl Drop for ClickDetector {
    fn drop(&mut self) {
        if let Some(sweep) = self.inner.state.lock().sweep.take() {
            sweep.abort();
        }
    }
}

/// Feed the click signals contained in a recording event to the detector
pub fn update_for_recording_event<F>(detector: &ClickDetector, event: &RecordingEvent, resolve_node: F)
where
    F: FnOnce(NodeId) -> Option<Arc<DomNode>>,
{
    let EventKind::IncrementalSnapshot(Some(source)) = event.kind() else {
        return;
    };

    if source.is_mutation() {
        detector.register_mutation(event.timestamp);
    }
    if source == IncrementalSource::Scroll {
        detector.register_scroll(event.timestamp);
    }
    if let Some((MouseInteraction::Click, id)) = event.mouse_interaction() {
        if let Some(node) = resolve_node(id) {
            detector.register_click(&node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::{DEFAULT_SLOW_CLICK_TIMEOUT, SLOW_CLICK_SCROLL_TIMEOUT, SLOW_CLICK_THRESHOLD};

    #[derive(Default)]
    struct CollectingSink {
        breadcrumbs: Mutex<Vec<Breadcrumb>>,
    }

    impl BreadcrumbSink for CollectingSink {
        fn add_breadcrumb(&self, breadcrumb: Breadcrumb) {
            self.breadcrumbs.lock().push(breadcrumb);
        }

        fn current_url(&self) -> Option<String> {
            Some("http://localhost/".to_string())
        }
    }

    fn config(ignore_selector: &str) -> SlowClickConfig {
        SlowClickConfig {
            threshold: SLOW_CLICK_THRESHOLD,
            timeout: DEFAULT_SLOW_CLICK_TIMEOUT,
            scroll_timeout: SLOW_CLICK_SCROLL_TIMEOUT,
            ignore_selector: ignore_selector.to_string(),
        }
    }

    fn detector(sink: Arc<CollectingSink>) -> (ClickDetector, Clock) {
        let clock = Clock::starting_at(1_000_000);
        let detector = ClickDetector::new(config(""), clock, sink);
        detector.add_listeners();
        (detector, clock)
    }

    fn click_breadcrumb(clock: &Clock, node_id: NodeId) -> Breadcrumb {
        Breadcrumb::new("ui.click", clock.now_secs())
            .with_message("body > button")
            .with_data("nodeId", node_id)
    }

    fn button(id: NodeId) -> Arc<DomNode> {
        Arc::new(DomNode::new(id, "BUTTON"))
    }

    /// Auto-advancing sleep, lets the sweep task run at its own deadlines
    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn test_ignore_element_rules() {
        assert!(ignore_element(&DomNode::new(1, "div"), ""));
        assert!(!ignore_element(&DomNode::new(1, "button"), ""));
        assert!(ignore_element(&DomNode::new(1, "input").with_attribute("type", "text"), ""));
        assert!(!ignore_element(&DomNode::new(1, "input").with_attribute("type", "submit"), ""));
        assert!(ignore_element(&DomNode::new(1, "a").with_attribute("download", ""), ""));
        assert!(ignore_element(&DomNode::new(1, "a").with_attribute("target", "_blank"), ""));
        assert!(!ignore_element(&DomNode::new(1, "a").with_attribute("target", "_self"), ""));
        assert!(ignore_element(
            &DomNode::new(1, "button").with_attribute("class", "btn ignore-me"),
            "#other, .ignore-me"
        ));
    }

    #[test]
    fn test_selector_matching() {
        let node = DomNode::new(1, "button")
            .with_attribute("id", "save")
            .with_attribute("class", "primary large")
            .with_attribute("data-test", "x");

        assert!(node.matches("button"));
        assert!(node.matches("#save"));
        assert!(node.matches("button.primary.large"));
        assert!(node.matches("[data-test]"));
        assert!(node.matches("button[data-test=\"x\"]"));
        assert!(node.matches("a, .large"));
        assert!(!node.matches("a"));
        assert!(!node.matches("button.secondary"));
        assert!(!node.matches("div > button"));
    }

    #[test]
    fn test_closest_interactive() {
        let link = Arc::new(DomNode::new(1, "a"));
        let span = Arc::new(DomNode::new(2, "span").with_parent(link.clone()));
        assert_eq!(span.closest_interactive().id, 1);

        let orphan = Arc::new(DomNode::new(3, "span"));
        assert_eq!(orphan.closest_interactive().id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_after_click_is_not_slow() {
        let sink = Arc::new(CollectingSink::default());
        let (detector, clock) = detector(sink.clone());

        detector.handle_click(&click_breadcrumb(&clock, 1), button(1));
        advance(1_000).await;
        detector.register_mutation(clock.now_ms());

        advance(8_000).await;
        assert_eq!(detector.pending_clicks(), 0);
        assert!(sink.breadcrumbs.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reaction_reports_one_slow_click() {
        let sink = Arc::new(CollectingSink::default());
        let (detector, clock) = detector(sink.clone());

        detector.handle_click(&click_breadcrumb(&clock, 1), button(1));
        for _ in 0..10 {
            advance(1_000).await;
        }

        let breadcrumbs = sink.breadcrumbs.lock();
        assert_eq!(breadcrumbs.len(), 1);
        let slow = &breadcrumbs[0];
        assert_eq!(slow.category, "ui.slowClickDetected");
        assert_eq!(slow.data["endReason"], "timeout");
        assert_eq!(slow.data["timeAfterClickMs"], 7_000);
        assert_eq!(slow.data["clickCount"], 1);
        assert_eq!(slow.data["nodeId"], 1);
        assert_eq!(slow.data["url"], "http://localhost/");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_mutation_reports_mutation_end_reason() {
        let sink = Arc::new(CollectingSink::default());
        let (detector, clock) = detector(sink.clone());

        detector.handle_click(&click_breadcrumb(&clock, 1), button(1));
        advance(5_500).await;
        detector.register_mutation(clock.now_ms());
        for _ in 0..3 {
            advance(1_000).await;
        }

        let breadcrumbs = sink.breadcrumbs.lock();
        assert_eq!(breadcrumbs.len(), 1);
        assert_eq!(breadcrumbs[0].data["endReason"], "mutation");
        assert_eq!(breadcrumbs[0].data["timeAfterClickMs"], 5_500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scroll_counts_as_reaction() {
        let sink = Arc::new(CollectingSink::default());
        let (detector, clock) = detector(sink.clone());

        detector.handle_click(&click_breadcrumb(&clock, 1), button(1));
        advance(100).await;
        detector.register_scroll(clock.now_ms());
        for _ in 0..8 {
            advance(1_000).await;
        }

        assert!(sink.breadcrumbs.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_clicks_report_multi_click() {
        let sink = Arc::new(CollectingSink::default());
        let (detector, clock) = detector(sink.clone());
        let node = button(1);

        for _ in 0..3 {
            detector.handle_click(&click_breadcrumb(&clock, 1), node.clone());
            detector.register_click(&node);
        }
        assert_eq!(detector.pending_clicks(), 1);

        detector.register_mutation(clock.now_ms() + 200);
        for _ in 0..8 {
            advance(1_000).await;
        }

        let breadcrumbs = sink.breadcrumbs.lock();
        assert_eq!(breadcrumbs.len(), 1);
        assert_eq!(breadcrumbs[0].category, "ui.multiClick");
        assert_eq!(breadcrumbs[0].data["clickCount"], 3);
        assert_eq!(breadcrumbs[0].data["metric"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_and_non_click_breadcrumbs_are_skipped() {
        let sink = Arc::new(CollectingSink::default());
        let (detector, clock) = detector(sink);

        detector.handle_click(&click_breadcrumb(&clock, 1), Arc::new(DomNode::new(1, "div")));
        detector.handle_click(&Breadcrumb::new("ui.input", clock.now_secs()), button(2));
        assert_eq!(detector.pending_clicks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_listeners_drops_pending_clicks() {
        let sink = Arc::new(CollectingSink::default());
        let (detector, clock) = detector(sink.clone());

        detector.handle_click(&click_breadcrumb(&clock, 1), button(1));
        detector.remove_listeners();
        for _ in 0..10 {
            advance(1_000).await;
        }

        assert_eq!(detector.pending_clicks(), 0);
        assert!(sink.breadcrumbs.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_events_feed_detector() {
        let sink = Arc::new(CollectingSink::default());
        let (detector, clock) = detector(sink.clone());
        let node = button(4);

        detector.handle_click(&click_breadcrumb(&clock, 4), node.clone());
        let click = RecordingEvent::incremental(
            IncrementalSource::MouseInteraction,
            clock.now_ms(),
            json!({"type": 2, "id": 4}),
        );
        update_for_recording_event(&detector, &click, |_| Some(node.clone()));
        update_for_recording_event(&detector, &click, |_| Some(node.clone()));

        let mutation = RecordingEvent::incremental(IncrementalSource::Mutation, clock.now_ms() + 50, json!({}));
        update_for_recording_event(&detector, &mutation, |_| None);

        for _ in 0..8 {
            advance(1_000).await;
        }
        let breadcrumbs = sink.breadcrumbs.lock();
        assert_eq!(breadcrumbs.len(), 1);
        assert_eq!(breadcrumbs[0].category, "ui.multiClick");
        assert_eq!(breadcrumbs[0].data["clickCount"], 2);
    }
}
