//! Host event handlers
//!
//! Turn DOM and SDK events reported by the host into breadcrumbs, activity
//! updates and error linkage on the replay.

use serde_json::{json, Value};
use std::sync::Arc;

use super::{RecordingMode, ReplayContainer};
use crate::click::DomNode;
use crate::recording::{Breadcrumb, PerformanceSpan, RecordingEvent};
use crate::session;

/// Max ancestors included in a node description
const MAX_TREE_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyModifiers {
    pub meta: bool,
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
}

impl KeyModifiers {
    pub fn any(&self) -> bool {
        self.meta || self.shift || self.ctrl || self.alt
    }
}

#[derive(Debug, Clone)]
pub struct KeyboardEvent {
    pub key: String,
    pub modifiers: KeyModifiers,
    pub target: Option<Arc<DomNode>>,
}

/// An error event captured by the host SDK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub event_id: String,
    /// Carries an exception (as opposed to a captured message)
    pub is_exception: bool,
}

impl ErrorEvent {
    pub fn exception(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            is_exception: true,
        }
    }

    pub fn message(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            is_exception: false,
        }
    }
}

impl ReplayContainer {
    /// Click on `target`; modifier clicks are not checked for slowness
    pub fn handle_dom_click(&self, target: &Arc<DomNode>, modifiers: KeyModifiers) {
        if !self.is_enabled() {
            return;
        }

        let breadcrumb = dom_breadcrumb("ui.click", target, self.inner.clock.now_secs());
        if let Some(detector) = &self.inner.click_detector {
            if !modifiers.any() {
                detector.handle_click(&breadcrumb, target.closest_interactive());
            }
        }
        self.inner.add_breadcrumb(breadcrumb);
    }

    pub fn handle_dom_input(&self, target: &Arc<DomNode>) {
        if !self.is_enabled() {
            return;
        }
        let breadcrumb = dom_breadcrumb("ui.input", target, self.inner.clock.now_secs());
        self.inner.add_breadcrumb(breadcrumb);
    }

    /// Key press; plain character keys and keys typed into inputs are not recorded
    pub fn handle_keyboard_event(&self, event: &KeyboardEvent) {
        if !self.is_enabled() {
            return;
        }
        self.inner.update_user_activity();

        let Some(target) = &event.target else {
            return;
        };
        if event.key.is_empty() || is_input_element(target) {
            return;
        }

        let modifiers = event.modifiers;
        let has_modifier_key = modifiers.meta || modifiers.ctrl || modifiers.alt;
        let is_character_key = event.key.chars().count() == 1;
        if !has_modifier_key && is_character_key {
            return;
        }

        let breadcrumb = dom_breadcrumb("ui.keyDown", target, self.inner.clock.now_secs())
            .with_data("metaKey", modifiers.meta)
            .with_data("shiftKey", modifiers.shift)
            .with_data("ctrlKey", modifiers.ctrl)
            .with_data("altKey", modifiers.alt)
            .with_data("key", event.key.as_str());
        self.inner.add_breadcrumb(breadcrumb);
    }

    pub fn handle_window_focus(&self) {
        let breadcrumb = Breadcrumb::new("ui.focus", self.inner.clock.now_secs());
        self.change_to_foreground(Some(breadcrumb));
    }

    pub fn handle_window_blur(&self) {
        let breadcrumb = Breadcrumb::new("ui.blur", self.inner.clock.now_secs());
        self.change_to_background(Some(breadcrumb));
    }

    pub fn handle_visibility_change(&self, visible: bool) {
        if visible {
            self.change_to_foreground(None);
        } else {
            self.change_to_background(None);
        }
    }

    fn change_to_background(&self, breadcrumb: Option<Breadcrumb>) {
        let Some(session) = self.session() else {
            return;
        };
        if session.is_expired(&self.inner.timeouts(), self.inner.clock.now_ms()) {
            return;
        }

        if let Some(breadcrumb) = breadcrumb {
            self.inner.create_custom_breadcrumb(breadcrumb);
        }

        let replay = self.clone();
        tokio::spawn(async move { replay.conditional_flush().await });
    }

    fn change_to_foreground(&self, breadcrumb: Option<Breadcrumb>) {
        if self.session().is_none() {
            return;
        }
        if !self.inner.check_and_handle_expired_session() {
            tracing::info!("Document has become active, but session has expired");
            return;
        }

        if let Some(breadcrumb) = breadcrumb {
            self.inner.create_custom_breadcrumb(breadcrumb);
        }
    }

    /// History navigation from `from` to `to`
    pub fn handle_navigation(&self, from: Option<&str>, to: &str) {
        if !self.is_enabled() || from == Some(to) {
            return;
        }

        self.inner.state.lock().context.add_url(to);
        self.inner.trigger_user_activity();

        let now = self.inner.clock.now_secs();
        let span = PerformanceSpan {
            op: "navigation.push".to_string(),
            description: to.to_string(),
            start_timestamp: now,
            end_timestamp: now,
            data: Default::default(),
        };
        self.inner.add_update(|| {
            self.inner
                .add_event_sync(&RecordingEvent::performance_span(&span), false);
            false
        });

        self.inner.state.lock().current_url = Some(to.to_string());
    }

    /// Link an error to the replay
    ///
    /// Returns the replay id the error should be tagged with, if any. While
    /// buffering, a sampled exception promotes the replay to session mode.
    pub fn handle_error_event(&self, event: &ErrorEvent) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }

        let mode = {
            let mut state = self.inner.state.lock();
            state.context.add_error_id(&event.event_id);
            state.recording_mode
        };

        if mode == RecordingMode::Session {
            return self.replay_id();
        }

        if !event.is_exception || !session::is_sampled(self.config().error_sample_rate) {
            return None;
        }

        tracing::debug!(event_id = %event.event_id, "Error sampled, sending buffered replay");
        let replay = self.clone();
        tokio::spawn(async move { replay.send_buffered_replay_or_flush(true).await });
        self.replay_id()
    }

    /// Link a transaction's trace to the replay
    pub fn handle_transaction_event(&self, trace_id: &str) {
        if !self.is_enabled() {
            return;
        }
        self.inner.state.lock().context.add_trace_id(trace_id);
    }
}

fn is_input_element(node: &DomNode) -> bool {
    node.tag_name == "input"
        || node.tag_name == "textarea"
        || node
            .attribute("contenteditable")
            .is_some_and(|value| value != "false")
}

fn dom_breadcrumb(category: &str, target: &Arc<DomNode>, timestamp: f64) -> Breadcrumb {
    let message = describe_node(target);
    Breadcrumb::new(category, timestamp)
        .with_message(message)
        .with_data("nodeId", target.id)
        .with_data("node", node_summary(target))
}

fn node_summary(node: &DomNode) -> Value {
    json!({
        "id": node.id,
        "tagName": node.tag_name,
        "attributes": node.attributes,
    })
}

/// CSS-like path such as `div#app > button.primary`
pub(crate) fn describe_node(node: &Arc<DomNode>) -> String {
    let mut parts = Vec::new();
    let mut current = Some(node.clone());
    while let Some(node) = current {
        if parts.len() == MAX_TREE_DEPTH {
            break;
        }
        parts.push(describe_element(&node));
        current = node.parent.clone();
    }
    parts.reverse();
    parts.join(" > ")
}

fn describe_element(node: &DomNode) -> String {
    let mut out = node.tag_name.clone();
    if let Some(id) = node.attribute("id") {
        out.push('#');
        out.push_str(id);
    }
    if let Some(classes) = node.attribute("class") {
        for class in classes.split_whitespace() {
            out.push('.');
            out.push_str(class);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_node_walks_ancestors() {
        let body = Arc::new(DomNode::new(1, "body"));
        let app = Arc::new(
            DomNode::new(2, "div")
                .with_attribute("id", "app")
                .with_parent(body),
        );
        let button = Arc::new(
            DomNode::new(3, "button")
                .with_attribute("class", "btn primary")
                .with_parent(app),
        );
        assert_eq!(describe_node(&button), "body > div#app > button.btn.primary");
    }

    #[test]
    fn test_input_elements() {
        assert!(is_input_element(&DomNode::new(1, "input")));
        assert!(is_input_element(&DomNode::new(1, "textarea")));
        assert!(is_input_element(
            &DomNode::new(1, "div").with_attribute("contenteditable", "true")
        ));
        assert!(!is_input_element(&DomNode::new(1, "div")));
    }
}
