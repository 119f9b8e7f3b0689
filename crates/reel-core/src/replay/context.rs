use crate::config::defaults::MAX_LINKED_IDS;
use crate::delivery::SegmentContext;

/// Metadata collected for the segment currently being recorded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayContext {
    /// Epoch ms the segment started at
    pub initial_timestamp: u64,
    pub initial_url: String,
    error_ids: Vec<String>,
    trace_ids: Vec<String>,
    pub urls: Vec<String>,
}

impl ReplayContext {
    pub fn error_ids(&self) -> &[String] {
        &self.error_ids
    }

    pub fn trace_ids(&self) -> &[String] {
        &self.trace_ids
    }

    /// Link an error; returns `false` when the id was already linked or the set is full
    pub fn add_error_id(&mut self, id: &str) -> bool {
        insert_limited(&mut self.error_ids, id)
    }

    pub fn add_trace_id(&mut self, id: &str) -> bool {
        insert_limited(&mut self.trace_ids, id)
    }

    pub fn add_url(&mut self, url: impl Into<String>) {
        self.urls.push(url.into());
    }

    /// Forget linked ids and urls, keeping the initial state
    pub fn clear(&mut self) {
        self.error_ids.clear();
        self.trace_ids.clear();
        self.urls.clear();
    }

    /// Snapshot the context for a segment and clear it
    pub fn pop(&mut self) -> SegmentContext {
        let context = SegmentContext {
            initial_timestamp: self.initial_timestamp,
            error_ids: std::mem::take(&mut self.error_ids),
            trace_ids: std::mem::take(&mut self.trace_ids),
            urls: std::mem::take(&mut self.urls),
        };
        self.clear();
        context
    }
}

fn insert_limited(ids: &mut Vec<String>, id: &str) -> bool {
    if ids.len() >= MAX_LINKED_IDS || ids.iter().any(|existing| existing == id) {
        return false;
    }
    ids.push(id.to_string());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_deduplicated_and_capped() {
        let mut context = ReplayContext::default();
        assert!(context.add_error_id("a"));
        assert!(!context.add_error_id("a"));

        for i in 0..200 {
            context.add_trace_id(&format!("t{i}"));
        }
        assert_eq!(context.trace_ids().len(), MAX_LINKED_IDS);
        assert_eq!(context.error_ids(), ["a"]);
    }

    #[test]
    fn test_pop_resets_ids_and_urls() {
        let mut context = ReplayContext {
            initial_timestamp: 42,
            initial_url: "http://localhost/".to_string(),
            ..Default::default()
        };
        context.add_url("http://localhost/");
        context.add_error_id("e");

        let popped = context.pop();
        assert_eq!(popped.initial_timestamp, 42);
        assert_eq!(popped.error_ids, vec!["e"]);
        assert_eq!(popped.urls, vec!["http://localhost/"]);

        assert!(context.error_ids().is_empty());
        assert!(context.urls.is_empty());
        assert_eq!(context.initial_timestamp, 42);
    }
}
