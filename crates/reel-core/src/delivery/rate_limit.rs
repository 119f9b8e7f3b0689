//! Per-category rate limits derived from response headers

use std::collections::HashMap;

use super::transport::TransportResponse;

/// Category that applies to every kind of data
pub const ALL_CATEGORIES: &str = "all";

const DEFAULT_RETRY_AFTER: u64 = 60_000;

/// Category -> epoch ms until which sending is disabled
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimits {
    limits: HashMap<String, u64>,
}

impl RateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Epoch ms until which `category` is disabled, 0 if it is not
    pub fn disabled_until(&self, category: &str) -> u64 {
        self.limits
            .get(category)
            .or_else(|| self.limits.get(ALL_CATEGORIES))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_rate_limited(&self, category: &str, now: u64) -> bool {
        self.disabled_until(category) > now
    }

    /// Apply `x-sentry-rate-limits`, else `retry-after`, else a bare 429
    pub fn update_from_response(&mut self, response: &TransportResponse, now: u64) {
        if let Some(header) = response.header("x-sentry-rate-limits") {
            for limit in header.trim().split(',') {
                let mut fields = limit.trim().split(':');
                let retry_after = fields.next().unwrap_or_default();
                let categories = fields.next().unwrap_or_default();

                let delay = retry_after
                    .trim()
                    .parse::<u64>()
                    .map(|secs| secs.saturating_mul(1000))
                    .unwrap_or(DEFAULT_RETRY_AFTER);

                if categories.is_empty() {
                    self.limits.insert(ALL_CATEGORIES.to_string(), now.saturating_add(delay));
                } else {
                    for category in categories.split(';') {
                        self.limits.insert(category.to_string(), now.saturating_add(delay));
                    }
                }
            }
        } else if let Some(header) = response.header("retry-after") {
            let delay = parse_retry_after(header, now);
            self.limits.insert(ALL_CATEGORIES.to_string(), now.saturating_add(delay));
        } else if response.status_code == Some(429) {
            self.limits
                .insert(ALL_CATEGORIES.to_string(), now.saturating_add(DEFAULT_RETRY_AFTER));
        }
    }
}

/// Delay in ms from a `Retry-After` value (seconds or HTTP date)
pub fn parse_retry_after(header: &str, now: u64) -> u64 {
    let header = header.trim();
    if let Ok(secs) = header.parse::<u64>() {
        return secs.saturating_mul(1000);
    }
    match chrono::DateTime::parse_from_rfc2822(header) {
        Ok(date) => (date.timestamp_millis().max(0) as u64).saturating_sub(now),
        Err(_) => DEFAULT_RETRY_AFTER,
    }
}
