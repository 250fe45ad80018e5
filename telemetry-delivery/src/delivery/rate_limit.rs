//! Per-endpoint rate limiting driven by 429 responses.

use dashmap::DashMap;
use std::sync::Arc;
use telemetry_types::Endpoint;

use crate::clock::Clock;
use crate::config::DeliveryConfig;

/// Rate limit state for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitState {
    /// Sending is suppressed until this time (epoch ms)
    pub limited_until_ms: Option<i64>,
    /// 429s received since the last successful request
    pub consecutive_limits: u32,
}

#[derive(Clone)]
pub struct RateLimitHandler {
    states: Arc<DashMap<Endpoint, RateLimitState>>,
    clock: Arc<dyn Clock>,
    default_cooldown_ms: u64,
    max_cooldown_ms: u64,
}

impl RateLimitHandler {
    pub fn new(clock: Arc<dyn Clock>, config: &DeliveryConfig) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            clock,
            default_cooldown_ms: config.rate_limit_default_cooldown_ms,
            max_cooldown_ms: config.rate_limit_max_cooldown_ms,
        }
    }

    /// Check if an endpoint is in cooldown
    pub fn is_rate_limited(&self, endpoint: Endpoint) -> bool {
        self.limited_until_ms(endpoint).is_some()
    }

    /// End of the current cooldown, if one is in effect.
    pub fn limited_until_ms(&self, endpoint: Endpoint) -> Option<i64> {
        let now = self.clock.now_ms();
        self.states
            .get(&endpoint)
            .and_then(|state| state.limited_until_ms)
            .filter(|until| now < *until)
    }

    /// Record a 429 and return the end of the resulting cooldown.
    ///
    /// An explicit non-zero Retry-After wins. Without one (or with zero) the
    /// default cooldown doubles with each consecutive 429, up to the
    /// configured maximum.
    pub fn on_too_many_requests(&self, endpoint: Endpoint, retry_after_secs: Option<u64>) -> i64 {
        let now = self.clock.now_ms();
        let mut state = self.states.entry(endpoint).or_default();
        state.consecutive_limits = state.consecutive_limits.saturating_add(1);

        let cooldown_ms = match retry_after_secs.filter(|secs| *secs > 0) {
            Some(secs) => secs.saturating_mul(1000),
            None => {
                let factor = 2u64.saturating_pow(state.consecutive_limits - 1);
                self.default_cooldown_ms
                    .saturating_mul(factor)
                    .min(self.max_cooldown_ms)
            }
        };
        let until = now.saturating_add(i64::try_from(cooldown_ms).unwrap_or(i64::MAX));
        state.limited_until_ms = Some(until);

        log::warn!(
            "[RATE_LIMIT] {} rate limited for {}ms (429 #{} in a row)",
            endpoint,
            cooldown_ms,
            state.consecutive_limits
        );
        until
    }

    /// Forget rate limit history after a request went through.
    pub fn clear(&self, endpoint: Endpoint) {
        if self.states.remove(&endpoint).is_some() {
            log::debug!("[RATE_LIMIT] {} cleared", endpoint);
        }
    }

    pub fn state(&self, endpoint: Endpoint) -> RateLimitState {
        self.states
            .get(&endpoint)
            .map(|state| state.clone())
            .unwrap_or_default()
    }
}
