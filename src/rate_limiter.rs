//! # Stage: Rate Limiter
//!
//! ## Responsibility
//! Per-tenant token bucket governing admission of expensive operations.
//! Capacity is the tenant's `rate_limit_per_minute`; refill is
//! `capacity / 60` tokens per second, recomputed from the directory on
//! every check so plan changes apply immediately.
//!
//! ## Guarantees
//! - Bounded: `0 <= tokens <= max_tokens` after every operation
//! - Atomic: refill, check and debit happen under one lock
//! - Lazy: buckets are created full on first use and never destroyed
//!
//! ## NOT Responsible For
//! - Persisting limits (that is the tenant directory)
//! - Recording rejections as traces (that is the instrumentation wrapper)

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::tenant::TenantDirectory;

/// Rate-limit state for one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucket {
    pub tokens: f64,
    pub last_refill: u64,
}

impl TokenBucket {
    fn full(max_tokens: f64, now: u64) -> Self {
        Self { tokens: max_tokens, last_refill: now }
    }

    /// Credit tokens for the time elapsed since `last_refill`, clamped to
    /// `max_tokens`. A clock that went backwards credits nothing.
    fn refill(&mut self, max_tokens: f64, now: u64) {
        let elapsed_secs = now.saturating_sub(self.last_refill) as f64 / 1000.0;
        let rate = max_tokens / 60.0;
        self.tokens = (self.tokens + elapsed_secs * rate).min(max_tokens).max(0.0);
        self.last_refill = now;
    }
}

/// Admission counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    pub admitted: u64,
    pub rejected: u64,
    pub tenants: usize,
}

#[derive(Default)]
struct LimiterState {
    buckets: HashMap<String, TokenBucket>,
    admitted: u64,
    rejected: u64,
}

/// Per-tenant token-bucket limiter.
pub struct RateLimiter {
    directory: Arc<dyn TenantDirectory>,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(directory: Arc<dyn TenantDirectory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            directory,
            clock,
            state: Mutex::new(LimiterState::default()),
        }
    }

    fn max_tokens(&self, tenant_id: &str) -> f64 {
        f64::from(self.directory.rate_limit_per_minute(tenant_id))
    }

    /// Refill, then try to debit one token. Returns `true` when admitted.
    pub fn check_admission(&self, tenant_id: &str) -> bool {
        let max_tokens = self.max_tokens(tenant_id);
        let now = self.clock.now_ms();

        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let bucket = state
            .buckets
            .entry(tenant_id.to_string())
            .or_insert_with(|| TokenBucket::full(max_tokens, now));
        bucket.refill(max_tokens, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            state.admitted += 1;
            true
        } else {
            let tokens = bucket.tokens;
            state.rejected += 1;
            drop(state);
            tracing::warn!(
                tenant_id = %tenant_id,
                tokens,
                max_tokens,
                "Rate limit exceeded"
            );
            false
        }
    }

    /// Current bucket for `tenant_id`, creating it full if absent.
    ///
    /// Applies the pending refill but never debits.
    pub fn status(&self, tenant_id: &str) -> TokenBucket {
        let max_tokens = self.max_tokens(tenant_id);
        let now = self.clock.now_ms();
        match self.state.lock() {
            Ok(mut state) => {
                let bucket = state
                    .buckets
                    .entry(tenant_id.to_string())
                    .or_insert_with(|| TokenBucket::full(max_tokens, now));
                bucket.refill(max_tokens, now);
                *bucket
            }
            Err(_) => TokenBucket::full(max_tokens, now),
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        self.state
            .lock()
            .map(|s| RateLimiterStats {
                admitted: s.admitted,
                rejected: s.rejected,
                tenants: s.buckets.len(),
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
