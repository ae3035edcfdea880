//! Admission control plus span capture around any async operation.
//!
//! Every expensive call (in the dashboard, the generative-AI insight calls)
//! goes through [`Instrumentation::run`]. The wrapper knows nothing about the
//! operation itself.

use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;

use crate::error::{InstrumentError, RateLimitExceeded};
use crate::rate_limiter::RateLimiter;
use crate::telemetry::{meta, TelemetryCollector, TraceStatus};

/// `meta.reason` on traces for rejected admissions.
pub const RATE_LIMITED_REASON: &str = "RATE_LIMITED";

#[derive(Clone)]
pub struct Instrumentation {
    limiter: Arc<RateLimiter>,
    telemetry: Arc<TelemetryCollector>,
}

impl Instrumentation {
    pub fn new(limiter: Arc<RateLimiter>, telemetry: Arc<TelemetryCollector>) -> Self {
        Self { limiter, telemetry }
    }

    /// Run `op` for `tenant_id` if its token bucket admits it.
    ///
    /// # Returns
    /// - `Ok(T)`: the operation's value; an OK trace with `meta.size` (the
    ///   result's JSON length) was recorded.
    /// - `Err(InstrumentError::RateLimited)`: admission denied, `op` was never
    ///   called; an ERROR trace with `meta.reason = "RATE_LIMITED"` was recorded.
    /// - `Err(InstrumentError::Operation(e))`: `op` failed with `e`, returned
    ///   unchanged; an ERROR trace with `meta.error` was recorded.
    pub async fn run<T, E, F, Fut>(
        &self,
        service: &str,
        operation: &str,
        tenant_id: &str,
        op: F,
    ) -> Result<T, InstrumentError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize,
        E: std::fmt::Display,
    {
        if !self.limiter.check_admission(tenant_id) {
            self.telemetry.record(
                service,
                operation,
                TraceStatus::Error,
                0,
                meta(json!({ "reason": RATE_LIMITED_REASON, "tenantId": tenant_id })),
            );
            return Err(RateLimitExceeded { tenant_id: tenant_id.to_string() }.into());
        }

        let span = self
            .telemetry
            .start_span(service, operation, meta(json!({ "tenantId": tenant_id })));

        match op().await {
            Ok(value) => {
                let size = serde_json::to_string(&value)
                    .map(|s| Value::from(s.len()))
                    .unwrap_or(Value::Null);
                span.finish_ok(meta(json!({ "size": size })));
                Ok(value)
            }
            Err(e) => {
                span.finish_err(e.to_string());
                Err(InstrumentError::Operation(e))
            }
        }
    }
}

/// Free-function form of [`Instrumentation::run`].
pub async fn with_instrumentation<T, E, F, Fut>(
    instrumentation: &Instrumentation,
    service: &str,
    operation: &str,
    tenant_id: &str,
    op: F,
) -> Result<T, InstrumentError<E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: Serialize,
    E: std::fmt::Display,
{
    instrumentation.run(service, operation, tenant_id, op).await
}
