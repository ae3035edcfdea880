//! Telemetry, edge buffering and per-tenant rate limiting for the Nexus
//! manufacturing operations dashboard.
//!
//! - [`rate_limiter`]: lazily refilled token bucket per tenant.
//! - [`edge`]: bounded store-and-forward queue with a timed batch flush.
//! - [`telemetry`]: trace log, metric window and listener fan-out.
//! - [`instrument`]: admission plus span capture around any async call.
//! - [`pipeline`]: explicit wiring of the above and the background timers.
//! - [`server`]: JSON routes over a minimal HTTP/1.1 listener.

pub mod cli;
pub mod clock;
pub mod config;
pub mod edge;
pub mod error;
pub mod instrument;
pub mod pipeline;
pub mod rate_limiter;
pub mod server;
pub mod telemetry;
pub mod tenant;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PipelineConfig;
pub use edge::{
    BufferEntry, BufferStatus, EdgeBuffer, EdgeConfig, FlushOutcome, Reading, SimulatedUplink,
    Uplink,
};
pub use error::{ConfigError, InstrumentError, RateLimitExceeded, UplinkError};
pub use instrument::{with_instrumentation, Instrumentation};
pub use pipeline::{DashboardSnapshot, Pipeline, PipelineHandle};
pub use rate_limiter::{RateLimiter, TokenBucket};
pub use telemetry::{
    LatencyMode, MetricSample, SpanGuard, TelemetryCollector, TelemetryConfig, TelemetryEvent,
    TraceEntry, TraceStatus,
};
pub use tenant::{InMemoryTenantStore, PlanTier, TenantConfig, TenantDirectory};
