//! Wiring for the whole subsystem.
//!
//! [`Pipeline`] constructs every component explicitly and owns nothing
//! global; tests can run as many independent pipelines as they like.
//! [`Pipeline::start`] spawns the two background timers (edge flush and
//! metric aggregation) and returns a handle that stops both.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::edge::{BufferStatus, EdgeBuffer, Reading, SimulatedUplink, Uplink};
use crate::instrument::Instrumentation;
use crate::rate_limiter::{RateLimiter, RateLimiterStats, TokenBucket};
use crate::telemetry::{meta, BufferGauge, MetricSample, TelemetryCollector, TraceEntry};
use crate::tenant::{InMemoryTenantStore, TenantDirectory};

/// Machine id used by the load simulator.
pub const SIMULATOR_MACHINE: &str = "SIM-M1";

/// Readings and spans produced per simulated burst.
pub const SIMULATION_BURST: usize = 50;

/// Everything the observability UI polls, in one read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub tenant_id: String,
    pub edge: BufferStatus,
    pub rate_limit: TokenBucket,
    pub rate_limit_max: u32,
    pub limiter: RateLimiterStats,
    pub latest_metric: Option<MetricSample>,
    pub recent_traces: Vec<TraceEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub accepted: usize,
    pub dropped: usize,
    pub spans: usize,
}

pub struct Pipeline {
    pub tenants: Arc<InMemoryTenantStore>,
    pub limiter: Arc<RateLimiter>,
    pub telemetry: Arc<TelemetryCollector>,
    pub edge: Arc<EdgeBuffer>,
    pub instrumentation: Instrumentation,
    default_tenant: String,
}

impl Pipeline {
    /// Build with wall-clock time and the simulated uplink.
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        let uplink = Arc::new(SimulatedUplink::new(cfg.uplink_latency()));
        Self::new(cfg, Arc::new(SystemClock), uplink)
    }

    pub fn new(cfg: &PipelineConfig, clock: Arc<dyn Clock>, uplink: Arc<dyn Uplink>) -> Self {
        let tenants = Arc::new(InMemoryTenantStore::from_configs(cfg.tenants.iter().cloned()));
        let limiter = Arc::new(RateLimiter::new(tenants.clone(), clock.clone()));
        let telemetry = Arc::new(TelemetryCollector::new(cfg.telemetry_config(), clock.clone()));

        let capacity = tenants.edge_buffer_size(&cfg.default_tenant);
        let edge = Arc::new(EdgeBuffer::new(
            cfg.edge_config(capacity),
            clock,
            telemetry.clone(),
            uplink,
        ));

        tracing::info!(
            default_tenant = %cfg.default_tenant,
            edge_capacity = edge.capacity(),
            tenants = cfg.tenants.len(),
            "Telemetry pipeline constructed"
        );

        Self {
            instrumentation: Instrumentation::new(limiter.clone(), telemetry.clone()),
            tenants,
            limiter,
            telemetry,
            edge,
            default_tenant: cfg.default_tenant.clone(),
        }
    }

    pub fn default_tenant(&self) -> &str {
        &self.default_tenant
    }

    /// Spawn the flush and aggregation timers.
    pub fn start(&self) -> PipelineHandle {
        let (tx, rx) = watch::channel(false);
        let gauge: Arc<dyn BufferGauge> = self.edge.clone();
        let flusher = self.edge.start_flusher(rx.clone());
        let aggregator = self.telemetry.start_aggregator(Some(gauge), rx);
        PipelineHandle { shutdown: tx, flusher, aggregator }
    }

    /// Run one aggregation tick now, reading the real edge buffer.
    pub fn sample_now(&self) -> MetricSample {
        self.telemetry.sample_metrics(Some(self.edge.as_ref()))
    }

    /// Burst of readings and spans, as the dashboard's "simulate heavy load"
    /// button produces.
    pub fn simulate_load(&self, bursts: usize) -> SimulationReport {
        let mut report = SimulationReport { accepted: 0, dropped: 0, spans: 0 };
        for _ in 0..bursts {
            for i in 0..SIMULATION_BURST {
                let reading = Reading::from([("temp".to_string(), 20.0 + i as f64)]);
                if self.edge.ingest(SIMULATOR_MACHINE, reading) {
                    report.accepted += 1;
                } else {
                    report.dropped += 1;
                }
                self.telemetry.record_span("simulator", "packet_gen", meta(json!({ "i": i })));
                report.spans += 1;
            }
        }
        tracing::debug!(
            accepted = report.accepted,
            dropped = report.dropped,
            "Simulated load injected"
        );
        report
    }

    pub fn snapshot(&self, tenant_id: &str, traces: usize) -> DashboardSnapshot {
        let mut recent_traces = self.telemetry.recent_traces();
        recent_traces.truncate(traces);
        DashboardSnapshot {
            tenant_id: tenant_id.to_string(),
            edge: self.edge.status(),
            rate_limit: self.limiter.status(tenant_id),
            rate_limit_max: self.tenants.rate_limit_per_minute(tenant_id),
            limiter: self.limiter.stats(),
            latest_metric: self.telemetry.latest_metric(),
            recent_traces,
        }
    }
}

/// Stops the background timers.
pub struct PipelineHandle {
    shutdown: watch::Sender<bool>,
    flusher: JoinHandle<()>,
    aggregator: JoinHandle<()>,
}

impl PipelineHandle {
    /// Signal both timers and wait for them to exit. An in-flight flush is
    /// interrupted and its batch re-enqueued.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.flusher.await {
            tracing::warn!(error = %e, "Edge flusher task failed");
        }
        if let Err(e) = self.aggregator.await {
            tracing::warn!(error = %e, "Metric aggregator task failed");
        }
        tracing::info!("Telemetry pipeline stopped");
    }

    /// A receiver that observes the same shutdown signal, for the HTTP server.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
