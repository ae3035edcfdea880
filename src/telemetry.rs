//! # Stage: Telemetry Collector
//!
//! ## Responsibility
//! Records completed spans into a bounded, most-recent-first trace log and
//! periodically aggregates a [`MetricSample`] into a bounded rolling window.
//! Every append and every sample is pushed to synchronous listeners and to a
//! broadcast channel for async consumers.
//!
//! ## Guarantees
//! - Bounded: trace log (default 200) and metric window (default 60) evict
//!   their oldest entry on overflow
//! - Ordered: trace log order is insertion order, never timestamp order
//! - Non-reentrant locking: listeners run after every internal lock is
//!   released, so they may query the collector
//! - Closed spans: a [`SpanGuard`] dropped without finishing still records
//!   an ERROR entry
//!
//! ## NOT Responsible For
//! - Admission control (that is the rate limiter)
//! - Buffer occupancy (read through [`BufferGauge`], owned by the edge buffer)

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::Clock;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Trace log capacity.
pub const TRACE_LOG_CAP: usize = 200;

/// Metric window capacity: 3 minutes at one sample every 3 s.
pub const METRIC_WINDOW_CAP: usize = 60;

/// Number of most recent traces considered for `error_rate` and the
/// windowed latency estimate.
pub const ERROR_WINDOW: usize = 50;

/// Latency reported before any trace exists, in milliseconds.
pub const DEFAULT_LATENCY_MS: f64 = 150.0;

/// Broadcast channel capacity (number of events in flight).
pub const EVENT_CHANNEL_CAP: usize = 256;

/// Key-value context attached to a trace.
pub type Meta = serde_json::Map<String, Value>;

/// Build a [`Meta`] from a JSON object literal. Non-objects yield an empty map.
pub fn meta(value: Value) -> Meta {
    match value {
        Value::Object(map) => map,
        _ => Meta::new(),
    }
}

/// Fresh 32-hex-digit trace id.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Fresh 16-hex-digit span id.
pub fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

// ---------------------------------------------------------------------------
// Trace and metric types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TraceStatus {
    Ok,
    Error,
}

impl std::fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceStatus::Ok => write!(f, "OK"),
            TraceStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// One completed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub trace_id: String,
    pub span_id: String,
    /// Epoch milliseconds at which the entry was created.
    pub timestamp: u64,
    pub service: String,
    pub operation: String,
    pub duration_ms: u64,
    pub status: TraceStatus,
    #[serde(default)]
    pub meta: Meta,
}

impl TraceEntry {
    pub fn is_error(&self) -> bool {
        self.status == TraceStatus::Error
    }
}

/// One periodic aggregate snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub timestamp: u64,
    pub cpu_load: f64,
    pub memory_usage: f64,
    pub active_connections: u32,
    /// Real edge buffer occupancy, 0–100.
    pub edge_buffer_fill_pct: f64,
    /// Recent tail latency indicator, in milliseconds.
    pub api_latency_p95: f64,
    /// Percentage of ERROR traces among the last [`ERROR_WINDOW`].
    pub error_rate: f64,
}

/// What a listener is told about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Trace(TraceEntry),
    Metrics(MetricSample),
}

// ---------------------------------------------------------------------------
// Sampling seams
// ---------------------------------------------------------------------------

/// Occupancy source for `edge_buffer_fill_pct`.
pub trait BufferGauge: Send + Sync {
    /// Percentage of capacity in use, 0–100.
    fn fill_pct(&self) -> f64;
}

/// Host gauges sampled on every aggregation tick.
pub trait SystemSampler: Send + Sync {
    fn cpu_load(&self) -> f64;
    fn memory_usage(&self) -> f64;
    fn active_connections(&self) -> u32;
}

/// Illustrative gauges in the ranges the dashboard was designed around.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticSampler;

impl SystemSampler for SyntheticSampler {
    fn cpu_load(&self) -> f64 {
        20.0 + rand::thread_rng().gen::<f64>() * 15.0
    }

    fn memory_usage(&self) -> f64 {
        45.0 + rand::thread_rng().gen::<f64>() * 10.0
    }

    fn active_connections(&self) -> u32 {
        120 + rand::thread_rng().gen_range(0..30)
    }
}

/// How `api_latency_p95` is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMode {
    /// Most recent trace duration × 1.5.
    #[default]
    LastTraceScaled,
    /// True p95 over the durations of the last [`ERROR_WINDOW`] traces.
    WindowP95,
}

/// p95 of `values` (nearest-rank), or `None` if empty.
pub fn p95(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((v.len() as f64 * 0.95).ceil() as usize).saturating_sub(1).min(v.len() - 1);
    Some(v[idx])
}

// ---------------------------------------------------------------------------
// TelemetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub trace_capacity: usize,
    pub metric_window: usize,
    pub error_window: usize,
    /// How often the aggregator samples a [`MetricSample`].
    pub aggregation_interval: Duration,
    pub latency_mode: LatencyMode,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            trace_capacity: TRACE_LOG_CAP,
            metric_window: METRIC_WINDOW_CAP,
            error_window: ERROR_WINDOW,
            aggregation_interval: Duration::from_secs(3),
            latency_mode: LatencyMode::LastTraceScaled,
        }
    }
}

// ---------------------------------------------------------------------------
// Listener registry
// ---------------------------------------------------------------------------

type Listener = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

/// Listeners keyed by a monotonically increasing id, so iteration order is
/// registration order and removal is O(log n).
#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    entries: BTreeMap<u64, Listener>,
}

/// Handle returned by [`TelemetryCollector::subscribe`].
pub struct Subscription {
    id: u64,
    table: Weak<Mutex<ListenerTable>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving events. Returns `false` if already removed.
    pub fn unsubscribe(self) -> bool {
        match self.table.upgrade() {
            Some(table) => table
                .lock()
                .map(|mut t| t.entries.remove(&self.id).is_some())
                .unwrap_or(false),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// TelemetryCollector
// ---------------------------------------------------------------------------

/// Trace log, metric window and subscriber fan-out.
///
/// # Example
/// ```ignore
/// let telemetry = Arc::new(TelemetryCollector::new(TelemetryConfig::default(), clock));
/// let sub = telemetry.subscribe(|ev| println!("{ev:?}"));
/// telemetry.record_span("simulator", "packet_gen", Meta::new());
/// sub.unsubscribe();
/// ```
pub struct TelemetryCollector {
    cfg: TelemetryConfig,
    clock: Arc<dyn Clock>,
    sampler: Arc<dyn SystemSampler>,
    traces: Mutex<VecDeque<TraceEntry>>,
    metrics: Mutex<VecDeque<MetricSample>>,
    listeners: Arc<Mutex<ListenerTable>>,
    tx: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryCollector {
    pub fn new(cfg: TelemetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_sampler(cfg, clock, Arc::new(SyntheticSampler))
    }

    pub fn with_sampler(
        cfg: TelemetryConfig,
        clock: Arc<dyn Clock>,
        sampler: Arc<dyn SystemSampler>,
    ) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Self {
            traces: Mutex::new(VecDeque::with_capacity(cfg.trace_capacity)),
            metrics: Mutex::new(VecDeque::with_capacity(cfg.metric_window)),
            cfg,
            clock,
            sampler,
            listeners: Arc::new(Mutex::new(ListenerTable::default())),
            tx,
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.cfg
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // --- tracing ---

    /// Record an already-finished span with a simulated duration.
    ///
    /// A string `traceId` in `meta` is reused as the trace id.
    pub fn record_span(&self, service: &str, operation: &str, meta: Meta) -> String {
        let duration_ms = rand::thread_rng().gen_range(20..220);
        self.record(service, operation, TraceStatus::Ok, duration_ms, meta)
    }

    /// Build and append an entry stamped with the current time.
    pub fn record(
        &self,
        service: &str,
        operation: &str,
        status: TraceStatus,
        duration_ms: u64,
        meta: Meta,
    ) -> String {
        let trace_id = meta
            .get("traceId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(new_trace_id);
        self.append_trace(TraceEntry {
            trace_id: trace_id.clone(),
            span_id: new_span_id(),
            timestamp: self.clock.now_ms(),
            service: service.to_string(),
            operation: operation.to_string(),
            duration_ms,
            status,
            meta,
        });
        trace_id
    }

    /// Open a span measuring real elapsed time until it is finished or dropped.
    pub fn start_span(&self, service: &str, operation: &str, meta: Meta) -> SpanGuard<'_> {
        let trace_id = meta
            .get("traceId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(new_trace_id);
        SpanGuard {
            collector: self,
            trace_id,
            span_id: new_span_id(),
            service: service.to_string(),
            operation: operation.to_string(),
            started_at: self.clock.now_ms(),
            meta,
            finished: false,
        }
    }

    /// Append a fully formed entry, evicting the oldest beyond capacity.
    pub fn append_trace(&self, entry: TraceEntry) {
        if let Ok(mut traces) = self.traces.lock() {
            traces.push_front(entry.clone());
            traces.truncate(self.cfg.trace_capacity);
        }
        self.notify(TelemetryEvent::Trace(entry));
    }

    /// Trace log snapshot, most recent first.
    pub fn recent_traces(&self) -> Vec<TraceEntry> {
        self.traces
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn trace_count(&self) -> usize {
        self.traces.lock().map(|t| t.len()).unwrap_or(0)
    }

    // --- metrics ---

    /// Run one aggregation tick and append the result to the window.
    pub fn sample_metrics(&self, gauge: Option<&dyn BufferGauge>) -> MetricSample {
        let (api_latency_p95, error_rate) = self.trace_aggregates();
        let sample = MetricSample {
            timestamp: self.clock.now_ms(),
            cpu_load: self.sampler.cpu_load(),
            memory_usage: self.sampler.memory_usage(),
            active_connections: self.sampler.active_connections(),
            edge_buffer_fill_pct: gauge.map(|g| g.fill_pct()).unwrap_or(0.0),
            api_latency_p95,
            error_rate,
        };

        if let Ok(mut window) = self.metrics.lock() {
            window.push_back(sample.clone());
            while window.len() > self.cfg.metric_window {
                window.pop_front();
            }
        }
        self.notify(TelemetryEvent::Metrics(sample.clone()));
        sample
    }

    fn trace_aggregates(&self) -> (f64, f64) {
        let Ok(traces) = self.traces.lock() else {
            return (DEFAULT_LATENCY_MS, 0.0);
        };
        let window = self.cfg.error_window.max(1);
        let recent = traces.iter().take(window);

        let errors = recent.clone().filter(|t| t.is_error()).count();
        let error_rate = errors as f64 / window as f64 * 100.0;

        let latency = match self.cfg.latency_mode {
            LatencyMode::LastTraceScaled => traces
                .front()
                .map(|t| t.duration_ms as f64 * 1.5)
                .unwrap_or(DEFAULT_LATENCY_MS),
            LatencyMode::WindowP95 => {
                let durations: Vec<f64> = recent.map(|t| t.duration_ms as f64).collect();
                p95(&durations).unwrap_or(DEFAULT_LATENCY_MS)
            }
        };
        (latency, error_rate)
    }

    /// Rolling window snapshot, oldest first.
    pub fn metrics(&self) -> Vec<MetricSample> {
        self.metrics
            .lock()
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest_metric(&self) -> Option<MetricSample> {
        self.metrics.lock().ok()?.back().cloned()
    }

    /// Spawn the periodic aggregation task.
    ///
    /// The first sample is taken one interval after start. The task exits
    /// when `shutdown` flips to `true` or its sender is dropped.
    pub fn start_aggregator(
        self: &Arc<Self>,
        gauge: Option<Arc<dyn BufferGauge>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            let period = collector.cfg.aggregation_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        collector.sample_metrics(gauge.as_deref());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(target: "telemetry::aggregator", "Metric aggregator stopped");
        })
    }

    // --- subscription ---

    /// Register a synchronous listener. Listeners only see future events.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TelemetryEvent) + Send + Sync + 'static,
    {
        let mut table = match self.listeners.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = table.next_id;
        table.next_id += 1;
        table.entries.insert(id, Arc::new(listener));
        Subscription {
            id,
            table: Arc::downgrade(&self.listeners),
        }
    }

    /// Remove a listener by id. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.listeners
            .lock()
            .map(|mut t| t.entries.remove(&id).is_some())
            .unwrap_or(false)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|t| t.entries.len()).unwrap_or(0)
    }

    /// Receiver for the same events listeners see, for async consumers.
    ///
    /// Slow receivers see [`broadcast::error::RecvError::Lagged`] after falling
    /// more than [`EVENT_CHANNEL_CAP`] events behind.
    pub fn events(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    fn notify(&self, event: TelemetryEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .map(|t| t.entries.values().cloned().collect())
            .unwrap_or_default();
        for listener in &listeners {
            listener(&event);
        }
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

// ---------------------------------------------------------------------------
// SpanGuard
// ---------------------------------------------------------------------------

/// An open span. Finish it with [`SpanGuard::finish_ok`] or
/// [`SpanGuard::finish_err`]; dropping it unfinished records an ERROR.
pub struct SpanGuard<'a> {
    collector: &'a TelemetryCollector,
    trace_id: String,
    span_id: String,
    service: String,
    operation: String,
    started_at: u64,
    meta: Meta,
    finished: bool,
}

impl SpanGuard<'_> {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Attach a key to the span's meta before it closes.
    pub fn annotate(&mut self, key: &str, value: impl Into<Value>) {
        self.meta.insert(key.to_string(), value.into());
    }

    pub fn finish_ok(mut self, extra: Meta) -> TraceEntry {
        self.close(TraceStatus::Ok, extra)
    }

    pub fn finish_err(mut self, error: impl Into<String>) -> TraceEntry {
        let mut extra = Meta::new();
        extra.insert("error".into(), Value::String(error.into()));
        self.close(TraceStatus::Error, extra)
    }

    fn close(&mut self, status: TraceStatus, extra: Meta) -> TraceEntry {
        self.finished = true;
        let now = self.collector.clock.now_ms();
        let mut meta = std::mem::take(&mut self.meta);
        meta.extend(extra);
        let entry = TraceEntry {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            timestamp: now,
            service: std::mem::take(&mut self.service),
            operation: std::mem::take(&mut self.operation),
            duration_ms: now.saturating_sub(self.started_at),
            status,
            meta,
        };
        self.collector.append_trace(entry.clone());
        entry
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut extra = Meta::new();
            extra.insert(
                "error".into(),
                Value::String("span dropped before completion".into()),
            );
            self.close(TraceStatus::Error, extra);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
