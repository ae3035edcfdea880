//! # Stage: Edge Buffer
//!
//! ## Responsibility
//! Models an edge gateway collecting sensor readings: a bounded FIFO queue
//! that drops new readings under backpressure, keeps accumulating while the
//! uplink is disconnected, and flushes fixed-size batches on a timer.
//!
//! ## Guarantees
//! - Bounded: the queue never holds more than `capacity` entries
//! - Observable loss: every rejected or unrecoverable reading increments
//!   `dropped`; nothing is overwritten silently
//! - FIFO: batches leave oldest first, and a failed batch is put back at
//!   the front in its original order
//! - Cancellable: shutdown interrupts a pending delivery and re-enqueues
//!   the batch
//!
//! ## NOT Responsible For
//! - Retrying with backoff (a failed batch simply waits for the next tick)
//! - Aggregating metrics (telemetry reads [`EdgeBuffer::fill_pct`])

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::UplinkError;
use crate::telemetry::{meta, BufferGauge, TelemetryCollector};

/// Service label on flush spans.
pub const EDGE_SERVICE: &str = "edge-gateway";

/// Operation label on flush spans.
pub const FLUSH_OPERATION: &str = "flush_batch";

/// Named numeric fields of one sensor reading (e.g. `temperature`).
pub type Reading = BTreeMap<String, f64>;

/// One pending reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferEntry {
    pub machine_id: String,
    #[serde(flatten)]
    pub reading: Reading,
    pub ingest_timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStatus {
    pub capacity: usize,
    pub used: usize,
    pub dropped: u64,
    pub is_connected: bool,
}

/// Result of one flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing to do: buffer empty or disconnected.
    Idle,
    Delivered { batch_size: usize, remaining: usize },
    Failed { batch_size: usize, requeued: usize, dropped: usize },
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            batch_size: 50,
            flush_interval: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Uplink
// ---------------------------------------------------------------------------

/// Where flushed batches go.
#[async_trait]
pub trait Uplink: Send + Sync {
    async fn deliver(&self, batch: &[BufferEntry]) -> Result<(), UplinkError>;
}

/// An uplink that always succeeds after a fixed network delay.
#[derive(Debug, Clone)]
pub struct SimulatedUplink {
    latency: Duration,
}

impl SimulatedUplink {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Default for SimulatedUplink {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait]
impl Uplink for SimulatedUplink {
    async fn deliver(&self, _batch: &[BufferEntry]) -> Result<(), UplinkError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EdgeBuffer
// ---------------------------------------------------------------------------

struct EdgeState {
    queue: VecDeque<BufferEntry>,
    dropped: u64,
    connected: bool,
}

pub struct EdgeBuffer {
    cfg: EdgeConfig,
    clock: Arc<dyn Clock>,
    telemetry: Arc<TelemetryCollector>,
    uplink: Arc<dyn Uplink>,
    state: Mutex<EdgeState>,
}

impl EdgeBuffer {
    pub fn new(
        cfg: EdgeConfig,
        clock: Arc<dyn Clock>,
        telemetry: Arc<TelemetryCollector>,
        uplink: Arc<dyn Uplink>,
    ) -> Self {
        Self {
            state: Mutex::new(EdgeState {
                queue: VecDeque::with_capacity(cfg.capacity.min(16_384)),
                dropped: 0,
                connected: true,
            }),
            cfg,
            clock,
            telemetry,
            uplink,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cfg.capacity
    }

    /// Accept a reading, or drop it when the buffer is full.
    ///
    /// `false` is the backpressure signal, not an error.
    pub fn ingest(&self, machine_id: &str, reading: Reading) -> bool {
        let now = self.clock.now_ms();
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.queue.len() >= self.cfg.capacity {
            state.dropped += 1;
            return false;
        }
        state.queue.push_back(BufferEntry {
            machine_id: machine_id.to_string(),
            reading,
            ingest_timestamp: now,
        });
        true
    }

    pub fn status(&self) -> BufferStatus {
        match self.state.lock() {
            Ok(s) => BufferStatus {
                capacity: self.cfg.capacity,
                used: s.queue.len(),
                dropped: s.dropped,
                is_connected: s.connected,
            },
            Err(_) => BufferStatus {
                capacity: self.cfg.capacity,
                used: 0,
                dropped: 0,
                is_connected: false,
            },
        }
    }

    /// Pending entries, oldest first.
    pub fn pending(&self) -> Vec<BufferEntry> {
        self.state
            .lock()
            .map(|s| s.queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Flip connectivity. The next flush tick acts on the new state.
    pub fn toggle_connection(&self) -> bool {
        match self.state.lock() {
            Ok(mut s) => {
                s.connected = !s.connected;
                tracing::info!(connected = s.connected, "Edge uplink toggled");
                s.connected
            }
            Err(_) => false,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.connected = connected;
        }
    }

    /// Deliver one batch from the front of the queue.
    pub async fn flush_once(&self) -> FlushOutcome {
        self.flush_until(std::future::pending::<()>()).await
    }

    /// Like [`flush_once`](Self::flush_once), but abandons delivery when
    /// `cancel` completes first. An abandoned batch is treated as failed.
    pub async fn flush_until<C>(&self, cancel: C) -> FlushOutcome
    where
        C: Future<Output = ()>,
    {
        let batch: Vec<BufferEntry> = {
            let Ok(mut state) = self.state.lock() else {
                return FlushOutcome::Idle;
            };
            if state.queue.is_empty() || !state.connected {
                return FlushOutcome::Idle;
            }
            let n = self.cfg.batch_size.min(state.queue.len());
            state.queue.drain(..n).collect()
        };
        let batch_size = batch.len();

        let span = self.telemetry.start_span(
            EDGE_SERVICE,
            FLUSH_OPERATION,
            meta(json!({ "batchSize": batch_size })),
        );

        let result = tokio::select! {
            r = self.uplink.deliver(&batch) => r,
            _ = cancel => Err(UplinkError::Unreachable("flush cancelled by shutdown".into())),
        };

        match result {
            Ok(()) => {
                let status = self.status();
                span.finish_ok(meta(json!({
                    "bufferRemaining": status.used,
                    "droppedTotal": status.dropped,
                })));
                FlushOutcome::Delivered { batch_size, remaining: status.used }
            }
            Err(e) => {
                let (requeued, lost, dropped_total) = self.requeue_front(batch);
                tracing::warn!(
                    error = %e,
                    batch_size,
                    requeued,
                    dropped = lost,
                    "Edge flush failed, batch re-enqueued"
                );
                let mut span = span;
                span.annotate("requeued", requeued);
                span.annotate("droppedOnRequeue", lost);
                span.annotate("droppedTotal", dropped_total);
                span.finish_err(e.to_string());
                FlushOutcome::Failed { batch_size, requeued, dropped: lost }
            }
        }
    }

    /// Put a failed batch back at the front, oldest first, as far as free
    /// capacity allows. The newest entries that do not fit are dropped.
    fn requeue_front(&self, batch: Vec<BufferEntry>) -> (usize, usize, u64) {
        let Ok(mut state) = self.state.lock() else {
            return (0, batch.len(), 0);
        };
        let free = self.cfg.capacity.saturating_sub(state.queue.len());
        let keep = free.min(batch.len());
        let lost = batch.len() - keep;
        for entry in batch.into_iter().take(keep).rev() {
            state.queue.push_front(entry);
        }
        state.dropped += lost as u64;
        (keep, lost, state.dropped)
    }

    /// Spawn the periodic flush task.
    ///
    /// The first flush happens one interval after start. Shutdown interrupts
    /// an in-flight delivery.
    pub fn start_flusher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let edge = Arc::clone(self);
        tokio::spawn(async move {
            let period = edge.cfg.flush_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                edge.flush_until(shutdown_signalled(shutdown.clone())).await;
                if *shutdown.borrow() {
                    break;
                }
            }
            tracing::debug!(target: "edge::flusher", "Edge flusher stopped");
        })
    }
}

impl BufferGauge for EdgeBuffer {
    fn fill_pct(&self) -> f64 {
        let status = self.status();
        if status.capacity == 0 {
            0.0
        } else {
            status.used as f64 / status.capacity as f64 * 100.0
        }
    }
}

/// Completes once `rx` reads `true` or its sender is gone.
async fn shutdown_signalled(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|&stop| stop).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
