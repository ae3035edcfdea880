//! TOML configuration for the whole pipeline.
//!
//! Every field has a default, so an empty file (or no file) yields the
//! dashboard's stock behaviour.
//!
//! ```toml
//! default_tenant = "mid-mfg"
//!
//! [telemetry]
//! aggregation_interval_ms = 3000
//! latency_mode = "window_p95"
//!
//! [edge]
//! batch_size = 50
//! flush_interval_ms = 2000
//!
//! [[tenants]]
//! tenant_id = "mid-mfg"
//! rate_limit_per_minute = 100
//! edge_buffer_size = 1000
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::edge::EdgeConfig;
use crate::error::ConfigError;
use crate::telemetry::{
    LatencyMode, TelemetryConfig, ERROR_WINDOW, METRIC_WINDOW_CAP, TRACE_LOG_CAP,
};
use crate::tenant::{demo_tenants, TenantConfig};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySection {
    pub trace_capacity: usize,
    pub metric_window: usize,
    pub error_window: usize,
    pub aggregation_interval_ms: u64,
    pub latency_mode: LatencyMode,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            trace_capacity: TRACE_LOG_CAP,
            metric_window: METRIC_WINDOW_CAP,
            error_window: ERROR_WINDOW,
            aggregation_interval_ms: 3_000,
            latency_mode: LatencyMode::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EdgeSection {
    /// Overrides the default tenant's `edge_buffer_size` when set.
    pub capacity: Option<usize>,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub uplink_latency_ms: u64,
}

impl Default for EdgeSection {
    fn default() -> Self {
        Self {
            capacity: None,
            batch_size: 50,
            flush_interval_ms: 2_000,
            uplink_latency_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Tenant whose limits size the edge buffer and key the dashboard's calls.
    pub default_tenant: String,
    pub telemetry: TelemetrySection,
    pub edge: EdgeSection,
    pub tenants: Vec<TenantConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_tenant: "enterprise-01".to_string(),
            telemetry: TelemetrySection::default(),
            edge: EdgeSection::default(),
            tenants: demo_tenants(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: PipelineConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject settings that would make a bounded collection or timer useless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.telemetry;
        let checks = [
            (t.trace_capacity == 0, "telemetry.trace_capacity must be > 0"),
            (t.metric_window == 0, "telemetry.metric_window must be > 0"),
            (t.error_window == 0, "telemetry.error_window must be > 0"),
            (
                t.error_window > t.trace_capacity,
                "telemetry.error_window must not exceed telemetry.trace_capacity",
            ),
            (t.aggregation_interval_ms == 0, "telemetry.aggregation_interval_ms must be > 0"),
            (self.edge.capacity == Some(0), "edge.capacity must be > 0"),
            (self.edge.batch_size == 0, "edge.batch_size must be > 0"),
            (self.edge.flush_interval_ms == 0, "edge.flush_interval_ms must be > 0"),
            (self.default_tenant.trim().is_empty(), "default_tenant must not be empty"),
        ];
        if let Some((_, msg)) = checks.iter().find(|(bad, _)| *bad) {
            return Err(ConfigError::Invalid((*msg).to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for tenant in &self.tenants {
            if !seen.insert(tenant.tenant_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tenant '{}'",
                    tenant.tenant_id
                )));
            }
        }
        Ok(())
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            trace_capacity: self.telemetry.trace_capacity,
            metric_window: self.telemetry.metric_window,
            error_window: self.telemetry.error_window,
            aggregation_interval: Duration::from_millis(self.telemetry.aggregation_interval_ms),
            latency_mode: self.telemetry.latency_mode,
        }
    }

    /// Edge settings, with capacity falling back to `tenant_capacity`.
    pub fn edge_config(&self, tenant_capacity: usize) -> EdgeConfig {
        EdgeConfig {
            capacity: self.edge.capacity.unwrap_or(tenant_capacity),
            batch_size: self.edge.batch_size,
            flush_interval: Duration::from_millis(self.edge.flush_interval_ms),
        }
    }

    pub fn uplink_latency(&self) -> Duration {
        Duration::from_millis(self.edge.uplink_latency_ms)
    }
}
