//! Tenant configuration directory.
//!
//! The rate limiter and edge buffer read per-tenant limits from here at
//! admission / construction time. They never own or persist it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Limit applied when a tenant is unknown or configured with zero.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;

/// Buffer capacity applied when a tenant is unknown or configured with zero.
pub const DEFAULT_EDGE_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanTier {
    Basic,
    Pro,
    Enterprise,
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlanTier::Basic => "Basic",
            PlanTier::Pro => "Pro",
            PlanTier::Enterprise => "Enterprise",
        };
        write!(f, "{s}")
    }
}

/// Per-tenant limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_plan")]
    pub plan_tier: PlanTier,
    pub rate_limit_per_minute: u32,
    pub edge_buffer_size: usize,
}

fn default_plan() -> PlanTier {
    PlanTier::Basic
}

impl TenantConfig {
    pub fn new(
        tenant_id: impl Into<String>,
        rate_limit_per_minute: u32,
        edge_buffer_size: usize,
    ) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            name: tenant_id.clone(),
            tenant_id,
            plan_tier: PlanTier::Basic,
            rate_limit_per_minute,
            edge_buffer_size,
        }
    }
}

/// Read access to tenant limits.
pub trait TenantDirectory: Send + Sync {
    /// Token-bucket capacity for `tenant_id`, per minute.
    fn rate_limit_per_minute(&self, tenant_id: &str) -> u32;
    /// Edge buffer capacity for `tenant_id`.
    fn edge_buffer_size(&self, tenant_id: &str) -> usize;
}

/// In-memory tenant directory.
#[derive(Debug, Default)]
pub struct InMemoryTenantStore {
    tenants: RwLock<HashMap<String, TenantConfig>>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: impl IntoIterator<Item = TenantConfig>) -> Self {
        let store = Self::new();
        for cfg in configs {
            store.upsert(cfg);
        }
        store
    }

    /// The four demo tenants the dashboard ships with.
    pub fn with_demo_tenants() -> Self {
        Self::from_configs(demo_tenants())
    }

    pub fn upsert(&self, cfg: TenantConfig) {
        if let Ok(mut t) = self.tenants.write() {
            t.insert(cfg.tenant_id.clone(), cfg);
        }
    }

    /// Change a tenant's per-minute limit (a plan upgrade). Returns `false`
    /// when the tenant does not exist.
    pub fn set_rate_limit(&self, tenant_id: &str, per_minute: u32) -> bool {
        match self.tenants.write() {
            Ok(mut t) => match t.get_mut(tenant_id) {
                Some(cfg) => {
                    cfg.rate_limit_per_minute = per_minute;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn remove(&self, tenant_id: &str) -> Option<TenantConfig> {
        self.tenants.write().ok()?.remove(tenant_id)
    }

    pub fn get(&self, tenant_id: &str) -> Option<TenantConfig> {
        self.tenants.read().ok()?.get(tenant_id).cloned()
    }

    /// All tenants, sorted by id.
    pub fn list(&self) -> Vec<TenantConfig> {
        let mut v: Vec<TenantConfig> = self
            .tenants
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        v.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        v
    }
}

impl TenantDirectory for InMemoryTenantStore {
    fn rate_limit_per_minute(&self, tenant_id: &str) -> u32 {
        self.get(tenant_id)
            .map(|c| c.rate_limit_per_minute)
            .filter(|&r| r > 0)
            .unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE)
    }

    fn edge_buffer_size(&self, tenant_id: &str) -> usize {
        self.get(tenant_id)
            .map(|c| c.edge_buffer_size)
            .filter(|&s| s > 0)
            .unwrap_or(DEFAULT_EDGE_BUFFER_SIZE)
    }
}

pub fn demo_tenants() -> Vec<TenantConfig> {
    vec![
        TenantConfig {
            tenant_id: "enterprise-01".into(),
            name: "Nexus Enterprise (Full)".into(),
            plan_tier: PlanTier::Enterprise,
            rate_limit_per_minute: 1000,
            edge_buffer_size: 5000,
        },
        TenantConfig {
            tenant_id: "tech-auto".into(),
            name: "High-Tech Automotive".into(),
            plan_tier: PlanTier::Enterprise,
            rate_limit_per_minute: 5000,
            edge_buffer_size: 10_000,
        },
        TenantConfig {
            tenant_id: "mid-mfg".into(),
            name: "MidWest Machining (Standard)".into(),
            plan_tier: PlanTier::Pro,
            rate_limit_per_minute: 100,
            edge_buffer_size: 1000,
        },
        TenantConfig {
            tenant_id: "basic-01".into(),
            name: "Mom & Pop Shop (Basic)".into(),
            plan_tier: PlanTier::Basic,
            rate_limit_per_minute: 20,
            edge_buffer_size: 100,
        },
    ]
}
