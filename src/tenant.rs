use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::{Engine, EscalationPolicy};
use crate::limits::*;
use crate::maintenance;
use crate::notify::NotifyHub;

/// Manages per-tenant engines. Each tenant (hospital site) gets its own
/// Engine + WAL + maintenance loops. Tenant = database name from the pgwire
/// connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    policy: EscalationPolicy,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, policy: EscalationPolicy) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            policy,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.policy)?);

        // Spawn sweeper + compactor for this tenant
        let sweeper_engine = engine.clone();
        tokio::spawn(async move {
            maintenance::run_sweeper(sweeper_engine).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            maintenance::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
