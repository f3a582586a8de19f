use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{Engine, EngineOptions, EngineSettings};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sweeper;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + sweeper + compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    engine_settings: EngineSettings,
    sweep_interval: Duration,
    compact_threshold: u64,
    /// Parent of every tenant's background tasks.
    cancel: CancellationToken,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        engine_settings: EngineSettings,
        sweep_interval: Duration,
        compact_threshold: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            engine_settings,
            sweep_interval,
            compact_threshold,
            cancel,
        }
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        // Keyed by the sanitized name: `a.b` and `ab` share one WAL, so they share one engine.
        let safe_name = sanitize(tenant)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // The entry guard keeps two first connections from opening the same WAL twice.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let engine = self.open_engine(&safe_name)?;
                slot.insert(engine.clone());
                engine
            }
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!("tenant {safe_name} loaded");
        Ok(engine)
    }

    fn open_engine(&self, safe_name: &str) -> io::Result<Arc<Engine>> {
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let options = EngineOptions {
            settings: self.engine_settings.clone(),
            ..EngineOptions::default()
        };
        let engine = Arc::new(Engine::open(wal_path, Arc::new(NotifyHub::new()), options)?);

        tokio::spawn(sweeper::run_sweeper(
            engine.clone(),
            self.sweep_interval,
            self.cancel.child_token(),
        ));
        tokio::spawn(sweeper::run_compactor(
            engine.clone(),
            self.compact_threshold,
            self.cancel.child_token(),
        ));
        Ok(engine)
    }
}

/// Strip everything but `[A-Za-z0-9_-]` so the name is safe as a file stem.
fn sanitize(tenant: &str) -> io::Result<String> {
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(safe_name)
}
