//! Process-wide registry of named worker pools.
//!
//! Pools are registered once at startup, usually from the `asyncTasks.pools`
//! section of the configuration, and looked up by name every time work is
//! scheduled on them.

use crate::config::PoolSpec;
use crate::worker_pool::{PoolError, WorkerPool, WorkerPoolConfig};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::{info, warn};

static GLOBAL_REGISTRY: Lazy<Arc<PoolRegistry>> = Lazy::new(|| Arc::new(PoolRegistry::new()));

/// Named pool lookup table.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: DashMap<String, Arc<WorkerPool>>,
}

impl PoolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`crate::execute`].
    #[must_use]
    pub fn global() -> Arc<PoolRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Create a pool and register it under `name`.
    ///
    /// Registering a name twice is an error; remove the old pool first.
    pub fn register(
        &self,
        name: &str,
        config: WorkerPoolConfig,
    ) -> Result<Arc<WorkerPool>, PoolError> {
        // The shard stays locked until the entry is dropped, so no other map access in here
        let pool = match self.pools.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(PoolError::AlreadyRegistered {
                    name: name.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                let pool = Arc::new(WorkerPool::new(name, config)?);
                slot.insert(Arc::clone(&pool));
                pool
            }
        };
        info!(pool_name = %name, total_pools = self.pools.len(), "Worker pool registered");
        Ok(pool)
    }

    /// Register every pool declared in configuration.
    ///
    /// A pool that fails to register is logged and skipped; work scheduled on
    /// it later falls back to unpooled execution.
    pub fn register_all(&self, specs: &[PoolSpec]) -> usize {
        let mut registered = 0;
        for spec in specs {
            match self.register(&spec.name, spec.to_pool_config()) {
                Ok(_) => registered += 1,
                Err(e) => warn!(pool_name = %spec.name, error = %e, "Skipping worker pool"),
            }
        }
        registered
    }

    /// Look up a live pool by name. Closed pools count as missing.
    pub fn get(&self, name: &str) -> Result<Arc<WorkerPool>, PoolError> {
        match self.pools.get(name) {
            Some(pool) if !pool.is_closed() => Ok(Arc::clone(pool.value())),
            _ => Err(PoolError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Remove and close a pool. Its queued tasks still run.
    pub fn remove(&self, name: &str) -> Option<Arc<WorkerPool>> {
        let (_, pool) = self.pools.remove(name)?;
        pool.close();
        Some(pool)
    }

    /// Close and drop every pool.
    pub fn shutdown(&self) {
        let names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.remove(&name);
        }
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
