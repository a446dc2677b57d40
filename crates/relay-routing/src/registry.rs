use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use relay_core::{Model, Result};

/// Where the model table comes from. The gateway ships a static source fed
/// from config; a database-backed source implements the same trait.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Model>>;
}

pub struct StaticModelSource {
    models: Vec<Model>,
}

impl StaticModelSource {
    pub fn new(models: Vec<Model>) -> Self {
        Self { models }
    }
}

#[async_trait]
impl ModelSource for StaticModelSource {
    async fn load(&self) -> Result<Vec<Model>> {
        Ok(self.models.clone())
    }
}

/// Read-mostly snapshot of the model table. Readers never block; `refresh`
/// publishes a whole new snapshot atomically and keeps the prior one on
/// source failure.
pub struct ModelRegistry {
    snapshot: RwLock<Arc<Vec<Model>>>,
    source: Arc<dyn ModelSource>,
    refresh_interval: Duration,
    last_refresh: Mutex<Option<Instant>>,
}

impl ModelRegistry {
    pub fn new(source: Arc<dyn ModelSource>, refresh_interval: Duration) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Vec::new())),
            source,
            refresh_interval,
            last_refresh: Mutex::new(None),
        }
    }

    /// Registry pre-seeded with models, for tests.
    pub fn with_models(models: Vec<Model>) -> Self {
        let registry = Self::new(
            Arc::new(StaticModelSource::new(models.clone())),
            Duration::from_secs(3600),
        );
        *registry.snapshot.write() = Arc::new(models);
        *registry.last_refresh.lock() = Some(Instant::now());
        registry
    }

    /// All active models whose `model_id` or `provider_model_id` equals the
    /// requested id.
    pub fn lookup_exact(&self, requested: &str) -> Vec<Model> {
        self.snapshot
            .read()
            .iter()
            .filter(|m| m.active && m.matches_id(requested))
            .cloned()
            .collect()
    }

    pub fn list_active(&self) -> Vec<Model> {
        self.snapshot
            .read()
            .iter()
            .filter(|m| m.active)
            .cloned()
            .collect()
    }

    /// Idempotent reload. On failure the prior snapshot stays published.
    pub async fn refresh(&self) -> Result<()> {
        match self.source.load().await {
            Ok(models) => {
                info!(count = models.len(), "model registry refreshed");
                *self.snapshot.write() = Arc::new(models);
                *self.last_refresh.lock() = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "model refresh failed, keeping previous snapshot");
                Err(e)
            }
        }
    }

    /// Refresh when the coarse TTL has elapsed. Concurrent callers may race
    /// to refresh; the source load is idempotent so the worst case is a
    /// duplicate read.
    pub async fn maybe_refresh(&self) {
        let due = {
            let last = self.last_refresh.lock();
            last.map(|t| t.elapsed() >= self.refresh_interval)
                .unwrap_or(true)
        };
        if due {
            let _ = self.refresh().await;
        }
    }
}
