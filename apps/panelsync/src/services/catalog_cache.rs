use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use panelsync_db::repositories::catalog_repo::CatalogRepository;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::PricingSettings;
use crate::services::pricing_service::PriceCatalog;

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn load_catalog(&self) -> Result<PriceCatalog>;
}

pub struct PgCatalogSource {
    repo: CatalogRepository,
    settings: PricingSettings,
}

impl PgCatalogSource {
    pub fn new(pool: PgPool, settings: PricingSettings) -> Self {
        Self {
            repo: CatalogRepository::new(pool),
            settings,
        }
    }
}

#[async_trait]
impl CatalogSource for PgCatalogSource {
    async fn load_catalog(&self) -> Result<PriceCatalog> {
        let periods = self.repo.period_prices().await?;
        let packages = self.repo.traffic_packages().await?;
        let servers = self.repo.server_group_prices().await?;
        Ok(PriceCatalog::from_parts(
            periods,
            packages,
            servers,
            &self.settings,
        ))
    }
}

/// Shared price catalog snapshot.
///
/// A snapshot handed out by [`CatalogCache::get`] is at most `ttl` old.
/// Admin edits become visible after `invalidate()` or once the TTL passes.
pub struct CatalogCache<L: CatalogSource> {
    source: L,
    ttl: Duration,
    slot: RwLock<Option<(Arc<PriceCatalog>, Instant)>>,
}

impl<L: CatalogSource> CatalogCache<L> {
    pub fn new(source: L, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            slot: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Result<Arc<PriceCatalog>> {
        {
            let slot = self.slot.read().await;
            if let Some((catalog, loaded_at)) = slot.as_ref() {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(catalog.clone());
                }
            }
        }
        self.refresh().await
    }

    pub async fn refresh(&self) -> Result<Arc<PriceCatalog>> {
        let catalog = Arc::new(
            self.source
                .load_catalog()
                .await
                .context("Failed to load price catalog")?,
        );
        *self.slot.write().await = Some((catalog.clone(), Instant::now()));
        info!(
            "Price catalog loaded: {} periods, {} traffic packages, {} server groups",
            catalog.period_prices.len(),
            catalog.traffic_packages.len(),
            catalog.server_prices.len()
        );
        Ok(catalog)
    }

    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl CatalogSource for CountingSource {
        async fn load_catalog(&self) -> Result<PriceCatalog> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst) as i64;
            Ok(PriceCatalog {
                period_prices: BTreeMap::from([(30, 10_000 + n)]),
                ..PriceCatalog::default()
            })
        }
    }

    fn source() -> CountingSource {
        CountingSource {
            loads: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn snapshot_is_reused_within_ttl() {
        let cache = CatalogCache::new(source(), Duration::from_secs(300));

        let first = cache.get().await.unwrap();
        let second = cache.get().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let cache = CatalogCache::new(source(), Duration::from_secs(300));
        cache.get().await.unwrap();

        cache.invalidate().await;
        let reloaded = cache.get().await.unwrap();

        assert_eq!(reloaded.period_prices[&30], 10_001);
        assert_eq!(cache.source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_snapshot_is_reloaded() {
        let cache = CatalogCache::new(source(), Duration::ZERO);
        cache.get().await.unwrap();
        cache.get().await.unwrap();
        assert_eq!(cache.source.loads.load(Ordering::SeqCst), 2);

        let eager = cache.refresh().await.unwrap();
        assert_eq!(eager.period_prices[&30], 10_002);
    }
}
