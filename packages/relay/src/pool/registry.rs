// packages/relay/src/pool/registry.rs
//! One environment pool per installed bundle version
//!
//! Pools are created lazily on first use and keyed by bundle name and
//! version. A lookup for one version never touches another version's pool,
//! so a request resolved just before an upgrade cannot tear down the new
//! pool. Versions that are no longer installed are closed by [`retain`],
//! and their busy environments are terminated as workers release them.
//!
//! [`retain`]: PoolRegistry::retain

use crate::catalog::Bundle;
use crate::pool::{EnvironmentMaker, EnvironmentPool, PoolConfig, PooledEnvironment};
use crate::utils::errors::Result;
use dashmap::DashMap;
use semver::Version;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Supplies the environment maker for a bundle
pub trait MakerFactory<E>: Send + Sync {
    fn maker_for(&self, bundle: Arc<Bundle>) -> Arc<dyn EnvironmentMaker<E>>;
}

type PoolKey = (String, Version);

/// Pools keyed by bundle name and version
pub struct PoolRegistry<E> {
    pools: DashMap<PoolKey, Arc<EnvironmentPool<E>>>,
    config: PoolConfig,
    factory: Arc<dyn MakerFactory<E>>,
    /// Serializes pool construction so a version never gets two pools
    creating: Mutex<()>,
}

impl<E: PooledEnvironment> PoolRegistry<E> {
    pub fn new(config: PoolConfig, factory: Arc<dyn MakerFactory<E>>) -> Self {
        Self {
            pools: DashMap::new(),
            config,
            factory,
            creating: Mutex::new(()),
        }
    }

    /// Pool for this exact bundle version, building it on first use
    pub async fn pool_for(&self, bundle: &Arc<Bundle>) -> Result<Arc<EnvironmentPool<E>>> {
        let key = (bundle.name.clone(), bundle.version.clone());
        if let Some(pool) = self.pools.get(&key) {
            return Ok(pool.clone());
        }

        let _creating = self.creating.lock().await;
        if let Some(pool) = self.pools.get(&key) {
            return Ok(pool.clone());
        }

        let maker = self.factory.maker_for(bundle.clone());
        let pool = Arc::new(EnvironmentPool::new(bundle.name.clone(), self.config.clone(), maker).await?);
        self.pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Close and drop pools whose bundle version is no longer installed
    pub async fn retain(&self, installed: &HashMap<String, Version>) {
        let gone: Vec<PoolKey> = self
            .pools
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|(name, version)| installed.get(name) != Some(version))
            .collect();

        for key in gone {
            if let Some(((name, version), pool)) = self.pools.remove(&key) {
                match installed.get(&name) {
                    Some(current) => info!(
                        "Bundle {} moved from {} to {}, closing the old pool",
                        name, version, current
                    ),
                    None => info!("Bundle {} {} uninstalled, closing its pool", name, version),
                }
                pool.close().await;
            }
        }
    }

    /// Reap idle environments in every pool
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let pools: Vec<Arc<EnvironmentPool<E>>> = self.pools.iter().map(|entry| entry.value().clone()).collect();

        let mut reaped = 0;
        for pool in pools {
            reaped += pool.reap_idle(max_idle).await;
        }
        reaped
    }

    pub async fn close_all(&self) {
        let keys: Vec<PoolKey> = self.pools.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, pool)) = self.pools.remove(&key) {
                pool.close().await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::bundle;
    use crate::pool::test_support::{Counters, TestEnv, TestMaker};

    #[derive(Default)]
    struct TestFactory {
        counters: Arc<Counters>,
    }

    impl MakerFactory<TestEnv> for TestFactory {
        fn maker_for(&self, _bundle: Arc<Bundle>) -> Arc<dyn EnvironmentMaker<TestEnv>> {
            Arc::new(TestMaker {
                counters: self.counters.clone(),
                fail_after: None,
            })
        }
    }

    fn registry() -> (PoolRegistry<TestEnv>, Arc<Counters>) {
        let factory = TestFactory::default();
        let counters = factory.counters.clone();
        let config = PoolConfig {
            min: 1,
            max: 2,
            ..Default::default()
        };
        (PoolRegistry::new(config, Arc::new(factory)), counters)
    }

    #[tokio::test]
    async fn test_pool_reused_for_same_version() {
        let (registry, counters) = registry();
        let echo = Arc::new(bundle("echo", "1.0.0"));

        let a = registry.pool_for(&echo).await.unwrap();
        let b = registry.pool_for(&echo).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(counters.created(), 1);
    }

    #[tokio::test]
    async fn test_upgrade_closes_old_pool_on_retain() {
        let (registry, counters) = registry();
        let old = registry.pool_for(&Arc::new(bundle("echo", "1.0.0"))).await.unwrap();
        let busy = old.acquire().await.unwrap();

        let new = registry.pool_for(&Arc::new(bundle("echo", "1.1.0"))).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(registry.len(), 2);

        let installed: HashMap<String, Version> = [("echo".to_string(), Version::new(1, 1, 0))].into_iter().collect();
        registry.retain(&installed).await;
        assert_eq!(registry.len(), 1);
        assert!(old.stats().await.closed);
        assert!(!new.stats().await.closed);

        old.release(busy).await;
        assert_eq!(counters.terminated(), 1);
    }

    #[tokio::test]
    async fn test_stale_lookup_leaves_current_pool_alone() {
        let (registry, _counters) = registry();
        let current = registry.pool_for(&Arc::new(bundle("echo", "1.1.0"))).await.unwrap();

        // A worker that resolved the bundle before the upgrade
        let stale = registry.pool_for(&Arc::new(bundle("echo", "1.0.0"))).await.unwrap();
        assert!(!Arc::ptr_eq(&current, &stale));
        assert!(!current.stats().await.closed);

        let again = registry.pool_for(&Arc::new(bundle("echo", "1.1.0"))).await.unwrap();
        assert!(Arc::ptr_eq(&current, &again));
    }

    #[tokio::test]
    async fn test_retain_and_close_all() {
        let (registry, counters) = registry();
        registry.pool_for(&Arc::new(bundle("echo", "1.0.0"))).await.unwrap();
        registry.pool_for(&Arc::new(bundle("date", "1.0.0"))).await.unwrap();

        let installed: HashMap<String, Version> = [("date".to_string(), Version::new(1, 0, 0))].into_iter().collect();
        registry.retain(&installed).await;
        assert_eq!(registry.len(), 1);
        assert_eq!(counters.terminated(), 1);

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(counters.terminated(), 2);
    }
}
