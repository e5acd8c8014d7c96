/*
 * This file is part of the Tarhely Storage Engine.
 *
 * Copyright (C) 2025 Kovács Dávid <kapcsolat@kovacsdavid.dev>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::common::error::{RepositoryError, RepositoryResult};
use crate::common::keyed_mutex::KeyedMutex;
use crate::manager::app::config::AppConfig;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Options handed to [`PoolManager::get_pool`].
///
/// `db_url` is the DSN the pool should dial: the poolable DSN when the
/// tenant fronts its database with a session pooler (`is_external_pool`),
/// otherwise the direct database URL. `is_single_use` marks external pools
/// that must be discarded after a single request scope.
#[derive(Debug, Clone)]
pub struct GetPoolOptions {
    pub tenant_id: String,
    pub db_url: String,
    pub max_connections: u32,
    pub cluster_size: Option<u32>,
    pub is_external_pool: bool,
    pub is_single_use: bool,
}

/// Computes the per-instance pool ceiling.
///
/// Internal pools share the tenant's `max_connections` across the cluster
/// (`ceil(max / cluster_size)`, floor 1). Single-use external pools are
/// capped at one connection; other external pools use the tenant maximum
/// directly since the pooler multiplexes behind them.
pub fn pool_size(options: &GetPoolOptions) -> u32 {
    if options.is_external_pool {
        if options.is_single_use {
            return 1;
        }
        return options.max_connections.max(1);
    }
    let cluster_size = options.cluster_size.unwrap_or(1).max(1);
    options.max_connections.div_ceil(cluster_size).max(1)
}

/// Knobs a rebalance may change; unset fields keep their stored value.
#[derive(Debug, Clone, Copy, Default)]
pub struct RebalanceOptions {
    pub max_connections: Option<u32>,
    pub cluster_size: Option<u32>,
}

struct PoolEntry {
    pool: PgPool,
    options: GetPoolOptions,
    last_used_ms: AtomicU64,
}

/// Contract for the per-tenant connection pool registry.
///
/// One logical pool exists per tenant database. Pools are created lazily on
/// first acquire, expire after configured inactivity, and are destroyed on
/// explicit invalidation or rebalance. Destruction is asynchronous with
/// respect to the registry update: in-flight acquires on a just-evicted
/// pool complete against the old pool until it observes its own drain.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PoolManager: Send + Sync {
    /// Returns the pool registered for `options.tenant_id`, creating it on
    /// first use. Idempotent on the tenant id; concurrent first acquires
    /// coalesce onto a single connect.
    async fn get_pool(&self, options: GetPoolOptions) -> RepositoryResult<PgPool>;

    /// Drains and removes the tenant's pool. No-op when absent.
    async fn destroy(&self, tenant_id: &str);

    /// Swaps the tenant's pool for a new one sized by
    /// `ceil(max_connections / cluster_size)`; the old pool drains once
    /// outstanding acquires complete. No-op when the tenant has no pool.
    async fn rebalance(&self, tenant_id: &str, options: RebalanceOptions) -> RepositoryResult<()>;

    /// Destroys every registered pool. Called on shutdown.
    async fn stop(&self);
}

/// The production [`PoolManager`] backed by `sqlx` pools.
pub struct PgPoolManager {
    entries: RwLock<HashMap<String, PoolEntry>>,
    creation_mutex: KeyedMutex,
    acquire_timeout: Duration,
    free_after_inactivity: Duration,
    search_path: String,
    ssl_root_cert: Option<String>,
    started_at: Instant,
}

impl PgPoolManager {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            creation_mutex: KeyedMutex::new(),
            acquire_timeout: config.connection_timeout(),
            free_after_inactivity: config.free_pool_after_inactivity(),
            search_path: config.db_search_path().to_string(),
            ssl_root_cert: config.database_ssl_root_cert().map(str::to_string),
            started_at: Instant::now(),
        }
    }

    /// Spawns the reaper that destroys pools idle past the configured
    /// inactivity window and publishes pool counts as debug gauges.
    pub fn start_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let manager = self;
        let tick = manager.free_after_inactivity.max(Duration::from_secs(1)) / 2;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
                let now_ms = manager.now_ms();
                let expired = manager.collect_expired(now_ms);
                for tenant_id in expired {
                    info!("reaping inactive pool: tenant={tenant_id}");
                    manager.destroy(&tenant_id).await;
                }
                let entries = manager
                    .entries
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                debug!("pool gauge: registered={}", entries.len());
                for (tenant_id, entry) in entries.iter() {
                    debug!(
                        "pool gauge: tenant={tenant_id} size={} idle={}",
                        entry.pool.size(),
                        entry.pool.num_idle()
                    );
                }
            }
        });
    }

    fn now_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    fn collect_expired(&self, now_ms: u64) -> Vec<String> {
        let ttl_ms = self.free_after_inactivity.as_millis() as u64;
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .iter()
            .filter(|(_, entry)| {
                now_ms.saturating_sub(entry.last_used_ms.load(Ordering::Relaxed)) >= ttl_ms
            })
            .map(|(tenant_id, _)| tenant_id.clone())
            .collect()
    }

    fn lookup(&self, tenant_id: &str) -> Option<PgPool> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(tenant_id).map(|entry| {
            entry.last_used_ms.store(self.now_ms(), Ordering::Relaxed);
            entry.pool.clone()
        })
    }

    async fn create_pool(&self, options: &GetPoolOptions) -> RepositoryResult<PgPool> {
        let mut connect = PgConnectOptions::from_str(&options.db_url)?;
        if !options.is_external_pool {
            // External poolers do not preserve per-session options; their
            // search path is set inside each transaction instead.
            connect = connect.options([("search_path", self.search_path.as_str())]);
        }
        if let Some(cert) = &self.ssl_root_cert {
            connect = connect.ssl_root_cert(cert.as_str());
        }
        Ok(PgPoolOptions::new()
            .min_connections(0)
            .max_connections(pool_size(options))
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(Some(self.free_after_inactivity))
            .connect_with(connect)
            .await?)
    }

    fn insert_entry(&self, options: GetPoolOptions, pool: PgPool) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(
            options.tenant_id.clone(),
            PoolEntry {
                pool,
                options,
                last_used_ms: AtomicU64::new(self.now_ms()),
            },
        );
    }
}

#[async_trait]
impl PoolManager for PgPoolManager {
    async fn get_pool(&self, options: GetPoolOptions) -> RepositoryResult<PgPool> {
        if let Some(pool) = self.lookup(&options.tenant_id) {
            return Ok(pool);
        }
        let tenant_id = options.tenant_id.clone();
        self.creation_mutex
            .run(&tenant_id, async {
                if let Some(pool) = self.lookup(&options.tenant_id) {
                    return Ok(pool);
                }
                let pool = self.create_pool(&options).await?;
                self.insert_entry(options, pool.clone());
                Ok(pool)
            })
            .await
    }

    async fn destroy(&self, tenant_id: &str) {
        let removed = {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.remove(tenant_id)
        };
        if let Some(entry) = removed {
            // Close waits for checked-out connections to come back, so the
            // drain happens off the caller's path.
            tokio::spawn(async move {
                entry.pool.close().await;
            });
        }
    }

    async fn rebalance(&self, tenant_id: &str, rebalance: RebalanceOptions) -> RepositoryResult<()> {
        let options = {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match entries.get(tenant_id) {
                Some(entry) => {
                    let mut options = entry.options.clone();
                    if let Some(max_connections) = rebalance.max_connections {
                        options.max_connections = max_connections;
                    }
                    if let Some(cluster_size) = rebalance.cluster_size {
                        options.cluster_size = Some(cluster_size.max(1));
                    }
                    options
                }
                None => return Ok(()),
            }
        };

        let new_pool = self.create_pool(&options).await?;
        let old = {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.insert(
                tenant_id.to_string(),
                PoolEntry {
                    pool: new_pool,
                    options,
                    last_used_ms: AtomicU64::new(self.now_ms()),
                },
            )
        };
        if let Some(entry) = old {
            info!(
                "rebalancing pool: tenant={tenant_id} new_size={}",
                pool_size(&entry.options)
            );
            tokio::spawn(async move {
                entry.pool.close().await;
            });
        }
        Ok(())
    }

    async fn stop(&self) {
        let drained: Vec<PoolEntry> = {
            let mut entries = self
                .entries
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.pool.close().await;
        }
    }
}

/// Connects the control-plane (multitenant catalog) pool.
pub async fn connect_catalog_pool(config: &AppConfig) -> Result<PgPool, RepositoryError> {
    let url = config
        .multitenant_database_url()
        .or(config.database_url())
        .ok_or_else(|| RepositoryError::Custom("no catalog database url configured".to_string()))?;
    let mut connect = PgConnectOptions::from_str(url)?;
    if let Some(cert) = config.database_ssl_root_cert() {
        connect = connect.ssl_root_cert(cert);
    }
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections())
        .acquire_timeout(config.connection_timeout())
        .connect_with(connect)
        .await?;
    warn_if_single_connection(config.database_max_connections());
    Ok(pool)
}

fn warn_if_single_connection(max_connections: u32) {
    if max_connections <= 1 {
        warn!("catalog pool limited to a single connection, listener and queries will contend");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn options(max: u32, cluster: Option<u32>, external: bool, single_use: bool) -> GetPoolOptions {
        GetPoolOptions {
            tenant_id: "t1".to_string(),
            db_url: "postgresql://u:p@localhost:5432/t1".to_string(),
            max_connections: max,
            cluster_size: cluster,
            is_external_pool: external,
            is_single_use: single_use,
        }
    }

    #[test]
    fn internal_pool_size_divides_across_the_cluster() {
        assert_eq!(pool_size(&options(10, Some(4), false, false)), 3);
        assert_eq!(pool_size(&options(10, Some(1), false, false)), 10);
        assert_eq!(pool_size(&options(10, None, false, false)), 10);
    }

    #[test]
    fn pool_size_never_goes_below_one() {
        assert_eq!(pool_size(&options(1, Some(8), false, false)), 1);
        assert_eq!(pool_size(&options(0, Some(2), false, false)), 1);
    }

    #[test]
    fn single_use_external_pools_are_capped_at_one() {
        assert_eq!(pool_size(&options(50, Some(4), true, true)), 1);
    }

    #[test]
    fn recycled_external_pools_keep_the_tenant_maximum() {
        assert_eq!(pool_size(&options(50, Some(4), true, false)), 50);
    }

    #[tokio::test]
    async fn collect_expired_respects_the_inactivity_window() {
        let manager = PgPoolManager::new(&AppConfig::default());
        // No entries yet: nothing to reap regardless of clock.
        assert!(manager.collect_expired(u64::MAX).is_empty());
    }
}
