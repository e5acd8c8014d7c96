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

use crate::common::crypto::EncryptionKey;
use crate::manager::app::config::AppConfig;
use crate::manager::app::database::{PgPoolManager, PoolManager, connect_catalog_pool};
use crate::manager::app::pubsub::{PgPubSub, PubSubAdapter};
use crate::manager::jwks::repository::PgJwksRepository;
use crate::manager::jwks::service::{
    GenerateUrlSigningJwkHandler, JwksManager, UrlSigningJwkGenerator,
};
use crate::manager::queue::outbox::OutboxDispatcher;
use crate::manager::queue::{PgQueueBackend, Queue};
use crate::manager::s3_credentials::repository::PgS3CredentialsRepository;
use crate::manager::s3_credentials::service::S3CredentialsManager;
use crate::manager::shards::service::{PgShardCatalog, ShardCatalog, SingleShard};
use crate::manager::tenants::repository::{PgTenantsRepository, TenantsRepository};
use crate::manager::tenants::service::TenantCatalog;
use crate::tenant::migrations::engine::MigrationEngine;
use crate::tenant::migrations::strategy::{
    ProgressiveMigrations, TenantMigrationRunner, start_async_migrations,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

pub mod crypto;
pub mod dto;
pub mod error;
pub mod keyed_mutex;
pub mod services;

pub trait ConfigProvider: Send + Sync {
    fn config(&self) -> Arc<AppConfig>;
}

/// Process-wide state. Construction follows the dependency order:
/// config, catalog pool, pub/sub, pool manager, repositories, JWKS
/// manager, tenant catalog, S3 credentials, queue, shard ledger,
/// migration engine and strategy driver.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub catalog_pool: PgPool,
    pub pool_manager: Arc<PgPoolManager>,
    pub pubsub: Arc<dyn PubSubAdapter>,
    pub tenants_repo: Arc<dyn TenantsRepository>,
    pub catalog: Arc<TenantCatalog>,
    pub jwks_manager: Arc<JwksManager>,
    pub url_signing_generator: Arc<UrlSigningJwkGenerator>,
    pub s3_credentials: Arc<S3CredentialsManager>,
    pub queue: Arc<Queue>,
    pub shard_catalog: Arc<dyn ShardCatalog>,
    pub migration_engine: Arc<MigrationEngine>,
    pub migration_runner: Arc<TenantMigrationRunner>,
    pub progressive: Arc<ProgressiveMigrations>,
    pub outbox: Arc<OutboxDispatcher>,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub async fn new(
        config: Arc<AppConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<AppState> {
        let encryption_key = EncryptionKey::derive(config.encryption_key().unwrap_or_default());
        let catalog_pool = connect_catalog_pool(&config).await?;
        let pubsub: Arc<dyn PubSubAdapter> = Arc::new(PgPubSub::new(catalog_pool.clone()));
        let pool_manager = Arc::new(PgPoolManager::new(&config));

        let tenants_repo: Arc<dyn TenantsRepository> = Arc::new(PgTenantsRepository::new(
            catalog_pool.clone(),
            encryption_key.clone(),
        ));
        let jwks_manager = Arc::new(JwksManager::new(
            Arc::new(PgJwksRepository::new(
                catalog_pool.clone(),
                encryption_key.clone(),
            )),
            pubsub.clone(),
        ));
        let catalog = Arc::new(TenantCatalog::new(
            config.clone(),
            tenants_repo.clone(),
            pool_manager.clone(),
            pubsub.clone(),
            jwks_manager.clone(),
        )?);
        let s3_credentials = Arc::new(S3CredentialsManager::new(
            Arc::new(PgS3CredentialsRepository::new(
                catalog_pool.clone(),
                encryption_key.clone(),
            )),
            pubsub.clone(),
        ));

        let queue_pool = match config.pg_queue_connection_url() {
            Some(url) => {
                let options = sqlx::postgres::PgConnectOptions::from_str(url)?
                    .application_name(config.pg_queue_application_name());
                PgPoolOptions::new()
                    .max_connections(config.database_max_connections())
                    .acquire_timeout(config.connection_timeout())
                    .connect_with(options)
                    .await?
            }
            None => catalog_pool.clone(),
        };
        let queue = Arc::new(Queue::new(
            config.pg_queue_enable(),
            Some(Arc::new(PgQueueBackend::new(queue_pool.clone()))),
        ));
        let outbox = Arc::new(OutboxDispatcher::new(
            catalog_pool.clone(),
            queue.clone(),
            config
                .encryption_key()
                .unwrap_or_default()
                .as_bytes()
                .to_vec(),
        ));

        let shard_catalog: Arc<dyn ShardCatalog> = if config.is_multitenant() {
            Arc::new(PgShardCatalog::new(catalog_pool.clone()))
        } else {
            Arc::new(SingleShard)
        };

        let strategy = config
            .migration_strategy()
            .map_err(anyhow::Error::msg)?;
        let migration_engine = Arc::new(MigrationEngine::new(&config));
        let migration_runner = Arc::new(TenantMigrationRunner::new(
            migration_engine.clone(),
            catalog.clone(),
            tenants_repo.clone(),
            queue.clone(),
            strategy,
        ));
        let progressive = Arc::new(ProgressiveMigrations::new(
            queue.clone(),
            config.progressive_max_size(),
            config.progressive_interval(),
        ));

        Ok(AppState {
            config,
            catalog_pool,
            pool_manager,
            pubsub,
            tenants_repo,
            catalog,
            url_signing_generator: Arc::new(UrlSigningJwkGenerator::new(
                jwks_manager.clone(),
                queue.clone(),
            )),
            jwks_manager,
            s3_credentials,
            queue,
            shard_catalog,
            migration_engine,
            migration_runner,
            progressive,
            outbox,
            shutdown,
        })
    }

    /// Queue handlers are registered before the worker starts so inline
    /// fallbacks work from the first request.
    pub fn register_event_handlers(&self) {
        self.queue
            .register_handler("run-tenant-migrations", self.migration_runner.clone());
        self.queue.register_handler(
            "jwks-generate-url-signing-key",
            Arc::new(GenerateUrlSigningJwkHandler::new(self.jwks_manager.clone())),
        );
    }

    /// Cache-eviction handlers must be subscribed before the listener
    /// connects; late subscriptions would miss notifications.
    pub fn subscribe_invalidations(&self) {
        self.catalog.clone().listen_for_tenant_update();
        self.jwks_manager.clone().listen_for_jwks_update();
        self.s3_credentials.clone().listen_for_credential_update();
    }

    pub fn start_background_tasks(&self) {
        self.pubsub.start(self.shutdown.clone());
        self.pool_manager.clone().start_reaper(self.shutdown.clone());
        self.queue.clone().start_worker(
            Duration::from_secs(u64::from(self.config.pg_queue_retention_hours()) * 3600),
            self.shutdown.clone(),
        );
        if self.config.is_multitenant() {
            start_async_migrations(
                self.config
                    .migration_strategy()
                    .expect("strategy validated at startup"),
                self.catalog_pool.clone(),
                self.tenants_repo.clone(),
                self.queue.clone(),
                self.progressive.clone(),
                self.shutdown.clone(),
            );
            self.start_outbox_dispatcher();
            self.start_lease_expiry_sweep();
        }
    }

    fn start_lease_expiry_sweep(&self) {
        let ledger = self.shard_catalog.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match ledger.expire_leases().await {
                            Ok(0) => {}
                            Ok(expired) => {
                                tracing::info!("expired {expired} stale shard reservations");
                            }
                            Err(e) => warn!("lease expiry sweep failed: {e}"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn start_outbox_dispatcher(&self) {
        let outbox = self.outbox.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = outbox.dispatch_once().await {
                            warn!("outbox dispatch failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Final teardown once the HTTP server has drained.
    pub async fn stop(&self) {
        self.pubsub.close().await;
        self.pool_manager.stop().await;
        self.catalog_pool.close().await;
    }
}

impl ConfigProvider for AppState {
    fn config(&self) -> Arc<AppConfig> {
        self.config.clone()
    }
}
