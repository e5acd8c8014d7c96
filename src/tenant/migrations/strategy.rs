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

//! Fleet-wide migration scheduling.
//!
//! `ON_REQUEST` migrates a tenant inline when traffic first reaches it.
//! `PROGRESSIVE` buffers tenant ids seen on live traffic and flushes them
//! to the queue on an interval or when the buffer fills. `FULL_FLEET` has
//! one instance take the catalog advisory lock and enqueue every lagging
//! tenant in cursor batches.

use crate::common::error::{StorageError, StorageResult};
use crate::manager::app::config::MigrationStrategy;
use crate::manager::queue::{EventHandler, Queue, QueueEvent, SendOptions, payload_tenant_id};
use crate::manager::tenants::repository::TenantsRepository;
use crate::manager::tenants::service::TenantCatalog;
use crate::tenant::migrations::engine::{
    FLEET_ADVISORY_LOCK_KEY, MigrationEngine, ResetMigrationOptions, TenantMigrationOptions,
};
use crate::tenant::migrations::latest_migration_name;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Tenants whose FAILED status is older than this become FAILED_STALE.
const FAILED_STABILIZATION_WINDOW: ChronoDuration = ChronoDuration::hours(6);

/// Delay applied when rescheduling a failed tenant in progressive mode.
const STALE_RETRY_DELAY: ChronoDuration = ChronoDuration::minutes(5);

const FLEET_BATCH_SIZE: i64 = 200;

/// Queue event: bring one tenant up to the local migration set.
pub struct RunTenantMigrationsEvent {
    pub tenant_id: String,
    pub start_after: Option<DateTime<Utc>>,
}

impl RunTenantMigrationsEvent {
    pub fn immediate(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            start_after: None,
        }
    }
}

impl QueueEvent for RunTenantMigrationsEvent {
    fn name(&self) -> &'static str {
        "run-tenant-migrations"
    }

    fn payload(&self) -> serde_json::Value {
        json!({"tenantId": self.tenant_id})
    }

    fn send_options(&self) -> SendOptions {
        SendOptions {
            singleton_key: Some(self.tenant_id.clone()),
            start_after: self.start_after,
            ..SendOptions::default()
        }
    }

    fn tenant_id(&self) -> Option<&str> {
        Some(&self.tenant_id)
    }
}

/// Runs tenant migrations and records the outcome on the tenant row.
pub struct TenantMigrationRunner {
    engine: Arc<MigrationEngine>,
    catalog: Arc<TenantCatalog>,
    repo: Arc<dyn TenantsRepository>,
    queue: Arc<Queue>,
    strategy: MigrationStrategy,
}

impl TenantMigrationRunner {
    pub fn new(
        engine: Arc<MigrationEngine>,
        catalog: Arc<TenantCatalog>,
        repo: Arc<dyn TenantsRepository>,
        queue: Arc<Queue>,
        strategy: MigrationStrategy,
    ) -> Self {
        Self {
            engine,
            catalog,
            repo,
            queue,
            strategy,
        }
    }

    /// Migrates one tenant and updates its catalog state. Failures mark
    /// the tenant FAILED; in progressive mode a delayed retry is queued.
    pub async fn run_on_tenant(&self, tenant_id: &str, wait_for_lock: bool) -> StorageResult<String> {
        let connection = self.catalog.get_connection(tenant_id).await?;
        let options = TenantMigrationOptions {
            tenant_id: Some(tenant_id.to_string()),
            wait_for_lock,
            up_to_migration: None,
        };
        match self
            .engine
            .run_migrations_on_tenant(connection.pool(), &options)
            .await
        {
            Ok(version) => {
                self.repo
                    .record_migration_success(tenant_id, &version)
                    .await
                    .map_err(StorageError::from_repository)?;
                if let Err(e) = self.catalog.publish_invalidation(tenant_id).await {
                    warn!("failed to publish post-migration invalidation: {e}");
                }
                Ok(version)
            }
            Err(e) => {
                if let Err(record_error) = self.repo.record_migration_failure(tenant_id).await {
                    warn!("failed to record migration failure: {record_error}");
                }
                if self.strategy == MigrationStrategy::Progressive {
                    let retry = RunTenantMigrationsEvent {
                        tenant_id: tenant_id.to_string(),
                        start_after: Some(Utc::now() + STALE_RETRY_DELAY),
                    };
                    if let Err(send_error) = self.queue.send(&retry).await {
                        warn!("failed to schedule migration retry: {send_error}");
                    }
                }
                Err(e)
            }
        }
    }

    /// Rolls a tenant back and records the resulting version.
    pub async fn reset_on_tenant(
        &self,
        tenant_id: &str,
        options: &ResetMigrationOptions,
    ) -> StorageResult<String> {
        let connection = self.catalog.get_connection(tenant_id).await?;
        let version = self.engine.reset_migration(connection.pool(), options).await?;
        self.repo
            .record_migration_success(tenant_id, &version)
            .await
            .map_err(StorageError::from_repository)?;
        if let Err(e) = self.catalog.publish_invalidation(tenant_id).await {
            warn!("failed to publish post-reset invalidation: {e}");
        }
        Ok(version)
    }
}

#[async_trait]
impl EventHandler for TenantMigrationRunner {
    async fn handle(&self, payload: serde_json::Value) -> StorageResult<()> {
        let tenant_id = payload_tenant_id(&payload)
            .ok_or_else(|| StorageError::Internal("payload missing tenantId".to_string()))?;
        let connection = self.catalog.get_connection(&tenant_id).await?;
        let options = TenantMigrationOptions {
            tenant_id: Some(tenant_id.to_string()),
            wait_for_lock: true,
            up_to_migration: None,
        };
        let _ = self
            .engine
            .run_migrations_on_tenant(connection.pool(), &options)
            .await;
        Ok(())
    }
}

/// In-process buffer backing the `PROGRESSIVE` strategy.
pub struct ProgressiveMigrations {
    queue: Arc<Queue>,
    buffer: Mutex<Vec<String>>,
    max_size: usize,
    interval: Duration,
}

impl ProgressiveMigrations {
    pub fn new(queue: Arc<Queue>, max_size: usize, interval: Duration) -> Self {
        Self {
            queue,
            buffer: Mutex::new(Vec::new()),
            max_size,
            interval,
        }
    }

    /// Records a tenant seen on live traffic; a full buffer flushes
    /// immediately.
    pub async fn watch(&self, tenant_id: &str) {
        let full = {
            let mut buffer = self
                .buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !buffer.iter().any(|buffered| buffered == tenant_id) {
                buffer.push(tenant_id.to_string());
            }
            buffer.len() >= self.max_size
        };
        if full {
            self.flush().await;
        }
    }

    /// Drains the buffer into one queue batch. Returns how many jobs were
    /// emitted.
    pub async fn flush(&self) -> usize {
        let drained: Vec<String> = {
            let mut buffer = self
                .buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return 0;
        }
        let events: Vec<RunTenantMigrationsEvent> = drained
            .into_iter()
            .map(RunTenantMigrationsEvent::immediate)
            .collect();
        let refs: Vec<&dyn QueueEvent> =
            events.iter().map(|event| event as &dyn QueueEvent).collect();
        match self.queue.batch_send(&refs).await {
            Ok(()) => events.len(),
            Err(e) => {
                warn!("progressive flush failed: {e}");
                0
            }
        }
    }

    /// Ticks the buffer on the configured interval; shutdown drains the
    /// remainder before exiting.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let progressive = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(progressive.interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        progressive.flush().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            let drained = progressive.flush().await;
                            info!("progressive buffer drained on shutdown: jobs={drained}");
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// `FULL_FLEET`: one instance takes the catalog advisory lock and walks
/// every lagging tenant in cursor order, enqueueing per-tenant jobs in
/// batches. Returns the number of jobs dispatched, or zero when another
/// instance holds the lock.
pub async fn run_full_fleet(
    pool: &PgPool,
    repo: Arc<dyn TenantsRepository>,
    queue: Arc<Queue>,
    signal: watch::Receiver<bool>,
) -> StorageResult<usize> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(crate::common::error::RepositoryError::from)
        .map_err(StorageError::from_repository)?;
    let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(FLEET_ADVISORY_LOCK_KEY)
        .fetch_one(&mut *conn)
        .await
        .map_err(crate::common::error::RepositoryError::from)
        .map_err(StorageError::from_repository)?;
    if !locked {
        info!("another instance is running the fleet migration sweep");
        return Ok(0);
    }

    let sweep = async {
        let target = latest_migration_name();
        let mut cursor = 0i64;
        let mut dispatched = 0usize;
        loop {
            if *signal.borrow() {
                return Err(StorageError::Aborted);
            }
            let batch = repo
                .list_to_migrate(target, FLEET_BATCH_SIZE, cursor)
                .await
                .map_err(StorageError::from_repository)?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.cursor_id;
            let events: Vec<RunTenantMigrationsEvent> = batch
                .into_iter()
                .map(|tenant| RunTenantMigrationsEvent::immediate(tenant.id))
                .collect();
            let refs: Vec<&dyn QueueEvent> =
                events.iter().map(|event| event as &dyn QueueEvent).collect();
            queue.batch_send(&refs).await?;
            dispatched += events.len();
        }
        Ok(dispatched)
    }
    .await;

    if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(FLEET_ADVISORY_LOCK_KEY)
        .execute(&mut *conn)
        .await
    {
        warn!("failed to release fleet advisory lock: {e}");
    }
    sweep
}

/// Dispatches the configured strategy's background work and the stale
/// failure reaper.
pub fn start_async_migrations(
    strategy: MigrationStrategy,
    catalog_pool: PgPool,
    repo: Arc<dyn TenantsRepository>,
    queue: Arc<Queue>,
    progressive: Arc<ProgressiveMigrations>,
    shutdown: watch::Receiver<bool>,
) {
    match strategy {
        MigrationStrategy::OnRequest => {
            info!("migration strategy ON_REQUEST: tenants migrate on first request");
        }
        MigrationStrategy::Progressive => {
            info!("migration strategy PROGRESSIVE: starting buffer ticker");
            progressive.start(shutdown.clone());
        }
        MigrationStrategy::FullFleet => {
            info!("migration strategy FULL_FLEET: starting fleet sweep");
            let pool = catalog_pool.clone();
            let repo = repo.clone();
            let queue = queue.clone();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                match run_full_fleet(&pool, repo, queue, signal).await {
                    Ok(dispatched) => info!("fleet sweep dispatched {dispatched} jobs"),
                    Err(e) => warn!("fleet sweep failed: {e}"),
                }
            });
        }
    }

    // FAILED rows age into FAILED_STALE after the stabilization window.
    let mut reaper_shutdown = shutdown;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match repo
                        .mark_stale_failures(Utc::now() - FAILED_STABILIZATION_WINDOW)
                        .await
                    {
                        Ok(0) => {}
                        Ok(marked) => info!("marked {marked} tenants FAILED_STALE"),
                        Err(e) => warn!("stale failure sweep failed: {e}"),
                    }
                }
                _ = reaper_shutdown.changed() => {
                    if *reaper_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::queue::MockQueueBackend;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_queue(expected_batches: Vec<usize>) -> (Arc<Queue>, Arc<AtomicUsize>) {
        let batches = Arc::new(AtomicUsize::new(0));
        let seen = batches.clone();
        let mut backend = MockQueueBackend::new();
        backend.expect_insert().returning(move |jobs| {
            let index = seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(jobs.len(), expected_batches[index]);
            assert!(jobs.iter().all(|job| job.name == "run-tenant-migrations"));
            Ok(())
        });
        (Arc::new(Queue::new(true, Some(Arc::new(backend)))), batches)
    }

    #[tokio::test]
    async fn buffer_flushes_when_it_reaches_max_size() {
        let (queue, batches) = counting_queue(vec![3, 1]);
        let progressive = ProgressiveMigrations::new(queue, 3, Duration::from_secs(60));

        progressive.watch("a").await;
        progressive.watch("b").await;
        // Duplicates never double-book a tenant.
        progressive.watch("b").await;
        assert_eq!(batches.load(Ordering::SeqCst), 0);
        progressive.watch("c").await;
        assert_eq!(batches.load(Ordering::SeqCst), 1);

        progressive.watch("d").await;
        assert_eq!(progressive.flush().await, 1);
        assert_eq!(batches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_drains_the_remaining_buffer() {
        let (queue, batches) = counting_queue(vec![1]);
        let progressive = Arc::new(ProgressiveMigrations::new(
            queue,
            10,
            Duration::from_secs(3600),
        ));
        progressive.watch("d").await;

        let (tx, rx) = watch::channel(false);
        progressive.start(rx);
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flush_of_empty_buffer_is_a_no_op() {
        let mut backend = MockQueueBackend::new();
        backend.expect_insert().never();
        let queue = Arc::new(Queue::new(true, Some(Arc::new(backend))));
        let progressive = ProgressiveMigrations::new(queue, 3, Duration::from_secs(60));
        assert_eq!(progressive.flush().await, 0);
    }

    #[test]
    fn run_event_carries_singleton_key_and_start_after() {
        let later = Utc::now() + STALE_RETRY_DELAY;
        let event = RunTenantMigrationsEvent {
            tenant_id: "t1".to_string(),
            start_after: Some(later),
        };
        let options = event.send_options();
        assert_eq!(options.singleton_key.as_deref(), Some("t1"));
        assert_eq!(options.start_after, Some(later));
        assert_eq!(event.payload()["tenantId"], "t1");
    }
}
