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

//! Durable, at-least-once job queue on top of the catalog database.
//!
//! Events are enqueued into `queue_jobs` and claimed with
//! `FOR UPDATE SKIP LOCKED` under a visibility timeout. Singleton keys
//! guarantee at most one non-terminal job per key; exhausted retries land
//! in the per-event dead-letter table. When the queue is disabled (or an
//! enqueue fails) events that allow it are executed inline so the system
//! keeps making forward progress.

pub mod event;
pub mod outbox;

use crate::common::error::{RepositoryResult, StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use event::{QueueEvent, QueueJob, SendOptions};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use sqlx::PgPool;
use sqlx::prelude::FromRow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queue creation policy. `ExactlyOnce` queues rely on singleton keys to
/// keep one non-terminal job per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    Standard,
    ExactlyOnce,
}

impl QueuePolicy {
    fn as_str(&self) -> &'static str {
        match self {
            QueuePolicy::Standard => "standard",
            QueuePolicy::ExactlyOnce => "exactly_once",
        }
    }
}

/// A job claimed by the worker, held under a visibility timeout.
#[derive(Debug, Clone, FromRow)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub name: String,
    pub data: serde_json::Value,
    pub retry_count: i32,
    pub retry_limit: i32,
}

/// The pluggable DB-backed queue store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn create_queue(&self, name: &str, policy: QueuePolicy) -> RepositoryResult<()>;
    /// Returns `None` when a singleton key deduplicated the job.
    async fn send(&self, job: QueueJob) -> RepositoryResult<Option<Uuid>>;
    /// Single multi-insert for a batch of jobs.
    async fn insert(&self, jobs: Vec<QueueJob>) -> RepositoryResult<()>;
    async fn fetch(
        &self,
        batch_size: i64,
        visibility: Duration,
    ) -> RepositoryResult<Vec<ClaimedJob>>;
    async fn complete(&self, id: Uuid) -> RepositoryResult<()>;
    /// Re-schedules the job or moves it to the dead-letter table once the
    /// retry limit is exhausted.
    async fn fail(&self, id: Uuid, error: &str) -> RepositoryResult<()>;
    /// Terminal-state housekeeping: drops completed jobs older than the
    /// retention window and dead-letters expired ones.
    async fn purge(&self, retention: Duration) -> RepositoryResult<u64>;
}

pub struct PgQueueBackend {
    pool: PgPool,
}

impl PgQueueBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueBackend for PgQueueBackend {
    async fn create_queue(&self, name: &str, policy: QueuePolicy) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_queues (name, policy)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(policy.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn send(&self, job: QueueJob) -> RepositoryResult<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO queue_jobs (
                name, data, singleton_key, priority, retry_limit, retry_delay,
                start_after, expire_at
            )
            VALUES (
                $1, $2, $3, COALESCE($4, 0), $5, $6,
                COALESCE($7, now()), now() + ($8 * interval '1 hour')
            )
            ON CONFLICT (name, singleton_key)
                WHERE state IN ('created', 'active', 'retry') DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&job.name)
        .bind(&job.data)
        .bind(&job.options.singleton_key)
        .bind(job.options.priority)
        .bind(job.options.retry_limit)
        .bind(job.options.retry_delay)
        .bind(job.options.start_after)
        .bind(job.options.expire_in_hours)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn insert(&self, jobs: Vec<QueueJob>) -> RepositoryResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut names = Vec::with_capacity(jobs.len());
        let mut data = Vec::with_capacity(jobs.len());
        let mut singleton_keys = Vec::with_capacity(jobs.len());
        let mut priorities = Vec::with_capacity(jobs.len());
        let mut retry_limits = Vec::with_capacity(jobs.len());
        let mut retry_delays = Vec::with_capacity(jobs.len());
        let mut start_afters: Vec<Option<DateTime<Utc>>> = Vec::with_capacity(jobs.len());
        let mut expire_hours = Vec::with_capacity(jobs.len());
        for job in jobs {
            names.push(job.name.clone());
            data.push(job.data.clone());
            singleton_keys.push(job.options.singleton_key.clone());
            priorities.push(job.options.priority.unwrap_or(0));
            retry_limits.push(job.options.retry_limit);
            retry_delays.push(job.options.retry_delay);
            start_afters.push(job.options.start_after);
            expire_hours.push(job.options.expire_in_hours);
        }
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (
                name, data, singleton_key, priority, retry_limit, retry_delay,
                start_after, expire_at
            )
            SELECT
                name, data, singleton_key, priority, retry_limit, retry_delay,
                COALESCE(start_after, now()), now() + (expire_hours * interval '1 hour')
            FROM UNNEST(
                $1::text[], $2::jsonb[], $3::text[], $4::int[], $5::int[],
                $6::bigint[], $7::timestamptz[], $8::bigint[]
            ) AS jobs(
                name, data, singleton_key, priority, retry_limit, retry_delay,
                start_after, expire_hours
            )
            ON CONFLICT (name, singleton_key)
                WHERE state IN ('created', 'active', 'retry') DO NOTHING
            "#,
        )
        .bind(names)
        .bind(data)
        .bind(singleton_keys)
        .bind(priorities)
        .bind(retry_limits)
        .bind(retry_delays)
        .bind(start_afters)
        .bind(expire_hours)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        batch_size: i64,
        visibility: Duration,
    ) -> RepositoryResult<Vec<ClaimedJob>> {
        Ok(sqlx::query_as::<_, ClaimedJob>(
            r#"
            WITH next AS (
                SELECT id
                FROM queue_jobs
                WHERE state IN ('created', 'retry')
                    AND start_after <= now()
                    AND visible_at <= now()
                ORDER BY priority DESC, created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs jobs
            SET state = 'active',
                visible_at = now() + ($2 * interval '1 second')
            FROM next
            WHERE jobs.id = next.id
            RETURNING jobs.id, jobs.name, jobs.data, jobs.retry_count, jobs.retry_limit
            "#,
        )
        .bind(batch_size)
        .bind(visibility.as_secs() as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn complete(&self, id: Uuid) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'completed', completed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await?;
        let moved: Option<(Uuid,)> = sqlx::query_as(
            r#"
            WITH exhausted AS (
                DELETE FROM queue_jobs
                WHERE id = $1 AND retry_count + 1 > retry_limit
                RETURNING *
            )
            INSERT INTO queue_jobs_dead (id, queue, name, data, error)
            SELECT id, name || '-dead', name, data, $2
            FROM exhausted
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&mut *tx)
        .await?;
        if moved.is_none() {
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET state = 'retry',
                    retry_count = retry_count + 1,
                    visible_at = now() + (retry_delay * interval '1 second')
                WHERE id = $1
                "#,
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn purge(&self, retention: Duration) -> RepositoryResult<u64> {
        sqlx::query(
            r#"
            WITH expired AS (
                DELETE FROM queue_jobs
                WHERE state IN ('created', 'retry') AND expire_at < now()
                RETURNING *
            )
            INSERT INTO queue_jobs_dead (id, queue, name, data, error)
            SELECT id, name || '-dead', name, data, 'expired'
            FROM expired
            "#,
        )
        .execute(&self.pool)
        .await?;
        let purged = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE state = 'completed' AND completed_at < now() - ($1 * interval '1 second')
            "#,
        )
        .bind(retention.as_secs() as i64)
        .execute(&self.pool)
        .await?;
        Ok(purged.rows_affected())
    }
}

/// Handles one event type. Handlers are registered on [`Queue`] at startup
/// and invoked both by the worker and by inline dispatch.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> StorageResult<()>;
}

/// The queue facade the rest of the system talks to.
pub struct Queue {
    enabled: bool,
    backend: Option<Arc<dyn QueueBackend>>,
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
    scheduled: AtomicU64,
}

impl Queue {
    pub fn new(enabled: bool, backend: Option<Arc<dyn QueueBackend>>) -> Self {
        Self {
            enabled: enabled && backend.is_some(),
            backend,
            handlers: RwLock::new(HashMap::new()),
            scheduled: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn EventHandler>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(name.to_string(), handler);
    }

    pub fn scheduled_count(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    /// Whether the event should be dispatched at all, given the tenant's
    /// disabled-event list. Single-tenant deployments never disable events.
    pub fn should_send(event_name: &str, disabled_events: &[String]) -> bool {
        !disabled_events.iter().any(|disabled| disabled == event_name)
    }

    /// Enqueues the event. With the queue disabled, events that allow it
    /// run inline and the rest are dropped with a warning. An enqueue
    /// failure also falls back to inline execution.
    pub async fn send(&self, event: &dyn QueueEvent) -> StorageResult<()> {
        if !self.enabled {
            if event.allow_sync() {
                return self.invoke(event).await;
            }
            warn!("queue disabled, dropping event: name={}", event.name());
            return Ok(());
        }
        let job = QueueJob::from_event(event);
        let backend = self.backend.as_ref().expect("enabled queue has a backend");
        let started = Instant::now();
        match backend.send(job).await {
            Ok(_) => {
                self.scheduled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "event scheduled: name={} elapsed_ms={}",
                    event.name(),
                    started.elapsed().as_millis()
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "enqueue failed, executing inline: name={} error={e}",
                    event.name()
                );
                self.invoke(event).await
            }
        }
    }

    /// One multi-insert for the whole batch.
    pub async fn batch_send(&self, events: &[&dyn QueueEvent]) -> StorageResult<()> {
        if !self.enabled {
            for event in events {
                self.send(*event).await?;
            }
            return Ok(());
        }
        let jobs: Vec<QueueJob> = events.iter().map(|event| QueueJob::from_event(*event)).collect();
        let count = jobs.len() as u64;
        let backend = self.backend.as_ref().expect("enabled queue has a backend");
        backend
            .insert(jobs)
            .await
            .map_err(StorageError::from_repository)?;
        self.scheduled.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// Executes the handler inline, bypassing the queue. Rejected for
    /// events that declare `allow_sync = false`.
    pub async fn invoke(&self, event: &dyn QueueEvent) -> StorageResult<()> {
        if !event.allow_sync() {
            return Err(StorageError::Internal(format!(
                "event '{}' cannot be invoked synchronously",
                event.name()
            )));
        }
        let handler = self.handler_for(event.name()).ok_or_else(|| {
            StorageError::Internal(format!("no handler registered for event '{}'", event.name()))
        })?;
        handler.handle(event::stamped_payload(event)).await
    }

    /// Sends an already-shaped job; used by the outbox dispatcher. With the
    /// queue disabled the registered handler runs inline.
    pub async fn send_raw(&self, job: QueueJob) -> StorageResult<()> {
        if !self.enabled {
            let handler = self.handler_for(&job.name).ok_or_else(|| {
                StorageError::Internal(format!("no handler registered for event '{}'", job.name))
            })?;
            return handler.handle(job.data).await;
        }
        let backend = self.backend.as_ref().expect("enabled queue has a backend");
        backend
            .send(job)
            .await
            .map_err(StorageError::from_repository)?;
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Inline first; on failure the event is enqueued for a retry.
    pub async fn invoke_or_send(&self, event: &dyn QueueEvent) -> StorageResult<()> {
        match self.invoke(event).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "inline invocation failed, enqueueing: name={} error={e}",
                    event.name()
                );
                self.send(event).await
            }
        }
    }

    fn handler_for(&self, name: &str) -> Option<Arc<dyn EventHandler>> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.get(name).cloned()
    }

    /// The worker loop. Claims jobs under a visibility timeout and
    /// dispatches them to the registered handlers; terminal housekeeping
    /// runs once per tick.
    pub fn start_worker(
        self: Arc<Self>,
        retention: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if !self.enabled {
            return;
        }
        let queue = self;
        tokio::spawn(async move {
            const BATCH_SIZE: i64 = 20;
            const VISIBILITY: Duration = Duration::from_secs(30);
            {
                // Register the queue and its dead-letter twin for every
                // handled event; singleton-keyed events are exactly-once.
                let backend = queue.backend.as_ref().expect("enabled queue has a backend");
                let names: Vec<String> = {
                    let handlers = queue
                        .handlers
                        .read()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    handlers.keys().cloned().collect()
                };
                for name in names {
                    if let Err(e) = backend.create_queue(&name, QueuePolicy::ExactlyOnce).await {
                        warn!("failed to register queue: name={name} error={e}");
                    }
                    let dead = format!("{name}-dead");
                    if let Err(e) = backend.create_queue(&dead, QueuePolicy::Standard).await {
                        warn!("failed to register dead-letter queue: name={dead} error={e}");
                    }
                }
            }
            let mut interval = tokio::time::interval(Duration::from_secs(2));
            info!("queue worker started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("queue worker stopping");
                            return;
                        }
                    }
                }
                let backend = queue.backend.as_ref().expect("enabled queue has a backend");
                let claimed = match backend.fetch(BATCH_SIZE, VISIBILITY).await {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        warn!("queue fetch failed: {e}");
                        continue;
                    }
                };
                for job in claimed {
                    if *shutdown.borrow() {
                        return;
                    }
                    let outcome = match queue.handler_for(&job.name) {
                        Some(handler) => handler.handle(job.data.clone()).await,
                        None => Err(StorageError::Internal(format!(
                            "no handler registered for event '{}'",
                            job.name
                        ))),
                    };
                    let result = match outcome {
                        Ok(()) => backend.complete(job.id).await,
                        Err(e) => {
                            warn!(
                                "job failed: name={} id={} attempt={} error={e}",
                                job.name,
                                job.id,
                                job.retry_count + 1
                            );
                            backend.fail(job.id, &e.to_string()).await
                        }
                    };
                    if let Err(e) = result {
                        warn!("job bookkeeping failed: id={} error={e}", job.id);
                    }
                }
                if let Err(e) = backend.purge(retention).await {
                    warn!("queue purge failed: {e}");
                }
            }
        });
    }
}

#[derive(Debug, Deserialize)]
struct TenantScopedPayload {
    #[serde(rename = "tenantId")]
    tenant_id: Option<String>,
}

/// Pulls the tenant id out of a stamped payload, for handlers that need it.
pub fn payload_tenant_id(payload: &serde_json::Value) -> Option<String> {
    serde_json::from_value::<TenantScopedPayload>(payload.clone())
        .ok()
        .and_then(|parsed| parsed.tenant_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct InlineEvent {
        allow_sync: bool,
    }

    impl QueueEvent for InlineEvent {
        fn name(&self) -> &'static str {
            "inline-event"
        }
        fn allow_sync(&self) -> bool {
            self.allow_sync
        }
        fn payload(&self) -> serde_json::Value {
            json!({"tenantId": "t1"})
        }
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail_first: AtomicU64,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _payload: serde_json::Value) -> StorageResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(StorageError::Internal("induced".to_string()));
            }
            Ok(())
        }
    }

    fn queue_with_handler(
        enabled: bool,
        backend: Option<Arc<dyn QueueBackend>>,
        fail_first: u64,
    ) -> (Arc<Queue>, Arc<AtomicUsize>) {
        let queue = Arc::new(Queue::new(enabled, backend));
        let calls = Arc::new(AtomicUsize::new(0));
        queue.register_handler(
            "inline-event",
            Arc::new(CountingHandler {
                calls: calls.clone(),
                fail_first: AtomicU64::new(fail_first),
            }),
        );
        (queue, calls)
    }

    #[tokio::test]
    async fn disabled_queue_executes_allow_sync_events_inline() {
        let (queue, calls) = queue_with_handler(false, None, 0);
        queue.send(&InlineEvent { allow_sync: true }).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_queue_drops_async_only_events() {
        let (queue, calls) = queue_with_handler(false, None, 0);
        queue
            .send(&InlineEvent { allow_sync: false })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invoke_rejects_async_only_events() {
        let (queue, _) = queue_with_handler(false, None, 0);
        assert!(queue.invoke(&InlineEvent { allow_sync: false }).await.is_err());
    }

    #[tokio::test]
    async fn enqueue_failure_falls_back_to_inline_execution() {
        let mut backend = MockQueueBackend::new();
        backend.expect_send().returning(|_| {
            Err(crate::common::error::RepositoryError::Custom(
                "insert failed".to_string(),
            ))
        });
        let (queue, calls) = queue_with_handler(true, Some(Arc::new(backend)), 0);
        queue.send(&InlineEvent { allow_sync: true }).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn successful_enqueue_counts_scheduled_jobs() {
        let mut backend = MockQueueBackend::new();
        backend
            .expect_send()
            .returning(|_| Ok(Some(Uuid::new_v4())));
        let (queue, calls) = queue_with_handler(true, Some(Arc::new(backend)), 0);
        queue.send(&InlineEvent { allow_sync: true }).await.unwrap();
        assert_eq!(queue.scheduled_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invoke_or_send_enqueues_after_inline_failure() {
        let mut backend = MockQueueBackend::new();
        backend
            .expect_send()
            .times(1)
            .returning(|_| Ok(Some(Uuid::new_v4())));
        let (queue, calls) = queue_with_handler(true, Some(Arc::new(backend)), 1);
        queue
            .invoke_or_send(&InlineEvent { allow_sync: true })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.scheduled_count(), 1);
    }

    #[test]
    fn should_send_consults_the_disabled_list() {
        let disabled = vec!["webhook".to_string()];
        assert!(!Queue::should_send("webhook", &disabled));
        assert!(Queue::should_send("inline-event", &disabled));
    }

    #[test]
    fn payload_tenant_id_reads_the_stamped_payload() {
        assert_eq!(
            payload_tenant_id(&json!({"tenantId": "t9", "$version": "v1"})),
            Some("t9".to_string())
        );
        assert_eq!(payload_tenant_id(&json!({"other": 1})), None);
    }
}
