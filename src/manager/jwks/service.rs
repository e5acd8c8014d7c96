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

use crate::common::error::{StorageError, StorageResult};
use crate::common::keyed_mutex::KeyedMutex;
use crate::manager::app::pubsub::{CHANNEL_TENANTS_JWKS_UPDATE, PubSubAdapter};
use crate::manager::jwks::model::{
    JwksTenantConfig, URL_SIGNING_KIND, generate_hs512_jwk, valid_kind,
};
use crate::manager::jwks::repository::JwksRepository;
use crate::manager::queue::{EventHandler, Queue, QueueEvent, SendOptions, payload_tenant_id};
use crate::manager::tenants::dto::TenantCursor;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Read-side view of per-tenant JWKS material, consumed by the tenant
/// catalog when assembling JWT verification config.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JwksProvider: Send + Sync {
    async fn jwks_config(&self, tenant_id: &str) -> StorageResult<Arc<JwksTenantConfig>>;
}

pub struct JwksManager {
    repo: Arc<dyn JwksRepository>,
    pubsub: Arc<dyn PubSubAdapter>,
    cache: RwLock<HashMap<String, Arc<JwksTenantConfig>>>,
    keyed_mutex: KeyedMutex,
}

impl JwksManager {
    pub fn new(repo: Arc<dyn JwksRepository>, pubsub: Arc<dyn PubSubAdapter>) -> Self {
        Self {
            repo,
            pubsub,
            cache: RwLock::new(HashMap::new()),
            keyed_mutex: KeyedMutex::new(),
        }
    }

    /// Registers the cache-eviction handler on `tenants_jwks_update`.
    pub fn listen_for_jwks_update(self: Arc<Self>) {
        let manager = self.clone();
        self.pubsub.subscribe(
            CHANNEL_TENANTS_JWKS_UPDATE,
            Arc::new(move |tenant_id: String| {
                manager.invalidate(&tenant_id);
            }),
        );
    }

    pub fn invalidate(&self, tenant_id: &str) {
        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.remove(tenant_id);
    }

    fn cached(&self, tenant_id: &str) -> Option<Arc<JwksTenantConfig>> {
        let cache = self
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.get(tenant_id).cloned()
    }

    pub async fn get_jwks_tenant_config(
        &self,
        tenant_id: &str,
    ) -> StorageResult<Arc<JwksTenantConfig>> {
        if let Some(config) = self.cached(tenant_id) {
            return Ok(config);
        }
        self.keyed_mutex
            .run(tenant_id, async {
                if let Some(config) = self.cached(tenant_id) {
                    return Ok(config);
                }
                let keys = self
                    .repo
                    .list_active(tenant_id)
                    .await
                    .map_err(StorageError::from_repository)?;
                let url_signing_key = keys
                    .iter()
                    .find(|item| item.kind == URL_SIGNING_KIND)
                    .map(|item| item.jwk.clone());
                let config = Arc::new(JwksTenantConfig {
                    keys,
                    url_signing_key,
                });
                let mut cache = self
                    .cache
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                cache.insert(tenant_id.to_string(), config.clone());
                Ok(config)
            })
            .await
    }

    /// Stores an admin-supplied JWK. The url-signing kind is reserved for
    /// the generator.
    pub async fn add_jwk(
        &self,
        tenant_id: &str,
        content: &serde_json::Value,
        kind: &str,
    ) -> StorageResult<Uuid> {
        if !valid_kind(kind) {
            return Err(StorageError::InvalidRequest(format!(
                "invalid jwk kind: '{kind}'"
            )));
        }
        if kind == URL_SIGNING_KIND {
            return Err(StorageError::InvalidRequest(format!(
                "kind '{URL_SIGNING_KIND}' is reserved"
            )));
        }
        let id = self
            .repo
            .insert(tenant_id, content, kind, false)
            .await
            .map_err(StorageError::from_repository)?;
        self.publish_update(tenant_id).await;
        Ok(id)
    }

    pub async fn toggle_active(
        &self,
        tenant_id: &str,
        id: Uuid,
        new_state: bool,
    ) -> StorageResult<bool> {
        let changed = self
            .repo
            .toggle_active(tenant_id, id, new_state)
            .await
            .map_err(StorageError::from_repository)?;
        if changed {
            self.publish_update(tenant_id).await;
        }
        Ok(changed)
    }

    /// Idempotently generates the tenant's HS512 URL-signing key and
    /// broadcasts the invalidation.
    pub async fn generate_url_signing_jwk(&self, tenant_id: &str) -> StorageResult<Uuid> {
        let jwk = generate_hs512_jwk();
        let id = self
            .repo
            .insert(tenant_id, &jwk, URL_SIGNING_KIND, true)
            .await
            .map_err(StorageError::from_repository)?;
        self.publish_update(tenant_id).await;
        Ok(id)
    }

    pub async fn missing_url_signing_batch(
        &self,
        batch_size: i64,
        last_cursor: i64,
    ) -> StorageResult<Vec<TenantCursor>> {
        self.repo
            .list_tenants_without_kind(URL_SIGNING_KIND, batch_size, last_cursor)
            .await
            .map_err(StorageError::from_repository)
    }

    async fn publish_update(&self, tenant_id: &str) {
        self.invalidate(tenant_id);
        if let Err(e) = self
            .pubsub
            .publish(CHANNEL_TENANTS_JWKS_UPDATE, tenant_id)
            .await
        {
            warn!("failed to publish jwks invalidation: tenant={tenant_id} error={e}");
        }
    }
}

#[async_trait]
impl JwksProvider for JwksManager {
    async fn jwks_config(&self, tenant_id: &str) -> StorageResult<Arc<JwksTenantConfig>> {
        self.get_jwks_tenant_config(tenant_id).await
    }
}

/// Queue event: create the URL-signing JWK for one tenant.
pub struct GenerateUrlSigningJwkEvent {
    pub tenant_id: String,
}

impl QueueEvent for GenerateUrlSigningJwkEvent {
    fn name(&self) -> &'static str {
        "jwks-generate-url-signing-key"
    }

    fn payload(&self) -> serde_json::Value {
        json!({"tenantId": self.tenant_id})
    }

    fn send_options(&self) -> SendOptions {
        SendOptions {
            singleton_key: Some(self.tenant_id.clone()),
            ..SendOptions::default()
        }
    }

    fn tenant_id(&self) -> Option<&str> {
        Some(&self.tenant_id)
    }
}

pub struct GenerateUrlSigningJwkHandler {
    manager: Arc<JwksManager>,
}

impl GenerateUrlSigningJwkHandler {
    pub fn new(manager: Arc<JwksManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl EventHandler for GenerateUrlSigningJwkHandler {
    async fn handle(&self, payload: serde_json::Value) -> StorageResult<()> {
        let tenant_id = payload_tenant_id(&payload)
            .ok_or_else(|| StorageError::Internal("payload missing tenantId".to_string()))?;
        self.manager.generate_url_signing_jwk(&tenant_id).await?;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum GenerateAllStatus {
    Started { dispatched: usize },
    AlreadyRunning,
}

const BACKFILL_BATCH_SIZE: i64 = 100;

/// Fleet-wide backfill of missing URL-signing keys. One instance of this
/// runs per process; concurrent calls observe `AlreadyRunning`. The scan
/// is cursor-driven against the store, so a process restart resumes where
/// the data says it should.
pub struct UrlSigningJwkGenerator {
    manager: Arc<JwksManager>,
    queue: Arc<Queue>,
    running: AtomicBool,
}

impl UrlSigningJwkGenerator {
    pub fn new(manager: Arc<JwksManager>, queue: Arc<Queue>) -> Self {
        Self {
            manager,
            queue,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn generate_on_all_tenants(
        &self,
        signal: watch::Receiver<bool>,
    ) -> StorageResult<GenerateAllStatus> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(GenerateAllStatus::AlreadyRunning);
        }
        let result = self.run(signal).await;
        self.running.store(false, Ordering::SeqCst);
        result.map(|dispatched| {
            info!("url-signing jwk backfill dispatched {dispatched} jobs");
            GenerateAllStatus::Started { dispatched }
        })
    }

    async fn run(&self, signal: watch::Receiver<bool>) -> StorageResult<usize> {
        let mut last_cursor = 0i64;
        let mut dispatched = 0usize;
        loop {
            if *signal.borrow() {
                return Err(StorageError::Aborted);
            }
            let batch = self
                .manager
                .missing_url_signing_batch(BACKFILL_BATCH_SIZE, last_cursor)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            last_cursor = last.cursor_id;
            let events: Vec<GenerateUrlSigningJwkEvent> = batch
                .into_iter()
                .map(|tenant| GenerateUrlSigningJwkEvent {
                    tenant_id: tenant.id,
                })
                .collect();
            let refs: Vec<&dyn QueueEvent> =
                events.iter().map(|event| event as &dyn QueueEvent).collect();
            self.queue.batch_send(&refs).await?;
            dispatched += events.len();
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::RepositoryError;
    use crate::manager::app::pubsub::MockPubSubAdapter;
    use crate::manager::jwks::model::JwkItem;
    use crate::manager::jwks::repository::MockJwksRepository;
    use crate::manager::queue::MockQueueBackend;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    fn quiet_pubsub() -> Arc<MockPubSubAdapter> {
        let mut pubsub = MockPubSubAdapter::new();
        pubsub.expect_publish().returning(|_, _| Ok(()));
        pubsub.expect_subscribe().return_const(());
        Arc::new(pubsub)
    }

    #[tokio::test]
    async fn jwks_config_is_cached_until_invalidated() {
        let mut repo = MockJwksRepository::new();
        repo.expect_list_active()
            .with(eq("t1"))
            .times(2)
            .returning(|_| {
                Ok(vec![JwkItem {
                    id: Uuid::new_v4(),
                    kind: URL_SIGNING_KIND.to_string(),
                    jwk: generate_hs512_jwk(),
                }])
            });
        let manager = JwksManager::new(Arc::new(repo), quiet_pubsub());

        let first = manager.get_jwks_tenant_config("t1").await.unwrap();
        let second = manager.get_jwks_tenant_config("t1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.url_signing_key.is_some());

        manager.invalidate("t1");
        let third = manager.get_jwks_tenant_config("t1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn generate_url_signing_jwk_publishes_invalidation() {
        let generated_id = Uuid::new_v4();
        let mut repo = MockJwksRepository::new();
        repo.expect_insert()
            .withf(|tenant, _, kind, idempotent| {
                tenant == "t1" && kind == URL_SIGNING_KIND && *idempotent
            })
            .times(1)
            .returning(move |_, _, _, _| Ok(generated_id));
        let mut pubsub = MockPubSubAdapter::new();
        pubsub
            .expect_publish()
            .with(eq(CHANNEL_TENANTS_JWKS_UPDATE), eq("t1"))
            .times(1)
            .returning(|_, _| Ok(()));
        let manager = JwksManager::new(Arc::new(repo), Arc::new(pubsub));

        let id = manager.generate_url_signing_jwk("t1").await.unwrap();
        assert_eq!(id, generated_id);
    }

    #[tokio::test]
    async fn add_jwk_rejects_the_reserved_kind() {
        let manager = JwksManager::new(Arc::new(MockJwksRepository::new()), quiet_pubsub());
        let error = manager
            .add_jwk("t1", &serde_json::json!({"kty": "oct"}), URL_SIGNING_KIND)
            .await
            .unwrap_err();
        assert_eq!(error.code(), "InvalidRequest");

        let error = manager
            .add_jwk("t1", &serde_json::json!({"kty": "oct"}), "bad kind!")
            .await
            .unwrap_err();
        assert_eq!(error.code(), "InvalidRequest");
    }

    #[tokio::test]
    async fn backfill_dispatches_one_job_per_missing_tenant() {
        let mut repo = MockJwksRepository::new();
        repo.expect_list_tenants_without_kind()
            .with(eq(URL_SIGNING_KIND), eq(BACKFILL_BATCH_SIZE), eq(0))
            .times(1)
            .returning(|_, _, _| {
                Ok(vec![
                    TenantCursor {
                        id: "t1".to_string(),
                        cursor_id: 1,
                    },
                    TenantCursor {
                        id: "t2".to_string(),
                        cursor_id: 2,
                    },
                ])
            });
        repo.expect_list_tenants_without_kind()
            .with(eq(URL_SIGNING_KIND), eq(BACKFILL_BATCH_SIZE), eq(2))
            .times(1)
            .returning(|_, _, _| Ok(vec![]));
        let manager = Arc::new(JwksManager::new(Arc::new(repo), quiet_pubsub()));

        let mut backend = MockQueueBackend::new();
        backend
            .expect_insert()
            .withf(|jobs| jobs.len() == 2 && jobs[0].name == "jwks-generate-url-signing-key")
            .times(1)
            .returning(|_| Ok(()));
        let queue = Arc::new(Queue::new(true, Some(Arc::new(backend))));

        let generator = UrlSigningJwkGenerator::new(manager, queue);
        let (_tx, rx) = watch::channel(false);
        let status = generator.generate_on_all_tenants(rx).await.unwrap();
        assert_eq!(status, GenerateAllStatus::Started { dispatched: 2 });
        assert!(!generator.is_running());
    }

    #[tokio::test]
    async fn backfill_reports_already_running() {
        let manager = Arc::new(JwksManager::new(
            Arc::new(MockJwksRepository::new()),
            quiet_pubsub(),
        ));
        let queue = Arc::new(Queue::new(false, None));
        let generator = UrlSigningJwkGenerator::new(manager, queue);
        generator.running.store(true, Ordering::SeqCst);

        let (_tx, rx) = watch::channel(false);
        let status = generator.generate_on_all_tenants(rx).await.unwrap();
        assert_eq!(status, GenerateAllStatus::AlreadyRunning);
    }

    #[tokio::test]
    async fn backfill_observes_the_cancellation_signal() {
        let mut repo = MockJwksRepository::new();
        repo.expect_list_tenants_without_kind().never();
        let manager = Arc::new(JwksManager::new(Arc::new(repo), quiet_pubsub()));
        let queue = Arc::new(Queue::new(false, None));
        let generator = UrlSigningJwkGenerator::new(manager, queue);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result = generator.generate_on_all_tenants(rx).await;
        assert!(matches!(result, Err(StorageError::Aborted)));
    }

    #[tokio::test]
    async fn toggle_publishes_only_on_actual_change() {
        let id = Uuid::new_v4();
        let mut repo = MockJwksRepository::new();
        repo.expect_toggle_active()
            .returning(|_, _, _| Ok(false));
        let mut pubsub = MockPubSubAdapter::new();
        pubsub.expect_publish().never();
        let manager = JwksManager::new(Arc::new(repo), Arc::new(pubsub));
        assert!(!manager.toggle_active("t1", id, false).await.unwrap());
    }

    #[tokio::test]
    async fn repository_failures_surface_as_storage_errors() {
        let mut repo = MockJwksRepository::new();
        repo.expect_list_active()
            .returning(|_| Err(RepositoryError::Custom("down".to_string())));
        let manager = JwksManager::new(Arc::new(repo), quiet_pubsub());
        let error = manager.get_jwks_tenant_config("t1").await.unwrap_err();
        assert_eq!(error.code(), "DatabaseError");
    }
}
