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
use crate::manager::app::config::AppConfig;
use crate::manager::app::database::{GetPoolOptions, PoolManager, RebalanceOptions};
use crate::manager::app::pubsub::{CHANNEL_TENANTS_UPDATE, PubSubAdapter};
use crate::manager::auth::claims::{Claims, ServiceKeyUser, parse_algorithm};
use crate::manager::jwks::service::JwksProvider;
use crate::manager::tenants::model::{
    DatabasePoolMode, TenantCapabilities, TenantConfig, TenantMigrationStatus,
};
use crate::manager::tenants::repository::TenantsRepository;
use crate::tenant::migrations::{latest_migration_name, migration_index};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// JWT verification material for one tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantJwtConfig {
    pub secret: String,
    /// Merged key set: legacy inline JWKS first, then JWKS store rows.
    pub jwks: Vec<serde_json::Value>,
    pub url_signing_key: UrlSigningKey,
}

/// Signed-URL key material. Tenants without an active URL-signing JWK fall
/// back to signing with their JWT secret.
#[derive(Debug, Clone, PartialEq)]
pub enum UrlSigningKey {
    TenantSecret(String),
    Jwk(serde_json::Value),
}

/// Schema-gated capability derivation: a capability is on once the
/// tenant's applied migration version reaches the gating migration.
pub fn capabilities_from_version(version: Option<&str>) -> TenantCapabilities {
    let applied = version.and_then(migration_index);
    let reached = |gate: &str| match (applied, migration_index(gate)) {
        (Some(applied), Some(gate)) => applied >= gate,
        _ => false,
    };
    TenantCapabilities {
        list_v2: reached("list-objects-with-delimiter"),
        iceberg_catalog: reached("iceberg-catalog-tables"),
        vector_buckets: reached("vector-buckets"),
    }
}

/// The tenant catalog: loads tenant rows, caches the decrypted config,
/// and reacts to cross-node invalidations.
pub struct TenantCatalog {
    config: Arc<AppConfig>,
    repo: Arc<dyn TenantsRepository>,
    pool_manager: Arc<dyn PoolManager>,
    pubsub: Arc<dyn PubSubAdapter>,
    jwks: Arc<dyn JwksProvider>,
    cache: RwLock<HashMap<String, Arc<TenantConfig>>>,
    keyed_mutex: KeyedMutex,
    /// Compiled `REQUEST_X_FORWARDED_HOST_REGEXP`, when configured.
    host_pattern: Option<Regex>,
    /// Single-tenant deployments answer from this precomputed state.
    single_tenant: Option<SingleTenantState>,
}

struct SingleTenantState {
    config: Arc<TenantConfig>,
    service_key_user: ServiceKeyUser,
}

impl TenantCatalog {
    pub fn new(
        config: Arc<AppConfig>,
        repo: Arc<dyn TenantsRepository>,
        pool_manager: Arc<dyn PoolManager>,
        pubsub: Arc<dyn PubSubAdapter>,
        jwks: Arc<dyn JwksProvider>,
    ) -> StorageResult<Self> {
        let single_tenant = if config.is_multitenant() {
            None
        } else {
            Some(SingleTenantState::from_config(&config)?)
        };
        let host_pattern = config
            .request_x_forwarded_host_regexp()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                StorageError::Internal(format!("invalid REQUEST_X_FORWARDED_HOST_REGEXP: {e}"))
            })?;
        Ok(Self {
            config,
            repo,
            pool_manager,
            pubsub,
            jwks,
            cache: RwLock::new(HashMap::new()),
            keyed_mutex: KeyedMutex::new(),
            host_pattern,
            single_tenant,
        })
    }

    /// Resolves the tenant id from a proxied host header: the first
    /// capturing group of the configured pattern. Single-tenant
    /// deployments always answer with the configured id.
    pub fn tenant_id_from_host(&self, host: &str) -> Option<String> {
        if let Some(single) = &self.single_tenant {
            return Some(single.config.tenant_id.clone());
        }
        self.host_pattern
            .as_ref()?
            .captures(host)?
            .get(1)
            .map(|group| group.as_str().to_string())
    }

    /// Registers the invalidation handler on `tenants_update`.
    pub fn listen_for_tenant_update(self: Arc<Self>) {
        let catalog = self.clone();
        self.pubsub.subscribe(
            CHANNEL_TENANTS_UPDATE,
            Arc::new(move |tenant_id: String| {
                let catalog = catalog.clone();
                tokio::spawn(async move {
                    if let Err(e) = catalog.handle_invalidation(&tenant_id).await {
                        warn!("tenant invalidation failed: tenant={tenant_id} error={e}");
                    }
                });
            }),
        );
    }

    fn cached(&self, tenant_id: &str) -> Option<Arc<TenantConfig>> {
        let cache = self
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.get(tenant_id).cloned()
    }

    fn cache_insert(&self, config: Arc<TenantConfig>) {
        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(config.tenant_id.clone(), config);
    }

    fn cache_remove(&self, tenant_id: &str) -> Option<Arc<TenantConfig>> {
        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.remove(tenant_id)
    }

    /// Returns the cached tenant config, loading it on a miss. Concurrent
    /// misses for the same tenant coalesce onto one database load.
    pub async fn get_tenant_config(&self, tenant_id: &str) -> StorageResult<Arc<TenantConfig>> {
        if tenant_id.is_empty() {
            return Err(StorageError::InvalidTenantId(tenant_id.to_string()));
        }
        if let Some(single) = &self.single_tenant {
            return Ok(single.config.clone());
        }
        if let Some(config) = self.cached(tenant_id) {
            return Ok(config);
        }
        self.keyed_mutex
            .run(tenant_id, async {
                if let Some(config) = self.cached(tenant_id) {
                    return Ok(config);
                }
                let row = self
                    .repo
                    .get_by_id(tenant_id)
                    .await
                    .map_err(StorageError::from_repository)?
                    .ok_or_else(|| StorageError::MissingTenantConfig(tenant_id.to_string()))?;
                let config = Arc::new(row);
                self.cache_insert(config.clone());
                Ok(config)
            })
            .await
    }

    /// Evicts the tenant and compares the stale entry against a fresh read:
    /// `recycled -> single_use` schedules a pool destroy, a changed
    /// `max_connections` rebalances the pool.
    pub async fn handle_invalidation(&self, tenant_id: &str) -> StorageResult<()> {
        let old = self.cache_remove(tenant_id);
        let fresh = self
            .repo
            .get_by_id(tenant_id)
            .await
            .map_err(StorageError::from_repository)?;
        let Some(fresh) = fresh else {
            // Tenant destroyed: drop its pool along with the cache entry.
            self.pool_manager.destroy(tenant_id).await;
            return Ok(());
        };
        if let Some(old) = old {
            let went_single_use = old.database_pool_mode == Some(DatabasePoolMode::Recycled)
                && fresh.database_pool_mode == Some(DatabasePoolMode::SingleUse);
            if went_single_use {
                debug!("pool mode became single_use, destroying pool: tenant={tenant_id}");
                self.pool_manager.destroy(tenant_id).await;
            } else if old.max_connections != fresh.max_connections {
                debug!(
                    "max_connections changed {} -> {}, rebalancing: tenant={tenant_id}",
                    old.max_connections, fresh.max_connections
                );
                self.pool_manager
                    .rebalance(
                        tenant_id,
                        RebalanceOptions {
                            max_connections: Some(fresh.max_connections),
                            cluster_size: None,
                        },
                    )
                    .await
                    .map_err(StorageError::from_repository)?;
            }
        }
        self.cache_insert(Arc::new(fresh));
        Ok(())
    }

    /// Publishes a tenant invalidation to the whole fleet (including this
    /// instance, which handles it like any other).
    pub async fn publish_invalidation(&self, tenant_id: &str) -> StorageResult<()> {
        self.pubsub
            .publish(CHANNEL_TENANTS_UPDATE, tenant_id)
            .await
            .map_err(StorageError::from_repository)
    }

    /// The service identity used by internal calls on behalf of a tenant.
    pub async fn get_service_key_user(&self, tenant_id: &str) -> StorageResult<ServiceKeyUser> {
        if let Some(single) = &self.single_tenant {
            return Ok(single.service_key_user.clone());
        }
        let config = self.get_tenant_config(tenant_id).await?;
        let algorithm =
            parse_algorithm(self.config.jwt_algorithm()).map_err(StorageError::AccessDenied)?;
        let claims = Claims::from_token(&config.service_key, config.jwt_secret.as_bytes(), algorithm)
            .map_err(StorageError::AccessDenied)?;
        Ok(ServiceKeyUser {
            jwt: config.service_key.clone(),
            claims,
        })
    }

    /// Verification material: tenant secret, merged JWKS, URL-signing key
    /// with fallback to the secret.
    pub async fn get_jwt_secret(&self, tenant_id: &str) -> StorageResult<TenantJwtConfig> {
        let config = self.get_tenant_config(tenant_id).await?;
        let mut keys: Vec<serde_json::Value> = Vec::new();
        if let Some(inline) = &config.jwks
            && let Some(inline_keys) = inline.get("keys").and_then(|keys| keys.as_array())
        {
            keys.extend(inline_keys.iter().cloned());
        }
        let url_signing_key = if self.config.is_multitenant() {
            let stored = self.jwks.jwks_config(tenant_id).await?;
            keys.extend(stored.keys.iter().map(|item| item.jwk.clone()));
            stored.url_signing_key.clone()
        } else {
            None
        };
        Ok(TenantJwtConfig {
            secret: config.jwt_secret.clone(),
            jwks: keys,
            url_signing_key: url_signing_key
                .map(UrlSigningKey::Jwk)
                .unwrap_or_else(|| UrlSigningKey::TenantSecret(config.jwt_secret.clone())),
        })
    }

    /// Derived purely from the tenant's applied migration version.
    pub async fn get_tenant_capabilities(
        &self,
        tenant_id: &str,
    ) -> StorageResult<TenantCapabilities> {
        let config = self.get_tenant_config(tenant_id).await?;
        Ok(capabilities_from_version(
            config.migrations_version.as_deref(),
        ))
    }

    /// Always `true` in single-tenant mode; otherwise the tenant's flag.
    pub async fn tenant_has_feature(&self, tenant_id: &str, feature: &str) -> StorageResult<bool> {
        if !self.config.is_multitenant() {
            return Ok(true);
        }
        let config = self.get_tenant_config(tenant_id).await?;
        Ok(config.features.get(feature).copied().unwrap_or(false))
    }

    /// Whether the tenant is behind the local migration set and eligible
    /// for an on-request migration run.
    pub async fn tenant_needs_migration(&self, tenant_id: &str) -> StorageResult<bool> {
        let config = self.get_tenant_config(tenant_id).await?;
        let behind = config.migrations_version.as_deref() != Some(latest_migration_name());
        let failed = matches!(
            config.migrations_status,
            Some(TenantMigrationStatus::Failed) | Some(TenantMigrationStatus::FailedStale)
        );
        Ok(behind && !failed)
    }

    /// Hands out a [`crate::tenant::connection::TenantConnection`] for the
    /// tenant, creating or reusing its pool.
    pub async fn get_connection(
        &self,
        tenant_id: &str,
    ) -> StorageResult<crate::tenant::connection::TenantConnection> {
        let config = self.get_tenant_config(tenant_id).await?;
        let pool = self
            .pool_manager
            .get_pool(GetPoolOptions {
                tenant_id: config.tenant_id.clone(),
                db_url: config.pool_url().to_string(),
                max_connections: config.max_connections,
                cluster_size: None,
                is_external_pool: config.is_external_pool(),
                is_single_use: config.is_single_use_pool(),
            })
            .await
            .map_err(StorageError::from_repository)?;
        Ok(crate::tenant::connection::TenantConnection::new(
            pool,
            crate::tenant::connection::ConnectionOptions {
                tenant_id: config.tenant_id.clone(),
                is_external_pool: config.is_external_pool(),
                is_single_use: config.is_single_use_pool(),
                search_path: self.config.db_search_path().to_string(),
                statement_timeout: self.config.statement_timeout(),
                super_user_role: self.config.db_super_user().to_string(),
                anon_role: self.config.db_anon_role().to_string(),
            },
        ))
    }
}

impl SingleTenantState {
    fn from_config(config: &AppConfig) -> StorageResult<Self> {
        let tenant_id = config
            .tenant_id()
            .ok_or_else(|| StorageError::Internal("TENANT_ID missing".to_string()))?
            .to_string();
        let jwt_secret = config
            .jwt_secret()
            .ok_or_else(|| StorageError::Internal("PGRST_JWT_SECRET missing".to_string()))?
            .to_string();
        let service_key = config
            .service_key()
            .ok_or_else(|| StorageError::Internal("SERVICE_KEY missing".to_string()))?
            .to_string();
        let database_url = config
            .database_url()
            .ok_or_else(|| StorageError::Internal("DATABASE_URL missing".to_string()))?
            .to_string();
        let algorithm =
            parse_algorithm(config.jwt_algorithm()).map_err(StorageError::AccessDenied)?;
        let claims = Claims::from_token(&service_key, jwt_secret.as_bytes(), algorithm)
            .unwrap_or_else(|_| {
                Claims::service_key(config.db_service_role(), &format!("storage.tarhely.{tenant_id}"))
            });
        let jwks = config
            .jwt_jwks()
            .and_then(|raw| serde_json::from_str(raw).ok());
        let tenant_config = TenantConfig {
            tenant_id: tenant_id.clone(),
            database_url,
            database_pool_url: config.database_pool_url().map(str::to_string),
            database_pool_mode: None,
            max_connections: config.database_max_connections(),
            file_size_limit: 52_428_800,
            features: HashMap::new(),
            jwt_secret,
            jwks,
            service_key: service_key.clone(),
            migrations_version: Some(latest_migration_name().to_string()),
            migrations_status: Some(TenantMigrationStatus::Completed),
            tracing_mode: None,
            disabled_events: Vec::new(),
        };
        Ok(Self {
            config: Arc::new(tenant_config),
            service_key_user: ServiceKeyUser {
                jwt: service_key,
                claims,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::RepositoryError;
    use crate::manager::app::config::AppConfigBuilder;
    use crate::manager::app::database::MockPoolManager;
    use crate::manager::app::pubsub::MockPubSubAdapter;
    use crate::manager::jwks::model::JwksTenantConfig;
    use crate::manager::jwks::service::MockJwksProvider;
    use crate::manager::tenants::repository::MockTenantsRepository;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn multitenant_config() -> Arc<AppConfig> {
        Arc::new(
            AppConfigBuilder::new()
                .is_multitenant(true)
                .multitenant_database_url(Some("postgresql://localhost/mt".to_string()))
                .build(),
        )
    }

    fn tenant_config_fixture(max_connections: u32, mode: Option<DatabasePoolMode>) -> TenantConfig {
        TenantConfig {
            tenant_id: "t1".to_string(),
            database_url: "postgresql://localhost/t1".to_string(),
            database_pool_url: None,
            database_pool_mode: mode,
            max_connections,
            file_size_limit: 52_428_800,
            features: HashMap::from([("imageTransformation".to_string(), false)]),
            jwt_secret: "tenant-secret".to_string(),
            jwks: None,
            service_key: "service-token".to_string(),
            migrations_version: Some("pathtoken-column".to_string()),
            migrations_status: Some(TenantMigrationStatus::Completed),
            tracing_mode: None,
            disabled_events: Vec::new(),
        }
    }

    fn quiet_pubsub() -> Arc<MockPubSubAdapter> {
        let mut pubsub = MockPubSubAdapter::new();
        pubsub.expect_publish().returning(|_, _| Ok(()));
        pubsub.expect_subscribe().return_const(());
        Arc::new(pubsub)
    }

    fn empty_jwks() -> Arc<MockJwksProvider> {
        let mut jwks = MockJwksProvider::new();
        jwks.expect_jwks_config()
            .returning(|_| Ok(Arc::new(JwksTenantConfig::default())));
        Arc::new(jwks)
    }

    fn catalog_with(
        repo: MockTenantsRepository,
        pool_manager: MockPoolManager,
    ) -> Arc<TenantCatalog> {
        Arc::new(
            TenantCatalog::new(
                multitenant_config(),
                Arc::new(repo),
                Arc::new(pool_manager),
                quiet_pubsub(),
                empty_jwks(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn concurrent_misses_issue_one_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let mut repo = MockTenantsRepository::new();
        let counter = loads.clone();
        repo.expect_get_by_id().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Some(tenant_config_fixture(10, None)))
        });
        let catalog = catalog_with(repo, MockPoolManager::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let catalog = catalog.clone();
            handles.push(tokio::spawn(async move {
                catalog.get_tenant_config("t1").await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_tenant_id_is_rejected() {
        let catalog = catalog_with(MockTenantsRepository::new(), MockPoolManager::new());
        let error = catalog.get_tenant_config("").await.unwrap_err();
        assert_eq!(error.code(), "InvalidTenantId");
    }

    #[tokio::test]
    async fn missing_row_is_missing_tenant_config() {
        let mut repo = MockTenantsRepository::new();
        repo.expect_get_by_id().returning(|_| Ok(None));
        let catalog = catalog_with(repo, MockPoolManager::new());
        let error = catalog.get_tenant_config("absent").await.unwrap_err();
        assert_eq!(error.code(), "MissingTenantConfig");
    }

    #[tokio::test]
    async fn invalidation_rebalances_on_max_connections_change() {
        let mut repo = MockTenantsRepository::new();
        let mut sequence = vec![
            tenant_config_fixture(20, None),
            tenant_config_fixture(10, None),
        ];
        repo.expect_get_by_id()
            .times(2)
            .returning(move |_| Ok(Some(sequence.pop().unwrap())));
        let mut pool_manager = MockPoolManager::new();
        pool_manager
            .expect_rebalance()
            .withf(|tenant_id, options| {
                tenant_id == "t1" && options.max_connections == Some(20)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let catalog = catalog_with(repo, pool_manager);

        let before = catalog.get_tenant_config("t1").await.unwrap();
        assert_eq!(before.max_connections, 10);
        catalog.handle_invalidation("t1").await.unwrap();
        let after = catalog.get_tenant_config("t1").await.unwrap();
        assert_eq!(after.max_connections, 20);
    }

    #[tokio::test]
    async fn invalidation_destroys_pool_when_mode_goes_single_use() {
        let mut repo = MockTenantsRepository::new();
        let mut sequence = vec![
            tenant_config_fixture(10, Some(DatabasePoolMode::SingleUse)),
            tenant_config_fixture(10, Some(DatabasePoolMode::Recycled)),
        ];
        repo.expect_get_by_id()
            .times(2)
            .returning(move |_| Ok(Some(sequence.pop().unwrap())));
        let mut pool_manager = MockPoolManager::new();
        pool_manager
            .expect_destroy()
            .withf(|tenant_id| tenant_id == "t1")
            .times(1)
            .return_const(());
        let catalog = catalog_with(repo, pool_manager);

        catalog.get_tenant_config("t1").await.unwrap();
        catalog.handle_invalidation("t1").await.unwrap();
    }

    #[tokio::test]
    async fn invalidation_of_deleted_tenant_destroys_pool() {
        let mut repo = MockTenantsRepository::new();
        repo.expect_get_by_id().returning(|_| Ok(None));
        let mut pool_manager = MockPoolManager::new();
        pool_manager.expect_destroy().times(1).return_const(());
        let catalog = catalog_with(repo, pool_manager);
        catalog.handle_invalidation("t1").await.unwrap();
    }

    #[tokio::test]
    async fn features_default_to_disabled_in_multitenant_mode() {
        let mut repo = MockTenantsRepository::new();
        repo.expect_get_by_id()
            .returning(|_| Ok(Some(tenant_config_fixture(10, None))));
        let catalog = catalog_with(repo, MockPoolManager::new());
        assert!(
            !catalog
                .tenant_has_feature("t1", "imageTransformation")
                .await
                .unwrap()
        );
        assert!(!catalog.tenant_has_feature("t1", "unknown").await.unwrap());
    }

    #[tokio::test]
    async fn single_tenant_mode_always_has_features() {
        let config = Arc::new(AppConfigBuilder::new().build());
        let catalog = TenantCatalog::new(
            config,
            Arc::new(MockTenantsRepository::new()),
            Arc::new(MockPoolManager::new()),
            quiet_pubsub(),
            empty_jwks(),
        )
        .unwrap();
        assert!(catalog.tenant_has_feature("any", "anything").await.unwrap());
        let user = catalog.get_service_key_user("any").await.unwrap();
        assert_eq!(user.jwt, "local-dev-service-key");
    }

    #[tokio::test]
    async fn url_signing_key_falls_back_to_the_tenant_secret() {
        let mut repo = MockTenantsRepository::new();
        repo.expect_get_by_id()
            .returning(|_| Ok(Some(tenant_config_fixture(10, None))));
        let catalog = catalog_with(repo, MockPoolManager::new());
        let jwt = catalog.get_jwt_secret("t1").await.unwrap();
        assert_eq!(
            jwt.url_signing_key,
            UrlSigningKey::TenantSecret("tenant-secret".to_string())
        );
        assert_eq!(jwt.secret, "tenant-secret");
        assert!(jwt.jwks.is_empty());
    }

    #[tokio::test]
    async fn url_signing_key_prefers_the_stored_jwk() {
        let mut repo = MockTenantsRepository::new();
        repo.expect_get_by_id()
            .returning(|_| Ok(Some(tenant_config_fixture(10, None))));
        let jwk = crate::manager::jwks::model::generate_hs512_jwk();
        let stored = jwk.clone();
        let mut jwks = MockJwksProvider::new();
        jwks.expect_jwks_config().returning(move |_| {
            Ok(Arc::new(JwksTenantConfig {
                keys: vec![crate::manager::jwks::model::JwkItem {
                    id: uuid::Uuid::new_v4(),
                    kind: crate::manager::jwks::model::URL_SIGNING_KIND.to_string(),
                    jwk: stored.clone(),
                }],
                url_signing_key: Some(stored.clone()),
            }))
        });
        let catalog = Arc::new(
            TenantCatalog::new(
                multitenant_config(),
                Arc::new(repo),
                Arc::new(MockPoolManager::new()),
                quiet_pubsub(),
                Arc::new(jwks),
            )
            .unwrap(),
        );
        let jwt = catalog.get_jwt_secret("t1").await.unwrap();
        assert_eq!(jwt.url_signing_key, UrlSigningKey::Jwk(jwk));
        assert_eq!(jwt.jwks.len(), 1);
    }

    #[tokio::test]
    async fn capabilities_follow_the_migration_version() {
        let early = capabilities_from_version(Some("pathtoken-column"));
        assert!(!early.list_v2);
        assert!(!early.iceberg_catalog);

        let listing = capabilities_from_version(Some("list-objects-with-delimiter"));
        assert!(listing.list_v2);
        assert!(!listing.iceberg_catalog);

        let latest = capabilities_from_version(Some(latest_migration_name()));
        assert!(latest.list_v2);
        assert!(latest.iceberg_catalog);
        assert!(latest.vector_buckets);

        let unknown = capabilities_from_version(None);
        assert!(!unknown.list_v2);
    }

    #[tokio::test]
    async fn tenant_id_is_extracted_from_the_forwarded_host() {
        let config = Arc::new(
            AppConfigBuilder::new()
                .is_multitenant(true)
                .multitenant_database_url(Some("postgresql://localhost/mt".to_string()))
                .request_x_forwarded_host_regexp(Some(
                    r"^([a-z0-9]+)\.storage\.example\.com$".to_string(),
                ))
                .build(),
        );
        let catalog = TenantCatalog::new(
            config,
            Arc::new(MockTenantsRepository::new()),
            Arc::new(MockPoolManager::new()),
            quiet_pubsub(),
            empty_jwks(),
        )
        .unwrap();
        assert_eq!(
            catalog.tenant_id_from_host("abc123.storage.example.com"),
            Some("abc123".to_string())
        );
        assert_eq!(catalog.tenant_id_from_host("storage.example.com"), None);
    }

    #[tokio::test]
    async fn single_tenant_host_resolution_returns_the_configured_id() {
        let catalog = TenantCatalog::new(
            Arc::new(AppConfigBuilder::new().build()),
            Arc::new(MockTenantsRepository::new()),
            Arc::new(MockPoolManager::new()),
            quiet_pubsub(),
            empty_jwks(),
        )
        .unwrap();
        assert_eq!(
            catalog.tenant_id_from_host("anything.example.com"),
            Some("storage-single-tenant".to_string())
        );
    }

    #[tokio::test]
    async fn repository_timeouts_normalize_to_database_timeout() {
        let mut repo = MockTenantsRepository::new();
        repo.expect_get_by_id()
            .returning(|_| Err(RepositoryError::Database(sqlx::Error::PoolTimedOut)));
        let catalog = catalog_with(repo, MockPoolManager::new());
        let error = catalog.get_tenant_config("t1").await.unwrap_err();
        assert_eq!(error.code(), "DatabaseTimeout");
        // The keyed mutex entry must be released for the next caller.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
