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
use crate::common::services::generate_string_csprng;
use crate::manager::app::pubsub::{CHANNEL_TENANTS_S3_CREDENTIALS_UPDATE, PubSubAdapter};
use crate::manager::s3_credentials::model::{
    ACCESS_KEY_LENGTH, S3Credential, S3CredentialSummary, SECRET_KEY_LENGTH, credential_cache_key,
};
use crate::manager::s3_credentials::repository::{
    InsertCredentialOutcome, S3CredentialsRepository,
};
use moka::future::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// 50 MB of decrypted credentials, idle-expired after an hour.
const CACHE_CAPACITY_BYTES: u64 = 50 * 1024 * 1024;
const CACHE_IDLE_TTL: Duration = Duration::from_secs(60 * 60);

/// Claims the caller may not override on a credential.
const RESERVED_CLAIMS: &[&str] = &["iss", "issuer", "exp", "iat"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewS3Credential {
    pub id: Uuid,
    pub access_key: String,
    pub secret_key: String,
}

/// Strips reserved claims and stamps the tenant-scoped issuer.
pub fn normalize_claims(tenant_id: &str, claims: Option<serde_json::Value>) -> serde_json::Value {
    let mut object = match claims {
        Some(serde_json::Value::Object(object)) => object,
        _ => serde_json::Map::new(),
    };
    for reserved in RESERVED_CLAIMS {
        object.remove(*reserved);
    }
    object.insert(
        "issuer".to_string(),
        serde_json::Value::String(format!("storage.tarhely.{tenant_id}")),
    );
    serde_json::Value::Object(object)
}

pub struct S3CredentialsManager {
    repo: Arc<dyn S3CredentialsRepository>,
    pubsub: Arc<dyn PubSubAdapter>,
    cache: Cache<String, Arc<S3Credential>>,
    keyed_mutex: KeyedMutex,
}

impl S3CredentialsManager {
    pub fn new(repo: Arc<dyn S3CredentialsRepository>, pubsub: Arc<dyn PubSubAdapter>) -> Self {
        Self {
            repo,
            pubsub,
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY_BYTES)
                .time_to_idle(CACHE_IDLE_TTL)
                .weigher(|key: &String, value: &Arc<S3Credential>| {
                    key.len() as u32 + value.weight()
                })
                .build(),
            keyed_mutex: KeyedMutex::new(),
        }
    }

    /// Evicts single entries on `tenants_s3_credentials_update`; the
    /// payload is already the cache key.
    pub fn listen_for_credential_update(self: Arc<Self>) {
        let manager = self.clone();
        self.pubsub.subscribe(
            CHANNEL_TENANTS_S3_CREDENTIALS_UPDATE,
            Arc::new(move |cache_key: String| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager.cache.invalidate(&cache_key).await;
                });
            }),
        );
    }

    /// Mints a credential pair for the tenant, enforcing the per-tenant
    /// ceiling. The secret is returned exactly once.
    pub async fn create_s3_credentials(
        &self,
        tenant_id: &str,
        description: &str,
        claims: Option<serde_json::Value>,
    ) -> StorageResult<NewS3Credential> {
        let access_key = generate_string_csprng(ACCESS_KEY_LENGTH);
        let secret_key = generate_string_csprng(SECRET_KEY_LENGTH);
        let claims = normalize_claims(tenant_id, claims);
        let outcome = self
            .repo
            .insert(tenant_id, description, &access_key, &secret_key, &claims)
            .await
            .map_err(StorageError::from_repository)?;
        match outcome {
            InsertCredentialOutcome::Created(id) => Ok(NewS3Credential {
                id,
                access_key,
                secret_key,
            }),
            InsertCredentialOutcome::LimitReached => Err(StorageError::MaximumCredentialsLimit),
        }
    }

    /// Cached lookup used on every SigV4 request; misses coalesce per
    /// cache key.
    pub async fn get_s3_credentials_by_access_key(
        &self,
        tenant_id: &str,
        access_key: &str,
    ) -> StorageResult<Arc<S3Credential>> {
        let cache_key = credential_cache_key(tenant_id, access_key);
        if let Some(credential) = self.cache.get(&cache_key).await {
            return Ok(credential);
        }
        self.keyed_mutex
            .run(&cache_key, async {
                if let Some(credential) = self.cache.get(&cache_key).await {
                    return Ok(credential);
                }
                let credential = self
                    .repo
                    .get_by_access_key(tenant_id, access_key)
                    .await
                    .map_err(StorageError::from_repository)?
                    .ok_or(StorageError::MissingS3Credentials)?;
                let credential = Arc::new(credential);
                self.cache.insert(cache_key.clone(), credential.clone()).await;
                Ok(credential)
            })
            .await
    }

    pub async fn delete_s3_credential(&self, tenant_id: &str, id: Uuid) -> StorageResult<()> {
        let deleted = self
            .repo
            .delete(tenant_id, id)
            .await
            .map_err(StorageError::from_repository)?;
        if let Some(access_key) = deleted {
            let cache_key = credential_cache_key(tenant_id, &access_key);
            self.cache.invalidate(&cache_key).await;
            if let Err(e) = self
                .pubsub
                .publish(CHANNEL_TENANTS_S3_CREDENTIALS_UPDATE, &cache_key)
                .await
            {
                warn!("failed to publish credential invalidation: {e}");
            }
        }
        Ok(())
    }

    pub async fn list_s3_credentials(
        &self,
        tenant_id: &str,
    ) -> StorageResult<Vec<S3CredentialSummary>> {
        self.repo
            .list(tenant_id)
            .await
            .map_err(StorageError::from_repository)
    }

    pub async fn count_s3_credentials(&self, tenant_id: &str) -> StorageResult<i64> {
        self.repo
            .count(tenant_id)
            .await
            .map_err(StorageError::from_repository)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::app::pubsub::MockPubSubAdapter;
    use crate::manager::s3_credentials::repository::MockS3CredentialsRepository;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn quiet_pubsub() -> Arc<MockPubSubAdapter> {
        let mut pubsub = MockPubSubAdapter::new();
        pubsub.expect_publish().returning(|_, _| Ok(()));
        pubsub.expect_subscribe().return_const(());
        Arc::new(pubsub)
    }

    #[test]
    fn normalize_claims_strips_reserved_and_stamps_issuer() {
        let claims = normalize_claims(
            "t1",
            Some(json!({
                "role": "authenticated",
                "iss": "spoofed",
                "issuer": "spoofed",
                "exp": 123,
                "iat": 456
            })),
        );
        assert_eq!(claims["role"], "authenticated");
        assert_eq!(claims["issuer"], "storage.tarhely.t1");
        assert!(claims.get("iss").is_none());
        assert!(claims.get("exp").is_none());
        assert!(claims.get("iat").is_none());
    }

    #[test]
    fn normalize_claims_handles_absent_input() {
        let claims = normalize_claims("t2", None);
        assert_eq!(claims["issuer"], "storage.tarhely.t2");
    }

    #[tokio::test]
    async fn create_generates_the_documented_key_lengths() {
        let mut repo = MockS3CredentialsRepository::new();
        repo.expect_insert()
            .withf(|_, _, access_key, secret_key, claims| {
                access_key.len() == ACCESS_KEY_LENGTH
                    && secret_key.len() == SECRET_KEY_LENGTH
                    && claims["issuer"] == "storage.tarhely.t1"
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(InsertCredentialOutcome::Created(Uuid::new_v4())));
        let manager = S3CredentialsManager::new(Arc::new(repo), quiet_pubsub());
        let created = manager
            .create_s3_credentials("t1", "ci deploy key", None)
            .await
            .unwrap();
        assert_eq!(created.access_key.len(), ACCESS_KEY_LENGTH);
        assert_eq!(created.secret_key.len(), SECRET_KEY_LENGTH);
    }

    #[tokio::test]
    async fn the_fifty_first_credential_hits_the_ceiling() {
        let mut repo = MockS3CredentialsRepository::new();
        repo.expect_insert()
            .returning(|_, _, _, _, _| Ok(InsertCredentialOutcome::LimitReached));
        let manager = S3CredentialsManager::new(Arc::new(repo), quiet_pubsub());
        let error = manager
            .create_s3_credentials("t1", "one too many", None)
            .await
            .unwrap_err();
        assert_eq!(error.code(), "MaximumCredentialsLimit");
    }

    #[tokio::test]
    async fn lookups_are_cached_by_access_key() {
        let mut repo = MockS3CredentialsRepository::new();
        repo.expect_get_by_access_key()
            .with(eq("t1"), eq("AK1"))
            .times(1)
            .returning(|_, access_key| {
                Ok(Some(S3Credential {
                    id: Uuid::new_v4(),
                    access_key: access_key.to_string(),
                    secret_key: "secret".to_string(),
                    claims: json!({"issuer": "storage.tarhely.t1"}),
                }))
            });
        let manager = S3CredentialsManager::new(Arc::new(repo), quiet_pubsub());
        let first = manager
            .get_s3_credentials_by_access_key("t1", "AK1")
            .await
            .unwrap();
        let second = manager
            .get_s3_credentials_by_access_key("t1", "AK1")
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.secret_key, "secret");
    }

    #[tokio::test]
    async fn missing_rows_surface_as_missing_s3_credentials() {
        let mut repo = MockS3CredentialsRepository::new();
        repo.expect_get_by_access_key().returning(|_, _| Ok(None));
        let manager = S3CredentialsManager::new(Arc::new(repo), quiet_pubsub());
        let error = manager
            .get_s3_credentials_by_access_key("t1", "AKmissing")
            .await
            .unwrap_err();
        assert_eq!(error.code(), "MissingS3Credentials");
    }

    #[tokio::test]
    async fn delete_publishes_the_cache_key() {
        let mut repo = MockS3CredentialsRepository::new();
        repo.expect_delete()
            .returning(|_, _| Ok(Some("AK1".to_string())));
        let mut pubsub = MockPubSubAdapter::new();
        pubsub
            .expect_publish()
            .with(eq(CHANNEL_TENANTS_S3_CREDENTIALS_UPDATE), eq("t1:AK1"))
            .times(1)
            .returning(|_, _| Ok(()));
        let manager = S3CredentialsManager::new(Arc::new(repo), Arc::new(pubsub));
        manager
            .delete_s3_credential("t1", Uuid::new_v4())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_of_missing_credential_publishes_nothing() {
        let mut repo = MockS3CredentialsRepository::new();
        repo.expect_delete().returning(|_, _| Ok(None));
        let mut pubsub = MockPubSubAdapter::new();
        pubsub.expect_publish().never();
        let manager = S3CredentialsManager::new(Arc::new(repo), Arc::new(pubsub));
        manager
            .delete_s3_credential("t1", Uuid::new_v4())
            .await
            .unwrap();
    }
}
