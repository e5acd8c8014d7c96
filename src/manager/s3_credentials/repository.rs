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

use crate::common::crypto::{self, EncryptionKey};
use crate::common::error::RepositoryResult;
use crate::manager::s3_credentials::model::{
    MAX_CREDENTIALS_PER_TENANT, S3Credential, S3CredentialSummary, TenantS3CredentialRow,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use sqlx::PgPool;
use uuid::Uuid;

/// Outcome of a credential insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertCredentialOutcome {
    Created(Uuid),
    /// The tenant already holds the maximum number of credentials.
    LimitReached,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait S3CredentialsRepository: Send + Sync {
    /// Inserts under the per-tenant ceiling; the count check and insert
    /// share one transaction serialized on the tenant row.
    async fn insert(
        &self,
        tenant_id: &str,
        description: &str,
        access_key: &str,
        secret_key: &str,
        claims: &serde_json::Value,
    ) -> RepositoryResult<InsertCredentialOutcome>;

    async fn get_by_access_key(
        &self,
        tenant_id: &str,
        access_key: &str,
    ) -> RepositoryResult<Option<S3Credential>>;

    /// Returns the deleted credential's access key, for cache eviction.
    async fn delete(&self, tenant_id: &str, id: Uuid) -> RepositoryResult<Option<String>>;

    async fn list(&self, tenant_id: &str) -> RepositoryResult<Vec<S3CredentialSummary>>;

    async fn count(&self, tenant_id: &str) -> RepositoryResult<i64>;
}

pub struct PgS3CredentialsRepository {
    pool: PgPool,
    key: EncryptionKey,
}

impl PgS3CredentialsRepository {
    pub fn new(pool: PgPool, key: EncryptionKey) -> Self {
        Self { pool, key }
    }
}

#[async_trait]
impl S3CredentialsRepository for PgS3CredentialsRepository {
    async fn insert(
        &self,
        tenant_id: &str,
        description: &str,
        access_key: &str,
        secret_key: &str,
        claims: &serde_json::Value,
    ) -> RepositoryResult<InsertCredentialOutcome> {
        let encrypted_secret = crypto::encrypt(&self.key, secret_key)?;
        let mut tx = self.pool.begin().await?;
        // Serialize concurrent inserts for one tenant on its catalog row.
        sqlx::query("SELECT 1 FROM tenants WHERE id = $1 FOR UPDATE")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tenants_s3_credentials WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_one(&mut *tx)
                .await?;
        if count >= MAX_CREDENTIALS_PER_TENANT {
            tx.rollback().await?;
            return Ok(InsertCredentialOutcome::LimitReached);
        }
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO tenants_s3_credentials (
                tenant_id, description, access_key, secret_key, claims
            )
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(tenant_id)
        .bind(description)
        .bind(access_key)
        .bind(encrypted_secret)
        .bind(sqlx::types::Json(claims))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(InsertCredentialOutcome::Created(id))
    }

    async fn get_by_access_key(
        &self,
        tenant_id: &str,
        access_key: &str,
    ) -> RepositoryResult<Option<S3Credential>> {
        let row = sqlx::query_as::<_, TenantS3CredentialRow>(
            r#"
            SELECT *
            FROM tenants_s3_credentials
            WHERE tenant_id = $1 AND access_key = $2
            "#,
        )
        .bind(tenant_id)
        .bind(access_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(S3Credential {
                id: row.id,
                access_key: row.access_key,
                secret_key: crypto::decrypt(&self.key, &row.secret_key)?,
                claims: row.claims.0,
            })
        })
        .transpose()
    }

    async fn delete(&self, tenant_id: &str, id: Uuid) -> RepositoryResult<Option<String>> {
        let deleted: Option<(String,)> = sqlx::query_as(
            r#"
            DELETE FROM tenants_s3_credentials
            WHERE tenant_id = $1 AND id = $2
            RETURNING access_key
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deleted.map(|(access_key,)| access_key))
    }

    async fn list(&self, tenant_id: &str) -> RepositoryResult<Vec<S3CredentialSummary>> {
        Ok(sqlx::query_as::<_, S3CredentialSummary>(
            r#"
            SELECT id, description, access_key, created_at
            FROM tenants_s3_credentials
            WHERE tenant_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn count(&self, tenant_id: &str) -> RepositoryResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tenants_s3_credentials WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
