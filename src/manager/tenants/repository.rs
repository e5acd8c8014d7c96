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
use crate::manager::tenants::dto::{CreateTenantRequest, PatchTenantRequest, TenantCursor};
use crate::manager::tenants::model::{Tenant, TenantConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use sqlx::PgPool;

/// Catalog access for tenant rows. Decryption and encryption of secret
/// columns happen here, at the database boundary; callers only ever see
/// [`TenantConfig`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantsRepository: Send + Sync {
    async fn get_by_id(&self, tenant_id: &str) -> RepositoryResult<Option<TenantConfig>>;
    async fn upsert(
        &self,
        tenant_id: &str,
        input: &CreateTenantRequest,
    ) -> RepositoryResult<TenantConfig>;
    async fn patch(
        &self,
        tenant_id: &str,
        input: &PatchTenantRequest,
    ) -> RepositoryResult<Option<TenantConfig>>;
    async fn delete(&self, tenant_id: &str) -> RepositoryResult<bool>;
    /// Tenants whose applied version differs from `target_version` and
    /// whose migration status is not a terminal failure, in cursor order.
    async fn list_to_migrate(
        &self,
        target_version: &str,
        batch_size: i64,
        last_cursor: i64,
    ) -> RepositoryResult<Vec<TenantCursor>>;
    async fn record_migration_success(
        &self,
        tenant_id: &str,
        version: &str,
    ) -> RepositoryResult<()>;
    async fn record_migration_failure(&self, tenant_id: &str) -> RepositoryResult<()>;
    /// FAILED rows older than `failed_before` become FAILED_STALE.
    async fn mark_stale_failures(&self, failed_before: DateTime<Utc>) -> RepositoryResult<u64>;
}

pub struct PgTenantsRepository {
    pool: PgPool,
    key: EncryptionKey,
}

impl PgTenantsRepository {
    pub fn new(pool: PgPool, key: EncryptionKey) -> Self {
        Self { pool, key }
    }
}

#[async_trait]
impl TenantsRepository for PgTenantsRepository {
    async fn get_by_id(&self, tenant_id: &str) -> RepositoryResult<Option<TenantConfig>> {
        let row = sqlx::query_as::<_, Tenant>(
            r#"
            SELECT *
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| TenantConfig::from_row(row, &self.key)).transpose()
    }

    async fn upsert(
        &self,
        tenant_id: &str,
        input: &CreateTenantRequest,
    ) -> RepositoryResult<TenantConfig> {
        let database_url = crypto::encrypt(&self.key, &input.database_url)?;
        let database_pool_url = input
            .database_pool_url
            .as_deref()
            .map(|url| crypto::encrypt(&self.key, url))
            .transpose()?;
        let jwt_secret = crypto::encrypt(&self.key, &input.jwt_secret)?;
        let service_key = crypto::encrypt(&self.key, &input.service_key)?;

        let row = sqlx::query_as::<_, Tenant>(
            r#"
            INSERT INTO tenants (
                id, database_url, database_pool_url, database_pool_mode,
                max_connections, file_size_limit, features, jwt_secret,
                jwks, service_key, tracing_mode, disabled_events
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                database_url = EXCLUDED.database_url,
                database_pool_url = EXCLUDED.database_pool_url,
                database_pool_mode = EXCLUDED.database_pool_mode,
                max_connections = EXCLUDED.max_connections,
                file_size_limit = EXCLUDED.file_size_limit,
                features = EXCLUDED.features,
                jwt_secret = EXCLUDED.jwt_secret,
                jwks = EXCLUDED.jwks,
                service_key = EXCLUDED.service_key,
                tracing_mode = EXCLUDED.tracing_mode,
                disabled_events = EXCLUDED.disabled_events
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(database_url)
        .bind(database_pool_url)
        .bind(&input.database_pool_mode)
        .bind(input.max_connections)
        .bind(input.file_size_limit)
        .bind(sqlx::types::Json(&input.features))
        .bind(jwt_secret)
        .bind(input.jwks.as_ref().map(sqlx::types::Json))
        .bind(service_key)
        .bind(&input.tracing_mode)
        .bind(sqlx::types::Json(&input.disabled_events))
        .fetch_one(&self.pool)
        .await?;
        TenantConfig::from_row(row, &self.key)
    }

    async fn patch(
        &self,
        tenant_id: &str,
        input: &PatchTenantRequest,
    ) -> RepositoryResult<Option<TenantConfig>> {
        let database_url = input
            .database_url
            .as_deref()
            .map(|url| crypto::encrypt(&self.key, url))
            .transpose()?;
        let database_pool_url = input
            .database_pool_url
            .as_deref()
            .map(|url| crypto::encrypt(&self.key, url))
            .transpose()?;
        let jwt_secret = input
            .jwt_secret
            .as_deref()
            .map(|secret| crypto::encrypt(&self.key, secret))
            .transpose()?;
        let service_key = input
            .service_key
            .as_deref()
            .map(|key| crypto::encrypt(&self.key, key))
            .transpose()?;

        let row = sqlx::query_as::<_, Tenant>(
            r#"
            UPDATE tenants SET
                database_url = COALESCE($2, database_url),
                database_pool_url = COALESCE($3, database_pool_url),
                database_pool_mode = COALESCE($4, database_pool_mode),
                max_connections = COALESCE($5, max_connections),
                file_size_limit = COALESCE($6, file_size_limit),
                features = COALESCE($7, features),
                jwt_secret = COALESCE($8, jwt_secret),
                jwks = COALESCE($9, jwks),
                service_key = COALESCE($10, service_key),
                tracing_mode = COALESCE($11, tracing_mode),
                disabled_events = COALESCE($12, disabled_events)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(database_url)
        .bind(database_pool_url)
        .bind(&input.database_pool_mode)
        .bind(input.max_connections)
        .bind(input.file_size_limit)
        .bind(input.features.as_ref().map(sqlx::types::Json))
        .bind(jwt_secret)
        .bind(input.jwks.as_ref().map(sqlx::types::Json))
        .bind(service_key)
        .bind(&input.tracing_mode)
        .bind(input.disabled_events.as_ref().map(sqlx::types::Json))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| TenantConfig::from_row(row, &self.key)).transpose()
    }

    async fn delete(&self, tenant_id: &str) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_to_migrate(
        &self,
        target_version: &str,
        batch_size: i64,
        last_cursor: i64,
    ) -> RepositoryResult<Vec<TenantCursor>> {
        Ok(sqlx::query_as::<_, TenantCursor>(
            r#"
            SELECT id, cursor_id
            FROM tenants
            WHERE migrations_version IS DISTINCT FROM $1
                AND (migrations_status IS NULL
                     OR migrations_status NOT IN ('FAILED', 'FAILED_STALE'))
                AND cursor_id > $3
            ORDER BY cursor_id
            LIMIT $2
            "#,
        )
        .bind(target_version)
        .bind(batch_size)
        .bind(last_cursor)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn record_migration_success(
        &self,
        tenant_id: &str,
        version: &str,
    ) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            UPDATE tenants SET
                migrations_version = $2,
                migrations_status = 'COMPLETED',
                migrations_failed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_migration_failure(&self, tenant_id: &str) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            UPDATE tenants SET
                migrations_status = 'FAILED',
                migrations_failed_at = COALESCE(migrations_failed_at, now())
            WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_stale_failures(&self, failed_before: DateTime<Utc>) -> RepositoryResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tenants SET
                migrations_status = 'FAILED_STALE'
            WHERE migrations_status = 'FAILED'
                AND migrations_failed_at < $1
            "#,
        )
        .bind(failed_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
