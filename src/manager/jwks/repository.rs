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
use crate::common::error::{RepositoryError, RepositoryResult};
use crate::manager::jwks::model::{JwkItem, TenantJwkRow};
use crate::manager::tenants::dto::TenantCursor;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

const TOGGLE_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Store for per-tenant JWKS rows. At most one active row exists per
/// `(tenant_id, kind)`, enforced by a partial unique index.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JwksRepository: Send + Sync {
    /// Inserts an active JWK. With `idempotent`, a conflict on the active
    /// `(tenant_id, kind)` pair returns the existing row's id instead of
    /// raising.
    async fn insert(
        &self,
        tenant_id: &str,
        content: &serde_json::Value,
        kind: &str,
        idempotent: bool,
    ) -> RepositoryResult<Uuid>;

    /// Atomically flips the active flag; returns whether a row actually
    /// changed state. Bounded by a query timeout.
    async fn toggle_active(
        &self,
        tenant_id: &str,
        id: Uuid,
        new_state: bool,
    ) -> RepositoryResult<bool>;

    async fn list_active(&self, tenant_id: &str) -> RepositoryResult<Vec<JwkItem>>;

    /// Tenants with no active JWK of `kind`, ordered by cursor. Drives the
    /// restartable backfill generator.
    async fn list_tenants_without_kind(
        &self,
        kind: &str,
        batch_size: i64,
        last_cursor: i64,
    ) -> RepositoryResult<Vec<TenantCursor>>;
}

pub struct PgJwksRepository {
    pool: PgPool,
    key: EncryptionKey,
}

impl PgJwksRepository {
    pub fn new(pool: PgPool, key: EncryptionKey) -> Self {
        Self { pool, key }
    }
}

#[async_trait]
impl JwksRepository for PgJwksRepository {
    async fn insert(
        &self,
        tenant_id: &str,
        content: &serde_json::Value,
        kind: &str,
        idempotent: bool,
    ) -> RepositoryResult<Uuid> {
        let encrypted = crypto::encrypt(&self.key, &content.to_string())?;
        let inserted: Result<(Uuid,), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO tenants_jwks (tenant_id, kind, content, active)
            VALUES ($1, $2, $3, true)
            RETURNING id
            "#,
        )
        .bind(tenant_id)
        .bind(kind)
        .bind(encrypted)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok((id,)) => Ok(id),
            Err(e) => {
                let repo_error = RepositoryError::from(e);
                if idempotent && repo_error.is_unique_violation() {
                    let (id,): (Uuid,) = sqlx::query_as(
                        r#"
                        SELECT id
                        FROM tenants_jwks
                        WHERE tenant_id = $1 AND kind = $2 AND active
                        "#,
                    )
                    .bind(tenant_id)
                    .bind(kind)
                    .fetch_one(&self.pool)
                    .await?;
                    Ok(id)
                } else {
                    Err(repo_error)
                }
            }
        }
    }

    async fn toggle_active(
        &self,
        tenant_id: &str,
        id: Uuid,
        new_state: bool,
    ) -> RepositoryResult<bool> {
        let query = sqlx::query(
            r#"
            UPDATE tenants_jwks
            SET active = $3
            WHERE tenant_id = $1 AND id = $2 AND active IS DISTINCT FROM $3
            "#,
        )
        .bind(tenant_id)
        .bind(id)
        .bind(new_state)
        .execute(&self.pool);
        let result = tokio::time::timeout(TOGGLE_QUERY_TIMEOUT, query)
            .await
            .map_err(|_| RepositoryError::Custom("toggle_active query timed out".to_string()))??;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self, tenant_id: &str) -> RepositoryResult<Vec<JwkItem>> {
        let rows = sqlx::query_as::<_, TenantJwkRow>(
            r#"
            SELECT *
            FROM tenants_jwks
            WHERE tenant_id = $1 AND active
            ORDER BY cursor_id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let decrypted = crypto::decrypt(&self.key, &row.content)?;
                let jwk: serde_json::Value = serde_json::from_str(&decrypted)
                    .map_err(|e| RepositoryError::Custom(format!("invalid stored JWK: {e}")))?;
                Ok(JwkItem {
                    id: row.id,
                    kind: row.kind,
                    jwk,
                })
            })
            .collect()
    }

    async fn list_tenants_without_kind(
        &self,
        kind: &str,
        batch_size: i64,
        last_cursor: i64,
    ) -> RepositoryResult<Vec<TenantCursor>> {
        Ok(sqlx::query_as::<_, TenantCursor>(
            r#"
            SELECT tenants.id, tenants.cursor_id
            FROM tenants
            WHERE NOT EXISTS (
                    SELECT 1
                    FROM tenants_jwks
                    WHERE tenants_jwks.tenant_id = tenants.id
                        AND tenants_jwks.kind = $1
                        AND tenants_jwks.active
                )
                AND tenants.cursor_id > $3
            ORDER BY tenants.cursor_id
            LIMIT $2
            "#,
        )
        .bind(kind)
        .bind(batch_size)
        .bind(last_cursor)
        .fetch_all(&self.pool)
        .await?)
    }
}
