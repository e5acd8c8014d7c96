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

//! Transaction-scoped access to a tenant database.
//!
//! Every request-path query runs inside a [`ScopedTransaction`] carrying
//! the caller's JWT claims as `set_config(..., true)` values, which the
//! tenant schema's row-level-security policies consume. Transactions are
//! RAII guards: dropping one without commit rolls it back through the
//! driver.

use crate::common::error::{
    RepositoryError, StorageError, StorageResult, sqlx_error_is_pool_saturation,
};
use sqlx::postgres::PgConnection;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Saturation retry schedule: 50 ms base, doubled per attempt, capped at
/// 200 ms, at most 10 attempts inside a 3 second budget.
const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_CAP: Duration = Duration::from_millis(200);
const RETRY_MAX_ATTEMPTS: u32 = 10;
const RETRY_BUDGET: Duration = Duration::from_secs(3);

pub fn retry_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    RETRY_BASE.saturating_mul(factor).min(RETRY_CAP)
}

/// How a [`TenantConnection`] behaves for one tenant.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub tenant_id: String,
    pub is_external_pool: bool,
    pub is_single_use: bool,
    pub search_path: String,
    pub statement_timeout: Option<Duration>,
    pub super_user_role: String,
    pub anon_role: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Overrides the configured statement timeout for this transaction.
    pub statement_timeout: Option<Duration>,
}

/// Request-scoped configuration applied inside the transaction via
/// `set_config(..., true)`. When `role` is absent the connection's anon
/// role is applied; callers that authenticated a user must set it.
#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    pub role: Option<String>,
    pub jwt: Option<String>,
    pub sub: Option<String>,
    pub claims: Option<serde_json::Value>,
    pub headers: Option<serde_json::Value>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub operation: Option<String>,
}

/// A pooled handle to one tenant database.
#[derive(Clone)]
pub struct TenantConnection {
    pool: PgPool,
    options: ConnectionOptions,
}

impl TenantConnection {
    pub fn new(pool: PgPool, options: ConnectionOptions) -> Self {
        Self { pool, options }
    }

    pub fn tenant_id(&self) -> &str {
        &self.options.tenant_id
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begins a transaction with bounded retry on pool saturation.
    ///
    /// Acquire timeouts surface as [`StorageError::DatabaseTimeout`].
    /// "no more connections allowed" / "max clients reached" responses are
    /// retried with capped exponential backoff before giving up.
    pub async fn transaction(
        &self,
        options: Option<TransactionOptions>,
    ) -> StorageResult<ScopedTransaction> {
        let started = Instant::now();
        let mut attempt = 0u32;
        let tx = loop {
            attempt += 1;
            match self.pool.begin().await {
                Ok(tx) => break tx,
                Err(sqlx::Error::PoolTimedOut) => return Err(StorageError::DatabaseTimeout),
                Err(e) if sqlx_error_is_pool_saturation(&e) => {
                    let delay = retry_delay(attempt);
                    if attempt >= RETRY_MAX_ATTEMPTS
                        || started.elapsed() + delay > RETRY_BUDGET
                    {
                        warn!(
                            "pool saturated, giving up: tenant={} attempts={attempt}",
                            self.options.tenant_id
                        );
                        return Err(StorageError::DatabaseTimeout);
                    }
                    debug!(
                        "pool saturated, retrying: tenant={} attempt={attempt} delay_ms={}",
                        self.options.tenant_id,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(StorageError::from_repository(RepositoryError::from(e)));
                }
            }
        };
        if attempt > 1 {
            debug!(
                "transaction acquired after retries: tenant={} attempts={attempt} elapsed_ms={}",
                self.options.tenant_id,
                started.elapsed().as_millis()
            );
        }

        let mut scoped = ScopedTransaction { tx };
        let timeout = options
            .and_then(|options| options.statement_timeout)
            .or(self.options.statement_timeout);
        if let Some(timeout) = timeout
            && timeout > Duration::ZERO
        {
            scoped
                .execute_raw(&format!(
                    "SET LOCAL statement_timeout = {}",
                    timeout.as_millis()
                ))
                .await?;
        }
        if self.options.is_external_pool {
            // Session poolers hand out arbitrary sessions; pin the search
            // path inside the transaction where it is guaranteed to hold.
            scoped
                .execute_raw(&format!(
                    "SET LOCAL search_path = {}",
                    quote_identifier(&self.options.search_path)
                ))
                .await?;
        }
        Ok(scoped)
    }

    /// A view of the same pool whose scope applies the stored super-user
    /// role instead of the caller's.
    pub fn as_super_user(&self) -> TenantConnection {
        let mut options = self.options.clone();
        options.anon_role = options.super_user_role.clone();
        TenantConnection {
            pool: self.pool.clone(),
            options,
        }
    }

    /// The effective role for a scope that did not authenticate a user.
    pub fn default_role(&self) -> &str {
        &self.options.anon_role
    }

    /// Single-use external pools are destroyed on dispose; everything else
    /// persists in the registry.
    pub async fn dispose(self) {
        if self.options.is_external_pool && self.options.is_single_use {
            self.pool.close().await;
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// An open transaction against a tenant database.
pub struct ScopedTransaction {
    tx: Transaction<'static, Postgres>,
}

impl ScopedTransaction {
    /// Raw executor access for repository queries.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    async fn execute_raw(&mut self, sql: &str) -> StorageResult<()> {
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(RepositoryError::from)
            .map_err(StorageError::from_repository)?;
        Ok(())
    }

    /// Writes the request scope for row-level-security policies. All nine
    /// settings are written in one round trip; absent values clear to the
    /// empty string so a recycled session never leaks the previous scope.
    pub async fn set_scope(&mut self, connection: &TenantConnection, scope: &RequestScope) -> StorageResult<()> {
        let role = scope
            .role
            .clone()
            .unwrap_or_else(|| connection.default_role().to_string());
        let claims = scope
            .claims
            .as_ref()
            .map(|claims| claims.to_string())
            .unwrap_or_default();
        let headers = scope
            .headers
            .as_ref()
            .map(|headers| headers.to_string())
            .unwrap_or_default();
        sqlx::query(
            r#"
            SELECT set_config('role', $1, true),
                   set_config('request.jwt.claim.role', $1, true),
                   set_config('request.jwt', $2, true),
                   set_config('request.jwt.claim.sub', $3, true),
                   set_config('request.jwt.claims', $4, true),
                   set_config('request.headers', $5, true),
                   set_config('request.method', $6, true),
                   set_config('request.path', $7, true),
                   set_config('storage.operation', $8, true)
            "#,
        )
        .bind(role)
        .bind(scope.jwt.clone().unwrap_or_default())
        .bind(scope.sub.clone().unwrap_or_default())
        .bind(claims)
        .bind(headers)
        .bind(scope.method.clone().unwrap_or_default())
        .bind(scope.path.clone().unwrap_or_default())
        .bind(scope.operation.clone().unwrap_or_default())
        .execute(&mut *self.tx)
        .await
        .map_err(RepositoryError::from)
        .map_err(StorageError::from_repository)?;
        Ok(())
    }

    pub async fn commit(self) -> StorageResult<()> {
        self.tx
            .commit()
            .await
            .map_err(RepositoryError::from)
            .map_err(StorageError::from_repository)
    }

    pub async fn rollback(self) -> StorageResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(RepositoryError::from)
            .map_err(StorageError::from_repository)
    }

    /// Best-effort rollback on a failed operation. The original cause is
    /// surfaced; a rollback failure is reported alongside it as one
    /// aggregated error.
    pub async fn rollback_on(self, cause: StorageError) -> StorageError {
        match self.tx.rollback().await {
            Ok(()) => cause,
            Err(rollback_error) => {
                error!("rollback failed after error: cause={cause} rollback={rollback_error}");
                StorageError::Internal(format!(
                    "{cause}; additionally, rollback failed: {rollback_error}"
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn retry_delays_follow_the_capped_schedule() {
        assert_eq!(retry_delay(1), Duration::from_millis(50));
        assert_eq!(retry_delay(2), Duration::from_millis(100));
        assert_eq!(retry_delay(3), Duration::from_millis(200));
        assert_eq!(retry_delay(4), Duration::from_millis(200));
        assert_eq!(retry_delay(10), Duration::from_millis(200));
    }

    #[test]
    fn full_retry_schedule_fits_the_budget() {
        let total: Duration = (1..RETRY_MAX_ATTEMPTS).map(retry_delay).sum();
        assert!(total <= RETRY_BUDGET);
    }

    #[test]
    fn identifiers_are_quoted_for_set_local() {
        assert_eq!(quote_identifier("storage"), "\"storage\"");
        assert_eq!(quote_identifier("sto\"rage"), "\"sto\"\"rage\"");
    }

    #[test]
    fn super_user_view_swaps_the_default_role() {
        let options = ConnectionOptions {
            tenant_id: "t1".to_string(),
            is_external_pool: false,
            is_single_use: false,
            search_path: "storage".to_string(),
            statement_timeout: None,
            super_user_role: "postgres".to_string(),
            anon_role: "anon".to_string(),
        };
        let pool = PgPool::connect_lazy("postgresql://u:p@localhost:1/t").unwrap();
        let connection = TenantConnection::new(pool, options);
        assert_eq!(connection.default_role(), "anon");
        assert_eq!(connection.as_super_user().default_role(), "postgres");
    }
}
