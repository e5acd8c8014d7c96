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

//! Capacity-bounded slot allocation with leased reservations.
//!
//! Reservation selection per resource is serialized through a transaction
//! advisory lock on the canonical id; slot selection across resources is
//! serialized by `FOR UPDATE` on the chosen shard row. A reservation is a
//! lease: confirm it before `lease_expires_at` or lose the slot.

use crate::common::error::{RepositoryError, StorageError, StorageResult};
use crate::manager::shards::model::{
    ReservationStatus, Shard, ShardReservation, ShardReservationRow, ShardStatus,
    canonical_resource_id,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_LEASE_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub kind: String,
    pub tenant_id: String,
    pub bucket_name: String,
    pub logical_name: String,
    pub lease_ms: Option<i64>,
}

impl ReserveRequest {
    pub fn resource_id(&self) -> String {
        canonical_resource_id(&self.kind, &self.bucket_name, &self.logical_name)
    }

    fn lease_ms(&self) -> i64 {
        self.lease_ms.unwrap_or(DEFAULT_LEASE_MS).max(1)
    }
}

/// The shard reservation ledger.
#[async_trait]
pub trait ShardCatalog: Send + Sync {
    /// Idempotent on `(kind, shard_key)`; a second call returns the
    /// existing shard row unchanged.
    async fn create_shard(
        &self,
        kind: &str,
        shard_key: &str,
        capacity: i32,
        status: Option<ShardStatus>,
    ) -> StorageResult<Shard>;

    async fn reserve(&self, request: &ReserveRequest) -> StorageResult<ShardReservation>;

    /// `pending -> confirmed`, recording the logical resource on the slot.
    async fn confirm(&self, reservation_id: Uuid, resource: &str) -> StorageResult<()>;

    /// Idempotent; a missing reservation is a no-op.
    async fn cancel(&self, reservation_id: Uuid) -> StorageResult<()>;

    /// Marks every pending reservation past its lease as expired.
    async fn expire_leases(&self) -> StorageResult<u64>;

    async fn free_by_location(&self, shard_id: Uuid, slot_no: i32) -> StorageResult<()>;

    async fn free_by_resource(&self, shard_id: Uuid, resource_id: &str) -> StorageResult<()>;

    async fn find_shard_by_resource_id(
        &self,
        kind: &str,
        resource_id: &str,
    ) -> StorageResult<Option<Shard>>;
}

/// Classifies a failed confirm from the reservation's observed state.
pub fn classify_confirm_failure(
    reservation_id: Uuid,
    observed: Option<(ReservationStatus, DateTime<Utc>)>,
    now: DateTime<Utc>,
) -> StorageError {
    match observed {
        None => StorageError::ReservationNotFound(reservation_id),
        Some((ReservationStatus::Pending, lease_expires_at)) if lease_expires_at <= now => {
            StorageError::ExpiredReservation(reservation_id)
        }
        Some((ReservationStatus::Pending, _)) => {
            // The UPDATE matched nothing yet the row looks confirmable:
            // a racer must have taken it between the two statements.
            StorageError::InvalidReservationStatus {
                expected: ReservationStatus::Pending.to_string(),
                actual: "contended".to_string(),
            }
        }
        Some((status, _)) => StorageError::InvalidReservationStatus {
            expected: ReservationStatus::Pending.to_string(),
            actual: status.to_string(),
        },
    }
}

pub struct PgShardCatalog {
    pool: PgPool,
}

impl PgShardCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> StorageResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(RepositoryError::from)
            .map_err(StorageError::from_repository)
    }

    /// Re-read after a uniqueness conflict: the racing winner's
    /// reservation, if it is still live.
    async fn find_live_reservation(
        &self,
        kind: &str,
        resource_id: &str,
    ) -> StorageResult<Option<ShardReservationRow>> {
        sqlx::query_as::<_, ShardReservationRow>(
            r#"
            SELECT id, kind, resource_id, tenant_id, shard_id, shard_key,
                   slot_no, status, lease_expires_at
            FROM shard_reservations
            WHERE kind = $1 AND resource_id = $2
                AND status IN ('pending', 'confirmed')
            "#,
        )
        .bind(kind)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)
        .map_err(StorageError::from_repository)
    }
}

fn db_error(e: sqlx::Error) -> StorageError {
    StorageError::from_repository(RepositoryError::from(e))
}

#[async_trait]
impl ShardCatalog for PgShardCatalog {
    async fn create_shard(
        &self,
        kind: &str,
        shard_key: &str,
        capacity: i32,
        status: Option<ShardStatus>,
    ) -> StorageResult<Shard> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO shards (kind, shard_key, capacity, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, shard_key) DO NOTHING
            "#,
        )
        .bind(kind)
        .bind(shard_key)
        .bind(capacity)
        .bind(status.unwrap_or(ShardStatus::Active).to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
        let shard = sqlx::query_as::<_, Shard>(
            r#"
            SELECT *
            FROM shards
            WHERE kind = $1 AND shard_key = $2
            "#,
        )
        .bind(kind)
        .bind(shard_key)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;
        Ok(shard)
    }

    async fn reserve(&self, request: &ReserveRequest) -> StorageResult<ShardReservation> {
        let resource_id = request.resource_id();
        let mut tx = self.begin().await?;

        // Serialize all work on this resource across the cluster.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&resource_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let existing = sqlx::query_as::<_, ShardReservationRow>(
            r#"
            SELECT id, kind, resource_id, tenant_id, shard_id, shard_key,
                   slot_no, status, lease_expires_at
            FROM shard_reservations
            WHERE kind = $1 AND resource_id = $2
            "#,
        )
        .bind(&request.kind)
        .bind(&resource_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error)?;

        for row in &existing {
            let status = ReservationStatus::from_str(&row.status)
                .map_err(StorageError::Internal)?;
            if matches!(
                status,
                ReservationStatus::Pending | ReservationStatus::Confirmed
            ) {
                tx.commit().await.map_err(db_error)?;
                return Ok(row.clone().into());
            }
        }
        // Terminal leftovers give their slots back before we allocate.
        for row in &existing {
            sqlx::query(
                r#"
                DELETE FROM shard_slots
                WHERE shard_id = $1 AND slot_no = $2 AND resource_id IS NULL
                "#,
            )
            .bind(row.shard_id)
            .bind(row.slot_no)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
            sqlx::query("DELETE FROM shard_reservations WHERE id = $1")
                .bind(row.id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }

        // Tightest active shard first; FOR UPDATE serializes slot handout.
        let shard = sqlx::query_as::<_, Shard>(
            r#"
            SELECT shards.*
            FROM shards
            WHERE shards.kind = $1
                AND shards.status = 'active'
                AND shards.capacity > (
                    SELECT COUNT(*)
                    FROM shard_slots
                    WHERE shard_slots.shard_id = shards.id
                )
            ORDER BY shards.capacity - (
                    SELECT COUNT(*)
                    FROM shard_slots
                    WHERE shard_slots.shard_id = shards.id
                ) ASC
            LIMIT 1
            FOR UPDATE OF shards
            "#,
        )
        .bind(&request.kind)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or(StorageError::NoActiveShard)?;

        let slot_no = shard.next_slot;
        sqlx::query("UPDATE shards SET next_slot = next_slot + 1 WHERE id = $1")
            .bind(shard.id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        sqlx::query(
            r#"
            INSERT INTO shard_slots (shard_id, slot_no, tenant_id)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(shard.id)
        .bind(slot_no)
        .bind(&request.tenant_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        // A stale reservation may still reference this slot number.
        sqlx::query(
            r#"
            DELETE FROM shard_reservations
            WHERE shard_id = $1 AND slot_no = $2
                AND status IN ('cancelled', 'expired')
            "#,
        )
        .bind(shard.id)
        .bind(slot_no)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let lease_expires_at = Utc::now() + chrono::Duration::milliseconds(request.lease_ms());
        let inserted: Result<(Uuid,), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO shard_reservations (
                kind, resource_id, tenant_id, shard_id, shard_key,
                slot_no, status, lease_expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7)
            RETURNING id
            "#,
        )
        .bind(&request.kind)
        .bind(&resource_id)
        .bind(&request.tenant_id)
        .bind(shard.id)
        .bind(&shard.shard_key)
        .bind(slot_no)
        .bind(lease_expires_at)
        .fetch_one(&mut *tx)
        .await;

        match inserted {
            Ok((reservation_id,)) => {
                tx.commit().await.map_err(db_error)?;
                debug!(
                    "reserved slot: resource={resource_id} shard={} slot={slot_no}",
                    shard.shard_key
                );
                Ok(ShardReservation {
                    reservation_id,
                    resource_id,
                    shard_id: shard.id,
                    shard_key: shard.shard_key,
                    slot_no,
                    lease_expires_at,
                })
            }
            Err(e) => {
                let repo_error = RepositoryError::from(e);
                if repo_error.is_unique_violation() {
                    // A racer slipped in: drop our work and adopt theirs.
                    tx.rollback().await.map_err(db_error)?;
                    return self
                        .find_live_reservation(&request.kind, &resource_id)
                        .await?
                        .map(ShardReservation::from)
                        .ok_or_else(|| StorageError::Database(repo_error));
                }
                Err(StorageError::from_repository(repo_error))
            }
        }
    }

    async fn confirm(&self, reservation_id: Uuid, resource: &str) -> StorageResult<()> {
        let mut tx = self.begin().await?;
        let confirmed: Option<(Uuid, i32)> = sqlx::query_as(
            r#"
            UPDATE shard_reservations
            SET status = 'confirmed'
            WHERE id = $1 AND status = 'pending' AND lease_expires_at > now()
            RETURNING shard_id, slot_no
            "#,
        )
        .bind(reservation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        if let Some((shard_id, slot_no)) = confirmed {
            sqlx::query(
                r#"
                UPDATE shard_slots
                SET resource_id = $3
                WHERE shard_id = $1 AND slot_no = $2
                "#,
            )
            .bind(shard_id)
            .bind(slot_no)
            .bind(resource)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
            tx.commit().await.map_err(db_error)?;
            return Ok(());
        }

        let observed: Option<(String, DateTime<Utc>, Uuid, i32)> = sqlx::query_as(
            r#"
            SELECT status, lease_expires_at, shard_id, slot_no
            FROM shard_reservations
            WHERE id = $1
            "#,
        )
        .bind(reservation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let now = Utc::now();
        let failure = classify_confirm_failure(
            reservation_id,
            observed
                .as_ref()
                .map(|(status, lease, _, _)| {
                    ReservationStatus::from_str(status).map(|status| (status, *lease))
                })
                .transpose()
                .map_err(StorageError::Internal)?,
            now,
        );
        if let (StorageError::ExpiredReservation(_), Some((_, _, shard_id, slot_no))) =
            (&failure, &observed)
        {
            // Lease ran out: release the slot and record the expiry.
            sqlx::query("UPDATE shard_reservations SET status = 'expired' WHERE id = $1")
                .bind(reservation_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            sqlx::query("DELETE FROM shard_slots WHERE shard_id = $1 AND slot_no = $2")
                .bind(shard_id)
                .bind(slot_no)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }
        tx.commit().await.map_err(db_error)?;
        Err(failure)
    }

    async fn cancel(&self, reservation_id: Uuid) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE shard_reservations
            SET status = 'cancelled'
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(reservation_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn expire_leases(&self) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE shard_reservations
            SET status = 'expired'
            WHERE status = 'pending' AND lease_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn free_by_location(&self, shard_id: Uuid, slot_no: i32) -> StorageResult<()> {
        sqlx::query("DELETE FROM shard_slots WHERE shard_id = $1 AND slot_no = $2")
            .bind(shard_id)
            .bind(slot_no)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn free_by_resource(&self, shard_id: Uuid, resource_id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM shard_slots WHERE shard_id = $1 AND resource_id = $2")
            .bind(shard_id)
            .bind(resource_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn find_shard_by_resource_id(
        &self,
        kind: &str,
        resource_id: &str,
    ) -> StorageResult<Option<Shard>> {
        sqlx::query_as::<_, Shard>(
            r#"
            SELECT shards.*
            FROM shards
            JOIN shard_reservations
                ON shard_reservations.shard_id = shards.id
            WHERE shard_reservations.kind = $1
                AND shard_reservations.resource_id = $2
                AND shard_reservations.status IN ('pending', 'confirmed')
            "#,
        )
        .bind(kind)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }
}

/// Degenerate ledger for single-tenant deployments: one always-available
/// shard, trivial reservation ids, no persistence.
pub struct SingleShard;

const SINGLE_SHARD_KEY: &str = "single";

#[async_trait]
impl ShardCatalog for SingleShard {
    async fn create_shard(
        &self,
        kind: &str,
        shard_key: &str,
        capacity: i32,
        _status: Option<ShardStatus>,
    ) -> StorageResult<Shard> {
        Ok(Shard {
            id: Uuid::nil(),
            kind: kind.to_string(),
            shard_key: shard_key.to_string(),
            capacity,
            next_slot: 0,
            status: ShardStatus::Active.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn reserve(&self, request: &ReserveRequest) -> StorageResult<ShardReservation> {
        Ok(ShardReservation {
            reservation_id: Uuid::new_v4(),
            resource_id: request.resource_id(),
            shard_id: Uuid::nil(),
            shard_key: SINGLE_SHARD_KEY.to_string(),
            slot_no: 0,
            lease_expires_at: Utc::now() + chrono::Duration::milliseconds(request.lease_ms()),
        })
    }

    async fn confirm(&self, _reservation_id: Uuid, _resource: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn cancel(&self, _reservation_id: Uuid) -> StorageResult<()> {
        Ok(())
    }

    async fn expire_leases(&self) -> StorageResult<u64> {
        Ok(0)
    }

    async fn free_by_location(&self, _shard_id: Uuid, _slot_no: i32) -> StorageResult<()> {
        Ok(())
    }

    async fn free_by_resource(&self, _shard_id: Uuid, _resource_id: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn find_shard_by_resource_id(
        &self,
        _kind: &str,
        _resource_id: &str,
    ) -> StorageResult<Option<Shard>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request() -> ReserveRequest {
        ReserveRequest {
            kind: "iceberg-table".to_string(),
            tenant_id: "t1".to_string(),
            bucket_name: "analytics".to_string(),
            logical_name: "events".to_string(),
            lease_ms: None,
        }
    }

    #[test]
    fn reserve_request_defaults_the_lease() {
        assert_eq!(request().lease_ms(), DEFAULT_LEASE_MS);
        let short = ReserveRequest {
            lease_ms: Some(50),
            ..request()
        };
        assert_eq!(short.lease_ms(), 50);
    }

    #[test]
    fn confirm_failure_classification() {
        let id = Uuid::new_v4();
        let now = Utc::now();

        assert!(matches!(
            classify_confirm_failure(id, None, now),
            StorageError::ReservationNotFound(found) if found == id
        ));
        assert!(matches!(
            classify_confirm_failure(
                id,
                Some((ReservationStatus::Pending, now - chrono::Duration::seconds(1))),
                now
            ),
            StorageError::ExpiredReservation(_)
        ));
        assert!(matches!(
            classify_confirm_failure(
                id,
                Some((ReservationStatus::Cancelled, now + chrono::Duration::seconds(60))),
                now
            ),
            StorageError::InvalidReservationStatus { actual, .. } if actual == "cancelled"
        ));
    }

    #[tokio::test]
    async fn single_shard_pretends_everything_is_available() {
        let ledger = SingleShard;
        let reservation = ledger.reserve(&request()).await.unwrap();
        assert_eq!(reservation.shard_key, SINGLE_SHARD_KEY);
        assert_eq!(reservation.slot_no, 0);
        assert_eq!(
            reservation.resource_id,
            "iceberg-table::analytics::events"
        );
        ledger
            .confirm(reservation.reservation_id, &reservation.resource_id)
            .await
            .unwrap();
        ledger.cancel(reservation.reservation_id).await.unwrap();
        ledger.cancel(Uuid::new_v4()).await.unwrap();
        assert_eq!(ledger.expire_leases().await.unwrap(), 0);
        assert_eq!(
            ledger
                .find_shard_by_resource_id("iceberg-table", &reservation.resource_id)
                .await
                .unwrap(),
            None
        );
    }
}
