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

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::prelude::FromRow;
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

/// `"<kind>::<bucketName>::<logicalName>"`
pub fn canonical_resource_id(kind: &str, bucket_name: &str, logical_name: &str) -> String {
    format!("{kind}::{bucket_name}::{logical_name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    Active,
    Draining,
    Disabled,
}

impl FromStr for ShardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ShardStatus::Active),
            "draining" => Ok(ShardStatus::Draining),
            "disabled" => Ok(ShardStatus::Disabled),
            other => Err(format!("Invalid shard status: '{other}'")),
        }
    }
}

impl Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardStatus::Active => write!(f, "active"),
            ShardStatus::Draining => write!(f, "draining"),
            ShardStatus::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            "expired" => Ok(ReservationStatus::Expired),
            other => Err(format!("Invalid reservation status: '{other}'")),
        }
    }
}

impl Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationStatus::Pending => write!(f, "pending"),
            ReservationStatus::Confirmed => write!(f, "confirmed"),
            ReservationStatus::Cancelled => write!(f, "cancelled"),
            ReservationStatus::Expired => write!(f, "expired"),
        }
    }
}

/// A capacity-bounded placement bucket.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Shard {
    pub id: Uuid,
    pub kind: String,
    pub shard_key: String,
    pub capacity: i32,
    pub next_slot: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Shard {
    pub fn status(&self) -> Result<ShardStatus, String> {
        ShardStatus::from_str(&self.status)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ShardReservationRow {
    pub id: Uuid,
    pub kind: String,
    pub resource_id: String,
    pub tenant_id: String,
    pub shard_id: Uuid,
    pub shard_key: String,
    pub slot_no: i32,
    pub status: String,
    pub lease_expires_at: DateTime<Utc>,
}

/// What `reserve` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardReservation {
    #[serde(rename = "reservationId")]
    pub reservation_id: Uuid,
    #[serde(rename = "resourceId")]
    pub resource_id: String,
    #[serde(rename = "shardId")]
    pub shard_id: Uuid,
    #[serde(rename = "shardKey")]
    pub shard_key: String,
    #[serde(rename = "slotNo")]
    pub slot_no: i32,
    #[serde(rename = "leaseExpiresAt")]
    pub lease_expires_at: DateTime<Utc>,
}

impl From<ShardReservationRow> for ShardReservation {
    fn from(row: ShardReservationRow) -> Self {
        Self {
            reservation_id: row.id,
            resource_id: row.resource_id,
            shard_id: row.shard_id,
            shard_key: row.shard_key,
            slot_no: row.slot_no,
            lease_expires_at: row.lease_expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn canonical_resource_id_uses_double_colon_separators() {
        assert_eq!(
            canonical_resource_id("iceberg-table", "analytics", "events"),
            "iceberg-table::analytics::events"
        );
    }

    #[test]
    fn statuses_round_trip_through_display() {
        for status in [
            ReservationStatus::Pending,
            ReservationStatus::Confirmed,
            ReservationStatus::Cancelled,
            ReservationStatus::Expired,
        ] {
            assert_eq!(ReservationStatus::from_str(&status.to_string()), Ok(status));
        }
        for status in [
            ShardStatus::Active,
            ShardStatus::Draining,
            ShardStatus::Disabled,
        ] {
            assert_eq!(ShardStatus::from_str(&status.to_string()), Ok(status));
        }
        assert!(ReservationStatus::from_str("gone").is_err());
    }
}
