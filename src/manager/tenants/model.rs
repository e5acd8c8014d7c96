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
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

/// Raw `tenants` row. Secret columns hold AES-GCM ciphertext; use
/// [`TenantConfig::from_row`] to cross the decryption boundary.
#[derive(Debug, Clone, FromRow)]
pub struct Tenant {
    pub id: String,
    pub database_url: String,
    pub database_pool_url: Option<String>,
    pub database_pool_mode: Option<String>,
    pub max_connections: i32,
    pub file_size_limit: i64,
    pub features: sqlx::types::Json<HashMap<String, bool>>,
    pub jwt_secret: String,
    pub jwks: Option<sqlx::types::Json<serde_json::Value>>,
    pub service_key: String,
    pub migrations_version: Option<String>,
    pub migrations_status: Option<String>,
    pub migrations_failed_at: Option<DateTime<Utc>>,
    pub tracing_mode: Option<String>,
    pub disabled_events: Option<sqlx::types::Json<Vec<String>>>,
    pub cursor_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabasePoolMode {
    SingleUse,
    Recycled,
}

impl FromStr for DatabasePoolMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_use" => Ok(DatabasePoolMode::SingleUse),
            "recycled" => Ok(DatabasePoolMode::Recycled),
            other => Err(format!("Invalid database pool mode: '{other}'")),
        }
    }
}

impl Display for DatabasePoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabasePoolMode::SingleUse => write!(f, "single_use"),
            DatabasePoolMode::Recycled => write!(f, "recycled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantMigrationStatus {
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "FAILED_STALE")]
    FailedStale,
}

impl FromStr for TenantMigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(TenantMigrationStatus::Completed),
            "FAILED" => Ok(TenantMigrationStatus::Failed),
            "FAILED_STALE" => Ok(TenantMigrationStatus::FailedStale),
            other => Err(format!("Invalid migration status: '{other}'")),
        }
    }
}

impl Display for TenantMigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TenantMigrationStatus::Completed => write!(f, "COMPLETED"),
            TenantMigrationStatus::Failed => write!(f, "FAILED"),
            TenantMigrationStatus::FailedStale => write!(f, "FAILED_STALE"),
        }
    }
}

/// Decrypted tenant configuration as consumed by the request path.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub database_url: String,
    pub database_pool_url: Option<String>,
    pub database_pool_mode: Option<DatabasePoolMode>,
    pub max_connections: u32,
    pub file_size_limit: i64,
    pub features: HashMap<String, bool>,
    pub jwt_secret: String,
    pub jwks: Option<serde_json::Value>,
    pub service_key: String,
    pub migrations_version: Option<String>,
    pub migrations_status: Option<TenantMigrationStatus>,
    pub tracing_mode: Option<String>,
    pub disabled_events: Vec<String>,
}

impl TenantConfig {
    pub fn from_row(row: Tenant, key: &EncryptionKey) -> RepositoryResult<Self> {
        let database_pool_mode = row
            .database_pool_mode
            .as_deref()
            .map(DatabasePoolMode::from_str)
            .transpose()
            .map_err(RepositoryError::Custom)?;
        let migrations_status = row
            .migrations_status
            .as_deref()
            .map(TenantMigrationStatus::from_str)
            .transpose()
            .map_err(RepositoryError::Custom)?;
        Ok(Self {
            tenant_id: row.id,
            database_url: crypto::decrypt(key, &row.database_url)?,
            database_pool_url: row
                .database_pool_url
                .as_deref()
                .map(|url| crypto::decrypt(key, url))
                .transpose()?,
            database_pool_mode,
            max_connections: u32::try_from(row.max_connections.max(1)).unwrap_or(1),
            file_size_limit: row.file_size_limit,
            features: row.features.0,
            jwt_secret: crypto::decrypt(key, &row.jwt_secret)?,
            jwks: row.jwks.map(|jwks| jwks.0),
            service_key: crypto::decrypt(key, &row.service_key)?,
            migrations_version: row.migrations_version,
            migrations_status,
            tracing_mode: row.tracing_mode,
            disabled_events: row.disabled_events.map(|events| events.0).unwrap_or_default(),
        })
    }

    /// The DSN the pool manager should dial, preferring the poolable URL.
    pub fn pool_url(&self) -> &str {
        self.database_pool_url.as_deref().unwrap_or(&self.database_url)
    }

    pub fn is_external_pool(&self) -> bool {
        self.database_pool_url.is_some()
    }

    pub fn is_single_use_pool(&self) -> bool {
        matches!(self.database_pool_mode, Some(DatabasePoolMode::SingleUse))
    }
}

/// Schema-gated capabilities derived from the tenant's migration version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TenantCapabilities {
    #[serde(rename = "listV2")]
    pub list_v2: bool,
    #[serde(rename = "icebergCatalog")]
    pub iceberg_catalog: bool,
    #[serde(rename = "vectorBuckets")]
    pub vector_buckets: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pool_mode_parses_both_variants() {
        assert_eq!(
            DatabasePoolMode::from_str("single_use"),
            Ok(DatabasePoolMode::SingleUse)
        );
        assert_eq!(
            DatabasePoolMode::from_str("recycled"),
            Ok(DatabasePoolMode::Recycled)
        );
        assert!(DatabasePoolMode::from_str("pooled").is_err());
    }

    #[test]
    fn migration_status_round_trips_through_display() {
        for status in [
            TenantMigrationStatus::Completed,
            TenantMigrationStatus::Failed,
            TenantMigrationStatus::FailedStale,
        ] {
            assert_eq!(
                TenantMigrationStatus::from_str(&status.to_string()),
                Ok(status)
            );
        }
    }

    #[test]
    fn from_row_decrypts_secret_columns() {
        let key = EncryptionKey::derive("test-key");
        let row = Tenant {
            id: "t1".to_string(),
            database_url: crypto::encrypt(&key, "postgresql://localhost/t1").unwrap(),
            database_pool_url: None,
            database_pool_mode: Some("recycled".to_string()),
            max_connections: 10,
            file_size_limit: 52428800,
            features: sqlx::types::Json(HashMap::from([("imageTransformation".to_string(), true)])),
            jwt_secret: crypto::encrypt(&key, "tenant-secret").unwrap(),
            jwks: None,
            service_key: crypto::encrypt(&key, "service-token").unwrap(),
            migrations_version: Some("initial".to_string()),
            migrations_status: Some("COMPLETED".to_string()),
            migrations_failed_at: None,
            tracing_mode: None,
            disabled_events: None,
            cursor_id: 1,
            created_at: Utc::now(),
        };
        let config = TenantConfig::from_row(row, &key).unwrap();
        assert_eq!(config.database_url, "postgresql://localhost/t1");
        assert_eq!(config.jwt_secret, "tenant-secret");
        assert_eq!(config.service_key, "service-token");
        assert_eq!(
            config.database_pool_mode,
            Some(DatabasePoolMode::Recycled)
        );
        assert_eq!(config.pool_url(), "postgresql://localhost/t1");
        assert!(!config.is_external_pool());
    }
}
