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

use crate::manager::tenants::model::{TenantConfig, TenantMigrationStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body of `POST /tenants/{id}`. Secrets arrive in plaintext over the
/// admin channel and are encrypted by the repository before storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTenantRequest {
    pub database_url: String,
    #[serde(default)]
    pub database_pool_url: Option<String>,
    #[serde(default)]
    pub database_pool_mode: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: i32,
    #[serde(default = "default_file_size_limit")]
    pub file_size_limit: i64,
    #[serde(default)]
    pub features: HashMap<String, bool>,
    pub jwt_secret: String,
    #[serde(default)]
    pub jwks: Option<serde_json::Value>,
    pub service_key: String,
    #[serde(default)]
    pub tracing_mode: Option<String>,
    #[serde(default)]
    pub disabled_events: Vec<String>,
}

fn default_max_connections() -> i32 {
    20
}

fn default_file_size_limit() -> i64 {
    // 50 MiB
    52_428_800
}

/// Body of `PATCH /tenants/{id}`; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchTenantRequest {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub database_pool_url: Option<String>,
    #[serde(default)]
    pub database_pool_mode: Option<String>,
    #[serde(default)]
    pub max_connections: Option<i32>,
    #[serde(default)]
    pub file_size_limit: Option<i64>,
    #[serde(default)]
    pub features: Option<HashMap<String, bool>>,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub jwks: Option<serde_json::Value>,
    #[serde(default)]
    pub service_key: Option<String>,
    #[serde(default)]
    pub tracing_mode: Option<String>,
    #[serde(default)]
    pub disabled_events: Option<Vec<String>>,
}

/// Public tenant view returned by the admin surface; secrets stay out.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantResponse {
    pub id: String,
    pub database_pool_mode: Option<String>,
    pub max_connections: u32,
    pub file_size_limit: i64,
    pub features: HashMap<String, bool>,
    pub migrations_version: Option<String>,
    pub migrations_status: Option<TenantMigrationStatus>,
    pub tracing_mode: Option<String>,
    pub disabled_events: Vec<String>,
}

impl From<TenantConfig> for TenantResponse {
    fn from(config: TenantConfig) -> Self {
        Self {
            id: config.tenant_id,
            database_pool_mode: config.database_pool_mode.map(|mode| mode.to_string()),
            max_connections: config.max_connections,
            file_size_limit: config.file_size_limit,
            features: config.features,
            migrations_version: config.migrations_version,
            migrations_status: config.migrations_status,
            tracing_mode: config.tracing_mode,
            disabled_events: config.disabled_events,
        }
    }
}

/// `(tenant id, pagination cursor)` pair produced by fleet scans.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TenantCursor {
    pub id: String,
    pub cursor_id: i64,
}
