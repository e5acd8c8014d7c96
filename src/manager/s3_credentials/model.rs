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
use uuid::Uuid;

pub const MAX_CREDENTIALS_PER_TENANT: i64 = 50;
pub const ACCESS_KEY_LENGTH: usize = 32;
pub const SECRET_KEY_LENGTH: usize = 64;

/// Raw `tenants_s3_credentials` row; `secret_key` is ciphertext.
#[derive(Debug, Clone, FromRow)]
pub struct TenantS3CredentialRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub description: String,
    pub access_key: String,
    pub secret_key: String,
    pub claims: sqlx::types::Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Decrypted credential as used by SigV4 resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct S3Credential {
    pub id: Uuid,
    pub access_key: String,
    pub secret_key: String,
    pub claims: serde_json::Value,
}

impl S3Credential {
    /// Rough in-memory footprint, used as the cache weigher.
    pub fn weight(&self) -> u32 {
        let claims = self.claims.to_string().len();
        (self.access_key.len() + self.secret_key.len() + claims + 64) as u32
    }
}

/// Listing entry: everything except the secret.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct S3CredentialSummary {
    pub id: Uuid,
    pub description: String,
    pub access_key: String,
    pub created_at: DateTime<Utc>,
}

/// Cache key shared with the `tenants_s3_credentials_update` payload.
pub fn credential_cache_key(tenant_id: &str, access_key: &str) -> String {
    format!("{tenant_id}:{access_key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cache_key_matches_the_invalidation_payload_shape() {
        assert_eq!(credential_cache_key("t1", "AKyz"), "t1:AKyz");
    }
}
