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

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use serde_json::json;
use sqlx::prelude::FromRow;
use uuid::Uuid;

/// Reserved kind of the per-tenant URL-signing key.
pub const URL_SIGNING_KIND: &str = "url-signing-key";

/// Raw `tenants_jwks` row; `content` is encrypted JWK JSON.
#[derive(Debug, Clone, FromRow)]
pub struct TenantJwkRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub kind: String,
    pub content: String,
    pub active: bool,
    pub cursor_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Decrypted JWK as served to verification code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JwkItem {
    pub id: Uuid,
    pub kind: String,
    pub jwk: serde_json::Value,
}

/// Per-tenant signing material merged from JWKS rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JwksTenantConfig {
    pub keys: Vec<JwkItem>,
    pub url_signing_key: Option<serde_json::Value>,
}

/// Kind tags are restricted to url-safe identifier characters, max 50.
pub fn valid_kind(kind: &str) -> bool {
    !kind.is_empty()
        && kind.len() <= 50
        && kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A fresh symmetric HS512 JWK: 64 random bytes, base64url-encoded.
pub fn generate_hs512_jwk() -> serde_json::Value {
    let mut material = [0u8; 64];
    rand::rng().fill_bytes(&mut material);
    json!({
        "kty": "oct",
        "alg": "HS512",
        "kid": Uuid::new_v4().to_string(),
        "k": URL_SAFE_NO_PAD.encode(material),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn kind_validation_accepts_identifier_characters() {
        assert!(valid_kind(URL_SIGNING_KIND));
        assert!(valid_kind("customer_managed"));
        assert!(!valid_kind(""));
        assert!(!valid_kind("has space"));
        assert!(!valid_kind(&"x".repeat(51)));
    }

    #[test]
    fn generated_jwk_is_a_symmetric_hs512_key() {
        let jwk = generate_hs512_jwk();
        assert_eq!(jwk["kty"], "oct");
        assert_eq!(jwk["alg"], "HS512");
        let material = URL_SAFE_NO_PAD
            .decode(jwk["k"].as_str().unwrap())
            .unwrap();
        assert_eq!(material.len(), 64);
    }

    #[test]
    fn generated_jwks_are_unique() {
        assert_ne!(
            generate_hs512_jwk()["k"],
            generate_hs512_jwk()["k"]
        );
    }
}
