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

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

/// Claims carried by storage tokens.
///
/// `role` selects the database role applied to the request scope;
/// `sub` identifies the caller where one exists. Additional claims from
/// S3-credential tokens ride along in `extra` and are forwarded verbatim
/// to `request.jwt.claims`.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct Claims {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    pub exp: i64,
    pub iat: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Ten years; service tokens are rotated by redeploying, not by expiry.
const SERVICE_TOKEN_LIFETIME_SECS: i64 = 10 * 365 * 24 * 60 * 60;

impl Claims {
    pub fn service_key(role: &str, issuer: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            role: role.to_string(),
            sub: None,
            iss: Some(issuer.to_string()),
            exp: now + SERVICE_TOKEN_LIFETIME_SECS,
            iat: now,
            extra: serde_json::Map::new(),
        }
    }

    pub fn to_token(&self, secret: &[u8], algorithm: Algorithm) -> Result<String, String> {
        encode(
            &Header::new(algorithm),
            self,
            &EncodingKey::from_secret(secret),
        )
        .map_err(|e| e.to_string())
    }

    pub fn from_token(token: &str, secret: &[u8], algorithm: Algorithm) -> Result<Self, String> {
        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;
        decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| e.to_string())
    }
}

pub fn parse_algorithm(name: &str) -> Result<Algorithm, String> {
    match name {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        "RS256" => Ok(Algorithm::RS256),
        "ES256" => Ok(Algorithm::ES256),
        other => Err(format!("Unsupported JWT algorithm: '{other}'")),
    }
}

/// A precomputed service identity: the signed token and its claims.
#[derive(Debug, Clone)]
pub struct ServiceKeyUser {
    pub jwt: String,
    pub claims: Claims,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn token_round_trip_preserves_claims() {
        let claims = Claims::service_key("service_role", "storage.tarhely.t1");
        let token = claims.to_token(b"secret", Algorithm::HS256).unwrap();
        let decoded = Claims::from_token(&token, b"secret", Algorithm::HS256).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn verification_with_wrong_secret_fails() {
        let claims = Claims::service_key("service_role", "storage.tarhely.t1");
        let token = claims.to_token(b"secret", Algorithm::HS256).unwrap();
        assert!(Claims::from_token(&token, b"other", Algorithm::HS256).is_err());
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        assert!(parse_algorithm("none").is_err());
        assert_eq!(parse_algorithm("HS512"), Ok(Algorithm::HS512));
    }
}
