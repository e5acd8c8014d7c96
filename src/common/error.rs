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

use crate::common::dto::ErrorResponse;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sqlx::Error;
use thiserror::Error;
use tracing::{Level, event};
use uuid::Uuid;

/// Errors raised while interacting with the catalog or tenant databases.
///
/// Repositories return this type; services translate it into the
/// request-facing [`StorageError`] taxonomy where a more specific kind
/// applies.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Custom error: {0}")]
    Custom(String),

    #[error("RwLockReadGuard error: {0}")]
    RwLockReadGuard(String),

    #[error("RwLockWriteGuard error: {0}")]
    RwLockWriteGuard(String),

    #[error("Tenant pool not found")]
    TenantPoolNotFound,
}

impl RepositoryError {
    pub fn is_unique_violation(&self) -> bool {
        if let RepositoryError::Database(sqlxe) = self
            && let Error::Database(database_error) = sqlxe
            && database_error.is_unique_violation()
        {
            return true;
        }
        false
    }

    /// Whether the underlying failure is the backend (or an external pooler)
    /// refusing new connections. SQLSTATE 53300 is PostgreSQL's
    /// `too_many_connections`; 08P01 with the matching message is what
    /// session poolers emit when saturated.
    pub fn is_pool_saturation(&self) -> bool {
        if let RepositoryError::Database(sqlxe) = self {
            return sqlx_error_is_pool_saturation(sqlxe);
        }
        false
    }

    /// Whether the failure is a pool acquire or statement timeout. Raw
    /// driver timeout strings are normalized to `DatabaseTimeout` through
    /// this check.
    pub fn is_timeout(&self) -> bool {
        if let RepositoryError::Database(sqlxe) = self {
            return sqlx_error_is_timeout(sqlxe);
        }
        false
    }
}

pub fn sqlx_error_is_pool_saturation(e: &sqlx::Error) -> bool {
    if let Error::Database(db) = e {
        let code_matches = db
            .code()
            .map(|c| c == "53300" || c == "08P01")
            .unwrap_or(false);
        let message = db.message();
        return code_matches
            || message.contains("no more connections allowed")
            || message.contains("max clients reached")
            || message.contains("too many clients")
            || message.contains("remaining connection slots");
    }
    false
}

pub fn sqlx_error_is_timeout(e: &sqlx::Error) -> bool {
    match e {
        Error::PoolTimedOut => true,
        // 57014 = query_canceled, raised when statement_timeout elapses
        Error::Database(db) => db.code().map(|c| c == "57014").unwrap_or(false),
        _ => false,
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// The request-facing error taxonomy of the storage engine.
///
/// Each variant maps to a stable error code and an HTTP status; handlers
/// return this type directly and let `IntoResponse` shape the payload.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid tenant id: '{0}'")]
    InvalidTenantId(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing tenant config for tenant {0}")]
    MissingTenantConfig(String),

    #[error("Missing S3 credentials")]
    MissingS3Credentials,

    #[error("The maximum number of credentials has been reached")]
    MaximumCredentialsLimit,

    #[error("Database timeout")]
    DatabaseTimeout,

    #[error("Database error: {0}")]
    Database(#[from] RepositoryError),

    #[error("Could not acquire migration lock")]
    LockTimeout,

    #[error("Operation aborted")]
    Aborted,

    #[error("No active shard with free capacity")]
    NoActiveShard,

    #[error("Reservation {0} not found")]
    ReservationNotFound(Uuid),

    #[error("Reservation is {actual}, expected {expected}")]
    InvalidReservationStatus { expected: String, actual: String },

    #[error("Reservation {0} lease has expired")]
    ExpiredReservation(Uuid),

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("Feature '{0}' is not enabled for this tenant")]
    FeatureNotEnabled(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Stable machine-readable error code included in responses.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::InvalidTenantId(_) => "InvalidTenantId",
            StorageError::InvalidRequest(_) => "InvalidRequest",
            StorageError::MissingTenantConfig(_) => "MissingTenantConfig",
            StorageError::MissingS3Credentials => "MissingS3Credentials",
            StorageError::MaximumCredentialsLimit => "MaximumCredentialsLimit",
            StorageError::DatabaseTimeout => "DatabaseTimeout",
            StorageError::Database(_) => "DatabaseError",
            StorageError::LockTimeout => "LockTimeout",
            StorageError::Aborted => "Aborted",
            StorageError::NoActiveShard => "NoActiveShard",
            StorageError::ReservationNotFound(_) => "ReservationNotFound",
            StorageError::InvalidReservationStatus { .. } => "InvalidReservationStatus",
            StorageError::ExpiredReservation(_) => "ExpiredReservation",
            StorageError::Migration { .. } => "MigrationError",
            StorageError::FeatureNotEnabled(_) => "FeatureNotEnabled",
            StorageError::AccessDenied(_) => "AccessDenied",
            StorageError::Internal(_) => "InternalError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            StorageError::InvalidTenantId(_)
            | StorageError::InvalidRequest(_)
            | StorageError::MaximumCredentialsLimit
            | StorageError::Aborted => StatusCode::BAD_REQUEST,
            StorageError::MissingTenantConfig(_)
            | StorageError::MissingS3Credentials
            | StorageError::ReservationNotFound(_) => StatusCode::NOT_FOUND,
            StorageError::AccessDenied(_) | StorageError::FeatureNotEnabled(_) => {
                StatusCode::FORBIDDEN
            }
            StorageError::InvalidReservationStatus { .. } => StatusCode::CONFLICT,
            StorageError::ExpiredReservation(_) => StatusCode::GONE,
            StorageError::DatabaseTimeout
            | StorageError::LockTimeout
            | StorageError::NoActiveShard => StatusCode::SERVICE_UNAVAILABLE,
            StorageError::Database(_)
            | StorageError::Migration { .. }
            | StorageError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Normalize a repository failure: timeouts become `DatabaseTimeout`,
    /// everything else is wrapped as a database error.
    pub fn from_repository(e: RepositoryError) -> Self {
        if e.is_timeout() {
            StorageError::DatabaseTimeout
        } else {
            StorageError::Database(e)
        }
    }
}

impl IntoResponse for StorageError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let correlation_id = Uuid::new_v4();
        if status.is_server_error() {
            event!(
                Level::ERROR,
                "request failed: code={} correlation_id={correlation_id} message={self}",
                self.code()
            );
        } else {
            event!(
                Level::DEBUG,
                "request rejected: code={} correlation_id={correlation_id} message={self}",
                self.code()
            );
        }
        ErrorResponse {
            status_code: status,
            error: self.code().to_string(),
            message: self.to_string(),
            correlation_id,
        }
        .into_response()
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, serde::Serialize)]
pub enum BuilderError {
    #[error("{0} is required")]
    MissingRequired(&'static str),
}

pub type BuilderResult<T> = Result<T, BuilderError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn storage_error_codes_are_stable() {
        assert_eq!(
            StorageError::InvalidTenantId(String::new()).code(),
            "InvalidTenantId"
        );
        assert_eq!(StorageError::LockTimeout.code(), "LockTimeout");
        assert_eq!(
            StorageError::Migration {
                message: "boom".to_string()
            }
            .code(),
            "MigrationError"
        );
    }

    #[test]
    fn status_mapping_follows_the_edge_contract() {
        assert_eq!(
            StorageError::AccessDenied("bad token".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            StorageError::NoActiveShard.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            StorageError::ExpiredReservation(Uuid::new_v4()).status_code(),
            StatusCode::GONE
        );
        assert_eq!(
            StorageError::MissingTenantConfig("t1".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
