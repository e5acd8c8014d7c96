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

use crate::common::error::StorageError;
use crate::manager::s3_credentials::S3CredentialsAdminModule;
use crate::manager::s3_credentials::dto::{CreateS3CredentialRequest, DeleteS3CredentialRequest};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

pub async fn create(
    State(module): State<Arc<dyn S3CredentialsAdminModule>>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<CreateS3CredentialRequest>,
) -> Result<Response, StorageError> {
    let created = module
        .s3_credentials()
        .create_s3_credentials(&tenant_id, &payload.description, payload.claims)
        .await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

pub async fn list(
    State(module): State<Arc<dyn S3CredentialsAdminModule>>,
    Path(tenant_id): Path<String>,
) -> Result<Response, StorageError> {
    let credentials = module
        .s3_credentials()
        .list_s3_credentials(&tenant_id)
        .await?;
    Ok((StatusCode::OK, Json(credentials)).into_response())
}

pub async fn delete(
    State(module): State<Arc<dyn S3CredentialsAdminModule>>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<DeleteS3CredentialRequest>,
) -> Result<Response, StorageError> {
    module
        .s3_credentials()
        .delete_s3_credential(&tenant_id, payload.id)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
