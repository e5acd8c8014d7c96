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
use crate::manager::tenants::TenantsAdminModule;
use crate::manager::tenants::dto::{CreateTenantRequest, PatchTenantRequest, TenantResponse};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

pub async fn create(
    State(module): State<Arc<dyn TenantsAdminModule>>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<CreateTenantRequest>,
) -> Result<Response, StorageError> {
    if tenant_id.is_empty() {
        return Err(StorageError::InvalidTenantId(tenant_id));
    }
    let tenant = module
        .tenants_repo()
        .upsert(&tenant_id, &payload)
        .await
        .map_err(StorageError::from_repository)?;
    module.catalog().publish_invalidation(&tenant_id).await?;
    Ok((StatusCode::CREATED, Json(TenantResponse::from(tenant))).into_response())
}

pub async fn patch(
    State(module): State<Arc<dyn TenantsAdminModule>>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<PatchTenantRequest>,
) -> Result<Response, StorageError> {
    let tenant = module
        .tenants_repo()
        .patch(&tenant_id, &payload)
        .await
        .map_err(StorageError::from_repository)?
        .ok_or_else(|| StorageError::MissingTenantConfig(tenant_id.clone()))?;
    module.catalog().publish_invalidation(&tenant_id).await?;
    Ok((StatusCode::OK, Json(TenantResponse::from(tenant))).into_response())
}

pub async fn delete(
    State(module): State<Arc<dyn TenantsAdminModule>>,
    Path(tenant_id): Path<String>,
) -> Result<Response, StorageError> {
    let deleted = module
        .tenants_repo()
        .delete(&tenant_id)
        .await
        .map_err(StorageError::from_repository)?;
    if !deleted {
        return Err(StorageError::MissingTenantConfig(tenant_id));
    }
    module.catalog().publish_invalidation(&tenant_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
