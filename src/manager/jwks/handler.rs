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
use crate::manager::jwks::JwksAdminModule;
use crate::manager::jwks::dto::{
    AddJwkRequest, AddJwkResponse, GenerateAllResponse, ToggleJwkRequest, ToggleJwkResponse,
};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub async fn add_jwk(
    State(module): State<Arc<dyn JwksAdminModule>>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<AddJwkRequest>,
) -> Result<Response, StorageError> {
    let id = module
        .jwks_manager()
        .add_jwk(&tenant_id, &payload.jwk, &payload.kind)
        .await?;
    Ok((StatusCode::CREATED, Json(AddJwkResponse { id })).into_response())
}

pub async fn toggle_jwk(
    State(module): State<Arc<dyn JwksAdminModule>>,
    Path((tenant_id, kid)): Path<(String, Uuid)>,
    Json(payload): Json<ToggleJwkRequest>,
) -> Result<Response, StorageError> {
    let changed = module
        .jwks_manager()
        .toggle_active(&tenant_id, kid, payload.active)
        .await?;
    Ok((StatusCode::OK, Json(ToggleJwkResponse { changed })).into_response())
}

pub async fn generate_all_missing_status(
    State(module): State<Arc<dyn JwksAdminModule>>,
) -> Result<Response, StorageError> {
    let status = if module.url_signing_generator().is_running() {
        "running"
    } else {
        "idle"
    };
    Ok((StatusCode::OK, Json(GenerateAllResponse { status })).into_response())
}

pub async fn generate_all_missing(
    State(module): State<Arc<dyn JwksAdminModule>>,
) -> Result<Response, StorageError> {
    let generator = module.url_signing_generator();
    if generator.is_running() {
        return Ok((
            StatusCode::OK,
            Json(GenerateAllResponse { status: "running" }),
        )
            .into_response());
    }
    let signal = module.shutdown_signal();
    tokio::spawn(async move {
        if let Err(e) = generator.generate_on_all_tenants(signal).await {
            warn!("url-signing jwk backfill failed: {e}");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateAllResponse { status: "started" }),
    )
        .into_response())
}
