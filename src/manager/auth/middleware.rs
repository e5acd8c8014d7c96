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
use crate::manager::app::config::AppConfig;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

/// Admin-surface gate: the request must carry one of the configured admin
/// API keys, either as `Authorization: Bearer <key>` or an `apikey` header.
pub async fn require_admin(
    State(config): State<Arc<AppConfig>>,
    request: Request,
    next: Next,
) -> Response {
    let provided = bearer_token(&request).or_else(|| header_value(&request, "apikey"));
    let authorized = match provided {
        Some(provided) => config.admin_api_keys().iter().any(|key| *key == provided),
        None => false,
    };
    if !authorized {
        return StorageError::AccessDenied("invalid admin credentials".to_string())
            .into_response();
    }
    next.run(request).await
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn header_value<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers().get(name)?.to_str().ok()
}
