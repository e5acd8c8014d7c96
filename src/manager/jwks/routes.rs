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

use crate::manager::auth::middleware::require_admin;
use crate::manager::jwks::JwksAdminModule;
use crate::manager::jwks::handler::{
    add_jwk, generate_all_missing, generate_all_missing_status, toggle_jwk,
};
use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post, put};
use std::sync::Arc;

pub fn routes(module: Arc<dyn JwksAdminModule>) -> Router {
    Router::new().nest(
        "/tenants",
        Router::new()
            .route(
                "/jwks/generate-all-missing",
                get(generate_all_missing_status).post(generate_all_missing),
            )
            .route("/{tenant_id}/jwks", post(add_jwk))
            .route("/{tenant_id}/jwks/{kid}", put(toggle_jwk))
            .layer(from_fn_with_state(module.config(), require_admin))
            .with_state(module),
    )
}
