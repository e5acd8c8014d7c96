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

use crate::common::AppState;
use crate::manager::app::config::AppConfig;
use crate::tenant::migrations::engine::TenantMigrationOptions;
use anyhow::Result;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

pub fn init_subscriber(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_env_filter(filter).finish(),
    )
    .expect("setting default subscriber failed");
}

pub async fn init_default_app()
-> Result<(Arc<AppConfig>, Router, Arc<AppState>, watch::Sender<bool>)> {
    let config = Arc::new(AppConfig::from_env()?);
    init_subscriber(config.log_level());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app_state = Arc::new(AppState::new(config.clone(), shutdown_rx).await?);

    if config.is_multitenant() {
        app_state
            .migration_engine
            .run_multitenant_migrations(&app_state.catalog_pool)
            .await?;
    } else if let Some(tenant_id) = config.tenant_id() {
        // Single-tenant: bring the local database up to date at boot.
        let connection = app_state.catalog.get_connection(tenant_id).await?;
        app_state
            .migration_engine
            .run_migrations_on_tenant(
                connection.pool(),
                &TenantMigrationOptions {
                    tenant_id: Some(tenant_id.to_string()),
                    wait_for_lock: true,
                    up_to_migration: None,
                },
            )
            .await?;
    }

    app_state.register_event_handlers();
    app_state.subscribe_invalidations();
    app_state.start_background_tasks();

    let router = Router::new()
        .route("/status", get(|| async { StatusCode::OK }))
        .merge(crate::manager::tenants::routes::routes(app_state.clone()))
        .merge(crate::manager::jwks::routes::routes(app_state.clone()))
        .merge(crate::manager::s3_credentials::routes::routes(
            app_state.clone(),
        ))
        .layer(TraceLayer::new_for_http());

    Ok((config, router, app_state, shutdown_tx))
}
