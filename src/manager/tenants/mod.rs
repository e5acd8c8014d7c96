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
use crate::manager::tenants::repository::TenantsRepository;
use crate::manager::tenants::service::TenantCatalog;
use std::sync::Arc;

pub mod dto;
mod handler;
pub mod model;
pub mod repository;
pub mod routes;
pub mod service;

/// Dependencies of the tenant admin surface.
pub trait TenantsAdminModule: Send + Sync {
    fn config(&self) -> Arc<AppConfig>;
    fn tenants_repo(&self) -> Arc<dyn TenantsRepository>;
    fn catalog(&self) -> Arc<TenantCatalog>;
}

impl TenantsAdminModule for AppState {
    fn config(&self) -> Arc<AppConfig> {
        self.config.clone()
    }
    fn tenants_repo(&self) -> Arc<dyn TenantsRepository> {
        self.tenants_repo.clone()
    }
    fn catalog(&self) -> Arc<TenantCatalog> {
        self.catalog.clone()
    }
}
