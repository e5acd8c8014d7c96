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
use crate::manager::s3_credentials::service::S3CredentialsManager;
use std::sync::Arc;

pub mod dto;
mod handler;
pub mod model;
pub mod repository;
pub mod routes;
pub mod service;

/// Dependencies of the S3-credentials admin surface.
pub trait S3CredentialsAdminModule: Send + Sync {
    fn config(&self) -> Arc<AppConfig>;
    fn s3_credentials(&self) -> Arc<S3CredentialsManager>;
}

impl S3CredentialsAdminModule for AppState {
    fn config(&self) -> Arc<AppConfig> {
        self.config.clone()
    }
    fn s3_credentials(&self) -> Arc<S3CredentialsManager> {
        self.s3_credentials.clone()
    }
}
