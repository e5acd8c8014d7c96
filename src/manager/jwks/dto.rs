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

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct AddJwkRequest {
    pub jwk: serde_json::Value,
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct AddJwkResponse {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ToggleJwkRequest {
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct ToggleJwkResponse {
    pub changed: bool,
}

#[derive(Debug, Serialize)]
pub struct GenerateAllResponse {
    pub status: &'static str,
}
