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

//! Ordered SQL migration sets and the engine that applies them.
//!
//! Migrations ship as plain SQL files embedded at build time; the engine
//! identifies them by name, orders them by position, and records
//! `(id, name, hash)` rows in the target database's `migrations` table.
//! Hashes are computed over the original file content, before any
//! transformer runs, so they are stable across environments.

pub mod engine;
pub mod strategy;
pub mod transformers;

use sha2::{Digest, Sha256};

/// One migration file: stable name plus embedded SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// The tenant-schema migration set, in application order. Capability gates
/// in the tenant catalog reference these names by position.
pub const TENANT_MIGRATIONS: &[Migration] = &[
    Migration {
        name: "initial",
        sql: include_str!("../../../migrations/tenant/0000_initial.sql"),
    },
    Migration {
        name: "pathtoken-column",
        sql: include_str!("../../../migrations/tenant/0001_pathtoken-column.sql"),
    },
    Migration {
        name: "storage-schema",
        sql: include_str!("../../../migrations/tenant/0002_storage-schema.sql"),
    },
    Migration {
        name: "add-migrations-rls",
        sql: include_str!("../../../migrations/tenant/0003_add-migrations-rls.sql"),
    },
    Migration {
        name: "list-objects-with-delimiter",
        sql: include_str!("../../../migrations/tenant/0004_list-objects-with-delimiter.sql"),
    },
    Migration {
        name: "iceberg-catalog-tables",
        sql: include_str!("../../../migrations/tenant/0005_iceberg-catalog-tables.sql"),
    },
    Migration {
        name: "vector-buckets",
        sql: include_str!("../../../migrations/tenant/0006_vector-buckets.sql"),
    },
];

/// Control-plane migrations for the multitenant catalog database.
pub const MULTITENANT_MIGRATIONS: &[Migration] = &[
    Migration {
        name: "initial",
        sql: include_str!("../../../migrations/multitenant/0000_initial.sql"),
    },
    Migration {
        name: "tenants-jwks",
        sql: include_str!("../../../migrations/multitenant/0001_tenants-jwks.sql"),
    },
    Migration {
        name: "tenants-s3-credentials",
        sql: include_str!("../../../migrations/multitenant/0002_tenants-s3-credentials.sql"),
    },
    Migration {
        name: "queue-and-event-log",
        sql: include_str!("../../../migrations/multitenant/0003_queue-and-event-log.sql"),
    },
    Migration {
        name: "shards",
        sql: include_str!("../../../migrations/multitenant/0004_shards.sql"),
    },
];

/// A migration retroactively inserted at `index`: deployments whose row at
/// that position still carries `from` get their history rewritten so the
/// backported file is accounted for without ever executing.
#[derive(Debug, Clone, Copy)]
pub struct Backport {
    pub index: usize,
    pub from: &'static str,
    pub to: &'static str,
}

pub const TENANT_BACKPORTS: &[Backport] = &[Backport {
    index: 2,
    from: "add-migrations-rls",
    to: "storage-schema",
}];

/// Position of a tenant migration by name.
pub fn migration_index(name: &str) -> Option<usize> {
    TENANT_MIGRATIONS
        .iter()
        .position(|migration| migration.name == name)
}

/// The newest tenant migration, which a fully migrated tenant reports as
/// its `migrations_version`.
pub fn latest_migration_name() -> &'static str {
    TENANT_MIGRATIONS
        .last()
        .expect("tenant migration set is never empty")
        .name
}

/// Canonical hash of a migration: SHA-256 over name and original SQL.
pub fn migration_hash(name: &str, sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    hasher.update(sql.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn migration_names_are_unique_and_ordered() {
        let mut seen = std::collections::HashSet::new();
        for migration in TENANT_MIGRATIONS {
            assert!(seen.insert(migration.name), "duplicate {}", migration.name);
        }
        assert_eq!(migration_index("initial"), Some(0));
        assert_eq!(
            migration_index("vector-buckets"),
            Some(TENANT_MIGRATIONS.len() - 1)
        );
        assert_eq!(migration_index("unknown"), None);
    }

    #[test]
    fn latest_name_is_the_last_entry() {
        assert_eq!(latest_migration_name(), "vector-buckets");
    }

    #[test]
    fn hashes_are_stable_and_content_sensitive() {
        let a = migration_hash("initial", "CREATE TABLE a ();");
        let b = migration_hash("initial", "CREATE TABLE a ();");
        let c = migration_hash("initial", "CREATE TABLE b ();");
        let d = migration_hash("renamed", "CREATE TABLE a ();");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn backports_reference_known_positions() {
        for backport in TENANT_BACKPORTS {
            assert!(backport.index < TENANT_MIGRATIONS.len());
            assert_eq!(TENANT_MIGRATIONS[backport.index].name, backport.to);
            assert!(migration_index(backport.from).is_some());
        }
    }
}
