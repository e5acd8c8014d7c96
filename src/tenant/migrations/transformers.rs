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

use crate::tenant::migrations::{Migration, migration_hash};

/// Marker that takes a migration out of the wrapping transaction
/// (`CREATE INDEX CONCURRENTLY` cannot run inside one).
pub const DISABLE_TRANSACTION_MARKER: &str = "-- disable-transaction";

/// Facts about the target database that transformers may depend on.
#[derive(Debug, Clone, Default)]
pub struct DbContext {
    pub default_table_access_method: Option<String>,
}

/// A migration after the transformer chain: executable SQL plus the
/// canonical hash of the untransformed file.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnableMigration {
    pub name: String,
    pub sql: String,
    pub hash: String,
    pub disable_transaction: bool,
}

type Transformer = fn(&DbContext, String) -> String;

/// Ordered transformer chain applied to every migration before execution.
const TRANSFORMERS: &[Transformer] = &[orioledb_transformer];

/// OrioleDB has no concurrent index builds: rewrite
/// `CREATE INDEX CONCURRENTLY` to a plain `CREATE INDEX` and drop the
/// disable-transaction marker so the migration runs transactionally again.
fn orioledb_transformer(ctx: &DbContext, sql: String) -> String {
    if ctx.default_table_access_method.as_deref() != Some("orioledb") {
        return sql;
    }
    sql.replace("CREATE INDEX CONCURRENTLY", "CREATE INDEX")
        .replace("CREATE UNIQUE INDEX CONCURRENTLY", "CREATE UNIQUE INDEX")
        .lines()
        .filter(|line| !line.trim_start().starts_with(DISABLE_TRANSACTION_MARKER))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs the chain and resolves the transaction mode from the final SQL.
pub fn transform(ctx: &DbContext, migration: &Migration) -> RunnableMigration {
    let mut sql = migration.sql.to_string();
    for transformer in TRANSFORMERS {
        sql = transformer(ctx, sql);
    }
    let disable_transaction = sql.contains(DISABLE_TRANSACTION_MARKER);
    RunnableMigration {
        name: migration.name.to_string(),
        sql,
        hash: migration_hash(migration.name, migration.sql),
        disable_transaction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONCURRENT_SQL: &str = "-- disable-transaction\nCREATE INDEX CONCURRENTLY idx ON storage.objects (name);\n";

    fn migration() -> Migration {
        Migration {
            name: "concurrent-index",
            sql: CONCURRENT_SQL,
        }
    }

    #[test]
    fn default_heap_leaves_migrations_untouched() {
        let runnable = transform(&DbContext::default(), &migration());
        assert_eq!(runnable.sql, CONCURRENT_SQL);
        assert!(runnable.disable_transaction);
    }

    #[test]
    fn orioledb_rewrites_concurrent_index_and_marker() {
        let ctx = DbContext {
            default_table_access_method: Some("orioledb".to_string()),
        };
        let runnable = transform(&ctx, &migration());
        assert!(!runnable.sql.contains("CONCURRENTLY"));
        assert!(!runnable.sql.contains(DISABLE_TRANSACTION_MARKER));
        assert!(!runnable.disable_transaction);
        assert!(runnable.sql.contains("CREATE INDEX idx"));
    }

    #[test]
    fn hash_is_computed_over_the_original_sql() {
        let ctx = DbContext {
            default_table_access_method: Some("orioledb".to_string()),
        };
        let transformed = transform(&ctx, &migration());
        let untouched = transform(&DbContext::default(), &migration());
        assert_eq!(transformed.hash, untouched.hash);
        assert_eq!(
            transformed.hash,
            migration_hash("concurrent-index", CONCURRENT_SQL)
        );
    }
}
