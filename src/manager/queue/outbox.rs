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

//! Transactional outbox for queue events.
//!
//! Business transactions append signed rows to `event_log`; the dispatcher
//! verifies each HMAC before handing the row to the durable queue and
//! deleting it. Rows with a bad signature never reach the queue; they are
//! moved to the parking table and surfaced in the logs.

use crate::common::error::{RepositoryResult, StorageError, StorageResult};
use crate::manager::queue::event::{QueueJob, SendOptions};
use crate::manager::queue::Queue;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::prelude::FromRow;
use sqlx::{PgConnection, PgPool};
use std::sync::Arc;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Canonical signing input: `event_name "." JSON(payload) "." JSON(send_options|"")`.
fn canonical_input(
    event_name: &str,
    payload: &serde_json::Value,
    send_options: Option<&serde_json::Value>,
) -> String {
    let options = send_options
        .map(|options| options.to_string())
        .unwrap_or_default();
    format!("{event_name}.{payload}.{options}")
}

/// Hex-encoded HMAC-SHA256 over the canonical form.
pub fn compute_event_log_signature(
    key: &[u8],
    event_name: &str,
    payload: &serde_json::Value,
    send_options: Option<&serde_json::Value>,
) -> String {
    // HMAC-SHA256 accepts any key length per RFC 2104.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(canonical_input(event_name, payload, send_options).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a stored signature.
pub fn verify_event_log_signature(
    key: &[u8],
    event_name: &str,
    payload: &serde_json::Value,
    send_options: Option<&serde_json::Value>,
    signature: &str,
) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(canonical_input(event_name, payload, send_options).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone, FromRow)]
pub struct EventLogRow {
    pub id: i64,
    pub event_name: String,
    pub payload: serde_json::Value,
    pub send_options: Option<serde_json::Value>,
    pub signature: String,
}

/// Appends a signed event to the outbox inside the caller's transaction.
pub async fn append_event_log(
    conn: &mut PgConnection,
    key: &[u8],
    event_name: &str,
    payload: &serde_json::Value,
    send_options: Option<&serde_json::Value>,
) -> RepositoryResult<()> {
    let signature = compute_event_log_signature(key, event_name, payload, send_options);
    sqlx::query(
        r#"
        INSERT INTO event_log (event_name, payload, send_options, signature)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(event_name)
    .bind(payload)
    .bind(send_options)
    .bind(signature)
    .execute(conn)
    .await?;
    Ok(())
}

pub struct OutboxDispatcher {
    pool: PgPool,
    queue: Arc<Queue>,
    key: Vec<u8>,
}

impl OutboxDispatcher {
    pub fn new(pool: PgPool, queue: Arc<Queue>, key: Vec<u8>) -> Self {
        Self { pool, queue, key }
    }

    /// Drains up to one batch of outbox rows. Returns the number of rows
    /// handed to the queue.
    pub async fn dispatch_once(&self) -> StorageResult<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(crate::common::error::RepositoryError::from)
            .map_err(StorageError::from_repository)?;
        let rows = sqlx::query_as::<_, EventLogRow>(
            r#"
            SELECT id, event_name, payload, send_options, signature
            FROM event_log
            ORDER BY id
            LIMIT 100
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(crate::common::error::RepositoryError::from)
        .map_err(StorageError::from_repository)?;

        let mut dispatched = 0usize;
        for row in rows {
            let verified = verify_event_log_signature(
                &self.key,
                &row.event_name,
                &row.payload,
                row.send_options.as_ref(),
                &row.signature,
            );
            if verified {
                let options: SendOptions = row
                    .send_options
                    .as_ref()
                    .and_then(|raw| serde_json::from_value(raw.clone()).ok())
                    .unwrap_or_default();
                let job = QueueJob {
                    name: row.event_name.clone(),
                    data: row.payload.clone(),
                    options,
                };
                self.queue.send_raw(job).await?;
                dispatched += 1;
            } else {
                warn!(
                    "event log signature mismatch, parking row: id={} event={}",
                    row.id, row.event_name
                );
                sqlx::query(
                    r#"
                    INSERT INTO event_log_parking (event_name, payload, send_options, signature)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(&row.event_name)
                .bind(&row.payload)
                .bind(&row.send_options)
                .bind(&row.signature)
                .execute(&mut *tx)
                .await
                .map_err(crate::common::error::RepositoryError::from)
                .map_err(StorageError::from_repository)?;
            }
            sqlx::query("DELETE FROM event_log WHERE id = $1")
                .bind(row.id)
                .execute(&mut *tx)
                .await
                .map_err(crate::common::error::RepositoryError::from)
                .map_err(StorageError::from_repository)?;
        }
        tx.commit()
            .await
            .map_err(crate::common::error::RepositoryError::from)
            .map_err(StorageError::from_repository)?;
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const KEY: &[u8] = b"deployment-signing-key";

    #[test]
    fn signature_round_trip_verifies() {
        let payload = json!({"tenantId": "t1", "$version": "v1"});
        let options = json!({"retryLimit": 5});
        let signature = compute_event_log_signature(KEY, "webhook", &payload, Some(&options));
        assert!(verify_event_log_signature(
            KEY,
            "webhook",
            &payload,
            Some(&options),
            &signature
        ));
    }

    #[test]
    fn absent_send_options_canonicalize_to_empty() {
        let payload = json!({"tenantId": "t1"});
        let signature = compute_event_log_signature(KEY, "webhook", &payload, None);
        assert!(verify_event_log_signature(
            KEY, "webhook", &payload, None, &signature
        ));
        assert_eq!(
            canonical_input("webhook", &payload, None),
            format!("webhook.{payload}.")
        );
    }

    #[test]
    fn any_field_mutation_flips_verification() {
        let payload = json!({"tenantId": "t1"});
        let options = json!({"retryLimit": 5});
        let signature = compute_event_log_signature(KEY, "webhook", &payload, Some(&options));

        assert!(!verify_event_log_signature(
            KEY,
            "webhooks",
            &payload,
            Some(&options),
            &signature
        ));
        assert!(!verify_event_log_signature(
            KEY,
            "webhook",
            &json!({"tenantId": "t2"}),
            Some(&options),
            &signature
        ));
        assert!(!verify_event_log_signature(
            KEY,
            "webhook",
            &payload,
            Some(&json!({"retryLimit": 6})),
            &signature
        ));
        assert!(!verify_event_log_signature(
            KEY,
            "webhook",
            &payload,
            None,
            &signature
        ));
    }

    #[test]
    fn wrong_key_and_malformed_hex_are_rejected() {
        let payload = json!({"tenantId": "t1"});
        let signature = compute_event_log_signature(KEY, "webhook", &payload, None);
        assert!(!verify_event_log_signature(
            b"other-key",
            "webhook",
            &payload,
            None,
            &signature
        ));
        assert!(!verify_event_log_signature(
            KEY,
            "webhook",
            &payload,
            None,
            "not-hex"
        ));
    }
}
