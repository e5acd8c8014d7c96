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

//! Cross-instance invalidation fan-out over PostgreSQL LISTEN/NOTIFY.
//!
//! Every instance subscribes its cache-eviction handlers at startup, then
//! `start` holds one listener connection against the catalog database.
//! Transport loss is surfaced as a warning and followed by reconnect with
//! capped exponential backoff plus jitter; handlers survive reconnects.

use crate::common::error::RepositoryResult;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Payload: the tenant id whose configuration changed.
pub const CHANNEL_TENANTS_UPDATE: &str = "tenants_update";
/// Payload: the tenant id whose JWKS rows changed.
pub const CHANNEL_TENANTS_JWKS_UPDATE: &str = "tenants_jwks_update";
/// Payload: `<tenant_id>:<access_key>` of the credential that changed.
pub const CHANNEL_TENANTS_S3_CREDENTIALS_UPDATE: &str = "tenants_s3_credentials_update";

pub type SubscriptionHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Reliable fan-out of named invalidation channels to all instances.
///
/// Delivery is at-least-once to every live subscriber; ordering holds per
/// channel per publisher. Handlers must be registered before `start`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PubSubAdapter: Send + Sync {
    fn subscribe(&self, channel: &str, handler: SubscriptionHandler);
    async fn publish(&self, channel: &str, payload: &str) -> RepositoryResult<()>;
    fn start(&self, shutdown: watch::Receiver<bool>);
    async fn close(&self);
}

pub struct PgPubSub {
    pool: PgPool,
    handlers: Arc<RwLock<HashMap<String, Vec<SubscriptionHandler>>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl PgPubSub {
    pub fn new(pool: PgPool) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            pool,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            closed_tx,
            closed_rx,
        }
    }

    fn dispatch(handlers: &RwLock<HashMap<String, Vec<SubscriptionHandler>>>, channel: &str, payload: &str) {
        let guard = handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(registered) = guard.get(channel) {
            for handler in registered {
                handler(payload.to_string());
            }
        }
    }
}

#[async_trait]
impl PubSubAdapter for PgPubSub {
    fn subscribe(&self, channel: &str, handler: SubscriptionHandler) {
        let mut guard = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.entry(channel.to_string()).or_default().push(handler);
    }

    async fn publish(&self, channel: &str, payload: &str) -> RepositoryResult<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let pool = self.pool.clone();
        let handlers = self.handlers.clone();
        let mut closed = self.closed_rx.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                if *closed.borrow() || *shutdown.borrow() {
                    return;
                }
                let channels: Vec<String> = {
                    let guard = handlers
                        .read()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    guard.keys().cloned().collect()
                };
                match PgListener::connect_with(&pool).await {
                    Ok(mut listener) => {
                        let refs: Vec<&str> = channels.iter().map(String::as_str).collect();
                        match listener.listen_all(refs).await {
                            Ok(()) => {
                                info!("pubsub listener active: channels={}", channels.len());
                                backoff = Duration::from_secs(1);
                                loop {
                                    tokio::select! {
                                        notification = listener.recv() => match notification {
                                            Ok(notification) => {
                                                debug!(
                                                    "pubsub notification: channel={}",
                                                    notification.channel()
                                                );
                                                PgPubSub::dispatch(
                                                    &handlers,
                                                    notification.channel(),
                                                    notification.payload(),
                                                );
                                            }
                                            Err(e) => {
                                                warn!("pubsub listener disconnected, will retry: {e}");
                                                break;
                                            }
                                        },
                                        _ = closed.changed() => {
                                            if *closed.borrow() {
                                                return;
                                            }
                                        }
                                        _ = shutdown.changed() => {
                                            if *shutdown.borrow() {
                                                return;
                                            }
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("pubsub LISTEN failed, will retry: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        warn!("pubsub listener connect failed, will retry: {e}");
                    }
                }
                // Jitter keeps a restarted fleet from reconnecting in lockstep.
                let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
                tokio::time::sleep(backoff + jitter).await;
                backoff = (backoff * 2).min(Duration::from_secs(60));
            }
        });
    }

    async fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatch_invokes_every_handler_on_the_channel() {
        let handlers: RwLock<HashMap<String, Vec<SubscriptionHandler>>> =
            RwLock::new(HashMap::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let payloads = Arc::new(RwLock::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            let payloads = payloads.clone();
            handlers
                .write()
                .unwrap()
                .entry(CHANNEL_TENANTS_UPDATE.to_string())
                .or_default()
                .push(Arc::new(move |payload: String| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    payloads.write().unwrap().push(payload);
                }));
        }

        PgPubSub::dispatch(&handlers, CHANNEL_TENANTS_UPDATE, "t1");
        PgPubSub::dispatch(&handlers, "unknown_channel", "ignored");

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(*payloads.read().unwrap(), vec!["t1", "t1"]);
    }
}
