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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery options attached to a queued event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOptions {
    #[serde(rename = "retryLimit")]
    pub retry_limit: i32,
    /// Seconds between retries.
    #[serde(rename = "retryDelay")]
    pub retry_delay: i64,
    #[serde(rename = "expireInHours")]
    pub expire_in_hours: i64,
    /// At most one non-terminal job per singleton key.
    #[serde(rename = "singletonKey", skip_serializing_if = "Option::is_none")]
    pub singleton_key: Option<String>,
    #[serde(rename = "startAfter", skip_serializing_if = "Option::is_none")]
    pub start_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Dead-letter queue name; defaults to `<event name>-dead`.
    #[serde(rename = "deadLetter", skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<String>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            retry_delay: 5,
            expire_in_hours: 48,
            singleton_key: None,
            start_after: None,
            priority: None,
            dead_letter: None,
        }
    }
}

/// A named, versioned message dispatched through the durable queue.
///
/// The payload version is stamped into the payload on send so handlers can
/// evolve their shape. Events declaring `allow_sync = false` may never be
/// executed inline; when the queue is disabled they are dropped with a
/// warning instead.
pub trait QueueEvent: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str {
        "v1"
    }

    fn allow_sync(&self) -> bool {
        true
    }

    fn payload(&self) -> serde_json::Value;

    fn send_options(&self) -> SendOptions {
        SendOptions::default()
    }

    /// Tenant the event belongs to, consulted against the tenant's
    /// disabled-event list in multitenant mode.
    fn tenant_id(&self) -> Option<&str> {
        None
    }
}

/// Stamps the payload version the way the dispatcher expects it.
pub fn stamped_payload(event: &dyn QueueEvent) -> serde_json::Value {
    let mut payload = event.payload();
    if let Some(object) = payload.as_object_mut() {
        object.insert(
            "$version".to_string(),
            serde_json::Value::String(event.version().to_string()),
        );
    }
    payload
}

/// A concrete job as it travels to the queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub name: String,
    pub data: serde_json::Value,
    pub options: SendOptions,
}

impl QueueJob {
    pub fn from_event(event: &dyn QueueEvent) -> Self {
        Self {
            name: event.name().to_string(),
            data: stamped_payload(event),
            options: event.send_options(),
        }
    }

    pub fn dead_letter_queue(&self) -> String {
        self.options
            .dead_letter
            .clone()
            .unwrap_or_else(|| format!("{}-dead", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Probe;

    impl QueueEvent for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }
        fn version(&self) -> &'static str {
            "v3"
        }
        fn payload(&self) -> serde_json::Value {
            json!({"tenantId": "t1"})
        }
    }

    #[test]
    fn version_is_stamped_into_the_payload() {
        let payload = stamped_payload(&Probe);
        assert_eq!(payload["$version"], "v3");
        assert_eq!(payload["tenantId"], "t1");
    }

    #[test]
    fn dead_letter_defaults_to_event_name() {
        let job = QueueJob::from_event(&Probe);
        assert_eq!(job.dead_letter_queue(), "probe-dead");
    }
}
