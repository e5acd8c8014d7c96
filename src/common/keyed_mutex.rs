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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Serializes work that shares a string key within this process.
///
/// Cache loaders wrap their miss path in [`KeyedMutex::run`] and re-check
/// the cache once the lock is held, so any number of concurrent misses for
/// the same key issue at most one underlying load. Entries are removed as
/// soon as the last waiter releases; no fairness is guaranteed.
pub struct KeyedMutex {
    entries: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `work` while holding the mutex belonging to `key`.
    pub async fn run<F, T>(&self, key: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = {
            let mut entries = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let guard = lock.lock().await;
        let out = work.await;
        drop(guard);

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Two references mean the map and us: nobody else is waiting.
        if Arc::strong_count(&lock) <= 2 {
            entries.remove(key);
        }
        out
    }
}

impl Default for KeyedMutex {
    fn default() -> Self {
        KeyedMutex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_misses_issue_one_load() {
        let mutex = Arc::new(KeyedMutex::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let cached = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let mutex = mutex.clone();
            let loads = loads.clone();
            let cached = cached.clone();
            handles.push(tokio::spawn(async move {
                mutex
                    .run("tenant-a", async {
                        if cached.load(Ordering::SeqCst) == 0 {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            loads.fetch_add(1, Ordering::SeqCst);
                            cached.store(1, Ordering::SeqCst);
                        }
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entries_are_garbage_collected() {
        let mutex = KeyedMutex::new();
        mutex.run("a", async {}).await;
        mutex.run("b", async {}).await;
        assert_eq!(mutex.entries.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let mutex = Arc::new(KeyedMutex::new());
        let m = mutex.clone();
        let blocked = tokio::spawn(async move {
            m.run("slow", async {
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
            .await;
        });
        // Completes while "slow" is still held.
        tokio::time::timeout(Duration::from_millis(20), mutex.run("fast", async {}))
            .await
            .expect("fast key must not wait on slow key");
        blocked.await.unwrap();
    }
}
