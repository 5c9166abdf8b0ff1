// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-process coordination store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{CoordError, CoordStore};

/// An in-memory [`CoordStore`] with real TTL expiry.
///
/// Two brokers sharing one `Arc<MemCoordStore>` observe the same leases and
/// counters that two processes sharing a Redis instance would, which is how
/// the multi-node tests run an entire cluster inside one process.
#[derive(Debug, Default)]
pub struct MemCoordStore {
    entries: Mutex<HashMap<String, Entry>>,
    failing: AtomicBool,
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => now < at,
            None => true,
        }
    }
}

impl MemCoordStore {
    pub fn new() -> MemCoordStore {
        MemCoordStore::default()
    }

    /// Makes every subsequent operation fail as if the store were
    /// unreachable, until called again with `false`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CoordError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CoordError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }

    fn expires_at(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }
}

#[async_trait]
impl CoordStore for MemCoordStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        self.check_available()?;
        let entries = self.entries.lock().expect("lock poisoned");
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: MemCoordStore::expires_at(ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        let now = Instant::now();
        if entries.get(key).map_or(false, |entry| entry.live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: MemCoordStore::expires_at(ttl),
            },
        );
        Ok(true)
    }

    async fn set_if_present(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        let now = Instant::now();
        if !entries.get(key).map_or(false, |entry| entry.live(now)) {
            // An expired entry is as good as gone.
            entries.remove(key);
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: MemCoordStore::expires_at(ttl),
            },
        );
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64, CoordError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.live(now) => {
                let n = entry.value.parse::<i64>().map_err(|_| CoordError::Malformed {
                    key: key.to_string(),
                    value: entry.value.clone(),
                })?;
                entry.value = (n + 1).to_string();
                Ok(n + 1)
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CoordError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const TTL: Option<Duration> = Some(Duration::from_millis(40));

    #[tokio::test]
    async fn get_honors_ttl() {
        let store = MemCoordStore::new();
        store.set("k", "v", TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_respects_live_entries_only() {
        let store = MemCoordStore::new();
        assert!(store.set_if_absent("k", "a", TTL).await.unwrap());
        assert!(!store.set_if_absent("k", "b", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.set_if_absent("k", "b", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn set_if_present_refreshes_ttl() {
        let store = MemCoordStore::new();
        assert!(!store.set_if_present("k", "a", TTL).await.unwrap());
        store.set("k", "a", TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(store.set_if_present("k", "a", TTL).await.unwrap());
        tokio::time::sleep(Duration::from_millis(25)).await;
        // Without the refresh the original TTL would have expired by now.
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn incr_counts_from_missing_and_rejects_garbage() {
        let store = MemCoordStore::new();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr("n").await.unwrap(), 2);
        store.set("junk", "not a number", None).await.unwrap();
        assert!(matches!(
            store.incr("junk").await,
            Err(CoordError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn delete_allows_reuse() {
        let store = MemCoordStore::new();
        assert!(store.set_if_absent("k", "a", None).await.unwrap());
        store.delete("k").await.unwrap();
        assert!(store.set_if_absent("k", "b", None).await.unwrap());
    }

    #[tokio::test]
    async fn failure_switch_fails_everything() {
        let store = MemCoordStore::new();
        store.set("k", "v", None).await.unwrap();
        store.set_failing(true);
        assert!(store.ping().await.is_err());
        assert!(store.get("k").await.is_err());
        store.set_failing(false);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
