// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client for the coordination store that holds cluster state.
//!
//! Everything the two broker nodes share — the leader lease, the
//! per-partition high-water marks, and the idempotence locks — lives in an
//! external TTL key/value store. [`CoordStore`] is the contract over that
//! store. [`RedisCoordStore`] is the production implementation;
//! [`MemCoordStore`] is an in-process implementation for tests and
//! single-node development.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

pub mod mem;

pub use crate::mem::MemCoordStore;

/// An error returned by a [`CoordStore`] operation.
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// The store could not be reached or refused the operation.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    /// A stored value did not have the shape the caller expected.
    #[error("malformed value for key {key}: {value}")]
    Malformed {
        /// The key that held the value.
        key: String,
        /// The offending value.
        value: String,
    },
}

impl From<redis::RedisError> for CoordError {
    fn from(e: redis::RedisError) -> CoordError {
        CoordError::Unavailable(e.to_string())
    }
}

/// The operations the broker requires of its coordination store.
///
/// The conditional sets are the load-bearing part of the contract: leader
/// election is a `set_if_absent` and lease renewal a `set_if_present`, so
/// both must be atomic in the store itself.
#[async_trait]
pub trait CoordStore: fmt::Debug + Send + Sync {
    /// Returns the value at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError>;

    /// Unconditionally sets `key`, with a TTL if one is given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError>;

    /// Sets `key` only if it does not exist. Returns whether the set applied.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordError>;

    /// Sets `key` only if it already exists, refreshing any TTL. Returns
    /// whether the set applied.
    async fn set_if_present(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordError>;

    /// Atomically increments the integer at `key`, treating a missing key
    /// as 0, and returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, CoordError>;

    /// Deletes `key`, if it exists.
    async fn delete(&self, key: &str) -> Result<(), CoordError>;

    /// Verifies that the store is reachable.
    async fn ping(&self) -> Result<(), CoordError>;
}

/// A [`CoordStore`] backed by Redis.
///
/// `set_if_absent` and `set_if_present` map to `SET ... NX` and `SET ... XX`,
/// which Redis applies atomically; `incr` maps to `INCR`.
#[derive(Clone)]
pub struct RedisCoordStore {
    conn: redis::aio::MultiplexedConnection,
    url: String,
}

impl fmt::Debug for RedisCoordStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RedisCoordStore")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl RedisCoordStore {
    /// Connects to the store at `url` (e.g. `redis://localhost:6379`) and
    /// verifies the connection with a ping.
    pub async fn connect(url: &str) -> Result<RedisCoordStore, CoordError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        let store = RedisCoordStore {
            conn,
            url: url.to_string(),
        };
        store.ping().await?;
        debug!("connected to coordination store at {}", url);
        Ok(store)
    }
}

/// TTLs are passed to Redis in milliseconds so sub-second leases (used by
/// tests) survive the conversion.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl CoordStore for RedisCoordStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.arg("NX");
        let applied: redis::Value = cmd.query_async(&mut conn).await?;
        Ok(matches!(applied, redis::Value::Okay))
    }

    async fn set_if_present(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.arg("XX");
        let applied: redis::Value = cmd.query_async(&mut conn).await?;
        Ok(matches!(applied, redis::Value::Okay))
    }

    async fn incr(&self, key: &str) -> Result<i64, CoordError> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(n)
    }

    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async::<_, i64>(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
