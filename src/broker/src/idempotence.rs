// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Message ID deduplication.

use std::sync::Arc;
use std::time::Duration;

use strand_coord_client::CoordStore;

use crate::error::BrokerError;

/// Outcome of claiming a message ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First sighting within the idempotence window; the produce proceeds.
    New,
    /// Replay of an ID claimed within the window.
    Duplicate,
}

/// Dedupes producer retries by message ID.
///
/// A claim is a conditional set-if-absent with a TTL in the coordination
/// store, so both brokers share one dedup window. The lock is a dedupe token
/// only: it does not remember the offset the original produce committed to,
/// and duplicate replies must not pretend otherwise.
#[derive(Debug, Clone)]
pub struct IdempotenceFilter {
    coord: Arc<dyn CoordStore>,
    ttl: Duration,
}

fn lock_key(msg_id: &str) -> String {
    format!("msg_lock:{}", msg_id)
}

impl IdempotenceFilter {
    pub fn new(coord: Arc<dyn CoordStore>, ttl: Duration) -> IdempotenceFilter {
        IdempotenceFilter { coord, ttl }
    }

    /// Claims `msg_id` for the configured window.
    pub async fn claim(&self, msg_id: &str) -> Result<Claim, BrokerError> {
        let new = self
            .coord
            .set_if_absent(&lock_key(msg_id), "processed", Some(self.ttl))
            .await?;
        Ok(if new { Claim::New } else { Claim::Duplicate })
    }

    /// Releases a claim so a retry of the same message ID can succeed.
    /// Called when the produce pipeline fails after claiming.
    pub async fn release(&self, msg_id: &str) -> Result<(), BrokerError> {
        self.coord.delete(&lock_key(msg_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use strand_coord_client::MemCoordStore;

    use super::*;

    #[tokio::test]
    async fn claims_dedupe_until_released() {
        let filter = IdempotenceFilter::new(
            Arc::new(MemCoordStore::new()),
            Duration::from_secs(60),
        );
        assert_eq!(filter.claim("m1").await.unwrap(), Claim::New);
        assert_eq!(filter.claim("m1").await.unwrap(), Claim::Duplicate);
        assert_eq!(filter.claim("m2").await.unwrap(), Claim::New);
        filter.release("m1").await.unwrap();
        assert_eq!(filter.claim("m1").await.unwrap(), Claim::New);
    }

    #[tokio::test]
    async fn claims_expire_with_the_window() {
        let filter = IdempotenceFilter::new(
            Arc::new(MemCoordStore::new()),
            Duration::from_millis(40),
        );
        assert_eq!(filter.claim("m1").await.unwrap(), Claim::New);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(filter.claim("m1").await.unwrap(), Claim::New);
    }
}
