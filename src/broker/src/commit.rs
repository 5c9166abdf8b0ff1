// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The committed-offset index.

use std::sync::Arc;

use strand_coord_client::{CoordError, CoordStore};

use crate::error::BrokerError;

/// Tracks the high-water mark of every partition in the coordination store.
///
/// The high-water mark is the largest committed, consumer-visible offset. It
/// lives in shared coordination state rather than next to the log file so
/// that it survives restarts and a promoted follower sees the commit frontier
/// the old leader left behind.
#[derive(Debug, Clone)]
pub struct CommitIndex {
    coord: Arc<dyn CoordStore>,
}

fn hwm_key(topic: &str, partition: u32) -> String {
    format!("hwm:{}:{}", topic, partition)
}

impl CommitIndex {
    pub fn new(coord: Arc<dyn CoordStore>) -> CommitIndex {
        CommitIndex { coord }
    }

    /// The high-water mark for a partition. A partition nothing has ever
    /// committed to reads as 0.
    pub async fn hwm(&self, topic: &str, partition: u32) -> Result<u64, BrokerError> {
        let key = hwm_key(topic, partition);
        match self.coord.get(&key).await? {
            None => Ok(0),
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| BrokerError::Coord(CoordError::Malformed { key, value })),
        }
    }

    /// Commits one record, returning its offset.
    pub async fn commit(&self, topic: &str, partition: u32) -> Result<u64, BrokerError> {
        let n = self.coord.incr(&hwm_key(topic, partition)).await?;
        u64::try_from(n).map_err(|_| {
            BrokerError::Coord(CoordError::Malformed {
                key: hwm_key(topic, partition),
                value: n.to_string(),
            })
        })
    }
}
