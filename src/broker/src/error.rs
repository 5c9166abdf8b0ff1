// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Broker error types.

use strand_coord_client::CoordError;
use strand_storage::StorageError;

/// An error surfaced by a broker operation.
///
/// The HTTP layer maps each variant onto a status code; nothing in this
/// crate knows about HTTP.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The request landed on a node that is not the leader.
    #[error("not the leader")]
    NotLeader {
        /// Identity of the current lease holder.
        leader_id: String,
    },
    /// The request landed while no node holds the lease.
    #[error("no leader elected yet")]
    NoLeader,
    /// The request was malformed.
    #[error("{0}")]
    InvalidRequest(String),
    /// A consume referenced a partition its topic does not have.
    #[error("topic {topic} has no partition {partition}")]
    UnknownPartition { topic: String, partition: u32 },
    /// Replication to the follower failed under strict mode.
    #[error("replication to follower failed: {0}")]
    ReplicationFailed(String),
    /// The coordination store failed.
    #[error(transparent)]
    Coord(#[from] CoordError),
    /// Local disk I/O failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An unclassified internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}
