// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Broker configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default TTL of the leader lease.
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(10);

/// Default cadence of lease renewal while leader. Must stay below half the
/// lease TTL so that one missed renewal does not forfeit the lease.
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Default partition count for lazily created topics.
pub const DEFAULT_PARTITIONS: u32 = 3;

/// Default window during which a replayed message ID is recognized.
pub const DEFAULT_IDEMPOTENCE_TTL: Duration = Duration::from_secs(3600);

/// The topic used when a produce request does not name one.
pub const DEFAULT_TOPIC: &str = "default";

/// Configuration for a broker node.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // === Identity. ===
    /// Unique identity of this node; doubles as the leader-lease value.
    pub broker_id: String,

    // === Storage. ===
    /// Directory holding this node's partition log files.
    pub data_dir: PathBuf,

    // === Cluster options. ===
    /// Base URL of the peer broker that records are replicated to. `None`
    /// runs the node standalone, committing immediately after local append.
    pub peer_url: Option<String>,
    /// TTL of the leader lease.
    pub lease_time: Duration,
    /// Cadence of lease renewal while leader.
    pub renew_interval: Duration,
    /// What a failed replication does to the produce that caused it.
    pub replication_strictness: ReplicationStrictness,

    // === Data-plane options. ===
    /// Partition count for lazily created topics.
    pub default_partitions: u32,
    /// Window during which a replayed message ID is recognized.
    pub idempotence_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> BrokerConfig {
        BrokerConfig {
            broker_id: "broker".to_string(),
            data_dir: PathBuf::from("."),
            peer_url: None,
            lease_time: DEFAULT_LEASE_TIME,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            replication_strictness: ReplicationStrictness::BestEffort,
            default_partitions: DEFAULT_PARTITIONS,
            idempotence_ttl: DEFAULT_IDEMPOTENCE_TTL,
        }
    }
}

/// Whether a failed replication fails the produce that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationStrictness {
    /// Fail the produce and leave the record uncommitted: consistency over
    /// availability.
    Strict,
    /// Log a warning and commit anyway: availability over consistency. The
    /// follower diverges until it is rebuilt.
    BestEffort,
}

impl FromStr for ReplicationStrictness {
    type Err = String;

    fn from_str(s: &str) -> Result<ReplicationStrictness, String> {
        match s {
            "strict" => Ok(ReplicationStrictness::Strict),
            "best-effort" => Ok(ReplicationStrictness::BestEffort),
            other => Err(format!("unknown replication strictness: {}", other)),
        }
    }
}

impl fmt::Display for ReplicationStrictness {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReplicationStrictness::Strict => f.write_str("strict"),
            ReplicationStrictness::BestEffort => f.write_str("best-effort"),
        }
    }
}
