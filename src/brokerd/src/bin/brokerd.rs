// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The broker daemon binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use strand_broker::{Broker, BrokerConfig, ReplicationStrictness};
use strand_coord_client::RedisCoordStore;

/// A lease-coordinated partitioned log broker.
#[derive(Parser)]
#[clap(name = "brokerd")]
struct Args {
    // === Identity. ===
    /// Unique identity of this broker; doubles as the leader-lease value.
    /// Defaults to `broker-$HOSTNAME`.
    #[clap(long, env = "STRAND_BROKER_ID", value_name = "ID")]
    broker_id: Option<String>,

    // === Connection options. ===
    /// The address to serve the HTTP surface on.
    #[clap(
        long,
        env = "STRAND_LISTEN_ADDR",
        value_name = "HOST:PORT",
        default_value = "0.0.0.0:5001"
    )]
    listen_addr: SocketAddr,
    /// URL of the coordination store.
    #[clap(
        long,
        env = "STRAND_COORD_URL",
        value_name = "URL",
        default_value = "redis://localhost:6379"
    )]
    coord_url: String,
    /// Base URL of the peer broker to replicate to. Omit to run single-node.
    #[clap(long, env = "STRAND_PEER_URL", value_name = "URL")]
    peer_url: Option<String>,

    // === Storage options. ===
    /// Directory for partition log files.
    #[clap(long, env = "STRAND_DATA_DIR", value_name = "PATH", default_value = ".")]
    data_dir: PathBuf,

    // === Cluster tuning. ===
    /// Leader lease TTL, in seconds.
    #[clap(long, env = "STRAND_LEASE_TIME", value_name = "SECONDS", default_value = "10")]
    lease_time: u64,
    /// Lease renewal cadence, in seconds. Keep below half the lease TTL.
    #[clap(
        long,
        env = "STRAND_RENEW_INTERVAL",
        value_name = "SECONDS",
        default_value = "5"
    )]
    renew_interval: u64,
    /// Partition count for lazily created topics.
    #[clap(
        long,
        env = "STRAND_DEFAULT_PARTITIONS",
        value_name = "N",
        default_value = "3"
    )]
    default_partitions: u32,
    /// How long a message ID is remembered for deduplication, in seconds.
    #[clap(
        long,
        env = "STRAND_IDEMPOTENCE_TTL",
        value_name = "SECONDS",
        default_value = "3600"
    )]
    idempotence_ttl: u64,
    /// What a failed replication does to the produce that caused it:
    /// "strict" fails it, "best-effort" commits anyway.
    #[clap(
        long,
        env = "STRAND_REPLICATION_STRICTNESS",
        value_name = "MODE",
        default_value = "best-effort"
    )]
    replication_strictness: ReplicationStrictness,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("brokerd: fatal: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let broker_id = args.broker_id.clone().unwrap_or_else(default_broker_id);
    let coord = RedisCoordStore::connect(&args.coord_url)
        .await
        .with_context(|| format!("connecting to coordination store at {}", args.coord_url))?;
    info!(
        "{}: connected to coordination store at {}",
        broker_id, args.coord_url
    );

    let cfg = BrokerConfig {
        broker_id,
        data_dir: args.data_dir.clone(),
        peer_url: args.peer_url.clone(),
        lease_time: Duration::from_secs(args.lease_time),
        renew_interval: Duration::from_secs(args.renew_interval),
        replication_strictness: args.replication_strictness,
        default_partitions: args.default_partitions,
        idempotence_ttl: Duration::from_secs(args.idempotence_ttl),
    };
    let broker = Broker::new(cfg, Arc::new(coord))?;
    strand_brokerd::serve(args.listen_addr, broker).await
}

/// Defaults the broker identity to the host name.
fn default_broker_id() -> String {
    match std::env::var("HOSTNAME") {
        Ok(host) if !host.is_empty() => format!("broker-{}", host),
        _ => "broker-local".to_string(),
    }
}
