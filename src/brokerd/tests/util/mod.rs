// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Test harness: in-process broker servers over a shared in-memory
//! coordination store.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use strand_broker::{Broker, BrokerConfig, ReplicationStrictness};
use strand_coord_client::CoordStore;

/// Lease timing for tests: short enough that a failover completes in about
/// a second.
pub const TEST_LEASE_TIME: Duration = Duration::from_millis(400);
pub const TEST_RENEW_INTERVAL: Duration = Duration::from_millis(150);

/// Options for a test broker.
pub struct Config {
    broker_id: String,
    peer_url: Option<String>,
    replication_strictness: ReplicationStrictness,
    start_elections: bool,
}

impl Config {
    pub fn new(broker_id: &str) -> Config {
        Config {
            broker_id: broker_id.to_string(),
            peer_url: None,
            replication_strictness: ReplicationStrictness::BestEffort,
            start_elections: true,
        }
    }

    pub fn peer_url(mut self, url: &str) -> Config {
        self.peer_url = Some(url.to_string());
        self
    }

    pub fn strict(mut self) -> Config {
        self.replication_strictness = ReplicationStrictness::Strict;
        self
    }

    /// Leaves the election loops stopped, so the node stays a follower.
    pub fn paused(mut self) -> Config {
        self.start_elections = false;
        self
    }
}

/// A broker serving HTTP on an ephemeral port.
pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub base_url: String,
    server: JoinHandle<()>,
    _data_dir: TempDir,
}

impl TestBroker {
    /// Stops serving and stops renewing the lease, which then expires on its
    /// own — the shape of a crashed leader.
    pub fn kill(self) {
        self.broker.lease().close();
        self.server.abort();
    }

    pub async fn wait_until_leader(&self) {
        let broker = Arc::clone(&self.broker);
        wait_for(
            move || broker.is_leader(),
            Duration::from_secs(5),
            "leadership",
        )
        .await;
    }
}

pub async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out after {:?} waiting for {}", timeout, what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Binds an ephemeral port without serving on it yet, so two brokers can be
/// configured with each other's URLs before either is running.
pub fn reserve_addr() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("listener addr");
    (listener, format!("http://{}", addr))
}

pub async fn start_broker(config: Config, coord: Arc<dyn CoordStore>) -> TestBroker {
    let (listener, base_url) = reserve_addr();
    start_broker_on(config, coord, listener, base_url).await
}

pub async fn start_broker_on(
    config: Config,
    coord: Arc<dyn CoordStore>,
    listener: TcpListener,
    base_url: String,
) -> TestBroker {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let cfg = BrokerConfig {
        broker_id: config.broker_id,
        data_dir: data_dir.path().to_path_buf(),
        peer_url: config.peer_url,
        lease_time: TEST_LEASE_TIME,
        renew_interval: TEST_RENEW_INTERVAL,
        replication_strictness: config.replication_strictness,
        ..Default::default()
    };
    let broker = Broker::new(cfg, coord).expect("broker init");
    if config.start_elections {
        broker.start();
    }
    listener.set_nonblocking(true).expect("nonblocking listener");
    let server = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .expect("server from listener")
                .serve(strand_brokerd::http::router(broker).into_make_service())
                .await
                .expect("server failed");
        })
    };
    TestBroker {
        broker,
        base_url,
        server,
        _data_dir: data_dir,
    }
}
