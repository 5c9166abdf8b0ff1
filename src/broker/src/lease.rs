// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Leader election over a TTL lease.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use strand_coord_client::CoordStore;

use crate::error::BrokerError;
use crate::metrics::Metrics;
use crate::task;

/// Coordination store key holding the leader lease.
pub const LEASE_KEY: &str = "leader_lease";

/// How long the watch loop backs off after a coordination store error before
/// its next attempt.
const WATCH_RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// The role a broker currently plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Elects and maintains the leader via a TTL lease in the coordination store.
///
/// Acquisition is a conditional create, so two nodes cannot both take an
/// absent lease. Renewal is a conditional replace, so a node whose lease has
/// expired outright cannot silently re-establish it and steps down instead.
///
/// Two loops drive the state machine. The watch loop always runs, ticking
/// every half lease TTL: it acquires an absent lease, resumes renewal when
/// the lease unexpectedly names this node, and demotes when it names another.
/// The renew loop runs only while leader, refreshing the TTL every renew
/// interval, and exits as soon as a renewal is refused or fails.
#[derive(Debug)]
pub struct LeaseManager {
    coord: Arc<dyn CoordStore>,
    broker_id: String,
    lease_time: Duration,
    renew_interval: Duration,
    metrics: Arc<Metrics>,
    role_tx: watch::Sender<Role>,
    shutdown_tx: watch::Sender<bool>,
}

impl LeaseManager {
    pub fn new(
        coord: Arc<dyn CoordStore>,
        broker_id: String,
        lease_time: Duration,
        renew_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Arc<LeaseManager> {
        let (role_tx, _) = watch::channel(Role::Follower);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(LeaseManager {
            coord,
            broker_id,
            lease_time,
            renew_interval,
            metrics,
            role_tx,
            shutdown_tx,
        })
    }

    /// The broker's current role.
    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// The current lease holder, if any.
    pub async fn leader(&self) -> Result<Option<String>, BrokerError> {
        Ok(self.coord.get(LEASE_KEY).await?)
    }

    /// Starts the watch loop. Its first tick fires immediately and doubles as
    /// the startup election attempt.
    pub fn start(this: &Arc<LeaseManager>) {
        let manager = Arc::clone(this);
        task::spawn(|| "lease_watch", async move { manager.watch_loop().await });
    }

    /// Stops both loops. The lease is not released; it expires on its own,
    /// which is also what a crashed leader looks like to its peer.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }

    async fn watch_loop(self: Arc<LeaseManager>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut interval = time::interval(self.lease_time / 2);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = LeaseManager::reconcile(&self).await {
                        warn!("{}: lease watch failed: {}", self.broker_id, e);
                        time::sleep(WATCH_RETRY_BACKOFF).await;
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One watch tick: compare the observed lease holder with the local role
    /// and fix up whichever is behind.
    async fn reconcile(this: &Arc<LeaseManager>) -> Result<(), BrokerError> {
        match this.coord.get(LEASE_KEY).await? {
            None => {
                LeaseManager::try_acquire(this).await?;
            }
            Some(holder) if holder == this.broker_id => {
                // The lease names us but we may have lost track of it, e.g.
                // a renew loop that died on a store hiccup. Resume renewing.
                if this.promote() {
                    info!("{}: resuming leadership, lease already held", this.broker_id);
                    LeaseManager::spawn_renewer(this);
                }
            }
            Some(holder) => {
                if this.is_leader() {
                    this.demote(&format!("leadership taken over by {}", holder));
                }
            }
        }
        Ok(())
    }

    /// Attempts the election: a conditional create of the lease key.
    async fn try_acquire(this: &Arc<LeaseManager>) -> Result<bool, BrokerError> {
        let acquired = this
            .coord
            .set_if_absent(LEASE_KEY, &this.broker_id, Some(this.lease_time))
            .await?;
        if acquired && this.promote() {
            info!("{}: won election, now leader", this.broker_id);
            this.metrics
                .record_election_won(format!("{} won the election", this.broker_id));
            LeaseManager::spawn_renewer(this);
        }
        Ok(acquired)
    }

    /// Flips the role to leader. Returns whether this was a transition.
    fn promote(&self) -> bool {
        self.role_tx.send_replace(Role::Leader) == Role::Follower
    }

    /// Steps down to follower.
    fn demote(&self, reason: &str) {
        if self.role_tx.send_replace(Role::Follower) == Role::Leader {
            warn!("{}: stepping down: {}", self.broker_id, reason);
            self.metrics
                .record_leadership_change(format!("{} stepped down: {}", self.broker_id, reason));
        }
    }

    fn spawn_renewer(this: &Arc<LeaseManager>) {
        let manager = Arc::clone(this);
        task::spawn(|| "lease_renew", async move { manager.renew_loop().await });
    }

    /// Refreshes the lease TTL until leadership is lost or the manager is
    /// closed. Exits after demoting; the watch loop takes it from there.
    async fn renew_loop(self: Arc<LeaseManager>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut interval = time::interval(self.renew_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it, the lease was
        // written moments ago by the acquisition.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.is_leader() {
                        return;
                    }
                    match self
                        .coord
                        .set_if_present(LEASE_KEY, &self.broker_id, Some(self.lease_time))
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            self.demote("lease expired before renewal");
                            return;
                        }
                        Err(e) => {
                            self.demote(&format!("coordination store unreachable: {}", e));
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use strand_coord_client::MemCoordStore;

    use crate::now::SYSTEM_TIME;

    use super::*;

    const LEASE: Duration = Duration::from_millis(300);
    const RENEW: Duration = Duration::from_millis(100);

    fn manager(broker_id: &str, coord: &Arc<MemCoordStore>) -> (Arc<LeaseManager>, Arc<Metrics>) {
        manager_with(broker_id, coord, RENEW)
    }

    fn manager_with(
        broker_id: &str,
        coord: &Arc<MemCoordStore>,
        renew_interval: Duration,
    ) -> (Arc<LeaseManager>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new(SYSTEM_TIME.clone()));
        let manager = LeaseManager::new(
            Arc::clone(coord) as Arc<dyn CoordStore>,
            broker_id.to_string(),
            LEASE,
            renew_interval,
            Arc::clone(&metrics),
        );
        (manager, metrics)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration, what: &str) {
        let deadline = time::Instant::now() + timeout;
        while !cond() {
            if time::Instant::now() > deadline {
                panic!("timed out after {:?} waiting for {}", timeout, what);
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn startup_election_acquires_absent_lease() {
        let coord = Arc::new(MemCoordStore::new());
        let (manager, metrics) = manager("b1", &coord);
        LeaseManager::start(&manager);
        wait_for(|| manager.is_leader(), Duration::from_secs(2), "leadership").await;
        assert_eq!(manager.leader().await.unwrap().as_deref(), Some("b1"));
        assert_eq!(metrics.snapshot().elections_won, 1);
        manager.close();
    }

    #[tokio::test]
    async fn second_node_stays_follower_while_lease_is_held() {
        let coord = Arc::new(MemCoordStore::new());
        let (first, _) = manager("b1", &coord);
        LeaseManager::start(&first);
        wait_for(|| first.is_leader(), Duration::from_secs(2), "b1 leadership").await;
        let (second, _) = manager("b2", &coord);
        LeaseManager::start(&second);
        time::sleep(LEASE * 2).await;
        assert!(first.is_leader());
        assert_eq!(second.role(), Role::Follower);
        first.close();
        second.close();
    }

    #[tokio::test]
    async fn renewal_keeps_the_lease_past_its_ttl() {
        let coord = Arc::new(MemCoordStore::new());
        let (manager, _) = manager("b1", &coord);
        LeaseManager::start(&manager);
        wait_for(|| manager.is_leader(), Duration::from_secs(2), "leadership").await;
        time::sleep(LEASE * 3).await;
        assert!(manager.is_leader());
        assert_eq!(manager.leader().await.unwrap().as_deref(), Some("b1"));
        manager.close();
    }

    #[tokio::test]
    async fn follower_takes_over_when_the_leader_stops_renewing() {
        let coord = Arc::new(MemCoordStore::new());
        let (first, _) = manager("b1", &coord);
        LeaseManager::start(&first);
        wait_for(|| first.is_leader(), Duration::from_secs(2), "b1 leadership").await;
        let (second, second_metrics) = manager("b2", &coord);
        LeaseManager::start(&second);
        first.close();
        // Within 2x the lease TTL the old lease expires and the follower's
        // watch tick claims it.
        wait_for(|| second.is_leader(), Duration::from_secs(3), "b2 takeover").await;
        assert_eq!(second.leader().await.unwrap().as_deref(), Some("b2"));
        assert_eq!(second_metrics.snapshot().elections_won, 1);
        second.close();
    }

    #[tokio::test]
    async fn coordination_outage_demotes_the_leader() {
        let coord = Arc::new(MemCoordStore::new());
        let (manager, metrics) = manager("b1", &coord);
        LeaseManager::start(&manager);
        wait_for(|| manager.is_leader(), Duration::from_secs(2), "leadership").await;
        coord.set_failing(true);
        wait_for(
            || !manager.is_leader(),
            Duration::from_secs(2),
            "demotion on outage",
        )
        .await;
        assert_eq!(metrics.snapshot().leadership_changes, 1);
        coord.set_failing(false);
        manager.close();
    }

    #[tokio::test]
    async fn foreign_lease_holder_demotes_a_stale_leader() {
        let coord = Arc::new(MemCoordStore::new());
        // A renew interval far past the test horizon keeps the renew loop
        // from racing the watch loop's takeover observation.
        let (manager, _) = manager_with("b1", &coord, Duration::from_secs(60));
        LeaseManager::start(&manager);
        wait_for(|| manager.is_leader(), Duration::from_secs(2), "leadership").await;
        // Another node (or an operator) overwrote the lease out from under
        // us; the watch loop must notice and step down.
        coord.set(LEASE_KEY, "intruder", None).await.unwrap();
        wait_for(
            || !manager.is_leader(),
            Duration::from_secs(2),
            "demotion on takeover",
        )
        .await;
        assert_eq!(manager.leader().await.unwrap().as_deref(), Some("intruder"));
        manager.close();
    }
}
