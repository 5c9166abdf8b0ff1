// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The broker core.
//!
//! A [`Broker`] is the shared state behind every HTTP handler of a node. Two
//! brokers share nothing but the coordination store: one of them holds the
//! leader lease and serves produces and consumes, the other runs warm,
//! ingesting replicated records until the lease falls to it.
//!
//! A produce runs: leader check → message ID claim → topic ensure →
//! partition assignment → local append → replication to the peer → commit
//! (high-water-mark increment) → reply. A consume runs: leader check →
//! topic ensure → high-water-mark read → log scan. Consumers never observe
//! an offset above the high-water mark, and every failure after a message ID
//! claim releases the claim so the producer's retry is not mistaken for a
//! duplicate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use strand_coord_client::CoordStore;
use strand_storage::StorageError;

pub mod commit;
pub mod config;
pub mod error;
pub mod idempotence;
pub mod lease;
pub mod metrics;
pub mod now;
pub mod replication;
pub mod task;
pub mod topic;

pub use crate::config::{BrokerConfig, ReplicationStrictness, DEFAULT_TOPIC};
pub use crate::error::BrokerError;
pub use crate::lease::{LeaseManager, Role, LEASE_KEY};
pub use crate::metrics::{ActivityEvent, ActivityKind, Metrics, MetricsSnapshot};
pub use strand_storage::Record;

use crate::commit::CommitIndex;
use crate::idempotence::{Claim, IdempotenceFilter};
use crate::now::NowFn;
use crate::replication::ReplicationClient;
use crate::topic::{partition_for, TopicRegistry};

/// Body of a produce request.
#[derive(Debug, Clone, Deserialize)]
pub struct ProduceRequest {
    /// Producer-supplied unique ID used to dedupe retries.
    pub msg_id: String,
    /// The record to publish.
    pub data: ProduceData,
}

/// The record portion of a produce request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProduceData {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Whether a produce appended a new record or recognized a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProduceStatus {
    Success,
    Duplicate,
}

/// Reply to a produce request.
///
/// Duplicate replies carry no offset or partition: the broker does not
/// remember where the original landed, and the message ID is a dedupe token,
/// not a commit receipt.
#[derive(Debug, Clone, Serialize)]
pub struct ProduceResponse {
    pub status: ProduceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    pub leader_id: String,
}

/// One delivered record.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeMessage {
    pub offset: u64,
    pub topic: String,
    pub partition: u32,
    pub data: Record,
}

/// Reply to a consume request.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeResponse {
    pub messages: Vec<ConsumeMessage>,
    pub high_water_mark: u64,
}

/// One topic in a topics listing.
#[derive(Debug, Clone, Serialize)]
pub struct TopicSummary {
    pub name: String,
    pub partitions: u32,
    pub messages: u64,
}

/// Reply to a topics listing.
#[derive(Debug, Clone, Serialize)]
pub struct TopicsResponse {
    pub topics: Vec<TopicSummary>,
}

/// Reply to a leader metadata request.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderStatus {
    pub leader_id: String,
    pub is_leader: bool,
}

/// Reply to a health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub status: &'static str,
    pub broker_id: String,
    pub is_leader: bool,
    pub coordination_connected: bool,
    pub leader: Option<String>,
}

/// A broker node.
#[derive(Debug)]
pub struct Broker {
    cfg: BrokerConfig,
    coord: Arc<dyn CoordStore>,
    topics: TopicRegistry,
    commits: CommitIndex,
    idempotence: IdempotenceFilter,
    replication: ReplicationClient,
    lease: Arc<LeaseManager>,
    metrics: Arc<Metrics>,
    now: NowFn,
}

impl Broker {
    /// Creates a broker over `coord`. The broker does not participate in
    /// elections until [`Broker::start`] is called.
    pub fn new(cfg: BrokerConfig, coord: Arc<dyn CoordStore>) -> Result<Arc<Broker>, BrokerError> {
        std::fs::create_dir_all(&cfg.data_dir).map_err(StorageError::Io)?;
        let now = now::SYSTEM_TIME.clone();
        let metrics = Arc::new(Metrics::new(now.clone()));
        let topics = TopicRegistry::new(cfg.broker_id.clone(), cfg.data_dir.clone());
        let commits = CommitIndex::new(Arc::clone(&coord));
        let idempotence = IdempotenceFilter::new(Arc::clone(&coord), cfg.idempotence_ttl);
        let replication = ReplicationClient::new(
            cfg.peer_url.clone(),
            cfg.replication_strictness,
            Arc::clone(&metrics),
        )?;
        let lease = LeaseManager::new(
            Arc::clone(&coord),
            cfg.broker_id.clone(),
            cfg.lease_time,
            cfg.renew_interval,
            Arc::clone(&metrics),
        );
        Ok(Arc::new(Broker {
            cfg,
            coord,
            topics,
            commits,
            idempotence,
            replication,
            lease,
            metrics,
            now,
        }))
    }

    /// Starts the election loops.
    pub fn start(&self) {
        LeaseManager::start(&self.lease);
    }

    pub fn broker_id(&self) -> &str {
        &self.cfg.broker_id
    }

    pub fn is_leader(&self) -> bool {
        self.lease.is_leader()
    }

    pub fn lease(&self) -> &Arc<LeaseManager> {
        &self.lease
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Rejects the request unless this node currently holds the lease.
    async fn check_leader(&self) -> Result<(), BrokerError> {
        if self.lease.is_leader() {
            return Ok(());
        }
        match self.lease.leader().await? {
            Some(leader_id) => Err(BrokerError::NotLeader { leader_id }),
            None => Err(BrokerError::NoLeader),
        }
    }

    /// Publishes one record.
    pub async fn produce(&self, req: ProduceRequest) -> Result<ProduceResponse, BrokerError> {
        self.check_leader().await?;
        if req.msg_id.is_empty() {
            return Err(BrokerError::InvalidRequest("msg_id is required".into()));
        }
        let topic = req
            .data
            .topic
            .clone()
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        match self.idempotence.claim(&req.msg_id).await? {
            Claim::Duplicate => {
                warn!(
                    "{}: ignoring duplicate produce for msg_id {}",
                    self.cfg.broker_id, req.msg_id
                );
                self.metrics
                    .record_warning(format!("ignored duplicate msg_id {}", req.msg_id));
                return Ok(ProduceResponse {
                    status: ProduceStatus::Duplicate,
                    offset: None,
                    topic,
                    partition: None,
                    leader_id: self.cfg.broker_id.clone(),
                });
            }
            Claim::New => {}
        }
        match self.produce_claimed(&req, &topic).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // Give the claim back so a retry of this msg_id is not
                // mistaken for a duplicate of the failed attempt.
                if let Err(release) = self.idempotence.release(&req.msg_id).await {
                    warn!(
                        "failed to release claim for msg_id {}: {}",
                        req.msg_id, release
                    );
                }
                Err(e)
            }
        }
    }

    /// The post-claim produce pipeline: ensure, append, replicate, commit.
    async fn produce_claimed(
        &self,
        req: &ProduceRequest,
        topic_name: &str,
    ) -> Result<ProduceResponse, BrokerError> {
        let topic = self
            .topics
            .ensure(topic_name, self.cfg.default_partitions)
            .await?;
        let partition = partition_for(req.data.key.as_deref(), topic.partition_count());
        let record = Record {
            msg_id: req.msg_id.clone(),
            topic: topic_name.to_string(),
            partition,
            key: req.data.key.clone(),
            payload: req.data.payload.clone().unwrap_or(serde_json::Value::Null),
            timestamp: self.now.now(),
        };
        let log = topic.partition(partition).expect("assigned partition exists");
        log.append(&record).await?;
        self.replication.replicate(&record).await?;
        let offset = self.commits.commit(topic_name, partition).await?;
        self.metrics.record_produce(
            topic_name,
            format!("committed offset {} to {}:p{}", offset, topic_name, partition),
        );
        Ok(ProduceResponse {
            status: ProduceStatus::Success,
            offset: Some(offset),
            topic: topic_name.to_string(),
            partition: Some(partition),
            leader_id: self.cfg.broker_id.clone(),
        })
    }

    /// Serves committed records strictly after `offset` for one partition.
    pub async fn consume(
        &self,
        topic_name: &str,
        partition: u32,
        offset: u64,
    ) -> Result<ConsumeResponse, BrokerError> {
        self.check_leader().await?;
        let topic = self
            .topics
            .ensure(topic_name, self.cfg.default_partitions)
            .await?;
        if partition >= topic.partition_count() {
            return Err(BrokerError::UnknownPartition {
                topic: topic_name.to_string(),
                partition,
            });
        }
        let hwm = self.commits.hwm(topic_name, partition).await?;
        let log = topic.partition(partition).expect("bounds checked above");
        let records = log.scan(offset, hwm).await?;
        let messages: Vec<ConsumeMessage> = records
            .into_iter()
            .map(|(offset, record)| ConsumeMessage {
                offset,
                topic: topic_name.to_string(),
                partition,
                data: record,
            })
            .collect();
        self.metrics.record_consume(
            u64::try_from(messages.len()).expect("message count fits in u64"),
            format!(
                "served {} record(s) from {}:p{}",
                messages.len(),
                topic_name,
                partition
            ),
        );
        Ok(ConsumeResponse {
            messages,
            high_water_mark: hwm,
        })
    }

    /// Accepts one record replicated in by the leader.
    ///
    /// Never touches the high-water mark: the commit frontier lives in shared
    /// coordination state, and a follower bumping it would double-count.
    pub async fn apply_replicated(&self, record: Record) -> Result<(), BrokerError> {
        if self.lease.is_leader() {
            // A leader receiving replication traffic means the peer is (or
            // was until moments ago) acting on a stale view of the lease.
            return Err(BrokerError::InvalidRequest(
                "replication request received by the leader".into(),
            ));
        }
        let topic = self
            .topics
            .ensure(&record.topic, self.cfg.default_partitions)
            .await?;
        let log = topic.partition(record.partition).ok_or_else(|| {
            BrokerError::InvalidRequest(format!(
                "topic {} has no partition {}",
                record.topic, record.partition
            ))
        })?;
        log.append(&record).await?;
        self.metrics.record_replication(format!(
            "replicated record into {}:p{}",
            record.topic, record.partition
        ));
        Ok(())
    }

    /// Current topics with partition and produced-message counts.
    pub fn topics(&self) -> TopicsResponse {
        let topics = self
            .topics
            .snapshot()
            .iter()
            .map(|topic| TopicSummary {
                name: topic.name().to_string(),
                partitions: topic.partition_count(),
                messages: self.metrics.topic_messages(topic.name()),
            })
            .collect();
        TopicsResponse { topics }
    }

    /// The lease holder as seen by this node, if any.
    pub async fn leader_status(&self) -> Result<Option<LeaderStatus>, BrokerError> {
        Ok(self.lease.leader().await?.map(|leader_id| LeaderStatus {
            is_leader: leader_id == self.cfg.broker_id,
            leader_id,
        }))
    }

    /// Liveness summary. Never fails: an unreachable coordination store is
    /// reported in the summary, not propagated.
    pub async fn health(&self) -> HealthSummary {
        let coordination_connected = self.coord.ping().await.is_ok();
        let leader = if coordination_connected {
            self.lease.leader().await.ok().flatten()
        } else {
            None
        };
        HealthSummary {
            status: if coordination_connected {
                "healthy"
            } else {
                "unhealthy"
            },
            broker_id: self.cfg.broker_id.clone(),
            is_leader: self.lease.is_leader(),
            coordination_connected,
            leader,
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
