// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Leader-side replication to the follower.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use strand_storage::Record;

use crate::config::ReplicationStrictness;
use crate::error::BrokerError;
use crate::metrics::Metrics;

/// Hard timeout for one replication round trip.
pub const REPLICATION_TIMEOUT: Duration = Duration::from_secs(3);

/// Ships appended records to the follower before they are committed.
#[derive(Debug)]
pub struct ReplicationClient {
    http: reqwest::Client,
    peer_url: Option<String>,
    strictness: ReplicationStrictness,
    metrics: Arc<Metrics>,
}

impl ReplicationClient {
    pub fn new(
        peer_url: Option<String>,
        strictness: ReplicationStrictness,
        metrics: Arc<Metrics>,
    ) -> Result<ReplicationClient, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(REPLICATION_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Internal(e.to_string()))?;
        Ok(ReplicationClient {
            http,
            peer_url,
            strictness,
            metrics,
        })
    }

    /// Ships one record to the follower. `Ok(())` means the caller may
    /// commit: the follower acked, or there is no follower, or the failure
    /// was absorbed by best-effort mode.
    pub async fn replicate(&self, record: &Record) -> Result<(), BrokerError> {
        let peer_url = match &self.peer_url {
            Some(url) => url,
            None => return Ok(()),
        };
        let url = format!("{}/internal/replicate", peer_url);
        let outcome = match self.http.post(&url).json(record).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("follower answered {}", response.status())),
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(()) => {
                self.metrics.record_replication(format!(
                    "replicated record to {}:p{}",
                    record.topic, record.partition
                ));
                Ok(())
            }
            Err(reason) => match self.strictness {
                ReplicationStrictness::Strict => Err(BrokerError::ReplicationFailed(reason)),
                ReplicationStrictness::BestEffort => {
                    warn!(
                        "replication to {} failed, committing anyway: {}",
                        peer_url, reason
                    );
                    self.metrics
                        .record_warning(format!("replication failed: {}", reason));
                    Ok(())
                }
            },
        }
    }
}
