// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Topic registry and key partitioning.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::info;

use strand_storage::{log_file_name, PartitionLog};

use crate::error::BrokerError;

/// One topic and its partition logs. Immutable once created: the partition
/// count of a topic never changes.
#[derive(Debug)]
pub struct Topic {
    name: String,
    partitions: Vec<Arc<PartitionLog>>,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> u32 {
        u32::try_from(self.partitions.len()).expect("partition count fits in u32")
    }

    /// The log for `partition`, if the topic has one.
    pub fn partition(&self, partition: u32) -> Option<&Arc<PartitionLog>> {
        self.partitions
            .get(usize::try_from(partition).expect("u32 fits in usize"))
    }
}

/// Lazily creates topics on first reference and hands out their partition
/// logs.
///
/// The first creation of a topic fixes its partition count; later `ensure`
/// calls return the existing topic no matter what count they pass. The
/// registry map sits behind a single lock, but the hot path — a lookup after
/// creation — takes it only for reading.
#[derive(Debug)]
pub struct TopicRegistry {
    broker_id: String,
    data_dir: PathBuf,
    topics: RwLock<BTreeMap<String, Arc<Topic>>>,
}

impl TopicRegistry {
    pub fn new(broker_id: String, data_dir: PathBuf) -> TopicRegistry {
        TopicRegistry {
            broker_id,
            data_dir,
            topics: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the topic named `name`, creating it with `partitions`
    /// partitions if this is its first reference.
    pub async fn ensure(&self, name: &str, partitions: u32) -> Result<Arc<Topic>, BrokerError> {
        {
            let topics = self.topics.read().expect("lock poisoned");
            if let Some(topic) = topics.get(name) {
                return Ok(Arc::clone(topic));
            }
        }
        // A topic has at least one partition.
        let partitions = partitions.max(1);
        // Open the logs outside the lock; opening touches the filesystem to
        // count any lines left over from a previous run.
        let mut logs = Vec::with_capacity(usize::try_from(partitions).expect("u32 fits in usize"));
        for partition in 0..partitions {
            let path = self
                .data_dir
                .join(log_file_name(&self.broker_id, name, partition));
            logs.push(Arc::new(PartitionLog::open(path).await?));
        }
        let created = Arc::new(Topic {
            name: name.to_string(),
            partitions: logs,
        });
        let mut topics = self.topics.write().expect("lock poisoned");
        if let Some(existing) = topics.get(name) {
            // Lost the creation race; the first ensure wins.
            return Ok(Arc::clone(existing));
        }
        info!("created topic {} with {} partitions", name, partitions);
        topics.insert(name.to_string(), Arc::clone(&created));
        Ok(created)
    }

    /// Returns the topic named `name`, if it has been created.
    pub fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().expect("lock poisoned").get(name).cloned()
    }

    /// A point-in-time snapshot of all topics.
    pub fn snapshot(&self) -> Vec<Arc<Topic>> {
        self.topics
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

/// Maps a record key to a partition.
///
/// Keyless records pin to partition 0. Keyed records hash stably within a
/// process, so every produce with a given key lands on the same partition of
/// its topic. Consumers learn the assignment from the produce reply, so the
/// choice of hash is local policy, not a wire contract.
pub fn partition_for(key: Option<&str>, partitions: u32) -> u32 {
    match key {
        None => 0,
        Some(key) => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            u32::try_from(hasher.finish() % u64::from(partitions)).expect("remainder fits in u32")
        }
    }
}
