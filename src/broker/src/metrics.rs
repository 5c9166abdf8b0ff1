// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Process-local counters and the recent-activity ring.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

use crate::now::{EpochMillis, NowFn};

/// Capacity of the recent-activity ring.
pub const ACTIVITY_RING_CAPACITY: usize = 50;

/// The kind of a recent-activity event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Produce,
    Consume,
    Replicate,
    Election,
    Warning,
}

/// One recent-activity event, newest first in the ring.
#[derive(Clone, Debug, Serialize)]
pub struct ActivityEvent {
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub message: String,
    pub timestamp: EpochMillis,
}

/// A point-in-time copy of the counters and the ring.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub messages_produced: u64,
    pub messages_consumed: u64,
    pub replications: u64,
    pub elections_won: u64,
    pub leadership_changes: u64,
    pub last_replication: Option<EpochMillis>,
    pub recent_activity: Vec<ActivityEvent>,
}

/// Counters and the activity ring, behind a single lock. Updates are small
/// and cheap next to the disk and network work of the requests that make
/// them, so one mutex is enough.
#[derive(Debug)]
pub struct Metrics {
    now: NowFn,
    inner: Mutex<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    messages_produced: u64,
    messages_consumed: u64,
    replications: u64,
    elections_won: u64,
    leadership_changes: u64,
    last_replication: Option<EpochMillis>,
    topic_messages: BTreeMap<String, u64>,
    activity: VecDeque<ActivityEvent>,
}

impl MetricsInner {
    fn push_activity(&mut self, now: EpochMillis, kind: ActivityKind, message: String) {
        self.activity.push_front(ActivityEvent {
            kind,
            message,
            timestamp: now,
        });
        self.activity.truncate(ACTIVITY_RING_CAPACITY);
    }
}

impl Metrics {
    pub fn new(now: NowFn) -> Metrics {
        Metrics {
            now,
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    pub fn record_produce(&self, topic: &str, message: String) {
        let now = self.now.now();
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.messages_produced += 1;
        *inner.topic_messages.entry(topic.to_string()).or_insert(0) += 1;
        inner.push_activity(now, ActivityKind::Produce, message);
    }

    /// Records a consume of `count` records. Empty reads do not land in the
    /// activity ring; polling consumers would drown everything else out.
    pub fn record_consume(&self, count: u64, message: String) {
        let now = self.now.now();
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.messages_consumed += count;
        if count > 0 {
            inner.push_activity(now, ActivityKind::Consume, message);
        }
    }

    pub fn record_replication(&self, message: String) {
        let now = self.now.now();
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.replications += 1;
        inner.last_replication = Some(now);
        inner.push_activity(now, ActivityKind::Replicate, message);
    }

    pub fn record_election_won(&self, message: String) {
        let now = self.now.now();
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.elections_won += 1;
        inner.push_activity(now, ActivityKind::Election, message);
    }

    pub fn record_leadership_change(&self, message: String) {
        let now = self.now.now();
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.leadership_changes += 1;
        inner.push_activity(now, ActivityKind::Election, message);
    }

    pub fn record_warning(&self, message: String) {
        let now = self.now.now();
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.push_activity(now, ActivityKind::Warning, message);
    }

    /// Produced-message count for one topic, as seen by this process.
    pub fn topic_messages(&self, topic: &str) -> u64 {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.topic_messages.get(topic).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("lock poisoned");
        MetricsSnapshot {
            messages_produced: inner.messages_produced,
            messages_consumed: inner.messages_consumed,
            replications: inner.replications,
            elections_won: inner.elections_won,
            leadership_changes: inner.leadership_changes,
            last_replication: inner.last_replication,
            recent_activity: inner.activity.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::now::SYSTEM_TIME;

    use super::*;

    #[test]
    fn ring_is_bounded_and_newest_first() {
        let metrics = Metrics::new(SYSTEM_TIME.clone());
        for i in 0..(ACTIVITY_RING_CAPACITY + 10) {
            metrics.record_produce("t", format!("event {}", i));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.recent_activity.len(), ACTIVITY_RING_CAPACITY);
        assert_eq!(
            snapshot.recent_activity[0].message,
            format!("event {}", ACTIVITY_RING_CAPACITY + 9)
        );
    }

    #[test]
    fn counters_add_up() {
        let metrics = Metrics::new(SYSTEM_TIME.clone());
        metrics.record_produce("t", "p".into());
        metrics.record_produce("t", "p".into());
        metrics.record_produce("u", "p".into());
        metrics.record_consume(3, "c".into());
        metrics.record_consume(0, "empty".into());
        metrics.record_replication("r".into());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_produced, 3);
        assert_eq!(snapshot.messages_consumed, 3);
        assert_eq!(snapshot.replications, 1);
        assert!(snapshot.last_replication.is_some());
        assert_eq!(metrics.topic_messages("t"), 2);
        assert_eq!(metrics.topic_messages("u"), 1);
        assert_eq!(metrics.topic_messages("missing"), 0);
        // The empty consume left no trace in the ring.
        assert!(!snapshot
            .recent_activity
            .iter()
            .any(|event| event.message == "empty"));
    }
}
