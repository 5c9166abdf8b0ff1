// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable partition logs.
//!
//! Each (topic, partition) pair owns one append-only file of self-delimited
//! JSON records, one per line. Offsets are 1-based line numbers: there is no
//! index file, so reopening a log recovers the append position by counting
//! lines. Visibility is not this crate's concern — the broker tracks the
//! committed frontier elsewhere and passes it to [`PartitionLog::scan`].

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

/// An error arising from partition log I/O.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("record encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// One stored record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The producer-supplied unique message ID.
    pub msg_id: String,
    /// The topic the record was published to.
    pub topic: String,
    /// The partition the broker assigned from the record's key.
    pub partition: u32,
    /// The partitioning key, if the producer supplied one.
    pub key: Option<String>,
    /// The opaque producer payload.
    pub payload: serde_json::Value,
    /// Broker wall-clock time at append, in milliseconds since the epoch.
    pub timestamp: u64,
}

/// Returns the log file name for a partition.
///
/// The broker ID is part of the name so that a leader and a follower sharing
/// a data directory (as tests do) keep their copies of a partition in
/// distinct files.
pub fn log_file_name(broker_id: &str, topic: &str, partition: u32) -> String {
    format!("{}_{}_p{}.log", broker_id, topic, partition)
}

/// The append-only log for one partition.
///
/// Appends are serialized by an internal lock and synced to disk before they
/// report success. Scans open a fresh read handle and so may run concurrently
/// with appends; a scan simply observes however many complete lines exist at
/// the time it reads.
#[derive(Debug)]
pub struct PartitionLog {
    path: PathBuf,
    appender: Mutex<Appender>,
}

#[derive(Debug)]
struct Appender {
    /// Number of lines in the file, committed or not. The next append takes
    /// position `len + 1`.
    len: u64,
}

impl PartitionLog {
    /// Opens the log at `path`, counting any existing lines to recover the
    /// append position. A missing file is an empty log; it is created on the
    /// first append.
    pub async fn open(path: impl Into<PathBuf>) -> Result<PartitionLog, StorageError> {
        let path = path.into();
        let len = match File::open(&path).await {
            Ok(file) => {
                let mut lines = BufReader::new(file).lines();
                let mut len = 0;
                while lines.next_line().await?.is_some() {
                    len += 1;
                }
                len
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(PartitionLog {
            path,
            appender: Mutex::new(Appender { len }),
        })
    }

    /// The file this log appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records appended so far, committed or not.
    pub async fn len(&self) -> u64 {
        self.appender.lock().await.len
    }

    /// Appends one record, returning its 1-based position in the log.
    ///
    /// The record is written as JSON plus trailing newline in a single write
    /// and synced before this returns, so a crash cannot leave a torn line
    /// at a position this method has reported.
    pub async fn append(&self, record: &Record) -> Result<u64, StorageError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut appender = self.appender.lock().await;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        appender.len += 1;
        Ok(appender.len)
    }

    /// Reads records with offsets strictly greater than `from_exclusive` and
    /// no greater than `hwm`, in offset order.
    ///
    /// A line that fails to parse is skipped with a warning but still counts
    /// toward the offsets of its successors: offsets are line numbers, and
    /// every reader must assign a record the same offset no matter how many
    /// corrupt lines precede it.
    pub async fn scan(
        &self,
        from_exclusive: u64,
        hwm: u64,
    ) -> Result<Vec<(u64, Record)>, StorageError> {
        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = BufReader::new(file).lines();
        let mut out = Vec::new();
        let mut offset = 0;
        while let Some(line) = lines.next_line().await? {
            offset += 1;
            if offset > hwm {
                break;
            }
            if offset <= from_exclusive {
                continue;
            }
            match serde_json::from_str::<Record>(&line) {
                Ok(record) => out.push((offset, record)),
                Err(e) => warn!(
                    "skipping corrupt line at offset {} in {}: {}",
                    offset,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(out)
    }
}
