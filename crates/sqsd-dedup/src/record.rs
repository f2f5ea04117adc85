//! Dedup record layout.
//!
//! Records are keyed by `(partition, range key)`. The partition spreads ids
//! over a fixed number of hash keys; the range key ties the id to its source
//! queue so two queues sharing a table never collide.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Number of hash partitions ids are spread over.
pub const PARTITION_COUNT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub partition: u32,
    pub range_key: String,
}

impl DedupKey {
    pub fn new(message_id: &str, queue_url: &str) -> Self {
        Self {
            partition: crc32fast::hash(message_id.as_bytes()) % PARTITION_COUNT,
            range_key: format!("{}-{}", message_id, queue_url),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStatus {
    Processing,
    Processed,
}

impl DedupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupStatus::Processing => "processing",
            DedupStatus::Processed => "processed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "processing" => Some(DedupStatus::Processing),
            "processed" => Some(DedupStatus::Processed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupRecord {
    pub key: DedupKey,
    pub status: DedupStatus,
    /// Event time in fractional epoch seconds.
    pub time: f64,
    /// Expiry in epoch seconds, honoured by the store's TTL sweeper.
    pub ttl: i64,
}

impl DedupRecord {
    pub fn new(key: DedupKey, status: DedupStatus, now: DateTime<Utc>, retention: Duration) -> Self {
        Self {
            key,
            status,
            time: epoch_secs(now),
            ttl: now.timestamp() + retention.as_secs() as i64,
        }
    }

    /// Seconds since the record's event time. Negative under clock skew.
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        epoch_secs(now) - self.time
    }
}

fn epoch_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}
