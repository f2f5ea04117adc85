//! Process-wide named counters.
//!
//! A single [`Counters`] instance is created at startup and shared through an
//! `Arc` with every component. Updates are lock-free and safe from any task.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

/// Every counter the daemon tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Messages handed out by the queue.
    MessagesReceived,
    /// Messages that reached a terminal outcome in this process.
    MessageCount,
    OkCount,
    ErrorCount,
    DupCount,
    ConcurrentSqsQueries,
    ConcurrentHttpRequests,
    /// Dedup claims currently talking to the store.
    ConcurrentDups,
}

const COUNTER_KINDS: usize = 8;

impl Counter {
    pub const ALL: [Counter; COUNTER_KINDS] = [
        Counter::MessagesReceived,
        Counter::MessageCount,
        Counter::OkCount,
        Counter::ErrorCount,
        Counter::DupCount,
        Counter::ConcurrentSqsQueries,
        Counter::ConcurrentHttpRequests,
        Counter::ConcurrentDups,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::MessagesReceived => "messages_received",
            Counter::MessageCount => "message_count",
            Counter::OkCount => "ok_count",
            Counter::ErrorCount => "error_count",
            Counter::DupCount => "dup_count",
            Counter::ConcurrentSqsQueries => "concurrent_sqs_queries",
            Counter::ConcurrentHttpRequests => "concurrent_http_requests",
            Counter::ConcurrentDups => "concurrent_dups",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    values: [AtomicI64; COUNTER_KINDS],
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increase(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn increase_by(&self, counter: Counter, count: i64) {
        self.add(counter, count);
    }

    pub fn decrease(&self, counter: Counter) {
        self.add(counter, -1);
    }

    pub fn get(&self, counter: Counter) -> i64 {
        self.values[counter.index()].load(Ordering::SeqCst)
    }

    /// Messages received but not yet completed.
    pub fn outstanding(&self) -> i64 {
        self.get(Counter::MessagesReceived) - self.get(Counter::MessageCount)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            messages_received: self.get(Counter::MessagesReceived),
            message_count: self.get(Counter::MessageCount),
            ok_count: self.get(Counter::OkCount),
            error_count: self.get(Counter::ErrorCount),
            dup_count: self.get(Counter::DupCount),
            concurrent_sqs_queries: self.get(Counter::ConcurrentSqsQueries),
            concurrent_http_requests: self.get(Counter::ConcurrentHttpRequests),
            concurrent_dups: self.get(Counter::ConcurrentDups),
        }
    }

    fn add(&self, counter: Counter, delta: i64) {
        self.values[counter.index()].fetch_add(delta, Ordering::SeqCst);
    }
}

/// Point-in-time copy of all counters, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub messages_received: i64,
    pub message_count: i64,
    pub ok_count: i64,
    pub error_count: i64,
    pub dup_count: i64,
    pub concurrent_sqs_queries: i64,
    pub concurrent_http_requests: i64,
    pub concurrent_dups: i64,
}
