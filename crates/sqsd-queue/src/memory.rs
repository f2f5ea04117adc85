//! In-memory queue with visibility-timeout semantics.
//!
//! Used by tests and local runs. Receipt handles change on every receive, so
//! a stale handle cannot delete a message that was redelivered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use sqsd_common::{AttributeValue, ReceivedMessage};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    BatchDeleteOutcome, FailedDelete, OutgoingMessage, QueueClient, QueueError, ReceiveRequest,
    Result,
};

const BATCH_LIMIT: usize = 10;

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    body: String,
    attributes: IndexMap<String, AttributeValue>,
    sent_at: DateTime<Utc>,
    first_received_at: Option<DateTime<Utc>>,
    receive_count: u32,
    receipt_handle: Option<String>,
    invisible_until: Option<Instant>,
}

impl Entry {
    fn visible(&self, now: Instant) -> bool {
        self.invisible_until.map_or(true, |until| now >= until)
    }
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    deleted: Vec<String>,
    visibility_changes: Vec<(String, u32)>,
    rejected_handles: HashSet<String>,
    receive_calls: usize,
    fail_receives: bool,
}

pub struct MemoryQueue {
    queue_url: String,
    state: Mutex<State>,
    arrivals: Notify,
}

impl MemoryQueue {
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            state: Mutex::new(State::default()),
            arrivals: Notify::new(),
        }
    }

    /// Enqueue a message and return its id.
    pub fn push(&self, body: impl Into<String>, attributes: IndexMap<String, AttributeValue>) -> String {
        self.push_at(body, attributes, Utc::now())
    }

    /// Enqueue a message that was first received at `first_received_at`.
    /// Lets tests fabricate messages older than the retention window.
    pub fn push_aged(&self, body: impl Into<String>, first_received_at: DateTime<Utc>) -> String {
        let id = self.push_at(body, IndexMap::new(), first_received_at);
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
            entry.first_received_at = Some(first_received_at);
        }
        id
    }

    fn push_at(
        &self,
        body: impl Into<String>,
        attributes: IndexMap<String, AttributeValue>,
        sent_at: DateTime<Utc>,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.state.lock().entries.push(Entry {
            id: id.clone(),
            body: body.into(),
            attributes,
            sent_at,
            first_received_at: None,
            receive_count: 0,
            receipt_handle: None,
            invisible_until: None,
        });
        self.arrivals.notify_waiters();
        id
    }

    /// Messages not yet deleted, visible or not.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of deleted messages, in deletion order.
    pub fn deleted_ids(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    /// `(message id, seconds)` for every visibility change.
    pub fn visibility_changes(&self) -> Vec<(String, u32)> {
        self.state.lock().visibility_changes.clone()
    }

    pub fn receive_calls(&self) -> usize {
        self.state.lock().receive_calls
    }

    /// Make receive calls fail until reset.
    pub fn set_fail_receives(&self, fail: bool) {
        self.state.lock().fail_receives = fail;
    }

    /// Reject batch deletes of this handle.
    pub fn reject_deletes_of(&self, receipt_handle: impl Into<String>) {
        self.state.lock().rejected_handles.insert(receipt_handle.into());
    }

    fn take_visible(&self, request: &ReceiveRequest) -> Result<Vec<ReceivedMessage>> {
        let mut state = self.state.lock();
        if state.fail_receives {
            return Err(QueueError::Sqs("receive failure injected".into()));
        }

        let now = Instant::now();
        let wall_now = Utc::now();
        let limit = request.max_messages.clamp(1, BATCH_LIMIT);
        let visibility = Duration::from_secs(request.visibility_timeout);
        let mut received = Vec::new();

        for entry in state.entries.iter_mut().filter(|e| e.visible(now)).take(limit) {
            let handle = uuid::Uuid::new_v4().to_string();
            entry.receive_count += 1;
            entry.receipt_handle = Some(handle.clone());
            entry.invisible_until = Some(now + visibility);
            let first_received_at = *entry.first_received_at.get_or_insert(wall_now);

            received.push(ReceivedMessage {
                id: entry.id.clone(),
                receipt_handle: handle,
                body: entry.body.clone(),
                attributes: entry.attributes.clone(),
                receive_count: entry.receive_count,
                first_received_at,
                sent_at: entry.sent_at,
                sender_id: "memory".to_string(),
                queue_url: self.queue_url.clone(),
            });
        }
        Ok(received)
    }

    fn remove_by_handle(state: &mut State, receipt_handle: &str) {
        if let Some(pos) = state
            .entries
            .iter()
            .position(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
        {
            let entry = state.entries.remove(pos);
            state.deleted.push(entry.id);
        }
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    fn queue_url(&self) -> &str {
        &self.queue_url
    }

    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>> {
        self.state.lock().receive_calls += 1;

        // Register interest before looking so an arrival in between is not missed.
        let arrival = self.arrivals.notified();
        tokio::pin!(arrival);
        arrival.as_mut().enable();

        let messages = self.take_visible(&request)?;
        if !messages.is_empty() || request.wait_time_seconds == 0 {
            return Ok(messages);
        }

        // Long poll: wait for an arrival, then look once more.
        let wait = Duration::from_secs(request.wait_time_seconds as u64);
        let _ = tokio::time::timeout(wait, arrival).await;
        self.take_visible(&request)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::remove_by_handle(&mut state, receipt_handle);
        debug!(receipt_handle, "Deleted message from memory queue");
        Ok(())
    }

    async fn delete_batch(&self, receipt_handles: &[String]) -> Result<BatchDeleteOutcome> {
        if receipt_handles.len() > BATCH_LIMIT {
            return Err(QueueError::Sqs(format!(
                "batch of {} exceeds the limit of {}",
                receipt_handles.len(),
                BATCH_LIMIT
            )));
        }

        let mut state = self.state.lock();
        let mut outcome = BatchDeleteOutcome::default();
        for handle in receipt_handles {
            if state.rejected_handles.contains(handle) {
                outcome.failed.push(FailedDelete {
                    receipt_handle: handle.clone(),
                    code: "ReceiptHandleIsInvalid".to_string(),
                    message: None,
                });
                continue;
            }
            Self::remove_by_handle(&mut state, handle);
            outcome.deleted += 1;
        }
        Ok(outcome)
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::InvalidReceiptHandle(receipt_handle.to_string()))?;
        entry.invisible_until = Some(Instant::now() + Duration::from_secs(seconds as u64));
        let id = entry.id.clone();
        state.visibility_changes.push((id, seconds));
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<String> {
        Ok(self.push(message.body, message.attributes))
    }
}
