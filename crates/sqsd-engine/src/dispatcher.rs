//! Per-message dispatch pipeline.
//!
//! A message moves through expiry check, dedup claim and HTTP delivery, and
//! ends either acknowledged or left for the queue to redeliver. Each stage is
//! a variant of [`Stage`]; `dispatch` loops over transitions until a terminal
//! stage is reached.

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use sqsd_common::{Counter, Counters, ReceivedMessage};
use sqsd_config::SqsdConfig;
use sqsd_dedup::{Claim, DedupStore, SkipReason};
use sqsd_queue::QueueClient;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::ack::AckBuffer;
use crate::http::{HttpConnection, HttpError};
use crate::latency::LatencyWindow;
use crate::pool::ConnectionPool;
use crate::workers::WorkerPool;

const ATTRIBUTE_HEADER_PREFIX: &str = "x-aws-sqsd-attr-";

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Scheme, host and port of the application.
    pub base_url: String,
    pub default_path: String,
    pub mime_type: String,
    pub via_sns: bool,
    pub retention: Duration,
    /// Visibility applied to a message whose dispatch failed.
    pub error_visibility_timeout: Option<u32>,
}

impl DispatchSettings {
    pub fn from_config(config: &SqsdConfig) -> Self {
        Self {
            base_url: config.http_base_url(),
            default_path: config.http_path.clone(),
            mime_type: config.mime_type.clone(),
            via_sns: config.via_sns,
            retention: config.retention(),
            error_visibility_timeout: config.error_visibility_timeout,
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The application answered with something other than 200.
    Status(u16),
    /// No response: connection, timeout or protocol error.
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Expired,
    Skipped(SkipReason),
    Succeeded { latency: Duration },
    Failed(FailureKind),
}

#[derive(Debug)]
enum Stage {
    ExpiredCheck,
    DedupCheck,
    Dispatching { attempt: u32 },
    Completed { latency: Duration },
    Failed(FailureKind),
}

/// An attribute that could not be forwarded as a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedAttribute {
    pub name: String,
    pub reason: &'static str,
}

pub struct MessageDispatcher {
    settings: DispatchSettings,
    pool: Arc<ConnectionPool<HttpConnection>>,
    dedup: Option<Arc<DedupStore>>,
    acks: AckBuffer,
    queue: Arc<dyn QueueClient>,
    counters: Arc<Counters>,
    latency: Arc<LatencyWindow>,
    workers: WorkerPool,
}

impl MessageDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: DispatchSettings,
        pool: Arc<ConnectionPool<HttpConnection>>,
        dedup: Option<Arc<DedupStore>>,
        acks: AckBuffer,
        queue: Arc<dyn QueueClient>,
        counters: Arc<Counters>,
        latency: Arc<LatencyWindow>,
        workers: WorkerPool,
    ) -> Self {
        Self {
            settings,
            pool,
            dedup,
            acks,
            queue,
            counters,
            latency,
            workers,
        }
    }

    /// Drive one received message to a terminal outcome.
    pub async fn dispatch(&self, message: ReceivedMessage) -> DispatchOutcome {
        let seen_at = Instant::now();
        let mut stage = Stage::ExpiredCheck;

        loop {
            stage = match stage {
                Stage::ExpiredCheck => {
                    if message.is_expired(Utc::now(), self.settings.retention) {
                        self.expire(&message);
                        return DispatchOutcome::Expired;
                    }
                    Stage::DedupCheck
                }
                Stage::DedupCheck => match &self.dedup {
                    None => Stage::Dispatching { attempt: 1 },
                    Some(store) => match self.workers.run(store.claim(&message, seen_at)).await {
                        Claim::Proceed => Stage::Dispatching { attempt: 1 },
                        Claim::Skip(reason) => {
                            self.counters.increase(Counter::MessageCount);
                            return DispatchOutcome::Skipped(reason);
                        }
                    },
                },
                Stage::Dispatching { attempt } => match self.send(&message).await {
                    Ok((200, latency)) => Stage::Completed { latency },
                    Ok((status, _)) => Stage::Failed(FailureKind::Status(status)),
                    Err(HttpError::ConnectionClosed(reason)) if attempt == 1 => {
                        info!(
                            category = "conn-closed",
                            message_id = %message.id,
                            elapsed_ms = elapsed_ms(seen_at),
                            reason = %reason,
                            "Connection closed by the application, retrying"
                        );
                        Stage::Dispatching { attempt: attempt + 1 }
                    }
                    Err(e) => Stage::Failed(FailureKind::Transport(e.to_string())),
                },
                Stage::Completed { latency } => {
                    self.complete(&message, latency, seen_at).await;
                    return DispatchOutcome::Succeeded { latency };
                }
                Stage::Failed(kind) => {
                    self.fail(&message, &kind, seen_at).await;
                    return DispatchOutcome::Failed(kind);
                }
            };
        }
    }

    fn expire(&self, message: &ReceivedMessage) {
        warn!(
            category = "expired-msg",
            message_id = %message.id,
            age_secs = message.age_secs(Utc::now()),
            "Message exceeded the retention period, deleting without dispatch"
        );
        self.acks.enqueue(message.receipt_handle.clone());
        self.counters.increase(Counter::MessageCount);
    }

    /// POST `message` to the application. The latency covers the request
    /// alone, not the wait for a pooled connection.
    async fn send(&self, message: &ReceivedMessage) -> Result<(u16, Duration), HttpError> {
        let path = message
            .path_override()
            .unwrap_or(self.settings.default_path.as_str());
        let url = self.settings.url_for(path);

        let (headers, skipped) = build_headers(message, &self.settings, path);
        for attribute in skipped {
            warn!(
                category = "attribute-skipped",
                message_id = %message.id,
                attribute = %attribute.name,
                reason = attribute.reason,
                "Message attribute not forwarded"
            );
        }

        let body = if message.trigger().is_some() {
            String::new()
        } else {
            message.payload(self.settings.via_sns).into_owned()
        };

        debug!(message_id = %message.id, url = %url, "Dispatching message");
        self.counters.increase(Counter::ConcurrentHttpRequests);
        let result = self
            .pool
            .perform(|connection| async move {
                let sent_at = Instant::now();
                let result = connection
                    .post(&url, headers, body)
                    .await
                    .map(|status| (status, sent_at.elapsed()));
                (connection, result)
            })
            .await;
        self.counters.decrease(Counter::ConcurrentHttpRequests);
        result
    }

    async fn complete(&self, message: &ReceivedMessage, latency: Duration, seen_at: Instant) {
        self.counters.increase(Counter::OkCount);
        if let Some(store) = &self.dedup {
            self.workers.run(store.mark_processed(message)).await;
        }
        self.acks.enqueue(message.receipt_handle.clone());
        self.latency.record(latency);
        // Drain counts the message as finished from here on.
        self.counters.increase(Counter::MessageCount);
        debug!(
            message_id = %message.id,
            latency_ms = latency.as_millis() as u64,
            elapsed_ms = elapsed_ms(seen_at),
            "Message processed"
        );
    }

    async fn fail(&self, message: &ReceivedMessage, kind: &FailureKind, seen_at: Instant) {
        self.counters.increase(Counter::ErrorCount);
        let elapsed_ms = elapsed_ms(seen_at);
        let age_secs = message.age_secs(Utc::now());

        match kind {
            FailureKind::Status(status) => warn!(
                category = "http-err",
                message_id = %message.id,
                status,
                elapsed_ms,
                age_secs,
                "Application returned a non-200 status"
            ),
            FailureKind::Transport(reason) => warn!(
                category = "socket-err",
                message_id = %message.id,
                elapsed_ms,
                age_secs,
                error = %reason,
                "Dispatch failed"
            ),
        }

        if let Some(seconds) = self.settings.error_visibility_timeout {
            let changed = self
                .workers
                .run(self.queue.change_visibility(&message.receipt_handle, seconds))
                .await;
            if let Err(e) = changed {
                warn!(
                    category = "visibility-err",
                    message_id = %message.id,
                    error = %e,
                    "Could not shorten visibility of failed message"
                );
            }
        }

        if let Some(store) = &self.dedup {
            self.workers.run(store.mark_failed(message)).await;
        }
        self.counters.increase(Counter::MessageCount);
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

fn iso8601(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Build the outbound headers for `message`.
///
/// Attributes are forwarded as `X-aws-sqsd-attr-<name>`. An attribute whose
/// header already exists, whose type is unsupported or which is not a valid
/// header is returned as skipped instead.
pub fn build_headers(
    message: &ReceivedMessage,
    settings: &DispatchSettings,
    path: &str,
) -> (HeaderMap, Vec<SkippedAttribute>) {
    let mut headers = HeaderMap::new();
    let mut fixed = |name: &str, value: &str| {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    };

    fixed(CONTENT_TYPE.as_str(), &settings.mime_type);
    fixed(USER_AGENT.as_str(), &sqsd_common::user_agent());
    fixed("x-aws-sqsd-msgid", &message.id);
    fixed("x-aws-sqsd-receive-count", &message.receive_count.to_string());
    fixed("x-aws-sqsd-first-received-at", &iso8601(message.first_received_at));
    fixed("x-aws-sqsd-sent-at", &iso8601(message.sent_at));
    fixed("x-aws-sqsd-queue", message.queue_name());
    fixed("x-aws-sqsd-path", path);
    fixed("x-aws-sqsd-sender-id", &message.sender_id);

    if let Some(trigger) = message.trigger() {
        fixed("x-aws-sqsd-scheduled-at", &trigger.scheduled_at);
        if let Some(task_name) = &trigger.task_name {
            fixed("x-aws-sqsd-taskname", task_name);
        }
    }

    let mut skipped = Vec::new();
    for (name, value) in message.forwardable_attributes() {
        let skip = |reason| SkippedAttribute {
            name: name.clone(),
            reason,
        };
        let Some(text) = value.as_text() else {
            skipped.push(skip("unsupported type"));
            continue;
        };
        let header = format!("{}{}", ATTRIBUTE_HEADER_PREFIX, name.to_ascii_lowercase());
        let Ok(header_name) = HeaderName::from_bytes(header.as_bytes()) else {
            skipped.push(skip("invalid header name"));
            continue;
        };
        if headers.contains_key(&header_name) {
            skipped.push(skip("header name collision"));
            continue;
        }
        let Ok(header_value) = HeaderValue::from_str(text) else {
            skipped.push(skip("invalid header value"));
            continue;
        };
        headers.insert(header_name, header_value);
    }

    (headers, skipped)
}
