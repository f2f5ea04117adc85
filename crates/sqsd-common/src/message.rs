//! Received-message model.
//!
//! Messages are immutable once received. Attribute values are resolved into a
//! tagged [`AttributeValue`] at ingestion so that dispatch never has to probe
//! the queue's declared data type strings again.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use std::borrow::Cow;
use std::time::Duration;

/// Prefix shared by every attribute the daemon reserves for itself.
pub const RESERVED_ATTRIBUTE_PREFIX: &str = "beanstalk.sqsd.";

/// Overrides the HTTP path a message is posted to.
pub const PATH_ATTRIBUTE: &str = "beanstalk.sqsd.path";

/// Name of the scheduled task carried by a trigger message.
pub const TASK_NAME_ATTRIBUTE: &str = "beanstalk.sqsd.task_name";

/// Time a trigger message was scheduled for. Its presence marks a trigger.
pub const SCHEDULED_TIME_ATTRIBUTE: &str = "beanstalk.sqsd.scheduled_time";

/// A message attribute value, classified once by its declared data type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    String(String),
    Number(String),
    /// Binary or otherwise unknown data types. Never forwarded.
    Unsupported { data_type: String },
}

impl AttributeValue {
    /// Classify a raw attribute by its declared data type.
    ///
    /// Custom type suffixes (`String.json`, `Number.float`) keep their base
    /// classification.
    pub fn from_parts(data_type: &str, string_value: Option<String>) -> Self {
        match string_value {
            Some(value) if data_type.starts_with("String") => AttributeValue::String(value),
            Some(value) if data_type.starts_with("Number") => AttributeValue::Number(value),
            _ => AttributeValue::Unsupported {
                data_type: data_type.to_string(),
            },
        }
    }

    /// The textual value, if this attribute can be forwarded as a header.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::String(v) | AttributeValue::Number(v) => Some(v.as_str()),
            AttributeValue::Unsupported { .. } => None,
        }
    }

    pub fn data_type(&self) -> &str {
        match self {
            AttributeValue::String(_) => "String",
            AttributeValue::Number(_) => "Number",
            AttributeValue::Unsupported { data_type } => data_type,
        }
    }
}

/// Scheduling metadata carried by a trigger message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTrigger {
    pub task_name: Option<String>,
    /// Scheduled time, normalized to ISO-8601 UTC when parseable.
    pub scheduled_at: String,
}

/// A message pulled from the queue.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: IndexMap<String, AttributeValue>,
    pub receive_count: u32,
    pub first_received_at: DateTime<Utc>,
    pub sent_at: DateTime<Utc>,
    pub sender_id: String,
    /// Full URL of the source queue.
    pub queue_url: String,
}

impl ReceivedMessage {
    /// The queue name, i.e. the last path segment of the queue URL.
    pub fn queue_name(&self) -> &str {
        self.queue_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(self.queue_url.as_str())
    }

    /// Path override set through the reserved path attribute.
    pub fn path_override(&self) -> Option<&str> {
        self.attributes.get(PATH_ATTRIBUTE).and_then(|v| v.as_text())
    }

    /// Returns the trigger metadata if this is a scheduled-job trigger.
    pub fn trigger(&self) -> Option<ScheduledTrigger> {
        let raw = self
            .attributes
            .get(SCHEDULED_TIME_ATTRIBUTE)
            .and_then(|v| v.as_text())?;

        let scheduled_at = parse_timestamp(raw)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| raw.to_string());

        Some(ScheduledTrigger {
            task_name: self
                .attributes
                .get(TASK_NAME_ATTRIBUTE)
                .and_then(|v| v.as_text())
                .map(str::to_string),
            scheduled_at,
        })
    }

    /// Attributes eligible for forwarding: everything outside the reserved
    /// `beanstalk.sqsd.` namespace, in receive order.
    pub fn forwardable_attributes(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.attributes
            .iter()
            .filter(|(name, _)| !name.starts_with(RESERVED_ATTRIBUTE_PREFIX))
    }

    /// Body to forward. With `via_sns`, an SNS notification envelope is
    /// unwrapped to its inner `Message`; any other body is forwarded as is.
    pub fn payload(&self, via_sns: bool) -> Cow<'_, str> {
        if via_sns {
            if let Some(inner) = sns_message(&self.body) {
                return Cow::Owned(inner);
            }
        }
        Cow::Borrowed(&self.body)
    }

    /// Whether the message has outlived the retention window.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match chrono::Duration::from_std(retention) {
            Ok(retention) => now > self.first_received_at + retention,
            Err(_) => false,
        }
    }

    /// Seconds since the queue first handed this message out.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.first_received_at).num_seconds()
    }
}

fn sns_message(body: &str) -> Option<String> {
    if !body.trim_start().starts_with('{') {
        return None;
    }
    let envelope: serde_json::Value = serde_json::from_str(body).ok()?;
    if envelope.get("Type")?.as_str()? != "Notification" {
        return None;
    }
    envelope.get("Message")?.as_str().map(str::to_string)
}

/// Parse the timestamp formats the scheduler may have written.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S %z") {
        return Some(t.with_timezone(&Utc));
    }
    let trimmed = raw.trim_end_matches(" UTC");
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}
