use async_trait::async_trait;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{
    DeleteMessageBatchRequestEntry, Message as SqsMessage, MessageAttributeValue,
    MessageSystemAttributeName,
};
use aws_sdk_sqs::Client;
use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use sqsd_common::{AttributeValue, ReceivedMessage};
use tracing::{debug, error, warn};

use crate::{
    BatchDeleteOutcome, FailedDelete, OutgoingMessage, QueueClient, QueueError, ReceiveRequest,
    Result,
};

/// SQS per-call ceiling for receive and batch delete.
const SQS_BATCH_LIMIT: usize = 10;

/// AWS SQS queue client
pub struct SqsQueueClient {
    client: Client,
    queue_url: String,
    queue_name: String,
}

impl SqsQueueClient {
    pub fn new(client: Client, queue_url: String) -> Self {
        let queue_name = queue_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("unknown")
            .to_string();

        Self {
            client,
            queue_url,
            queue_name,
        }
    }

    fn parse_message(&self, sqs_msg: SqsMessage) -> Result<ReceivedMessage> {
        let id = sqs_msg
            .message_id()
            .ok_or_else(|| QueueError::Malformed("missing message id".to_string()))?
            .to_string();
        let receipt_handle = sqs_msg
            .receipt_handle()
            .ok_or_else(|| QueueError::Malformed(format!("{} has no receipt handle", id)))?
            .to_string();

        let system = sqs_msg.attributes();
        let system_attr = |name: MessageSystemAttributeName| {
            system.and_then(|attrs| attrs.get(&name)).map(String::as_str)
        };

        let receive_count = system_attr(MessageSystemAttributeName::ApproximateReceiveCount)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let first_received_at =
            epoch_millis(system_attr(MessageSystemAttributeName::ApproximateFirstReceiveTimestamp));
        let sent_at = epoch_millis(system_attr(MessageSystemAttributeName::SentTimestamp));
        let sender_id = system_attr(MessageSystemAttributeName::SenderId)
            .unwrap_or_default()
            .to_string();

        // The SDK hands attributes back as a hash map; sort for a stable header order.
        let mut names: Vec<&String> = sqs_msg
            .message_attributes()
            .map(|attrs| attrs.keys().collect())
            .unwrap_or_default();
        names.sort();
        let mut attributes = IndexMap::with_capacity(names.len());
        if let Some(raw) = sqs_msg.message_attributes() {
            for name in names {
                if let Some(value) = raw.get(name) {
                    attributes.insert(
                        name.clone(),
                        AttributeValue::from_parts(
                            value.data_type(),
                            value.string_value().map(str::to_string),
                        ),
                    );
                }
            }
        }

        Ok(ReceivedMessage {
            id,
            receipt_handle,
            body: sqs_msg.body().unwrap_or_default().to_string(),
            attributes,
            receive_count,
            first_received_at,
            sent_at,
            sender_id,
            queue_url: self.queue_url.clone(),
        })
    }
}

fn epoch_millis(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|v| v.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

fn sqs_error<E: std::error::Error>(e: E) -> QueueError {
    QueueError::Sqs(DisplayErrorContext(e).to_string())
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    fn queue_url(&self) -> &str {
        &self.queue_url
    }

    async fn receive(&self, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(request.max_messages.clamp(1, SQS_BATCH_LIMIT) as i32)
            .visibility_timeout(request.visibility_timeout.min(i32::MAX as u64) as i32)
            .wait_time_seconds(request.wait_time_seconds.min(20) as i32)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(sqs_error)?;

        let sqs_messages = result.messages.unwrap_or_default();
        let mut messages = Vec::with_capacity(sqs_messages.len());
        for sqs_msg in sqs_messages {
            match self.parse_message(sqs_msg) {
                Ok(message) => messages.push(message),
                Err(e) => error!(queue = %self.queue_name, error = %e, "Skipping malformed SQS message"),
            }
        }

        if !messages.is_empty() {
            debug!(queue = %self.queue_name, count = messages.len(), "Received messages from SQS");
        }
        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| {
                let is_invalid = e
                    .as_service_error()
                    .map(|se| se.is_receipt_handle_is_invalid())
                    .unwrap_or(false);
                if is_invalid {
                    QueueError::InvalidReceiptHandle(receipt_handle.to_string())
                } else {
                    sqs_error(e)
                }
            })?;

        debug!(queue = %self.queue_name, "Message deleted from SQS");
        Ok(())
    }

    async fn delete_batch(&self, receipt_handles: &[String]) -> Result<BatchDeleteOutcome> {
        if receipt_handles.is_empty() {
            return Ok(BatchDeleteOutcome::default());
        }
        if receipt_handles.len() > SQS_BATCH_LIMIT {
            return Err(QueueError::Sqs(format!(
                "batch of {} exceeds the limit of {}",
                receipt_handles.len(),
                SQS_BATCH_LIMIT
            )));
        }

        let mut entries = Vec::with_capacity(receipt_handles.len());
        for (index, handle) in receipt_handles.iter().enumerate() {
            let entry = DeleteMessageBatchRequestEntry::builder()
                .id(index.to_string())
                .receipt_handle(handle)
                .build()
                .map_err(|e| QueueError::Sqs(e.to_string()))?;
            entries.push(entry);
        }

        let result = self
            .client
            .delete_message_batch()
            .queue_url(&self.queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(sqs_error)?;

        let failed = result
            .failed()
            .iter()
            .map(|entry| {
                let receipt_handle = entry
                    .id()
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| receipt_handles.get(i))
                    .cloned()
                    .unwrap_or_else(|| entry.id().to_string());
                FailedDelete {
                    receipt_handle,
                    code: entry.code().to_string(),
                    message: entry.message().map(str::to_string),
                }
            })
            .collect::<Vec<_>>();

        if !failed.is_empty() {
            warn!(queue = %self.queue_name, failed = failed.len(), "Batch delete partially failed");
        }

        Ok(BatchDeleteOutcome {
            deleted: result.successful().len(),
            failed,
        })
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds.min(i32::MAX as u32) as i32)
            .send()
            .await
            .map_err(sqs_error)?;

        debug!(queue = %self.queue_name, seconds, "Visibility changed in SQS");
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<String> {
        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(message.body);

        for (name, value) in message.attributes {
            let Some(text) = value.as_text() else {
                continue;
            };
            let attribute = MessageAttributeValue::builder()
                .data_type(value.data_type())
                .string_value(text)
                .build()
                .map_err(|e| QueueError::Sqs(e.to_string()))?;
            request = request.message_attributes(name, attribute);
        }

        let result = request.send().await.map_err(sqs_error)?;
        Ok(result.message_id().unwrap_or_default().to_string())
    }
}
