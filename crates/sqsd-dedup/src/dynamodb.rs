//! DynamoDB dedup backend.
//!
//! Table layout: hash key `partition` (N), range key `id` (S), plus `status`
//! (S), `time` (N) and `ttl` (N). Enable TTL on `ttl` for orphaned records to
//! expire on their own.

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;
use tracing::info;

use crate::{DedupBackend, DedupKey, DedupRecord, DedupStatus, Result, StoreError};

const ATTR_PARTITION: &str = "partition";
const ATTR_ID: &str = "id";
const ATTR_STATUS: &str = "status";
const ATTR_TIME: &str = "time";
const ATTR_TTL: &str = "ttl";

pub struct DynamoDbDedupBackend {
    client: Client,
    table_name: String,
}

impl DynamoDbDedupBackend {
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Fail startup when the table is missing.
    pub async fn ensure_table_exists(&self) -> Result<()> {
        match self
            .client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
        {
            Ok(_) => {
                info!(table = %self.table_name, "Dedup table found");
                Ok(())
            }
            Err(e) if e.code() == Some("ResourceNotFoundException") => {
                Err(StoreError::TableMissing(self.table_name.clone()))
            }
            Err(e) => Err(classify(e)),
        }
    }

    fn key_attributes(key: &DedupKey) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (ATTR_PARTITION.to_string(), AttributeValue::N(key.partition.to_string())),
            (ATTR_ID.to_string(), AttributeValue::S(key.range_key.clone())),
        ])
    }

    fn item(record: &DedupRecord) -> HashMap<String, AttributeValue> {
        let mut item = Self::key_attributes(&record.key);
        item.insert(ATTR_STATUS.to_string(), AttributeValue::S(record.status.as_str().to_string()));
        item.insert(ATTR_TIME.to_string(), AttributeValue::N(record.time.to_string()));
        item.insert(ATTR_TTL.to_string(), AttributeValue::N(record.ttl.to_string()));
        item
    }

    fn item_to_record(key: &DedupKey, item: &HashMap<String, AttributeValue>) -> Result<DedupRecord> {
        let status = item
            .get(ATTR_STATUS)
            .and_then(|v| v.as_s().ok())
            .and_then(|s| DedupStatus::parse(s))
            .ok_or_else(|| StoreError::Malformed(format!("{} has no valid status", key.range_key)))?;
        let time = item
            .get(ATTR_TIME)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<f64>().ok())
            .ok_or_else(|| StoreError::Malformed(format!("{} has no valid time", key.range_key)))?;
        let ttl = item
            .get(ATTR_TTL)
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<f64>().ok())
            .map(|n| n as i64)
            .unwrap_or_default();

        Ok(DedupRecord {
            key: key.clone(),
            status,
            time,
            ttl,
        })
    }

    fn is_put_conditional_check_failed(err: &SdkError<PutItemError>) -> bool {
        match err {
            SdkError::ServiceError(service_err) => {
                matches!(service_err.err(), PutItemError::ConditionalCheckFailedException(_))
            }
            _ => false,
        }
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err.code() {
        Some("ProvisionedThroughputExceededException")
        | Some("ThrottlingException")
        | Some("RequestLimitExceeded") => StoreError::Throttled(DisplayErrorContext(&err).to_string()),
        _ => match err {
            SdkError::TimeoutError(_) => StoreError::Timeout(std::time::Duration::ZERO),
            other => StoreError::Backend(DisplayErrorContext(&other).to_string()),
        },
    }
}

#[async_trait]
impl DedupBackend for DynamoDbDedupBackend {
    async fn create(&self, record: &DedupRecord) -> Result<()> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::item(record)))
            .condition_expression("attribute_not_exists(#id)")
            .expression_attribute_names("#id", ATTR_ID)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if Self::is_put_conditional_check_failed(&e) => Err(StoreError::AlreadyExists),
            Err(e) => Err(classify(e)),
        }
    }

    async fn get(&self, key: &DedupKey) -> Result<Option<DedupRecord>> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(Self::key_attributes(key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(classify)?;

        response
            .item()
            .map(|item| Self::item_to_record(key, item))
            .transpose()
    }

    async fn put(&self, record: &DedupRecord) -> Result<()> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::item(record)))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, key: &DedupKey) -> Result<()> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(Self::key_attributes(key)))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}
