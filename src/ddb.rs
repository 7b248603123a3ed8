// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of Dynamolock.
//
// Dynamolock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Dynamolock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Dynamolock. If not, see <https://www.gnu.org/licenses/>.

//! DynamoDB-backed lock store implementation.
//!
//! ## Purpose
//! Production backend for [`LockStore`]: conditional writes express the CAS
//! on the `(owner, version)` witness, strongly consistent reads back the
//! takeover protocol.
//!
//! ## Table Schema
//! ```text
//! Partition Key: name (String)
//! Attributes:
//!   - owner: String (current holder identity, "" when unowned)
//!   - version: Number (monotonic CAS witness)
//!   - duration_ms: Number (advertised lease length)
//!   - payload: Binary (optional, application-supplied)
//! ```
//!
//! ## Error Classification
//! `ConditionalCheckFailedException` is a protocol outcome, surfaced as
//! [`WriteOutcome::Conflict`]. Throttling and 5xx service codes, plus
//! dispatch/connection failures without a service code, are `Transient`;
//! everything else (validation, authorization, missing table) is `Fatal`.

use crate::error::StoreError;
use crate::store::{LockStore, RemoteLock, WriteOutcome};
use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, TableStatus,
};
use aws_sdk_dynamodb::Client as DynamoDbClient;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const KEY_ATTR: &str = "name";
const OWNER_ATTR: &str = "owner";
const VERSION_ATTR: &str = "version";
const DURATION_ATTR: &str = "duration_ms";
const PAYLOAD_ATTR: &str = "payload";

/// DynamoDB lock store.
///
/// ## Example
/// ```rust,no_run
/// use dynamolock::DynamoDbLockStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = DynamoDbLockStore::new(
///     "us-east-1".to_string(),
///     "dynamolock".to_string(),
///     Some("http://localhost:8000".to_string()), // For DynamoDB Local
/// )
/// .await?;
/// store.ensure_table().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DynamoDbLockStore {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoDbLockStore {
    /// Create a store from the ambient AWS configuration.
    ///
    /// ## Arguments
    /// * `region` - AWS region (e.g., "us-east-1")
    /// * `table_name` - DynamoDB table name
    /// * `endpoint_url` - Optional endpoint URL (for DynamoDB Local testing)
    #[instrument(skip(region, table_name, endpoint_url), fields(region = %region, table_name = %table_name))]
    pub async fn new(
        region: String,
        table_name: String,
        endpoint_url: Option<String>,
    ) -> Result<Self, StoreError> {
        let mut config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));
        if let Some(endpoint) = endpoint_url {
            config_builder = config_builder.endpoint_url(endpoint);
        }
        let config = config_builder.load().await;
        Ok(Self::from_client(DynamoDbClient::new(&config), table_name))
    }

    /// Create a store from an existing client (for credential injection).
    pub fn from_client(client: DynamoDbClient, table_name: String) -> Self {
        Self { client, table_name }
    }

    /// Create the lock table if it does not exist and wait until it is
    /// ACTIVE. Idempotent; intended for tests and first-run convenience.
    #[instrument(skip(self), fields(table_name = %self.table_name))]
    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        match self
            .client
            .describe_table()
            .table_name(&self.table_name)
            .send()
            .await
        {
            Ok(_) => {
                debug!(table_name = %self.table_name, "lock table already exists");
                return Ok(());
            }
            Err(e) => {
                if e.code() != Some("ResourceNotFoundException") {
                    return Err(classify(e, "describe_table"));
                }
            }
        }

        debug!(table_name = %self.table_name, "creating lock table");

        let key_schema = KeySchemaElement::builder()
            .attribute_name(KEY_ATTR)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| StoreError::Fatal(format!("failed to build key schema: {}", e)))?;
        let key_attr = AttributeDefinition::builder()
            .attribute_name(KEY_ATTR)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| {
                StoreError::Fatal(format!("failed to build attribute definition: {}", e))
            })?;

        let created = self
            .client
            .create_table()
            .table_name(&self.table_name)
            .billing_mode(BillingMode::PayPerRequest)
            .key_schema(key_schema)
            .attribute_definitions(key_attr)
            .send()
            .await;

        match created {
            Ok(_) => self.wait_for_table_active().await,
            Err(e) if e.code() == Some("ResourceInUseException") => {
                debug!(table_name = %self.table_name, "table created concurrently, waiting for active");
                self.wait_for_table_active().await
            }
            Err(e) => Err(classify(e, "create_table")),
        }
    }

    async fn wait_for_table_active(&self) -> Result<(), StoreError> {
        let max_attempts = 30;
        for _ in 0..max_attempts {
            let described = self
                .client
                .describe_table()
                .table_name(&self.table_name)
                .send()
                .await
                .map_err(|e| classify(e, "describe_table"))?;

            match described.table().and_then(|t| t.table_status()) {
                Some(TableStatus::Active) => {
                    debug!(table_name = %self.table_name, "lock table is active");
                    return Ok(());
                }
                Some(TableStatus::Creating) => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                status => {
                    return Err(StoreError::Fatal(format!(
                        "table in unexpected status: {:?}",
                        status
                    )));
                }
            }
        }
        Err(StoreError::Fatal(format!(
            "table not active after {} attempts",
            max_attempts
        )))
    }

    fn item_to_lock(item: &HashMap<String, AttributeValue>) -> Result<RemoteLock, StoreError> {
        let name = item
            .get(KEY_ATTR)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StoreError::Fatal("missing name attribute".to_string()))?
            .to_string();
        let owner = item
            .get(OWNER_ATTR)
            .and_then(|v| v.as_s().ok())
            .cloned()
            .unwrap_or_default();
        let version = item
            .get(VERSION_ATTR)
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| StoreError::Fatal("missing or invalid version".to_string()))?;
        let duration_ms = item
            .get(DURATION_ATTR)
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| StoreError::Fatal("missing or invalid duration_ms".to_string()))?;
        let payload = item
            .get(PAYLOAD_ATTR)
            .and_then(|v| v.as_b().ok())
            .map(|b| b.as_ref().to_vec());

        Ok(RemoteLock {
            name,
            owner,
            version,
            duration_ms,
            payload,
        })
    }

    fn lock_to_item(lock: &RemoteLock) -> HashMap<String, AttributeValue> {
        let mut item = HashMap::new();
        item.insert(KEY_ATTR.to_string(), AttributeValue::S(lock.name.clone()));
        item.insert(OWNER_ATTR.to_string(), AttributeValue::S(lock.owner.clone()));
        item.insert(
            VERSION_ATTR.to_string(),
            AttributeValue::N(lock.version.to_string()),
        );
        item.insert(
            DURATION_ATTR.to_string(),
            AttributeValue::N(lock.duration_ms.to_string()),
        );
        if let Some(payload) = &lock.payload {
            item.insert(
                PAYLOAD_ATTR.to_string(),
                AttributeValue::B(Blob::new(payload.clone())),
            );
        }
        item
    }
}

#[async_trait]
impl LockStore for DynamoDbLockStore {
    #[instrument(skip(self), fields(table_name = %self.table_name, name = %name))]
    async fn get(&self, name: &str) -> Result<Option<RemoteLock>, StoreError> {
        let start_time = std::time::Instant::now();
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(KEY_ATTR, AttributeValue::S(name.to_string()))
            // Eventually consistent reads break the takeover protocol.
            .consistent_read(true)
            .send()
            .await;

        metrics::histogram!("dynamolock_ddb_op_duration_seconds", "op" => "get_item")
            .record(start_time.elapsed().as_secs_f64());

        match result {
            Ok(out) => out.item().map(Self::item_to_lock).transpose(),
            Err(e) => {
                metrics::counter!("dynamolock_ddb_op_errors_total", "op" => "get_item")
                    .increment(1);
                Err(classify(e, "get_item"))
            }
        }
    }

    #[instrument(skip(self, item), fields(table_name = %self.table_name, name = %item.name, version = item.version))]
    async fn put_if_absent(&self, item: RemoteLock) -> Result<WriteOutcome, StoreError> {
        let start_time = std::time::Instant::now();
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::lock_to_item(&item)))
            .condition_expression("attribute_not_exists(#n)")
            .expression_attribute_names("#n", KEY_ATTR)
            .send()
            .await;

        metrics::histogram!("dynamolock_ddb_op_duration_seconds", "op" => "put_if_absent")
            .record(start_time.elapsed().as_secs_f64());

        match result {
            Ok(_) => Ok(WriteOutcome::Written),
            Err(e) => {
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    metrics::counter!("dynamolock_ddb_op_conflicts_total", "op" => "put_if_absent")
                        .increment(1);
                    return Ok(WriteOutcome::Conflict(None));
                }
                metrics::counter!("dynamolock_ddb_op_errors_total", "op" => "put_if_absent")
                    .increment(1);
                Err(classify(e, "put_item"))
            }
        }
    }

    #[instrument(
        skip(self, item),
        fields(
            table_name = %self.table_name,
            name = %item.name,
            expected_version,
            new_version = item.version
        )
    )]
    async fn put_if_matches(
        &self,
        expected_owner: &str,
        expected_version: u64,
        item: RemoteLock,
    ) -> Result<WriteOutcome, StoreError> {
        let start_time = std::time::Instant::now();
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(Self::lock_to_item(&item)))
            .condition_expression("#o = :owner AND #v = :version")
            .expression_attribute_names("#o", OWNER_ATTR)
            .expression_attribute_names("#v", VERSION_ATTR)
            .expression_attribute_values(":owner", AttributeValue::S(expected_owner.to_string()))
            .expression_attribute_values(
                ":version",
                AttributeValue::N(expected_version.to_string()),
            )
            .send()
            .await;

        metrics::histogram!("dynamolock_ddb_op_duration_seconds", "op" => "put_if_matches")
            .record(start_time.elapsed().as_secs_f64());

        match result {
            Ok(_) => Ok(WriteOutcome::Written),
            Err(e) => {
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    metrics::counter!("dynamolock_ddb_op_conflicts_total", "op" => "put_if_matches")
                        .increment(1);
                    return Ok(WriteOutcome::Conflict(None));
                }
                metrics::counter!("dynamolock_ddb_op_errors_total", "op" => "put_if_matches")
                    .increment(1);
                Err(classify(e, "put_item"))
            }
        }
    }

    #[instrument(skip(self), fields(table_name = %self.table_name, name = %name, expected_version))]
    async fn delete_if_matches(
        &self,
        name: &str,
        expected_owner: &str,
        expected_version: u64,
    ) -> Result<WriteOutcome, StoreError> {
        let start_time = std::time::Instant::now();
        let result = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key(KEY_ATTR, AttributeValue::S(name.to_string()))
            .condition_expression("#o = :owner AND #v = :version")
            .expression_attribute_names("#o", OWNER_ATTR)
            .expression_attribute_names("#v", VERSION_ATTR)
            .expression_attribute_values(":owner", AttributeValue::S(expected_owner.to_string()))
            .expression_attribute_values(
                ":version",
                AttributeValue::N(expected_version.to_string()),
            )
            .send()
            .await;

        metrics::histogram!("dynamolock_ddb_op_duration_seconds", "op" => "delete_if_matches")
            .record(start_time.elapsed().as_secs_f64());

        match result {
            Ok(_) => Ok(WriteOutcome::Written),
            Err(e) => {
                if e.as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception())
                {
                    metrics::counter!("dynamolock_ddb_op_conflicts_total", "op" => "delete_if_matches")
                        .increment(1);
                    return Ok(WriteOutcome::Conflict(None));
                }
                metrics::counter!("dynamolock_ddb_op_errors_total", "op" => "delete_if_matches")
                    .increment(1);
                Err(classify(e, "delete_item"))
            }
        }
    }
}

/// Map an SDK error onto the store error taxonomy by service error code.
fn classify<E>(err: SdkError<E>, op: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let code = err.code().map(str::to_string);
    let msg = format!("{}: {}", op, DisplayErrorContext(err));
    match code.as_deref() {
        Some("ProvisionedThroughputExceededException")
        | Some("ThrottlingException")
        | Some("RequestLimitExceeded")
        | Some("InternalServerError")
        | Some("ServiceUnavailable")
        | Some("TransactionConflictException") => {
            warn!(error = %msg, "transient DynamoDB error");
            StoreError::Transient(msg)
        }
        Some(_) => StoreError::Fatal(msg),
        // No service code means the request never got a response: dispatch
        // failure, connector timeout, connection reset. Retryable.
        None => {
            warn!(error = %msg, "transient DynamoDB transport error");
            StoreError::Transient(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_round_trips_through_attribute_map() {
        let lock = RemoteLock {
            name: "job-1".to_string(),
            owner: "01J0000000000000000000000".to_string(),
            version: 42,
            duration_ms: 10_000,
            payload: Some(b"fencing-token".to_vec()),
        };

        let item = DynamoDbLockStore::lock_to_item(&lock);
        let parsed = DynamoDbLockStore::item_to_lock(&item).unwrap();
        assert_eq!(parsed, lock);
    }

    #[test]
    fn absent_payload_and_owner_parse_as_empty() {
        let lock = RemoteLock {
            name: "job-2".to_string(),
            owner: String::new(),
            version: 7,
            duration_ms: 500,
            payload: None,
        };

        let item = DynamoDbLockStore::lock_to_item(&lock);
        assert!(!item.contains_key(PAYLOAD_ATTR));
        let parsed = DynamoDbLockStore::item_to_lock(&item).unwrap();
        assert!(!parsed.is_owned());
        assert_eq!(parsed.payload, None);
    }

    #[test]
    fn malformed_item_is_a_fatal_error() {
        let mut item = HashMap::new();
        item.insert(
            KEY_ATTR.to_string(),
            AttributeValue::S("job-3".to_string()),
        );
        let result = DynamoDbLockStore::item_to_lock(&item);
        assert!(matches!(result, Err(StoreError::Fatal(_))));
    }
}
