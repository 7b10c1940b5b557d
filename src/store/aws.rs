//! [`StoreClient`] over the official AWS SDK client.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::{Client, types};
use aws_sdk_dynamodb::types::AttributeValue;

use crate::error::{OdmError, OdmResult};
use crate::store::{Page, PageRequest, StoreClient};
use crate::value::AttrMap;

// Store-imposed ceilings on batch request sizes.
const BATCH_GET_LIMIT: usize = 100;
const BATCH_WRITE_LIMIT: usize = 25;

/// The default store implementation, wrapping an `aws_sdk_dynamodb::Client`.
///
/// Batch reads and writes are chunked to the store's request ceilings and
/// unprocessed keys/items are retried until drained.
#[derive(Clone, Debug)]
pub struct AwsStoreClient {
    client: Client,
}

impl AwsStoreClient {
    /// Wraps an SDK client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn write_requests(
        &self,
        table: &str,
        requests: Vec<types::WriteRequest>,
    ) -> OdmResult<()> {
        for chunk in requests.chunks(BATCH_WRITE_LIMIT) {
            let mut pending = chunk.to_vec();
            while !pending.is_empty() {
                let output = self
                    .client
                    .batch_write_item()
                    .request_items(table, pending)
                    .send()
                    .await
                    .map_err(|err| OdmError::store("BatchWriteItem", err))?;
                pending = output
                    .unprocessed_items
                    .and_then(|mut unprocessed| unprocessed.remove(table))
                    .unwrap_or_default();
            }
        }
        Ok(())
    }
}

fn none_if_empty<K, V>(map: HashMap<K, V>) -> Option<HashMap<K, V>> {
    if map.is_empty() { None } else { Some(map) }
}

#[async_trait]
impl StoreClient for AwsStoreClient {
    async fn get_item(
        &self,
        table: &str,
        key: AttrMap,
        consistent: bool,
    ) -> OdmResult<Option<AttrMap>> {
        let output = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(key))
            .consistent_read(consistent)
            .send()
            .await
            .map_err(|err| OdmError::store("GetItem", err))?;
        Ok(output.item)
    }

    async fn batch_get(
        &self,
        table: &str,
        keys: Vec<AttrMap>,
        consistent: bool,
    ) -> OdmResult<Vec<AttrMap>> {
        let mut rows = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(BATCH_GET_LIMIT) {
            let mut pending = chunk.to_vec();
            while !pending.is_empty() {
                let keys_and_attributes = types::KeysAndAttributes::builder()
                    .set_keys(Some(pending))
                    .consistent_read(consistent)
                    .build()
                    .map_err(|err| OdmError::store("BatchGetItem", err))?;
                let output = self
                    .client
                    .batch_get_item()
                    .request_items(table, keys_and_attributes)
                    .send()
                    .await
                    .map_err(|err| OdmError::store("BatchGetItem", err))?;
                if let Some(mut responses) = output.responses {
                    if let Some(found) = responses.remove(table) {
                        rows.extend(found);
                    }
                }
                pending = output
                    .unprocessed_keys
                    .and_then(|mut unprocessed| unprocessed.remove(table))
                    .map(|keys_and_attributes| keys_and_attributes.keys)
                    .unwrap_or_default();
            }
        }
        Ok(rows)
    }

    async fn conditional_put(
        &self,
        table: &str,
        item: AttrMap,
        expected: HashMap<String, Option<AttributeValue>>,
    ) -> OdmResult<bool> {
        let mut condition_parts = Vec::with_capacity(expected.len());
        let mut names = HashMap::new();
        let mut values = HashMap::new();
        for (index, (attribute, expected_value)) in expected.into_iter().enumerate() {
            let name_token = format!("#cas{index}");
            match expected_value {
                Some(value) => {
                    let value_token = format!(":cas{index}");
                    condition_parts.push(format!("{name_token} = {value_token}"));
                    values.insert(value_token, value);
                }
                None => condition_parts.push(format!("attribute_not_exists({name_token})")),
            }
            names.insert(name_token, attribute);
        }

        let mut builder = self
            .client
            .put_item()
            .table_name(table)
            .set_item(Some(item));
        if !condition_parts.is_empty() {
            builder = builder
                .condition_expression(condition_parts.join(" AND "))
                .set_expression_attribute_names(Some(names))
                .set_expression_attribute_values(none_if_empty(values));
        }
        match builder.send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let rejected = err
                    .as_service_error()
                    .is_some_and(PutItemError::is_conditional_check_failed_exception);
                if rejected {
                    Ok(false)
                } else {
                    Err(OdmError::store("PutItem", err))
                }
            }
        }
    }

    async fn batch_put(&self, table: &str, items: Vec<AttrMap>) -> OdmResult<()> {
        let mut requests = Vec::with_capacity(items.len());
        for item in items {
            let put_request = types::PutRequest::builder()
                .set_item(Some(item))
                .build()
                .map_err(|err| OdmError::store("BatchWriteItem", err))?;
            requests.push(
                types::WriteRequest::builder()
                    .set_put_request(Some(put_request))
                    .build(),
            );
        }
        self.write_requests(table, requests).await
    }

    async fn batch_delete(&self, table: &str, keys: Vec<AttrMap>) -> OdmResult<()> {
        let mut requests = Vec::with_capacity(keys.len());
        for key in keys {
            let delete_request = types::DeleteRequest::builder()
                .set_key(Some(key))
                .build()
                .map_err(|err| OdmError::store("BatchWriteItem", err))?;
            requests.push(
                types::WriteRequest::builder()
                    .set_delete_request(Some(delete_request))
                    .build(),
            );
        }
        self.write_requests(table, requests).await
    }

    async fn query(&self, request: PageRequest) -> OdmResult<Page> {
        let mut builder = self
            .client
            .query()
            .table_name(request.table)
            .set_key_condition_expression(request.key_condition)
            .set_filter_expression(request.filter)
            .set_projection_expression(request.projection)
            .set_index_name(request.index_name)
            .set_exclusive_start_key(request.start_key)
            .set_limit(request.limit)
            .set_expression_attribute_names(none_if_empty(request.names))
            .set_expression_attribute_values(none_if_empty(request.values))
            .consistent_read(request.consistent)
            .scan_index_forward(request.ascending);
        if request.count_only {
            builder = builder.select(types::Select::Count);
        }
        let output = builder
            .send()
            .await
            .map_err(|err| OdmError::store("Query", err))?;
        Ok(Page {
            rows: output.items.unwrap_or_default(),
            count: output.count.into(),
            last_key: output.last_evaluated_key,
        })
    }

    async fn scan(&self, request: PageRequest) -> OdmResult<Page> {
        let mut builder = self
            .client
            .scan()
            .table_name(request.table)
            .set_filter_expression(request.filter)
            .set_projection_expression(request.projection)
            .set_index_name(request.index_name)
            .set_exclusive_start_key(request.start_key)
            .set_limit(request.limit)
            .set_expression_attribute_names(none_if_empty(request.names))
            .set_expression_attribute_values(none_if_empty(request.values))
            .consistent_read(request.consistent);
        if let Some(segment) = request.segment {
            builder = builder.segment(segment.index).total_segments(segment.total);
        }
        if request.count_only {
            builder = builder.select(types::Select::Count);
        }
        let output = builder
            .send()
            .await
            .map_err(|err| OdmError::store("Scan", err))?;
        Ok(Page {
            rows: output.items.unwrap_or_default(),
            count: output.count.into(),
            last_key: output.last_evaluated_key,
        })
    }
}
