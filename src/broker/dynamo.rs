//! DynamoDB persistence for tenant configs, API keys, objects and index
//! entries.

use aws_sdk_dynamodb::error::ProvideErrorMetadata;
use aws_sdk_dynamodb::types::{
    AttributeValue, Put, PutRequest, TransactWriteItem, WriteRequest,
};
use aws_sdk_dynamodb::Client as DynamoClient;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::config::AwsConfig;
use crate::error::{Error, Result};
use crate::models::{
    self, ApiKey, IndexEntry, ObjectRecord, ObjectStatus, Sensitivity, TenantConfig,
};

/// Transactional writes are capped at 25 items; larger index sets fall
/// back to batched puts.
const TRANSACT_LIMIT: usize = 25;

pub struct DynamoService {
    client: DynamoClient,
    objects_table: String,
    indexes_table: String,
    tenant_configs_table: String,
    api_keys_table: String,
}

impl DynamoService {
    pub fn new(client: DynamoClient, config: &AwsConfig) -> Self {
        Self {
            client,
            objects_table: config.objects_table.clone(),
            indexes_table: config.indexes_table.clone(),
            tenant_configs_table: config.tenant_configs_table.clone(),
            api_keys_table: config.api_keys_table.clone(),
        }
    }

    pub async fn health(&self) -> Result<()> {
        self.client
            .describe_table()
            .table_name(&self.objects_table)
            .send()
            .await
            .map_err(|e| map_dynamo_error("DescribeTable", e))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tenant configs
    // ------------------------------------------------------------------

    pub async fn create_tenant(
        &self,
        tenant_id: &str,
        wrapped_master_key: &[u8],
        wrapped_table_salt: &[u8],
    ) -> Result<TenantConfig> {
        let config = TenantConfig::new(tenant_id, wrapped_master_key, wrapped_table_salt);

        let mut item = HashMap::new();
        item.insert("pk".into(), AttributeValue::S(config.pk.clone()));
        item.insert("sk".into(), AttributeValue::S(config.sk.clone()));
        item.insert(
            "wrapped_master_key".into(),
            AttributeValue::S(config.wrapped_master_key.clone()),
        );
        item.insert(
            "wrapped_table_salt".into(),
            AttributeValue::S(config.wrapped_table_salt.clone()),
        );
        item.insert(
            "master_key_version".into(),
            AttributeValue::N(config.master_key_version.to_string()),
        );
        item.insert(
            "created_at".into(),
            AttributeValue::S(config.created_at.to_rfc3339()),
        );
        item.insert(
            "updated_at".into(),
            AttributeValue::S(config.updated_at.to_rfc3339()),
        );

        self.client
            .put_item()
            .table_name(&self.tenant_configs_table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| map_dynamo_error("PutItem", e))?;

        debug!(tenant_id, "tenant config stored");
        Ok(config)
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantConfig>> {
        let out = self
            .client
            .get_item()
            .table_name(&self.tenant_configs_table)
            .key("pk", AttributeValue::S(models::tenant_pk(tenant_id)))
            .key("sk", AttributeValue::S("#CONFIG".into()))
            .send()
            .await
            .map_err(|e| map_dynamo_error("GetItem", e))?;

        let Some(item) = out.item else {
            return Ok(None);
        };
        Ok(Some(parse_tenant_config(&item)?))
    }

    // ------------------------------------------------------------------
    // API keys
    // ------------------------------------------------------------------

    /// Mints, hashes and persists a new API key; returns the plaintext
    /// token exactly once.
    pub async fn create_api_key(&self, tenant_id: &str) -> Result<String> {
        let api_key = models::generate_api_key();
        let hashed = models::hash_api_key(&api_key)?;
        let record = ApiKey::new(
            tenant_id,
            &Uuid::new_v4().to_string(),
            hashed,
            vec![
                models::PERMISSION_READ.to_string(),
                models::PERMISSION_WRITE.to_string(),
            ],
            None,
        );

        let mut item = HashMap::new();
        item.insert("pk".into(), AttributeValue::S(record.pk.clone()));
        item.insert("sk".into(), AttributeValue::S(record.sk.clone()));
        item.insert(
            "hashed_key".into(),
            AttributeValue::S(record.hashed_key.clone()),
        );
        item.insert(
            "permissions".into(),
            AttributeValue::Ss(record.permissions.clone()),
        );
        item.insert(
            "created_at".into(),
            AttributeValue::S(record.created_at.to_rfc3339()),
        );
        if let Some(expires) = record.expires_at {
            item.insert("expires_at".into(), AttributeValue::S(expires.to_rfc3339()));
        }

        self.client
            .put_item()
            .table_name(&self.api_keys_table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| map_dynamo_error("PutItem", e))?;

        Ok(api_key)
    }

    /// Scans the tenant's keys and bcrypt-verifies the presented token.
    /// Expired keys never match.
    pub async fn find_api_key(&self, tenant_id: &str, provided: &str) -> Result<Option<ApiKey>> {
        let out = self
            .client
            .query()
            .table_name(&self.api_keys_table)
            .key_condition_expression("pk = :pk")
            .expression_attribute_values(
                ":pk",
                AttributeValue::S(models::tenant_pk(tenant_id)),
            )
            .send()
            .await
            .map_err(|e| map_dynamo_error("Query", e))?;

        let now = Utc::now();
        for item in out.items() {
            let record = parse_api_key(item)?;
            if record.is_expired(now) {
                continue;
            }
            if models::verify_api_key(provided, &record.hashed_key) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Objects and indexes
    // ------------------------------------------------------------------

    /// Stores an object record together with its index entries. Up to
    /// [`TRANSACT_LIMIT`] items go in one transaction; larger index sets
    /// are written separately in batches.
    pub async fn create_object_with_indexes(
        &self,
        tenant_id: &str,
        object: &ObjectRecord,
        indexes: &HashMap<String, String>,
    ) -> Result<()> {
        let object_id = object.sk.trim_start_matches("OBJ#");
        let index_items: Vec<HashMap<String, AttributeValue>> = indexes
            .iter()
            .map(|(name, token)| {
                index_item(&IndexEntry::new(
                    name,
                    tenant_id,
                    token,
                    object_id,
                    &object.s3_key,
                ))
            })
            .collect();

        if index_items.len() + 1 <= TRANSACT_LIMIT {
            let mut writes = Vec::with_capacity(index_items.len() + 1);
            writes.push(
                TransactWriteItem::builder()
                    .put(
                        Put::builder()
                            .table_name(&self.objects_table)
                            .set_item(Some(object_item(object)))
                            .build()
                            .map_err(|e| Error::Dynamo(format!("Put build failed: {e}")))?,
                    )
                    .build(),
            );
            for item in index_items {
                writes.push(
                    TransactWriteItem::builder()
                        .put(
                            Put::builder()
                                .table_name(&self.indexes_table)
                                .set_item(Some(item))
                                .build()
                                .map_err(|e| Error::Dynamo(format!("Put build failed: {e}")))?,
                        )
                        .build(),
                );
            }

            self.client
                .transact_write_items()
                .set_transact_items(Some(writes))
                .send()
                .await
                .map_err(|e| map_dynamo_error("TransactWriteItems", e))?;
            return Ok(());
        }

        self.client
            .put_item()
            .table_name(&self.objects_table)
            .set_item(Some(object_item(object)))
            .send()
            .await
            .map_err(|e| map_dynamo_error("PutItem", e))?;

        for chunk in index_items.chunks(TRANSACT_LIMIT) {
            let requests: Vec<WriteRequest> = chunk
                .iter()
                .map(|item| {
                    PutRequest::builder()
                        .set_item(Some(item.clone()))
                        .build()
                        .map(|put| WriteRequest::builder().put_request(put).build())
                        .map_err(|e| Error::Dynamo(format!("PutRequest build failed: {e}")))
                })
                .collect::<Result<_>>()?;

            self.client
                .batch_write_item()
                .request_items(&self.indexes_table, requests)
                .send()
                .await
                .map_err(|e| map_dynamo_error("BatchWriteItem", e))?;
        }
        Ok(())
    }

    pub async fn get_object(
        &self,
        tenant_id: &str,
        table_hash: &str,
        object_id: &str,
    ) -> Result<Option<ObjectRecord>> {
        let out = self
            .client
            .get_item()
            .table_name(&self.objects_table)
            .key(
                "pk",
                AttributeValue::S(models::object_pk(tenant_id, table_hash)),
            )
            .key("sk", AttributeValue::S(models::object_sk(object_id)))
            .send()
            .await
            .map_err(|e| map_dynamo_error("GetItem", e))?;

        let Some(item) = out.item else {
            return Ok(None);
        };
        Ok(Some(parse_object(&item)?))
    }

    /// Completes an inline upload: stores the blob, flips the record to
    /// `ready` and drops the pending-TTL.
    pub async fn update_object_inline_blob(
        &self,
        tenant_id: &str,
        table_hash: &str,
        object_id: &str,
        blob_b64: &str,
    ) -> Result<()> {
        self.client
            .update_item()
            .table_name(&self.objects_table)
            .key(
                "pk",
                AttributeValue::S(models::object_pk(tenant_id, table_hash)),
            )
            .key("sk", AttributeValue::S(models::object_sk(object_id)))
            .update_expression(
                "SET #status = :ready, #blob = :blob, #updated = :now REMOVE #ttl",
            )
            .expression_attribute_names("#status", "status")
            .expression_attribute_names("#blob", "encrypted_blob")
            .expression_attribute_names("#ttl", "ttl")
            .expression_attribute_names("#updated", "updated_at")
            .expression_attribute_values(
                ":ready",
                AttributeValue::S(ObjectStatus::Ready.as_str().into()),
            )
            .expression_attribute_values(":blob", AttributeValue::S(blob_b64.into()))
            .expression_attribute_values(":now", AttributeValue::S(Utc::now().to_rfc3339()))
            .send()
            .await
            .map_err(|e| map_dynamo_error("UpdateItem", e))?;
        Ok(())
    }

}

// ----------------------------------------------------------------------
// Item marshalling
// ----------------------------------------------------------------------

fn object_item(object: &ObjectRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert("pk".into(), AttributeValue::S(object.pk.clone()));
    item.insert("sk".into(), AttributeValue::S(object.sk.clone()));
    if !object.s3_key.is_empty() {
        item.insert("s3_key".into(), AttributeValue::S(object.s3_key.clone()));
    }
    if !object.encrypted_blob.is_empty() {
        item.insert(
            "encrypted_blob".into(),
            AttributeValue::S(object.encrypted_blob.clone()),
        );
    }
    item.insert(
        "kms_wrapped_dek".into(),
        AttributeValue::S(object.kms_wrapped_dek.clone()),
    );
    item.insert(
        "master_wrapped_dek".into(),
        AttributeValue::S(object.master_wrapped_dek.clone()),
    );
    item.insert(
        "dek_nonce".into(),
        AttributeValue::S(object.dek_nonce.clone()),
    );
    item.insert(
        "sensitivity".into(),
        AttributeValue::S(object.sensitivity.as_str().into()),
    );
    item.insert(
        "status".into(),
        AttributeValue::S(object.status.as_str().into()),
    );
    item.insert("version".into(), AttributeValue::N(object.version.to_string()));
    if object.ttl > 0 {
        item.insert("ttl".into(), AttributeValue::N(object.ttl.to_string()));
    }
    item.insert(
        "created_at".into(),
        AttributeValue::S(object.created_at.to_rfc3339()),
    );
    item.insert(
        "updated_at".into(),
        AttributeValue::S(object.updated_at.to_rfc3339()),
    );
    item
}

fn index_item(entry: &IndexEntry) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert("pk".into(), AttributeValue::S(entry.pk.clone()));
    item.insert("sk".into(), AttributeValue::S(entry.sk.clone()));
    if !entry.s3_key.is_empty() {
        item.insert("s3_key".into(), AttributeValue::S(entry.s3_key.clone()));
    }
    item.insert(
        "created_at".into(),
        AttributeValue::S(entry.created_at.to_rfc3339()),
    );
    item
}

fn parse_tenant_config(item: &HashMap<String, AttributeValue>) -> Result<TenantConfig> {
    Ok(TenantConfig {
        pk: get_s(item, "pk")?,
        sk: get_s(item, "sk")?,
        wrapped_master_key: get_s(item, "wrapped_master_key")?,
        wrapped_table_salt: get_s(item, "wrapped_table_salt")?,
        master_key_version: get_n(item, "master_key_version")?,
        created_at: get_time(item, "created_at")?,
        updated_at: get_time(item, "updated_at")?,
    })
}

fn parse_api_key(item: &HashMap<String, AttributeValue>) -> Result<ApiKey> {
    let permissions = match item.get("permissions") {
        Some(AttributeValue::Ss(values)) => values.clone(),
        Some(AttributeValue::L(values)) => values
            .iter()
            .filter_map(|v| v.as_s().ok().cloned())
            .collect(),
        _ => Vec::new(),
    };
    let expires_at = match item.get("expires_at") {
        Some(AttributeValue::S(s)) => Some(parse_time(s)?),
        _ => None,
    };
    Ok(ApiKey {
        pk: get_s(item, "pk")?,
        sk: get_s(item, "sk")?,
        hashed_key: get_s(item, "hashed_key")?,
        permissions,
        created_at: get_time(item, "created_at")?,
        expires_at,
    })
}

fn parse_object(item: &HashMap<String, AttributeValue>) -> Result<ObjectRecord> {
    Ok(ObjectRecord {
        pk: get_s(item, "pk")?,
        sk: get_s(item, "sk")?,
        s3_key: opt_s(item, "s3_key"),
        encrypted_blob: opt_s(item, "encrypted_blob"),
        kms_wrapped_dek: get_s(item, "kms_wrapped_dek")?,
        master_wrapped_dek: get_s(item, "master_wrapped_dek")?,
        dek_nonce: get_s(item, "dek_nonce")?,
        sensitivity: Sensitivity::parse(&get_s(item, "sensitivity")?)?,
        status: ObjectStatus::parse(&get_s(item, "status")?)?,
        version: get_n(item, "version")?,
        ttl: match item.get("ttl") {
            Some(AttributeValue::N(n)) => n.parse().unwrap_or(0),
            _ => 0,
        },
        created_at: get_time(item, "created_at")?,
        updated_at: get_time(item, "updated_at")?,
    })
}

fn get_s(item: &HashMap<String, AttributeValue>, key: &str) -> Result<String> {
    match item.get(key) {
        Some(AttributeValue::S(s)) => Ok(s.clone()),
        _ => Err(Error::Dynamo(format!(
            "missing or invalid string attribute: {key}"
        ))),
    }
}

fn opt_s(item: &HashMap<String, AttributeValue>, key: &str) -> String {
    match item.get(key) {
        Some(AttributeValue::S(s)) => s.clone(),
        _ => String::new(),
    }
}

fn get_n<T: std::str::FromStr>(item: &HashMap<String, AttributeValue>, key: &str) -> Result<T> {
    match item.get(key) {
        Some(AttributeValue::N(n)) => n
            .parse()
            .map_err(|_| Error::Dynamo(format!("invalid numeric attribute: {key}"))),
        _ => Err(Error::Dynamo(format!(
            "missing or invalid numeric attribute: {key}"
        ))),
    }
}

fn get_time(item: &HashMap<String, AttributeValue>, key: &str) -> Result<DateTime<Utc>> {
    parse_time(&get_s(item, key)?)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Dynamo(format!("invalid timestamp: {e}")))
}

fn map_dynamo_error<E, R>(op: &str, err: aws_sdk_dynamodb::error::SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let code = err
        .as_service_error()
        .and_then(|e| e.code())
        .unwrap_or_default()
        .to_string();
    match code.as_str() {
        "ThrottlingException" | "ProvisionedThroughputExceededException" => {
            Error::Transient(format!("DynamoDB {op} throttled"))
        }
        _ => Error::Dynamo(format!("{op} failed: {err}")),
    }
}
