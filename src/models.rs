//! Persisted record types and key layouts.
//!
//! Single-table key formats:
//! - tenant config:  pk `TENANT#{tid}`, sk `#CONFIG`
//! - API key:        pk `TENANT#{tid}`, sk `APIKEY#{kid}`
//! - object:         pk `TENANT#{tid}#TABLE#{th}`, sk `OBJ#{oid}`
//! - index entry:    pk `IDX#{name}#TENANT#{tid}`, sk `TOKEN#{tok}#OBJ#{oid}`

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prefix of every minted API key. The remainder is base64url of 32 random
/// bytes; only the bcrypt hash is ever persisted.
pub const API_KEY_PREFIX: &str = "gdb_live_";

/// Inline blobs above this size must go to S3.
pub const INLINE_BLOB_LIMIT: usize = 100 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    Pending,
    Ready,
    Deleted,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Pending => "pending",
            ObjectStatus::Ready => "ready",
            ObjectStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ObjectStatus::Pending),
            "ready" => Ok(ObjectStatus::Ready),
            "deleted" => Ok(ObjectStatus::Deleted),
            other => Err(Error::Validation(format!("unknown object status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Sensitivity::Low),
            "medium" => Ok(Sensitivity::Medium),
            "high" => Ok(Sensitivity::High),
            other => Err(Error::Validation(format!(
                "sensitivity must be low, medium or high, got: {other}"
            ))),
        }
    }
}

/// Per-tenant key material, wrapped by KMS. Opaque to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub pk: String,
    pub sk: String,
    /// KMS `CiphertextBlob` of the 32-byte master key, base64.
    pub wrapped_master_key: String,
    /// KMS `CiphertextBlob` of the 32-byte table salt, base64.
    pub wrapped_table_salt: String,
    pub master_key_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantConfig {
    pub fn new(tenant_id: &str, wrapped_master_key: &[u8], wrapped_table_salt: &[u8]) -> Self {
        let now = Utc::now();
        Self {
            pk: tenant_pk(tenant_id),
            sk: "#CONFIG".to_string(),
            wrapped_master_key: base64std(wrapped_master_key),
            wrapped_table_salt: base64std(wrapped_table_salt),
            master_key_version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub pk: String,
    pub sk: String,
    pub hashed_key: String,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

pub const PERMISSION_READ: &str = "read";
pub const PERMISSION_WRITE: &str = "write";

impl ApiKey {
    pub fn new(
        tenant_id: &str,
        key_id: &str,
        hashed_key: String,
        permissions: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            pk: tenant_pk(tenant_id),
            sk: format!("APIKEY#{key_id}"),
            hashed_key,
            permissions,
            created_at: Utc::now(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }
}

/// Mints a fresh API key token. Shown to the caller exactly once.
pub fn generate_api_key() -> String {
    let mut token = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut token);
    format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(token))
}

/// Hashes an API key for persistence.
pub fn hash_api_key(api_key: &str) -> Result<String> {
    bcrypt::hash(api_key, bcrypt::DEFAULT_COST)
        .map_err(|e| Error::Crypto(format!("bcrypt hash failed: {e}")))
}

/// Constant-time verification of a presented key against a stored hash.
pub fn verify_api_key(api_key: &str, hashed: &str) -> bool {
    bcrypt::verify(api_key, hashed).unwrap_or(false)
}

/// An encrypted object record. Exactly one of `s3_key` / `encrypted_blob`
/// is populated once the object is ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub pk: String,
    pub sk: String,
    #[serde(default)]
    pub s3_key: String,
    /// Inline ciphertext, base64. Only for blobs ≤ [`INLINE_BLOB_LIMIT`].
    #[serde(default)]
    pub encrypted_blob: String,
    /// DEK wrapped by KMS, base64.
    pub kms_wrapped_dek: String,
    /// DEK wrapped by the tenant master key, base64.
    pub master_wrapped_dek: String,
    /// Nonce under which the object payload was encrypted, base64.
    pub dek_nonce: String,
    pub sensitivity: Sensitivity,
    pub status: ObjectStatus,
    pub version: u32,
    /// Unix expiry for pending records; 0 once ready.
    #[serde(default)]
    pub ttl: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: &str,
        table_hash: &str,
        object_id: &str,
        kms_wrapped_dek: String,
        master_wrapped_dek: String,
        dek_nonce: String,
        sensitivity: Sensitivity,
        ttl: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            pk: object_pk(tenant_id, table_hash),
            sk: object_sk(object_id),
            s3_key: String::new(),
            encrypted_blob: String::new(),
            kms_wrapped_dek,
            master_wrapped_dek,
            dek_nonce,
            sensitivity,
            status: ObjectStatus::Pending,
            version: 1,
            ttl,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Equality-index entry pointing a deterministic token at an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub pk: String,
    pub sk: String,
    #[serde(default)]
    pub s3_key: String,
    pub created_at: DateTime<Utc>,
}

impl IndexEntry {
    pub fn new(
        index_name: &str,
        tenant_id: &str,
        token: &str,
        object_id: &str,
        s3_key: &str,
    ) -> Self {
        Self {
            pk: format!("IDX#{index_name}#TENANT#{tenant_id}"),
            sk: format!("TOKEN#{token}#OBJ#{object_id}"),
            s3_key: s3_key.to_string(),
            created_at: Utc::now(),
        }
    }
}

pub fn tenant_pk(tenant_id: &str) -> String {
    format!("TENANT#{tenant_id}")
}

pub fn object_pk(tenant_id: &str, table_hash: &str) -> String {
    format!("TENANT#{tenant_id}#TABLE#{table_hash}")
}

pub fn object_sk(object_id: &str) -> String {
    format!("OBJ#{object_id}")
}

/// S3 key for an object version: `tenant-{tid}/{th}/{oid}/v{n}`.
pub fn s3_object_key(tenant_id: &str, table_hash: &str, object_id: &str, version: u32) -> String {
    format!("tenant-{tenant_id}/{table_hash}/{object_id}/v{version}")
}

fn base64std(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_round_trip() {
        let key = generate_api_key();
        assert!(key.starts_with(API_KEY_PREFIX));
        let hashed = hash_api_key(&key).unwrap();
        assert!(verify_api_key(&key, &hashed));
        assert!(!verify_api_key("gdb_live_wrong", &hashed));
    }

    #[test]
    fn api_keys_are_unique() {
        assert_ne!(generate_api_key(), generate_api_key());
    }

    #[test]
    fn api_key_expiry() {
        let now = Utc::now();
        let expired = ApiKey::new(
            "t1",
            "k1",
            "h".into(),
            vec![PERMISSION_READ.into()],
            Some(now - chrono::Duration::seconds(1)),
        );
        assert!(expired.is_expired(now));

        let open_ended = ApiKey::new("t1", "k2", "h".into(), vec![], None);
        assert!(!open_ended.is_expired(now));
    }

    #[test]
    fn key_layouts() {
        assert_eq!(tenant_pk("t-1"), "TENANT#t-1");
        assert_eq!(object_pk("t-1", "h4sh"), "TENANT#t-1#TABLE#h4sh");
        assert_eq!(object_sk("o-9"), "OBJ#o-9");
        assert_eq!(
            s3_object_key("t-1", "h4sh", "o-9", 1),
            "tenant-t-1/h4sh/o-9/v1"
        );
    }

    #[test]
    fn index_entry_layout() {
        let idx = IndexEntry::new("email", "t-1", "tok123", "o-9", "s3/key");
        assert_eq!(idx.pk, "IDX#email#TENANT#t-1");
        assert_eq!(idx.sk, "TOKEN#tok123#OBJ#o-9");
    }

    #[test]
    fn sensitivity_parse_and_order() {
        assert_eq!(Sensitivity::parse("low").unwrap(), Sensitivity::Low);
        assert!(Sensitivity::parse("secret").is_err());
        assert!(Sensitivity::Medium > Sensitivity::Low);
        assert!(Sensitivity::High > Sensitivity::Medium);
    }

    #[test]
    fn status_parse() {
        assert_eq!(ObjectStatus::parse("ready").unwrap(), ObjectStatus::Ready);
        assert!(ObjectStatus::parse("gone").is_err());
    }

    #[test]
    fn new_object_is_pending_v1() {
        let obj = ObjectRecord::new(
            "t-1",
            "h4sh",
            "o-9",
            "kms".into(),
            "master".into(),
            "nonce".into(),
            Sensitivity::Low,
            1234,
        );
        assert_eq!(obj.status, ObjectStatus::Pending);
        assert_eq!(obj.version, 1);
        assert!(obj.s3_key.is_empty());
        assert!(obj.encrypted_blob.is_empty());
    }
}
