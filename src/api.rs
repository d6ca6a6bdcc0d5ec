//! Request and response bodies of the broker HTTP API.
//!
//! Shared between the axum handlers and the client SDK. Session-related
//! bodies that pass through to the enclave unchanged reuse the wire types
//! from [`crate::proto`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::proto;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTenantResponse {
    pub tenant_id: String,
    /// Shown exactly once; only the bcrypt hash is persisted.
    pub api_key: String,
    /// Attestation document the tenant keys were generated against, base64.
    pub attestation_document: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableHashRequest {
    pub session_id: String,
    /// Table name sealed under the session key, base64.
    pub encrypted_table_name: String,
    pub table_name_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableHashResponse {
    pub table_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateObjectRequest {
    /// Size of the encrypted blob the client is about to upload, bytes.
    pub blob_size: u64,
    /// KMS-wrapped DEK, base64.
    pub encrypted_dek: String,
    /// Master-wrapped DEK, base64.
    pub master_encrypted_dek: String,
    /// Nonce the object payload is sealed under, base64.
    pub dek_nonce: String,
    /// Equality-index tokens: index name → deterministic token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateObjectResponse {
    pub object_id: String,
    pub upload_url: String,
    pub expires_in_seconds: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetObjectResponse {
    pub object_id: String,
    /// Presigned GET URL when the payload lives in S3, empty otherwise.
    #[serde(default)]
    pub get_url: String,
    /// Inline ciphertext, base64, when the payload is stored inline.
    #[serde(default)]
    pub encrypted_blob: String,
    pub kms_wrapped_dek: String,
    pub master_wrapped_dek: String,
    pub dek_nonce: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateDeksRequest {
    pub session_id: String,
    /// Number of DEKs to generate, 1..=100.
    pub count: u32,
}

pub type GenerateDeksResponse = proto::PrepareDekResponse;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwrapRequest {
    pub session_id: String,
    pub items: Vec<proto::SessionUnwrapItem>,
}

pub type UnwrapResponse = proto::SessionUnwrapResponse;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHealthResponse {
    pub status: String,
    pub s3_healthy: bool,
    pub dynamo_healthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Bounds for `GenerateDeksRequest::count`.
pub const MAX_DEK_COUNT: u32 = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_object_request_optional_fields() {
        let json = r#"{"blob_size":1024,"encrypted_dek":"a","master_encrypted_dek":"b","dek_nonce":"c"}"#;
        let req: CreateObjectRequest = serde_json::from_str(json).unwrap();
        assert!(req.indexes.is_none());
        assert!(req.sensitivity.is_none());

        let out = serde_json::to_string(&req).unwrap();
        assert!(!out.contains("indexes"));
    }

    #[test]
    fn get_object_response_defaults() {
        let json = r#"{"object_id":"o","kms_wrapped_dek":"k","master_wrapped_dek":"m","dek_nonce":"n","created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z","version":1}"#;
        let res: GetObjectResponse = serde_json::from_str(json).unwrap();
        assert!(res.get_url.is_empty());
        assert!(res.encrypted_blob.is_empty());
    }
}
