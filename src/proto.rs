//! Wire protocol between the broker and the enclave.
//!
//! Requests and responses travel as newline-delimited JSON over the
//! host-to-guest vsock socket. Each request is `{"type": ..., "payload": ...}`
//! and receives exactly one response frame. All binary fields are
//! standard-base64 strings.

use serde::{Deserialize, Serialize};

/// A request frame, routed by its `type` tag.
///
/// Adding a variant without a handler arm is a compile error, which is the
/// point: the dispatcher matches exhaustively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EnclaveRequest {
    Health,
    GetAttestation,
    SessionInit(SessionInitRequest),
    SessionUnwrap(SessionUnwrapRequest),
    SessionPrepareDek(PrepareDekRequest),
    SessionGenerateTableHash(TableHashRequest),
    Decrypt(DecryptRequest),
}

/// A response frame. `data` is present on success, `error` on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
pub struct EnclaveResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> EnclaveResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInitRequest {
    /// Client's ephemeral X25519 public key, base64 (32 bytes).
    pub client_ephemeral_public_key: String,
    /// Caller nonce to bind into the attestation document, base64 (≤ 64 bytes).
    #[serde(default)]
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInitResponse {
    pub session_id: String,
    /// Enclave's ephemeral X25519 public key, base64.
    pub enclave_ephemeral_public_key: String,
    /// Attestation document bound to the ephemeral key and the caller nonce, base64.
    #[serde(default)]
    pub attestation: String,
    /// Session expiry, RFC 3339.
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUnwrapItem {
    pub object_id: String,
    /// KMS ciphertext-for-recipient, base64.
    pub ciphertext: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUnwrapRequest {
    pub session_id: String,
    pub items: Vec<SessionUnwrapItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUnwrapItemResult {
    pub object_id: String,
    /// DEK sealed under the session key, base64. Empty on failure.
    #[serde(default)]
    pub sealed_dek: String,
    /// XChaCha20-Poly1305 nonce used for the seal, base64. Empty on failure.
    #[serde(default)]
    pub nonce: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type SessionUnwrapResponse = Vec<SessionUnwrapItemResult>;

/// One KMS data key to be prepared by the enclave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DekToPrepare {
    /// KMS-wrapped DEK (`CiphertextBlob`), base64, passed through untouched.
    pub ciphertext_blob: String,
    /// KMS `CiphertextForRecipient`, base64, opened with the enclave RSA key.
    pub ciphertext_for_recipient: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareDekRequest {
    pub session_id: String,
    /// Tenant master key as KMS `CiphertextForRecipient`, base64.
    pub wrapped_master_key: String,
    pub deks: Vec<DekToPrepare>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedDek {
    /// DEK sealed under the session key, base64.
    pub sealed_dek: String,
    /// KMS-wrapped DEK, base64 (pass-through of `ciphertext_blob`).
    pub kms_encrypted_dek: String,
    /// DEK sealed under the tenant master key, base64.
    pub master_encrypted_dek: String,
    pub session_nonce: String,
    pub master_key_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareDekResponse {
    pub deks: Vec<PreparedDek>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableHashRequest {
    pub session_id: String,
    /// Table name sealed under the session key, base64.
    pub session_encrypted_table_name: String,
    pub session_table_name_nonce: String,
    /// Tenant table salt as KMS `CiphertextForRecipient`, base64.
    pub table_salt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableHashResponse {
    pub table_hash: String,
}

/// Legacy single-DEK unwrap. Does not use the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptRequest {
    /// KMS ciphertext-for-recipient, base64.
    pub ciphertext: String,
    /// Client's ephemeral X25519 public key, base64.
    pub client_ephemeral_public_key: String,
    /// Request nonce, echoed back, base64.
    #[serde(default)]
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptResponse {
    /// Enclave's one-shot box public key, base64.
    pub enclave_public_key: String,
    /// DEK sealed in a NaCl box to the client key, base64.
    pub ciphertext: String,
    /// Box nonce, base64.
    pub nonce: String,
    /// Echo of the request nonce.
    #[serde(default)]
    pub request_nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAttestationResponse {
    /// Cached attestation document, base64.
    pub attestation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub uptime: String,
}
