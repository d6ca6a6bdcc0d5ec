//! KMS operations with cryptographic attestation.
//!
//! Every call that must bind to the enclave identity passes the current
//! attestation document as the `Recipient`; KMS then encrypts its output
//! to the RSA public key inside the document, so only the attested enclave
//! can open it. Wrapped blobs are additionally bound to the tenant and
//! purpose through the encryption context.

use aws_sdk_kms::error::ProvideErrorMetadata;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::{DataKeySpec, KeyEncryptionMechanism, RecipientInfo};
use aws_sdk_kms::Client as KmsClient;
use tracing::debug;

use crate::error::{Error, Result};

/// Encryption-context purposes. A blob wrapped for one purpose cannot be
/// decrypted under another.
pub const PURPOSE_MASTER_KEY: &str = "master_key";
pub const PURPOSE_TABLE_SALT: &str = "table_salt";
pub const PURPOSE_DATA_KEY: &str = "dek";

/// Output of an attested `GenerateDataKey` call.
pub struct GeneratedDataKey {
    /// Wrapped form, decryptable later via attested `Decrypt`.
    pub ciphertext_blob: Vec<u8>,
    /// Plaintext re-encrypted to the enclave's attested public key.
    pub ciphertext_for_recipient: Vec<u8>,
}

pub struct KmsService {
    client: KmsClient,
    key_id: String,
}

impl KmsService {
    pub fn new(client: KmsClient, key_id: impl Into<String>) -> Self {
        Self {
            client,
            key_id: key_id.into(),
        }
    }

    /// Generates an AES-256 data key sealed to the attested enclave.
    pub async fn generate_data_key(
        &self,
        attestation: &[u8],
        tenant_id: &str,
        purpose: &str,
    ) -> Result<GeneratedDataKey> {
        let response = self
            .client
            .generate_data_key()
            .key_id(&self.key_id)
            .key_spec(DataKeySpec::Aes256)
            .recipient(recipient(attestation))
            .encryption_context("tenant_id", tenant_id)
            .encryption_context("purpose", purpose)
            .send()
            .await
            .map_err(|e| map_kms_error("GenerateDataKey", e))?;

        let ciphertext_blob = response
            .ciphertext_blob()
            .ok_or_else(|| Error::Kms("GenerateDataKey returned no CiphertextBlob".into()))?
            .as_ref()
            .to_vec();
        let ciphertext_for_recipient = response
            .ciphertext_for_recipient()
            .ok_or_else(|| {
                Error::Attestation("GenerateDataKey returned no CiphertextForRecipient".into())
            })?
            .as_ref()
            .to_vec();

        debug!(
            tenant_id,
            purpose,
            blob_len = ciphertext_blob.len(),
            recipient_len = ciphertext_for_recipient.len(),
            "generated data key"
        );

        Ok(GeneratedDataKey {
            ciphertext_blob,
            ciphertext_for_recipient,
        })
    }

    /// Decrypts a wrapped blob for the attested enclave. The plaintext
    /// never reaches this process; KMS returns it re-encrypted to the
    /// enclave key (`CiphertextForRecipient`).
    pub async fn decrypt_for_recipient(
        &self,
        ciphertext_blob: &[u8],
        attestation: &[u8],
        tenant_id: &str,
        purpose: &str,
    ) -> Result<Vec<u8>> {
        let response = self
            .client
            .decrypt()
            .key_id(&self.key_id)
            .ciphertext_blob(Blob::new(ciphertext_blob))
            .recipient(recipient(attestation))
            .encryption_context("tenant_id", tenant_id)
            .encryption_context("purpose", purpose)
            .send()
            .await
            .map_err(|e| map_kms_error("Decrypt", e))?;

        let ciphertext_for_recipient = response
            .ciphertext_for_recipient()
            .ok_or_else(|| Error::Attestation("Decrypt returned no CiphertextForRecipient".into()))?
            .as_ref()
            .to_vec();

        debug!(
            tenant_id,
            purpose,
            recipient_len = ciphertext_for_recipient.len(),
            "decrypted blob for recipient"
        );

        Ok(ciphertext_for_recipient)
    }

    /// Cheap reachability probe for the health endpoint.
    pub async fn health(&self) -> Result<()> {
        self.client
            .describe_key()
            .key_id(&self.key_id)
            .send()
            .await
            .map_err(|e| map_kms_error("DescribeKey", e))?;
        Ok(())
    }
}

fn recipient(attestation: &[u8]) -> RecipientInfo {
    RecipientInfo::builder()
        .attestation_document(Blob::new(attestation))
        .key_encryption_algorithm(KeyEncryptionMechanism::RsaesOaepSha256)
        .build()
}

fn map_kms_error<E, R>(op: &str, err: aws_sdk_kms::error::SdkError<E, R>) -> Error
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
        "ThrottlingException" | "LimitExceededException" => {
            Error::Transient(format!("KMS {op} throttled"))
        }
        _ => Error::Kms(format!("{op} failed: {err}")),
    }
}
