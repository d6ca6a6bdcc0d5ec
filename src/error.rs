//! Error types shared by the broker, the enclave and the client SDK.

use thiserror::Error;

/// Errors that can occur anywhere in gardbase.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid tenant credentials. Surfaced as 401 without
    /// distinguishing an unknown tenant from a wrong key.
    #[error("authentication failed")]
    Auth,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("attestation error: {0}")]
    Attestation(String),

    /// Client-side attestation verification failure, naming the step
    /// (1..=8) that rejected the document.
    #[error("attestation verification failed at step {step} ({name}): {reason}")]
    AttestationStep {
        step: u8,
        name: &'static str,
        reason: String,
    },

    /// AEAD/RSA/key-length failures. Carries the failing step name but
    /// never any intermediate bytes.
    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Throttling or storage timeouts; retried by the AWS SDK, surfaced
    /// as 503 when retries are exhausted.
    #[error("transient error: {0}")]
    Transient(String),

    #[error("NSM error: {0}")]
    Nsm(String),

    #[error("KMS error: {0}")]
    Kms(String),

    #[error("DynamoDB error: {0}")]
    Dynamo(String),

    #[error("S3 error: {0}")]
    S3(String),

    /// Enclave returned an error frame or the wire exchange failed.
    #[error("enclave error: {0}")]
    Enclave(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// HTTP status the broker maps this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Auth => 401,
            Error::Validation(_) | Error::Conflict(_) => 400,
            Error::NotFound(_) => 404,
            Error::Transient(_) => 503,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::Auth.status_code(), 401);
        assert_eq!(Error::Validation("x".into()).status_code(), 400);
        assert_eq!(Error::Conflict("x".into()).status_code(), 400);
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::Transient("x".into()).status_code(), 503);
        assert_eq!(Error::Kms("x".into()).status_code(), 500);
    }

    #[test]
    fn auth_error_is_opaque() {
        // The message must not leak whether the tenant exists.
        assert_eq!(Error::Auth.to_string(), "authentication failed");
    }

    #[test]
    fn attestation_step_names_the_step() {
        let err = Error::AttestationStep {
            step: 6,
            name: "nonce",
            reason: "mismatch".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("step 6"));
        assert!(msg.contains("nonce"));
    }
}
