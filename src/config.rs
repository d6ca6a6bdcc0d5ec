//! Environment-driven configuration for the API server and the enclave.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default vsock port the enclave listens on.
pub const DEFAULT_ENCLAVE_PORT: u32 = 5000;

/// Default context id of the enclave guest.
pub const DEFAULT_ENCLAVE_CID: u32 = 16;

/// Configuration for the broker (API service).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub port: u16,
    pub environment: String,
    pub base_url: String,
    pub aws: AwsConfig,
    pub enclave: EnclaveAddr,
    /// Lifetime of presigned URLs and of pending object records.
    pub presign_ttl: Duration,
}

/// AWS resource names and client tuning.
#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub region: String,
    pub s3_bucket: String,
    pub objects_table: String,
    pub indexes_table: String,
    pub tenant_configs_table: String,
    pub api_keys_table: String,
    pub kms_key_id: String,
    pub max_retries: u32,
    pub use_localstack: bool,
    pub localstack_url: String,
}

/// Where the broker reaches the enclave.
#[derive(Debug, Clone, Copy)]
pub struct EnclaveAddr {
    pub cid: u32,
    pub port: u32,
}

impl BrokerConfig {
    /// Loads the broker configuration from the environment. Resource names
    /// have no sensible defaults and are required.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: env_parsed("PORT", 8080),
            environment: env_or("ENVIRONMENT", "development"),
            base_url: env_or("BASE_URL", "https://api.gardbase.com") + "/api",
            aws: AwsConfig {
                region: env_or("AWS_REGION", "eu-central-1"),
                s3_bucket: env_required("S3_BUCKET")?,
                objects_table: env_required("DYNAMO_OBJECTS_TABLE")?,
                indexes_table: env_required("DYNAMO_INDEXES_TABLE")?,
                tenant_configs_table: env_required("DYNAMO_TENANT_CONFIGS_TABLE")?,
                api_keys_table: env_required("DYNAMO_API_KEYS_TABLE")?,
                kms_key_id: env_required("KMS_KEY_ID")?,
                max_retries: env_parsed("AWS_MAX_RETRIES", 3),
                use_localstack: env_parsed("USE_LOCALSTACK", false),
                localstack_url: env_or("LOCALSTACK_URL", "http://localhost:4566"),
            },
            enclave: EnclaveAddr {
                cid: env_parsed("ENCLAVE_CID", DEFAULT_ENCLAVE_CID),
                port: env_parsed("ENCLAVE_PORT", DEFAULT_ENCLAVE_PORT),
            },
            presign_ttl: Duration::from_secs(15 * 60),
        })
    }
}

/// Configuration for the enclave binary.
#[derive(Debug, Clone)]
pub struct EnclaveConfig {
    pub port: u32,
    /// Sweep interval for expired sessions.
    pub session_sweep_interval: Duration,
    /// Refresh interval for the cached attestation document.
    pub attestation_refresh_interval: Duration,
    /// Per-connection idle deadline.
    pub idle_timeout: Duration,
}

impl EnclaveConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parsed("ENCLAVE_PORT", DEFAULT_ENCLAVE_PORT),
            session_sweep_interval: Duration::from_secs(60),
            attestation_refresh_interval: Duration::from_secs(4 * 60),
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_required(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Config(format!(
            "environment variable {key} is required"
        ))),
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_falls_back_on_garbage() {
        std::env::set_var("GB_TEST_PORT", "not-a-number");
        let port: u16 = env_parsed("GB_TEST_PORT", 8080);
        assert_eq!(port, 8080);
        std::env::remove_var("GB_TEST_PORT");
    }

    #[test]
    fn required_missing_is_config_error() {
        std::env::remove_var("GB_TEST_REQUIRED");
        let err = env_required("GB_TEST_REQUIRED").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn enclave_defaults() {
        let cfg = EnclaveConfig::from_env();
        assert_eq!(cfg.attestation_refresh_interval, Duration::from_secs(240));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(300));
    }
}
