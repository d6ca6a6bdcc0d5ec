//! Shared application state for the broker.

use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::dynamo::DynamoService;
use crate::broker::enclave_client::EnclaveClient;
use crate::broker::kms::KmsService;
use crate::broker::s3::S3Service;
use crate::config::BrokerConfig;
use crate::error::Result;

/// Cloned into every request handler; all services are behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BrokerConfig>,
    pub kms: Arc<KmsService>,
    pub dynamo: Arc<DynamoService>,
    pub s3: Arc<S3Service>,
    pub enclave: Arc<EnclaveClient>,
}

impl AppState {
    /// Builds AWS clients and the enclave connection from configuration.
    pub async fn from_config(config: BrokerConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.aws.region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(config.aws.max_retries));

        if config.aws.use_localstack {
            info!(url = %config.aws.localstack_url, "routing AWS calls to LocalStack");
            loader = loader
                .endpoint_url(&config.aws.localstack_url)
                .test_credentials();
        }

        let sdk_config = loader.load().await;

        let kms = KmsService::new(
            aws_sdk_kms::Client::new(&sdk_config),
            &config.aws.kms_key_id,
        );
        let dynamo = DynamoService::new(aws_sdk_dynamodb::Client::new(&sdk_config), &config.aws);

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.aws.use_localstack)
            .build();
        let s3 = S3Service::new(
            aws_sdk_s3::Client::from_conf(s3_config),
            &config.aws.s3_bucket,
        );

        let enclave = match std::env::var("ENCLAVE_TCP_ADDR") {
            Ok(addr) if !addr.is_empty() => {
                info!(addr = %addr, "using TCP enclave transport (development)");
                EnclaveClient::tcp(addr)
            }
            _ => EnclaveClient::vsock(config.enclave),
        };

        Ok(Self {
            config: Arc::new(config),
            kms: Arc::new(kms),
            dynamo: Arc::new(dynamo),
            s3: Arc::new(s3),
            enclave: Arc::new(enclave),
        })
    }

    /// Startup reachability probes. Failures are logged, not fatal, so the
    /// service can come up while its dependencies are still converging.
    pub async fn probe_connectivity(&self) {
        if let Err(e) = self.s3.health().await {
            warn!(error = %e, "S3 connectivity probe failed");
        }
        if let Err(e) = self.dynamo.health().await {
            warn!(error = %e, "DynamoDB connectivity probe failed");
        }
    }
}
