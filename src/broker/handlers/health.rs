//! Health endpoints: static liveness plus fan-out probes for the enclave,
//! storage and KMS.

use axum::extract::State;
use axum::Json;

use crate::api::{HealthResponse, StorageHealthResponse};
use crate::broker::enclave_client::DEFAULT_CALL_TIMEOUT;
use crate::broker::{ApiError, AppState};
use crate::proto;

pub async fn api() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        message: Some("gardbase api is running".into()),
    })
}

pub async fn enclave(
    State(state): State<AppState>,
) -> Result<Json<proto::HealthResponse>, ApiError> {
    let res: proto::HealthResponse = state
        .enclave
        .call(&proto::EnclaveRequest::Health, DEFAULT_CALL_TIMEOUT)
        .await?;
    Ok(Json(res))
}

pub async fn storage(State(state): State<AppState>) -> Json<StorageHealthResponse> {
    let s3_healthy = state.s3.health().await.is_ok();
    let dynamo_healthy = state.dynamo.health().await.is_ok();
    let status = if s3_healthy && dynamo_healthy {
        "healthy"
    } else {
        "degraded"
    };
    Json(StorageHealthResponse {
        status: status.into(),
        s3_healthy,
        dynamo_healthy,
    })
}

pub async fn kms(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    state.kms.health().await?;
    Ok(Json(HealthResponse {
        status: "healthy".into(),
        message: None,
    }))
}
