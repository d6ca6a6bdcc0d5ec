//! Tenant provisioning.

use axum::extract::State;
use axum::Json;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tracing::info;
use uuid::Uuid;

use crate::api::CreateTenantResponse;
use crate::broker::kms::{PURPOSE_MASTER_KEY, PURPOSE_TABLE_SALT};
use crate::broker::{ApiError, AppState};

/// `POST /api/tenants/`: provisions a tenant: both tenant-wide keys are
/// generated by KMS against the enclave's attestation, so their plaintext
/// only ever exists inside KMS and the enclave. The returned API key is
/// shown exactly once.
pub async fn create(State(state): State<AppState>) -> Result<Json<CreateTenantResponse>, ApiError> {
    let tenant_id = Uuid::new_v4().to_string();

    let attestation = state.enclave.attestation_document().await?;

    let master_key = state
        .kms
        .generate_data_key(&attestation, &tenant_id, PURPOSE_MASTER_KEY)
        .await?;
    let table_salt = state
        .kms
        .generate_data_key(&attestation, &tenant_id, PURPOSE_TABLE_SALT)
        .await?;

    state
        .dynamo
        .create_tenant(
            &tenant_id,
            &master_key.ciphertext_blob,
            &table_salt.ciphertext_blob,
        )
        .await?;

    let api_key = state.dynamo.create_api_key(&tenant_id).await?;

    info!(tenant_id, "tenant provisioned");

    Ok(Json(CreateTenantResponse {
        tenant_id,
        api_key,
        attestation_document: B64.encode(attestation),
    }))
}
