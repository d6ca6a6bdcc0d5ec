//! Secure-session endpoints: init, DEK generation, batch unwrap, and the
//! legacy single-DEK path.

use axum::extract::State;
use axum::{Extension, Json};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use std::time::Duration;
use tracing::warn;

use crate::api::{self, GenerateDeksRequest, UnwrapRequest};
use crate::broker::auth::TenantContext;
use crate::broker::enclave_client::DEFAULT_CALL_TIMEOUT;
use crate::broker::kms::{PURPOSE_DATA_KEY, PURPOSE_MASTER_KEY};
use crate::broker::{ApiError, AppState};
use crate::proto;

/// Timeout for batched DEK operations.
const BATCH_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// `POST /api/encryption/secure-session/init`: pure relay; the handshake
/// itself happens between the SDK and the enclave.
pub async fn session_init(
    State(state): State<AppState>,
    Extension(_tenant): Extension<TenantContext>,
    Json(body): Json<proto::SessionInitRequest>,
) -> Result<Json<proto::SessionInitResponse>, ApiError> {
    let res: proto::SessionInitResponse = state
        .enclave
        .call(
            &proto::EnclaveRequest::SessionInit(body),
            DEFAULT_CALL_TIMEOUT,
        )
        .await?;
    Ok(Json(res))
}

/// `POST /api/encryption/secure-session/generate-deks`: N attested
/// `GenerateDataKey` calls, an attested decrypt of the tenant master key,
/// then `session_prepare_dek` in the enclave. Any KMS failure fails the
/// whole batch: partial DEK state in a session is not recoverable.
pub async fn generate_deks(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<GenerateDeksRequest>,
) -> Result<Json<api::GenerateDeksResponse>, ApiError> {
    if body.count == 0 || body.count > api::MAX_DEK_COUNT {
        return Err(ApiError::bad_request(format!(
            "count must be between 1 and {}",
            api::MAX_DEK_COUNT
        )));
    }

    let attestation = state.enclave.attestation_document().await?;

    let tenant_config = state
        .dynamo
        .get_tenant(&tenant.tenant_id)
        .await?
        .ok_or_else(|| ApiError::not_found("tenant config not found"))?;

    let mut deks = Vec::with_capacity(body.count as usize);
    for _ in 0..body.count {
        let generated = state
            .kms
            .generate_data_key(&attestation, &tenant.tenant_id, PURPOSE_DATA_KEY)
            .await?;
        deks.push(proto::DekToPrepare {
            ciphertext_blob: B64.encode(&generated.ciphertext_blob),
            ciphertext_for_recipient: B64.encode(&generated.ciphertext_for_recipient),
        });
    }

    let wrapped_master_key = B64
        .decode(&tenant_config.wrapped_master_key)
        .map_err(|_| ApiError::internal("stored master key is not valid base64"))?;
    let master_for_recipient = state
        .kms
        .decrypt_for_recipient(
            &wrapped_master_key,
            &attestation,
            &tenant.tenant_id,
            PURPOSE_MASTER_KEY,
        )
        .await?;

    let request = proto::PrepareDekRequest {
        session_id: body.session_id,
        wrapped_master_key: B64.encode(master_for_recipient),
        deks,
    };
    let res: proto::PrepareDekResponse = state
        .enclave
        .call(
            &proto::EnclaveRequest::SessionPrepareDek(request),
            BATCH_CALL_TIMEOUT,
        )
        .await?;
    Ok(Json(res))
}

/// `POST /api/encryption/secure-session/unwrap`: per-item attested KMS
/// decrypt, then enclave re-seal. Item failures (here or in the enclave)
/// are reported per item and never abort the batch.
pub async fn unwrap_deks(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<UnwrapRequest>,
) -> Result<Json<api::UnwrapResponse>, ApiError> {
    let attestation = state.enclave.attestation_document().await?;

    // Items that fail broker-side keep their slot; survivors go to the
    // enclave and are merged back in input order.
    let mut results: Vec<Option<proto::SessionUnwrapItemResult>> =
        Vec::with_capacity(body.items.len());
    let mut surviving = Vec::new();

    for item in &body.items {
        match prepare_unwrap_item(&state, &tenant, &attestation, item).await {
            Ok(prepared) => {
                results.push(None);
                surviving.push(prepared);
            }
            Err(reason) => {
                warn!(object_id = %item.object_id, %reason, "unwrap item failed broker-side");
                results.push(Some(proto::SessionUnwrapItemResult {
                    object_id: item.object_id.clone(),
                    sealed_dek: String::new(),
                    nonce: String::new(),
                    success: false,
                    error: Some(reason),
                }));
            }
        }
    }

    let mut enclave_results = if surviving.is_empty() {
        Vec::new()
    } else {
        let request = proto::SessionUnwrapRequest {
            session_id: body.session_id,
            items: surviving,
        };
        state
            .enclave
            .call::<proto::SessionUnwrapResponse>(
                &proto::EnclaveRequest::SessionUnwrap(request),
                BATCH_CALL_TIMEOUT,
            )
            .await?
    }
    .into_iter();

    let merged: Vec<proto::SessionUnwrapItemResult> = results
        .into_iter()
        .map(|slot| match slot {
            Some(failure) => failure,
            None => enclave_results
                .next()
                .unwrap_or_else(|| proto::SessionUnwrapItemResult {
                    object_id: String::new(),
                    sealed_dek: String::new(),
                    nonce: String::new(),
                    success: false,
                    error: Some("enclave returned fewer results than requested".into()),
                }),
        })
        .collect();

    Ok(Json(merged))
}

async fn prepare_unwrap_item(
    state: &AppState,
    tenant: &TenantContext,
    attestation: &[u8],
    item: &proto::SessionUnwrapItem,
) -> std::result::Result<proto::SessionUnwrapItem, String> {
    if item.object_id.is_empty() {
        return Err("missing object_id".into());
    }
    if item.ciphertext.is_empty() {
        return Err("missing ciphertext".into());
    }
    let blob = B64
        .decode(&item.ciphertext)
        .map_err(|e| format!("invalid base64 ciphertext: {e}"))?;

    let for_recipient = state
        .kms
        .decrypt_for_recipient(&blob, attestation, &tenant.tenant_id, PURPOSE_DATA_KEY)
        .await
        .map_err(|e| format!("KMS decrypt failed: {e}"))?;

    Ok(proto::SessionUnwrapItem {
        object_id: item.object_id.clone(),
        ciphertext: B64.encode(for_recipient),
    })
}

/// `POST /api/encryption/decrypt`: legacy single-DEK unwrap.
pub async fn decrypt(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<proto::DecryptRequest>,
) -> Result<Json<proto::DecryptResponse>, ApiError> {
    let attestation = state.enclave.attestation_document().await?;

    let blob = B64
        .decode(&body.ciphertext)
        .map_err(|_| ApiError::bad_request("invalid ciphertext encoding"))?;
    let for_recipient = state
        .kms
        .decrypt_for_recipient(&blob, &attestation, &tenant.tenant_id, PURPOSE_DATA_KEY)
        .await?;

    let request = proto::DecryptRequest {
        ciphertext: B64.encode(for_recipient),
        client_ephemeral_public_key: body.client_ephemeral_public_key,
        nonce: body.nonce,
    };
    let res: proto::DecryptResponse = state
        .enclave
        .call(&proto::EnclaveRequest::Decrypt(request), DEFAULT_CALL_TIMEOUT)
        .await?;
    Ok(Json(res))
}
