//! Object lifecycle endpoints: table-hash resolution, creation, inline
//! upload and retrieval.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use uuid::Uuid;

use crate::api::{
    CreateObjectRequest, CreateObjectResponse, GetObjectResponse, MessageResponse,
    TableHashRequest, TableHashResponse,
};
use crate::broker::auth::TenantContext;
use crate::broker::enclave_client::DEFAULT_CALL_TIMEOUT;
use crate::broker::kms::PURPOSE_TABLE_SALT;
use crate::broker::{ApiError, AppState};
use crate::models::{self, ObjectRecord, ObjectStatus, Sensitivity, INLINE_BLOB_LIMIT};
use crate::proto;

/// `POST /api/objects/table-hash`: resolves a session-sealed table name
/// to its opaque hash. The salt is decrypted by KMS for the enclave only.
pub async fn table_hash(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<TableHashRequest>,
) -> Result<Json<TableHashResponse>, ApiError> {
    let tenant_config = state
        .dynamo
        .get_tenant(&tenant.tenant_id)
        .await?
        .ok_or_else(|| ApiError::not_found("tenant config not found"))?;

    let attestation = state.enclave.attestation_document().await?;

    let wrapped_salt = B64
        .decode(&tenant_config.wrapped_table_salt)
        .map_err(|_| ApiError::internal("stored table salt is not valid base64"))?;
    let salt_for_recipient = state
        .kms
        .decrypt_for_recipient(
            &wrapped_salt,
            &attestation,
            &tenant.tenant_id,
            PURPOSE_TABLE_SALT,
        )
        .await?;

    let request = proto::TableHashRequest {
        session_id: body.session_id,
        session_encrypted_table_name: body.encrypted_table_name,
        session_table_name_nonce: body.table_name_nonce,
        table_salt: B64.encode(salt_for_recipient),
    };
    let res: proto::TableHashResponse = state
        .enclave
        .call(
            &proto::EnclaveRequest::SessionGenerateTableHash(request),
            DEFAULT_CALL_TIMEOUT,
        )
        .await?;

    Ok(Json(TableHashResponse {
        table_hash: res.table_hash,
    }))
}

/// `POST /api/objects/{table_hash}`: creates a pending object record and
/// hands back an upload URL: presigned S3 PUT above the inline limit,
/// inline endpoint below it.
pub async fn create(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Path(table_hash): Path<String>,
    Json(body): Json<CreateObjectRequest>,
) -> Result<(StatusCode, Json<CreateObjectResponse>), ApiError> {
    let sensitivity = match body.sensitivity.as_deref() {
        None | Some("") => Sensitivity::Low,
        Some(value) => Sensitivity::parse(value).map_err(ApiError::from)?,
    };

    let object_id = Uuid::new_v4().to_string();
    let presign_ttl = state.config.presign_ttl;
    let ttl = (chrono::Utc::now() + chrono::Duration::seconds(presign_ttl.as_secs() as i64))
        .timestamp();

    let mut object = ObjectRecord::new(
        &tenant.tenant_id,
        &table_hash,
        &object_id,
        body.encrypted_dek,
        body.master_encrypted_dek,
        body.dek_nonce,
        sensitivity,
        ttl,
    );

    let upload_url = if body.blob_size as usize > INLINE_BLOB_LIMIT {
        let s3_key = models::s3_object_key(&tenant.tenant_id, &table_hash, &object_id, 1);
        object.s3_key = s3_key.clone();
        state.s3.presign_put(&s3_key, presign_ttl).await?
    } else {
        format!(
            "{}/objects/{}/{}/upload-inline",
            state.config.base_url, table_hash, object_id
        )
    };

    state
        .dynamo
        .create_object_with_indexes(
            &tenant.tenant_id,
            &object,
            &body.indexes.unwrap_or_default(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateObjectResponse {
            object_id,
            upload_url,
            expires_in_seconds: presign_ttl.as_secs() as i64,
            created_at: object.created_at,
        }),
    ))
}

/// `PUT /api/objects/{table_hash}/{id}/upload-inline`: stores a blob of
/// at most 100 KiB inline and flips the record to `ready`.
pub async fn upload_inline(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Path((table_hash, object_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<MessageResponse>, ApiError> {
    if body.len() > INLINE_BLOB_LIMIT {
        return Err(ApiError::bad_request(format!(
            "inline blob exceeds the {INLINE_BLOB_LIMIT} byte limit"
        )));
    }

    let object = state
        .dynamo
        .get_object(&tenant.tenant_id, &table_hash, &object_id)
        .await?
        .ok_or_else(|| ApiError::not_found("object not found"))?;

    if !object.s3_key.is_empty() || !object.encrypted_blob.is_empty() {
        return Err(ApiError::bad_request(
            "object is not eligible for inline upload",
        ));
    }

    state
        .dynamo
        .update_object_inline_blob(&tenant.tenant_id, &table_hash, &object_id, &B64.encode(&body))
        .await?;

    Ok(Json(MessageResponse {
        message: "inline blob uploaded".into(),
    }))
}

/// `GET /api/objects/{table_hash}/{id}`: returns the inline blob or a
/// presigned GET URL, plus both wrapped DEKs and the payload nonce.
pub async fn get(
    State(state): State<AppState>,
    Extension(tenant): Extension<TenantContext>,
    Path((table_hash, object_id)): Path<(String, String)>,
) -> Result<Json<GetObjectResponse>, ApiError> {
    let object = state
        .dynamo
        .get_object(&tenant.tenant_id, &table_hash, &object_id)
        .await?
        .ok_or_else(|| ApiError::not_found("object not found"))?;

    if object.status != ObjectStatus::Ready {
        return Err(ApiError::bad_request("object is not in ready status"));
    }

    let get_url = if object.s3_key.is_empty() {
        String::new()
    } else {
        state
            .s3
            .presign_get(&object.s3_key, state.config.presign_ttl)
            .await?
    };

    Ok(Json(GetObjectResponse {
        object_id,
        get_url,
        encrypted_blob: object.encrypted_blob,
        kms_wrapped_dek: object.kms_wrapped_dek,
        master_wrapped_dek: object.master_wrapped_dek,
        dek_nonce: object.dek_nonce,
        created_at: object.created_at,
        updated_at: object.updated_at,
        version: object.version,
    }))
}
