//! The untrusted API service (broker).
//!
//! Enforces tenancy, performs attested KMS calls, forwards
//! plaintext-touching work to the enclave, and persists records. Wrapped
//! key blobs are opaque here; no plaintext key material ever enters this
//! process in recoverable form.

pub mod auth;
pub mod dynamo;
pub mod enclave_client;
pub mod handlers;
pub mod kms;
pub mod s3;
pub mod state;

pub use state::AppState;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{middleware, Json, Router};
use tower_http::trace::TraceLayer;

use crate::api::ErrorResponse;
use crate::error::Error;

/// HTTP error with a JSON `{error}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication failed")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        // 401 bodies stay deliberately uninformative.
        let message = match err {
            Error::Auth => "authentication failed".to_string(),
            other => other.to_string(),
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Builds the full `/api` router.
pub fn router(state: AppState) -> Router {
    let tenant_routes = Router::new()
        .route("/objects/table-hash", post(handlers::objects::table_hash))
        .route("/objects/{table_hash}", post(handlers::objects::create))
        .route("/objects/{table_hash}/{id}", get(handlers::objects::get))
        .route(
            "/objects/{table_hash}/{id}/upload-inline",
            put(handlers::objects::upload_inline),
        )
        .route(
            "/encryption/secure-session/init",
            post(handlers::encryption::session_init),
        )
        .route(
            "/encryption/secure-session/generate-deks",
            post(handlers::encryption::generate_deks),
        )
        .route(
            "/encryption/secure-session/unwrap",
            post(handlers::encryption::unwrap_deks),
        )
        .route("/encryption/decrypt", post(handlers::encryption::decrypt))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::tenant_auth,
        ));

    let api = Router::new()
        .route("/health", get(handlers::health::api))
        .route("/health/", get(handlers::health::api))
        .route("/health/enclave", get(handlers::health::enclave))
        .route("/health/storage", get(handlers::health::storage))
        .route("/health/kms", get(handlers::health::kms))
        .route("/tenants", post(handlers::tenants::create))
        .route("/tenants/", post(handlers::tenants::create))
        .merge(tenant_routes)
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_from_lib_error() {
        let err = ApiError::from(Error::NotFound("object missing".into()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = ApiError::from(Error::Auth);
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.message, "authentication failed");

        let err = ApiError::from(Error::Transient("kms".into()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
