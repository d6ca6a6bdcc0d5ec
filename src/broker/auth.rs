//! Tenant authentication middleware.
//!
//! Requires `X-Tenant-ID` and `X-API-Key` on every tenant-scoped route.
//! The 401 message never distinguishes an unknown tenant from a wrong key.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::broker::{ApiError, AppState};

pub const TENANT_HEADER: &str = "X-Tenant-ID";
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Authenticated tenant identity, injected into request extensions.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
    pub permissions: Vec<String>,
}

/// Tenant ids are `^[a-z0-9-]{3,64}$`.
pub fn valid_tenant_id(tenant_id: &str) -> bool {
    (3..=64).contains(&tenant_id.len())
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub async fn tenant_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let tenant_id = header_value(&request, TENANT_HEADER)
        .ok_or_else(|| ApiError::bad_request("X-Tenant-ID header is required"))?;
    if !valid_tenant_id(&tenant_id) {
        return Err(ApiError::bad_request("invalid X-Tenant-ID header"));
    }
    let api_key = header_value(&request, API_KEY_HEADER)
        .ok_or_else(|| ApiError::bad_request("X-API-Key header is required"))?;

    let record = state
        .dynamo
        .find_api_key(&tenant_id, &api_key)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(ApiError::unauthorized)?;

    request.extensions_mut().insert(TenantContext {
        tenant_id,
        permissions: record.permissions,
    });

    Ok(next.run(request).await)
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_validation() {
        assert!(valid_tenant_id("abc"));
        assert!(valid_tenant_id("a1b2-c3"));
        assert!(valid_tenant_id(
            "0b5efa90-3c9f-4f9a-9f0e-2f8f3a7e4d21"
        ));
        assert!(!valid_tenant_id("ab")); // too short
        assert!(!valid_tenant_id(&"a".repeat(65))); // too long
        assert!(!valid_tenant_id("ABC-def")); // uppercase
        assert!(!valid_tenant_id("a_b_c")); // underscore
        assert!(!valid_tenant_id("tenant id")); // space
    }
}
