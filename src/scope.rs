//! # Request Scope
//!
//! Every management endpoint works inside one tenant/project pair taken from
//! the `X-Tenant-Id` and `X-Project-Id` headers.

use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, request::Parts};
use serde::{Deserialize, Serialize};
use utoipa::IntoParams;
use uuid::Uuid;

use crate::directory::Scope;
use crate::error::{ApiError, validation_error};

pub const TENANT_HEADER: &str = "X-Tenant-Id";
pub const PROJECT_HEADER: &str = "X-Project-Id";

/// Extracted tenant/project scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestScope(pub Scope);

/// OpenAPI header parameters for the scope headers
#[derive(Debug, Serialize, Deserialize, IntoParams)]
#[into_params(parameter_in = Header)]
pub struct ScopeHeaders {
    /// Tenant identifier (UUID)
    #[serde(rename = "X-Tenant-Id")]
    #[param(rename = "X-Tenant-Id", value_type = String)]
    pub tenant_id: String,
    /// Project identifier (UUID) within the tenant
    #[serde(rename = "X-Project-Id")]
    #[param(rename = "X-Project-Id", value_type = String)]
    pub project_id: String,
}

fn header_uuid(headers: &HeaderMap, name: &'static str) -> Result<Uuid, ApiError> {
    let value = headers
        .get(name)
        .ok_or_else(|| validation_error("Missing scope header", serde_json::json!({ name: "Header is required" })))?;
    let value = value
        .to_str()
        .map_err(|_| validation_error("Invalid scope header", serde_json::json!({ name: "Header must be ASCII" })))?;
    Uuid::parse_str(value.trim())
        .map_err(|_| validation_error("Invalid scope header", serde_json::json!({ name: "Must be a valid UUID" })))
}

pub fn scope_from_headers(headers: &HeaderMap) -> Result<Scope, ApiError> {
    let tenant_id = header_uuid(headers, TENANT_HEADER)?;
    let project_id = header_uuid(headers, PROJECT_HEADER)?;
    Ok(Scope::new(tenant_id, project_id))
}

impl<S> FromRequestParts<S> for RequestScope
where
    S: Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        scope_from_headers(&parts.headers).map(RequestScope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, StatusCode};

    #[test]
    fn both_headers_are_required() {
        let tenant = Uuid::new_v4();
        let project = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_str(&tenant.to_string()).unwrap());

        let err = scope_from_headers(&headers).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.details.as_deref().unwrap()[PROJECT_HEADER], "Header is required");

        headers.insert(PROJECT_HEADER, HeaderValue::from_str(&project.to_string()).unwrap());
        assert_eq!(scope_from_headers(&headers).unwrap(), Scope::new(tenant, project));
    }

    #[test]
    fn rejects_non_uuid_values() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("acme"));
        headers.insert(PROJECT_HEADER, HeaderValue::from_static("hr"));
        let err = scope_from_headers(&headers).unwrap_err();
        assert_eq!(err.details.as_deref().unwrap()[TENANT_HEADER], "Must be a valid UUID");
    }
}
