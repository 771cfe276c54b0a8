//! HTTP error types for the Meridian API facade.
//!
//! Maps domain errors from `meridian-core` and `meridian-storage` into the
//! `{error, code, details, timestamp}` envelope from `spec.md` §6. Every
//! downstream taxonomy gets exactly one `From` impl here; this is the only
//! place in the workspace that converts an error into an HTTP status code.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Serialize;

use meridian_core::error::{CoordinatorError, HealthError, ProxyError, ReconcileError, RuntimeError};
use meridian_storage::StoreError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Client sent invalid input or an app spec failed validation.
    BadRequest(String),
    /// Requested app/instance/resource not found.
    NotFound(String),
    /// Uniqueness or state conflict (already registered, scaling in progress).
    Conflict(String),
    /// This node does not hold the leader lease; writes must go to the leader.
    NotLeader { known_leader_api_url: Option<String> },
    /// The cluster has no node currently holding a valid lease.
    ClusterNotReady,
    /// A downstream dependency (store, runtime, proxy) is unavailable.
    Unavailable(String),
    /// Unexpected internal failure.
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
    details: String,
    timestamp: chrono::DateTime<Utc>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let now = Utc::now();
        let (status, code, details, leader_header) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "INVALID", msg, None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg, None),
            Self::NotLeader { known_leader_api_url } => {
                let details = known_leader_api_url
                    .clone()
                    .map(|url| format!("this node is not the leader; current leader is at {url}"))
                    .unwrap_or_else(|| "this node is not the leader".to_owned());
                (StatusCode::SERVICE_UNAVAILABLE, "NOT_LEADER", details, known_leader_api_url)
            }
            Self::ClusterNotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CLUSTER_NOT_READY",
                "no node currently holds a valid leader lease".to_owned(),
                None,
            ),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg, None),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg, None),
        };

        let body = ErrorBody {
            error: status.canonical_reason().unwrap_or("error").to_owned(),
            code,
            details,
            timestamp: now,
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(leader_url) = leader_header {
            if let Ok(value) = HeaderValue::from_str(&leader_url) {
                response.headers_mut().insert("X-Meridian-Leader", value);
            }
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { what } => Self::NotFound(what),
            StoreError::Conflict { reason } => Self::Conflict(reason),
            StoreError::Invalid { reason } => Self::BadRequest(reason),
            StoreError::Unavailable { reason } => Self::Unavailable(reason),
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::StoreUnavailable(msg) => Self::Unavailable(msg),
            CoordinatorError::LostLeadership(_) => Self::NotLeader { known_leader_api_url: None },
            CoordinatorError::Invalid(msg) => Self::BadRequest(msg),
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => Self::Unavailable(msg),
            RuntimeError::NotFound(msg) => Self::NotFound(msg),
            RuntimeError::ResourceExhausted(msg) | RuntimeError::Invalid(msg) => Self::BadRequest(msg),
        }
    }
}

impl From<HealthError> for ApiError {
    fn from(err: HealthError) -> Self {
        match err {
            HealthError::StoreUnavailable(msg) => Self::Unavailable(msg),
            HealthError::Timeout => Self::Unavailable("health probe timed out".to_owned()),
            HealthError::ConnectionRefused | HealthError::Dns(_) => Self::Unavailable(err.to_string()),
            HealthError::StatusMismatch(_) | HealthError::ContentMismatch => {
                Self::BadRequest(err.to_string())
            }
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::StoreUnavailable(msg)
            | ReconcileError::RuntimeUnavailable(msg)
            | ReconcileError::ProxyUnavailable(msg) => Self::Unavailable(msg),
            ReconcileError::NotFound(msg) => Self::NotFound(msg),
            ReconcileError::Conflict(msg) => Self::Conflict(msg),
            ReconcileError::Invalid(msg) => Self::BadRequest(msg),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err: ApiError = StoreError::NotFound { what: "app alpha".to_owned() }.into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unavailable_maps_to_503() {
        let err: ApiError = StoreError::Unavailable { reason: "db down".to_owned() }.into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn not_leader_carries_known_leader_header() {
        let err = ApiError::NotLeader { known_leader_api_url: Some("http://node-b:7700".to_owned()) };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("X-Meridian-Leader").unwrap(),
            "http://node-b:7700"
        );
    }
}
