//! API error types with structured JSON responses.
//!
//! Failures before a caller key is resolved are answered in plaintext
//! (`{"error":{"code","message"}}`). Failures after that point are domain
//! errors, encrypted with the caller's key by the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::cipher::{self, SymmetricKey};
use crate::core_state::CoreError;
use crate::operations::DomainError;

/// Structured plaintext error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: u64 },
    #[error("Gateway disabled")]
    Disabled,
    #[error("Gateway shutting down")]
    Gone,
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Pairing request denied by device owner")]
    PairingDenied,
    #[error("Pairing approval timed out")]
    PairingTimeout,
    #[error("Pairing already pending: {0}")]
    PairingConflict(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "AUTH_REQUIRED",
                "Authentication required".to_string(),
            ),
            ApiError::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                format!("Rate limit exceeded. Retry after {retry_after}s"),
            ),
            ApiError::Disabled => (
                StatusCode::FORBIDDEN,
                "DISABLED",
                "Remote access is disabled on this device".to_string(),
            ),
            ApiError::Gone => (
                StatusCode::GONE,
                "SHUTTING_DOWN",
                "Server is shutting down".to_string(),
            ),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", detail.clone()),
            ApiError::PairingDenied => (
                StatusCode::FORBIDDEN,
                "PAIRING_DENIED",
                "Device owner denied the pairing request".to_string(),
            ),
            ApiError::PairingTimeout => (
                StatusCode::REQUEST_TIMEOUT,
                "PAIRING_TIMEOUT",
                "Pairing was not confirmed in time".to_string(),
            ),
            ApiError::PairingConflict(_) => (
                StatusCode::CONFLICT,
                "PAIRING_PENDING",
                "A pairing prompt is already open for this client".to_string(),
            ),
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after } = &self {
            if let Ok(val) = axum::http::HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("Retry-After", val);
            }
        }
        response
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<crate::db::DatabaseError> for ApiError {
    fn from(err: crate::db::DatabaseError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<cipher::CipherError> for ApiError {
    fn from(err: cipher::CipherError) -> Self {
        match err {
            cipher::CipherError::EncryptionFailed | cipher::CipherError::InvalidKeyLength(_) => {
                ApiError::Internal(err.to_string())
            }
            cipher::CipherError::DecryptionFailed | cipher::CipherError::InvalidEncoding => {
                ApiError::Unauthorized
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Encrypted responses
// ═══════════════════════════════════════════════════════════

/// GraphQL-style error payload returned inside an encrypted body.
#[derive(Debug, Serialize)]
pub struct DomainErrorBody {
    pub errors: Vec<DomainErrorEntry>,
}

#[derive(Debug, Serialize)]
pub struct DomainErrorEntry {
    pub message: String,
    pub path: Vec<String>,
}

impl DomainErrorBody {
    pub fn from_error(err: &DomainError, operation: Option<&str>) -> Self {
        let path = match err {
            DomainError::Failed { path, .. } if !path.is_empty() => path.clone(),
            _ => operation.map(|op| vec![op.to_string()]).unwrap_or_default(),
        };
        if let DomainError::Internal(detail) = err {
            tracing::error!(detail = %detail, "Operation internal error");
        }
        Self {
            errors: vec![DomainErrorEntry {
                message: err.public_message(),
                path,
            }],
        }
    }
}

/// Serialize `body`, encrypt it with `key` and answer `200` with the
/// base64 ciphertext as `text/plain`.
pub fn encrypted_response<T: Serialize>(key: &SymmetricKey, body: &T) -> Result<Response, ApiError> {
    let json = serde_json::to_vec(body).map_err(|e| ApiError::Internal(e.to_string()))?;
    let sealed = cipher::seal(key, &json)?;
    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        sealed,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn json_of(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn unauthorized_returns_401() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_of(response).await["error"]["code"], "AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn rate_limited_returns_429_with_retry_after() {
        let response = ApiError::RateLimited { retry_after: 60 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "60");
        assert_eq!(json_of(response).await["error"]["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn disabled_and_gone_statuses() {
        assert_eq!(ApiError::Disabled.into_response().status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::Gone.into_response().status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn internal_hides_details() {
        let response = ApiError::Internal("sqlite exploded".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_of(response).await["error"]["message"],
            "An internal error occurred"
        );
    }

    #[test]
    fn decrypt_failures_map_to_unauthorized() {
        assert!(matches!(
            ApiError::from(cipher::CipherError::DecryptionFailed),
            ApiError::Unauthorized
        ));
        assert!(matches!(
            ApiError::from(cipher::CipherError::InvalidEncoding),
            ApiError::Unauthorized
        ));
    }

    #[test]
    fn domain_error_body_uses_operation_path() {
        let body = DomainErrorBody::from_error(&DomainError::UnknownOperation("x".into()), Some("x"));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["errors"][0]["path"][0], "x");
        assert_eq!(json["errors"][0]["message"], "Unknown operation: x");
    }

    #[test]
    fn domain_internal_error_is_masked() {
        let body = DomainErrorBody::from_error(&DomainError::Internal("secret".into()), None);
        assert_eq!(body.errors[0].message, "Internal error");
        assert!(body.errors[0].path.is_empty());
    }

    #[tokio::test]
    async fn encrypted_response_round_trips() {
        let key = SymmetricKey::generate();
        let response = encrypted_response(&key, &serde_json::json!({"pong": true})).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        let plain = cipher::open(&key, &body).unwrap();
        assert_eq!(plain, br#"{"pong":true}"#);
    }
}
