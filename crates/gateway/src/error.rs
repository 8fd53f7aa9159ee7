//! The error kinds surfaced at the API, with their HTTP mapping.
//!
//! Registry and allocator errors inside the supervisor are retried per
//! policy and only reach this type once retries are exhausted. Anything
//! uncategorized becomes `Internal` and is logged with a correlation id;
//! the id is returned to the caller so operators can find the log line.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use sb_meetings::{AdmitError, TransitionError};

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("{0}")]
    BadRequest(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("forbidden")]
    Forbidden,

    #[error("no active meeting for the given coordinates")]
    NotFound,

    #[error("an active meeting already exists for these coordinates")]
    Duplicate,

    #[error("concurrency limit reached")]
    LimitReached,

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::AuthRequired => "auth_required",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Duplicate => "duplicate",
            Self::LimitReached => "limit_reached",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Duplicate => StatusCode::CONFLICT,
            Self::LimitReached => StatusCode::TOO_MANY_REQUESTS,
            Self::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = if let Self::Internal(detail) = &self {
            let correlation_id = Uuid::new_v4();
            tracing::error!(%correlation_id, detail = %detail, "internal error");
            serde_json::json!({
                "error": {
                    "code": self.code(),
                    "message": "internal error",
                    "correlation_id": correlation_id,
                }
            })
        } else {
            serde_json::json!({
                "error": { "code": self.code(), "message": self.to_string() }
            })
        };
        (status, Json(body)).into_response()
    }
}

impl From<AdmitError> for ControlError {
    fn from(e: AdmitError) -> Self {
        match e {
            AdmitError::Duplicate => Self::Duplicate,
            AdmitError::LimitReached => Self::LimitReached,
        }
    }
}

impl From<TransitionError> for ControlError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::NotFound => Self::NotFound,
            TransitionError::Invalid { from, to } => {
                Self::PreconditionFailed(format!("transition {from} -> {to} is not permitted"))
            }
        }
    }
}

impl From<sb_domain::Error> for ControlError {
    fn from(e: sb_domain::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ControlError::Duplicate.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ControlError::LimitReached.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ControlError::PreconditionFailed("x".into()).status(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            ControlError::Unavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ControlError::NotFound.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn admit_errors_map_to_api_kinds() {
        assert!(matches!(
            ControlError::from(AdmitError::Duplicate),
            ControlError::Duplicate
        ));
        assert!(matches!(
            ControlError::from(AdmitError::LimitReached),
            ControlError::LimitReached
        ));
    }
}
