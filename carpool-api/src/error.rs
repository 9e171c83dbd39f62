use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use carpool_core::CoreError;
use serde_json::json;

#[derive(Debug)]
pub enum AppError {
    AuthenticationError(String),
    AuthorizationError(String),
    ValidationError(String),
    RateLimited,
    Anyhow(anyhow::Error),
}

/// HTTP status for a domain failure.
pub fn core_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::AlreadyReserved(_)
        | CoreError::CarFull(_)
        | CoreError::AlreadyVoted { .. }
        | CoreError::NotTemporary(_)
        | CoreError::NotConfirmed(_)
        | CoreError::NotCancellable(_)
        | CoreError::NoPendingVotes { .. } => StatusCode::CONFLICT,
        CoreError::PaymentMissing(_) => StatusCode::PAYMENT_REQUIRED,
        CoreError::Forbidden { .. } => StatusCode::FORBIDDEN,
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::Contention(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Integrity(_) | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn core_response(err: &CoreError) -> Response {
    let status = core_status(err);
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(code = err.code(), "Internal Server Error: {}", err);
        "Internal Server Error".to_string()
    } else {
        if err.is_retryable() {
            tracing::warn!("Contention persisted after retries: {}", err);
        }
        err.to_string()
    };

    (status, Json(json!({ "error": message, "code": err.code() }))).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", msg),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "VALIDATION", msg),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "Rate limit exceeded".to_string(),
            ),
            AppError::Anyhow(err) => {
                if let Some(core) = err.downcast_ref::<CoreError>() {
                    return core_response(core);
                }
                tracing::error!("Internal Server Error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Anyhow(err.into())
    }
}

impl AppError {
    /// The domain error behind this response, if any.
    pub fn as_core(&self) -> Option<&CoreError> {
        match self {
            AppError::Anyhow(err) => err.downcast_ref::<CoreError>(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_domain_errors_map_to_statuses() {
        let car_id = Uuid::new_v4();
        let err: AppError = CoreError::CarFull(car_id).into();
        assert_eq!(err.as_core(), Some(&CoreError::CarFull(car_id)));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let err: AppError = CoreError::not_found("car", car_id).into();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err: AppError = CoreError::Contention("lock timeout".to_string()).into();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);

        let err: AppError = CoreError::PaymentMissing(car_id).into();
        assert_eq!(err.into_response().status(), StatusCode::PAYMENT_REQUIRED);

        assert_eq!(AppError::RateLimited.into_response().status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
