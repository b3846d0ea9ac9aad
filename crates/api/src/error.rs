//! Unified error handling with Sentry integration.
//!
//! Every handler returns `Result<T, AppError>`. Server-side failures are
//! captured to Sentry before the response is built; clients get a JSON body
//! `{"error": "..."}` that never includes SQL or provider payloads.

use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::db::RepositoryError;
use crate::gateway::webhook::WebhookError;
use crate::middleware::auth::AuthError;
use crate::services::LifecycleError;

/// Application-level error type for the API.
#[derive(Debug, Error)]
pub enum AppError {
    /// Order lifecycle operation failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Direct store access failed (carts, listings).
    #[error("Database error: {0}")]
    Database(#[from] RepositoryError),

    /// Authentication or authorization failed.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Webhook could not be verified or parsed.
    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request from client.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Lifecycle(err) => match err {
                LifecycleError::Validation(_)
                | LifecycleError::InvalidTransition(_)
                | LifecycleError::GatewayRejected
                | LifecycleError::CaptureNotCompleted(_) => StatusCode::BAD_REQUEST,
                LifecycleError::Auth(_) => StatusCode::FORBIDDEN,
                LifecycleError::NotFound => StatusCode::NOT_FOUND,
                LifecycleError::Conflict(_) => StatusCode::CONFLICT,
                LifecycleError::GatewayUnavailable => StatusCode::BAD_GATEWAY,
                LifecycleError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Database(err) => match err {
                RepositoryError::NotFound => StatusCode::NOT_FOUND,
                RepositoryError::Conflict(_) => StatusCode::CONFLICT,
                RepositoryError::Validation(_) | RepositoryError::InvalidTransition(_) => {
                    StatusCode::BAD_REQUEST
                }
                RepositoryError::Database(_) | RepositoryError::DataCorruption(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Auth(err) => match err {
                AuthError::MissingCredential
                | AuthError::InvalidCredential
                | AuthError::Expired => StatusCode::UNAUTHORIZED,
                AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
                AuthError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Webhook(err) => match err {
                WebhookError::NotConfigured | WebhookError::InvalidSignature(_) => {
                    StatusCode::UNAUTHORIZED
                }
                WebhookError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            },
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message shown to the client.
    fn public_message(&self) -> String {
        match self {
            Self::Lifecycle(LifecycleError::Persistence(_))
            | Self::Database(RepositoryError::Database(_) | RepositoryError::DataCorruption(_))
            | Self::Auth(AuthError::Store(_))
            | Self::Internal(_) => "Internal server error".to_string(),
            Self::Lifecycle(err) => err.to_string(),
            Self::Database(RepositoryError::NotFound) => "Not found".to_string(),
            Self::Database(err) => err.to_string(),
            Self::Auth(err) => err.to_string(),
            Self::Webhook(WebhookError::InvalidPayload(_)) => "Invalid webhook payload".to_string(),
            Self::Webhook(_) => "Invalid webhook signature".to_string(),
            Self::NotFound(what) => format!("{what} not found"),
            Self::BadRequest(message) => message.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Capture server errors to Sentry
        if status.is_server_error() {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Request error"
            );
        } else if matches!(self, Self::Webhook(_)) {
            tracing::warn!(error = %self, "Rejected webhook");
        }

        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// Result type alias for `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;

/// Set the Sentry user context from a user ID.
///
/// Call this after successful authentication to associate errors with users.
pub fn set_sentry_user(user_id: &impl ToString, email: Option<&str>) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            email: email.map(String::from),
            ..Default::default()
        }));
    });
}
