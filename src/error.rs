use actix_web::http::{header, StatusCode};
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use tracing::error;

use crate::backend::BackendError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Workspace URL is already taken")]
    SlugTaken,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Backend(String),
    #[error("Failed at batch {failed_batch}: saved {committed} of {total} chunks ({reason})")]
    PartialCommit {
        failed_batch: usize,
        committed: usize,
        total: usize,
        reason: String,
    },
    #[error("redirecting to {0}")]
    Redirect(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { collection, id } => {
                AppError::NotFound(format!("{}/{}", collection, id))
            }
            StoreError::AlreadyExists { collection, id } => {
                AppError::Conflict(format!("{}/{} already exists", collection, id))
            }
            other => AppError::Store(other),
        }
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        AppError::Backend(err.to_string())
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::SlugTaken | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Backend(_) | AppError::PartialCommit { .. } => StatusCode::BAD_GATEWAY,
            AppError::Redirect(_) => StatusCode::TEMPORARY_REDIRECT,
            AppError::Store(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let AppError::Redirect(location) = self {
            return HttpResponse::TemporaryRedirect()
                .insert_header((header::LOCATION, location.as_str()))
                .finish();
        }

        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        // Internal details stay in the logs.
        let message = match self {
            AppError::Store(_) | AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let mut body = json!({ "success": false, "error": message });
        if let AppError::PartialCommit {
            failed_batch,
            committed,
            total,
            ..
        } = self
        {
            body["failedBatch"] = json!(failed_batch);
            body["committed"] = json!(committed);
            body["total"] = json!(total);
        }

        HttpResponse::build(status).json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Collection;

    #[test]
    fn slug_taken_maps_to_conflict_with_message() {
        let err = AppError::SlugTaken;
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "Workspace URL is already taken");
    }

    #[test]
    fn store_not_found_becomes_404() {
        let err: AppError = StoreError::NotFound {
            collection: Collection::Agents,
            id: "a1".into(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn redirect_sets_location() {
        let response = AppError::Redirect("/w/acme/agents".into()).error_response();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/w/acme/agents"
        );
    }
}
