use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use utoipa::ToSchema;

use crate::credentials::CredentialError;
use crate::repo::RepoError;
use crate::session::GuardError;
use crate::storage::ImageStoreError;

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("username already taken")] DuplicateUsername,
    #[error("invalid username or password")] InvalidCredentials,
    #[error("parent comment belongs to a different article")] InvalidParent,
    #[error("unauthorized")] Unauthorized,
    #[error("{0}")] BadRequest(String),
    #[error("internal error")] Internal,
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::NotFound,
            RepoError::Conflict => ApiError::Conflict,
            RepoError::InvalidParent => ApiError::InvalidParent,
            RepoError::ThreadTooDeep => ApiError::BadRequest("reply thread is too deep".into()),
            RepoError::Internal(msg) => {
                tracing::error!("repository failure: {msg}");
                ApiError::Internal
            }
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::DuplicateUsername => ApiError::DuplicateUsername,
            CredentialError::InvalidCredentials => ApiError::InvalidCredentials,
            CredentialError::Invalid(msg) => ApiError::BadRequest(msg.to_string()),
            CredentialError::Hash => {
                tracing::error!("password hashing failed");
                ApiError::Internal
            }
            CredentialError::Repo(e) => e.into(),
        }
    }
}

impl From<GuardError> for ApiError {
    fn from(_: GuardError) -> Self {
        ApiError::Unauthorized
    }
}

impl From<ImageStoreError> for ApiError {
    fn from(e: ImageStoreError) -> Self {
        match e {
            ImageStoreError::NotFound => ApiError::NotFound,
            ImageStoreError::Duplicate => ApiError::Conflict,
            ImageStoreError::Other(msg) => {
                tracing::error!("image store failure: {msg}");
                ApiError::Internal
            }
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict | ApiError::DuplicateUsername => StatusCode::CONFLICT,
            ApiError::InvalidCredentials | ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidParent => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ApiErrorBody { error: self.to_string() })
    }
}
