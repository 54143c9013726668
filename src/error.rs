//! Error handler for enlist.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::account::{InvariantViolation, RepositoryError};
use crate::crypto::CryptoError;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Field-attributable failure, conflicts included.
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("resource not found")]
    NotFound,

    #[error("storage failure: {0}")]
    Storage(RepositoryError),

    #[error("encoding failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

impl From<RepositoryError> for ServerError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => ServerError::NotFound,
            RepositoryError::Invariant(err) => ServerError::Invariant(err),
            err => ServerError::Storage(err),
        }
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    let mut fields: Vec<FieldError> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| issue.code.to_string()),
            })
        })
        .collect();
    fields.sort_by(|a, b| a.field.cmp(&b.field));
    fields
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = match &self {
            ServerError::Validation(validation_errors) => {
                ResponseError::default()
                    .title("There were validation errors with your request.")
                    .details(&self.to_string())
                    .status(StatusCode::UNPROCESSABLE_ENTITY)
                    .errors(validation_errors)
            },

            ServerError::Axum(rejection) => ResponseError::default()
                .title("Request body is malformed.")
                .details(&rejection.body_text())
                .status(StatusCode::BAD_REQUEST),

            ServerError::NotFound => ResponseError::default()
                .title("The requested resource could not be found.")
                .status(StatusCode::NOT_FOUND),

            ServerError::Storage(_)
            | ServerError::Crypto(_)
            | ServerError::Invariant(_) => {
                tracing::error!(error = %self, "server returned 500 status");

                ResponseError::default()
            },
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use validator::ValidationError;

    async fn body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_validation_response() {
        let mut errors = ValidationErrors::new();
        errors.add(
            "email",
            ValidationError::new("conflict")
                .with_message("a user with this email address already exists".into()),
        );

        let response = ServerError::from(errors).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = body(response).await;
        assert_eq!(body["errors"][0]["field"], "email");
        assert_eq!(
            body["errors"][0]["message"],
            "a user with this email address already exists"
        );
    }

    #[tokio::test]
    async fn test_internal_response_is_opaque() {
        let response = ServerError::from(RepositoryError::Timeout(
            std::time::Duration::from_secs(30),
        ))
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body(response).await;
        assert_eq!(body["title"], "Internal server error.");
        assert_eq!(body["detail"], "");
    }

    #[tokio::test]
    async fn test_invariant_response() {
        let err = ServerError::from(RepositoryError::Invariant(InvariantViolation(
            "missing password hash for account",
        )));
        assert!(matches!(err, ServerError::Invariant(_)));

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body(response).await;
        assert_eq!(body["title"], "Internal server error.");
        assert!(body["errors"].is_null());
    }

    #[test]
    fn test_repository_error_mapping() {
        assert!(matches!(
            ServerError::from(RepositoryError::NotFound),
            ServerError::NotFound
        ));
        assert!(matches!(
            ServerError::from(RepositoryError::Conflict),
            ServerError::Storage(RepositoryError::Conflict)
        ));
    }
}
