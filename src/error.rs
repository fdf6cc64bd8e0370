use crate::ollama::GenerateError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::error;
use thiserror::Error;

/// Failures of a chat request that happen before any output is sent
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("msg not provided")]
    MissingMessage,

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("embedding failed: {0:#}")]
    Embedding(anyhow::Error),

    #[error("chunk search failed: {0:#}")]
    Retrieval(anyhow::Error),

    #[error(transparent)]
    Generation(#[from] GenerateError),
}

impl ChatError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatError::MissingMessage | ChatError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ChatError::Embedding(_) | ChatError::Retrieval(_) | ChatError::Generation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("chat request failed: {}", self);
        }
        (status, format!("error: {}", self)).into_response()
    }
}
