//! Error taxonomy shared by the stores, the command gateway, and ingestion.
//!
//! "No data yet" is not an error anywhere in the hub: empty queries come back
//! as `None` or an empty list.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or missing caller input. Never retried.
    #[error("{0}")]
    Validation(String),

    /// A storage operation failed or timed out. Not retried automatically,
    /// since a replayed reading insert would duplicate the sample.
    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Error::Validation(msg) => msg.clone(),
            Error::Persistence(e) => {
                tracing::error!("request failed: {e}");
                "Database error".to_string()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
