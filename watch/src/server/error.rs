use crate::aggregation::Error as AggregationError;
use crate::database::Error as DbError;
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::io::Error as IoError;

#[derive(Debug)]
pub enum Error {
    Io(IoError),
    Database(DbError),
    Aggregation(AggregationError),
    Updater(crate::updater::Error),
    BadRequest(String),
    NotFound,
    Other(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (status, error_message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound => (StatusCode::NOT_FOUND, "Not Found".to_string()),
            Self::Aggregation(AggregationError::InvalidRange(message)) => {
                (StatusCode::BAD_REQUEST, message)
            }
            Self::Aggregation(
                e @ (AggregationError::MissingBlockRewards { .. }
                | AggregationError::MissingBalance { .. }),
            ) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Rewards cannot be computed yet: {:?}", e),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error".to_string(),
            ),
        };
        (status, Json(json!({ "error": error_message }))).into_response()
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<DbError> for Error {
    fn from(e: DbError) -> Self {
        Error::Database(e)
    }
}

impl From<AggregationError> for Error {
    fn from(e: AggregationError) -> Self {
        Error::Aggregation(e)
    }
}

impl From<crate::updater::Error> for Error {
    fn from(e: crate::updater::Error) -> Self {
        Error::Updater(e)
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}
