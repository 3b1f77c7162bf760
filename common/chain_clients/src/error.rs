use crate::sensitive_url::SensitiveError;
use reqwest::StatusCode;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// The `reqwest` client raised an error which is not considered transient.
    HttpClient(reqwest::Error),
    /// The server kept answering with a non-OK status until the retry budget ran out.
    StatusCode(StatusCode),
    /// The server kept rate limiting requests until the retry budget ran out.
    RateLimited,
    /// The server could not be reached until the retry budget ran out.
    Unreachable(reqwest::Error),
    /// The request could not be cloned for a retry (e.g. it has a streaming body).
    RequestNotCloneable,
    /// A JSON-RPC server replied with an error object.
    ServerMessage { code: i64, message: String },
    /// The requested resource does not exist (HTTP 404 or a `null` JSON-RPC result).
    NotFound(String),
    /// The response could be decoded but violates an expectation of the caller.
    InvalidResponse(String),
    /// The response could not be decoded.
    InvalidJson(serde_json::Error),
    /// A value does not fit into the integer type used to represent it.
    Overflow(String),
    InvalidUrl(SensitiveError),
}

impl Error {
    /// Returns `true` if the error represents a resource that does not exist, as opposed to a
    /// failure to retrieve it.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::HttpClient(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidJson(e)
    }
}

impl From<SensitiveError> for Error {
    fn from(e: SensitiveError) -> Self {
        Error::InvalidUrl(e)
    }
}
