use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("auth server unavailable: {0}")]
    ServerUnavailable(String),
    #[error("refresh rejected with status {0}")]
    RefreshRejected(StatusCode),
    #[error("unexpected auth response: {0}")]
    UnexpectedResponse(String),
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("request failed with status {0}")]
    Status(StatusCode),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("realtime transport is closed")]
    Closed,
    #[error("failed to encode realtime frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid realtime url: {0}")]
    InvalidUrl(String),
}
