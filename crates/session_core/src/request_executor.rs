use std::sync::Arc;

use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{error::RequestError, refresh_gate::TokenRefreshGate};

/// Status the backend uses to signal an expired short-lived credential.
pub const AUTH_EXPIRED_STATUS: StatusCode = StatusCode::UNAUTHORIZED;

/// A replayable description of an API call. Requests are rebuilt from this
/// on retry because a sent `reqwest::Request` cannot be reused.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, RequestError> {
        let body = serde_json::to_value(body)
            .map_err(|err| RequestError::InvalidRequest(err.to_string()))?;
        self.body = Some(body);
        Ok(self)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

/// Runs API calls with one transparent refresh-and-retry on auth expiry.
pub struct AuthenticatedExecutor {
    http: Client,
    server_url: String,
    gate: Arc<TokenRefreshGate>,
}

impl AuthenticatedExecutor {
    pub fn new(http: Client, server_url: impl Into<String>, gate: Arc<TokenRefreshGate>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            gate,
        }
    }

    /// Sends `request`; on an expired credential refreshes once and replays it.
    ///
    /// The replayed response is returned whatever its status, so a second
    /// expiry reaches the caller instead of triggering another refresh. When no
    /// fresh identity can be obtained the original expired response is returned.
    pub async fn request(&self, request: &ApiRequest) -> Result<Response, RequestError> {
        let response = self.send(request).await?;
        if response.status() != AUTH_EXPIRED_STATUS {
            return Ok(response);
        }

        debug!(
            method = %request.method,
            path = %request.path,
            "request: credential expired; refreshing"
        );
        match self.gate.ensure_fresh_token().await {
            Some(identity) => {
                info!(
                    method = %request.method,
                    path = %request.path,
                    user_id = %identity.id,
                    "request: replaying after refresh"
                );
                self.send(request).await
            }
            None => {
                info!(
                    method = %request.method,
                    path = %request.path,
                    "request: refresh unavailable; returning expired response"
                );
                Ok(response)
            }
        }
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
    ) -> Result<T, RequestError> {
        let response = self.request(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RequestError::Status(status));
        }
        Ok(response.json().await?)
    }

    async fn send(&self, request: &ApiRequest) -> Result<Response, RequestError> {
        let mut builder = self.http.request(
            request.method.clone(),
            format!("{}{}", self.server_url, request.path),
        );
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder.send().await?)
    }
}

#[cfg(test)]
#[path = "tests/request_executor_tests.rs"]
mod tests;
