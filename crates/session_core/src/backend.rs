use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use shared::protocol::{Identity, LoginRequest, UserEnvelope};
use tracing::{debug, warn};

use crate::error::AuthError;

pub const LOGIN_ROUTE: &str = "/auth/login";
pub const REFRESH_ROUTE: &str = "/auth/refresh-token";
pub const LOGOUT_ROUTE: &str = "/auth/logout";

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The three auth round trips the session core needs from the backend.
///
/// Durable session proof travels out of band (cookies on the shared HTTP
/// client), so none of these take or return tokens.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<Identity, AuthError>;
    async fn refresh(&self) -> Result<Identity, AuthError>;
    async fn logout(&self) -> Result<(), AuthError>;
}

pub struct HttpAuthBackend {
    http: Client,
    server_url: String,
}

impl HttpAuthBackend {
    /// `http` must share its cookie jar with the request executor.
    pub fn new(http: Client, server_url: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, route: &str) -> String {
        format!("{}{route}", self.server_url)
    }
}

fn unavailable(err: reqwest::Error) -> AuthError {
    AuthError::ServerUnavailable(err.to_string())
}

async fn read_identity(response: Response) -> Result<Identity, AuthError> {
    let body: UserEnvelope = response
        .json()
        .await
        .map_err(|err| AuthError::UnexpectedResponse(err.to_string()))?;
    Ok(body.user)
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        let response = self
            .http
            .post(self.endpoint(LOGIN_ROUTE))
            .json(&LoginRequest {
                email: credentials.email.clone(),
                password: credentials.password.clone(),
            })
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if status.is_success() {
            return read_identity(response).await;
        }
        match status {
            StatusCode::BAD_REQUEST
            | StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::NOT_FOUND => Err(AuthError::InvalidCredentials),
            status if status.is_server_error() => {
                Err(AuthError::ServerUnavailable(format!("status {status}")))
            }
            status => Err(AuthError::UnexpectedResponse(format!("status {status}"))),
        }
    }

    async fn refresh(&self) -> Result<Identity, AuthError> {
        let response = self
            .http
            .post(self.endpoint(REFRESH_ROUTE))
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            debug!(%status, "auth: refresh rejected");
            return Err(AuthError::RefreshRejected(status));
        }
        read_identity(response).await
    }

    async fn logout(&self) -> Result<(), AuthError> {
        let response = self
            .http
            .post(self.endpoint(LOGOUT_ROUTE))
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "auth: logout rejected by server");
            return Err(AuthError::UnexpectedResponse(format!("status {status}")));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
