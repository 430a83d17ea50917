use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    Json,
};
use chrono::Utc;
use shared::{
    domain::UserId,
    error::{ApiError, ApiException, ErrorCode},
    protocol::{Identity, LoginRequest, UserEnvelope},
};
use tracing::{info, warn};

use crate::{
    app_state::AppState,
    tokens::{mint_token, verify_token, TokenKind},
};

pub const ACCESS_COOKIE: &str = "access_token";
pub const REFRESH_COOKIE: &str = "refresh_token";

pub(crate) type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::SessionExpired | ErrorCode::InvalidCredentials => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn reject(err: ApiException) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err.into()))
}

fn session_expired(message: &str) -> ApiException {
    ApiException::new(ErrorCode::SessionExpired, message)
}

fn internal(err: impl std::fmt::Display) -> ApiException {
    ApiException::new(ErrorCode::Internal, err.to_string())
}

pub(crate) fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

pub(crate) fn session_cookie(name: &str, value: &str, max_age: i64, secure: bool) -> String {
    let mut cookie =
        format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn append_cookie(headers: &mut HeaderMap, cookie: String) -> Result<(), ApiException> {
    let value = HeaderValue::from_str(&cookie).map_err(internal)?;
    headers.append(header::SET_COOKIE, value);
    Ok(())
}

fn issue_cookie(
    state: &AppState,
    headers: &mut HeaderMap,
    identity: &Identity,
    kind: TokenKind,
) -> Result<(), ApiException> {
    let (token, _) = mint_token(&state.tokens, &identity.id, kind).map_err(internal)?;
    let name = match kind {
        TokenKind::Access => ACCESS_COOKIE,
        TokenKind::Refresh => REFRESH_COOKIE,
    };
    append_cookie(
        headers,
        session_cookie(name, &token, state.tokens.ttl_seconds(kind), state.cookie_secure),
    )
}

/// Resolves the caller from the short-lived access cookie.
pub(crate) fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiException> {
    let token = read_cookie(headers, ACCESS_COOKIE)
        .ok_or_else(|| session_expired("missing access credential"))?;
    let claims = verify_token(&state.tokens, &token, TokenKind::Access)
        .ok_or_else(|| session_expired("access credential expired or invalid"))?;
    state
        .identity(&claims.user_id())
        .ok_or_else(|| session_expired("unknown user"))
}

pub(crate) async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<(HeaderMap, Json<UserEnvelope>)> {
    let identity = state
        .account_for_login(&req.email, &req.password)
        .and_then(|account| state.identity(&UserId::new(account.id.clone())))
        .ok_or_else(|| {
            warn!(email = %req.email, "auth: rejected login");
            reject(ApiException::new(
                ErrorCode::InvalidCredentials,
                "email or password is incorrect",
            ))
        })?;

    let mut headers = HeaderMap::new();
    issue_cookie(&state, &mut headers, &identity, TokenKind::Access).map_err(reject)?;
    issue_cookie(&state, &mut headers, &identity, TokenKind::Refresh).map_err(reject)?;
    info!(user_id = %identity.id, "auth: login");
    Ok((headers, Json(UserEnvelope { user: identity })))
}

pub(crate) async fn refresh_token(
    State(state): State<Arc<AppState>>,
    request_headers: HeaderMap,
) -> ApiResult<(HeaderMap, Json<UserEnvelope>)> {
    let token = read_cookie(&request_headers, REFRESH_COOKIE)
        .ok_or_else(|| reject(session_expired("missing refresh credential")))?;
    let claims = verify_token(&state.tokens, &token, TokenKind::Refresh)
        .ok_or_else(|| reject(session_expired("refresh credential expired or invalid")))?;
    if state.revoked.lock().await.is_revoked(&claims.jti) {
        warn!(user_id = %claims.sub, "auth: refresh with revoked credential");
        return Err(reject(session_expired("refresh credential revoked")));
    }
    let identity = state
        .identity(&claims.user_id())
        .ok_or_else(|| reject(session_expired("unknown user")))?;

    let mut headers = HeaderMap::new();
    issue_cookie(&state, &mut headers, &identity, TokenKind::Access).map_err(reject)?;
    info!(user_id = %identity.id, "auth: access credential refreshed");
    Ok((headers, Json(UserEnvelope { user: identity })))
}

/// Always succeeds; a valid refresh credential is revoked and both cookies cleared.
pub(crate) async fn logout(
    State(state): State<Arc<AppState>>,
    request_headers: HeaderMap,
) -> ApiResult<(StatusCode, HeaderMap)> {
    if let Some(claims) = read_cookie(&request_headers, REFRESH_COOKIE)
        .and_then(|token| verify_token(&state.tokens, &token, TokenKind::Refresh))
    {
        state
            .revoked
            .lock()
            .await
            .revoke(claims.jti, claims.exp, Utc::now().timestamp());
        info!(user_id = %claims.sub, "auth: logout");
    }

    let mut headers = HeaderMap::new();
    for name in [ACCESS_COOKIE, REFRESH_COOKIE] {
        append_cookie(&mut headers, session_cookie(name, "", 0, state.cookie_secure))
            .map_err(reject)?;
    }
    Ok((StatusCode::OK, headers))
}

pub(crate) async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<UserEnvelope>> {
    let identity = authenticate(&state, &headers).map_err(reject)?;
    Ok(Json(UserEnvelope { user: identity }))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
