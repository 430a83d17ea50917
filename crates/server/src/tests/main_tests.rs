use super::*;
use axum::{
    body::{self, Body},
    http::{header, Request, Response, StatusCode},
};
use shared::protocol::UserEnvelope;
use tower::ServiceExt;

use crate::config::SeedUser;

fn test_app() -> Router {
    let state = AppState::new(
        TokenConfig {
            secret: "test-secret".into(),
            access_ttl_seconds: 60,
            refresh_ttl_seconds: 3600,
        },
        false,
        vec![SeedUser {
            id: "u1".into(),
            email: "ana@tours.example".into(),
            password: "secret".into(),
            display_name: "Ana".into(),
        }],
    );
    build_router(Arc::new(state))
}

fn login_request(password: &str) -> Request<Body> {
    Request::post("/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "email": "Ana@tours.example", "password": password }).to_string(),
        ))
        .expect("request")
}

fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|value| value.to_str().expect("ascii").to_string())
        .collect()
}

/// Turns `Set-Cookie` values into a request `Cookie` header.
fn cookie_header(set_cookies: &[String]) -> String {
    set_cookies
        .iter()
        .filter_map(|cookie| cookie.split(';').next())
        .collect::<Vec<_>>()
        .join("; ")
}

async fn user_of(response: Response<Body>) -> UserEnvelope {
    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&body).expect("json")
}

fn post_with_cookies(uri: &str, cookies: &str) -> Request<Body> {
    Request::post(uri)
        .header(header::COOKIE, cookies)
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = test_app().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn login_sets_both_session_cookies() {
    let response = test_app()
        .oneshot(login_request("secret"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let cookies = set_cookies(&response);
    assert_eq!(cookies.len(), 2);
    assert!(cookies[0].starts_with("access_token="));
    assert!(cookies[1].starts_with("refresh_token="));
    assert!(cookies.iter().all(|cookie| cookie.contains("HttpOnly")));

    let envelope = user_of(response).await;
    assert_eq!(envelope.user.id.as_str(), "u1");
    assert_eq!(envelope.user.display_name, "Ana");
}

#[tokio::test]
async fn wrong_password_is_unauthorized_without_cookies() {
    let response = test_app()
        .oneshot(login_request("nope"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookies(&response).is_empty());
}

#[tokio::test]
async fn me_requires_access_cookie() {
    let app = test_app();
    let anonymous = Request::get("/me").body(Body::empty()).expect("request");
    let response = app.clone().oneshot(anonymous).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let login = app
        .clone()
        .oneshot(login_request("secret"))
        .await
        .expect("response");
    let cookies = cookie_header(&set_cookies(&login));
    let request = Request::get("/me")
        .header(header::COOKIE, cookies)
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(user_of(response).await.user.id.as_str(), "u1");
}

#[tokio::test]
async fn refresh_issues_a_new_access_cookie_until_logout() {
    let app = test_app();
    let login = app
        .clone()
        .oneshot(login_request("secret"))
        .await
        .expect("response");
    let cookies = cookie_header(&set_cookies(&login));

    let refreshed = app
        .clone()
        .oneshot(post_with_cookies("/auth/refresh-token", &cookies))
        .await
        .expect("response");
    assert_eq!(refreshed.status(), StatusCode::OK);
    let refreshed_cookies = set_cookies(&refreshed);
    assert_eq!(refreshed_cookies.len(), 1);
    assert!(refreshed_cookies[0].starts_with("access_token="));

    let logout = app
        .clone()
        .oneshot(post_with_cookies("/auth/logout", &cookies))
        .await
        .expect("response");
    assert_eq!(logout.status(), StatusCode::OK);
    assert!(set_cookies(&logout)
        .iter()
        .all(|cookie| cookie.contains("Max-Age=0")));

    let after_logout = app
        .oneshot(post_with_cookies("/auth/refresh-token", &cookies))
        .await
        .expect("response");
    assert_eq!(after_logout.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_without_cookie_is_unauthorized() {
    let response = test_app()
        .oneshot(post_with_cookies("/auth/refresh-token", "theme=dark"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_without_session_still_succeeds() {
    let response = test_app()
        .oneshot(
            Request::post("/auth/logout")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}
