use serde_json::json;
use shared::domain::Role;

use super::*;
use crate::{
    connection_manager::{ConnectionManager, ConnectionPhase},
    credential_store::TransitionCause,
    test_support::{wait_until, FakeAuthBackend, FakeConnector},
    transport::TransportEvent,
};

fn session(backend: FakeAuthBackend) -> (AuthSession, Arc<FakeAuthBackend>) {
    let backend = Arc::new(backend);
    let gate = Arc::new(TokenRefreshGate::new(
        Arc::clone(&backend) as Arc<dyn AuthBackend>,
        Arc::new(CredentialStore::new()),
    ));
    (
        AuthSession::new(Arc::clone(&backend) as Arc<dyn AuthBackend>, gate),
        backend,
    )
}

#[tokio::test]
async fn login_stores_identity_and_logs_transition() {
    let (session, _) = session(FakeAuthBackend::refreshing_to(None));
    let mut transitions = session.store().subscribe();

    let identity = session
        .login(&Credentials::new("u1@tours.example", "secret"))
        .await
        .expect("login");

    assert_eq!(identity.id.as_str(), "u1");
    assert_eq!(session.store().identity(), Some(identity));
    let transition = transitions.recv().await.expect("transition");
    assert_eq!(transition.cause, TransitionCause::Login);
    assert!(transition.user_changed());
}

#[tokio::test]
async fn failed_login_leaves_identity_unchanged() {
    let (session, backend) = session(FakeAuthBackend::refreshing_to(None));
    session
        .login(&Credentials::new("u1@tours.example", "secret"))
        .await
        .expect("login");

    let err = session
        .login(&Credentials::new("u2@tours.example", "wrong"))
        .await
        .expect_err("rejected");

    assert!(matches!(err, AuthError::InvalidCredentials));
    assert_eq!(backend.login_calls(), 2);
    assert_eq!(
        session.store().identity().map(|identity| identity.id.to_string()),
        Some("u1".to_string())
    );
}

#[tokio::test]
async fn logout_clears_identity_even_when_server_call_fails() {
    let (session, backend) =
        session(FakeAuthBackend::refreshing_to(None).with_failing_logout());
    session
        .login(&Credentials::new("u1@tours.example", "secret"))
        .await
        .expect("login");

    session.logout().await;

    assert_eq!(backend.logout_calls(), 1);
    assert_eq!(session.store().identity(), None);
}

#[tokio::test]
async fn resolve_initial_restores_session_and_clears_loading() {
    let (session, backend) =
        session(FakeAuthBackend::refreshing_to(Some(Identity::new("u1", "Ana"))));
    assert!(session.store().is_loading());

    let restored = session.resolve_initial().await;

    assert_eq!(restored.map(|identity| identity.id.to_string()), Some("u1".into()));
    assert!(!session.store().is_loading());
    assert_eq!(backend.refresh_calls(), 1);
}

#[tokio::test]
async fn resolve_initial_without_cookie_ends_signed_out() {
    let (session, _) = session(FakeAuthBackend::refreshing_to(None));

    assert_eq!(session.resolve_initial().await, None);
    assert!(!session.store().is_loading());
    assert_eq!(session.store().identity(), None);
}

#[tokio::test]
async fn patch_requires_a_signed_in_user() {
    let (session, _) = session(FakeAuthBackend::refreshing_to(None));
    let patch = IdentityPatch {
        display_name: Some("Ana Tran".into()),
        ..IdentityPatch::default()
    };
    assert!(!session.patch_identity(patch.clone()));

    session
        .login(&Credentials::new("u1@tours.example", "secret"))
        .await
        .expect("login");
    let mut extra = serde_json::Map::new();
    extra.insert("phone".into(), json!("+84 90 000 0000"));
    assert!(session.patch_identity(IdentityPatch { extra, ..patch }));

    let identity = session.store().identity().expect("identity");
    assert_eq!(identity.display_name, "Ana Tran");
    assert_eq!(identity.extra["phone"], "+84 90 000 0000");
}

#[tokio::test]
async fn refresh_of_a_rejected_session_clears_identity() {
    let (session, backend) = session(FakeAuthBackend::refreshing_to(None));
    session
        .login(&Credentials::new("u1@tours.example", "secret"))
        .await
        .expect("login");

    assert_eq!(session.refresh().await, None);
    assert_eq!(session.store().identity(), None);

    backend.set_refresh_result(Some(Identity::new("u1", "Ana")));
    assert!(session.refresh().await.is_some());
    assert_eq!(backend.refresh_calls(), 2);
}

#[tokio::test]
async fn login_drop_reconnect_logout_scenario() {
    let (session, _) = session(FakeAuthBackend::refreshing_to(None));
    let connector = Arc::new(FakeConnector::default());
    let manager = ConnectionManager::new(
        connector.clone(),
        Arc::clone(session.store()),
        Role::Customer,
    );
    let driver = manager.spawn_identity_driver();

    session
        .login(&Credentials::new("u1@tours.example", "secret"))
        .await
        .expect("login");
    assert!(wait_until(|| async { connector.opens() == 1 }).await);
    connector.send_latest(TransportEvent::Open);
    assert!(wait_until(|| async { manager.phase().await == ConnectionPhase::Active }).await);

    connector.send_latest(TransportEvent::Closed {
        reason: "network".into(),
    });
    assert!(wait_until(|| async { manager.phase().await == ConnectionPhase::Reconnecting }).await);
    connector.send_latest(TransportEvent::Open);
    assert!(wait_until(|| async { manager.phase().await == ConnectionPhase::Active }).await);

    session.logout().await;
    assert!(wait_until(|| async { manager.current_connection().await.is_none() }).await);
    assert!(!manager.reannounce_presence().await);

    assert_eq!(
        connector.log(),
        vec![
            "open u1 customer",
            "emit u1 join_room room:u1",
            "emit u1 presence_online u1",
            "emit u1 join_room room:u1",
            "emit u1 presence_online u1",
            "close u1",
        ]
    );
    driver.abort();
}
