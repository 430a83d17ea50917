use std::sync::Arc;

use shared::protocol::{Identity, IdentityPatch};
use tracing::{info, warn};

use crate::{
    backend::{AuthBackend, Credentials},
    credential_store::CredentialStore,
    error::AuthError,
    refresh_gate::TokenRefreshGate,
};

/// The only writer of the credential store besides the refresh gate.
pub struct AuthSession {
    store: Arc<CredentialStore>,
    backend: Arc<dyn AuthBackend>,
    gate: Arc<TokenRefreshGate>,
}

impl AuthSession {
    pub fn new(backend: Arc<dyn AuthBackend>, gate: Arc<TokenRefreshGate>) -> Self {
        Self {
            store: Arc::clone(gate.store()),
            backend,
            gate,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// On failure the stored identity is left untouched.
    pub async fn login(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        let identity = self.backend.login(credentials).await.map_err(|err| {
            warn!(email = %credentials.email, "auth: login failed: {err}");
            err
        })?;
        info!(user_id = %identity.id, "auth: signed in");
        self.store.sign_in(identity.clone());
        Ok(identity)
    }

    /// Clears the local identity even when the server call fails.
    pub async fn logout(&self) {
        let user_id = self
            .store
            .identity()
            .map(|identity| identity.id.to_string());
        if let Err(err) = self.backend.logout().await {
            warn!(?user_id, "auth: server logout failed; clearing local session anyway: {err}");
        }
        self.store.sign_out();
        info!(?user_id, "auth: signed out");
    }

    pub async fn refresh(&self) -> Option<Identity> {
        self.gate.ensure_fresh_token().await
    }

    /// Local-only; returns false when nobody is signed in.
    pub fn patch_identity(&self, patch: IdentityPatch) -> bool {
        self.store.patch(patch)
    }

    /// Restores a session from the durable cookie at process start, then
    /// clears the loading flag whatever the outcome.
    pub async fn resolve_initial(&self) -> Option<Identity> {
        let identity = self.gate.ensure_fresh_token().await;
        self.store.finish_initial_resolution();
        match &identity {
            Some(identity) => info!(user_id = %identity.id, "auth: session restored"),
            None => info!("auth: no session to restore"),
        }
        identity
    }
}

#[cfg(test)]
#[path = "tests/auth_session_tests.rs"]
mod tests;
