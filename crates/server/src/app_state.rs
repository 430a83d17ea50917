use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::UserId,
    protocol::{Identity, ServerFrame},
};
use tokio::sync::{broadcast, Mutex};

use crate::{broker::PresenceRegistry, config::SeedUser, tokens::TokenConfig};

/// Refresh token ids invalidated by logout, kept only until the token would
/// have expired anyway.
#[derive(Debug, Default)]
pub(crate) struct RevokedTokens {
    expiry_by_jti: HashMap<String, i64>,
}

impl RevokedTokens {
    pub(crate) fn revoke(&mut self, jti: String, exp: i64, now: i64) {
        self.expiry_by_jti.retain(|_, expires_at| *expires_at > now);
        if exp > now {
            self.expiry_by_jti.insert(jti, exp);
        }
    }

    pub(crate) fn is_revoked(&self, jti: &str) -> bool {
        self.expiry_by_jti.contains_key(jti)
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) tokens: TokenConfig,
    pub(crate) cookie_secure: bool,
    accounts: Arc<Vec<SeedUser>>,
    pub(crate) revoked: Arc<Mutex<RevokedTokens>>,
    pub(crate) presence: Arc<Mutex<PresenceRegistry>>,
    profiles: Arc<HashMap<UserId, Identity>>,
    pub(crate) events: broadcast::Sender<ServerFrame>,
}

impl AppState {
    pub(crate) fn new(tokens: TokenConfig, cookie_secure: bool, accounts: Vec<SeedUser>) -> Self {
        let (events, _) = broadcast::channel(256);
        let profiles = accounts
            .iter()
            .map(|account| {
                (
                    UserId::new(account.id.clone()),
                    Identity::new(account.id.clone(), account.display_name.clone()),
                )
            })
            .collect();
        Self {
            tokens,
            cookie_secure,
            accounts: Arc::new(accounts),
            revoked: Arc::new(Mutex::new(RevokedTokens::default())),
            presence: Arc::new(Mutex::new(PresenceRegistry::default())),
            profiles: Arc::new(profiles),
            events,
        }
    }

    pub(crate) fn account_for_login(&self, email: &str, password: &str) -> Option<&SeedUser> {
        self.accounts
            .iter()
            .find(|account| account.email.eq_ignore_ascii_case(email.trim()))
            .filter(|account| account.password == password)
    }

    pub(crate) fn identity(&self, user_id: &UserId) -> Option<Identity> {
        self.profiles.get(user_id).cloned()
    }
}

#[cfg(test)]
#[path = "tests/app_state_tests.rs"]
mod tests;
