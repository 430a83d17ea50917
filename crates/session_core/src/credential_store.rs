use shared::protocol::{Identity, IdentityPatch};
use tokio::sync::{broadcast, watch};
use tracing::debug;

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    Login,
    Refresh,
    RefreshFailed,
    Logout,
    Patch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityTransition {
    pub previous: Option<Identity>,
    pub current: Option<Identity>,
    pub cause: TransitionCause,
}

impl IdentityTransition {
    /// True when the signed-in user changed, as opposed to a field update on the same user.
    pub fn user_changed(&self) -> bool {
        self.previous.as_ref().map(|identity| &identity.id)
            != self.current.as_ref().map(|identity| &identity.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub identity: Option<Identity>,
    /// Set only while the process-start resolution is pending.
    pub loading: bool,
    /// Bumped by login and logout; refreshes started under an older value are discarded.
    pub generation: u64,
}

/// Single source of truth for who is signed in.
///
/// Readers either subscribe to the ordered transition log or watch the latest
/// snapshot. Writes are crate-private so the identity only changes through
/// [`crate::AuthSession`] and the refresh gate.
pub struct CredentialStore {
    state: watch::Sender<SessionSnapshot>,
    transitions: broadcast::Sender<IdentityTransition>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionSnapshot {
            identity: None,
            loading: true,
            generation: 0,
        });
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self { state, transitions }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.borrow().identity.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().loading
    }

    pub fn generation(&self) -> u64 {
        self.state.borrow().generation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IdentityTransition> {
        self.transitions.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn patch(&self, patch: IdentityPatch) -> bool {
        self.transition(TransitionCause::Patch, |state| {
            let Some(identity) = state.identity.as_mut() else {
                return false;
            };
            identity.apply_patch(patch);
            true
        })
    }

    pub(crate) fn sign_in(&self, identity: Identity) {
        self.transition(TransitionCause::Login, |state| {
            state.identity = Some(identity);
            state.generation += 1;
            true
        });
    }

    pub(crate) fn sign_out(&self) {
        self.transition(TransitionCause::Logout, |state| {
            state.generation += 1;
            state.identity.take().is_some()
        });
    }

    /// Applies a settled refresh if no login or logout happened since it started.
    /// The generation is compared under the snapshot lock, so a concurrent
    /// logout either lands first and wins or lands after and clears the result.
    pub(crate) fn apply_refresh(&self, started_at: u64, outcome: Option<Identity>) -> bool {
        let mut current = true;
        let cause = match outcome {
            Some(_) => TransitionCause::Refresh,
            None => TransitionCause::RefreshFailed,
        };
        self.transition(cause, |state| {
            if state.generation != started_at {
                current = false;
                return false;
            }
            match outcome {
                Some(identity) => {
                    state.identity = Some(identity);
                    true
                }
                None => state.identity.take().is_some(),
            }
        });
        current
    }

    pub(crate) fn finish_initial_resolution(&self) {
        self.state.send_if_modified(|state| {
            let was_loading = state.loading;
            state.loading = false;
            was_loading
        });
    }

    /// Runs `mutate` under the snapshot lock and publishes the transition before
    /// releasing it, so subscribers see mutations in the order they were made.
    fn transition(
        &self,
        cause: TransitionCause,
        mutate: impl FnOnce(&mut SessionSnapshot) -> bool,
    ) -> bool {
        self.state.send_if_modified(|state| {
            let previous = state.identity.clone();
            if !mutate(state) {
                return false;
            }
            let transition = IdentityTransition {
                previous,
                current: state.identity.clone(),
                cause,
            };
            debug!(
                ?cause,
                user_id = ?transition.current.as_ref().map(|identity| identity.id.as_str()),
                "auth: identity transition"
            );
            let _ = self.transitions.send(transition);
            true
        })
    }
}

#[cfg(test)]
#[path = "tests/credential_store_tests.rs"]
mod tests;
