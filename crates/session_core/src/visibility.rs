use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;

use crate::{connection_manager::ConnectionManager, credential_store::CredentialStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Re-announces presence when the app comes back to the foreground, since the
/// server may have timed the user out while it was hidden.
pub struct VisibilityReconciler {
    store: Arc<CredentialStore>,
    manager: Arc<ConnectionManager>,
}

impl VisibilityReconciler {
    pub fn new(store: Arc<CredentialStore>, manager: Arc<ConnectionManager>) -> Self {
        Self { store, manager }
    }

    /// Returns true when presence was re-emitted.
    pub async fn on_visibility_changed(&self, visibility: Visibility) -> bool {
        if visibility != Visibility::Visible {
            return false;
        }
        let Some(identity) = self.store.identity() else {
            return false;
        };
        if !self.manager.is_connected() {
            debug!(user_id = %identity.id, "visibility: visible but not connected; skipping");
            return false;
        }
        let reannounced = self.manager.reannounce_presence().await;
        debug!(user_id = %identity.id, reannounced, "visibility: app became visible");
        reannounced
    }

    /// Acts on every hidden-to-visible edge of `visibility` until the sender is dropped.
    pub fn spawn(self: Arc<Self>, mut visibility: watch::Receiver<Visibility>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last = *visibility.borrow_and_update();
            while visibility.changed().await.is_ok() {
                let current = *visibility.borrow_and_update();
                if last == Visibility::Hidden && current == Visibility::Visible {
                    self.on_visibility_changed(current).await;
                }
                last = current;
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/visibility_tests.rs"]
mod tests;
