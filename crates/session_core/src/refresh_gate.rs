use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures::future::{BoxFuture, FutureExt, Shared};
use shared::protocol::Identity;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{backend::AuthBackend, credential_store::CredentialStore};

type RefreshOutcome = Shared<BoxFuture<'static, Option<Identity>>>;

struct InFlightRefresh {
    id: u64,
    outcome: RefreshOutcome,
}

/// Deduplicates refresh exchanges: every caller that arrives while one is
/// pending awaits that same exchange.
pub struct TokenRefreshGate {
    backend: Arc<dyn AuthBackend>,
    store: Arc<CredentialStore>,
    in_flight: Arc<Mutex<Option<InFlightRefresh>>>,
    next_id: AtomicU64,
}

impl TokenRefreshGate {
    pub fn new(backend: Arc<dyn AuthBackend>, store: Arc<CredentialStore>) -> Self {
        Self {
            backend,
            store,
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub async fn is_refreshing(&self) -> bool {
        self.in_flight.lock().await.is_some()
    }

    /// Resolves to the refreshed identity, or `None` when the durable session
    /// proof was rejected or the exchange failed. Never errors.
    pub async fn ensure_fresh_token(&self) -> Option<Identity> {
        let outcome = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(pending) => {
                    debug!(refresh_id = pending.id, "refresh: joining in-flight exchange");
                    pending.outcome.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let outcome = self.start_exchange(id);
                    *slot = Some(InFlightRefresh {
                        id,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };
        outcome.await
    }

    /// The exchange runs on its own task so it settles even if every caller
    /// that awaited it has been dropped.
    fn start_exchange(&self, id: u64) -> RefreshOutcome {
        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        let in_flight = Arc::clone(&self.in_flight);
        let started_at = store.generation();
        debug!(refresh_id = id, "refresh: starting exchange");

        let task = tokio::spawn(async move {
            let outcome = match backend.refresh().await {
                Ok(identity) => Some(identity),
                Err(err) => {
                    warn!(refresh_id = id, "refresh: exchange failed: {err}");
                    None
                }
            };

            {
                let mut slot = in_flight.lock().await;
                if slot.as_ref().is_some_and(|pending| pending.id == id) {
                    *slot = None;
                }
            }

            if store.apply_refresh(started_at, outcome.clone()) {
                info!(
                    refresh_id = id,
                    refreshed = outcome.is_some(),
                    "refresh: exchange settled"
                );
            } else {
                info!(
                    refresh_id = id,
                    "refresh: session changed while exchange was pending; outcome not stored"
                );
            }
            outcome
        });

        let in_flight = Arc::clone(&self.in_flight);
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(refresh_id = id, "refresh: exchange task failed: {err}");
                    let mut slot = in_flight.lock().await;
                    if slot.as_ref().is_some_and(|pending| pending.id == id) {
                        *slot = None;
                    }
                    None
                }
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
#[path = "tests/refresh_gate_tests.rs"]
mod tests;
