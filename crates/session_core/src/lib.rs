use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::{cookie::Jar, Client};
use serde::de::DeserializeOwned;
use shared::protocol::{Identity, IdentityPatch, ServerFrame, UserEnvelope};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::info;

pub mod auth_session;
pub mod backend;
pub mod config;
pub mod connection_manager;
pub mod credential_store;
pub mod error;
pub mod refresh_gate;
pub mod request_executor;
pub mod transport;
pub mod visibility;

pub use auth_session::AuthSession;
pub use backend::{AuthBackend, Credentials, HttpAuthBackend};
pub use config::{load_settings, load_settings_from, ClientSettings};
pub use connection_manager::{ConnectionHandle, ConnectionManager, ConnectionPhase, ConnectionStatus};
pub use credential_store::{CredentialStore, IdentityTransition, SessionSnapshot, TransitionCause};
pub use error::{AuthError, RequestError, TransportError};
pub use refresh_gate::TokenRefreshGate;
pub use request_executor::{ApiRequest, AuthenticatedExecutor};
pub use transport::{ReconnectPolicy, RealtimeConnector, RealtimeTransport, WsConnector};
pub use visibility::{Visibility, VisibilityReconciler};

pub const ME_ROUTE: &str = "/me";

/// Wires the session pieces together over one cookie jar: auth calls, API
/// requests and realtime handshakes all present the same session.
pub struct SessionClient {
    settings: ClientSettings,
    auth: AuthSession,
    executor: AuthenticatedExecutor,
    manager: Arc<ConnectionManager>,
    visibility: Arc<VisibilityReconciler>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionClient {
    pub fn new(settings: ClientSettings) -> Result<Arc<Self>> {
        let jar = Arc::new(Jar::default());
        let http = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(settings.request_timeout())
            .build()
            .context("failed to build HTTP client")?;
        let backend: Arc<dyn AuthBackend> =
            Arc::new(HttpAuthBackend::new(http.clone(), &settings.server_url));
        let gate = Arc::new(TokenRefreshGate::new(
            Arc::clone(&backend),
            Arc::new(CredentialStore::new()),
        ));
        let connector = WsConnector::new(&settings.server_url, jar, settings.reconnect)
            .context("invalid realtime endpoint")?
            .with_refresh_gate(Arc::clone(&gate));
        Ok(Self::assemble(
            settings,
            http,
            backend,
            gate,
            Arc::new(connector),
        ))
    }

    /// Builds a client around caller-supplied auth and realtime seams.
    pub fn new_with_dependencies(
        settings: ClientSettings,
        backend: Arc<dyn AuthBackend>,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Arc<Self> {
        let gate = Arc::new(TokenRefreshGate::new(
            Arc::clone(&backend),
            Arc::new(CredentialStore::new()),
        ));
        Self::assemble(settings, Client::new(), backend, gate, connector)
    }

    fn assemble(
        settings: ClientSettings,
        http: Client,
        backend: Arc<dyn AuthBackend>,
        gate: Arc<TokenRefreshGate>,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Arc<Self> {
        let store = Arc::clone(gate.store());
        let manager = ConnectionManager::new(connector, Arc::clone(&store), settings.role);
        let executor = AuthenticatedExecutor::new(http, &settings.server_url, Arc::clone(&gate));
        Arc::new(Self {
            auth: AuthSession::new(backend, gate),
            executor,
            visibility: Arc::new(VisibilityReconciler::new(store, Arc::clone(&manager))),
            manager,
            settings,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts following the signed-in identity with the realtime connection,
    /// then resolves the session left over from a previous run.
    pub async fn start(&self) -> Option<Identity> {
        let driver = self.manager.spawn_identity_driver();
        self.tasks.lock().await.push(driver);
        info!(server_url = %self.settings.server_url, role = %self.settings.role, "session: started");
        let identity = self.auth.resolve_initial().await;
        self.manager.sync_identity().await;
        identity
    }

    // Identity changes made here are applied to the realtime connection before
    // returning; the driver task only catches the ones made elsewhere.

    pub async fn login(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        let result = self.auth.login(credentials).await;
        self.manager.sync_identity().await;
        result
    }

    pub async fn logout(&self) {
        self.auth.logout().await;
        self.manager.sync_identity().await;
    }

    pub async fn refresh(&self) -> Option<Identity> {
        let identity = self.auth.refresh().await;
        self.manager.sync_identity().await;
        identity
    }

    pub fn patch_identity(&self, patch: IdentityPatch) -> bool {
        self.auth.patch_identity(patch)
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
    ) -> Result<T, RequestError> {
        self.executor.request_json(request).await
    }

    pub async fn current_user(&self) -> Result<Identity, RequestError> {
        let envelope: UserEnvelope = self.request_json(&ApiRequest::get(ME_ROUTE)).await?;
        Ok(envelope.user)
    }

    pub fn executor(&self) -> &AuthenticatedExecutor {
        &self.executor
    }

    pub fn identity(&self) -> Option<Identity> {
        self.auth.store().identity()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.auth.store()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.watch_status()
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<ServerFrame> {
        self.manager.subscribe_frames()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<IdentityTransition> {
        self.auth.store().subscribe()
    }

    pub async fn on_visibility_changed(&self, visibility: Visibility) -> bool {
        self.visibility.on_visibility_changed(visibility).await
    }

    /// Feeds host visibility changes to the reconciler until `visibility` closes.
    pub async fn follow_visibility(&self, visibility: watch::Receiver<Visibility>) {
        let task = Arc::clone(&self.visibility).spawn(visibility);
        self.tasks.lock().await.push(task);
    }

    /// Stops background tasks and closes the realtime connection. The stored
    /// identity is kept; call [`SessionClient::logout`] to end the session.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.manager.shutdown().await;
        info!("session: shut down");
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
