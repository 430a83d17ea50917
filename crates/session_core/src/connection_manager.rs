use std::{
    fmt,
    sync::{Arc, Weak},
};

use shared::{
    domain::{room_for_user, Role, UserId},
    protocol::{ClientFrame, Identity, ServerFrame},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    credential_store::CredentialStore,
    transport::{Handshake, RealtimeConnector, RealtimeTransport, TransportEvent},
};

const FRAME_CHANNEL_CAPACITY: usize = 256;

/// What the UI shows; derived from transport events only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Active,
    Reconnecting,
}

/// One live transport, tagged with the identity it was opened for.
#[derive(Clone)]
pub struct ConnectionHandle {
    identity: Identity,
    generation: u64,
    transport: Arc<dyn RealtimeTransport>,
}

impl ConnectionHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("user_id", &self.identity.id)
            .field("generation", &self.generation)
            .finish()
    }
}

struct ActiveConnection {
    handle: ConnectionHandle,
    event_task: JoinHandle<()>,
}

struct ManagerState {
    phase: ConnectionPhase,
    active: Option<ActiveConnection>,
    next_generation: u64,
    /// User the current (or last exhausted) connection cycle belongs to.
    cycle_user: Option<UserId>,
}

/// Keeps at most one realtime transport alive, bound to the signed-in identity.
pub struct ConnectionManager {
    connector: Arc<dyn RealtimeConnector>,
    store: Arc<CredentialStore>,
    role: Role,
    inner: Mutex<ManagerState>,
    status: watch::Sender<ConnectionStatus>,
    frames: broadcast::Sender<ServerFrame>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        store: Arc<CredentialStore>,
        role: Role,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Arc::new(Self {
            connector,
            store,
            role,
            inner: Mutex::new(ManagerState {
                phase: ConnectionPhase::Idle,
                active: None,
                next_generation: 0,
                cycle_user: None,
            }),
            status,
            frames,
        })
    }

    pub async fn current_connection(&self) -> Option<ConnectionHandle> {
        let state = self.inner.lock().await;
        state.active.as_ref().map(|active| active.handle.clone())
    }

    pub fn is_connected(&self) -> bool {
        *self.status.borrow() == ConnectionStatus::Connected
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<ServerFrame> {
        self.frames.subscribe()
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.inner.lock().await.phase
    }

    /// Resyncs with the store on every published transition until aborted.
    /// Covers identity changes made outside [`crate::SessionClient`], such as a
    /// refresh failing under an API request.
    pub fn spawn_identity_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let mut transitions = self.store.subscribe();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.sync_identity().await;
            loop {
                match transitions.recv().await {
                    Ok(_) => manager.sync_identity().await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime: identity transitions lagged; resyncing");
                        manager.sync_identity().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Reconciles the connection with the store's current identity. The identity
    /// is read under the manager lock, so whichever sync runs last acts on the
    /// latest identity and a stale one can never reopen a closed connection.
    pub async fn sync_identity(self: &Arc<Self>) {
        let mut state = self.inner.lock().await;
        let identity = self.store.identity();
        self.reconcile(&mut state, identity).await;
    }

    /// A different user (or none) closes the current transport before anything
    /// new is opened; the same user keeps its connection and only refreshes the
    /// tagged record.
    async fn reconcile(self: &Arc<Self>, state: &mut ManagerState, identity: Option<Identity>) {
        if let (Some(identity), Some(active)) = (identity.as_ref(), state.active.as_mut()) {
            if active.handle.identity.id == identity.id {
                active.handle.identity = identity.clone();
                return;
            }
        }

        if let Some(active) = state.active.take() {
            self.teardown(active).await;
            state.phase = ConnectionPhase::Idle;
            self.set_status(ConnectionStatus::Disconnected);
        }

        let Some(identity) = identity else {
            state.cycle_user = None;
            state.phase = ConnectionPhase::Idle;
            self.set_status(ConnectionStatus::Disconnected);
            return;
        };

        if state.cycle_user.as_ref() == Some(&identity.id) {
            debug!(
                user_id = %identity.id,
                "realtime: connection cycle for this user already ended; staying idle"
            );
            return;
        }
        state.cycle_user = Some(identity.id.clone());
        self.open(state, identity);
    }

    /// Re-emits presence on the live connection. Returns false when not active.
    pub async fn reannounce_presence(&self) -> bool {
        let state = self.inner.lock().await;
        if state.phase != ConnectionPhase::Active {
            return false;
        }
        let Some(active) = state.active.as_ref() else {
            return false;
        };
        if !self.is_signed_in_as(&active.handle) {
            debug!(
                user_id = %active.handle.identity.id,
                "realtime: identity changed; not re-announcing"
            );
            return false;
        }
        let user_id = active.handle.identity.id.clone();
        match active
            .handle
            .transport
            .emit(ClientFrame::PresenceOnline {
                user_id: user_id.clone(),
            })
            .await
        {
            Ok(()) => {
                debug!(%user_id, "realtime: presence re-announced");
                true
            }
            Err(err) => {
                warn!(%user_id, "realtime: presence re-announce failed: {err}");
                false
            }
        }
    }

    /// Closes the connection and forgets the cycle, as when the owning view goes away.
    pub async fn shutdown(&self) {
        let mut state = self.inner.lock().await;
        if let Some(active) = state.active.take() {
            self.teardown(active).await;
        }
        state.cycle_user = None;
        state.phase = ConnectionPhase::Idle;
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn open(self: &Arc<Self>, state: &mut ManagerState, identity: Identity) {
        state.next_generation += 1;
        let generation = state.next_generation;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handshake = Handshake {
            user_id: identity.id.clone(),
            role: self.role,
        };

        match self.connector.open(handshake, events_tx) {
            Ok(transport) => {
                info!(user_id = %identity.id, generation, "realtime: connecting");
                let event_task = self.spawn_event_task(generation, events_rx);
                state.active = Some(ActiveConnection {
                    handle: ConnectionHandle {
                        identity,
                        generation,
                        transport,
                    },
                    event_task,
                });
                state.phase = ConnectionPhase::Connecting;
                self.set_status(ConnectionStatus::Connecting);
            }
            Err(err) => {
                warn!(user_id = %identity.id, "realtime: failed to open transport: {err}");
                state.phase = ConnectionPhase::Idle;
                self.set_status(ConnectionStatus::Error);
            }
        }
    }

    fn spawn_event_task(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_transport_event(generation, event).await;
            }
        })
    }

    async fn handle_transport_event(&self, generation: u64, event: TransportEvent) {
        let mut state = self.inner.lock().await;
        let Some(handle) = state
            .active
            .as_ref()
            .filter(|active| active.handle.generation == generation)
            .map(|active| active.handle.clone())
        else {
            debug!(generation, ?event, "realtime: ignoring event from a closed connection");
            return;
        };
        let user_id = handle.identity.id.clone();

        match event {
            TransportEvent::Open => {
                let reconnected = state.phase == ConnectionPhase::Reconnecting;
                state.phase = ConnectionPhase::Active;
                self.set_status(ConnectionStatus::Connected);
                info!(%user_id, generation, reconnected, "realtime: connection active");
                self.announce(&handle).await;
            }
            TransportEvent::Closed { reason } => {
                warn!(%user_id, generation, %reason, "realtime: connection lost; reconnecting");
                state.phase = ConnectionPhase::Reconnecting;
                self.set_status(ConnectionStatus::Connecting);
            }
            TransportEvent::Error(message) => {
                warn!(%user_id, generation, "realtime: transport error: {message}");
                self.set_status(ConnectionStatus::Error);
            }
            TransportEvent::Frame(frame) => {
                let _ = self.frames.send(frame);
            }
            TransportEvent::GaveUp => {
                warn!(%user_id, generation, "realtime: reconnection exhausted; going idle");
                // Runs on the event task itself, so the task is detached rather than aborted.
                state.active = None;
                state.phase = ConnectionPhase::Idle;
                self.set_status(ConnectionStatus::Disconnected);
            }
        }
    }

    fn is_signed_in_as(&self, handle: &ConnectionHandle) -> bool {
        self.store
            .identity()
            .is_some_and(|identity| identity.id == handle.identity.id)
    }

    /// Join must be issued before presence; both are repeated on every open.
    async fn announce(&self, handle: &ConnectionHandle) {
        let user_id = handle.identity.id.clone();
        if !self.is_signed_in_as(handle) {
            debug!(%user_id, "realtime: identity changed; not announcing");
            return;
        }
        let room = room_for_user(&user_id);
        if let Err(err) = handle
            .transport
            .emit(ClientFrame::JoinRoom { room: room.clone() })
            .await
        {
            warn!(%user_id, %room, "realtime: join failed: {err}");
            return;
        }
        if let Err(err) = handle
            .transport
            .emit(ClientFrame::PresenceOnline {
                user_id: user_id.clone(),
            })
            .await
        {
            warn!(%user_id, "realtime: presence announce failed: {err}");
            return;
        }
        debug!(%user_id, %room, "realtime: joined room and announced presence");
    }

    async fn teardown(&self, active: ActiveConnection) {
        active.event_task.abort();
        active.handle.transport.close().await;
        info!(
            user_id = %active.handle.identity.id,
            generation = active.handle.generation,
            "realtime: connection closed"
        );
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

#[cfg(test)]
#[path = "tests/connection_manager_tests.rs"]
mod tests;
