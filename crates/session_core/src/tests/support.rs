use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::Router;
use shared::protocol::{ClientFrame, Identity};
use tokio::{net::TcpListener, sync::mpsc};

use crate::{
    backend::{AuthBackend, Credentials},
    error::{AuthError, TransportError},
    transport::{Handshake, RealtimeConnector, RealtimeTransport, TransportEvent},
};

pub(crate) async fn spawn_server(app: Router) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Polls `check` until it holds or two seconds pass.
pub(crate) async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Scriptable auth backend that counts every round trip.
pub(crate) struct FakeAuthBackend {
    refresh_calls: AtomicUsize,
    login_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    refresh_result: Mutex<Option<Identity>>,
    refresh_delay: Duration,
    logout_fails: AtomicBool,
}

impl FakeAuthBackend {
    pub(crate) fn refreshing_to(identity: Option<Identity>) -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            refresh_result: Mutex::new(identity),
            refresh_delay: Duration::from_millis(50),
            logout_fails: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_failing_logout(self) -> Self {
        self.logout_fails.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn set_refresh_result(&self, identity: Option<Identity>) {
        *self.refresh_result.lock().expect("lock") = identity;
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthBackend for FakeAuthBackend {
    async fn login(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if credentials.password != "secret" {
            return Err(AuthError::InvalidCredentials);
        }
        let id = credentials
            .email
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(Identity::new(id.clone(), id))
    }

    async fn refresh(&self) -> Result<Identity, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.refresh_delay).await;
        self.refresh_result
            .lock()
            .expect("lock")
            .clone()
            .ok_or(AuthError::RefreshRejected(reqwest::StatusCode::UNAUTHORIZED))
    }

    async fn logout(&self) -> Result<(), AuthError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.logout_fails.load(Ordering::SeqCst) {
            return Err(AuthError::ServerUnavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorLog {
    lines: Vec<String>,
    senders: Vec<mpsc::UnboundedSender<TransportEvent>>,
    live: usize,
    max_live: usize,
}

/// Records opens, emits and closes in one ordered log; tests drive lifecycle
/// events through the captured senders.
#[derive(Default)]
pub(crate) struct FakeConnector {
    log: Arc<Mutex<ConnectorLog>>,
    fail_open: bool,
}

impl FakeConnector {
    pub(crate) fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().expect("lock").lines.clone()
    }

    pub(crate) fn opens(&self) -> usize {
        self.log.lock().expect("lock").senders.len()
    }

    pub(crate) fn max_live(&self) -> usize {
        self.log.lock().expect("lock").max_live
    }

    pub(crate) fn sender(&self, index: usize) -> mpsc::UnboundedSender<TransportEvent> {
        self.log.lock().expect("lock").senders[index].clone()
    }

    pub(crate) fn send_latest(&self, event: TransportEvent) {
        let log = self.log.lock().expect("lock");
        let sender = log.senders.last().expect("no transport opened");
        sender.send(event).expect("transport listener gone");
    }
}

impl RealtimeConnector for FakeConnector {
    fn open(
        &self,
        handshake: Handshake,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn RealtimeTransport>, TransportError> {
        if self.fail_open {
            return Err(TransportError::InvalidUrl("unreachable".into()));
        }
        let mut log = self.log.lock().expect("lock");
        log.lines
            .push(format!("open {} {}", handshake.user_id, handshake.role));
        log.senders.push(events);
        log.live += 1;
        log.max_live = log.max_live.max(log.live);
        Ok(Arc::new(FakeTransport {
            user_id: handshake.user_id.to_string(),
            log: Arc::clone(&self.log),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeTransport {
    user_id: String,
    log: Arc<Mutex<ConnectorLog>>,
    closed: AtomicBool,
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn emit(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let line = match frame {
            ClientFrame::JoinRoom { room } => format!("emit {} join_room {room}", self.user_id),
            ClientFrame::PresenceOnline { user_id } => {
                format!("emit {} presence_online {user_id}", self.user_id)
            }
        };
        self.log.lock().expect("lock").lines.push(line);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut log = self.log.lock().expect("lock");
        log.lines.push(format!("close {}", self.user_id));
        log.live -= 1;
    }
}
