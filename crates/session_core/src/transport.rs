use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::cookie::{CookieStore, Jar};
use serde::Deserialize;
use shared::{
    domain::{Role, UserId},
    protocol::{ClientFrame, ServerFrame},
};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::{header::COOKIE, HeaderValue, StatusCode},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::TransportError, refresh_gate::TokenRefreshGate};

pub const REALTIME_ROUTE: &str = "/ws";

/// Lifecycle and inbound traffic reported by a transport to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Closed { reason: String },
    Error(String),
    Frame(ServerFrame),
    /// The reconnection policy is exhausted; no further events follow.
    GaveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub user_id: UserId,
    pub role: Role,
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn emit(&self, frame: ClientFrame) -> Result<(), TransportError>;
    async fn close(&self);
}

/// Opens transports that report lifecycle events on `events` and reconnect on
/// their own until their policy gives up.
pub trait RealtimeConnector: Send + Sync {
    fn open(
        &self,
        handshake: Handshake,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn RealtimeTransport>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5, 500, 10_000)
    }
}

pub(crate) fn websocket_url(server_url: &str) -> Result<Url, TransportError> {
    let server_url = server_url.trim_end_matches('/');
    let ws_url = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(TransportError::InvalidUrl(format!(
            "server_url must start with http:// or https://: {server_url}"
        )));
    };
    Url::parse(&format!("{ws_url}{REALTIME_ROUTE}"))
        .map_err(|err| TransportError::InvalidUrl(err.to_string()))
}

/// WebSocket connector that attaches the session cookies from the shared jar
/// to every handshake.
pub struct WsConnector {
    server_url: Url,
    ws_url: Url,
    jar: Arc<Jar>,
    policy: ReconnectPolicy,
    refresh_gate: Option<Arc<TokenRefreshGate>>,
}

impl WsConnector {
    pub fn new(
        server_url: &str,
        jar: Arc<Jar>,
        policy: ReconnectPolicy,
    ) -> Result<Self, TransportError> {
        let ws_url = websocket_url(server_url)?;
        let server_url =
            Url::parse(server_url).map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        Ok(Self {
            server_url,
            ws_url,
            jar,
            policy,
            refresh_gate: None,
        })
    }

    /// Lets a handshake rejected as unauthorized trigger one token refresh
    /// before the next attempt.
    pub fn with_refresh_gate(mut self, gate: Arc<TokenRefreshGate>) -> Self {
        self.refresh_gate = Some(gate);
        self
    }
}

impl RealtimeConnector for WsConnector {
    fn open(
        &self,
        handshake: Handshake,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn RealtimeTransport>, TransportError> {
        let mut url = self.ws_url.clone();
        url.query_pairs_mut()
            .append_pair("user_id", handshake.user_id.as_str())
            .append_pair("role", handshake.role.as_str());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let connection = WsConnectionLoop {
            url,
            cookie_url: self.server_url.clone(),
            jar: Arc::clone(&self.jar),
            policy: self.policy,
            refresh_gate: self.refresh_gate.clone(),
            user_id: handshake.user_id,
            events,
        };
        tokio::spawn(connection.run(commands_rx));
        Ok(Arc::new(WsTransport {
            commands: commands_tx,
        }))
    }
}

enum Command {
    Send(String),
    Close,
}

struct WsTransport {
    commands: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    /// Frames emitted while the socket is down are dropped, not queued.
    async fn emit(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let text = serde_json::to_string(&frame)?;
        self.commands
            .send(Command::Send(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

enum PumpOutcome {
    Shutdown,
    Dropped(String),
}

struct WsConnectionLoop {
    url: Url,
    cookie_url: Url,
    jar: Arc<Jar>,
    policy: ReconnectPolicy,
    refresh_gate: Option<Arc<TokenRefreshGate>>,
    user_id: UserId,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WsConnectionLoop {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut failures: u32 = 0;
        loop {
            let request = match self.handshake_request() {
                Ok(request) => request,
                Err(err) => {
                    self.notify(TransportEvent::Error(err.to_string()));
                    self.notify(TransportEvent::GaveUp);
                    return;
                }
            };

            let attempt = tokio::select! {
                result = connect_async(request) => result,
                () = wait_for_close(&mut commands) => return,
            };

            match attempt {
                Ok((stream, _)) => {
                    failures = 0;
                    info!(user_id = %self.user_id, "realtime: socket open");
                    if !self.notify(TransportEvent::Open) {
                        return;
                    }
                    match self.pump(stream, &mut commands).await {
                        PumpOutcome::Shutdown => return,
                        PumpOutcome::Dropped(reason) => {
                            warn!(user_id = %self.user_id, %reason, "realtime: socket dropped");
                            if !self.notify(TransportEvent::Closed { reason }) {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        user_id = %self.user_id,
                        attempt = failures,
                        max_attempts = self.policy.max_attempts,
                        "realtime: connect failed: {err}"
                    );
                    if is_unauthorized(&err) && !self.refresh_after_rejection().await {
                        self.notify(TransportEvent::Error(
                            "handshake rejected and session could not be refreshed".into(),
                        ));
                        self.notify(TransportEvent::GaveUp);
                        return;
                    }
                    if !self.notify(TransportEvent::Error(err.to_string())) {
                        return;
                    }
                }
            }

            if failures >= self.policy.max_attempts {
                warn!(user_id = %self.user_id, failures, "realtime: reconnect attempts exhausted");
                self.notify(TransportEvent::GaveUp);
                return;
            }

            let delay = self.policy.delay_for_attempt(failures);
            debug!(
                user_id = %self.user_id,
                delay_ms = delay.as_millis() as u64,
                "realtime: reconnect scheduled"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = wait_for_close(&mut commands) => return,
            }
        }
    }

    fn handshake_request(&self) -> Result<Request, WsError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(cookies) = self.jar.cookies(&self.cookie_url) {
            if let Ok(value) = HeaderValue::from_bytes(cookies.as_bytes()) {
                request.headers_mut().insert(COOKIE, value);
            }
        }
        Ok(request)
    }

    async fn refresh_after_rejection(&self) -> bool {
        let Some(gate) = &self.refresh_gate else {
            return true;
        };
        info!(user_id = %self.user_id, "realtime: handshake unauthorized; refreshing session");
        gate.ensure_fresh_token().await.is_some()
    }

    async fn pump(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> PumpOutcome {
        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send(text)) => {
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            return PumpOutcome::Dropped(format!("send failed: {err}"));
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                        info!(user_id = %self.user_id, "realtime: socket closed by client");
                        return PumpOutcome::Shutdown;
                    }
                },
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            if !self.notify(TransportEvent::Frame(frame)) {
                                return PumpOutcome::Shutdown;
                            }
                        }
                        Err(err) => warn!(user_id = %self.user_id, "realtime: invalid server frame: {err}"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        return PumpOutcome::Dropped(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return PumpOutcome::Dropped(err.to_string()),
                    None => return PumpOutcome::Dropped("stream ended".to_string()),
                },
            }
        }
    }

    /// False once the owner stopped listening.
    fn notify(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Resolves when the owner asks to close or drops the transport. Frames sent
/// in the meantime have no socket to go to and are discarded.
async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Send(_)) => debug!("realtime: dropping frame while disconnected"),
            Some(Command::Close) | None => return,
        }
    }
}

fn is_unauthorized(err: &WsError) -> bool {
    matches!(err, WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED)
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
