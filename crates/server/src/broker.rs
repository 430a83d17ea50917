use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{room_for_user, Role, UserId},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{ClientFrame, ServerFrame},
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{
    api::{authenticate, reject},
    app_state::AppState,
};

/// Live connection count per user; a user is online while any connection has
/// announced presence.
#[derive(Debug, Default)]
pub(crate) struct PresenceRegistry {
    counts: HashMap<UserId, usize>,
}

impl PresenceRegistry {
    /// Returns true when the user just came online.
    pub(crate) fn connect(&mut self, user_id: &UserId) -> bool {
        let count = self.counts.entry(user_id.clone()).or_default();
        *count += 1;
        *count == 1
    }

    /// Returns true when the user's last connection went away.
    pub(crate) fn disconnect(&mut self, user_id: &UserId) -> bool {
        let Some(count) = self.counts.get_mut(user_id) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        self.counts.remove(user_id);
        true
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    user_id: UserId,
    #[serde(default)]
    role: Role,
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let identity = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(err) => {
            debug!(user_id = %q.user_id, "realtime: handshake rejected: {}", err.message);
            return reject(err).into_response();
        }
    };
    if identity.id != q.user_id {
        warn!(user_id = %identity.id, claimed = %q.user_id, "realtime: handshake for another user");
        return reject(ApiException::new(
            ErrorCode::Forbidden,
            "handshake user does not match session",
        ))
        .into_response();
    }
    info!(user_id = %identity.id, role = %q.role, "realtime: handshake accepted");
    ws.on_upgrade(move |socket| ws_connection(state, socket, identity.id))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();
    let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<ServerFrame>();

    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                reply = replies_rx.recv() => match reply {
                    Some(frame) => frame,
                    None => break,
                },
                event = events_rx.recv() => match event {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let text = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut announced = false;
    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let reply = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => handle_client_frame(&state, &user_id, frame, &mut announced).await,
            Err(err) => Some(ServerFrame::Error(ApiError::new(
                ErrorCode::Validation,
                format!("invalid frame: {err}"),
            ))),
        };
        if let Some(reply) = reply {
            if replies_tx.send(reply).is_err() {
                break;
            }
        }
    }

    send_task.abort();
    if announced && state.presence.lock().await.disconnect(&user_id) {
        info!(%user_id, "realtime: user offline");
        let _ = state.events.send(ServerFrame::PresenceChanged {
            user_id,
            online: false,
        });
    }
}

/// Applies one client frame; returns the reply addressed to this connection only.
pub(crate) async fn handle_client_frame(
    state: &AppState,
    user_id: &UserId,
    frame: ClientFrame,
    announced: &mut bool,
) -> Option<ServerFrame> {
    match frame {
        ClientFrame::JoinRoom { room } => {
            if room != room_for_user(user_id) {
                warn!(%user_id, %room, "realtime: join refused");
                return Some(ServerFrame::Error(ApiError::new(
                    ErrorCode::Forbidden,
                    "only the caller's own room can be joined",
                )));
            }
            debug!(%user_id, %room, "realtime: joined");
            Some(ServerFrame::Joined { room })
        }
        ClientFrame::PresenceOnline { user_id: claimed } => {
            if &claimed != user_id {
                return Some(ServerFrame::Error(ApiError::new(
                    ErrorCode::Forbidden,
                    "presence can only be announced for the caller",
                )));
            }
            if !*announced {
                *announced = true;
                if state.presence.lock().await.connect(user_id) {
                    info!(%user_id, "realtime: user online");
                }
            }
            let _ = state.events.send(ServerFrame::PresenceChanged {
                user_id: claimed,
                online: true,
            });
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/broker_tests.rs"]
mod tests;
