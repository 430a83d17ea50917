use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{domain::UserId, error::ApiError};

/// Signed-in user record as returned by the backend.
///
/// Fields the session core does not interpret are kept in `extra` so a local
/// patch or a refresh round trip never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            display_name: display_name.into(),
            avatar_url: None,
            extra: Map::new(),
        }
    }

    pub fn apply_patch(&mut self, patch: IdentityPatch) {
        if let Some(display_name) = patch.display_name {
            self.display_name = display_name;
        }
        if let Some(avatar_url) = patch.avatar_url {
            self.avatar_url = avatar_url;
        }
        for (key, value) in patch.extra {
            if value.is_null() {
                self.extra.remove(&key);
            } else {
                self.extra.insert(key, value);
            }
        }
    }
}

/// Partial identity update applied locally after a profile edit.
///
/// `avatar_url: Some(None)` clears the avatar; a `null` entry in `extra`
/// removes that field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<Option<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Body of `/auth/login`, `/auth/refresh-token` and `/me`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEnvelope {
    pub user: Identity,
}

/// Frames the client sends to the realtime broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinRoom { room: String },
    PresenceOnline { user_id: UserId },
}

/// Frames the realtime broker pushes to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Joined { room: String },
    PresenceChanged { user_id: UserId, online: bool },
    Error(ApiError),
}
