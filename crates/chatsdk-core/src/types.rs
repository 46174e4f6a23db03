use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::SessionError, parser::Frame};

/// Authoritative connection state published by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Connection {
    /// No connection and no connect attempt in flight.
    #[default]
    NotConnected,
    /// Transport connect issued; waiting for the first health check.
    Connecting,
    /// Health check received; the session is live.
    Connected {
        /// Server-assigned connection id, never empty.
        connection_id: String,
        /// Identity reported by the server for this session.
        user: User,
    },
    /// Terminal until an explicit reconnect call.
    Disconnected {
        /// Stop error that ended the session.
        error: SessionError,
    },
}

impl Connection {
    /// `true` only for `Connected`.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// `true` for `Connected` and `Connecting`.
    pub fn is_connected_or_connecting(&self) -> bool {
        matches!(self, Self::Connected { .. } | Self::Connecting)
    }

    /// Connection id while connected.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            Self::Connected { connection_id, .. } => Some(connection_id),
            _ => None,
        }
    }

    /// Session identity while connected.
    pub fn user(&self) -> Option<&User> {
        match self {
            Self::Connected { user, .. } => Some(user),
            _ => None,
        }
    }

    /// Short state name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Connecting => "connecting",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}

/// Chat user record. Only `id` and `mutes` are interpreted by the session core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Stable user id.
    pub id: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Users muted by this user.
    #[serde(default)]
    pub mutes: Vec<Mute>,
    /// Remaining service-defined fields, kept opaque.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl User {
    /// Construct a user with no mutes and no extra fields.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            mutes: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// One entry of a user's mute list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mute {
    /// Id of the muted user.
    pub target_id: String,
    /// Creation time as reported by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Typed event decoded from a stream frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// First event on a new connection, then repeated as keep-alive acknowledgement.
    HealthCheck {
        /// Server-assigned connection id.
        connection_id: String,
        /// Session identity; present on the first health check of a connection.
        me: Option<User>,
    },
    /// The current user's mute list changed.
    NotificationMutesUpdated {
        /// Updated user record carrying the new mute list.
        me: User,
    },
    /// Any other domain event (messages, channels, reactions), opaque to the core.
    Other {
        /// Event type string from the frame.
        kind: String,
        /// Full decoded payload.
        payload: Value,
    },
}

impl Event {
    /// Event type string as carried on the wire.
    pub fn kind(&self) -> &str {
        match self {
            Self::HealthCheck { .. } => "health.check",
            Self::NotificationMutesUpdated { .. } => "notification.mutes_updated",
            Self::Other { kind, .. } => kind,
        }
    }
}

/// Structured error the server sends in place of an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerError {
    /// Service-specific error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// HTTP-equivalent status, when the service reports one.
    #[serde(default, rename = "StatusCode", alias = "status_code")]
    pub status_code: Option<u16>,
}

/// Application lifecycle state reported by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
}

/// Network reachability reported by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Reachability {
    Available,
    Unavailable,
}

/// Event reported by the persistent stream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Socket-level handshake completed.
    Connected,
    /// Socket closed, with the cause when it was not a clean close.
    Disconnected { error: Option<SessionError> },
    /// One raw frame arrived.
    Frame(Frame),
}

impl TransportEvent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Frame(_) => "frame",
        }
    }
}
