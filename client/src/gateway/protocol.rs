//! Realtime wire format.
//!
//! Frames are JSON objects discriminated by `type`. Inbound frames decode into
//! [`ServerEvent`]; the handful of frames the client sends are [`ClientFrame`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::MemberKey;

/// Event protocol revisions this client can speak.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    #[default]
    V1,
}

impl ProtocolVersion {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::V1 => 1,
        }
    }
}

/// Frame encoding negotiated in the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportFormat {
    #[default]
    Json,
}

impl TransportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
        }
    }
}

/// Reason carried by an `Error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    InternalError,
    InvalidSession,
    OnboardingNotFinished,
    AlreadyAuthenticated,
    #[serde(other)]
    Unknown,
}

/// Session revocation notices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuthEvent {
    DeleteSession {
        user_id: String,
        session_id: String,
    },
    DeleteAllSessions {
        user_id: String,
        #[serde(default)]
        exclude_session_id: Option<String>,
    },
}

/// Every frame the server can push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Several frames delivered together, to be applied in order.
    Bulk { v: Vec<Value> },
    Authenticated,
    Logout,
    Ready {
        #[serde(default)]
        users: Vec<Value>,
        #[serde(default)]
        servers: Vec<Value>,
        #[serde(default)]
        channels: Vec<Value>,
        #[serde(default)]
        members: Vec<Value>,
        #[serde(default)]
        emojis: Vec<Value>,
    },
    Ping { data: u64 },
    Pong { data: u64 },
    Error { error: ErrorReason },

    // ── Messages ──
    Message(Value),
    MessageUpdate {
        id: String,
        channel: String,
        data: Value,
        #[serde(default)]
        clear: Vec<String>,
    },
    MessageAppend {
        id: String,
        channel: String,
        append: Value,
    },
    MessageDelete { id: String, channel: String },
    BulkMessageDelete { channel: String, ids: Vec<String> },
    MessageReact {
        id: String,
        channel_id: String,
        user_id: String,
        emoji_id: String,
    },
    MessageUnreact {
        id: String,
        channel_id: String,
        user_id: String,
        emoji_id: String,
    },
    MessageRemoveReaction {
        id: String,
        channel_id: String,
        emoji_id: String,
    },

    // ── Channels ──
    ChannelCreate(Value),
    ChannelUpdate {
        id: String,
        data: Value,
        #[serde(default)]
        clear: Vec<String>,
    },
    ChannelDelete { id: String },
    ChannelGroupJoin { id: String, user: String },
    ChannelGroupLeave { id: String, user: String },
    ChannelStartTyping { id: String, user: String },
    ChannelStopTyping { id: String, user: String },
    ChannelAck {
        id: String,
        user: String,
        message_id: String,
    },

    // ── Servers ──
    ServerCreate {
        id: String,
        server: Value,
        #[serde(default)]
        channels: Vec<Value>,
        #[serde(default)]
        emojis: Vec<Value>,
    },
    ServerUpdate {
        id: String,
        data: Value,
        #[serde(default)]
        clear: Vec<String>,
    },
    ServerDelete { id: String },
    ServerMemberUpdate {
        id: MemberKey,
        data: Value,
        #[serde(default)]
        clear: Vec<String>,
    },
    ServerMemberJoin {
        id: String,
        user: String,
        #[serde(default)]
        member: Option<Value>,
    },
    ServerMemberLeave { id: String, user: String },
    ServerRoleUpdate {
        id: String,
        role_id: String,
        data: Value,
        #[serde(default)]
        clear: Vec<String>,
    },
    ServerRoleDelete { id: String, role_id: String },

    // ── Users ──
    UserUpdate {
        id: String,
        data: Value,
        #[serde(default)]
        clear: Vec<String>,
    },
    UserRelationship {
        id: String,
        user: Value,
        #[serde(default)]
        status: Option<String>,
    },
    UserSettingsUpdate { id: String, update: Value },
    UserPlatformWipe { user_id: String, flags: u64 },

    // ── Emojis and webhooks ──
    EmojiCreate(Value),
    EmojiDelete { id: String },
    WebhookCreate(Value),
    WebhookUpdate {
        id: String,
        data: Value,
        #[serde(default)]
        remove: Vec<String>,
    },
    WebhookDelete { id: String },

    Auth(AuthEvent),
}

impl ServerEvent {
    /// The wire discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bulk { .. } => "Bulk",
            Self::Authenticated => "Authenticated",
            Self::Logout => "Logout",
            Self::Ready { .. } => "Ready",
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
            Self::Error { .. } => "Error",
            Self::Message(_) => "Message",
            Self::MessageUpdate { .. } => "MessageUpdate",
            Self::MessageAppend { .. } => "MessageAppend",
            Self::MessageDelete { .. } => "MessageDelete",
            Self::BulkMessageDelete { .. } => "BulkMessageDelete",
            Self::MessageReact { .. } => "MessageReact",
            Self::MessageUnreact { .. } => "MessageUnreact",
            Self::MessageRemoveReaction { .. } => "MessageRemoveReaction",
            Self::ChannelCreate(_) => "ChannelCreate",
            Self::ChannelUpdate { .. } => "ChannelUpdate",
            Self::ChannelDelete { .. } => "ChannelDelete",
            Self::ChannelGroupJoin { .. } => "ChannelGroupJoin",
            Self::ChannelGroupLeave { .. } => "ChannelGroupLeave",
            Self::ChannelStartTyping { .. } => "ChannelStartTyping",
            Self::ChannelStopTyping { .. } => "ChannelStopTyping",
            Self::ChannelAck { .. } => "ChannelAck",
            Self::ServerCreate { .. } => "ServerCreate",
            Self::ServerUpdate { .. } => "ServerUpdate",
            Self::ServerDelete { .. } => "ServerDelete",
            Self::ServerMemberUpdate { .. } => "ServerMemberUpdate",
            Self::ServerMemberJoin { .. } => "ServerMemberJoin",
            Self::ServerMemberLeave { .. } => "ServerMemberLeave",
            Self::ServerRoleUpdate { .. } => "ServerRoleUpdate",
            Self::ServerRoleDelete { .. } => "ServerRoleDelete",
            Self::UserUpdate { .. } => "UserUpdate",
            Self::UserRelationship { .. } => "UserRelationship",
            Self::UserSettingsUpdate { .. } => "UserSettingsUpdate",
            Self::UserPlatformWipe { .. } => "UserPlatformWipe",
            Self::EmojiCreate(_) => "EmojiCreate",
            Self::EmojiDelete { .. } => "EmojiDelete",
            Self::WebhookCreate(_) => "WebhookCreate",
            Self::WebhookUpdate { .. } => "WebhookUpdate",
            Self::WebhookDelete { .. } => "WebhookDelete",
            Self::Auth(_) => "Auth",
        }
    }

    /// Decode one text frame using the negotiated protocol.
    pub fn decode(version: ProtocolVersion, text: &str) -> Result<Self, serde_json::Error> {
        match version {
            ProtocolVersion::V1 => serde_json::from_str(text),
        }
    }

    /// Decode a frame that was nested inside another (a `Bulk` entry).
    pub fn decode_value(version: ProtocolVersion, value: Value) -> Result<Self, serde_json::Error> {
        match version {
            ProtocolVersion::V1 => serde_json::from_value(value),
        }
    }
}

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    Ping { data: u64 },
    Pong { data: u64 },
    BeginTyping { channel: String },
    EndTyping { channel: String },
    Subscribe { server_id: String },
}

impl ClientFrame {
    pub fn to_text(&self) -> String {
        // A tagged enum of strings and integers always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}
