use std::time::Duration;

use serde_json::Value;

use crate::gateway::protocol::ErrorReason;
use crate::store::{
    Channel, ChannelUnread, Emoji, MemberKey, Message, Role, Server, ServerMember, User, Webhook,
};

/// Why the connection reported an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorPayload {
    /// Socket-level failure; the connection drops and may reconnect.
    Transport(String),
    /// `Error` frame sent by the server.
    Protocol(ErrorReason),
    /// The server sent a frame the protocol forbids in the current state.
    InvalidTransition(String),
}

/// Domain notification published after the store has been updated.
///
/// Update variants carry the record before and after the change; delete
/// variants carry the last snapshot.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    // ── Connection lifecycle ──
    Connecting,
    Connected,
    Disconnected,
    Ready,
    Logout,
    Heartbeat { latency: Duration },
    Error(ErrorPayload),

    // ── Messages ──
    MessageCreate(Message),
    MessageUpdate {
        message: Message,
        previous: Message,
    },
    MessageDelete(Message),
    /// A delete for a message that was never cached.
    MessageDeleteUncached {
        id: String,
        channel_id: String,
    },
    MessageDeleteBulk {
        channel_id: String,
        messages: Vec<Message>,
    },
    MessageReactionAdd {
        message: Message,
        user_id: String,
        emoji: String,
    },
    MessageReactionRemove {
        message: Message,
        user_id: String,
        emoji: String,
    },
    MessageReactionRemoveEmoji {
        message: Message,
        emoji: String,
    },

    // ── Channels ──
    ChannelCreate(Channel),
    ChannelUpdate {
        channel: Channel,
        previous: Channel,
    },
    ChannelDelete(Channel),
    ChannelGroupJoin {
        channel: Channel,
        user_id: String,
    },
    ChannelGroupLeave {
        channel: Channel,
        user_id: String,
    },
    ChannelStartTyping {
        channel: Channel,
        user_id: String,
    },
    ChannelStopTyping {
        channel: Channel,
        user_id: String,
    },
    ChannelAcknowledged {
        unread: ChannelUnread,
        message_id: String,
    },

    // ── Servers ──
    ServerCreate(Server),
    ServerUpdate {
        server: Server,
        previous: Server,
    },
    ServerDelete(Server),
    /// The current user left or was removed from a server.
    ServerLeave(Server),
    ServerRoleUpdate {
        server: Server,
        role_id: String,
        previous: Option<Role>,
    },
    ServerRoleDelete {
        server: Server,
        role_id: String,
        role: Role,
    },

    // ── Members ──
    ServerMemberJoin(ServerMember),
    ServerMemberUpdate {
        member: ServerMember,
        previous: ServerMember,
    },
    ServerMemberLeave(MemberKey),

    // ── Users ──
    UserUpdate {
        user: User,
        previous: User,
    },
    UserSettingsUpdate {
        id: String,
        update: Value,
    },

    // ── Emojis, webhooks, sessions ──
    EmojiCreate(Emoji),
    EmojiDelete(Emoji),
    WebhookCreate(Webhook),
    WebhookUpdate {
        webhook: Webhook,
        previous: Webhook,
    },
    WebhookDelete(Webhook),
    SessionDelete {
        id: String,
    },
}

impl ClientEvent {
    /// Stable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Ready => "ready",
            Self::Logout => "logout",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Error(_) => "error",
            Self::MessageCreate(_) => "message_create",
            Self::MessageUpdate { .. } => "message_update",
            Self::MessageDelete(_) => "message_delete",
            Self::MessageDeleteUncached { .. } => "message_delete_uncached",
            Self::MessageDeleteBulk { .. } => "message_delete_bulk",
            Self::MessageReactionAdd { .. } => "message_reaction_add",
            Self::MessageReactionRemove { .. } => "message_reaction_remove",
            Self::MessageReactionRemoveEmoji { .. } => "message_reaction_remove_emoji",
            Self::ChannelCreate(_) => "channel_create",
            Self::ChannelUpdate { .. } => "channel_update",
            Self::ChannelDelete(_) => "channel_delete",
            Self::ChannelGroupJoin { .. } => "channel_group_join",
            Self::ChannelGroupLeave { .. } => "channel_group_leave",
            Self::ChannelStartTyping { .. } => "channel_start_typing",
            Self::ChannelStopTyping { .. } => "channel_stop_typing",
            Self::ChannelAcknowledged { .. } => "channel_acknowledged",
            Self::ServerCreate(_) => "server_create",
            Self::ServerUpdate { .. } => "server_update",
            Self::ServerDelete(_) => "server_delete",
            Self::ServerLeave(_) => "server_leave",
            Self::ServerRoleUpdate { .. } => "server_role_update",
            Self::ServerRoleDelete { .. } => "server_role_delete",
            Self::ServerMemberJoin(_) => "server_member_join",
            Self::ServerMemberUpdate { .. } => "server_member_update",
            Self::ServerMemberLeave(_) => "server_member_leave",
            Self::UserUpdate { .. } => "user_update",
            Self::UserSettingsUpdate { .. } => "user_settings_update",
            Self::EmojiCreate(_) => "emoji_create",
            Self::EmojiDelete(_) => "emoji_delete",
            Self::WebhookCreate(_) => "webhook_create",
            Self::WebhookUpdate { .. } => "webhook_update",
            Self::WebhookDelete(_) => "webhook_delete",
            Self::SessionDelete { .. } => "session_delete",
        }
    }
}
