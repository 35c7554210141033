pub mod collection;
pub mod hydration;
pub mod models;
pub mod reactive;
pub mod ulid;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

pub use collection::{Collection, MemberCollection};
pub use hydration::HydrationContext;
pub use models::*;

/// The kinds of record the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Channel,
    Server,
    Message,
    Member,
    Emoji,
    ChannelUnread,
    Session,
    Webhook,
    Bot,
    Role,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User => "user",
            Self::Channel => "channel",
            Self::Server => "server",
            Self::Message => "message",
            Self::Member => "member",
            Self::Emoji => "emoji",
            Self::ChannelUnread => "channel_unread",
            Self::Session => "session",
            Self::Webhook => "webhook",
            Self::Bot => "bot",
            Self::Role => "role",
        };
        f.write_str(name)
    }
}

/// Normalized in-memory mirror of everything the connection has seen.
#[derive(Debug)]
pub struct ObjectStore {
    pub users: Collection<User>,
    pub channels: Collection<Channel>,
    pub servers: Collection<Server>,
    pub messages: Collection<Message>,
    pub members: MemberCollection,
    pub emojis: Collection<Emoji>,
    pub channel_unreads: Collection<ChannelUnread>,
    pub sessions: Collection<SessionInfo>,
    pub webhooks: Collection<Webhook>,
    pub bots: Collection<Bot>,
    self_id: Option<String>,
}

impl ObjectStore {
    pub fn new(ctx: HydrationContext, allow_partials: bool) -> Self {
        let ctx = Arc::new(ctx);
        Self {
            users: Collection::new(Arc::clone(&ctx), allow_partials),
            channels: Collection::new(Arc::clone(&ctx), allow_partials),
            servers: Collection::new(Arc::clone(&ctx), allow_partials),
            messages: Collection::new(Arc::clone(&ctx), allow_partials),
            members: MemberCollection::new(Arc::clone(&ctx), allow_partials),
            emojis: Collection::new(Arc::clone(&ctx), allow_partials),
            channel_unreads: Collection::new(Arc::clone(&ctx), allow_partials),
            sessions: Collection::new(Arc::clone(&ctx), allow_partials),
            webhooks: Collection::new(Arc::clone(&ctx), allow_partials),
            bots: Collection::new(ctx, allow_partials),
            self_id: None,
        }
    }

    /// Id of the authenticated user, known once `Ready` has been applied.
    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    pub fn set_self_id(&mut self, id: impl Into<String>) {
        self.self_id = Some(id.into());
    }

    pub fn current_user(&self) -> Option<&User> {
        self.users.get_ref(self.self_id.as_deref()?)
    }

    /// Remove a server along with its channels and memberships. Returns the
    /// removed server, if it was cached.
    pub fn delete_server_cascade(&mut self, server_id: &str) -> Option<Server> {
        let channel_ids: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, c)| c.server_id.as_deref() == Some(server_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &channel_ids {
            self.channels.delete(id);
        }

        let member_keys = self.members.keys_in_server(server_id);
        for key in &member_keys {
            self.members.delete_by_key(key);
        }

        debug!(
            %server_id,
            channels = channel_ids.len(),
            members = member_keys.len(),
            "server cascade"
        );
        self.servers.delete(server_id)
    }

    /// Remove a channel and detach it from its parent server.
    pub fn delete_channel(&mut self, channel_id: &str) -> Option<Channel> {
        let channel = self.channels.delete(channel_id)?;
        if let Some(server) = channel
            .server_id
            .as_deref()
            .and_then(|id| self.servers.get_mut(id))
        {
            server.channel_ids.remove(&channel.id);
        }
        Some(channel)
    }

    /// Drop every cached record, keeping configuration.
    pub fn reset(&mut self) {
        self.users.clear();
        self.channels.clear();
        self.servers.clear();
        self.messages.clear();
        self.members.clear();
        self.emojis.clear();
        self.channel_unreads.clear();
        self.sessions.clear();
        self.webhooks.clear();
        self.bots.clear();
        self.self_id = None;
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new(HydrationContext::default(), true)
    }
}

/// Entity id of a raw wire object (`_id`, falling back to `id`).
pub fn wire_id(raw: &Value) -> Option<&str> {
    raw.get("_id")
        .or_else(|| raw.get("id"))
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_cascade_removes_channels_and_members() {
        let mut store = ObjectStore::default();
        store
            .servers
            .get_or_create("S1", &json!({ "_id": "S1", "channels": ["C1", "C2"] }), None);
        for id in ["C1", "C2"] {
            store.channels.get_or_create(
                id,
                &json!({ "_id": id, "channel_type": "TextChannel", "server": "S1" }),
                None,
            );
        }
        store.channels.get_or_create(
            "C3",
            &json!({ "_id": "C3", "channel_type": "TextChannel", "server": "S2" }),
            None,
        );
        store
            .members
            .get_or_create_by_key(&MemberKey::new("S1", "U1"), &json!({}), None);

        assert!(store.delete_server_cascade("S1").is_some());
        assert!(!store.servers.has("S1"));
        assert!(!store.channels.has("C1"));
        assert!(!store.channels.has("C2"));
        assert!(store.channels.has("C3"));
        assert!(store.members.is_empty());
    }

    #[test]
    fn test_channel_delete_detaches_from_server() {
        let mut store = ObjectStore::default();
        store
            .servers
            .get_or_create("S1", &json!({ "channels": ["C1", "C2"] }), None);
        store
            .channels
            .get_or_create("C1", &json!({ "server": "S1" }), None);

        store.delete_channel("C1");
        let server = store.servers.get_ref("S1").unwrap();
        assert!(!server.channel_ids.contains(&"C1".to_string()));
        assert!(server.channel_ids.contains(&"C2".to_string()));
    }

    #[test]
    fn test_wire_id() {
        assert_eq!(wire_id(&json!({ "_id": "A" })), Some("A"));
        assert_eq!(wire_id(&json!({ "id": "B" })), Some("B"));
        assert_eq!(wire_id(&json!({ "name": "x" })), None);
    }
}
