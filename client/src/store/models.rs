use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::events::ClientEvent;
use crate::error::HydrationError;
use crate::store::EntityKind;
use crate::store::hydration::{self, Schema, decode_field};
use crate::store::reactive::{ReactiveMap, ReactiveSet};
use crate::store::ulid::{self, ULID_LENGTH};

/// A canonical record held in a store collection.
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    const KIND: EntityKind;

    /// A record carrying only its id, with empty containers.
    fn empty(id: &str) -> Self;

    fn schema() -> &'static Schema;

    /// Write one canonical value into the typed field it names.
    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError>;

    /// Null out a field named in an update's clear list.
    fn reset(&mut self, field: &str) -> Result<(), HydrationError>;

    /// Notification to emit when the record first becomes full.
    fn created(&self) -> Option<ClientEvent> {
        None
    }

    fn decode<T: DeserializeOwned>(field: &str, value: Value) -> Result<T, HydrationError> {
        decode_field(Self::KIND, field, value)
    }

    fn unknown(field: &str) -> HydrationError {
        HydrationError::UnknownField {
            kind: Self::KIND,
            field: field.to_string(),
        }
    }
}

// ── Shared shapes ──

/// An uploaded file, with its public URL already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    pub tag: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionOverride {
    pub allow: u64,
    pub deny: u64,
}

impl PermissionOverride {
    /// Fold onto a running mask. Unknown bits survive.
    pub fn apply(&self, mask: u64) -> u64 {
        (mask | self.allow) & !self.deny
    }
}

// ── Users ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipStatus {
    #[default]
    None,
    /// The viewer itself.
    User,
    Friend,
    Outgoing,
    Incoming,
    Blocked,
    BlockedOther,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Presence {
    Online,
    Idle,
    Focus,
    Busy,
    Invisible,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatus {
    pub text: Option<String>,
    pub presence: Option<Presence>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub content: Option<String>,
    pub background: Option<FileRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotInformation {
    pub owner_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub discriminator: String,
    pub display_name: Option<String>,
    pub avatar: Option<FileRef>,
    pub badges: u64,
    pub status: Option<UserStatus>,
    pub profile: Option<UserProfile>,
    pub flags: u64,
    pub privileged: bool,
    pub bot: Option<BotInformation>,
    pub relationship: RelationshipStatus,
    pub online: bool,
}

impl User {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        ulid::timestamp(&self.id)
    }

    pub fn is_bot(&self) -> bool {
        self.bot.is_some()
    }

    /// Display name if set, otherwise the username.
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

impl Entity for User {
    const KIND: EntityKind = EntityKind::User;

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    fn schema() -> &'static Schema {
        &hydration::USER
    }

    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError> {
        match field {
            "id" => self.id = Self::decode(field, value)?,
            "username" => self.username = Self::decode(field, value)?,
            "discriminator" => self.discriminator = Self::decode(field, value)?,
            "display_name" => self.display_name = Self::decode(field, value)?,
            "avatar" => self.avatar = Self::decode(field, value)?,
            "badges" => self.badges = Self::decode(field, value)?,
            "status" => self.status = Self::decode(field, value)?,
            "profile" => self.profile = Self::decode(field, value)?,
            "flags" => self.flags = Self::decode(field, value)?,
            "privileged" => self.privileged = Self::decode(field, value)?,
            "bot" => self.bot = Self::decode(field, value)?,
            "relationship" => self.relationship = Self::decode(field, value)?,
            "online" => self.online = Self::decode(field, value)?,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn reset(&mut self, field: &str) -> Result<(), HydrationError> {
        match field {
            "avatar" => self.avatar = None,
            "display_name" => self.display_name = None,
            "status.text" => {
                if let Some(status) = self.status.as_mut() {
                    status.text = None;
                }
            }
            "status.presence" => {
                if let Some(status) = self.status.as_mut() {
                    status.presence = None;
                }
            }
            "profile.content" => {
                if let Some(profile) = self.profile.as_mut() {
                    profile.content = None;
                }
            }
            "profile.background" => {
                if let Some(profile) = self.profile.as_mut() {
                    profile.background = None;
                }
            }
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }
}

// ── Channels ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    SavedMessages,
    DirectMessage,
    Group,
    #[default]
    TextChannel,
    VoiceChannel,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channel {
    pub id: String,
    pub channel_type: ChannelType,
    /// Owner of a saved-messages channel.
    pub user_id: Option<String>,
    pub name: Option<String>,
    /// Owner of a group.
    pub owner_id: Option<String>,
    pub description: Option<String>,
    pub recipient_ids: ReactiveSet<String>,
    pub icon: Option<FileRef>,
    pub last_message_id: Option<String>,
    pub active: bool,
    /// Group permission mask.
    pub permissions: Option<u64>,
    pub role_permissions: HashMap<String, PermissionOverride>,
    pub default_permissions: Option<PermissionOverride>,
    pub server_id: Option<String>,
    pub nsfw: bool,
    /// Local only; fed by typing events.
    pub typing_ids: ReactiveSet<String>,
}

impl Channel {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        ulid::timestamp(&self.id)
    }

    /// The other participant of a direct message.
    pub fn recipient_other_than(&self, self_id: &str) -> Option<&String> {
        self.recipient_ids.iter().find(|id| id.as_str() != self_id)
    }
}

impl Entity for Channel {
    const KIND: EntityKind = EntityKind::Channel;

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    fn schema() -> &'static Schema {
        &hydration::CHANNEL
    }

    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError> {
        match field {
            "id" => self.id = Self::decode(field, value)?,
            "channel_type" => self.channel_type = Self::decode(field, value)?,
            "user_id" => self.user_id = Self::decode(field, value)?,
            "name" => self.name = Self::decode(field, value)?,
            "owner_id" => self.owner_id = Self::decode(field, value)?,
            "description" => self.description = Self::decode(field, value)?,
            "recipient_ids" => self
                .recipient_ids
                .replace(Self::decode::<Vec<String>>(field, value)?),
            "icon" => self.icon = Self::decode(field, value)?,
            "last_message_id" => self.last_message_id = Self::decode(field, value)?,
            "active" => self.active = Self::decode(field, value)?,
            "permissions" => self.permissions = Self::decode(field, value)?,
            "role_permissions" => self.role_permissions = Self::decode(field, value)?,
            "default_permissions" => self.default_permissions = Self::decode(field, value)?,
            "server_id" => self.server_id = Self::decode(field, value)?,
            "nsfw" => self.nsfw = Self::decode(field, value)?,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn reset(&mut self, field: &str) -> Result<(), HydrationError> {
        match field {
            "description" => self.description = None,
            "icon" => self.icon = None,
            "default_permissions" => self.default_permissions = None,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn created(&self) -> Option<ClientEvent> {
        Some(ClientEvent::ChannelCreate(self.clone()))
    }
}

// ── Servers ──

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub permissions: PermissionOverride,
    pub colour: Option<String>,
    #[serde(default)]
    pub hoist: bool,
    /// Lower rank takes precedence.
    #[serde(default)]
    pub rank: i64,
}

impl Entity for Role {
    const KIND: EntityKind = EntityKind::Role;

    fn empty(_id: &str) -> Self {
        Self::default()
    }

    fn schema() -> &'static Schema {
        &hydration::ROLE
    }

    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError> {
        match field {
            "name" => self.name = Self::decode(field, value)?,
            "permissions" => self.permissions = Self::decode(field, value)?,
            "colour" => self.colour = Self::decode(field, value)?,
            "hoist" => self.hoist = Self::decode(field, value)?,
            "rank" => self.rank = Self::decode(field, value)?,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn reset(&mut self, field: &str) -> Result<(), HydrationError> {
        match field {
            "colour" => self.colour = None,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessages {
    pub user_joined: Option<String>,
    pub user_left: Option<String>,
    pub user_kicked: Option<String>,
    pub user_banned: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Server {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub description: Option<String>,
    pub channel_ids: ReactiveSet<String>,
    pub categories: Option<Vec<Category>>,
    pub system_messages: Option<SystemMessages>,
    pub roles: ReactiveMap<String, Role>,
    pub default_permissions: u64,
    pub icon: Option<FileRef>,
    pub banner: Option<FileRef>,
    pub flags: u64,
    pub nsfw: bool,
    pub analytics: bool,
    pub discoverable: bool,
}

impl Server {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        ulid::timestamp(&self.id)
    }
}

impl Entity for Server {
    const KIND: EntityKind = EntityKind::Server;

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    fn schema() -> &'static Schema {
        &hydration::SERVER
    }

    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError> {
        match field {
            "id" => self.id = Self::decode(field, value)?,
            "owner_id" => self.owner_id = Self::decode(field, value)?,
            "name" => self.name = Self::decode(field, value)?,
            "description" => self.description = Self::decode(field, value)?,
            "channel_ids" => self
                .channel_ids
                .replace(Self::decode::<Vec<String>>(field, value)?),
            "categories" => self.categories = Self::decode(field, value)?,
            "system_messages" => self.system_messages = Self::decode(field, value)?,
            "roles" => self
                .roles
                .replace(Self::decode::<HashMap<String, Role>>(field, value)?),
            "default_permissions" => self.default_permissions = Self::decode(field, value)?,
            "icon" => self.icon = Self::decode(field, value)?,
            "banner" => self.banner = Self::decode(field, value)?,
            "flags" => self.flags = Self::decode(field, value)?,
            "nsfw" => self.nsfw = Self::decode(field, value)?,
            "analytics" => self.analytics = Self::decode(field, value)?,
            "discoverable" => self.discoverable = Self::decode(field, value)?,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn reset(&mut self, field: &str) -> Result<(), HydrationError> {
        match field {
            "description" => self.description = None,
            "categories" => self.categories = None,
            "system_messages" => self.system_messages = None,
            "icon" => self.icon = None,
            "banner" => self.banner = None,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn created(&self) -> Option<ClientEvent> {
        Some(ClientEvent::ServerCreate(self.clone()))
    }
}

// ── Messages ──

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Masquerade {
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub colour: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub id: String,
    pub nonce: Option<String>,
    pub channel_id: String,
    pub author_id: String,
    pub webhook: Option<Value>,
    pub content: Option<String>,
    pub system: Option<Value>,
    pub attachments: Vec<FileRef>,
    pub edited_at: Option<DateTime<Utc>>,
    pub embeds: Vec<Value>,
    pub mention_ids: Vec<String>,
    pub reply_ids: Vec<String>,
    /// Emoji id → users who reacted with it.
    pub reactions: ReactiveMap<String, ReactiveSet<String>>,
    pub masquerade: Option<Masquerade>,
    pub pinned: bool,
}

impl Message {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        ulid::timestamp(&self.id)
    }

    pub fn reaction_count(&self, emoji: &str) -> usize {
        self.reactions
            .get(&emoji.to_string())
            .map_or(0, ReactiveSet::len)
    }
}

impl Entity for Message {
    const KIND: EntityKind = EntityKind::Message;

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    fn schema() -> &'static Schema {
        &hydration::MESSAGE
    }

    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError> {
        match field {
            "id" => self.id = Self::decode(field, value)?,
            "nonce" => self.nonce = Self::decode(field, value)?,
            "channel_id" => self.channel_id = Self::decode(field, value)?,
            "author_id" => self.author_id = Self::decode(field, value)?,
            "webhook" => self.webhook = Some(value),
            "content" => self.content = Self::decode(field, value)?,
            "system" => self.system = Some(value),
            "attachments" => self.attachments = Self::decode(field, value)?,
            "edited_at" => self.edited_at = Self::decode(field, value)?,
            "embeds" => self.embeds = Self::decode(field, value)?,
            "mention_ids" => self.mention_ids = Self::decode(field, value)?,
            "reply_ids" => self.reply_ids = Self::decode(field, value)?,
            "reactions" => {
                let raw: HashMap<String, Vec<String>> = Self::decode(field, value)?;
                self.reactions.replace(
                    raw.into_iter()
                        .map(|(emoji, users)| (emoji, users.into_iter().collect())),
                );
            }
            "masquerade" => self.masquerade = Self::decode(field, value)?,
            "pinned" => self.pinned = Self::decode(field, value)?,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn reset(&mut self, field: &str) -> Result<(), HydrationError> {
        match field {
            "pinned" => self.pinned = false,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn created(&self) -> Option<ClientEvent> {
        Some(ClientEvent::MessageCreate(self.clone()))
    }
}

// ── Members ──

/// Composite key of a server membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberKey {
    pub server: String,
    pub user: String,
}

impl MemberKey {
    pub fn new(server: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            user: user.into(),
        }
    }

    /// Collection key: server id followed by user id.
    pub fn composite(&self) -> String {
        format!("{}{}", self.server, self.user)
    }

    /// Split a composite key made of two ULIDs.
    pub fn from_composite(key: &str) -> Option<Self> {
        if key.len() != ULID_LENGTH * 2 || !key.is_char_boundary(ULID_LENGTH) {
            return None;
        }
        let (server, user) = key.split_at(ULID_LENGTH);
        Some(Self::new(server, user))
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.user)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMember {
    pub id: MemberKey,
    pub joined_at: Option<DateTime<Utc>>,
    pub nickname: Option<String>,
    pub avatar: Option<FileRef>,
    pub roles: Vec<String>,
    pub timeout: Option<DateTime<Utc>>,
}

impl ServerMember {
    pub fn with_key(id: MemberKey) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.timeout.is_some_and(|until| until > now)
    }
}

impl Entity for ServerMember {
    const KIND: EntityKind = EntityKind::Member;

    fn empty(id: &str) -> Self {
        Self::with_key(MemberKey::from_composite(id).unwrap_or_default())
    }

    fn schema() -> &'static Schema {
        &hydration::MEMBER
    }

    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError> {
        match field {
            "id" => self.id = Self::decode(field, value)?,
            "joined_at" => self.joined_at = Self::decode(field, value)?,
            "nickname" => self.nickname = Self::decode(field, value)?,
            "avatar" => self.avatar = Self::decode(field, value)?,
            "roles" => self.roles = Self::decode(field, value)?,
            "timeout" => self.timeout = Self::decode(field, value)?,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn reset(&mut self, field: &str) -> Result<(), HydrationError> {
        match field {
            "nickname" => self.nickname = None,
            "avatar" => self.avatar = None,
            "roles" => self.roles.clear(),
            "timeout" => self.timeout = None,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }
}

// ── Emojis ──

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EmojiParent {
    Server {
        id: String,
    },
    #[default]
    Detached,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Emoji {
    pub id: String,
    pub parent: EmojiParent,
    pub creator_id: String,
    pub name: String,
    pub animated: bool,
    pub nsfw: bool,
}

impl Emoji {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        ulid::timestamp(&self.id)
    }
}

impl Entity for Emoji {
    const KIND: EntityKind = EntityKind::Emoji;

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    fn schema() -> &'static Schema {
        &hydration::EMOJI
    }

    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError> {
        match field {
            "id" => self.id = Self::decode(field, value)?,
            "parent" => self.parent = Self::decode(field, value)?,
            "creator_id" => self.creator_id = Self::decode(field, value)?,
            "name" => self.name = Self::decode(field, value)?,
            "animated" => self.animated = Self::decode(field, value)?,
            "nsfw" => self.nsfw = Self::decode(field, value)?,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn reset(&mut self, field: &str) -> Result<(), HydrationError> {
        Err(Self::unknown(field))
    }

    fn created(&self) -> Option<ClientEvent> {
        Some(ClientEvent::EmojiCreate(self.clone()))
    }
}

// ── Unreads, sessions, webhooks, bots ──

/// Read state of one channel, keyed by channel id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelUnread {
    pub id: String,
    pub last_message_id: Option<String>,
    pub message_mention_ids: Vec<String>,
}

impl Entity for ChannelUnread {
    const KIND: EntityKind = EntityKind::ChannelUnread;

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    fn schema() -> &'static Schema {
        &hydration::CHANNEL_UNREAD
    }

    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError> {
        match field {
            "id" => self.id = Self::decode(field, value)?,
            "last_message_id" => self.last_message_id = Self::decode(field, value)?,
            "message_mention_ids" => self.message_mention_ids = Self::decode(field, value)?,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn reset(&mut self, field: &str) -> Result<(), HydrationError> {
        Err(Self::unknown(field))
    }
}

/// A login session of the current account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
}

impl SessionInfo {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        ulid::timestamp(&self.id)
    }
}

impl Entity for SessionInfo {
    const KIND: EntityKind = EntityKind::Session;

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    fn schema() -> &'static Schema {
        &hydration::SESSION
    }

    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError> {
        match field {
            "id" => self.id = Self::decode(field, value)?,
            "name" => self.name = Self::decode(field, value)?,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn reset(&mut self, field: &str) -> Result<(), HydrationError> {
        Err(Self::unknown(field))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Webhook {
    pub id: String,
    pub name: String,
    pub avatar: Option<FileRef>,
    pub creator_id: Option<String>,
    pub channel_id: String,
    pub permissions: u64,
    pub token: Option<String>,
}

impl Webhook {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        ulid::timestamp(&self.id)
    }
}

impl Entity for Webhook {
    const KIND: EntityKind = EntityKind::Webhook;

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    fn schema() -> &'static Schema {
        &hydration::WEBHOOK
    }

    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError> {
        match field {
            "id" => self.id = Self::decode(field, value)?,
            "name" => self.name = Self::decode(field, value)?,
            "avatar" => self.avatar = Self::decode(field, value)?,
            "creator_id" => self.creator_id = Self::decode(field, value)?,
            "channel_id" => self.channel_id = Self::decode(field, value)?,
            "permissions" => self.permissions = Self::decode(field, value)?,
            "token" => self.token = Self::decode(field, value)?,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn reset(&mut self, field: &str) -> Result<(), HydrationError> {
        match field {
            "avatar" => self.avatar = None,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn created(&self) -> Option<ClientEvent> {
        Some(ClientEvent::WebhookCreate(self.clone()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bot {
    pub id: String,
    pub owner_id: String,
    pub token: Option<String>,
    pub public: bool,
    pub analytics: bool,
    pub discoverable: bool,
    pub interactions_url: Option<String>,
    pub terms_of_service_url: Option<String>,
    pub privacy_policy_url: Option<String>,
    pub flags: u64,
}

impl Bot {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        ulid::timestamp(&self.id)
    }
}

impl Entity for Bot {
    const KIND: EntityKind = EntityKind::Bot;

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    fn schema() -> &'static Schema {
        &hydration::BOT
    }

    fn assign(&mut self, field: &str, value: Value) -> Result<(), HydrationError> {
        match field {
            "id" => self.id = Self::decode(field, value)?,
            "owner_id" => self.owner_id = Self::decode(field, value)?,
            "token" => self.token = Self::decode(field, value)?,
            "public" => self.public = Self::decode(field, value)?,
            "analytics" => self.analytics = Self::decode(field, value)?,
            "discoverable" => self.discoverable = Self::decode(field, value)?,
            "interactions_url" => self.interactions_url = Self::decode(field, value)?,
            "terms_of_service_url" => self.terms_of_service_url = Self::decode(field, value)?,
            "privacy_policy_url" => self.privacy_policy_url = Self::decode(field, value)?,
            "flags" => self.flags = Self::decode(field, value)?,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }

    fn reset(&mut self, field: &str) -> Result<(), HydrationError> {
        match field {
            "token" => self.token = None,
            "interactions_url" => self.interactions_url = None,
            _ => return Err(Self::unknown(field)),
        }
        Ok(())
    }
}
