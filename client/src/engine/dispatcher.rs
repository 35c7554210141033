//! Applies server events to the object store, in wire order.
//!
//! Each event runs to completion under one store write guard. Notifications
//! produced while applying it are buffered and broadcast once the guard is
//! released. Batches and compound events are expanded onto the front of a
//! work queue so everything they contain is applied before the next frame.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::api::RestApi;
use crate::engine::events::ClientEvent;
use crate::gateway::protocol::{AuthEvent, ProtocolVersion, ServerEvent};
use crate::store::hydration::hydrate;
use crate::store::reactive::ReactiveSet;
use crate::store::{
    Collection, Entity, MemberCollection, MemberKey, ObjectStore, RelationshipStatus, Role,
    wire_id,
};

/// Display name given to users removed from the platform.
pub const REMOVED_USER_NAME: &str = "Removed User";

/// Fields cleared from a user removed from the platform.
const WIPED_USER_FIELDS: &[&str] = &[
    "Avatar",
    "StatusText",
    "StatusPresence",
    "DisplayName",
    "ProfileContent",
    "ProfileBackground",
];

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Fetch the author (and membership) of new messages when not cached.
    pub eager_fetching: bool,
    /// Load unread state over REST when `Ready` arrives.
    pub sync_unreads: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            eager_fetching: true,
            sync_unreads: false,
        }
    }
}

pub struct Dispatcher {
    store: Arc<RwLock<ObjectStore>>,
    notify: broadcast::Sender<ClientEvent>,
    api: Option<Arc<dyn RestApi>>,
    options: DispatchOptions,
    protocol: ProtocolVersion,
    ready: Arc<AtomicBool>,
    session_id: Option<String>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<RwLock<ObjectStore>>,
        notify: broadcast::Sender<ClientEvent>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            store,
            notify,
            api: None,
            options,
            protocol: ProtocolVersion::default(),
            ready: Arc::new(AtomicBool::new(false)),
            session_id: None,
        }
    }

    pub fn with_api(mut self, api: Arc<dyn RestApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolVersion) -> Self {
        self.protocol = protocol;
        self
    }

    /// The session this client authenticated with, used to detect logout.
    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Shared flag set once `Ready` has been applied.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Consume events until the channel closes or `cancel` fires.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ServerEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.dispatch(event).await;
                    }
                    None => break,
                },
            }
        }
        debug!("dispatcher stopped");
    }

    /// Apply one event (and everything it expands to). Returns the
    /// notifications that were broadcast, in order.
    pub async fn dispatch(&self, event: ServerEvent) -> Vec<ClientEvent> {
        let mut queue = VecDeque::from([event]);
        let mut published = Vec::new();

        while let Some(event) = queue.pop_front() {
            let mut emit = Vec::new();
            self.apply(event, &mut queue, &mut emit).await;
            for event in emit {
                // No subscribers is fine.
                let _ = self.notify.send(event.clone());
                published.push(event);
            }
        }
        published
    }

    async fn apply(
        &self,
        event: ServerEvent,
        queue: &mut VecDeque<ServerEvent>,
        emit: &mut Vec<ClientEvent>,
    ) {
        trace!(kind = event.kind(), "applying");
        match event {
            // ── Lifecycle ──────────────────────────────────────────
            ServerEvent::Bulk { v } => {
                for value in v.into_iter().rev() {
                    match ServerEvent::decode_value(self.protocol, value) {
                        Ok(nested) => queue.push_front(nested),
                        Err(e) => debug!(error = %e, "dropping malformed bulk entry"),
                    }
                }
            }
            ServerEvent::Authenticated => debug!("session authenticated"),
            ServerEvent::Logout => {
                self.ready.store(false, Ordering::Release);
                self.store.write().reset();
                info!("logged out, cache cleared");
                emit.push(ClientEvent::Logout);
            }
            ServerEvent::Ready {
                users,
                servers,
                channels,
                members,
                emojis,
            } => {
                let unreads = self.fetch_unreads().await;
                {
                    let mut guard = self.store.write();
                    let store = &mut *guard;
                    users.iter().for_each(|raw| load_record(&mut store.users, raw));
                    servers.iter().for_each(|raw| load_record(&mut store.servers, raw));
                    channels.iter().for_each(|raw| load_record(&mut store.channels, raw));
                    members.iter().for_each(|raw| load_member(&mut store.members, raw));
                    emojis.iter().for_each(|raw| load_record(&mut store.emojis, raw));
                    unreads.iter().for_each(|raw| load_unread(&mut store.channel_unreads, raw));

                    let self_id = store
                        .users
                        .iter()
                        .find(|(_, u)| u.relationship == RelationshipStatus::User)
                        .map(|(id, _)| id.clone());
                    match self_id {
                        Some(id) => store.set_self_id(id),
                        None => warn!("ready payload has no self user"),
                    }
                    info!(
                        users = users.len(),
                        servers = servers.len(),
                        channels = channels.len(),
                        members = members.len(),
                        emojis = emojis.len(),
                        "ready"
                    );
                }
                self.ready.store(true, Ordering::Release);
                emit.push(ClientEvent::Ready);
            }
            ServerEvent::Ping { .. } | ServerEvent::Pong { .. } | ServerEvent::Error { .. } => {
                debug!("control frame reached the dispatcher");
            }

            // ── Messages ───────────────────────────────────────────
            ServerEvent::Message(raw) => self.on_message(raw, emit).await,
            ServerEvent::MessageUpdate {
                id, data, clear, ..
            } => {
                let mut store = self.store.write();
                if let Some((message, previous)) = update_record(&mut store.messages, &id, &data, &clear) {
                    emit.push(ClientEvent::MessageUpdate { message, previous });
                }
            }
            ServerEvent::MessageAppend { id, append, .. } => {
                let mut store = self.store.write();
                let Some(message) = store.messages.get_mut(&id) else {
                    return;
                };
                let previous = message.clone();
                if let Some(Value::Array(embeds)) = append.get("embeds") {
                    message.embeds.extend(embeds.iter().cloned());
                }
                emit.push(ClientEvent::MessageUpdate {
                    message: message.clone(),
                    previous,
                });
            }
            ServerEvent::MessageDelete { id, channel } => {
                let mut store = self.store.write();
                match store.messages.delete(&id) {
                    Some(message) => emit.push(ClientEvent::MessageDelete(message)),
                    None => emit.push(ClientEvent::MessageDeleteUncached {
                        id,
                        channel_id: channel,
                    }),
                }
            }
            ServerEvent::BulkMessageDelete { channel, ids } => {
                let mut store = self.store.write();
                let messages = ids
                    .iter()
                    .filter_map(|id| store.messages.delete(id))
                    .collect();
                emit.push(ClientEvent::MessageDeleteBulk {
                    channel_id: channel,
                    messages,
                });
            }
            ServerEvent::MessageReact {
                id,
                user_id,
                emoji_id,
                ..
            } => {
                let mut store = self.store.write();
                let Some(message) = store.messages.get_mut(&id) else {
                    return;
                };
                match message.reactions.get_mut(&emoji_id) {
                    Some(users) => {
                        if !users.insert(user_id.clone()) {
                            return;
                        }
                    }
                    None => {
                        message
                            .reactions
                            .insert(emoji_id.clone(), ReactiveSet::from_iter([user_id.clone()]));
                    }
                }
                emit.push(ClientEvent::MessageReactionAdd {
                    message: message.clone(),
                    user_id,
                    emoji: emoji_id,
                });
            }
            ServerEvent::MessageUnreact {
                id,
                user_id,
                emoji_id,
                ..
            } => {
                let mut store = self.store.write();
                let Some(message) = store.messages.get_mut(&id) else {
                    return;
                };
                let Some(users) = message.reactions.get_mut(&emoji_id) else {
                    return;
                };
                if !users.remove(&user_id) {
                    return;
                }
                if users.is_empty() {
                    message.reactions.remove(&emoji_id);
                }
                emit.push(ClientEvent::MessageReactionRemove {
                    message: message.clone(),
                    user_id,
                    emoji: emoji_id,
                });
            }
            ServerEvent::MessageRemoveReaction { id, emoji_id, .. } => {
                let mut store = self.store.write();
                let Some(message) = store.messages.get_mut(&id) else {
                    return;
                };
                if message.reactions.remove(&emoji_id).is_none() {
                    return;
                }
                emit.push(ClientEvent::MessageReactionRemoveEmoji {
                    message: message.clone(),
                    emoji: emoji_id,
                });
            }

            // ── Channels ───────────────────────────────────────────
            ServerEvent::ChannelCreate(raw) => {
                let Some(id) = wire_id(&raw).map(str::to_string) else {
                    debug!("channel without id");
                    return;
                };
                let mut guard = self.store.write();
                let store = &mut *guard;
                if store.channels.has_full(&id) {
                    return;
                }
                let channel = store.channels.get_or_create(&id, &raw, Some(emit));
                if let Some(server) = channel
                    .server_id
                    .as_deref()
                    .and_then(|server_id| store.servers.get_mut(server_id))
                {
                    server.channel_ids.insert(id);
                }
            }
            ServerEvent::ChannelUpdate { id, data, clear } => {
                let mut store = self.store.write();
                if let Some((channel, previous)) = update_record(&mut store.channels, &id, &data, &clear) {
                    emit.push(ClientEvent::ChannelUpdate { channel, previous });
                }
            }
            ServerEvent::ChannelDelete { id } => {
                let mut store = self.store.write();
                store.channel_unreads.delete(&id);
                if let Some(channel) = store.delete_channel(&id) {
                    emit.push(ClientEvent::ChannelDelete(channel));
                }
            }
            ServerEvent::ChannelGroupJoin { id, user } => {
                let mut store = self.store.write();
                let Some(channel) = store.channels.get_mut(&id) else {
                    return;
                };
                if !channel.recipient_ids.insert(user.clone()) {
                    return;
                }
                emit.push(ClientEvent::ChannelGroupJoin {
                    channel: channel.clone(),
                    user_id: user,
                });
            }
            ServerEvent::ChannelGroupLeave { id, user } => {
                let mut store = self.store.write();
                if store.self_id() == Some(user.as_str()) {
                    if let Some(channel) = store.delete_channel(&id) {
                        emit.push(ClientEvent::ChannelDelete(channel));
                    }
                    return;
                }
                let Some(channel) = store.channels.get_mut(&id) else {
                    return;
                };
                if !channel.recipient_ids.remove(&user) {
                    return;
                }
                emit.push(ClientEvent::ChannelGroupLeave {
                    channel: channel.clone(),
                    user_id: user,
                });
            }
            ServerEvent::ChannelStartTyping { id, user } => {
                let mut store = self.store.write();
                let Some(channel) = store.channels.get_mut(&id) else {
                    return;
                };
                if !channel.typing_ids.insert(user.clone()) {
                    return;
                }
                emit.push(ClientEvent::ChannelStartTyping {
                    channel: channel.clone(),
                    user_id: user,
                });
            }
            ServerEvent::ChannelStopTyping { id, user } => {
                let mut store = self.store.write();
                let Some(channel) = store.channels.get_mut(&id) else {
                    return;
                };
                if !channel.typing_ids.remove(&user) {
                    return;
                }
                emit.push(ClientEvent::ChannelStopTyping {
                    channel: channel.clone(),
                    user_id: user,
                });
            }
            ServerEvent::ChannelAck { id, message_id, .. } => {
                let mut store = self.store.write();
                let Some(unread) = store.channel_unreads.get_or_partial(&id) else {
                    return;
                };
                if unread.last_message_id.as_deref() == Some(message_id.as_str()) {
                    return;
                }
                unread.last_message_id = Some(message_id.clone());
                // Ids are ULIDs, so string order is time order.
                unread
                    .message_mention_ids
                    .retain(|mention| mention.as_str() > message_id.as_str());
                emit.push(ClientEvent::ChannelAcknowledged {
                    unread: unread.clone(),
                    message_id,
                });
            }

            // ── Servers ────────────────────────────────────────────
            ServerEvent::ServerCreate {
                id,
                server,
                channels,
                emojis,
            } => {
                let mut guard = self.store.write();
                let store = &mut *guard;
                if store.servers.has_full(&id) {
                    return;
                }
                channels.iter().for_each(|raw| load_record(&mut store.channels, raw));
                emojis.iter().for_each(|raw| load_record(&mut store.emojis, raw));
                store.servers.get_or_create(&id, &server, Some(emit));
            }
            ServerEvent::ServerUpdate { id, data, clear } => {
                let mut store = self.store.write();
                if let Some((server, previous)) = update_record(&mut store.servers, &id, &data, &clear) {
                    emit.push(ClientEvent::ServerUpdate { server, previous });
                }
            }
            ServerEvent::ServerDelete { id } => {
                let mut store = self.store.write();
                if let Some(server) = store.delete_server_cascade(&id) {
                    info!(server_id = %id, "server deleted");
                    emit.push(ClientEvent::ServerDelete(server));
                }
            }
            ServerEvent::ServerMemberUpdate { id, data, clear } => {
                let mut store = self.store.write();
                let members = &mut store.members;
                let patch = members.hydrate(&data);
                let Some(previous) = members.get_or_partial_by_key(&id).cloned() else {
                    return;
                };
                members.update_underlying_object_by_key(&id, &patch);
                members.clear_fields_by_key(&id, &clear);
                if let Some(member) = members.get_by_key(&id) {
                    emit.push(ClientEvent::ServerMemberUpdate { member, previous });
                }
            }
            ServerEvent::ServerMemberJoin { id, user, member } => {
                let key = MemberKey::new(id, user);
                let mut store = self.store.write();
                if store.members.has_full(&key.composite()) {
                    return;
                }
                let raw = member.unwrap_or_else(|| json!({ "_id": { "server": key.server, "user": key.user } }));
                let member = store.members.get_or_create_by_key(&key, &raw, None);
                emit.push(ClientEvent::ServerMemberJoin(member.clone()));
            }
            ServerEvent::ServerMemberLeave { id, user } => {
                let mut store = self.store.write();
                if store.self_id() == Some(user.as_str()) {
                    if let Some(server) = store.delete_server_cascade(&id) {
                        info!(server_id = %id, "left server");
                        emit.push(ClientEvent::ServerLeave(server));
                    }
                    return;
                }
                let key = MemberKey::new(id, user);
                if store.members.delete_by_key(&key).is_some() {
                    emit.push(ClientEvent::ServerMemberLeave(key));
                }
            }
            ServerEvent::ServerRoleUpdate {
                id,
                role_id,
                data,
                clear,
            } => {
                let mut guard = self.store.write();
                let store = &mut *guard;
                let patch = hydrate(Role::schema(), &data, store.servers.context());
                let Some(server) = store.servers.get_mut(&id) else {
                    return;
                };
                let previous = server.roles.get(&role_id).cloned();
                let mut role = previous.clone().unwrap_or_default();
                patch.apply_to(&mut role);
                for name in &clear {
                    let Some(field) = Role::schema().clear_target(name) else {
                        trace!(kind = %Role::KIND, clear = %name, "unknown clear name");
                        continue;
                    };
                    if let Err(e) = role.reset(field) {
                        trace!(kind = %Role::KIND, error = %e, "clear rejected");
                    }
                }
                server.roles.insert(role_id.clone(), role);
                emit.push(ClientEvent::ServerRoleUpdate {
                    server: server.clone(),
                    role_id,
                    previous,
                });
            }
            ServerEvent::ServerRoleDelete { id, role_id } => {
                let mut store = self.store.write();
                let Some(server) = store.servers.get_mut(&id) else {
                    return;
                };
                let Some(role) = server.roles.remove(&role_id) else {
                    return;
                };
                emit.push(ClientEvent::ServerRoleDelete {
                    server: server.clone(),
                    role_id,
                    role,
                });
            }

            // ── Users ──────────────────────────────────────────────
            ServerEvent::UserUpdate { id, data, clear } => {
                let mut store = self.store.write();
                if let Some((user, previous)) = update_record(&mut store.users, &id, &data, &clear) {
                    emit.push(ClientEvent::UserUpdate { user, previous });
                }
            }
            ServerEvent::UserRelationship { id, user, status } => {
                let status = status.or_else(|| {
                    user.get("relationship")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
                {
                    let mut store = self.store.write();
                    store.users.get_or_create(&id, &user, None);
                }
                let Some(status) = status else {
                    return;
                };
                queue.push_front(ServerEvent::UserUpdate {
                    id,
                    data: json!({ "relationship": status }),
                    clear: Vec::new(),
                });
            }
            ServerEvent::UserSettingsUpdate { id, update } => {
                emit.push(ClientEvent::UserSettingsUpdate { id, update });
            }
            ServerEvent::UserPlatformWipe { user_id, flags } => {
                let mut by_channel: BTreeMap<String, Vec<String>> = BTreeMap::new();
                {
                    let store = self.store.read();
                    for (id, message) in store.messages.iter() {
                        if message.author_id == user_id {
                            by_channel
                                .entry(message.channel_id.clone())
                                .or_default()
                                .push(id.clone());
                        }
                    }
                }
                info!(%user_id, channels = by_channel.len(), "user removed from platform");

                let mut rewritten: Vec<ServerEvent> = by_channel
                    .into_iter()
                    .map(|(channel, mut ids)| {
                        ids.sort();
                        ServerEvent::BulkMessageDelete { channel, ids }
                    })
                    .collect();
                rewritten.push(ServerEvent::UserUpdate {
                    id: user_id,
                    data: json!({ "username": REMOVED_USER_NAME, "flags": flags }),
                    clear: WIPED_USER_FIELDS.iter().map(|f| f.to_string()).collect(),
                });
                for event in rewritten.into_iter().rev() {
                    queue.push_front(event);
                }
            }

            // ── Emojis and webhooks ────────────────────────────────
            ServerEvent::EmojiCreate(raw) => {
                let mut store = self.store.write();
                create_record(&mut store.emojis, &raw, emit);
            }
            ServerEvent::EmojiDelete { id } => {
                let mut store = self.store.write();
                if let Some(emoji) = store.emojis.delete(&id) {
                    emit.push(ClientEvent::EmojiDelete(emoji));
                }
            }
            ServerEvent::WebhookCreate(raw) => {
                let mut store = self.store.write();
                create_record(&mut store.webhooks, &raw, emit);
            }
            ServerEvent::WebhookUpdate { id, data, remove } => {
                let mut store = self.store.write();
                if let Some((webhook, previous)) = update_record(&mut store.webhooks, &id, &data, &remove) {
                    emit.push(ClientEvent::WebhookUpdate { webhook, previous });
                }
            }
            ServerEvent::WebhookDelete { id } => {
                let mut store = self.store.write();
                if let Some(webhook) = store.webhooks.delete(&id) {
                    emit.push(ClientEvent::WebhookDelete(webhook));
                }
            }

            ServerEvent::Auth(auth) => self.on_auth(auth, emit),
        }
    }

    async fn on_message(&self, raw: Value, emit: &mut Vec<ClientEvent>) {
        let Some(id) = wire_id(&raw).map(str::to_string) else {
            debug!("message without id");
            return;
        };
        let channel_id = raw.get("channel").and_then(Value::as_str).map(str::to_string);
        let author = raw.get("author").and_then(Value::as_str).map(str::to_string);

        let (need_user, need_member) = {
            let store = self.store.read();
            if store.messages.has_full(&id) {
                trace!(message_id = %id, "duplicate message");
                return;
            }
            match (&author, self.options.eager_fetching && raw.get("webhook").is_none()) {
                (Some(author), true) => {
                    let need_user = !store.users.has_full(author) && raw.get("user").is_none();
                    let need_member = channel_id
                        .as_deref()
                        .and_then(|c| store.channels.get_ref(c))
                        .and_then(|c| c.server_id.clone())
                        .map(|server| MemberKey::new(server, author.clone()))
                        .filter(|key| {
                            !store.members.has_full(&key.composite()) && raw.get("member").is_none()
                        });
                    (need_user.then(|| author.clone()), need_member)
                }
                _ => (None, None),
            }
        };

        // Fetched before taking the write guard; see DESIGN.md on ordering.
        let mut fetched_user = None;
        let mut fetched_member = None;
        if let Some(api) = self.api.clone() {
            if let Some(user_id) = need_user {
                match api.fetch_user(&user_id).await {
                    Ok(user) => fetched_user = Some(user),
                    Err(e) => debug!(%user_id, error = %e, "author fetch failed"),
                }
            }
            if let Some(key) = need_member {
                match api.fetch_member(&key).await {
                    Ok(member) => fetched_member = Some(member),
                    Err(e) => debug!(member = %key, error = %e, "member fetch failed"),
                }
            }
        }

        let mut guard = self.store.write();
        let store = &mut *guard;
        for user in fetched_user.iter().chain(raw.get("user")) {
            load_record(&mut store.users, user);
        }
        for member in fetched_member.iter().chain(raw.get("member")) {
            load_member(&mut store.members, member);
        }
        store.messages.get_or_create(&id, &raw, Some(emit));
        if let Some(channel_id) = channel_id {
            store
                .channels
                .update_field(&channel_id, "last_message_id", Value::String(id));
        }
    }

    fn on_auth(&self, auth: AuthEvent, emit: &mut Vec<ClientEvent>) {
        let mut store = self.store.write();
        if store.self_id().is_some_and(|me| me != auth_user(&auth)) {
            trace!("auth event for another user");
            return;
        }

        let removed: Vec<String> = match &auth {
            AuthEvent::DeleteSession { session_id, .. } => vec![session_id.clone()],
            AuthEvent::DeleteAllSessions {
                exclude_session_id, ..
            } => store
                .sessions
                .ids()
                .into_iter()
                .filter(|id| Some(id) != exclude_session_id.as_ref())
                .collect(),
        };
        for id in &removed {
            store.sessions.delete(id);
            emit.push(ClientEvent::SessionDelete { id: id.clone() });
        }

        let logged_out = match (&auth, self.session_id.as_ref()) {
            (AuthEvent::DeleteSession { session_id, .. }, Some(current)) => session_id == current,
            (AuthEvent::DeleteAllSessions { exclude_session_id, .. }, Some(current)) => {
                exclude_session_id.as_ref() != Some(current)
            }
            (_, None) => false,
        };
        if logged_out {
            info!("current session revoked, cache cleared");
            self.ready.store(false, Ordering::Release);
            store.reset();
            emit.push(ClientEvent::Logout);
        }
    }

    async fn fetch_unreads(&self) -> Vec<Value> {
        if !self.options.sync_unreads {
            return Vec::new();
        }
        let Some(api) = self.api.clone() else {
            return Vec::new();
        };
        match api.sync_unreads().await {
            Ok(unreads) => unreads,
            Err(e) => {
                warn!(error = %e, "unread sync failed");
                Vec::new()
            }
        }
    }
}

fn auth_user(auth: &AuthEvent) -> &str {
    match auth {
        AuthEvent::DeleteSession { user_id, .. } | AuthEvent::DeleteAllSessions { user_id, .. } => {
            user_id
        }
    }
}

// ── Store helpers ──────────────────────────────────────────────────

/// Insert-or-refresh used for bulk loads, which may repeat on reconnect.
fn load_record<T: Entity>(records: &mut Collection<T>, raw: &Value) {
    let Some(id) = wire_id(raw) else {
        trace!(kind = %T::KIND, "record without id");
        return;
    };
    if records.has_full(id) {
        let patch = records.hydrate(raw);
        records.update_underlying_object(id, &patch);
    } else {
        records.get_or_create(id, raw, None);
    }
}

fn load_member(members: &mut MemberCollection, raw: &Value) {
    let Some(key) = raw
        .get("_id")
        .cloned()
        .and_then(|id| serde_json::from_value::<MemberKey>(id).ok())
    else {
        trace!("member without key");
        return;
    };
    if members.has_full(&key.composite()) {
        let patch = members.hydrate(raw);
        members.update_underlying_object_by_key(&key, &patch);
    } else {
        members.get_or_create_by_key(&key, raw, None);
    }
}

fn load_unread<T: Entity>(unreads: &mut Collection<T>, raw: &Value) {
    let Some(channel) = raw
        .get("_id")
        .and_then(|id| id.get("channel"))
        .and_then(Value::as_str)
    else {
        return;
    };
    unreads.get_or_create(channel, raw, None);
}

/// Create-if-absent: a full record with the same id means a duplicate.
fn create_record<T: Entity>(records: &mut Collection<T>, raw: &Value, emit: &mut Vec<ClientEvent>) {
    let Some(id) = wire_id(raw) else {
        debug!(kind = %T::KIND, "create without id");
        return;
    };
    if records.has_full(id) {
        return;
    }
    records.get_or_create(id, raw, Some(emit));
}

/// Patch a record (creating a partial if allowed). Returns `(current, previous)`.
fn update_record<T: Entity>(
    records: &mut Collection<T>,
    id: &str,
    data: &Value,
    clear: &[String],
) -> Option<(T, T)> {
    let patch = records.hydrate(data);
    let previous = records.get_or_partial(id)?.clone();
    records.update_underlying_object(id, &patch);
    records.clear_fields(id, clear);
    Some((records.get(id)?, previous))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Route;
    use crate::error::ApiError;
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn dispatcher() -> Dispatcher {
        let (notify, _) = broadcast::channel(64);
        Dispatcher::new(
            Arc::new(RwLock::new(ObjectStore::default())),
            notify,
            DispatchOptions::default(),
        )
    }

    fn event(value: Value) -> ServerEvent {
        ServerEvent::decode_value(ProtocolVersion::V1, value).unwrap()
    }

    fn names(events: &[ClientEvent]) -> Vec<&'static str> {
        events.iter().map(ClientEvent::name).collect()
    }

    fn message(id: &str, channel: &str, author: &str) -> ServerEvent {
        event(json!({
            "type": "Message", "_id": id, "channel": channel, "author": author, "content": "hi"
        }))
    }

    #[tokio::test]
    async fn test_bulk_applies_in_order_and_skips_malformed() {
        let d = dispatcher();
        let out = d
            .dispatch(event(json!({
                "type": "Bulk",
                "v": [
                    { "type": "ChannelCreate", "_id": "C1", "channel_type": "TextChannel" },
                    { "type": "NoSuchEvent" },
                    { "type": "ChannelCreate", "_id": "C2", "channel_type": "TextChannel" },
                    { "type": "ChannelUpdate", "id": "C1", "data": { "name": "general" } },
                ]
            })))
            .await;

        assert_eq!(
            names(&out),
            vec!["channel_create", "channel_create", "channel_update"]
        );
        let ClientEvent::ChannelCreate(first) = &out[0] else {
            unreachable!()
        };
        assert_eq!(first.id, "C1");
        assert_eq!(
            d.store.read().channels.get_ref("C1").unwrap().name.as_deref(),
            Some("general")
        );
    }

    #[tokio::test]
    async fn test_duplicate_create_is_silent() {
        let d = dispatcher();
        assert_eq!(d.dispatch(message("M1", "C1", "U1")).await.len(), 1);
        assert!(d.dispatch(message("M1", "C1", "U1")).await.is_empty());
        assert_eq!(d.store.read().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_create_upgrades_partial() {
        let d = dispatcher();
        d.dispatch(event(json!({
            "type": "ChannelUpdate", "id": "C1", "data": { "name": "early" }
        })))
        .await;
        assert!(d.store.read().channels.is_partial("C1"));

        let out = d
            .dispatch(event(json!({
                "type": "ChannelCreate", "_id": "C1", "channel_type": "TextChannel", "name": "real"
            })))
            .await;
        assert_eq!(names(&out), vec!["channel_create"]);
        assert!(d.store.read().channels.has_full("C1"));
    }

    #[tokio::test]
    async fn test_update_applies_patch_and_clear() {
        let d = dispatcher();
        d.dispatch(event(json!({
            "type": "ChannelCreate", "_id": "C1", "channel_type": "TextChannel",
            "name": "a", "description": "topic"
        })))
        .await;

        let out = d
            .dispatch(event(json!({
                "type": "ChannelUpdate", "id": "C1",
                "data": { "name": "b" }, "clear": ["Description"]
            })))
            .await;
        let ClientEvent::ChannelUpdate { channel, previous } = &out[0] else {
            unreachable!()
        };
        assert_eq!(previous.name.as_deref(), Some("a"));
        assert_eq!(previous.description.as_deref(), Some("topic"));
        assert_eq!(channel.name.as_deref(), Some("b"));
        assert_eq!(channel.description, None);
    }

    #[tokio::test]
    async fn test_server_delete_cascades_silently() {
        let d = dispatcher();
        d.dispatch(event(json!({
            "type": "ServerCreate", "id": "S1",
            "server": { "_id": "S1", "owner": "U1", "name": "s", "channels": ["C1"] },
            "channels": [{ "_id": "C1", "channel_type": "TextChannel", "server": "S1" }]
        })))
        .await;
        assert!(d.store.read().channels.has("C1"));

        let out = d
            .dispatch(event(json!({ "type": "ServerDelete", "id": "S1" })))
            .await;
        assert_eq!(names(&out), vec!["server_delete"]);
        assert!(!d.store.read().channels.has("C1"));
    }

    #[tokio::test]
    async fn test_typing_duplicates_suppressed() {
        let d = dispatcher();
        d.dispatch(event(json!({ "type": "ChannelCreate", "_id": "C1", "channel_type": "Group" })))
            .await;
        let start = json!({ "type": "ChannelStartTyping", "id": "C1", "user": "U2" });
        let stop = json!({ "type": "ChannelStopTyping", "id": "C1", "user": "U2" });

        assert_eq!(d.dispatch(event(start.clone())).await.len(), 1);
        assert!(d.dispatch(event(start)).await.is_empty());
        assert_eq!(d.dispatch(event(stop.clone())).await.len(), 1);
        assert!(d.dispatch(event(stop)).await.is_empty());
    }

    #[tokio::test]
    async fn test_reactions() {
        let d = dispatcher();
        d.dispatch(message("M1", "C1", "U1")).await;
        let react = json!({
            "type": "MessageReact", "id": "M1", "channel_id": "C1", "user_id": "U2", "emoji_id": "E1"
        });

        assert_eq!(names(&d.dispatch(event(react.clone())).await), vec!["message_reaction_add"]);
        assert!(d.dispatch(event(react)).await.is_empty());
        assert_eq!(d.store.read().messages.get_ref("M1").unwrap().reaction_count("E1"), 1);

        let out = d
            .dispatch(event(json!({
                "type": "MessageUnreact", "id": "M1", "channel_id": "C1", "user_id": "U2", "emoji_id": "E1"
            })))
            .await;
        assert_eq!(names(&out), vec!["message_reaction_remove"]);
        assert!(d.store.read().messages.get_ref("M1").unwrap().reactions.is_empty());

        let out = d
            .dispatch(event(json!({
                "type": "MessageRemoveReaction", "id": "M1", "channel_id": "C1", "emoji_id": "E1"
            })))
            .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_delete_uncached_message() {
        let d = dispatcher();
        let out = d
            .dispatch(event(json!({ "type": "MessageDelete", "id": "M9", "channel": "C1" })))
            .await;
        assert!(matches!(
            &out[0],
            ClientEvent::MessageDeleteUncached { id, channel_id } if id == "M9" && channel_id == "C1"
        ));
    }

    #[tokio::test]
    async fn test_relationship_becomes_user_update() {
        let d = dispatcher();
        let out = d
            .dispatch(event(json!({
                "type": "UserRelationship", "id": "U2",
                "user": { "_id": "U2", "username": "bob", "relationship": "Incoming" },
                "status": "Friend"
            })))
            .await;

        let ClientEvent::UserUpdate { user, .. } = &out[0] else {
            unreachable!()
        };
        assert_eq!(user.relationship, RelationshipStatus::Friend);
        assert_eq!(user.username, "bob");
    }

    #[tokio::test]
    async fn test_platform_wipe() {
        let d = dispatcher();
        d.dispatch(message("M1", "C1", "U9")).await;
        d.dispatch(message("M2", "C2", "U9")).await;
        d.dispatch(message("M3", "C1", "U1")).await;
        d.dispatch(event(json!({
            "type": "UserUpdate", "id": "U9",
            "data": { "username": "spam", "display_name": "Spammer" }
        })))
        .await;

        let out = d
            .dispatch(event(json!({ "type": "UserPlatformWipe", "user_id": "U9", "flags": 4 })))
            .await;
        assert_eq!(
            names(&out),
            vec!["message_delete_bulk", "message_delete_bulk", "user_update"]
        );

        let store = d.store.read();
        assert_eq!(store.messages.ids(), vec!["M3".to_string()]);
        let user = store.users.get_ref("U9").unwrap();
        assert_eq!(user.username, REMOVED_USER_NAME);
        assert_eq!(user.display_name, None);
        assert_eq!(user.flags, 4);
    }

    #[tokio::test]
    async fn test_ready_loads_store_and_self() {
        let d = dispatcher();
        let out = d
            .dispatch(event(json!({
                "type": "Ready",
                "users": [
                    { "_id": "U1", "username": "me", "relationship": "User" },
                    { "_id": "U2", "username": "friend", "relationship": "Friend" }
                ],
                "servers": [{ "_id": "S1", "owner": "U2", "name": "s" }],
                "channels": [{ "_id": "C1", "channel_type": "TextChannel", "server": "S1" }],
                "members": [{ "_id": { "server": "S1", "user": "U1" }, "roles": [] }],
                "emojis": []
            })))
            .await;

        assert_eq!(names(&out), vec!["ready"]);
        assert!(d.is_ready());
        let store = d.store.read();
        assert_eq!(store.self_id(), Some("U1"));
        assert_eq!(store.users.len(), 2);
        assert!(store.members.has_by_key(&MemberKey::new("S1", "U1")));
    }

    #[tokio::test]
    async fn test_self_member_leave_removes_server() {
        let d = dispatcher();
        d.store.write().set_self_id("U1");
        d.dispatch(event(json!({
            "type": "ServerCreate", "id": "S1", "server": { "_id": "S1", "owner": "U2", "name": "s" }
        })))
        .await;
        d.dispatch(event(json!({ "type": "ServerMemberJoin", "id": "S1", "user": "U1" })))
            .await;

        let out = d
            .dispatch(event(json!({ "type": "ServerMemberLeave", "id": "S1", "user": "U1" })))
            .await;
        assert_eq!(names(&out), vec!["server_leave"]);
        let store = d.store.read();
        assert!(!store.servers.has("S1"));
        assert!(store.members.is_empty());
    }

    #[tokio::test]
    async fn test_member_join_is_idempotent() {
        let d = dispatcher();
        let join = json!({ "type": "ServerMemberJoin", "id": "S1", "user": "U2" });
        assert_eq!(names(&d.dispatch(event(join.clone())).await), vec!["server_member_join"]);
        assert!(d.dispatch(event(join)).await.is_empty());
    }

    #[tokio::test]
    async fn test_role_update_and_delete() {
        let d = dispatcher();
        d.dispatch(event(json!({
            "type": "ServerCreate", "id": "S1", "server": { "_id": "S1", "owner": "U2", "name": "s" }
        })))
        .await;
        let update = json!({
            "type": "ServerRoleUpdate", "id": "S1", "role_id": "R1",
            "data": { "name": "mod", "permissions": { "a": 8, "d": 0 }, "rank": 1 }
        });

        let out = d.dispatch(event(update.clone())).await;
        assert!(matches!(&out[0], ClientEvent::ServerRoleUpdate { previous: None, .. }));
        let out = d.dispatch(event(update)).await;
        assert!(matches!(&out[0], ClientEvent::ServerRoleUpdate { previous: Some(_), .. }));

        d.dispatch(event(json!({
            "type": "ServerRoleUpdate", "id": "S1", "role_id": "R1",
            "data": { "colour": "#ff0000" }
        })))
        .await;
        let out = d
            .dispatch(event(json!({
                "type": "ServerRoleUpdate", "id": "S1", "role_id": "R1",
                "data": {}, "clear": ["Colour", "Nonsense"]
            })))
            .await;
        assert_eq!(names(&out), vec!["server_role_update"]);
        {
            let store = d.store.read();
            let server = store.servers.get_ref("S1").unwrap();
            let role = server.roles.get(&"R1".to_string()).unwrap();
            assert_eq!(role.colour, None);
            assert_eq!(role.permissions.allow, 8);
        }

        let out = d
            .dispatch(event(json!({ "type": "ServerRoleDelete", "id": "S1", "role_id": "R1" })))
            .await;
        let ClientEvent::ServerRoleDelete { role, .. } = &out[0] else {
            unreachable!()
        };
        assert_eq!(role.permissions.allow, 8);
        assert!(d.store.read().servers.get_ref("S1").unwrap().roles.is_empty());
    }

    #[tokio::test]
    async fn test_session_revocation_logs_out() {
        let (notify, _) = broadcast::channel(16);
        let d = Dispatcher::new(
            Arc::new(RwLock::new(ObjectStore::default())),
            notify,
            DispatchOptions::default(),
        )
        .with_session_id(Some("SESS1".into()));
        d.store.write().set_self_id("U1");

        let out = d
            .dispatch(event(json!({
                "type": "Auth", "event_type": "DeleteSession", "user_id": "U1", "session_id": "SESS2"
            })))
            .await;
        assert_eq!(names(&out), vec!["session_delete"]);

        let out = d
            .dispatch(event(json!({
                "type": "Auth", "event_type": "DeleteAllSessions", "user_id": "U1"
            })))
            .await;
        assert!(names(&out).contains(&"logout"));
        assert_eq!(d.store.read().self_id(), None);
    }

    #[tokio::test]
    async fn test_logout_clears_cache() {
        let d = dispatcher();
        d.dispatch(message("M1", "C1", "U1")).await;
        d.store.write().set_self_id("U1");
        d.ready.store(true, Ordering::Release);

        let out = d.dispatch(event(json!({ "type": "Logout" }))).await;
        assert_eq!(names(&out), vec!["logout"]);
        assert!(!d.is_ready());
        let store = d.store.read();
        assert!(store.messages.is_empty());
        assert_eq!(store.self_id(), None);
    }

    struct Directory(HashMap<String, Value>);

    #[async_trait]
    impl RestApi for Directory {
        async fn get(&self, route: Route) -> Result<Value, ApiError> {
            let path = route.path();
            self.0.get(&path).cloned().ok_or(ApiError::Status {
                route: path,
                status: 404,
            })
        }
    }

    #[tokio::test]
    async fn test_eager_fetch_fills_author_and_member() {
        let api = Directory(HashMap::from([
            ("/users/U7".to_string(), json!({ "_id": "U7", "username": "late" })),
            (
                "/servers/S1/members/U7".to_string(),
                json!({ "_id": { "server": "S1", "user": "U7" }, "nickname": "lt" }),
            ),
        ]));
        let d = dispatcher().with_api(Arc::new(api));
        d.dispatch(event(json!({
            "type": "ChannelCreate", "_id": "C1", "channel_type": "TextChannel", "server": "S1"
        })))
        .await;

        let out = d.dispatch(message("M1", "C1", "U7")).await;
        assert_eq!(names(&out), vec!["message_create"]);

        let store = d.store.read();
        assert_eq!(store.users.get_ref("U7").unwrap().username, "late");
        let member = store.members.get_ref_by_key(&MemberKey::new("S1", "U7")).unwrap();
        assert_eq!(member.nickname.as_deref(), Some("lt"));
        assert_eq!(
            store.channels.get_ref("C1").unwrap().last_message_id.as_deref(),
            Some("M1")
        );
    }
}
