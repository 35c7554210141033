//! Wire payload → canonical record translation.
//!
//! Every entity kind has a [`Schema`]: a key table renaming wire fields to
//! canonical fields, a transform table computing each canonical value from the
//! raw one, and a clear table naming the fields an update may null out. The
//! tables are plain data; [`hydrate`] is the only code that walks them.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::trace;

use crate::error::HydrationError;
use crate::store::EntityKind;
use crate::store::models::Entity;

/// Computes a canonical value from the raw wire value, or `None` to skip it.
pub type Transform = fn(&Value, &HydrationContext) -> Option<Value>;

/// Everything a transform may need beyond the raw value.
#[derive(Debug, Clone)]
pub struct HydrationContext {
    pub cdn_url: String,
}

impl HydrationContext {
    pub fn new(cdn_url: impl Into<String>) -> Self {
        Self {
            cdn_url: cdn_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Public URL of an uploaded file.
    pub fn file_url(&self, tag: &str, id: &str) -> String {
        format!("{}/{}/{}", self.cdn_url, tag, id)
    }
}

impl Default for HydrationContext {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CDN_URL)
    }
}

/// Declarative hydration tables for one entity kind.
#[derive(Debug)]
pub struct Schema {
    pub kind: EntityKind,
    /// Wire key → canonical key. Unlisted keys keep their wire name.
    pub keys: &'static [(&'static str, &'static str)],
    /// Canonical key → transform. Keys without a transform are dropped.
    pub transforms: &'static [(&'static str, Transform)],
    /// Wire clear name → canonical field (dotted for nested fields).
    pub clears: &'static [(&'static str, &'static str)],
}

impl Schema {
    pub fn canonical_key<'a>(&self, wire: &'a str) -> &'a str {
        self.keys
            .iter()
            .find(|(from, _)| *from == wire)
            .map_or(wire, |(_, to)| *to)
    }

    pub fn transform(&self, canonical: &str) -> Option<Transform> {
        self.transforms
            .iter()
            .find(|(key, _)| *key == canonical)
            .map(|(_, f)| *f)
    }

    /// Canonical field reset by a wire clear name.
    pub fn clear_target(&self, name: &str) -> Option<&'static str> {
        self.clears
            .iter()
            .find(|(wire, _)| *wire == name)
            .map(|(_, field)| *field)
    }
}

/// Canonical field → canonical value, ready to merge into a record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch(Map<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Merge into a record. A field the record rejects is skipped; the rest
    /// still land.
    pub fn apply_to<T: Entity>(&self, record: &mut T) {
        for (field, value) in &self.0 {
            if let Err(e) = record.assign(field, value.clone()) {
                trace!(kind = %T::KIND, error = %e, "skipping field");
            }
        }
    }
}

/// Translate a raw wire object into a canonical patch.
pub fn hydrate(schema: &Schema, raw: &Value, ctx: &HydrationContext) -> Patch {
    let mut patch = Patch::new();
    let Some(object) = raw.as_object() else {
        trace!(kind = %schema.kind, "payload is not an object");
        return patch;
    };

    for (wire, value) in object {
        let canonical = schema.canonical_key(wire);
        let Some(transform) = schema.transform(canonical) else {
            trace!(kind = %schema.kind, key = %wire, "no transform for key");
            continue;
        };
        match transform(value, ctx) {
            Some(v) => patch.insert(canonical, v),
            None => trace!(kind = %schema.kind, key = %wire, "transform rejected value"),
        }
    }
    patch
}

/// Decode one canonical value into a typed field.
pub fn decode_field<T: DeserializeOwned>(
    kind: EntityKind,
    field: &str,
    value: Value,
) -> Result<T, HydrationError> {
    serde_json::from_value(value).map_err(|e| HydrationError::InvalidValue {
        kind,
        field: field.to_string(),
        reason: e.to_string(),
    })
}

// ── Transforms ──

fn identity(value: &Value, _: &HydrationContext) -> Option<Value> {
    Some(value.clone())
}

fn string(value: &Value, _: &HydrationContext) -> Option<Value> {
    value.is_string().then(|| value.clone())
}

fn boolean(value: &Value, _: &HydrationContext) -> Option<Value> {
    value.is_boolean().then(|| value.clone())
}

fn number(value: &Value, _: &HydrationContext) -> Option<Value> {
    value.is_number().then(|| value.clone())
}

fn strings(value: &Value, _: &HydrationContext) -> Option<Value> {
    let items = value.as_array()?;
    items
        .iter()
        .all(Value::is_string)
        .then(|| value.clone())
}

/// RFC 3339 strings pass through; epoch milliseconds are converted.
fn timestamp(value: &Value, _: &HydrationContext) -> Option<Value> {
    match value {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|_| value.clone()),
        Value::Number(n) => {
            let ms = n.as_i64()?;
            let at = chrono::DateTime::from_timestamp_millis(ms)?;
            Some(Value::String(at.to_rfc3339()))
        }
        _ => None,
    }
}

fn file(value: &Value, ctx: &HydrationContext) -> Option<Value> {
    let id = value.get("_id")?.as_str()?;
    let tag = value.get("tag")?.as_str()?;
    Some(json!({
        "id": id,
        "tag": tag,
        "filename": value.get("filename").cloned().unwrap_or(Value::Null),
        "content_type": value.get("content_type").cloned().unwrap_or(Value::Null),
        "size": value.get("size").cloned().unwrap_or(Value::Null),
        "url": ctx.file_url(tag, id),
    }))
}

fn files(value: &Value, ctx: &HydrationContext) -> Option<Value> {
    let items = value.as_array()?;
    Some(Value::Array(
        items.iter().filter_map(|item| file(item, ctx)).collect(),
    ))
}

fn permission_override(value: &Value, _: &HydrationContext) -> Option<Value> {
    let allow = value.get("a")?.as_u64()?;
    let deny = value.get("d")?.as_u64()?;
    Some(json!({ "allow": allow, "deny": deny }))
}

fn overrides_map(value: &Value, ctx: &HydrationContext) -> Option<Value> {
    let entries = value.as_object()?;
    let mut out = Map::new();
    for (role_id, raw) in entries {
        if let Some(o) = permission_override(raw, ctx) {
            out.insert(role_id.clone(), o);
        }
    }
    Some(Value::Object(out))
}

fn role(value: &Value, ctx: &HydrationContext) -> Option<Value> {
    let name = value.get("name")?.as_str()?;
    let permissions = value
        .get("permissions")
        .and_then(|p| permission_override(p, ctx))
        .unwrap_or_else(|| json!({ "allow": 0, "deny": 0 }));
    Some(json!({
        "name": name,
        "permissions": permissions,
        "colour": value.get("colour").cloned().unwrap_or(Value::Null),
        "hoist": value.get("hoist").and_then(Value::as_bool).unwrap_or(false),
        "rank": value.get("rank").and_then(Value::as_i64).unwrap_or(0),
    }))
}

fn roles_map(value: &Value, ctx: &HydrationContext) -> Option<Value> {
    let entries = value.as_object()?;
    let mut out = Map::new();
    for (role_id, raw) in entries {
        if let Some(r) = role(raw, ctx) {
            out.insert(role_id.clone(), r);
        }
    }
    Some(Value::Object(out))
}

fn reactions(value: &Value, _: &HydrationContext) -> Option<Value> {
    let entries = value.as_object()?;
    let mut out = Map::new();
    for (emoji, users) in entries {
        let users = users.as_array()?;
        out.insert(
            emoji.clone(),
            Value::Array(users.iter().filter(|u| u.is_string()).cloned().collect()),
        );
    }
    Some(Value::Object(out))
}

fn profile(value: &Value, ctx: &HydrationContext) -> Option<Value> {
    let object = value.as_object()?;
    Some(json!({
        "content": object.get("content").cloned().unwrap_or(Value::Null),
        "background": object
            .get("background")
            .and_then(|b| file(b, ctx))
            .unwrap_or(Value::Null),
    }))
}

fn bot_info(value: &Value, _: &HydrationContext) -> Option<Value> {
    let owner = value.get("owner")?.as_str()?;
    Some(json!({ "owner_id": owner }))
}

fn member_key(value: &Value, _: &HydrationContext) -> Option<Value> {
    let server = value.get("server")?.as_str()?;
    let user = value.get("user")?.as_str()?;
    Some(json!({ "server": server, "user": user }))
}

/// Unread ids are `{channel, user}`; the record is keyed by channel.
fn unread_id(value: &Value, _: &HydrationContext) -> Option<Value> {
    value.get("channel").filter(|c| c.is_string()).cloned()
}

// ── Schemas ──

pub static USER: Schema = Schema {
    kind: EntityKind::User,
    keys: &[("_id", "id")],
    transforms: &[
        ("id", string),
        ("username", string),
        ("discriminator", string),
        ("display_name", string),
        ("avatar", file),
        ("badges", number),
        ("status", identity),
        ("profile", profile),
        ("flags", number),
        ("privileged", boolean),
        ("bot", bot_info),
        ("relationship", string),
        ("online", boolean),
    ],
    clears: &[
        ("Avatar", "avatar"),
        ("StatusText", "status.text"),
        ("StatusPresence", "status.presence"),
        ("DisplayName", "display_name"),
        ("ProfileContent", "profile.content"),
        ("ProfileBackground", "profile.background"),
    ],
};

pub static CHANNEL: Schema = Schema {
    kind: EntityKind::Channel,
    keys: &[
        ("_id", "id"),
        ("user", "user_id"),
        ("owner", "owner_id"),
        ("recipients", "recipient_ids"),
        ("server", "server_id"),
    ],
    transforms: &[
        ("id", string),
        ("channel_type", string),
        ("user_id", string),
        ("name", string),
        ("owner_id", string),
        ("description", string),
        ("recipient_ids", strings),
        ("icon", file),
        ("last_message_id", string),
        ("active", boolean),
        ("permissions", number),
        ("role_permissions", overrides_map),
        ("default_permissions", permission_override),
        ("server_id", string),
        ("nsfw", boolean),
    ],
    clears: &[
        ("Description", "description"),
        ("Icon", "icon"),
        ("DefaultPermissions", "default_permissions"),
    ],
};

pub static SERVER: Schema = Schema {
    kind: EntityKind::Server,
    keys: &[("_id", "id"), ("owner", "owner_id"), ("channels", "channel_ids")],
    transforms: &[
        ("id", string),
        ("owner_id", string),
        ("name", string),
        ("description", string),
        ("channel_ids", strings),
        ("categories", identity),
        ("system_messages", identity),
        ("roles", roles_map),
        ("default_permissions", number),
        ("icon", file),
        ("banner", file),
        ("flags", number),
        ("nsfw", boolean),
        ("analytics", boolean),
        ("discoverable", boolean),
    ],
    clears: &[
        ("Description", "description"),
        ("Categories", "categories"),
        ("SystemMessages", "system_messages"),
        ("Icon", "icon"),
        ("Banner", "banner"),
    ],
};

pub static MESSAGE: Schema = Schema {
    kind: EntityKind::Message,
    keys: &[
        ("_id", "id"),
        ("channel", "channel_id"),
        ("author", "author_id"),
        ("edited", "edited_at"),
        ("mentions", "mention_ids"),
        ("replies", "reply_ids"),
    ],
    transforms: &[
        ("id", string),
        ("nonce", string),
        ("channel_id", string),
        ("author_id", string),
        ("webhook", identity),
        ("content", string),
        ("system", identity),
        ("attachments", files),
        ("edited_at", timestamp),
        ("embeds", identity),
        ("mention_ids", strings),
        ("reply_ids", strings),
        ("reactions", reactions),
        ("masquerade", identity),
        ("pinned", boolean),
    ],
    clears: &[("Pinned", "pinned")],
};

pub static MEMBER: Schema = Schema {
    kind: EntityKind::Member,
    keys: &[("_id", "id")],
    transforms: &[
        ("id", member_key),
        ("joined_at", timestamp),
        ("nickname", string),
        ("avatar", file),
        ("roles", strings),
        ("timeout", timestamp),
    ],
    clears: &[
        ("Nickname", "nickname"),
        ("Avatar", "avatar"),
        ("Roles", "roles"),
        ("Timeout", "timeout"),
    ],
};

pub static EMOJI: Schema = Schema {
    kind: EntityKind::Emoji,
    keys: &[("_id", "id")],
    transforms: &[
        ("id", string),
        ("parent", identity),
        ("creator_id", string),
        ("name", string),
        ("animated", boolean),
        ("nsfw", boolean),
    ],
    clears: &[],
};

pub static CHANNEL_UNREAD: Schema = Schema {
    kind: EntityKind::ChannelUnread,
    keys: &[
        ("_id", "id"),
        ("last_id", "last_message_id"),
        ("mentions", "message_mention_ids"),
    ],
    transforms: &[
        ("id", unread_id),
        ("last_message_id", string),
        ("message_mention_ids", strings),
    ],
    clears: &[],
};

pub static SESSION: Schema = Schema {
    kind: EntityKind::Session,
    keys: &[("_id", "id")],
    transforms: &[("id", string), ("name", string)],
    clears: &[],
};

pub static WEBHOOK: Schema = Schema {
    kind: EntityKind::Webhook,
    keys: &[("_id", "id")],
    transforms: &[
        ("id", string),
        ("name", string),
        ("avatar", file),
        ("creator_id", string),
        ("channel_id", string),
        ("permissions", number),
        ("token", string),
    ],
    clears: &[("Avatar", "avatar")],
};

pub static BOT: Schema = Schema {
    kind: EntityKind::Bot,
    keys: &[("_id", "id"), ("owner", "owner_id")],
    transforms: &[
        ("id", string),
        ("owner_id", string),
        ("token", string),
        ("public", boolean),
        ("analytics", boolean),
        ("discoverable", boolean),
        ("interactions_url", string),
        ("terms_of_service_url", string),
        ("privacy_policy_url", string),
        ("flags", number),
    ],
    clears: &[
        ("Token", "token"),
        ("InteractionsURL", "interactions_url"),
    ],
};

pub static ROLE: Schema = Schema {
    kind: EntityKind::Role,
    keys: &[],
    transforms: &[
        ("name", string),
        ("permissions", permission_override),
        ("colour", string),
        ("hoist", boolean),
        ("rank", number),
    ],
    clears: &[("Colour", "colour")],
};
