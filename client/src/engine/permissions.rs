use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::store::{
    Channel, ChannelType, MemberKey, ObjectStore, RelationshipStatus, Role, Server, ServerMember,
    User,
};

bitflags! {
    /// Permission bitfield for servers and channels.
    ///
    /// Values are folded as raw `u64` so bits this client does not know
    /// about survive role overrides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u64 {
        // ── Server management ──
        const MANAGE_CHANNEL        = 1 << 0;
        const MANAGE_SERVER         = 1 << 1;
        const MANAGE_PERMISSIONS    = 1 << 2;
        const MANAGE_ROLE           = 1 << 3;
        const MANAGE_CUSTOMISATION  = 1 << 4;

        // ── Member management ──
        const KICK_MEMBERS          = 1 << 6;
        const BAN_MEMBERS           = 1 << 7;
        const TIMEOUT_MEMBERS       = 1 << 8;
        const ASSIGN_ROLES          = 1 << 9;
        const CHANGE_NICKNAME       = 1 << 10;
        const MANAGE_NICKNAMES      = 1 << 11;
        const CHANGE_AVATAR         = 1 << 12;
        const REMOVE_AVATARS        = 1 << 13;

        // ── Channel text ──
        const VIEW_CHANNEL          = 1 << 20;
        const READ_MESSAGE_HISTORY  = 1 << 21;
        const SEND_MESSAGE          = 1 << 22;
        const MANAGE_MESSAGES       = 1 << 23;
        const MANAGE_WEBHOOKS       = 1 << 24;
        const INVITE_OTHERS         = 1 << 25;
        const SEND_EMBEDS           = 1 << 26;
        const UPLOAD_FILES          = 1 << 27;
        const MASQUERADE            = 1 << 28;
        const REACT                 = 1 << 29;

        // ── Voice ──
        const CONNECT               = 1 << 30;
        const SPEAK                 = 1 << 31;
        const VIDEO                 = 1 << 32;
        const MUTE_MEMBERS          = 1 << 33;
        const DEAFEN_MEMBERS        = 1 << 34;
        const MOVE_MEMBERS          = 1 << 35;

        /// Every bit that is always safe to grant (fits in 52 bits).
        const GRANT_ALL_SAFE        = 0x000F_FFFF_FFFF_FFFF;
    }
}

bitflags! {
    /// What the viewer may do towards another user.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UserPermissions: u64 {
        const ACCESS        = 1 << 0;
        const VIEW_PROFILE  = 1 << 1;
        const SEND_MESSAGE  = 1 << 2;
        const INVITE        = 1 << 3;
    }
}

/// Read-only access; also the ceiling for a timed-out member.
pub const DEFAULT_VIEW_ONLY: Permissions =
    Permissions::VIEW_CHANNEL.union(Permissions::READ_MESSAGE_HISTORY);

pub const ALLOW_IN_TIMEOUT: Permissions = DEFAULT_VIEW_ONLY;

/// Baseline for a fresh server.
pub const DEFAULT_PERMISSION: Permissions = DEFAULT_VIEW_ONLY
    .union(Permissions::SEND_MESSAGE)
    .union(Permissions::INVITE_OTHERS)
    .union(Permissions::SEND_EMBEDS)
    .union(Permissions::UPLOAD_FILES)
    .union(Permissions::CONNECT)
    .union(Permissions::SPEAK);

pub const DEFAULT_DIRECT_MESSAGE: Permissions = DEFAULT_PERMISSION
    .union(Permissions::MANAGE_CHANNEL)
    .union(Permissions::REACT);

const GRANT_ALL_SAFE: u64 = Permissions::GRANT_ALL_SAFE.bits();

/// Knobs for a single calculation.
#[derive(Debug, Clone)]
pub struct PermissionOptions<'a> {
    /// Membership to use instead of the cached one.
    pub member: Option<&'a ServerMember>,
    /// Reference time for timeout checks.
    pub now: DateTime<Utc>,
}

impl Default for PermissionOptions<'_> {
    fn default() -> Self {
        Self {
            member: None,
            now: Utc::now(),
        }
    }
}

/// What a permission is being calculated against.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Channel(&'a Channel),
    Server(&'a Server),
    User(&'a User),
}

/// Effective bitmask the viewer holds against `target`.
///
/// Channel and server targets yield [`Permissions`] bits, user targets yield
/// [`UserPermissions`] bits.
pub fn calculate_permission(
    store: &ObjectStore,
    viewer: &User,
    target: Target<'_>,
    options: &PermissionOptions<'_>,
) -> u64 {
    if viewer.privileged {
        return GRANT_ALL_SAFE;
    }

    match target {
        Target::Server(server) => server_mask(store, viewer, server, options),
        Target::Channel(channel) => channel_mask(store, viewer, channel, options),
        Target::User(user) => user_permissions(store, viewer, user).bits(),
    }
}

pub fn server_permissions(
    store: &ObjectStore,
    viewer: &User,
    server: &Server,
    options: &PermissionOptions<'_>,
) -> Permissions {
    Permissions::from_bits_retain(calculate_permission(
        store,
        viewer,
        Target::Server(server),
        options,
    ))
}

pub fn channel_permissions(
    store: &ObjectStore,
    viewer: &User,
    channel: &Channel,
    options: &PermissionOptions<'_>,
) -> Permissions {
    Permissions::from_bits_retain(calculate_permission(
        store,
        viewer,
        Target::Channel(channel),
        options,
    ))
}

/// Roles held by a member, lowest precedence (highest rank number) first.
pub fn ordered_roles<'s>(server: &'s Server, member: &ServerMember) -> Vec<(&'s String, &'s Role)> {
    let mut roles: Vec<_> = member
        .roles
        .iter()
        .filter_map(|id| server.roles.get_key_value(id))
        .collect();
    roles.sort_by(|(_, a), (_, b)| b.rank.cmp(&a.rank));
    roles
}

fn member_for<'a>(
    store: &'a ObjectStore,
    viewer: &User,
    server_id: &str,
    options: &PermissionOptions<'a>,
) -> Option<&'a ServerMember> {
    options.member.or_else(|| {
        store
            .members
            .get_ref_by_key(&MemberKey::new(server_id, viewer.id.as_str()))
    })
}

fn server_mask(
    store: &ObjectStore,
    viewer: &User,
    server: &Server,
    options: &PermissionOptions<'_>,
) -> u64 {
    if server.owner_id == viewer.id {
        return GRANT_ALL_SAFE;
    }
    let Some(member) = member_for(store, viewer, &server.id, options) else {
        return 0;
    };

    let mut mask = server.default_permissions;
    for (_, role) in ordered_roles(server, member) {
        mask = role.permissions.apply(mask);
    }

    if member.is_timed_out(options.now) {
        mask &= ALLOW_IN_TIMEOUT.bits();
    }
    mask
}

fn channel_mask(
    store: &ObjectStore,
    viewer: &User,
    channel: &Channel,
    options: &PermissionOptions<'_>,
) -> u64 {
    match channel.channel_type {
        ChannelType::SavedMessages => GRANT_ALL_SAFE,
        ChannelType::DirectMessage => {
            let recipient = channel
                .recipient_other_than(&viewer.id)
                .and_then(|id| store.users.get_ref(id));
            let can_message = recipient.is_some_and(|user| {
                user_permissions(store, viewer, user).contains(UserPermissions::SEND_MESSAGE)
            });
            if can_message {
                DEFAULT_DIRECT_MESSAGE.bits()
            } else {
                DEFAULT_VIEW_ONLY.bits()
            }
        }
        ChannelType::Group => {
            if channel.owner_id.as_deref() == Some(viewer.id.as_str()) {
                GRANT_ALL_SAFE
            } else {
                channel
                    .permissions
                    .unwrap_or(DEFAULT_DIRECT_MESSAGE.bits())
            }
        }
        ChannelType::TextChannel | ChannelType::VoiceChannel => {
            let Some(server) = channel
                .server_id
                .as_deref()
                .and_then(|id| store.servers.get_ref(id))
            else {
                return 0;
            };
            if server.owner_id == viewer.id {
                return GRANT_ALL_SAFE;
            }
            let Some(member) = member_for(store, viewer, &server.id, options) else {
                return 0;
            };

            let scoped = PermissionOptions {
                member: Some(member),
                now: options.now,
            };
            let mut mask = server_mask(store, viewer, server, &scoped);

            if let Some(default) = channel.default_permissions {
                mask = default.apply(mask);
            }
            for (role_id, _) in ordered_roles(server, member) {
                if let Some(role_override) = channel.role_permissions.get(role_id) {
                    mask = role_override.apply(mask);
                }
            }

            if member.is_timed_out(options.now) {
                mask &= ALLOW_IN_TIMEOUT.bits();
            }
            mask
        }
    }
}

/// What the viewer may do towards `target`, from relationship and shared context.
pub fn user_permissions(store: &ObjectStore, viewer: &User, target: &User) -> UserPermissions {
    if target.id == viewer.id {
        return UserPermissions::all();
    }

    let mut perms = match target.relationship {
        RelationshipStatus::User | RelationshipStatus::Friend => return UserPermissions::all(),
        RelationshipStatus::Blocked | RelationshipStatus::BlockedOther => {
            return UserPermissions::ACCESS;
        }
        RelationshipStatus::Incoming | RelationshipStatus::Outgoing => UserPermissions::ACCESS,
        RelationshipStatus::None => UserPermissions::empty(),
    };

    let shares_channel = store.channels.iter().any(|(_, c)| {
        matches!(
            c.channel_type,
            ChannelType::Group | ChannelType::DirectMessage
        ) && c.recipient_ids.contains(&target.id)
    });
    let shares_server = store
        .members
        .keys_for_user(&target.id)
        .iter()
        .any(|key| store.servers.has(&key.server));

    if shares_channel || shares_server {
        if viewer.is_bot() || target.is_bot() {
            perms |= UserPermissions::SEND_MESSAGE;
        }
        perms |= UserPermissions::ACCESS | UserPermissions::VIEW_PROFILE;
    }
    perms
}
