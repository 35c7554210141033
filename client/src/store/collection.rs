use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use crate::engine::events::ClientEvent;
use crate::store::hydration::{HydrationContext, Patch, hydrate};
use crate::store::models::{Entity, MemberKey, ServerMember};

#[derive(Debug, Clone)]
struct Entry<T> {
    record: T,
    partial: bool,
}

/// All cached records of one kind, keyed by id.
#[derive(Debug)]
pub struct Collection<T: Entity> {
    entries: HashMap<String, Entry<T>>,
    ctx: Arc<HydrationContext>,
    allow_partials: bool,
}

impl<T: Entity> Collection<T> {
    pub fn new(ctx: Arc<HydrationContext>, allow_partials: bool) -> Self {
        Self {
            entries: HashMap::new(),
            ctx,
            allow_partials,
        }
    }

    /// Snapshot of a record.
    pub fn get(&self, id: &str) -> Option<T> {
        self.get_ref(id).cloned()
    }

    pub fn get_ref(&self, id: &str) -> Option<&T> {
        self.entries.get(id).map(|e| &e.record)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.entries.get_mut(id).map(|e| &mut e.record)
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// `true` if the record exists and has never received a full payload.
    pub fn is_partial(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|e| e.partial)
    }

    /// `true` if the record exists and is full.
    pub fn has_full(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|e| !e.partial)
    }

    pub fn delete(&mut self, id: &str) -> Option<T> {
        self.entries.remove(id).map(|e| e.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.entries.iter().map(|(id, e)| (id, &e.record))
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Return the full record for `id`, hydrating it from `raw` first if it is
    /// missing or partial. The creation notification is pushed to `emit` only
    /// when the record becomes full here.
    pub fn get_or_create(
        &mut self,
        id: &str,
        raw: &Value,
        emit: Option<&mut Vec<ClientEvent>>,
    ) -> &mut T {
        self.get_or_create_with(id, raw, emit, || T::empty(id))
    }

    pub fn get_or_create_with(
        &mut self,
        id: &str,
        raw: &Value,
        emit: Option<&mut Vec<ClientEvent>>,
        seed: impl FnOnce() -> T,
    ) -> &mut T {
        let ctx = Arc::clone(&self.ctx);
        let entry = self.entries.entry(id.to_string()).or_insert_with(|| {
            trace!(kind = %T::KIND, %id, "creating record");
            Entry {
                record: seed(),
                partial: true,
            }
        });

        if entry.partial {
            hydrate(T::schema(), raw, &ctx).apply_to(&mut entry.record);
            entry.partial = false;
            if let (Some(out), Some(event)) = (emit, entry.record.created()) {
                out.push(event);
            }
        }
        &mut entry.record
    }

    /// Existing record (full or partial), or a fresh empty partial if
    /// partials are allowed.
    pub fn get_or_partial(&mut self, id: &str) -> Option<&mut T> {
        self.get_or_partial_with(id, || T::empty(id))
    }

    pub fn get_or_partial_with(
        &mut self,
        id: &str,
        seed: impl FnOnce() -> T,
    ) -> Option<&mut T> {
        if !self.entries.contains_key(id) {
            if !self.allow_partials {
                debug!(kind = %T::KIND, %id, "unknown record, partials disabled");
                return None;
            }
            self.entries.insert(
                id.to_string(),
                Entry {
                    record: seed(),
                    partial: true,
                },
            );
        }
        self.get_mut(id)
    }

    /// Merge a hydrated patch into an existing record.
    pub fn update_underlying_object(&mut self, id: &str, patch: &Patch) -> bool {
        match self.get_mut(id) {
            Some(record) => {
                patch.apply_to(record);
                true
            }
            None => false,
        }
    }

    /// Overwrite a single canonical field.
    pub fn update_field(&mut self, id: &str, field: &str, value: Value) -> bool {
        let Some(record) = self.get_mut(id) else {
            return false;
        };
        match record.assign(field, value) {
            Ok(()) => true,
            Err(e) => {
                debug!(kind = %T::KIND, %id, error = %e, "field update rejected");
                false
            }
        }
    }

    /// Reset every field named by wire clear names.
    pub fn clear_fields(&mut self, id: &str, clear: &[String]) {
        let Some(record) = self.get_mut(id) else {
            return;
        };
        for name in clear {
            let Some(field) = T::schema().clear_target(name) else {
                trace!(kind = %T::KIND, clear = %name, "unknown clear name");
                continue;
            };
            if let Err(e) = record.reset(field) {
                trace!(kind = %T::KIND, error = %e, "clear rejected");
            }
        }
    }

    pub fn context(&self) -> &HydrationContext {
        &self.ctx
    }

    /// Hydrate a raw payload with this collection's context.
    pub fn hydrate(&self, raw: &Value) -> Patch {
        hydrate(T::schema(), raw, &self.ctx)
    }
}

/// Server members, addressed either by composite string or by [`MemberKey`].
#[derive(Debug)]
pub struct MemberCollection(Collection<ServerMember>);

impl MemberCollection {
    pub fn new(ctx: Arc<HydrationContext>, allow_partials: bool) -> Self {
        Self(Collection::new(ctx, allow_partials))
    }

    pub fn get_by_key(&self, key: &MemberKey) -> Option<ServerMember> {
        self.0.get(&key.composite())
    }

    pub fn get_ref_by_key(&self, key: &MemberKey) -> Option<&ServerMember> {
        self.0.get_ref(&key.composite())
    }

    pub fn has_by_key(&self, key: &MemberKey) -> bool {
        self.0.has(&key.composite())
    }

    pub fn is_partial_by_key(&self, key: &MemberKey) -> bool {
        self.0.is_partial(&key.composite())
    }

    pub fn delete_by_key(&mut self, key: &MemberKey) -> Option<ServerMember> {
        self.0.delete(&key.composite())
    }

    pub fn get_or_create_by_key(
        &mut self,
        key: &MemberKey,
        raw: &Value,
        emit: Option<&mut Vec<ClientEvent>>,
    ) -> &mut ServerMember {
        self.0
            .get_or_create_with(&key.composite(), raw, emit, || {
                ServerMember::with_key(key.clone())
            })
    }

    pub fn get_or_partial_by_key(&mut self, key: &MemberKey) -> Option<&mut ServerMember> {
        self.0
            .get_or_partial_with(&key.composite(), || ServerMember::with_key(key.clone()))
    }

    pub fn update_underlying_object_by_key(&mut self, key: &MemberKey, patch: &Patch) -> bool {
        self.0.update_underlying_object(&key.composite(), patch)
    }

    pub fn clear_fields_by_key(&mut self, key: &MemberKey, clear: &[String]) {
        self.0.clear_fields(&key.composite(), clear);
    }

    /// Every membership held in a server.
    pub fn keys_in_server(&self, server_id: &str) -> Vec<MemberKey> {
        self.0
            .iter()
            .filter(|(_, m)| m.id.server == server_id)
            .map(|(_, m)| m.id.clone())
            .collect()
    }

    /// Every membership held by a user.
    pub fn keys_for_user(&self, user_id: &str) -> Vec<MemberKey> {
        self.0
            .iter()
            .filter(|(_, m)| m.id.user == user_id)
            .map(|(_, m)| m.id.clone())
            .collect()
    }
}

impl Deref for MemberCollection {
    type Target = Collection<ServerMember>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MemberCollection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
