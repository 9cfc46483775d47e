//! Entity records and the keyed collection that owns them.
//!
//! Every object the table reports about itself — the root device record,
//! playlists, track designs — arrives as a JSON object with an `id` and a
//! `type`. Updates are partial deltas, never full replacements (except for
//! the very first sighting), so an [`Entity`] keeps its fields as the raw
//! wire map and merges deltas field by field. The merge reports whether
//! anything observable changed; identical re-delivery of the same state is
//! a no-op and must not trigger downstream notification.
//!
//! The [`Collection`] owns every known entity keyed by ID, independent of
//! which aggregate currently references it. Which entities are "live" is
//! decided by the root record's membership lists; stale entries are pruned
//! reactively when those lists shrink.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::{
    error::{Error, Result},
    events::{Listener, ListenerId, Listeners},
    protocol::parse_wire_bool,
};

/// The `type` tag of an entity record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// The root device record; exactly one per connection.
    Device,
    /// A playlist loaded on the table.
    Playlist,
    /// A track design known to the table.
    Track,
    /// A type this client does not recognize.
    Other,
}

impl EntityKind {
    fn from_wire(tag: Option<&str>) -> Self {
        match tag {
            Some("device") => Self::Device,
            Some("playlist") => Self::Playlist,
            Some("track") => Self::Track,
            _ => Self::Other,
        }
    }
}

/// Canonical string form of an ID value.
///
/// IDs are opaque, UUID-shaped strings on the wire, but older firmware
/// has been seen sending numeric IDs; both map to the same key space.
fn value_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One device-reported object, as a keyed field map.
///
/// Once created, an entity's `id` and `type` never change; merge deltas
/// may replace any other field. Boolean fields keep their wire form (the
/// strings `"true"`/`"false"`) so the no-op check compares exactly what
/// the device sent; [`Entity::bool_field`] normalizes on read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entity {
    id: String,
    fields: Map<String, Value>,
}

impl Entity {
    /// Creates an entity from a raw fragment map.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the map carries no `id`.
    pub fn from_map(fields: Map<String, Value>) -> Result<Self> {
        let id = fields
            .get("id")
            .map(value_id)
            .ok_or_else(|| Error::invalid_argument("entity fragment without an id"))?;

        Ok(Self { id, fields })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        EntityKind::from_wire(self.fields.get("type").and_then(Value::as_str))
    }

    /// Raw access to one field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// The full field map, in wire form.
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Replaces one field locally, without going through a merge.
    ///
    /// Used for the few places where the client echoes a command's effect
    /// into local state ahead of the device's own update.
    pub fn set(&mut self, field: &str, value: Value) {
        self.fields.insert(field.to_owned(), value);
    }

    #[must_use]
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    #[must_use]
    pub fn f64_field(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(Value::as_f64)
    }

    /// Integer field, accepting both numeric and string wire forms.
    #[must_use]
    pub fn i64_field(&self, field: &str) -> Option<i64> {
        match self.fields.get(field)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Boolean field, normalizing the `"true"`/`"false"` wire strings.
    #[must_use]
    pub fn bool_field(&self, field: &str) -> Option<bool> {
        self.fields.get(field).and_then(parse_wire_bool)
    }

    /// A membership list field (`playlist_ids`, `track_ids`, ...) as
    /// canonical ID strings.
    #[must_use]
    pub fn id_list(&self, field: &str) -> Vec<String> {
        self.fields
            .get(field)
            .and_then(Value::as_array)
            .map(|items| items.iter().map(value_id).collect())
            .unwrap_or_default()
    }

    /// Merges a partial delta into this entity, field by field.
    ///
    /// Fields absent from `incoming` are preserved. Returns whether any
    /// field was added or replaced; `false` means the delta was a strict
    /// no-op against the current state. `id` and `type`, once set, are
    /// never overwritten.
    pub fn merge(&mut self, incoming: &Entity) -> bool {
        let mut changed = false;
        for (field, value) in &incoming.fields {
            if matches!(field.as_str(), "id" | "type") && self.fields.contains_key(field) {
                continue;
            }

            match self.fields.get(field) {
                Some(existing) if existing == value => {}
                _ => {
                    self.fields.insert(field.clone(), value.clone());
                    changed = true;
                }
            }
        }

        changed
    }
}

/// All known entities, keyed by ID, plus the listeners interested in them.
#[derive(Default)]
pub struct Collection {
    entities: BTreeMap<String, Entity>,
    listeners: Listeners,
}

impl Collection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Inserts a new entity or merges a delta into the stored record.
    ///
    /// Returns whether anything observable changed: insertion of an
    /// unseen ID always counts, a merge counts iff some field changed.
    /// Does not notify; see [`Collection::add`].
    pub fn apply(&mut self, entity: Entity) -> bool {
        match self.entities.get_mut(entity.id()) {
            Some(existing) => {
                let changed = existing.merge(&entity);
                if changed {
                    trace!("entity {} updated", entity.id());
                }
                changed
            }
            None => {
                trace!("entity {} ({:?}) created", entity.id(), entity.kind());
                self.entities.insert(entity.id().to_owned(), entity);
                true
            }
        }
    }

    /// Inserts or merges an entity and notifies listeners on change.
    ///
    /// Every registered listener is invoked once, in registration order,
    /// and awaited to completion before this returns. Returns whether
    /// listeners were notified.
    pub async fn add(&mut self, entity: Entity) -> bool {
        let changed = self.apply(entity);
        if changed {
            self.listeners.notify().await;
        }

        changed
    }

    /// Drops every entity for which `keep` returns false.
    ///
    /// Returns whether anything was removed; a removal counts as a
    /// change from the caller's perspective.
    pub fn prune<F>(&mut self, keep: F) -> bool
    where
        F: Fn(&Entity) -> bool,
    {
        let before = self.entities.len();
        self.entities.retain(|_, entity| keep(entity));

        let removed = before - self.entities.len();
        if removed > 0 {
            debug!("pruned {removed} stale entities");
        }
        removed > 0
    }

    pub fn add_listener(&mut self, listener: Listener) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use serde_json::json;

    use super::*;
    use crate::events::sync_listener;

    fn entity(value: serde_json::Value) -> Entity {
        let Value::Object(map) = value else {
            panic!("test entity must be an object");
        };
        Entity::from_map(map).expect("test entity")
    }

    fn counting_listener(collection: &mut Collection) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        collection.add_listener(sync_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    #[test]
    fn merge_preserves_fields_absent_from_delta() {
        let mut existing = entity(json!({"id": "e1", "key": "value"}));
        let changed = existing.merge(&entity(json!({"id": "e1"})));

        assert!(!changed);
        assert_eq!(existing.str_field("key"), Some("value"));
    }

    #[test]
    fn merge_adds_new_fields() {
        let mut existing = entity(json!({"id": "e1", "key": "value"}));
        let changed = existing.merge(&entity(json!({"id": "e1", "key2": "value2"})));

        assert!(changed);
        assert_eq!(existing.str_field("key"), Some("value"));
        assert_eq!(existing.str_field("key2"), Some("value2"));
    }

    #[test]
    fn merge_replaces_changed_values() {
        let mut existing = entity(json!({"id": "e1", "key": "value"}));
        let changed = existing.merge(&entity(json!({"id": "e1", "key": "new_value"})));

        assert!(changed);
        assert_eq!(existing.str_field("key"), Some("new_value"));
    }

    #[test]
    fn merge_is_idempotent() {
        let delta = entity(json!({"id": "e1", "state": "playing", "speed": 0.5}));

        let mut once = entity(json!({"id": "e1", "state": "waiting"}));
        once.merge(&delta);
        let mut twice = once.clone();
        let changed = twice.merge(&delta);

        assert!(!changed);
        assert_eq!(once, twice);
    }

    #[test]
    fn id_and_type_never_change() {
        let mut existing = entity(json!({"id": "e1", "type": "track"}));
        let changed = existing.merge(&entity(json!({"id": "e1", "type": "playlist"})));

        assert!(!changed);
        assert_eq!(existing.kind(), EntityKind::Track);
    }

    #[test]
    fn bool_fields_normalize_on_read() {
        let record = entity(json!({"id": "e1", "is_sleeping": "false", "is_loop": true}));
        assert_eq!(record.bool_field("is_sleeping"), Some(false));
        assert_eq!(record.bool_field("is_loop"), Some(true));
        assert_eq!(record.bool_field("missing"), None);
    }

    #[tokio::test]
    async fn adding_unseen_entity_always_notifies() {
        let mut collection = Collection::new();
        let count = counting_listener(&mut collection);

        // Even an entity with no fields beyond its identity counts.
        assert!(collection.add(entity(json!({"id": "e1"}))).await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(collection.contains("e1"));
    }

    #[tokio::test]
    async fn noop_re_add_does_not_notify() {
        let mut collection = Collection::new();
        collection
            .add(entity(json!({"id": "e1", "key": "value"})))
            .await;

        let count = counting_listener(&mut collection);
        let notified = collection
            .add(entity(json!({"id": "e1", "key": "value"})))
            .await;

        assert!(!notified);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn update_notifies_listeners() {
        let mut collection = Collection::new();
        collection
            .add(entity(json!({"id": "e1", "key": "value"})))
            .await;

        let count = counting_listener(&mut collection);
        let notified = collection
            .add(entity(json!({"id": "e1", "key": "new_value"})))
            .await;

        assert!(notified);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(
            collection.get("e1").and_then(|e| e.str_field("key")),
            Some("new_value")
        );
    }

    #[test]
    fn prune_drops_unreferenced_entities() {
        let mut collection = Collection::new();
        collection.apply(entity(json!({"id": "t1", "type": "track"})));
        collection.apply(entity(json!({"id": "t2", "type": "track"})));

        let removed = collection.prune(|entity| entity.id() == "t1");
        assert!(removed);
        assert!(collection.contains("t1"));
        assert!(!collection.contains("t2"));

        // Nothing left to prune.
        assert!(!collection.prune(|entity| entity.id() == "t1"));
    }
}
