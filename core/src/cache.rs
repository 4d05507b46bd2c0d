//! Identity map with content-hash change detection.
//!
//! Entries are keyed by `(entity type, primary key)`. Each cached entity
//! carries a SHA-256 digest over its mapped column values and the primary
//! keys its navigation fields point at, so a changed reference counts as a
//! change even when no column moved.
//!
//! The cache is not synchronized; it belongs to one context.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::entity::{Deferred, Entity, Navigation, Related};
use crate::error::{OrmError, Result};
use crate::schema::{SchemaModel, Table};
use crate::value::{EntityKey, Value};

/// Hex-encoded SHA-256 digest of an entity's observable state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Computes the hash of `entity` under the shape of its table in
    /// `schema`.
    ///
    /// Unmapped columns are ignored. Loaded navigation fields contribute
    /// the keys of their targets (not their content); deferred ones
    /// contribute the owner key they would load with.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::InvalidEntitySchema`] if the entity's table has
    /// not been built.
    pub fn compute(schema: &SchemaModel, entity: &Entity) -> Result<Self> {
        let table = table_of(schema, entity)?;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(table.name().as_bytes());
        bytes.push(0);

        for column in table.mapped_columns() {
            bytes.extend_from_slice(column.name().as_bytes());
            bytes.push(0);
            entity
                .value(column.name())
                .unwrap_or(&Value::Null)
                .encode_into(&mut bytes);
        }

        for navigation in table.navigations() {
            bytes.extend_from_slice(navigation.name.as_bytes());
            bytes.push(0);
            match entity.navigation(&navigation.name) {
                Some(Navigation::Loaded(related)) => {
                    let target_key = schema
                        .table(&navigation.target)
                        .map(|t| t.primary_key().to_string())
                        .unwrap_or_default();
                    let items = related.entities();
                    bytes.push(b'L');
                    bytes.extend_from_slice(&(items.len() as u64).to_le_bytes());
                    for item in items {
                        Value::from(item.key(&target_key)).encode_into(&mut bytes);
                    }
                }
                Some(Navigation::Unloaded(deferred)) => {
                    bytes.push(b'U');
                    deferred.owner_key.to_value().encode_into(&mut bytes);
                }
                None => bytes.push(b'-'),
            }
        }

        Ok(Self(format!("{:x}", Sha256::digest(&bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn table_of<'s>(schema: &'s SchemaModel, entity: &Entity) -> Result<&'s Table> {
    schema.table(entity.type_name()).ok_or_else(|| {
        OrmError::schema(format!(
            "no table has been built for '{}'",
            entity.type_name()
        ))
    })
}

/// One cached entity with the hash it had when it was stored.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub entity: Entity,
    pub hash: ContentHash,
}

/// Identity of a relationship load: owner type, owner key and field.
pub type RelationKey = (String, EntityKey, String);

/// Identity map plus per-instance relationship results.
#[derive(Debug, Default)]
pub struct EntityCache {
    entries: BTreeMap<(String, EntityKey), CacheEntry>,
    relations: BTreeMap<RelationKey, Related>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores (or overwrites) `entity` and returns its fresh hash.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] if the entity has no usable
    /// primary-key value and [`OrmError::InvalidEntitySchema`] if its table
    /// is unknown.
    pub fn save(&mut self, schema: &SchemaModel, entity: &Entity) -> Result<ContentHash> {
        let table = table_of(schema, entity)?;
        let key = require_key(table, entity)?;
        let hash = ContentHash::compute(schema, entity)?;
        debug!(entity = table.name(), key = %key, hash = %hash, "cached entity");
        self.entries.insert(
            (table.name().to_string(), key),
            CacheEntry {
                entity: entity.clone(),
                hash: hash.clone(),
            },
        );
        Ok(hash)
    }

    /// Cached entity for `(entity_type, key)`.
    pub fn get(&self, entity_type: &str, key: &EntityKey) -> Option<&Entity> {
        self.entry(entity_type, key).map(|entry| &entry.entity)
    }

    pub fn entry(&self, entity_type: &str, key: &EntityKey) -> Option<&CacheEntry> {
        self.entries.get(&(entity_type.to_string(), key.clone()))
    }

    pub fn contains(&self, entity_type: &str, key: &EntityKey) -> bool {
        self.entry(entity_type, key).is_some()
    }

    /// Evicts an entity together with every relationship loaded for it.
    pub fn remove(&mut self, entity_type: &str, key: &EntityKey) -> Option<CacheEntry> {
        self.relations
            .retain(|(owner, owner_key, _), _| !(owner == entity_type && owner_key == key));
        self.entries.remove(&(entity_type.to_string(), key.clone()))
    }

    /// Returns `true` unless `entity` is cached with an identical hash.
    ///
    /// Entities without a key, of an unknown type, or not cached at all
    /// count as changed.
    pub fn has_changed(&self, schema: &SchemaModel, entity: &Entity) -> bool {
        let Ok(table) = table_of(schema, entity) else {
            return true;
        };
        let Some(key) = entity.key(table.primary_key()) else {
            return true;
        };
        match (self.entry(table.name(), &key), ContentHash::compute(schema, entity)) {
            (Some(entry), Ok(hash)) => entry.hash != hash,
            _ => true,
        }
    }

    /// Previously loaded relationship contents.
    pub fn get_related(&self, owner: &str, owner_key: &EntityKey, field: &str) -> Option<&Related> {
        let hit = self
            .relations
            .get(&(owner.to_string(), owner_key.clone(), field.to_string()));
        if hit.is_some() {
            debug!(owner, key = %owner_key, field, "relationship cache hit");
        }
        hit
    }

    pub fn put_related(&mut self, owner: &str, owner_key: EntityKey, field: &str, related: Related) {
        self.relations
            .insert((owner.to_string(), owner_key, field.to_string()), related);
    }

    /// Forgets a loaded relationship so the next access queries again.
    pub fn invalidate_related(&mut self, owner: &str, owner_key: &EntityKey, field: &str) {
        self.relations
            .remove(&(owner.to_string(), owner_key.clone(), field.to_string()));
    }

    /// Forgets relationship `field` of the `owner` row with `owner_key`.
    ///
    /// The loaded result is dropped, and a cached owner instance gets the
    /// field back in its deferred state so the next access queries again.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] if `field` is not a
    /// navigation with a resolved relationship on the owner's table.
    pub fn unload(
        &mut self,
        schema: &SchemaModel,
        owner: &str,
        owner_key: &EntityKey,
        field: &str,
    ) -> Result<()> {
        self.invalidate_related(owner, owner_key, field);
        let Some(entry) = self
            .entries
            .get_mut(&(owner.to_string(), owner_key.clone()))
        else {
            return Ok(());
        };
        if !matches!(entry.entity.navigation(field), Some(Navigation::Loaded(_))) {
            return Ok(());
        }

        let table = table_of(schema, &entry.entity)?;
        let (target, kind) = table
            .navigation(field)
            .zip(table.relationship_kind_for_field(field))
            .map(|(navigation, kind)| (navigation.target.clone(), kind))
            .ok_or_else(|| {
                OrmError::mapping(format!("{owner}.{field} has no resolvable relationship"))
            })?;
        entry.entity.set_navigation(
            field,
            Navigation::Unloaded(Deferred {
                owner: table.name().to_string(),
                field: field.to_string(),
                target,
                kind,
                owner_key: owner_key.clone(),
            }),
        );
        entry.hash = ContentHash::compute(schema, &entry.entity)?;
        debug!(owner, key = %owner_key, field, "unloaded cached relationship");
        Ok(())
    }

    /// [`unload`](Self::unload) for every `owner` row the cache knows of.
    pub fn unload_all(&mut self, schema: &SchemaModel, owner: &str, field: &str) -> Result<()> {
        let mut keys: BTreeSet<EntityKey> = self
            .entries
            .keys()
            .filter(|(entity_type, _)| entity_type == owner)
            .map(|(_, key)| key.clone())
            .collect();
        keys.extend(
            self.relations
                .keys()
                .filter(|(o, _, f)| o == owner && f == field)
                .map(|(_, key, _)| key.clone()),
        );
        for key in keys {
            self.unload(schema, owner, &key, field)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.relations.clear();
    }
}

fn require_key(table: &Table, entity: &Entity) -> Result<EntityKey> {
    entity.key(table.primary_key()).ok_or_else(|| {
        OrmError::mapping(format!(
            "{} has no value for primary key {}",
            table.name(),
            table.primary_key()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EntityDescriptor, EntityRegistry, FieldDescriptor, ScalarType};

    fn schema() -> SchemaModel {
        let mut registry = EntityRegistry::new();
        registry.register(
            EntityDescriptor::new("Author")
                .with_field(FieldDescriptor::column("AuthorId", ScalarType::Int32).primary_key())
                .with_field(FieldDescriptor::column("Name", ScalarType::String))
                .with_field(FieldDescriptor::column("Scratch", ScalarType::String).not_mapped())
                .with_field(FieldDescriptor::collection("Books", "Book")),
        );
        registry.register(
            EntityDescriptor::new("Book")
                .with_field(FieldDescriptor::column("BookId", ScalarType::Int32).primary_key())
                .with_field(FieldDescriptor::column("Title", ScalarType::String))
                .with_field(FieldDescriptor::reference("Author", "Author")),
        );
        let mut model = SchemaModel::new(registry);
        model.build_all().unwrap();
        model
    }

    fn author() -> Entity {
        Entity::new("Author")
            .with("AuthorId", 1)
            .with("Name", "Ursula")
            .with_collection("Books", vec![Entity::new("Book").with("BookId", 5)])
    }

    #[test]
    fn test_save_then_get_matches_fresh_hash() {
        let schema = schema();
        let mut cache = EntityCache::new();
        let entity = author();

        let saved = cache.save(&schema, &entity).unwrap();
        let entry = cache.entry("Author", &EntityKey::Integer(1)).unwrap();
        assert_eq!(entry.entity, entity);
        assert_eq!(entry.hash, saved);
        assert_eq!(ContentHash::compute(&schema, &entry.entity).unwrap(), saved);
        assert_eq!(saved.as_str().len(), 64);
    }

    #[test]
    fn test_has_changed_lifecycle() {
        let schema = schema();
        let mut cache = EntityCache::new();
        let mut entity = author();

        assert!(cache.has_changed(&schema, &entity));
        cache.save(&schema, &entity).unwrap();
        assert!(!cache.has_changed(&schema, &entity));

        entity.set("Name", "Le Guin");
        assert!(cache.has_changed(&schema, &entity));
        cache.save(&schema, &entity).unwrap();
        assert!(!cache.has_changed(&schema, &entity));
    }

    #[test]
    fn test_unmapped_column_does_not_affect_hash() {
        let schema = schema();
        let mut cache = EntityCache::new();
        let mut entity = author();
        cache.save(&schema, &entity).unwrap();
        entity.set("Scratch", "anything");
        assert!(!cache.has_changed(&schema, &entity));
    }

    #[test]
    fn test_reference_change_counts_as_change() {
        let schema = schema();
        let mut cache = EntityCache::new();
        let mut entity = author();
        cache.save(&schema, &entity).unwrap();

        entity.set_collection(
            "Books",
            vec![
                Entity::new("Book").with("BookId", 5),
                Entity::new("Book").with("BookId", 6),
            ],
        );
        assert!(cache.has_changed(&schema, &entity));
    }

    #[test]
    fn test_related_content_is_not_hashed() {
        let schema = schema();
        let mut cache = EntityCache::new();
        let mut entity = author();
        cache.save(&schema, &entity).unwrap();

        entity.set_collection(
            "Books",
            vec![Entity::new("Book").with("BookId", 5).with("Title", "Retitled")],
        );
        assert!(!cache.has_changed(&schema, &entity));
    }

    #[test]
    fn test_remove_evicts_entity_and_relations() {
        let schema = schema();
        let mut cache = EntityCache::new();
        cache.save(&schema, &author()).unwrap();
        cache.put_related("Author", EntityKey::Integer(1), "Books", Related::Many(vec![]));
        cache.put_related("Author", EntityKey::Integer(2), "Books", Related::Many(vec![]));

        assert!(cache.remove("Author", &EntityKey::Integer(1)).is_some());
        assert!(cache.get("Author", &EntityKey::Integer(1)).is_none());
        assert!(cache.get_related("Author", &EntityKey::Integer(1), "Books").is_none());
        assert!(cache.get_related("Author", &EntityKey::Integer(2), "Books").is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unload_defers_cached_navigation() {
        let schema = schema();
        let mut cache = EntityCache::new();
        let key = EntityKey::Integer(1);
        cache.save(&schema, &author()).unwrap();
        cache.put_related("Author", key.clone(), "Books", Related::Many(vec![]));

        cache.unload(&schema, "Author", &key, "Books").unwrap();
        assert!(cache.get_related("Author", &key, "Books").is_none());
        let cached = cache.get("Author", &key).unwrap().clone();
        let deferred = cached.navigation("Books").unwrap().deferred().unwrap();
        assert_eq!(deferred.target, "Book");
        assert_eq!(deferred.owner_key, key);
        assert!(!cache.has_changed(&schema, &cached));
    }

    #[test]
    fn test_unload_all_covers_every_owner() {
        let schema = schema();
        let mut cache = EntityCache::new();
        cache.save(&schema, &author()).unwrap();
        cache.put_related("Author", EntityKey::Integer(2), "Books", Related::Many(vec![]));

        cache.unload_all(&schema, "Author", "Books").unwrap();
        assert!(cache.get_related("Author", &EntityKey::Integer(2), "Books").is_none());
        let cached = cache.get("Author", &EntityKey::Integer(1)).unwrap();
        assert!(!cache.has_changed(&schema, cached));
        assert!(!cached.navigation("Books").unwrap().is_loaded());
    }

    #[test]
    fn test_save_without_key_fails() {
        let schema = schema();
        let mut cache = EntityCache::new();
        let keyless = Entity::new("Author").with("Name", "Anon");
        assert!(matches!(
            cache.save(&schema, &keyless),
            Err(OrmError::ObjectMappingError(_))
        ));
        assert!(cache.has_changed(&schema, &keyless));
    }
}
