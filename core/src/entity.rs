//! Dynamic entity instances and deferred navigation wrappers.
//!
//! An [`Entity`] is one row of one entity type: column values keyed by
//! column name plus one [`Navigation`] per relationship field. A navigation
//! is an explicit two-state wrapper: either `Unloaded`, carrying just enough
//! identity to fetch the related rows later, or `Loaded` with the related
//! entities in hand. Nothing in here talks to a database; the context that
//! owns the connection performs the load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{OrmError, Result};
use crate::schema::RelationshipKind;
use crate::value::{EntityKey, FromValue, Value};

/// Identity of a relationship load that has not happened yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deferred {
    /// Entity type owning the navigation field.
    pub owner: String,
    /// Navigation field name on the owner.
    pub field: String,
    /// Entity type on the other side.
    pub target: String,
    pub kind: RelationshipKind,
    /// Primary key of the owning row.
    pub owner_key: EntityKey,
}

/// Resolved contents of a navigation field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Related {
    One(Option<Box<Entity>>),
    Many(Vec<Entity>),
}

impl Related {
    /// The single related entity, if this is a populated reference.
    pub fn as_one(&self) -> Option<&Entity> {
        match self {
            Related::One(one) => one.as_deref(),
            Related::Many(_) => None,
        }
    }

    /// The related entities of a collection (empty for references).
    pub fn as_many(&self) -> &[Entity] {
        match self {
            Related::Many(many) => many,
            Related::One(_) => &[],
        }
    }

    /// All related entities regardless of cardinality.
    pub fn entities(&self) -> Vec<&Entity> {
        match self {
            Related::One(one) => one.iter().map(|boxed| &**boxed).collect(),
            Related::Many(many) => many.iter().collect(),
        }
    }

    /// Converts every related entity into a typed model.
    ///
    /// # Errors
    ///
    /// Propagates [`Model::from_entity`](crate::Model::from_entity) failures.
    pub fn models<T: crate::Model>(&self) -> Result<Vec<T>> {
        self.entities().into_iter().map(T::from_entity).collect()
    }
}

/// A relationship field that is either waiting to be loaded or loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Navigation {
    Unloaded(Deferred),
    Loaded(Related),
}

impl Default for Navigation {
    fn default() -> Self {
        Navigation::Loaded(Related::One(None))
    }
}

impl Navigation {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Navigation::Loaded(_))
    }

    /// Loaded contents, or `None` while still deferred.
    pub fn loaded(&self) -> Option<&Related> {
        match self {
            Navigation::Loaded(related) => Some(related),
            Navigation::Unloaded(_) => None,
        }
    }

    /// Pending load identity, or `None` once loaded.
    pub fn deferred(&self) -> Option<&Deferred> {
        match self {
            Navigation::Unloaded(deferred) => Some(deferred),
            Navigation::Loaded(_) => None,
        }
    }
}

/// One step into an entity graph: a navigation field and, for
/// collections, the item index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathSegment {
    pub field: String,
    pub index: Option<usize>,
}

/// Location of an entity inside a graph rooted at some entity.
pub type EntityPath = Vec<PathSegment>;

/// A dynamically typed entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    type_name: String,
    values: BTreeMap<String, Value>,
    navigations: BTreeMap<String, Navigation>,
}

impl Entity {
    /// Creates an empty instance of `type_name`.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            values: BTreeMap::new(),
            navigations: BTreeMap::new(),
        }
    }

    /// Sets a column value (builder pattern).
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    /// Sets a single reference (builder pattern).
    pub fn with_reference(mut self, field: impl Into<String>, target: Entity) -> Self {
        self.set_reference(field, Some(target));
        self
    }

    /// Sets a collection (builder pattern).
    pub fn with_collection(mut self, field: impl Into<String>, items: Vec<Entity>) -> Self {
        self.set_collection(field, items);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    /// Raw value of a column; `None` if the column was never set.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Typed value of a column. Unset columns read as [`Value::Null`].
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] on a type mismatch.
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T> {
        let value = self.values.get(column).unwrap_or(&Value::Null);
        T::from_value(value).map_err(|e| {
            OrmError::ObjectMappingError(format!("{}.{column}: {e}", self.type_name))
        })
    }

    /// All column values, ordered by column name.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn set_reference(&mut self, field: impl Into<String>, target: Option<Entity>) {
        self.navigations.insert(
            field.into(),
            Navigation::Loaded(Related::One(target.map(Box::new))),
        );
    }

    pub fn set_collection(&mut self, field: impl Into<String>, items: Vec<Entity>) {
        self.navigations
            .insert(field.into(), Navigation::Loaded(Related::Many(items)));
    }

    pub fn set_navigation(&mut self, field: impl Into<String>, navigation: Navigation) {
        self.navigations.insert(field.into(), navigation);
    }

    pub fn navigation(&self, field: &str) -> Option<&Navigation> {
        self.navigations.get(field)
    }

    pub fn navigation_mut(&mut self, field: &str) -> Option<&mut Navigation> {
        self.navigations.get_mut(field)
    }

    pub fn navigations(&self) -> &BTreeMap<String, Navigation> {
        &self.navigations
    }

    /// Loaded reference target, if any.
    pub fn reference(&self, field: &str) -> Option<&Entity> {
        self.navigation(field)
            .and_then(Navigation::loaded)
            .and_then(Related::as_one)
    }

    /// Loaded collection items (empty when unset or deferred).
    pub fn collection(&self, field: &str) -> &[Entity] {
        self.navigation(field)
            .and_then(Navigation::loaded)
            .map(Related::as_many)
            .unwrap_or(&[])
    }

    /// Copy carrying the column values only, without navigations.
    pub fn shallow(&self) -> Entity {
        Entity {
            type_name: self.type_name.clone(),
            values: self.values.clone(),
            navigations: BTreeMap::new(),
        }
    }

    /// Key of this entity, read from `primary_key`.
    pub fn key(&self, primary_key: &str) -> Option<EntityKey> {
        self.values.get(primary_key).and_then(Value::to_key)
    }

    /// Walks `path` from this entity.
    pub fn at_path(&self, path: &[PathSegment]) -> Option<&Entity> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self);
        };
        let next = match (self.navigations.get(&first.field)?, first.index) {
            (Navigation::Loaded(Related::One(Some(one))), None) => &**one,
            (Navigation::Loaded(Related::Many(many)), Some(i)) => many.get(i)?,
            _ => return None,
        };
        next.at_path(rest)
    }

    /// Walks `path` from this entity, mutably.
    pub fn at_path_mut(&mut self, path: &[PathSegment]) -> Option<&mut Entity> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self);
        };
        let next = match (self.navigations.get_mut(&first.field)?, first.index) {
            (Navigation::Loaded(Related::One(Some(one))), None) => &mut **one,
            (Navigation::Loaded(Related::Many(many)), Some(i)) => many.get_mut(i)?,
            _ => return None,
        };
        next.at_path_mut(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author_with_books() -> Entity {
        Entity::new("Author")
            .with("AuthorId", 1)
            .with("Name", "Le Guin")
            .with_collection(
                "Books",
                vec![
                    Entity::new("Book").with("BookId", 10).with("Title", "Earthsea"),
                    Entity::new("Book").with("BookId", 11).with("Title", "Lathe"),
                ],
            )
    }

    #[test]
    fn test_typed_get() {
        let author = author_with_books();
        assert_eq!(author.get::<i32>("AuthorId").unwrap(), 1);
        assert_eq!(author.get::<String>("Name").unwrap(), "Le Guin");
        assert_eq!(author.get::<Option<String>>("Missing").unwrap(), None);
        assert!(author.get::<i32>("Name").is_err());
    }

    #[test]
    fn test_collection_access() {
        let author = author_with_books();
        assert_eq!(author.collection("Books").len(), 2);
        assert!(author.collection("Unknown").is_empty());
        assert!(author.reference("Books").is_none());
    }

    #[test]
    fn test_path_navigation() {
        let mut author = author_with_books();
        let path = vec![PathSegment {
            field: "Books".into(),
            index: Some(1),
        }];
        assert_eq!(
            author.at_path(&path).unwrap().get::<String>("Title").unwrap(),
            "Lathe"
        );
        author.at_path_mut(&path).unwrap().set("Title", "The Lathe of Heaven");
        assert_eq!(
            author.collection("Books")[1].get::<String>("Title").unwrap(),
            "The Lathe of Heaven"
        );
        assert!(author.at_path(&[]).is_some());
    }

    #[test]
    fn test_key_requires_non_null() {
        let book = Entity::new("Book").with("BookId", Value::Null);
        assert!(book.key("BookId").is_none());
        let book = book.with("BookId", 4);
        assert_eq!(book.key("BookId"), Some(EntityKey::Integer(4)));
    }

    #[test]
    fn test_deferred_navigation_state() {
        let nav = Navigation::Unloaded(Deferred {
            owner: "Author".into(),
            field: "Books".into(),
            target: "Book".into(),
            kind: RelationshipKind::OneToMany,
            owner_key: EntityKey::Integer(1),
        });
        assert!(!nav.is_loaded());
        assert!(nav.loaded().is_none());
        assert_eq!(nav.deferred().unwrap().field, "Books");
    }
}
