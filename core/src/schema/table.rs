//! Tables, foreign keys and relationship edges.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::column::Column;
use crate::error::{OrmError, Result};

/// Cardinality of a relationship, seen from the owning table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelationshipKind::OneToOne => "one-to-one",
            RelationshipKind::OneToMany => "one-to-many",
            RelationshipKind::ManyToOne => "many-to-one",
            RelationshipKind::ManyToMany => "many-to-many",
        };
        f.write_str(name)
    }
}

/// A typed edge from one entity table to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relationship {
    /// Target entity table name.
    pub target: String,
    pub kind: RelationshipKind,
    /// Junction table backing a many-to-many edge.
    pub junction: Option<String>,
}

/// A physical foreign-key column referencing another table's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub column_from: String,
    pub column_to: String,
    pub table_to: String,
    pub is_inheritance_key: bool,
}

/// A navigation field exposed by an entity table, with the wiring the
/// schema model resolved for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavigationField {
    pub name: String,
    pub target: String,
    pub is_collection: bool,
    /// Resolved cardinality; `None` until relationship inference wires it.
    pub kind: Option<RelationshipKind>,
    /// Field on the target that navigates back to this table.
    pub reverse: Option<String>,
    /// Foreign-key column carrying the link. Lives on this table for
    /// one-to-one and many-to-one, on the target for one-to-many.
    pub foreign_key: Option<String>,
    /// Junction table for many-to-many.
    pub junction: Option<String>,
}

/// The two sides of a junction table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JunctionSides {
    /// `(entity, column)` for the lexically first entity.
    pub left: (String, String),
    /// `(entity, column)` for the lexically second entity.
    pub right: (String, String),
}

impl JunctionSides {
    /// Column pointing at `entity`, followed by the column pointing at the
    /// other side. For self-referencing junctions the left column is the
    /// owner side.
    pub fn oriented(&self, entity: &str) -> Option<(&str, &str)> {
        if self.left.0 == entity {
            Some((&self.left.1, &self.right.1))
        } else if self.right.0 == entity {
            Some((&self.right.1, &self.left.1))
        } else {
            None
        }
    }
}

/// Whether a table maps an entity or links two entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TableKind {
    Entity,
    Junction(JunctionSides),
}

/// Relational schema unit shared by entity and junction tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table {
    name: String,
    kind: TableKind,
    columns: Vec<Column>,
    primary_key: String,
    foreign_keys: Vec<ForeignKey>,
    relationships: BTreeMap<String, Relationship>,
    navigations: Vec<NavigationField>,
}

impl Table {
    pub(crate) fn new(
        name: impl Into<String>,
        kind: TableKind,
        columns: Vec<Column>,
        primary_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            columns,
            primary_key: primary_key.into(),
            foreign_keys: Vec::new(),
            relationships: BTreeMap::new(),
            navigations: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TableKind {
        &self.kind
    }

    pub fn is_junction(&self) -> bool {
        matches!(self.kind, TableKind::Junction(_))
    }

    /// Junction sides, for junction tables.
    pub fn junction_sides(&self) -> Option<&JunctionSides> {
        match &self.kind {
            TableKind::Junction(sides) => Some(sides),
            TableKind::Entity => None,
        }
    }

    /// All columns in declaration order, followed by synthesized
    /// foreign-key columns in discovery order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Columns that take part in generated SQL.
    pub fn mapped_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_mapped())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    /// Case-insensitive column lookup.
    pub fn column_ignore_case(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }

    /// Name of the primary-key column.
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Column named by [`primary_key`](Self::primary_key).
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::InvalidEntitySchema`] when no column carries that
    /// name.
    pub fn primary_key_column(&self) -> Result<&Column> {
        self.columns
            .iter()
            .find(|c| c.name() == self.primary_key)
            .ok_or_else(|| {
                OrmError::schema(format!(
                    "table '{}' has no primary key column '{}'",
                    self.name, self.primary_key
                ))
            })
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// First foreign key on this table referencing `table`.
    pub fn foreign_key_to(&self, table: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.table_to == table)
    }

    /// Relationship edges keyed by target entity name.
    pub fn relationships(&self) -> &BTreeMap<String, Relationship> {
        &self.relationships
    }

    /// Relationship edge towards `target`, if any.
    pub fn relationship_to(&self, target: &str) -> Option<&Relationship> {
        self.relationships.get(target)
    }

    pub fn navigations(&self) -> &[NavigationField] {
        &self.navigations
    }

    pub fn navigation(&self, field: &str) -> Option<&NavigationField> {
        self.navigations.iter().find(|n| n.name == field)
    }

    /// Relationship kind resolved for the navigation field `field`.
    ///
    /// Falls back to the per-target edge when the field itself carries no
    /// kind.
    pub fn relationship_kind_for_field(&self, field: &str) -> Option<RelationshipKind> {
        let navigation = self.navigation(field)?;
        navigation.kind.or_else(|| {
            self.relationships
                .get(&navigation.target)
                .map(|r| r.kind)
        })
    }

    pub(crate) fn push_column(&mut self, column: Column) {
        self.columns.push(column);
    }

    /// Adds a foreign key unless an identical one already exists.
    pub(crate) fn add_foreign_key(&mut self, foreign_key: ForeignKey) -> bool {
        if self.foreign_keys.contains(&foreign_key) {
            return false;
        }
        self.foreign_keys.push(foreign_key);
        true
    }

    /// Records the edge towards `relationship.target`, overwriting any
    /// previous edge to the same target.
    pub(crate) fn set_relationship(&mut self, relationship: Relationship) {
        self.relationships
            .insert(relationship.target.clone(), relationship);
    }

    pub(crate) fn push_navigation(&mut self, navigation: NavigationField) {
        self.navigations.push(navigation);
    }

    pub(crate) fn navigation_mut(&mut self, field: &str) -> Option<&mut NavigationField> {
        self.navigations.iter_mut().find(|n| n.name == field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;

    fn table(primary_key: &str) -> Table {
        Table::new(
            "Book",
            TableKind::Entity,
            vec![
                Column::surrogate_key("BookId"),
                Column::foreign_key("AuthorId", DataType::BigInt, true),
            ],
            primary_key,
        )
    }

    #[test]
    fn test_primary_key_column_by_name() {
        let table = table("BookId");
        assert_eq!(table.primary_key_column().unwrap().name(), "BookId");
    }

    #[test]
    fn test_missing_primary_key_column_is_schema_error() {
        assert!(matches!(
            table("Isbn").primary_key_column(),
            Err(OrmError::InvalidEntitySchema(msg)) if msg.contains("Isbn")
        ));
    }
}
