//! Relationship inference over entity descriptors.
//!
//! [`SchemaModel::table_for`] turns one registered entity into a [`Table`],
//! recursively building every entity it navigates to. Relationship kinds are
//! never declared; they follow from the shape of the navigation field on
//! both sides:
//!
//! | this side | reverse side | kind | foreign key |
//! |---|---|---|---|
//! | single | single | one-to-one | nullable, on this table |
//! | single | collection | many-to-one | not null, on this table |
//! | collection | single | one-to-many | not null, on the target |
//! | collection | collection | many-to-many | junction table |
//!
//! Built tables are memoized for the lifetime of the model. Cycles are
//! broken with an in-progress set that lives only for one top-level
//! `table_for` call.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::column::Column;
use super::table::{
    ForeignKey, JunctionSides, NavigationField, Relationship, RelationshipKind, Table, TableKind,
};
use crate::descriptor::{EntityDescriptor, EntityRegistry, FieldDescriptor, ScalarType};
use crate::error::{OrmError, Result};

/// Name of the surrogate key column every junction table carries.
pub const JUNCTION_KEY: &str = "Id";

/// Owns every table inferred from an [`EntityRegistry`].
#[derive(Debug, Clone, Default)]
pub struct SchemaModel {
    registry: EntityRegistry,
    tables: BTreeMap<String, Table>,
}

impl SchemaModel {
    pub fn new(registry: EntityRegistry) -> Self {
        Self {
            registry,
            tables: BTreeMap::new(),
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Registers another descriptor.
    ///
    /// Memoized tables are discarded because the new entity may change how
    /// existing relationships resolve.
    pub fn register(&mut self, descriptor: EntityDescriptor) {
        self.registry.register(descriptor);
        self.tables.clear();
    }

    /// Returns the table for `entity`, building it on first use.
    ///
    /// A failed build leaves previously built tables untouched.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::InvalidEntitySchema`] for non-complex or
    /// unregistered roots, missing or duplicate primary keys and
    /// unresolvable relationships, and [`OrmError::InvalidAttributeUsage`]
    /// for misplaced constraints.
    pub fn table_for(&mut self, entity: &str) -> Result<&Table> {
        if !self.tables.contains_key(entity) {
            let mut builder = TableBuilder {
                registry: &self.registry,
                tables: self.tables.clone(),
                in_progress: BTreeSet::new(),
            };
            builder.build(entity)?;
            self.tables = builder.tables;
        }
        self.table(entity)
            .ok_or_else(|| OrmError::schema(format!("no table was built for '{entity}'")))
    }

    /// Builds every registered entity.
    ///
    /// # Errors
    ///
    /// Fails on the first entity that cannot be built.
    pub fn build_all(&mut self) -> Result<()> {
        let names: Vec<String> = self.registry.names().map(String::from).collect();
        for name in names {
            self.table_for(&name)?;
        }
        Ok(())
    }

    /// Builds the named entities and returns them together with every table
    /// their relationships reach, junction tables included, ordered by name.
    ///
    /// # Errors
    ///
    /// Fails on the first entity that cannot be built.
    pub fn closure(&mut self, entities: &[&str]) -> Result<Vec<&Table>> {
        for entity in entities {
            self.table_for(entity)?;
        }

        let mut reached: BTreeSet<&str> = BTreeSet::new();
        let mut pending: Vec<&str> = entities.to_vec();
        while let Some(name) = pending.pop() {
            if !reached.insert(name) {
                continue;
            }
            let Some(table) = self.tables.get(name) else {
                continue;
            };
            for relationship in table.relationships().values() {
                pending.push(&relationship.target);
                if let Some(junction) = &relationship.junction {
                    pending.push(junction);
                }
            }
        }

        Ok(reached
            .into_iter()
            .filter_map(|name| self.tables.get(name))
            .collect())
    }

    /// An already built table.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Every built table, ordered by name.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Built junction tables.
    pub fn junction_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values().filter(|t| t.is_junction())
    }
}

/// Deterministic junction table name: both entity names in lexical order.
pub fn junction_name(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{first}_{second}")
}

/// Foreign-key column name for navigation `field` pointing at `target`.
///
/// The target's key name loses a leading target-name prefix, so
/// `Book.Author -> Author(AuthorId)` yields `AuthorId`, as does
/// `Book.Author -> Author(Id)`.
pub fn foreign_key_column(field: &str, target: &Table) -> String {
    let key = target.primary_key();
    let suffix = key
        .strip_prefix(target.name())
        .filter(|rest| !rest.is_empty())
        .unwrap_or(key);
    format!("{field}{suffix}")
}

struct TableBuilder<'a> {
    registry: &'a EntityRegistry,
    tables: BTreeMap<String, Table>,
    in_progress: BTreeSet<String>,
}

impl<'a> TableBuilder<'a> {
    fn descriptor(&self, name: &str) -> Result<&'a EntityDescriptor> {
        if ScalarType::from_name(name).is_some() {
            return Err(OrmError::schema(format!(
                "'{name}' is not a complex type and cannot be mapped as an entity"
            )));
        }
        self.registry
            .get(name)
            .ok_or_else(|| OrmError::schema(format!("entity '{name}' is not registered")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| OrmError::schema(format!("table '{name}' has not been built")))
    }

    fn build(&mut self, name: &str) -> Result<()> {
        if self.tables.contains_key(name) {
            return Ok(());
        }
        let descriptor = self.descriptor(name)?;
        debug!(entity = name, "building entity table");

        let mut columns: Vec<Column> = Vec::new();
        for field in descriptor.column_fields() {
            if columns.iter().any(|c| c.name() == field.name) {
                return Err(OrmError::schema(format!(
                    "{name} declares column '{}' twice",
                    field.name
                )));
            }
            columns.push(Column::from_field(name, field)?);
        }

        let keys: Vec<&Column> = columns.iter().filter(|c| c.is_primary_key()).collect();
        let primary_key = match keys.as_slice() {
            [key] => *key,
            [] => {
                return Err(OrmError::schema(format!("{name} has no primary key")));
            }
            many => {
                let names: Vec<&str> = many.iter().map(|c| c.name()).collect();
                return Err(OrmError::schema(format!(
                    "{name} has {} primary keys ({}); exactly one is required",
                    many.len(),
                    names.join(", ")
                )));
            }
        };
        if !primary_key.is_mapped() {
            return Err(OrmError::schema(format!(
                "{name}.{} is the primary key and cannot be unmapped",
                primary_key.name()
            )));
        }
        if !primary_key.data_type().is_key_capable() {
            return Err(OrmError::schema(format!(
                "{name}.{} has type {} which cannot be a primary key",
                primary_key.name(),
                primary_key.data_type()
            )));
        }
        let primary_key = primary_key.name().to_string();

        let mut table = Table::new(name, TableKind::Entity, columns, primary_key);
        for field in descriptor.navigation_fields() {
            if let Some(target) = field.target() {
                table.push_navigation(NavigationField {
                    name: field.name.clone(),
                    target: target.to_string(),
                    is_collection: field.is_collection(),
                    kind: None,
                    reverse: None,
                    foreign_key: None,
                    junction: None,
                });
            }
        }

        self.tables.insert(name.to_string(), table);
        self.in_progress.insert(name.to_string());
        for field in descriptor.navigation_fields() {
            self.resolve(descriptor, field)?;
        }
        self.in_progress.remove(name);
        debug!(entity = name, "entity table complete");
        Ok(())
    }

    fn resolve(&mut self, source: &'a EntityDescriptor, field: &'a FieldDescriptor) -> Result<()> {
        let Some(target_name) = field.target() else {
            return Ok(());
        };
        let target = self.descriptor(target_name)?;
        self.build(target_name)?;

        let reverse = reverse_field(source, field, target)?;
        let self_reference = source.name == target.name;

        match (field.is_collection(), reverse.is_collection()) {
            (false, false) => {
                let column =
                    self.add_foreign_key(&source.name, &field.name, target_name, true)?;
                self.wire(source, field, reverse, RelationshipKind::OneToOne, Some(column), None)?;
            }
            (false, true) => {
                let column = self.add_foreign_key(
                    &source.name,
                    &field.name,
                    target_name,
                    self_reference,
                )?;
                self.wire(
                    source,
                    field,
                    reverse,
                    RelationshipKind::ManyToOne,
                    Some(column.clone()),
                    None,
                )?;
                self.wire(
                    target,
                    reverse,
                    field,
                    RelationshipKind::OneToMany,
                    Some(column),
                    None,
                )?;
            }
            (true, false) => {
                let column = self.add_foreign_key(
                    target_name,
                    &reverse.name,
                    &source.name,
                    self_reference,
                )?;
                self.wire(
                    source,
                    field,
                    reverse,
                    RelationshipKind::OneToMany,
                    Some(column.clone()),
                    None,
                )?;
                self.wire(
                    target,
                    reverse,
                    field,
                    RelationshipKind::ManyToOne,
                    Some(column),
                    None,
                )?;
            }
            (true, true) => self.resolve_many_to_many(source, field, target, reverse)?,
        }
        Ok(())
    }

    fn resolve_many_to_many(
        &mut self,
        source: &'a EntityDescriptor,
        field: &'a FieldDescriptor,
        target: &'a EntityDescriptor,
        reverse: &'a FieldDescriptor,
    ) -> Result<()> {
        let name = junction_name(&source.name, &target.name);

        if !self.tables.contains_key(&name) {
            if source.name != target.name && self.in_progress.contains(&target.name) {
                // The target is mid-construction further up the call chain and
                // creates the junction once this table is complete.
                debug!(
                    source = %source.name,
                    target = %target.name,
                    "deferring junction to the table under construction"
                );
                return Ok(());
            }
            self.create_junction(&name, &source.name, &target.name)?;
        }

        self.wire(
            source,
            field,
            reverse,
            RelationshipKind::ManyToMany,
            None,
            Some(name.clone()),
        )?;
        self.wire(
            target,
            reverse,
            field,
            RelationshipKind::ManyToMany,
            None,
            Some(name),
        )
    }

    fn create_junction(&mut self, name: &str, a: &str, b: &str) -> Result<()> {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let first_table = self
            .tables
            .get(first)
            .ok_or_else(|| OrmError::schema(format!("table '{first}' has not been built")))?;
        let second_table = self
            .tables
            .get(second)
            .ok_or_else(|| OrmError::schema(format!("table '{second}' has not been built")))?;

        let left_column = foreign_key_column(first, first_table);
        let right_column = if first == second {
            format!("Related{}", foreign_key_column(second, second_table))
        } else {
            foreign_key_column(second, second_table)
        };
        let left_key = first_table.primary_key_column()?.clone();
        let right_key = second_table.primary_key_column()?.clone();

        let columns = vec![
            Column::surrogate_key(JUNCTION_KEY),
            Column::foreign_key(left_column.clone(), left_key.data_type().clone(), false),
            Column::foreign_key(right_column.clone(), right_key.data_type().clone(), false),
        ];
        let sides = JunctionSides {
            left: (first.to_string(), left_column.clone()),
            right: (second.to_string(), right_column.clone()),
        };
        let mut junction = Table::new(name, TableKind::Junction(sides), columns, JUNCTION_KEY);
        junction.add_foreign_key(ForeignKey {
            column_from: left_column,
            column_to: left_key.name().to_string(),
            table_to: first.to_string(),
            is_inheritance_key: false,
        });
        junction.add_foreign_key(ForeignKey {
            column_from: right_column,
            column_to: right_key.name().to_string(),
            table_to: second.to_string(),
            is_inheritance_key: false,
        });

        debug!(junction = name, "created junction table");
        self.tables.insert(name.to_string(), junction);
        Ok(())
    }

    /// Adds (or reuses) the foreign-key column on `owner` for navigation
    /// `field` pointing at `target`, returning the column name.
    fn add_foreign_key(
        &mut self,
        owner: &str,
        field: &str,
        target: &str,
        nullable: bool,
    ) -> Result<String> {
        let target_table = self
            .tables
            .get(target)
            .ok_or_else(|| OrmError::schema(format!("table '{target}' has not been built")))?;
        let column_name = foreign_key_column(field, target_table);
        let key = target_table.primary_key_column()?.clone();

        let table = self.table_mut(owner)?;
        match table.column(&column_name) {
            Some(existing) if existing.is_foreign_key() => {}
            Some(_) => {
                return Err(OrmError::schema(format!(
                    "foreign key column {owner}.{column_name} for navigation '{field}' collides with a declared column"
                )));
            }
            None => {
                table.push_column(Column::foreign_key(
                    column_name.clone(),
                    key.data_type().clone(),
                    nullable,
                ));
            }
        }
        table.add_foreign_key(ForeignKey {
            column_from: column_name.clone(),
            column_to: key.name().to_string(),
            table_to: target.to_string(),
            is_inheritance_key: false,
        });
        Ok(column_name)
    }

    fn wire(
        &mut self,
        owner: &EntityDescriptor,
        field: &FieldDescriptor,
        reverse: &FieldDescriptor,
        kind: RelationshipKind,
        foreign_key: Option<String>,
        junction: Option<String>,
    ) -> Result<()> {
        let target = field.target().unwrap_or_default().to_string();
        let table = self.table_mut(&owner.name)?;
        table.set_relationship(Relationship {
            target,
            kind,
            junction: junction.clone(),
        });
        if let Some(navigation) = table.navigation_mut(&field.name) {
            if let Some(wired) = navigation.reverse.as_deref() {
                if wired != reverse.name {
                    return Err(OrmError::schema(format!(
                        "relationship {}.{} is ambiguous: already paired with {wired}, not {}",
                        owner.name, field.name, reverse.name
                    )));
                }
            }
            navigation.kind = Some(kind);
            navigation.reverse = Some(reverse.name.clone());
            navigation.foreign_key = foreign_key;
            navigation.junction = junction;
        }
        Ok(())
    }
}

/// Field on `target` navigating back to `source` through `field`.
///
/// Navigations between two entities pair up by declaration order: the n-th
/// field of `source` pointing at `target` pairs with the n-th field of
/// `target` pointing back. On a self-reference consecutive fields pair
/// (`Manager`/`Reports`), and a lone field pairs with itself. The pairing
/// is the same from either side, so the wiring does not depend on which
/// table is built first.
fn reverse_field<'d>(
    source: &EntityDescriptor,
    field: &FieldDescriptor,
    target: &'d EntityDescriptor,
) -> Result<&'d FieldDescriptor> {
    let backward: Vec<&'d FieldDescriptor> = target
        .navigation_fields()
        .filter(|f| f.target() == Some(source.name.as_str()))
        .collect();
    if backward.is_empty() {
        return Err(OrmError::schema(format!(
            "{} has no navigated property of type {} to resolve relationship {}.{}",
            target.name, source.name, source.name, field.name
        )));
    }
    let ambiguous = || {
        OrmError::schema(format!(
            "relationship {}.{} is ambiguous: {} navigations on {} point back at {}",
            source.name,
            field.name,
            backward.len(),
            target.name,
            source.name
        ))
    };

    if source.name == target.name {
        let position = backward
            .iter()
            .position(|f| f.name == field.name)
            .ok_or_else(ambiguous)?;
        return match backward.len() {
            1 => Ok(backward[0]),
            n if n % 2 == 0 => Ok(backward[position ^ 1]),
            _ => Err(ambiguous()),
        };
    }

    let forward: Vec<&FieldDescriptor> = source
        .navigation_fields()
        .filter(|f| f.target() == Some(target.name.as_str()))
        .collect();
    if forward.len() != backward.len() {
        return Err(ambiguous());
    }
    forward
        .iter()
        .position(|f| f.name == field.name)
        .map(|position| backward[position])
        .ok_or_else(ambiguous)
}
