//! SQL text generation on top of the schema model.
//!
//! [`CommandBuilder`] produces DDL (drop, create, foreign-key indexes) and
//! DML (upsert plans, select-all, select-by-id, relationship loads, delete).
//! Every identifier goes through the dialect's quoting and every value is a
//! named parameter.
//!
//! # Saving graphs
//!
//! SQLite cannot run `INSERT` inside a common table expression, so a save is
//! planned as an ordered list of statements. A statement that needs a key
//! produced by an earlier one binds it as [`Binding::Returned`], and the
//! executor substitutes the earlier statement's `RETURNING` value:
//!
//! ```text
//! 0: INSERT INTO "Author" ... RETURNING "AuthorId"
//! 1: INSERT INTO "Book" (..., "AuthorId") VALUES (..., <returned by 0>) ... RETURNING "BookId"
//! 2: INSERT INTO "Book" (..., "AuthorId") VALUES (..., <returned by 0>) ... RETURNING "BookId"
//! ```

use std::collections::BTreeMap;

use relata_core::{
    DataType, Dialect, Entity, EntityKey, EntityPath, Navigation, NavigationField, OrmError,
    PathSegment, Related, RelationshipKind, SchemaModel, Table, Value,
};
use tracing::debug;

use crate::driver::Parameter;
use crate::error::Result;

/// Alias of the queried table in relationship loads.
const TARGET: &str = "T";
/// Alias of the owning table in relationship loads.
const OWNER: &str = "O";
/// Alias of the junction table in many-to-many loads.
const JUNCTION: &str = "J";

/// A statement with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub parameters: Vec<Parameter>,
}

/// DDL for a set of tables, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnsureCreated {
    pub drops: Vec<String>,
    pub creates: Vec<String>,
    /// Foreign-key pass, run after every table exists.
    pub foreign_keys: Vec<String>,
}

impl EnsureCreated {
    /// All statements as one script, `drop_existing` deciding whether the
    /// drops are included.
    pub fn to_script(&self, drop_existing: bool) -> String {
        let mut script = String::new();
        let drops = if drop_existing { &self.drops[..] } else { &[] };
        for statement in drops.iter().chain(&self.creates).chain(&self.foreign_keys) {
            script.push_str(statement);
            script.push_str(";\n");
        }
        script
    }
}

/// Where a parameter value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Value(Value),
    /// Value returned by the step at this index.
    Returned(usize),
}

/// One parameter of a save step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepParameter {
    pub name: String,
    /// Column the parameter feeds, when it feeds one.
    pub column: Option<String>,
    pub binding: Binding,
}

/// Back-reference to install on a collection item once its owner is saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackReference {
    pub field: String,
    pub owner_step: usize,
}

/// What a save step writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// Upsert of the entity at `path`, returning its primary key.
    Upsert {
        entity: String,
        primary_key: String,
        path: EntityPath,
        back_reference: Option<BackReference>,
    },
    /// Link row in a junction table.
    Link { junction: String },
}

/// One statement of a [`SavePlan`].
#[derive(Debug, Clone, PartialEq)]
pub struct SaveStep {
    pub sql: String,
    pub parameters: Vec<StepParameter>,
    pub kind: StepKind,
}

/// Ordered statements saving one entity graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavePlan {
    pub steps: Vec<SaveStep>,
}

impl SavePlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Parameters of step `index` with earlier results substituted.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] if a binding refers to a step
    /// that has not produced a value yet.
    pub fn resolve(&self, index: usize, results: &[Value]) -> Result<Vec<Parameter>> {
        let step = &self.steps[index];
        step.parameters
            .iter()
            .map(|p| -> Result<Parameter> {
                let value = match &p.binding {
                    Binding::Value(value) => value.clone(),
                    Binding::Returned(step) => results.get(*step).cloned().ok_or_else(|| {
                        OrmError::ObjectMappingError(format!(
                            "save step {index} depends on step {step} which has not run"
                        ))
                    })?,
                };
                Ok(Parameter {
                    name: p.name.clone(),
                    value,
                })
            })
            .collect()
    }

    /// Writes the values returned by each step back into `root`: primary
    /// keys of upserted entities, foreign keys bound to returned keys, and
    /// back-references of collection items.
    pub fn write_back(&self, root: &mut Entity, results: &[Value]) {
        for (index, step) in self.steps.iter().enumerate() {
            let StepKind::Upsert {
                primary_key, path, ..
            } = &step.kind
            else {
                continue;
            };
            let Some(entity) = root.at_path_mut(path) else {
                continue;
            };
            if let Some(key) = results.get(index) {
                entity.set(primary_key.clone(), key.clone());
            }
            for parameter in &step.parameters {
                if let (Some(column), Binding::Returned(source)) =
                    (&parameter.column, &parameter.binding)
                {
                    if let Some(value) = results.get(*source) {
                        entity.set(column.clone(), value.clone());
                    }
                }
            }
        }

        // Owners are copied only after every step's keys are in place, so a
        // back-reference carries its owner's returned primary key.
        for step in &self.steps {
            let StepKind::Upsert {
                path,
                back_reference: Some(back),
                ..
            } = &step.kind
            else {
                continue;
            };
            let owner = match &self.steps[back.owner_step].kind {
                StepKind::Upsert { path, .. } => root.at_path(path).map(Entity::shallow),
                StepKind::Link { .. } => None,
            };
            if let (Some(owner), Some(item)) = (owner, root.at_path_mut(path)) {
                item.set_reference(back.field.clone(), Some(owner));
            }
        }
    }
}

/// SQL generator bound to a dialect and a built schema.
pub struct CommandBuilder<'a> {
    dialect: &'a dyn Dialect,
    schema: &'a SchemaModel,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(dialect: &'a dyn Dialect, schema: &'a SchemaModel) -> Self {
        Self { dialect, schema }
    }

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn table(&self, name: &str) -> Result<&'a Table> {
        self.schema.table(name).ok_or_else(|| {
            OrmError::InvalidEntitySchema(format!("no table has been built for '{name}'")).into()
        })
    }

    /// Comma-separated mapped columns, optionally qualified by `alias`.
    fn column_list(&self, table: &Table, alias: Option<&str>) -> String {
        table
            .mapped_columns()
            .map(|c| match alias {
                Some(alias) => format!("{alias}.{}", self.quote(c.name())),
                None => self.quote(c.name()),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// DDL creating `tables` from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::UnknownType`] when a column type has no mapping.
    pub fn ensure_created(&self, tables: &[&Table]) -> Result<EnsureCreated> {
        let mut ddl = EnsureCreated::default();
        for table in tables {
            ddl.drops
                .push(format!("DROP TABLE IF EXISTS {}", self.quote(table.name())));
            ddl.creates.push(self.create_table(table)?);
            for fk in table.foreign_keys() {
                ddl.foreign_keys.push(format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    self.quote(&format!("IX_{}_{}", table.name(), fk.column_from)),
                    self.quote(table.name()),
                    self.quote(&fk.column_from)
                ));
            }
        }
        Ok(ddl)
    }

    fn create_table(&self, table: &Table) -> Result<String> {
        let mut lines = Vec::new();
        for column in table.mapped_columns() {
            let mut line = format!(
                "{} {}",
                self.quote(column.name()),
                self.dialect.map_type(column.data_type())?
            );
            // Integer keys alias the rowid and are assigned on NULL insert.
            let rowid_alias = column.is_primary_key()
                && matches!(column.data_type(), DataType::Integer | DataType::BigInt);
            if column.is_primary_key() {
                line.push_str(" PRIMARY KEY");
            }
            if !column.is_nullable() && !rowid_alias {
                line.push_str(" NOT NULL");
            }
            if column.is_unique() && !column.is_primary_key() {
                line.push_str(" UNIQUE");
            }
            if let DataType::Text {
                max_length,
                min_length,
            } = column.data_type()
            {
                if let Some(min) = min_length {
                    line.push_str(&format!(
                        " CHECK (length({}) >= {min})",
                        self.quote(column.name())
                    ));
                }
                if let Some(max) = max_length {
                    line.push_str(&format!(
                        " CHECK (length({}) <= {max})",
                        self.quote(column.name())
                    ));
                }
            }
            if let Some(fk) = table
                .foreign_keys()
                .iter()
                .find(|fk| fk.column_from == column.name())
            {
                line.push_str(&format!(
                    " REFERENCES {} ({})",
                    self.quote(&fk.table_to),
                    self.quote(&fk.column_to)
                ));
                if table.is_junction() {
                    line.push_str(" ON DELETE CASCADE");
                }
            }
            lines.push(line);
        }
        if let Some(sides) = table.junction_sides() {
            lines.push(format!(
                "UNIQUE ({}, {})",
                self.quote(&sides.left.1),
                self.quote(&sides.right.1)
            ));
        }
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.quote(table.name()),
            lines.join(",\n    ")
        ))
    }

    /// `SELECT` of every mapped column of `entity`.
    pub fn get_all(&self, entity: &str) -> Result<Statement> {
        let table = self.table(entity)?;
        Ok(Statement {
            sql: format!(
                "SELECT {} FROM {}",
                self.column_list(table, None),
                self.quote(table.name())
            ),
            parameters: Vec::new(),
        })
    }

    /// `SELECT` of one row by primary key.
    pub fn get_by_id(&self, entity: &str, key: &EntityKey) -> Result<Statement> {
        let table = self.table(entity)?;
        let mut statement = self.get_all(entity)?;
        statement.sql.push_str(&format!(
            " WHERE {} = {}",
            self.quote(table.primary_key()),
            self.dialect.placeholder(0)
        ));
        statement.parameters.push(self.parameter(0, key.to_value()));
        Ok(statement)
    }

    /// `DELETE` of one row by primary key.
    pub fn delete(&self, entity: &str, key: &EntityKey) -> Result<Statement> {
        let table = self.table(entity)?;
        Ok(Statement {
            sql: format!(
                "DELETE FROM {} WHERE {} = {}",
                self.quote(table.name()),
                self.quote(table.primary_key()),
                self.dialect.placeholder(0)
            ),
            parameters: vec![self.parameter(0, key.to_value())],
        })
    }

    fn parameter(&self, index: usize, value: Value) -> Parameter {
        Parameter {
            name: self.dialect.parameter_name(index),
            value,
        }
    }

    /// Query loading navigation `field` of the `owner` row with key
    /// `owner_key`. Only the owner key is parameterized.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] if the field has no resolved
    /// relationship.
    pub fn load(&self, owner: &str, field: &str, owner_key: &EntityKey) -> Result<Statement> {
        let owner_table = self.table(owner)?;
        let navigation = owner_table.navigation(field).ok_or_else(|| {
            OrmError::ObjectMappingError(format!("{owner} has no navigation field '{field}'"))
        })?;
        let kind = navigation.kind.ok_or_else(|| {
            OrmError::ObjectMappingError(format!(
                "{owner}.{field} has no resolvable relationship kind"
            ))
        })?;
        let target = self.table(&navigation.target)?;
        let key = self.dialect.placeholder(0);

        let select = format!(
            "SELECT {} FROM {} AS {TARGET}",
            self.column_list(target, Some(TARGET)),
            self.quote(target.name())
        );
        let sql = match kind {
            RelationshipKind::OneToMany => format!(
                "{select} WHERE {TARGET}.{} = {key}",
                self.quote(self.foreign_key_of(owner, navigation)?)
            ),
            RelationshipKind::ManyToOne => format!(
                "{select} INNER JOIN {} AS {OWNER} ON {OWNER}.{} = {TARGET}.{} WHERE {OWNER}.{} = {key}",
                self.quote(owner_table.name()),
                self.quote(self.foreign_key_of(owner, navigation)?),
                self.quote(target.primary_key()),
                self.quote(owner_table.primary_key())
            ),
            RelationshipKind::OneToOne => {
                let own_fk = self.foreign_key_of(owner, navigation)?;
                let reverse_fk = navigation
                    .reverse
                    .as_deref()
                    .and_then(|reverse| target.navigation(reverse))
                    .and_then(|reverse| reverse.foreign_key.as_deref());
                let via_owner = format!(
                    "{TARGET}.{} = (SELECT {OWNER}.{} FROM {} AS {OWNER} WHERE {OWNER}.{} = {key})",
                    self.quote(target.primary_key()),
                    self.quote(own_fk),
                    self.quote(owner_table.name()),
                    self.quote(owner_table.primary_key())
                );
                match reverse_fk {
                    Some(reverse_fk) => format!(
                        "{select} WHERE {TARGET}.{} = {key} OR {via_owner} LIMIT 1",
                        self.quote(reverse_fk)
                    ),
                    None => format!("{select} WHERE {via_owner} LIMIT 1"),
                }
            }
            RelationshipKind::ManyToMany => {
                let junction_name = navigation.junction.as_deref().ok_or_else(|| {
                    OrmError::ObjectMappingError(format!("{owner}.{field} has no junction table"))
                })?;
                let junction = self.table(junction_name)?;
                let (own_column, other_column) = junction
                    .junction_sides()
                    .and_then(|sides| sides.oriented(owner))
                    .ok_or_else(|| {
                        OrmError::ObjectMappingError(format!(
                            "junction {junction_name} does not link {owner}"
                        ))
                    })?;
                format!(
                    "{select} INNER JOIN {} AS {JUNCTION} ON {JUNCTION}.{} = {TARGET}.{} WHERE {JUNCTION}.{} = {key}",
                    self.quote(junction.name()),
                    self.quote(other_column),
                    self.quote(target.primary_key()),
                    self.quote(own_column)
                )
            }
        };
        debug!(owner, field, kind = %kind, "built relationship load");
        Ok(Statement {
            sql,
            parameters: vec![self.parameter(0, owner_key.to_value())],
        })
    }

    fn foreign_key_of<'n>(&self, owner: &str, navigation: &'n NavigationField) -> Result<&'n str> {
        navigation.foreign_key.as_deref().ok_or_else(|| {
            OrmError::ObjectMappingError(format!(
                "{owner}.{} has no foreign key column",
                navigation.name
            ))
            .into()
        })
    }

    /// Plans the upsert of `root` and everything reachable through its loaded
    /// navigation fields.
    ///
    /// References are saved before the entity holding their foreign key;
    /// collection items after their owner with the back-reference field
    /// skipped, so a graph never re-saves its owner through the reverse
    /// navigation. Entities with a known key are saved once per plan.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::InvalidEntitySchema`] for entities whose table has
    /// not been built.
    pub fn save_plan(&self, root: &Entity) -> Result<SavePlan> {
        let mut planner = SavePlanner {
            builder: self,
            root,
            plan: SavePlan::default(),
            saved: BTreeMap::new(),
        };
        planner.plan_entity(Vec::new(), None, Vec::new(), None)?;
        debug!(
            entity = root.type_name(),
            steps = planner.plan.len(),
            "planned save"
        );
        Ok(planner.plan)
    }

    fn upsert_sql(&self, table: &Table, columns: &[&str]) -> String {
        let quoted: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();
        let placeholders: Vec<String> = (0..columns.len())
            .map(|i| self.dialect.placeholder(i))
            .collect();
        let key = self.quote(table.primary_key());
        let mut updates: Vec<String> = columns
            .iter()
            .filter(|c| **c != table.primary_key())
            .map(|c| {
                let q = self.quote(c);
                format!("{q} = excluded.{q}")
            })
            .collect();
        if updates.is_empty() {
            updates.push(format!("{key} = excluded.{key}"));
        }
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({key}) DO UPDATE SET {} RETURNING {key}",
            self.quote(table.name()),
            quoted.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        )
    }

    fn link_sql(&self, junction: &Table, own: &str, other: &str) -> String {
        format!(
            "INSERT INTO {} ({}, {}) VALUES ({}, {}) ON CONFLICT DO NOTHING",
            self.quote(junction.name()),
            self.quote(own),
            self.quote(other),
            self.dialect.placeholder(0),
            self.dialect.placeholder(1)
        )
    }
}

struct SavePlanner<'b, 'a> {
    builder: &'b CommandBuilder<'a>,
    root: &'b Entity,
    plan: SavePlan,
    saved: BTreeMap<(String, EntityKey), usize>,
}

impl SavePlanner<'_, '_> {
    fn child(path: &EntityPath, field: &str, index: Option<usize>) -> EntityPath {
        let mut child = path.clone();
        child.push(PathSegment {
            field: field.to_string(),
            index,
        });
        child
    }

    /// Plans the entity at `path`; returns the index of its upsert step.
    fn plan_entity(
        &mut self,
        path: EntityPath,
        skip: Option<String>,
        inherited: Vec<(String, usize)>,
        back_reference: Option<BackReference>,
    ) -> Result<usize> {
        let root = self.root;
        let entity = root.at_path(&path).ok_or_else(|| {
            OrmError::ObjectMappingError("save path does not resolve to an entity".to_string())
        })?;
        let table = self.builder.table(entity.type_name())?;
        let identity = entity
            .key(table.primary_key())
            .map(|key| (table.name().to_string(), key));
        if let Some(step) = identity.as_ref().and_then(|id| self.saved.get(id)) {
            return Ok(*step);
        }

        let mut overrides: BTreeMap<String, Binding> = inherited
            .into_iter()
            .map(|(column, step)| (column, Binding::Returned(step)))
            .collect();

        for navigation in table.navigations() {
            if skip.as_deref() == Some(navigation.name.as_str()) {
                continue;
            }
            let Some(kind) = navigation.kind else {
                continue;
            };
            if !matches!(kind, RelationshipKind::ManyToOne | RelationshipKind::OneToOne) {
                continue;
            }
            let Some(column) = navigation.foreign_key.clone() else {
                continue;
            };
            match entity.navigation(&navigation.name) {
                Some(Navigation::Loaded(Related::One(Some(_)))) => {
                    let step = self.plan_entity(
                        Self::child(&path, &navigation.name, None),
                        navigation.reverse.clone(),
                        Vec::new(),
                        None,
                    )?;
                    overrides.insert(column, Binding::Returned(step));
                }
                Some(Navigation::Loaded(Related::One(None))) => {
                    overrides
                        .entry(column)
                        .or_insert(Binding::Value(Value::Null));
                }
                _ => {}
            }
        }

        let columns: Vec<&str> = table.mapped_columns().map(|c| c.name()).collect();
        let parameters = columns
            .iter()
            .enumerate()
            .map(|(i, column)| StepParameter {
                name: self.builder.dialect.parameter_name(i),
                column: Some(column.to_string()),
                binding: overrides.remove(*column).unwrap_or_else(|| {
                    Binding::Value(entity.value(column).cloned().unwrap_or(Value::Null))
                }),
            })
            .collect();
        let own_step = self.plan.steps.len();
        self.plan.steps.push(SaveStep {
            sql: self.builder.upsert_sql(table, &columns),
            parameters,
            kind: StepKind::Upsert {
                entity: table.name().to_string(),
                primary_key: table.primary_key().to_string(),
                path: path.clone(),
                back_reference,
            },
        });
        if let Some(identity) = identity {
            self.saved.insert(identity, own_step);
        }

        for navigation in table.navigations() {
            if skip.as_deref() == Some(navigation.name.as_str()) {
                continue;
            }
            let items = match entity.navigation(&navigation.name) {
                Some(Navigation::Loaded(Related::Many(items))) => items.len(),
                _ => continue,
            };
            match navigation.kind {
                Some(RelationshipKind::OneToMany) => {
                    let Some(column) = navigation.foreign_key.clone() else {
                        continue;
                    };
                    for index in 0..items {
                        let back = navigation.reverse.clone().map(|field| BackReference {
                            field,
                            owner_step: own_step,
                        });
                        self.plan_entity(
                            Self::child(&path, &navigation.name, Some(index)),
                            navigation.reverse.clone(),
                            vec![(column.clone(), own_step)],
                            back,
                        )?;
                    }
                }
                Some(RelationshipKind::ManyToMany) => {
                    let Some(junction_name) = navigation.junction.as_deref() else {
                        continue;
                    };
                    let junction = self.builder.table(junction_name)?;
                    let Some((own, other)) = junction
                        .junction_sides()
                        .and_then(|sides| sides.oriented(table.name()))
                    else {
                        continue;
                    };
                    for index in 0..items {
                        let item_step = self.plan_entity(
                            Self::child(&path, &navigation.name, Some(index)),
                            navigation.reverse.clone(),
                            Vec::new(),
                            None,
                        )?;
                        self.plan.steps.push(SaveStep {
                            sql: self.builder.link_sql(junction, own, other),
                            parameters: vec![
                                StepParameter {
                                    name: self.builder.dialect.parameter_name(0),
                                    column: None,
                                    binding: Binding::Returned(own_step),
                                },
                                StepParameter {
                                    name: self.builder.dialect.parameter_name(1),
                                    column: None,
                                    binding: Binding::Returned(item_step),
                                },
                            ],
                            kind: StepKind::Link {
                                junction: junction.name().to_string(),
                            },
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(own_step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;
    use relata_core::{EntityDescriptor, EntityRegistry, FieldDescriptor, ScalarType};

    fn schema() -> SchemaModel {
        let mut registry = EntityRegistry::new();
        registry.register(
            EntityDescriptor::new("Author")
                .with_field(FieldDescriptor::column("AuthorId", ScalarType::Int32).primary_key())
                .with_field(FieldDescriptor::column("Name", ScalarType::String).max_length(80))
                .with_field(FieldDescriptor::collection("Books", "Book")),
        );
        registry.register(
            EntityDescriptor::new("Book")
                .with_field(FieldDescriptor::column("BookId", ScalarType::Int32).primary_key())
                .with_field(FieldDescriptor::column("Title", ScalarType::String).not_null())
                .with_field(FieldDescriptor::reference("Author", "Author"))
                .with_field(FieldDescriptor::collection("Tags", "Tag")),
        );
        registry.register(
            EntityDescriptor::new("Tag")
                .with_field(FieldDescriptor::column("TagId", ScalarType::Int32).primary_key())
                .with_field(FieldDescriptor::column("Label", ScalarType::String).unique())
                .with_field(FieldDescriptor::collection("Books", "Book")),
        );
        let mut model = SchemaModel::new(registry);
        model.build_all().unwrap();
        model
    }

    #[test]
    fn test_create_table_declares_keys_and_constraints() {
        let schema = schema();
        let dialect = SqliteDialect::new();
        let builder = CommandBuilder::new(&dialect, &schema);
        let book = schema.table("Book").unwrap();
        let ddl = builder.ensure_created(&[book]).unwrap();

        assert_eq!(ddl.drops, vec![r#"DROP TABLE IF EXISTS "Book""#.to_string()]);
        let create = &ddl.creates[0];
        assert!(create.contains(r#""BookId" INTEGER PRIMARY KEY,"#));
        assert!(create.contains(r#""Title" TEXT NOT NULL"#));
        assert!(create.contains(r#""AuthorId" INTEGER NOT NULL REFERENCES "Author" ("AuthorId")"#));
        assert_eq!(
            ddl.foreign_keys,
            vec![r#"CREATE INDEX IF NOT EXISTS "IX_Book_AuthorId" ON "Book" ("AuthorId")"#.to_string()]
        );
    }

    #[test]
    fn test_junction_table_ddl() {
        let schema = schema();
        let dialect = SqliteDialect::new();
        let builder = CommandBuilder::new(&dialect, &schema);
        let junction = schema.table("Book_Tag").unwrap();
        let create = &builder.ensure_created(&[junction]).unwrap().creates[0];
        assert!(create.contains(r#""Id" INTEGER PRIMARY KEY,"#));
        assert!(create.contains(r#"REFERENCES "Book" ("BookId") ON DELETE CASCADE"#));
        assert!(create.contains(r#"UNIQUE ("BookId", "TagId")"#));
    }

    #[test]
    fn test_length_checks() {
        let schema = schema();
        let dialect = SqliteDialect::new();
        let builder = CommandBuilder::new(&dialect, &schema);
        let create = &builder
            .ensure_created(&[schema.table("Author").unwrap()])
            .unwrap()
            .creates[0];
        assert!(create.contains(r#""Name" VARCHAR(80) CHECK (length("Name") <= 80)"#));
    }

    #[test]
    fn test_script_without_drops() {
        let ddl = EnsureCreated {
            drops: vec!["DROP".into()],
            creates: vec!["CREATE".into()],
            foreign_keys: vec!["INDEX".into()],
        };
        assert_eq!(ddl.to_script(false), "CREATE;\nINDEX;\n");
        assert_eq!(ddl.to_script(true), "DROP;\nCREATE;\nINDEX;\n");
    }

    #[test]
    fn test_get_by_id_parameterizes_key() {
        let schema = schema();
        let dialect = SqliteDialect::new();
        let statement = CommandBuilder::new(&dialect, &schema)
            .get_by_id("Book", &EntityKey::Integer(3))
            .unwrap();
        assert_eq!(
            statement.sql,
            r#"SELECT "BookId", "Title", "AuthorId" FROM "Book" WHERE "BookId" = @p0"#
        );
        assert_eq!(statement.parameters, vec![Parameter::new("@p0", 3)]);
    }

    #[test]
    fn test_relationship_loads() {
        let schema = schema();
        let dialect = SqliteDialect::new();
        let builder = CommandBuilder::new(&dialect, &schema);
        let key = EntityKey::Integer(1);

        assert_eq!(
            builder.load("Author", "Books", &key).unwrap().sql,
            r#"SELECT T."BookId", T."Title", T."AuthorId" FROM "Book" AS T WHERE T."AuthorId" = @p0"#
        );
        assert_eq!(
            builder.load("Book", "Author", &key).unwrap().sql,
            r#"SELECT T."AuthorId", T."Name" FROM "Author" AS T INNER JOIN "Book" AS O ON O."AuthorId" = T."AuthorId" WHERE O."BookId" = @p0"#
        );
        assert_eq!(
            builder.load("Book", "Tags", &key).unwrap().sql,
            r#"SELECT T."TagId", T."Label" FROM "Tag" AS T INNER JOIN "Book_Tag" AS J ON J."TagId" = T."TagId" WHERE J."BookId" = @p0"#
        );
        assert!(matches!(
            builder.load("Book", "Missing", &key),
            Err(crate::SqliteError::Orm(OrmError::ObjectMappingError(_)))
        ));
    }

    #[test]
    fn test_save_plan_orders_owner_before_items() {
        let schema = schema();
        let dialect = SqliteDialect::new();
        let author = Entity::new("Author").with("Name", "Le Guin").with_collection(
            "Books",
            vec![
                Entity::new("Book").with("Title", "Earthsea"),
                Entity::new("Book").with("Title", "Lathe"),
            ],
        );
        let plan = CommandBuilder::new(&dialect, &schema)
            .save_plan(&author)
            .unwrap();

        assert_eq!(plan.len(), 3);
        assert_eq!(
            plan.steps[0].sql,
            r#"INSERT INTO "Author" ("AuthorId", "Name") VALUES (@p0, @p1) ON CONFLICT ("AuthorId") DO UPDATE SET "Name" = excluded."Name" RETURNING "AuthorId""#
        );
        for step in &plan.steps[1..] {
            let fk = step
                .parameters
                .iter()
                .find(|p| p.column.as_deref() == Some("AuthorId"))
                .unwrap();
            assert_eq!(fk.binding, Binding::Returned(0));
            assert!(matches!(
                &step.kind,
                StepKind::Upsert { back_reference: Some(BackReference { field, owner_step: 0 }), .. }
                    if field == "Author"
            ));
        }
    }

    #[test]
    fn test_save_plan_reference_first_and_links() {
        let schema = schema();
        let dialect = SqliteDialect::new();
        let book = Entity::new("Book")
            .with("Title", "Dune")
            .with_reference("Author", Entity::new("Author").with("Name", "Herbert"))
            .with_collection(
                "Tags",
                vec![
                    Entity::new("Tag").with("TagId", 1).with("Label", "sf"),
                    Entity::new("Tag").with("TagId", 1).with("Label", "sf"),
                ],
            );
        let plan = CommandBuilder::new(&dialect, &schema)
            .save_plan(&book)
            .unwrap();

        // author, book, tag, link, link (second tag deduplicated)
        assert_eq!(plan.len(), 5);
        assert!(matches!(&plan.steps[0].kind, StepKind::Upsert { entity, .. } if entity == "Author"));
        assert!(matches!(&plan.steps[1].kind, StepKind::Upsert { entity, .. } if entity == "Book"));
        assert!(plan.steps[3].sql.ends_with("ON CONFLICT DO NOTHING"));
        assert_eq!(plan.steps[3].parameters[1].binding, Binding::Returned(2));
        assert_eq!(plan.steps[4].parameters[1].binding, Binding::Returned(2));
    }

    #[test]
    fn test_upsert_without_value_columns_updates_key() {
        let mut registry = EntityRegistry::new();
        registry.register(
            EntityDescriptor::new("Marker")
                .with_field(FieldDescriptor::column("MarkerId", ScalarType::Int64).primary_key()),
        );
        let mut schema = SchemaModel::new(registry);
        schema.build_all().unwrap();
        let dialect = SqliteDialect::new();
        let plan = CommandBuilder::new(&dialect, &schema)
            .save_plan(&Entity::new("Marker"))
            .unwrap();
        assert!(plan.steps[0]
            .sql
            .contains(r#"DO UPDATE SET "MarkerId" = excluded."MarkerId" RETURNING"#));
    }

    #[test]
    fn test_write_back_sets_keys_and_back_references() {
        let schema = schema();
        let dialect = SqliteDialect::new();
        let mut author = Entity::new("Author")
            .with("Name", "Le Guin")
            .with_collection("Books", vec![Entity::new("Book").with("Title", "Earthsea")]);
        let plan = CommandBuilder::new(&dialect, &schema)
            .save_plan(&author)
            .unwrap();
        plan.write_back(&mut author, &[Value::Integer(7), Value::Integer(70)]);

        assert_eq!(author.get::<i32>("AuthorId").unwrap(), 7);
        let book = &author.collection("Books")[0];
        assert_eq!(book.get::<i32>("BookId").unwrap(), 70);
        assert_eq!(book.get::<i32>("AuthorId").unwrap(), 7);
        assert_eq!(
            book.reference("Author").unwrap().get::<String>("Name").unwrap(),
            "Le Guin"
        );
    }

    #[test]
    fn test_back_reference_copies_owner_after_keys_are_written() {
        let schema = schema();
        let dialect = SqliteDialect::new();
        let mut author = Entity::new("Author").with("Name", "Le Guin").with_collection(
            "Books",
            vec![
                Entity::new("Book").with("Title", "Earthsea"),
                Entity::new("Book").with("Title", "Lathe"),
            ],
        );
        let plan = CommandBuilder::new(&dialect, &schema)
            .save_plan(&author)
            .unwrap();
        plan.write_back(
            &mut author,
            &[Value::Integer(7), Value::Integer(70), Value::Integer(71)],
        );

        for (book, id) in author.collection("Books").iter().zip([70, 71]) {
            assert_eq!(book.get::<i32>("BookId").unwrap(), id);
            let owner = book.reference("Author").unwrap();
            assert_eq!(owner.get::<i32>("AuthorId").unwrap(), 7);
            // shallow copy: the owner's own collection is not carried
            assert!(owner.collection("Books").is_empty());
        }
    }

    #[test]
    fn test_resolve_substitutes_returned_values() {
        let schema = schema();
        let dialect = SqliteDialect::new();
        let author = Entity::new("Author")
            .with_collection("Books", vec![Entity::new("Book").with("Title", "X")]);
        let plan = CommandBuilder::new(&dialect, &schema)
            .save_plan(&author)
            .unwrap();
        assert!(plan.resolve(1, &[]).is_err());
        let parameters = plan.resolve(1, &[Value::Integer(9)]).unwrap();
        assert!(parameters.contains(&Parameter::new("@p2", 9)));
    }
}
