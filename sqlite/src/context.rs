//! The database context: one connection, one schema model, one cache.
//!
//! [`DbContext`] is the entry point applications use. It owns the driver,
//! builds tables on demand, runs generated statements, materializes the
//! results and keeps the identity map current.
//!
//! # Example
//!
//! ```no_run
//! use relata_core::{EntityDescriptor, EntityRegistry, FieldDescriptor, ScalarType};
//! use relata_sqlite::{ContextConfig, DbContext};
//!
//! let mut registry = EntityRegistry::new();
//! registry.register(
//!     EntityDescriptor::new("Book")
//!         .with_field(FieldDescriptor::column("BookId", ScalarType::Int32).primary_key())
//!         .with_field(FieldDescriptor::column("Title", ScalarType::String)),
//! );
//!
//! let mut ctx = DbContext::open(&ContextConfig::default(), registry).unwrap();
//! ctx.ensure_created().unwrap();
//! let books = ctx.get_all("Book").unwrap();
//! assert!(books.is_empty());
//! ```

use relata_core::query::{Query, QueryShape, QueryTranslator};
use relata_core::{
    Deferred, Entity, EntityCache, EntityDescriptor, EntityKey, EntityRegistry, FromValue, Model,
    Navigation, OrmError, Related, RelationshipKind, SchemaModel, Table, Value,
};
use tracing::{debug, info, warn};

use crate::command::{CommandBuilder, SavePlan, Statement, StepKind};
use crate::config::ContextConfig;
use crate::dialect::SqliteDialect;
use crate::driver::{CommandOutcome, Driver, Parameter, RowSet, SqliteDriver};
use crate::error::{Result, SqliteError};
use crate::materialize::Materializer;

const SAVEPOINT: &str = "relata_save";

/// Unit of work over one database connection.
pub struct DbContext<D: Driver = SqliteDriver> {
    driver: D,
    dialect: SqliteDialect,
    schema: SchemaModel,
    cache: EntityCache,
    foreign_keys: bool,
    drop_existing: bool,
}

impl DbContext<SqliteDriver> {
    /// Opens the database described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError::DatabaseError`] if the connection cannot be
    /// opened or configured.
    pub fn open(config: &ContextConfig, registry: EntityRegistry) -> Result<Self> {
        let conn = config.open()?;
        debug!(database = %config.database, "opened context");
        Ok(Self {
            driver: SqliteDriver::new(conn),
            dialect: SqliteDialect::with_custom_types(config.custom_types.clone()),
            schema: SchemaModel::new(registry),
            cache: EntityCache::new(),
            foreign_keys: config.foreign_keys,
            drop_existing: config.drop_existing,
        })
    }
}

impl<D: Driver> DbContext<D> {
    /// Wraps an existing driver with default settings.
    pub fn new(driver: D, registry: EntityRegistry) -> Self {
        let defaults = ContextConfig::default();
        Self {
            driver,
            dialect: SqliteDialect::new(),
            schema: SchemaModel::new(registry),
            cache: EntityCache::new(),
            foreign_keys: defaults.foreign_keys,
            drop_existing: defaults.drop_existing,
        }
    }

    /// Replaces the dialect (builder pattern).
    pub fn with_dialect(mut self, dialect: SqliteDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn schema(&self) -> &SchemaModel {
        &self.schema
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// Registers an entity type. Previously built tables are discarded.
    pub fn register(&mut self, descriptor: EntityDescriptor) {
        self.schema.register(descriptor);
    }

    pub fn register_model<T: Model>(&mut self) {
        self.schema.register(T::descriptor());
    }

    /// Builds the tables reachable from `entity`.
    fn prepare(&mut self, entity: &str) -> Result<()> {
        self.schema.closure(&[entity])?;
        Ok(())
    }

    fn table(&self, entity: &str) -> Result<&Table> {
        self.schema.table(entity).ok_or_else(|| {
            OrmError::InvalidEntitySchema(format!("no table has been built for '{entity}'")).into()
        })
    }

    fn commands(&self) -> CommandBuilder<'_> {
        CommandBuilder::new(&self.dialect, &self.schema)
    }

    fn query_rows(&self, statement: &Statement) -> Result<RowSet> {
        self.driver
            .execute_query(&statement.sql, &statement.parameters)
    }

    /// Creates the tables for `entities` and everything they reach,
    /// including junction tables.
    ///
    /// With `drop_existing` set, existing tables are dropped first with
    /// foreign-key enforcement suspended, and the cache is cleared.
    ///
    /// # Errors
    ///
    /// Fails with the schema errors of [`SchemaModel::table_for`], with
    /// [`OrmError::UnknownType`] for unmapped column types, or with the
    /// driver's error.
    pub fn ensure_schema_created(&mut self, entities: &[&str]) -> Result<()> {
        let names: Vec<String> = self
            .schema
            .closure(entities)?
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        let tables: Vec<&Table> = names
            .iter()
            .filter_map(|name| self.schema.table(name))
            .collect();
        let ddl = self.commands().ensure_created(&tables)?;

        if self.drop_existing {
            let mut script = String::from("PRAGMA foreign_keys = OFF;\n");
            for drop in &ddl.drops {
                script.push_str(drop);
                script.push_str(";\n");
            }
            if self.foreign_keys {
                script.push_str("PRAGMA foreign_keys = ON;\n");
            }
            self.driver.execute_script(&script)?;
            self.cache.clear();
        }
        self.driver.execute_script(&ddl.to_script(false))?;

        info!(
            tables = names.len(),
            dropped = self.drop_existing,
            "created schema"
        );
        Ok(())
    }

    /// Creates the tables of every registered entity type.
    pub fn ensure_created(&mut self) -> Result<()> {
        let names: Vec<String> = self.schema.registry().names().map(String::from).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        self.ensure_schema_created(&refs)
    }

    /// Upserts `entity` and every loaded entity reachable from it.
    ///
    /// Generated keys, foreign keys and back-references are written into
    /// the graph, and every saved entity is stored in the cache. The whole
    /// graph is saved inside one savepoint; on failure nothing is kept.
    ///
    /// # Errors
    ///
    /// Returns the driver's error for constraint violations, or an
    /// [`OrmError`] when the graph does not fit the schema.
    pub fn save(&mut self, entity: &mut Entity) -> Result<()> {
        self.prepare(entity.type_name())?;
        let plan = self.commands().save_plan(entity)?;

        self.driver
            .execute_script(&format!("SAVEPOINT {SAVEPOINT}"))?;
        let results = match self.run_plan(&plan) {
            Ok(results) => results,
            Err(e) => {
                if let Err(rollback) = self
                    .driver
                    .execute_script(&format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}"))
                {
                    warn!(error = %rollback, "failed to roll back save");
                }
                return Err(e);
            }
        };
        self.driver
            .execute_script(&format!("RELEASE {SAVEPOINT}"))?;

        plan.write_back(entity, &results);
        let saved: Vec<&Entity> = plan
            .steps
            .iter()
            .filter_map(|step| match &step.kind {
                StepKind::Upsert { path, .. } => entity.at_path(path),
                StepKind::Link { .. } => None,
            })
            .collect();
        // Reverse sides go first, while the cache still holds the previous
        // foreign keys of the saved rows.
        for saved in &saved {
            self.unload_reverse_sides(saved, false)?;
        }
        for saved in saved {
            self.forget_relations(saved)?;
            self.cache.save(&self.schema, saved)?;
        }
        debug!(
            entity = entity.type_name(),
            statements = plan.len(),
            "saved entity graph"
        );
        Ok(())
    }

    fn run_plan(&self, plan: &SavePlan) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(plan.len());
        for (index, step) in plan.steps.iter().enumerate() {
            let parameters = plan.resolve(index, &results)?;
            let outcome = self.driver.execute_command(&step.sql, &parameters)?;
            if let StepKind::Upsert { entity, .. } = &step.kind {
                if !matches!(&outcome, CommandOutcome::Scalar(v) if !v.is_null()) {
                    return Err(SqliteError::UnexpectedResult(format!(
                        "upsert of {entity} returned no primary key"
                    )));
                }
            }
            results.push(outcome.into_value());
        }
        Ok(results)
    }

    /// Drops cached relationship loads owned by `entity`.
    fn forget_relations(&mut self, entity: &Entity) -> Result<()> {
        let table = self.table(entity.type_name())?;
        let Some(key) = entity.key(table.primary_key()) else {
            return Ok(());
        };
        let fields: Vec<String> = table.navigations().iter().map(|n| n.name.clone()).collect();
        for field in fields {
            self.cache
                .invalidate_related(entity.type_name(), &key, &field);
        }
        Ok(())
    }

    /// Unloads the navigations that point back at `entity` from the rows it
    /// references, under both its current foreign keys and the ones of its
    /// cached snapshot. Many-to-many reverse sides are unloaded on every
    /// cached row when links were written or, with `removed`, cascaded away.
    fn unload_reverse_sides(&mut self, entity: &Entity, removed: bool) -> Result<()> {
        let table = self.table(entity.type_name())?;
        let snapshot = entity
            .key(table.primary_key())
            .and_then(|key| self.cache.get(table.name(), &key));

        let mut stale: Vec<(String, Option<EntityKey>, String)> = Vec::new();
        for navigation in table.navigations() {
            let Some(reverse) = navigation.reverse.as_ref() else {
                continue;
            };
            match navigation.kind {
                Some(RelationshipKind::ManyToOne | RelationshipKind::OneToOne) => {
                    let Some(fk) = navigation.foreign_key.as_deref() else {
                        continue;
                    };
                    for source in std::iter::once(entity).chain(snapshot) {
                        if let Some(key) = source.value(fk).and_then(Value::to_key) {
                            stale.push((navigation.target.clone(), Some(key), reverse.clone()));
                        }
                    }
                }
                Some(RelationshipKind::ManyToMany) => {
                    let linked = matches!(
                        entity.navigation(&navigation.name),
                        Some(Navigation::Loaded(_))
                    );
                    if removed || linked {
                        stale.push((navigation.target.clone(), None, reverse.clone()));
                    }
                }
                _ => {}
            }
        }

        for (target, key, field) in stale {
            match key {
                Some(key) => self.cache.unload(&self.schema, &target, &key, &field)?,
                None => self.cache.unload_all(&self.schema, &target, &field)?,
            }
        }
        Ok(())
    }

    /// Saves a typed model and returns it with generated keys filled in.
    pub fn save_model<T: Model>(&mut self, model: &T) -> Result<T> {
        let mut entity = model.to_entity();
        self.save(&mut entity)?;
        Ok(T::from_entity(&entity)?)
    }

    /// Replaces materialized rows with their cached instances, registering
    /// the ones not seen yet.
    fn identity(&mut self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        let mut resolved = Vec::with_capacity(entities.len());
        for entity in entities {
            let key = entity.key(self.table(entity.type_name())?.primary_key());
            let cached = key
                .as_ref()
                .and_then(|key| self.cache.get(entity.type_name(), key))
                .cloned();
            match cached {
                Some(cached) => resolved.push(cached),
                None => {
                    if key.is_some() {
                        self.cache.save(&self.schema, &entity)?;
                    }
                    resolved.push(entity);
                }
            }
        }
        Ok(resolved)
    }

    /// Every row of `entity`.
    pub fn get_all(&mut self, entity: &str) -> Result<Vec<Entity>> {
        self.prepare(entity)?;
        let statement = self.commands().get_all(entity)?;
        let rows = self.query_rows(&statement)?;
        let entities = Materializer::new(&self.schema).entities(entity, &rows)?;
        self.identity(entities)
    }

    /// Every row of `T`'s entity type, converted to `T`.
    pub fn get_all_models<T: Model>(&mut self) -> Result<Vec<T>> {
        self.get_all(&T::entity_name())?
            .iter()
            .map(|entity| T::from_entity(entity).map_err(SqliteError::from))
            .collect()
    }

    /// The row of `entity` with primary key `key`.
    ///
    /// Served from the identity map when the row is cached.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteError::EntityNotFound`] when no row has that key.
    pub fn get_by_id(&mut self, entity: &str, key: impl Into<EntityKey>) -> Result<Entity> {
        let key = key.into();
        if let Some(cached) = self.cache.get(entity, &key) {
            debug!(entity, key = %key, "identity map hit");
            return Ok(cached.clone());
        }
        self.prepare(entity)?;
        let statement = self.commands().get_by_id(entity, &key)?;
        let rows = self.query_rows(&statement)?;
        let found = Materializer::new(&self.schema).first(entity, &rows)?;
        let not_found = || SqliteError::EntityNotFound {
            entity: entity.to_string(),
            key: key.clone(),
        };
        let found = found.ok_or_else(not_found)?;
        self.identity(vec![found])?.pop().ok_or_else(not_found)
    }

    pub fn get_model_by_id<T: Model>(&mut self, key: impl Into<EntityKey>) -> Result<T> {
        let entity = self.get_by_id(&T::entity_name(), key)?;
        Ok(T::from_entity(&entity)?)
    }

    /// Starts a query over `entity`.
    pub fn query(&self, entity: &str) -> Query {
        Query::source(entity)
    }

    fn run_query(&mut self, query: &Query) -> Result<RowSet> {
        self.prepare(query.root())?;
        let translation = QueryTranslator::new(&self.dialect, &self.schema).translate(query.expr())?;
        let parameters: Vec<Parameter> = translation
            .named_parameters(&self.dialect)
            .into_iter()
            .map(|(name, value)| Parameter { name, value })
            .collect();
        self.driver.execute_query(&translation.sql, &parameters)
    }

    fn expect_entities(query: &Query) -> Result<()> {
        match query.shape() {
            QueryShape::Entities | QueryShape::First => Ok(()),
            shape => Err(OrmError::ObjectMappingError(format!(
                "query over {} produces {shape:?}, not entities",
                query.root()
            ))
            .into()),
        }
    }

    /// Runs an entity-producing query.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] for projections and
    /// aggregates, and any translation error.
    pub fn fetch(&mut self, query: &Query) -> Result<Vec<Entity>> {
        Self::expect_entities(query)?;
        let rows = self.run_query(query)?;
        let entities = Materializer::new(&self.schema).entities(query.root(), &rows)?;
        self.identity(entities)
    }

    /// First entity produced by `query`, if any.
    pub fn fetch_first(&mut self, query: &Query) -> Result<Option<Entity>> {
        Self::expect_entities(query)?;
        let rows = self.run_query(query)?;
        let first = Materializer::new(&self.schema).first(query.root(), &rows)?;
        Ok(self.identity(first.into_iter().collect())?.into_iter().next())
    }

    /// Single value produced by an aggregate query.
    pub fn fetch_scalar<T: FromValue>(&mut self, query: &Query) -> Result<T> {
        let rows = self.run_query(query)?;
        Materializer::new(&self.schema).scalar_as(&rows)
    }

    /// First column of every row produced by a projection.
    pub fn fetch_values(&mut self, query: &Query) -> Result<Vec<Value>> {
        let rows = self.run_query(query)?;
        Materializer::new(&self.schema).values(&rows)
    }

    /// Loads navigation `field` of `entity` unless it is already loaded.
    ///
    /// A relationship loaded before for the same owner row is served from
    /// the cache without a query.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] when `field` is not a
    /// navigation field with a resolvable relationship, or when the owner
    /// has no primary key yet.
    pub fn load<'e>(&mut self, entity: &'e mut Entity, field: &str) -> Result<&'e Related> {
        let deferred = match entity.navigation(field) {
            Some(Navigation::Loaded(_)) => None,
            Some(Navigation::Unloaded(deferred)) => Some(deferred.clone()),
            None => Some(self.deferred_for(entity, field)?),
        };
        if let Some(deferred) = deferred {
            // Loading is not a modification: a clean snapshot stays clean.
            let clean = !self.has_changed(entity);
            let related = self.load_deferred(&deferred)?;
            entity.set_navigation(field, Navigation::Loaded(related));
            if clean {
                self.cache.save(&self.schema, entity)?;
            }
        }
        entity
            .navigation(field)
            .and_then(Navigation::loaded)
            .ok_or_else(|| {
                OrmError::ObjectMappingError(format!(
                    "{}.{field} could not be loaded",
                    entity.type_name()
                ))
                .into()
            })
    }

    /// Loads a navigation value in place.
    pub fn resolve<'n>(&mut self, navigation: &'n mut Navigation) -> Result<&'n Related> {
        if let Navigation::Unloaded(deferred) = navigation {
            let related = self.load_deferred(deferred)?;
            *navigation = Navigation::Loaded(related);
        }
        navigation.loaded().ok_or_else(|| {
            OrmError::ObjectMappingError("navigation stayed unloaded".to_string()).into()
        })
    }

    fn deferred_for(&mut self, entity: &Entity, field: &str) -> Result<Deferred> {
        self.prepare(entity.type_name())?;
        let table = self.table(entity.type_name())?;
        let navigation = table.navigation(field).ok_or_else(|| {
            OrmError::ObjectMappingError(format!(
                "{} has no navigation field '{field}'",
                entity.type_name()
            ))
        })?;
        let kind = table.relationship_kind_for_field(field).ok_or_else(|| {
            OrmError::ObjectMappingError(format!(
                "{}.{field} has no resolvable relationship kind",
                entity.type_name()
            ))
        })?;
        let owner_key = entity.key(table.primary_key()).ok_or_else(|| {
            OrmError::ObjectMappingError(format!(
                "{} must be saved before loading '{field}'",
                entity.type_name()
            ))
        })?;
        Ok(Deferred {
            owner: table.name().to_string(),
            field: field.to_string(),
            target: navigation.target.clone(),
            kind,
            owner_key,
        })
    }

    fn load_deferred(&mut self, deferred: &Deferred) -> Result<Related> {
        if let Some(hit) = self
            .cache
            .get_related(&deferred.owner, &deferred.owner_key, &deferred.field)
        {
            return Ok(hit.clone());
        }

        self.prepare(&deferred.owner)?;
        let statement =
            self.commands()
                .load(&deferred.owner, &deferred.field, &deferred.owner_key)?;
        let rows = self.query_rows(&statement)?;
        let loaded = Materializer::new(&self.schema).entities(&deferred.target, &rows)?;
        let loaded = self.identity(loaded)?;
        let related = match deferred.kind {
            RelationshipKind::OneToMany | RelationshipKind::ManyToMany => Related::Many(loaded),
            RelationshipKind::ManyToOne | RelationshipKind::OneToOne => {
                Related::One(loaded.into_iter().next().map(Box::new))
            }
        };
        debug!(
            owner = %deferred.owner,
            field = %deferred.field,
            kind = %deferred.kind,
            "loaded relationship"
        );
        self.cache.put_related(
            &deferred.owner,
            deferred.owner_key.clone(),
            &deferred.field,
            related.clone(),
        );
        Ok(related)
    }

    /// Returns `true` if `entity` differs from its cached snapshot, or is
    /// not cached at all.
    pub fn has_changed(&self, entity: &Entity) -> bool {
        self.cache.has_changed(&self.schema, entity)
    }

    /// Deletes the row of `entity` and evicts it from the cache.
    ///
    /// Returns `false` when no row was deleted.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] if `entity` has no key.
    pub fn remove(&mut self, entity: &Entity) -> Result<bool> {
        self.prepare(entity.type_name())?;
        let table = self.table(entity.type_name())?;
        let key = entity.key(table.primary_key()).ok_or_else(|| {
            OrmError::ObjectMappingError(format!(
                "cannot remove {} without a primary key",
                entity.type_name()
            ))
        })?;
        let statement = self.commands().delete(entity.type_name(), &key)?;
        let outcome = self
            .driver
            .execute_command(&statement.sql, &statement.parameters)?;
        self.unload_reverse_sides(entity, true)?;
        self.cache.remove(entity.type_name(), &key);
        let removed = matches!(outcome, CommandOutcome::RowsAffected(n) if n > 0);
        debug!(entity = entity.type_name(), key = %key, removed, "removed entity");
        Ok(removed)
    }
}
