//! Row materialization.
//!
//! Turns buffered [`RowSet`]s into [`Entity`] instances shaped by the schema
//! model. Every navigation field of a materialized entity starts out as
//! [`Navigation::Unloaded`], carrying the owner identity the context needs to
//! run the follow-up query when the field is first loaded.

use relata_core::{Deferred, Entity, FromValue, Navigation, OrmError, SchemaModel, Table, Value};

use crate::driver::{RowCursor, RowSet};
use crate::error::Result;

/// Builds entities and scalars from query results.
pub struct Materializer<'a> {
    schema: &'a SchemaModel,
}

impl<'a> Materializer<'a> {
    pub fn new(schema: &'a SchemaModel) -> Self {
        Self { schema }
    }

    fn table(&self, entity: &str) -> Result<&'a Table> {
        self.schema.table(entity).ok_or_else(|| {
            OrmError::InvalidEntitySchema(format!("no table has been built for '{entity}'")).into()
        })
    }

    /// Materializes every row of `rows` as an `entity` instance.
    ///
    /// Mapped columns are matched by case-insensitive name; columns absent
    /// from the result read as `Null`.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] when a value cannot be read
    /// as its column type, when a row has no primary key, or when a
    /// navigation field has no resolvable relationship kind.
    pub fn entities(&self, entity: &str, rows: &RowSet) -> Result<Vec<Entity>> {
        let table = self.table(entity)?;
        let mut cursor = rows.cursor();
        let mut entities = Vec::with_capacity(rows.rows.len());
        while let Some(row) = cursor.next_row() {
            entities.push(self.entity(table, &cursor, row)?);
        }
        Ok(entities)
    }

    /// Materializes the first row, if any.
    pub fn first(&self, entity: &str, rows: &RowSet) -> Result<Option<Entity>> {
        let table = self.table(entity)?;
        let mut cursor = rows.cursor();
        cursor
            .next_row()
            .map(|row| self.entity(table, &cursor, row))
            .transpose()
    }

    fn entity(&self, table: &Table, cursor: &RowCursor<'_>, row: &[Value]) -> Result<Entity> {
        let mut entity = Entity::new(table.name());
        for column in table.mapped_columns() {
            let value = match cursor.ordinal(column.name()).and_then(|i| row.get(i)) {
                Some(value) => value.clone().coerce(column.data_type())?,
                None => Value::Null,
            };
            entity.set(column.name(), value);
        }

        let owner_key = entity.key(table.primary_key());
        for navigation in table.navigations() {
            let kind = table
                .relationship_kind_for_field(&navigation.name)
                .ok_or_else(|| {
                    OrmError::ObjectMappingError(format!(
                        "{}.{} has no resolvable relationship kind",
                        table.name(),
                        navigation.name
                    ))
                })?;
            let owner_key = owner_key.clone().ok_or_else(|| {
                OrmError::ObjectMappingError(format!(
                    "{} row has no value for primary key {}",
                    table.name(),
                    table.primary_key()
                ))
            })?;
            entity.set_navigation(
                navigation.name.clone(),
                Navigation::Unloaded(Deferred {
                    owner: table.name().to_string(),
                    field: navigation.name.clone(),
                    target: navigation.target.clone(),
                    kind,
                    owner_key,
                }),
            );
        }
        Ok(entity)
    }

    /// First column of the first row, or `Null` when there are no rows.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] when the result has no
    /// columns.
    pub fn scalar(&self, rows: &RowSet) -> Result<Value> {
        let mut cursor = rows.cursor();
        if cursor.column_count() == 0 {
            return Err(OrmError::ObjectMappingError(
                "result set has no columns to read a value from".to_string(),
            )
            .into());
        }
        Ok(cursor
            .next_row()
            .and_then(|row| row.first())
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Typed reading of [`scalar`](Self::scalar).
    pub fn scalar_as<T: FromValue>(&self, rows: &RowSet) -> Result<T> {
        Ok(T::from_value(&self.scalar(rows)?)?)
    }

    /// First column of every row.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] when the result has no
    /// columns.
    pub fn values(&self, rows: &RowSet) -> Result<Vec<Value>> {
        let mut cursor = rows.cursor();
        if cursor.column_count() == 0 {
            return Err(OrmError::ObjectMappingError(
                "result set has no columns to read values from".to_string(),
            )
            .into());
        }
        let mut values = Vec::with_capacity(rows.rows.len());
        while let Some(row) = cursor.next_row() {
            values.push(row.first().cloned().unwrap_or(Value::Null));
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relata_core::{
        EntityDescriptor, EntityKey, EntityRegistry, FieldDescriptor, RelationshipKind, ScalarType,
    };

    fn schema() -> SchemaModel {
        let mut registry = EntityRegistry::new();
        registry.register(
            EntityDescriptor::new("Author")
                .with_field(FieldDescriptor::column("AuthorId", ScalarType::Int32).primary_key())
                .with_field(FieldDescriptor::column("Name", ScalarType::String))
                .with_field(FieldDescriptor::column("Active", ScalarType::Bool))
                .with_field(FieldDescriptor::collection("Books", "Book")),
        );
        registry.register(
            EntityDescriptor::new("Book")
                .with_field(FieldDescriptor::column("BookId", ScalarType::Int32).primary_key())
                .with_field(FieldDescriptor::reference("Author", "Author")),
        );
        let mut model = SchemaModel::new(registry);
        model.build_all().unwrap();
        model
    }

    fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> RowSet {
        RowSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn test_columns_match_case_insensitively() {
        let schema = schema();
        let set = rows(
            &["authorid", "NAME", "active"],
            vec![vec![Value::Integer(1), "Le Guin".into(), Value::Integer(1)]],
        );
        let authors = Materializer::new(&schema).entities("Author", &set).unwrap();
        assert_eq!(authors.len(), 1);
        assert_eq!(authors[0].get::<String>("Name").unwrap(), "Le Guin");
        assert!(authors[0].get::<bool>("Active").unwrap());
    }

    #[test]
    fn test_absent_columns_are_null() {
        let schema = schema();
        let set = rows(&["AuthorId"], vec![vec![Value::Integer(2)]]);
        let author = Materializer::new(&schema)
            .first("Author", &set)
            .unwrap()
            .unwrap();
        assert_eq!(author.value("Name"), Some(&Value::Null));
    }

    #[test]
    fn test_navigations_start_unloaded() {
        let schema = schema();
        let set = rows(
            &["BookId", "AuthorId"],
            vec![vec![Value::Integer(10), Value::Integer(1)]],
        );
        let book = Materializer::new(&schema)
            .first("Book", &set)
            .unwrap()
            .unwrap();
        let deferred = book.navigation("Author").unwrap().deferred().unwrap();
        assert_eq!(deferred.kind, RelationshipKind::ManyToOne);
        assert_eq!(deferred.owner_key, EntityKey::Integer(10));
        assert_eq!(deferred.target, "Author");
    }

    #[test]
    fn test_scalar_without_columns_fails() {
        let schema = schema();
        let materializer = Materializer::new(&schema);
        assert!(matches!(
            materializer.scalar(&RowSet::default()),
            Err(crate::SqliteError::Orm(OrmError::ObjectMappingError(_)))
        ));
        let empty = rows(&["n"], vec![]);
        assert_eq!(materializer.scalar(&empty).unwrap(), Value::Null);
        let count = rows(&["n"], vec![vec![Value::Integer(3)]]);
        assert_eq!(materializer.scalar_as::<i64>(&count).unwrap(), 3);
    }

    #[test]
    fn test_values_reads_first_column() {
        let schema = schema();
        let set = rows(&["Title"], vec![vec!["A".into()], vec!["B".into()]]);
        assert_eq!(
            Materializer::new(&schema).values(&set).unwrap(),
            vec![Value::from("A"), Value::from("B")]
        );
    }

    #[test]
    fn test_type_mismatch_is_mapping_error() {
        let schema = schema();
        let set = rows(&["AuthorId", "Active"], vec![vec![Value::Integer(1), "yes".into()]]);
        assert!(Materializer::new(&schema).entities("Author", &set).is_err());
    }
}
