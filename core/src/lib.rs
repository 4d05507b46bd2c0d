//! Mapping core for the relata object-relational mapper.
//!
//! This crate holds everything that does not need a database connection:
//!
//! - [`EntityDescriptor`] / [`EntityRegistry`] — explicit descriptions of
//!   entity types: column fields with constraint markers and navigation
//!   fields to other entities.
//! - [`SchemaModel`] — infers [`Table`]s, foreign keys, relationship kinds
//!   and junction tables from the registry.
//! - [`Entity`] / [`Navigation`] — dynamic entity instances whose
//!   relationship fields are either loaded or deferred.
//! - [`EntityCache`] — identity map with SHA-256 content hashes for change
//!   detection.
//! - [`query`] — the query expression graph, its fluent builder and the
//!   [`QueryTranslator`](query::QueryTranslator).
//! - [`Dialect`] — the seam a concrete SQL flavour plugs into.
//!
//! # Example
//!
//! ```
//! use relata_core::*;
//! use relata_core::query::{Query, QueryTranslator, col};
//!
//! let mut registry = EntityRegistry::new();
//! registry.register(
//!     EntityDescriptor::new("Book")
//!         .with_field(FieldDescriptor::column("BookId", ScalarType::Int32).primary_key())
//!         .with_field(FieldDescriptor::column("Price", ScalarType::Float64))
//!         .with_field(FieldDescriptor::column("Likes", ScalarType::Int32)),
//! );
//!
//! let mut schema = SchemaModel::new(registry);
//! assert_eq!(schema.table_for("Book").unwrap().primary_key(), "BookId");
//!
//! let query = Query::source("Book").filter(col("Price").gt(0)).order_by(col("Likes"));
//! let translation = QueryTranslator::new(&AnsiDialect, &schema)
//!     .translate(query.expr())
//!     .unwrap();
//! assert!(translation.sql.ends_with(r#"ORDER BY "Likes" ASC"#));
//! assert_eq!(translation.parameters, vec![Value::Integer(0)]);
//! ```

mod cache;
mod descriptor;
mod dialect;
mod entity;
mod error;
pub mod query;
mod schema;
mod value;

pub use cache::{CacheEntry, ContentHash, EntityCache, RelationKey};
pub use descriptor::{
    Constraints, EntityDescriptor, EntityRegistry, FieldDescriptor, FieldKind, Model, ScalarType,
};
pub use dialect::{AnsiDialect, Dialect};
pub use entity::{Deferred, Entity, EntityPath, Navigation, PathSegment, Related};
pub use error::{OrmError, Result};
pub use schema::{
    Column, ForeignKey, JUNCTION_KEY, JunctionSides, NavigationField, Relationship,
    RelationshipKind, SchemaModel, Table, TableKind, foreign_key_column, junction_name,
};
pub use value::{DataType, EntityKey, FromValue, Value};
