//! Relational schema inferred from entity descriptors.
//!
//! The [`SchemaModel`] is the single owner of every [`Table`]; the cache,
//! translator and command builder only look tables up.

mod column;
mod model;
mod table;

pub use column::Column;
pub use model::{JUNCTION_KEY, SchemaModel, foreign_key_column, junction_name};
pub use table::{
    ForeignKey, JunctionSides, NavigationField, Relationship, RelationshipKind, Table, TableKind,
};
