//! SQLite backend for the relata object-relational mapper.
//!
//! This crate turns the schema model and query graphs of
//! [`relata_core`] into SQLite statements, runs them through rusqlite, and
//! materializes the results into entities with deferred navigation fields.
//!
//! # Architecture
//!
//! - **`dialect`** — SQLite type tokens, identifier quoting, placeholders
//! - **`command`** — DDL, upsert plans, by-id selects, relationship loads
//! - **`driver`** — the [`Driver`] seam and its rusqlite implementation
//! - **`materialize`** — row sets to entities and scalars
//! - **`context`** — [`DbContext`], the façade tying the above to a cache
//! - **`config`** — YAML-backed [`ContextConfig`]
//!
//! # Quick start
//!
//! ```no_run
//! use relata_core::{Entity, EntityDescriptor, EntityRegistry, FieldDescriptor, ScalarType};
//! use relata_core::query::col;
//! use relata_sqlite::{ContextConfig, DbContext};
//!
//! let mut registry = EntityRegistry::new();
//! registry.register(
//!     EntityDescriptor::new("Author")
//!         .with_field(FieldDescriptor::column("AuthorId", ScalarType::Int32).primary_key())
//!         .with_field(FieldDescriptor::column("Name", ScalarType::String))
//!         .with_field(FieldDescriptor::collection("Books", "Book")),
//! );
//! registry.register(
//!     EntityDescriptor::new("Book")
//!         .with_field(FieldDescriptor::column("BookId", ScalarType::Int32).primary_key())
//!         .with_field(FieldDescriptor::column("Title", ScalarType::String))
//!         .with_field(FieldDescriptor::reference("Author", "Author")),
//! );
//!
//! let mut ctx = DbContext::open(&ContextConfig::default(), registry).unwrap();
//! ctx.ensure_created().unwrap();
//!
//! let mut author = Entity::new("Author")
//!     .with("Name", "Ursula K. Le Guin")
//!     .with_collection("Books", vec![Entity::new("Book").with("Title", "The Dispossessed")]);
//! ctx.save(&mut author).unwrap();
//!
//! let query = ctx.query("Book").filter(col("Title").ne("Dune")).count();
//! let count: i64 = ctx.fetch_scalar(&query).unwrap();
//! assert_eq!(count, 1);
//! ```

mod command;
mod config;
mod context;
mod dialect;
mod driver;
mod error;
mod materialize;

pub use command::{
    BackReference, Binding, CommandBuilder, EnsureCreated, SavePlan, SaveStep, Statement,
    StepKind, StepParameter,
};
pub use config::{ContextConfig, IN_MEMORY};
pub use context::DbContext;
pub use dialect::SqliteDialect;
pub use driver::{
    CommandOutcome, CursorState, Driver, Parameter, RowCursor, RowSet, SqliteDriver,
    TIMESTAMP_FORMAT,
};
pub use error::{Result, SqliteError};
pub use materialize::Materializer;
