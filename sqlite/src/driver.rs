//! SQL execution seam and its rusqlite implementation.
//!
//! The mapping layers only ever see [`Driver`]: a statement goes in with its
//! named parameters, and either a row count / scalar or a fully buffered
//! [`RowSet`] comes out. [`RowCursor`] walks a row set and captures the
//! name-to-ordinal schema once, on the first row.

use std::collections::HashMap;

use relata_core::Value;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ToSql};
use tracing::debug;

use crate::error::Result;

/// Storage format for timestamp values.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// One named statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: Value,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// What a non-query statement produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    RowsAffected(usize),
    /// First column of the first returned row (`RETURNING`, `SELECT`).
    Scalar(Value),
}

impl CommandOutcome {
    /// Scalar value, or `Null` for row counts.
    pub fn into_value(self) -> Value {
        match self {
            CommandOutcome::Scalar(value) => value,
            CommandOutcome::RowsAffected(_) => Value::Null,
        }
    }
}

/// Buffered query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn cursor(&self) -> RowCursor<'_> {
        RowCursor {
            set: self,
            position: 0,
            state: CursorState::Unread,
            ordinals: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Unread,
    Reading,
    Exhausted,
}

/// Forward-only reader over a [`RowSet`].
#[derive(Debug)]
pub struct RowCursor<'a> {
    set: &'a RowSet,
    position: usize,
    state: CursorState,
    ordinals: HashMap<String, usize>,
}

impl<'a> RowCursor<'a> {
    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn column_count(&self) -> usize {
        self.set.columns.len()
    }

    /// Advances to the next row.
    pub fn next_row(&mut self) -> Option<&'a [Value]> {
        if self.state == CursorState::Exhausted {
            return None;
        }
        let Some(row) = self.set.rows.get(self.position) else {
            self.state = CursorState::Exhausted;
            return None;
        };
        if self.state == CursorState::Unread {
            self.ordinals = self
                .set
                .columns
                .iter()
                .enumerate()
                .map(|(i, name)| (name.to_ascii_lowercase(), i))
                .collect();
            self.state = CursorState::Reading;
        }
        self.position += 1;
        Some(row)
    }

    /// Ordinal of `column`, matched case-insensitively. Only available once
    /// a row has been read.
    pub fn ordinal(&self, column: &str) -> Option<usize> {
        self.ordinals.get(&column.to_ascii_lowercase()).copied()
    }
}

/// Executes SQL on one connection.
pub trait Driver {
    /// Runs a statement that does not produce a result set, or whose only
    /// interesting output is a single scalar.
    fn execute_command(&self, sql: &str, parameters: &[Parameter]) -> Result<CommandOutcome>;

    /// Runs a query and buffers every row.
    fn execute_query(&self, sql: &str, parameters: &[Parameter]) -> Result<RowSet>;

    /// Runs parameterless statements separated by semicolons.
    fn execute_script(&self, sql: &str) -> Result<()>;
}

/// [`Driver`] over a rusqlite [`Connection`].
#[derive(Debug)]
pub struct SqliteDriver {
    conn: Connection,
}

impl SqliteDriver {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Opens a private in-memory database with foreign keys enforced.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError`](crate::SqliteError::DatabaseError) if the
    /// connection cannot be opened.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Timestamp(t) => SqlValue::Text(t.format(TIMESTAMP_FORMAT).to_string()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

impl SqliteDriver {
    fn run<T>(
        &self,
        sql: &str,
        parameters: &[Parameter],
        read: impl FnOnce(&mut rusqlite::Statement<'_>, &[(&str, &dyn ToSql)]) -> Result<T>,
    ) -> Result<T> {
        let values: Vec<(&str, SqlValue)> = parameters
            .iter()
            .map(|p| (p.name.as_str(), to_sql_value(&p.value)))
            .collect();
        let bound: Vec<(&str, &dyn ToSql)> = values
            .iter()
            .map(|(name, value)| (*name, value as &dyn ToSql))
            .collect();
        let mut stmt = self.conn.prepare(sql)?;
        read(&mut stmt, &bound)
    }
}

impl Driver for SqliteDriver {
    fn execute_command(&self, sql: &str, parameters: &[Parameter]) -> Result<CommandOutcome> {
        debug!(sql, parameters = parameters.len(), "executing command");
        self.run(sql, parameters, |stmt, bound| {
            if stmt.column_count() == 0 {
                return Ok(CommandOutcome::RowsAffected(stmt.execute(bound)?));
            }
            let mut rows = stmt.query(bound)?;
            let value = match rows.next()? {
                Some(row) => from_value_ref(row.get_ref(0)?),
                None => Value::Null,
            };
            Ok(CommandOutcome::Scalar(value))
        })
    }

    fn execute_query(&self, sql: &str, parameters: &[Parameter]) -> Result<RowSet> {
        debug!(sql, parameters = parameters.len(), "executing query");
        self.run(sql, parameters, |stmt, bound| {
            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let mut set = RowSet {
                columns,
                rows: Vec::new(),
            };
            let mut rows = stmt.query(bound)?;
            while let Some(row) = rows.next()? {
                let values = (0..set.columns.len())
                    .map(|i| row.get_ref(i).map(from_value_ref))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                set.rows.push(values);
            }
            Ok(set)
        })
    }

    fn execute_script(&self, sql: &str) -> Result<()> {
        debug!(sql, "executing script");
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}
