//! SQLite type mapping and spelling.

use std::collections::BTreeMap;

use relata_core::{DataType, Dialect, OrmError};

/// SQLite flavour of [`Dialect`].
///
/// Built-in semantic types map onto SQLite's storage classes; custom tags
/// must be registered with [`register`](SqliteDialect::register) (or the
/// `custom_types` section of the context configuration).
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect {
    custom: BTreeMap<String, String>,
}

impl SqliteDialect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dialect with the given custom type mappings.
    pub fn with_custom_types(custom: BTreeMap<String, String>) -> Self {
        Self { custom }
    }

    /// Maps the custom semantic tag `tag` onto `token`.
    pub fn register(&mut self, tag: impl Into<String>, token: impl Into<String>) {
        self.custom.insert(tag.into(), token.into());
    }
}

impl Dialect for SqliteDialect {
    fn map_type(&self, data_type: &DataType) -> relata_core::Result<String> {
        let token = match data_type {
            DataType::Text {
                max_length: Some(max),
                ..
            } => format!("VARCHAR({max})"),
            DataType::Text { .. } => "TEXT".to_string(),
            DataType::Integer | DataType::BigInt | DataType::Boolean => "INTEGER".to_string(),
            DataType::Float => "REAL".to_string(),
            DataType::Timestamp => "TEXT".to_string(),
            DataType::Blob => "BLOB".to_string(),
            DataType::Custom(tag) => self.custom.get(tag).cloned().ok_or_else(|| {
                OrmError::UnknownType(format!("no SQLite type registered for '{tag}'"))
            })?,
        };
        Ok(token)
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value { "1" } else { "0" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types() {
        let dialect = SqliteDialect::new();
        assert_eq!(dialect.map_type(&DataType::Integer).unwrap(), "INTEGER");
        assert_eq!(dialect.map_type(&DataType::Boolean).unwrap(), "INTEGER");
        assert_eq!(dialect.map_type(&DataType::Float).unwrap(), "REAL");
        assert_eq!(
            dialect
                .map_type(&DataType::Text {
                    max_length: Some(80),
                    min_length: Some(2)
                })
                .unwrap(),
            "VARCHAR(80)"
        );
    }

    #[test]
    fn test_custom_types_need_registration() {
        let mut dialect = SqliteDialect::new();
        let money = DataType::Custom("money".into());
        assert!(matches!(
            dialect.map_type(&money),
            Err(OrmError::UnknownType(msg)) if msg.contains("money")
        ));
        dialect.register("money", "NUMERIC");
        assert_eq!(dialect.map_type(&money).unwrap(), "NUMERIC");
    }

    #[test]
    fn test_boolean_literals_are_numerals() {
        assert_eq!(SqliteDialect::new().boolean_literal(true), "1");
        assert_eq!(SqliteDialect::new().boolean_literal(false), "0");
    }
}
