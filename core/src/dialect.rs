//! Seam between the mapping core and a concrete SQL flavour.

use crate::error::Result;
use crate::value::DataType;

/// Dialect-specific spelling of types, identifiers and placeholders.
///
/// Only [`map_type`](Dialect::map_type) is mandatory; the remaining methods
/// default to ANSI-style quoting and `@pN` named placeholders.
pub trait Dialect {
    /// Type token for a semantic column type.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::UnknownType`](crate::OrmError::UnknownType) for
    /// types the dialect has no mapping for.
    fn map_type(&self, data_type: &DataType) -> Result<String>;

    /// Quotes an identifier, doubling embedded quote characters.
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Placeholder token for the parameter at `index`.
    fn placeholder(&self, index: usize) -> String {
        format!("@p{index}")
    }

    /// Parameter name as bound by the driver, matching
    /// [`placeholder`](Dialect::placeholder).
    fn parameter_name(&self, index: usize) -> String {
        self.placeholder(index)
    }

    /// Inline literal for a boolean constant.
    fn boolean_literal(&self, value: bool) -> &'static str {
        if value { "TRUE" } else { "FALSE" }
    }
}

/// Dialect with the default spellings and a fixed ANSI type table.
///
/// Useful for translating queries without a database at hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsiDialect;

impl Dialect for AnsiDialect {
    fn map_type(&self, data_type: &DataType) -> Result<String> {
        let token = match data_type {
            DataType::Text {
                max_length: Some(max),
                ..
            } => format!("VARCHAR({max})"),
            DataType::Text { .. } => "TEXT".to_string(),
            DataType::Integer => "INTEGER".to_string(),
            DataType::BigInt => "BIGINT".to_string(),
            DataType::Float => "DOUBLE PRECISION".to_string(),
            DataType::Boolean => "BOOLEAN".to_string(),
            DataType::Timestamp => "TIMESTAMP".to_string(),
            DataType::Blob => "BLOB".to_string(),
            DataType::Custom(tag) => {
                return Err(crate::OrmError::UnknownType(format!(
                    "no ANSI mapping for custom type '{tag}'"
                )));
            }
        };
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OrmError;

    #[test]
    fn test_quote_identifier_doubles_quotes() {
        assert_eq!(AnsiDialect.quote_identifier("Book"), "\"Book\"");
        assert_eq!(AnsiDialect.quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_placeholder_format() {
        assert_eq!(AnsiDialect.placeholder(3), "@p3");
    }

    #[test]
    fn test_custom_type_is_unknown() {
        assert!(matches!(
            AnsiDialect.map_type(&DataType::Custom("money".into())),
            Err(OrmError::UnknownType(_))
        ));
        assert_eq!(
            AnsiDialect
                .map_type(&DataType::Text {
                    max_length: Some(12),
                    min_length: None
                })
                .unwrap(),
            "VARCHAR(12)"
        );
    }
}
