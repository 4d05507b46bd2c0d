//! Column definitions.

use serde::Serialize;

use crate::descriptor::{FieldDescriptor, FieldKind};
use crate::error::{OrmError, Result};
use crate::value::DataType;

/// One column of a table. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    name: String,
    data_type: DataType,
    is_primary_key: bool,
    is_unique: bool,
    is_nullable: bool,
    is_foreign_key: bool,
    is_mapped: bool,
}

impl Column {
    /// Builds a column from a scalar field and its constraint markers.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::InvalidAttributeUsage`] when a length constraint
    /// is placed on a type without a length dimension, or when the bounds
    /// contradict each other. Returns [`OrmError::InvalidEntitySchema`] if
    /// `field` is a navigation field.
    pub fn from_field(entity: &str, field: &FieldDescriptor) -> Result<Self> {
        let FieldKind::Scalar(scalar) = &field.kind else {
            return Err(OrmError::schema(format!(
                "{entity}.{} is a navigation field, not a column",
                field.name
            )));
        };
        let constraints = &field.constraints;

        let has_length_bound = constraints.max_length.is_some() || constraints.min_length.is_some();
        if has_length_bound && !scalar.has_length() {
            return Err(OrmError::InvalidAttributeUsage(format!(
                "length constraint on {entity}.{} which has no length dimension ({scalar:?})",
                field.name
            )));
        }
        if let (Some(min), Some(max)) = (constraints.min_length, constraints.max_length) {
            if min > max {
                return Err(OrmError::InvalidAttributeUsage(format!(
                    "{entity}.{}: min_length {min} exceeds max_length {max}",
                    field.name
                )));
            }
        }

        Ok(Self {
            name: field.name.clone(),
            data_type: scalar.data_type(constraints),
            is_primary_key: constraints.primary_key,
            is_unique: constraints.unique,
            is_nullable: !(constraints.not_null || constraints.primary_key),
            is_foreign_key: false,
            is_mapped: !constraints.not_mapped,
        })
    }

    /// Builds a synthesized foreign-key column.
    pub fn foreign_key(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            is_primary_key: false,
            is_unique: false,
            is_nullable: nullable,
            is_foreign_key: true,
            is_mapped: true,
        }
    }

    /// Builds a surrogate integer primary key (used by junction tables).
    pub fn surrogate_key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: DataType::BigInt,
            is_primary_key: true,
            is_unique: false,
            is_nullable: false,
            is_foreign_key: false,
            is_mapped: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn is_primary_key(&self) -> bool {
        self.is_primary_key
    }

    pub fn is_unique(&self) -> bool {
        self.is_unique
    }

    pub fn is_nullable(&self) -> bool {
        self.is_nullable
    }

    pub fn is_foreign_key(&self) -> bool {
        self.is_foreign_key
    }

    /// `false` excludes the column from generated SQL.
    pub fn is_mapped(&self) -> bool {
        self.is_mapped
    }
}
