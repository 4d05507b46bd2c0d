//! Explicit entity descriptors.
//!
//! An [`EntityDescriptor`] states what a data class looks like: its column
//! fields with their constraint markers, and its navigation fields. The
//! schema model infers tables and relationships from these descriptors, so
//! nothing is discovered by inspecting types at runtime.
//!
//! Descriptors can be built in code or deserialized from YAML/JSON:
//!
//! ```
//! use relata_core::{EntityDescriptor, FieldDescriptor, ScalarType};
//!
//! let book = EntityDescriptor::new("Book")
//!     .with_field(FieldDescriptor::column("BookId", ScalarType::Int32).primary_key())
//!     .with_field(FieldDescriptor::column("Title", ScalarType::String).not_null().max_length(200))
//!     .with_field(FieldDescriptor::reference("Author", "Author"));
//!
//! assert_eq!(book.column_fields().count(), 2);
//! assert_eq!(book.navigation_fields().count(), 1);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{OrmError, Result};
use crate::value::DataType;

/// Declared type of a column field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Int32,
    Int64,
    Float64,
    Bool,
    String,
    Timestamp,
    Bytes,
    /// Application type with a dialect-registered mapping.
    Custom(String),
}

impl ScalarType {
    /// Parses the name of a built-in scalar type.
    ///
    /// Accepts both the descriptor spelling (`int32`) and the Rust spelling
    /// (`i32`). Returns `None` for anything that is not a scalar.
    pub fn from_name(name: &str) -> Option<Self> {
        let scalar = match name.to_ascii_lowercase().as_str() {
            "int32" | "i32" | "int" => ScalarType::Int32,
            "int64" | "i64" | "long" => ScalarType::Int64,
            "float64" | "f64" | "f32" | "double" | "float" => ScalarType::Float64,
            "bool" | "boolean" => ScalarType::Bool,
            "string" | "str" | "text" => ScalarType::String,
            "timestamp" | "datetime" | "naivedatetime" => ScalarType::Timestamp,
            "bytes" | "vec<u8>" | "blob" => ScalarType::Bytes,
            _ => return None,
        };
        Some(scalar)
    }

    /// Returns `true` if a length constraint is meaningful for this type.
    pub fn has_length(&self) -> bool {
        matches!(self, ScalarType::String | ScalarType::Bytes)
    }

    /// Semantic column type for this declared type under `constraints`.
    pub fn data_type(&self, constraints: &Constraints) -> DataType {
        match self {
            ScalarType::Int32 => DataType::Integer,
            ScalarType::Int64 => DataType::BigInt,
            ScalarType::Float64 => DataType::Float,
            ScalarType::Bool => DataType::Boolean,
            ScalarType::String => DataType::Text {
                max_length: constraints.max_length,
                min_length: constraints.min_length,
            },
            ScalarType::Timestamp => DataType::Timestamp,
            ScalarType::Bytes => DataType::Blob,
            ScalarType::Custom(tag) => DataType::Custom(tag.clone()),
        }
    }
}

/// Constraint markers attached to a field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    pub primary_key: bool,
    pub unique: bool,
    pub not_null: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    /// Excludes the field from generated SQL.
    pub not_mapped: bool,
}

/// What a field holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// A database-primitive value.
    #[serde(rename = "type")]
    Scalar(ScalarType),
    /// A single reference to another entity.
    Reference(String),
    /// A homogeneous collection of another entity.
    Collection(String),
}

/// One exposed field of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(flatten)]
    pub constraints: Constraints,
}

impl FieldDescriptor {
    /// Creates a column field of the given scalar type.
    pub fn column(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Scalar(scalar),
            constraints: Constraints::default(),
        }
    }

    /// Creates a single-valued navigation field to `target`.
    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Reference(target.into()),
            constraints: Constraints::default(),
        }
    }

    /// Creates a collection navigation field of `target` entities.
    pub fn collection(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Collection(target.into()),
            constraints: Constraints::default(),
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.constraints.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.constraints.unique = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.constraints.not_null = true;
        self
    }

    pub fn max_length(mut self, length: usize) -> Self {
        self.constraints.max_length = Some(length);
        self
    }

    pub fn min_length(mut self, length: usize) -> Self {
        self.constraints.min_length = Some(length);
        self
    }

    pub fn not_mapped(mut self) -> Self {
        self.constraints.not_mapped = true;
        self
    }

    /// Target entity name for navigation fields.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Reference(target) | FieldKind::Collection(target) => Some(target),
            FieldKind::Scalar(_) => None,
        }
    }

    /// Returns `true` for collection navigation fields.
    pub fn is_collection(&self) -> bool {
        matches!(self.kind, FieldKind::Collection(_))
    }
}

/// The declared shape of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Adds a field (builder pattern).
    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Looks up a field by exact name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields holding database-primitive values.
    pub fn column_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields
            .iter()
            .filter(|f| matches!(f.kind, FieldKind::Scalar(_)))
    }

    /// Fields referencing other entities.
    pub fn navigation_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.target().is_some())
    }
}

/// Named collection of entity descriptors.
///
/// Deserializes from a document of the form `entities: [...]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistry {
    #[serde(default, with = "descriptor_list")]
    entities: BTreeMap<String, EntityDescriptor>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor, replacing any previous one with the same name.
    pub fn register(&mut self, descriptor: EntityDescriptor) {
        self.entities.insert(descriptor.name.clone(), descriptor);
    }

    /// Registers the descriptor of a typed model.
    pub fn register_model<T: Model>(&mut self) {
        self.register(T::descriptor());
    }

    pub fn get(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Registered entity names in lexical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Parses a registry from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::InvalidEntitySchema`] if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| OrmError::schema(format!("malformed entity registry: {e}")))
    }
}

/// Serializes the registry map as a plain list of descriptors.
mod descriptor_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::EntityDescriptor;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, EntityDescriptor>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<&EntityDescriptor> = map.values().collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, EntityDescriptor>, D::Error> {
        let list = Vec::<EntityDescriptor>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|d| (d.name.clone(), d)).collect())
    }
}

/// A typed data class that maps onto an entity.
///
/// Implementors describe themselves once and convert to and from the
/// dynamic [`Entity`] the mapper works with. Navigation fields are usually
/// kept as [`Navigation`](crate::Navigation) values so that deferred
/// relationships survive the round trip.
pub trait Model: Sized {
    /// Schema descriptor for this type.
    fn descriptor() -> EntityDescriptor;

    /// Converts the value into a dynamic entity.
    fn to_entity(&self) -> Entity;

    /// Builds the value from a dynamic entity.
    ///
    /// # Errors
    ///
    /// Returns [`OrmError::ObjectMappingError`] when a field is missing or
    /// has the wrong type.
    fn from_entity(entity: &Entity) -> Result<Self>;

    /// Entity type name, taken from the descriptor.
    fn entity_name() -> String {
        Self::descriptor().name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_from_name_accepts_rust_spelling() {
        assert_eq!(ScalarType::from_name("i32"), Some(ScalarType::Int32));
        assert_eq!(ScalarType::from_name("String"), Some(ScalarType::String));
        assert_eq!(ScalarType::from_name("Book"), None);
    }

    #[test]
    fn test_string_data_type_carries_lengths() {
        let constraints = Constraints {
            max_length: Some(40),
            min_length: Some(2),
            ..Constraints::default()
        };
        assert_eq!(
            ScalarType::String.data_type(&constraints),
            DataType::Text {
                max_length: Some(40),
                min_length: Some(2)
            }
        );
    }

    #[test]
    fn test_registry_from_yaml() {
        let yaml = r#"
entities:
  - name: Author
    fields:
      - name: AuthorId
        type: int32
        primary_key: true
      - name: Name
        type: string
        not_null: true
        max_length: 80
      - name: Books
        collection: Book
  - name: Book
    fields:
      - name: BookId
        type: int32
        primary_key: true
      - name: Author
        reference: Author
"#;
        let registry: EntityRegistry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(registry.len(), 2);
        let author = registry.get("Author").unwrap();
        assert_eq!(author.fields.len(), 3);
        assert!(author.fields[0].constraints.primary_key);
        assert_eq!(author.fields[1].constraints.max_length, Some(80));
        assert_eq!(
            author.fields[2].kind,
            FieldKind::Collection("Book".to_string())
        );
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["Author", "Book"]);
    }

    #[test]
    fn test_registry_from_json() {
        let json = r#"{"entities":[{"name":"Tag","fields":[{"name":"TagId","type":"int64","primary_key":true}]}]}"#;
        let registry = EntityRegistry::from_json(json).unwrap();
        let tag = registry.get("Tag").unwrap();
        assert_eq!(tag.fields[0].kind, FieldKind::Scalar(ScalarType::Int64));
    }

    #[test]
    fn test_registry_from_json_rejects_garbage() {
        assert!(matches!(
            EntityRegistry::from_json("{not json"),
            Err(OrmError::InvalidEntitySchema(_))
        ));
    }
}
