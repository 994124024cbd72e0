//! Document model: schemas, document types, documents and updates.
//!
//! The model is deliberately small. Fields hold strings, integers or
//! tensors; tensor fields carry a type spec such as `tensor(x{},y{})`
//! that must match the schema's spec exactly for an update to apply.
//! Everything derives serde so the transaction log can store operations
//! as self-describing payloads.

use crate::error::CoreError;
use crate::types::{DocTypeName, DocumentId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Tensor types
// ============================================================================

/// A tensor type spec, e.g. `tensor(x{},y{})`.
///
/// Equality is over the normalized spec (whitespace stripped); the spec is
/// otherwise treated as opaque by the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType(String);

impl TensorType {
    /// Normalize and wrap a tensor type spec.
    pub fn from_spec(spec: &str) -> Self {
        TensorType(spec.chars().filter(|c| !c.is_whitespace()).collect())
    }

    /// The normalized spec string.
    pub fn spec(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tensor value: its type plus sparse cells addressed by label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    /// The value's tensor type.
    pub tensor_type: TensorType,
    /// Cells as (address label, value) pairs.
    pub cells: Vec<(String, f64)>,
}

// ============================================================================
// Field kinds and schema
// ============================================================================

/// What a schema field holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Full-text indexed string field.
    IndexString,
    /// Attribute string field (kept in memory, posting-list backed).
    AttributeString,
    /// Attribute integer field.
    AttributeInt,
    /// Tensor field with a fixed tensor type.
    Tensor(TensorType),
}

/// The indexed/attribute field set for a document type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: BTreeMap<String, FieldKind>,
}

impl Schema {
    /// An empty schema.
    pub fn new() -> Self {
        Schema::default()
    }

    /// Add a field, replacing any previous definition.
    pub fn add_field(&mut self, name: impl Into<String>, kind: FieldKind) -> &mut Self {
        self.fields.insert(name.into(), kind);
        self
    }

    /// Look up a field's kind.
    pub fn field(&self, name: &str) -> Option<&FieldKind> {
        self.fields.get(name)
    }

    /// Iterate fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldKind)> {
        self.fields.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no fields are defined.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields present in `self` but missing from `newer`.
    pub fn fields_removed_in(&self, newer: &Schema) -> Vec<String> {
        self.fields
            .keys()
            .filter(|name| !newer.fields.contains_key(*name))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Document types and repo
// ============================================================================

/// A named document type with its field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentType {
    name: String,
    schema: Schema,
}

impl DocumentType {
    /// Construct a document type over a schema.
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        DocumentType {
            name: name.into(),
            schema,
        }
    }

    /// The type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type's field set.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Look up a field's kind.
    pub fn field(&self, name: &str) -> Option<&FieldKind> {
        self.schema.field(name)
    }
}

/// Registry of document types, shared by reference.
///
/// Two repos may define the same type name with different field sets;
/// updates created against one repo must be re-checked against the active
/// repo before they are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentTypeRepo {
    types: BTreeMap<String, Arc<DocumentType>>,
}

impl DocumentTypeRepo {
    /// An empty repo.
    pub fn new() -> Self {
        DocumentTypeRepo::default()
    }

    /// Register a document type.
    pub fn add(&mut self, doc_type: DocumentType) -> &mut Self {
        self.types
            .insert(doc_type.name().to_string(), Arc::new(doc_type));
        self
    }

    /// Look up a type by name.
    pub fn document_type(&self, name: &str) -> Option<&Arc<DocumentType>> {
        self.types.get(name)
    }

    /// Look up a type, erroring on absence.
    pub fn require(&self, name: &DocTypeName) -> Result<&Arc<DocumentType>, CoreError> {
        self.types
            .get(name.name())
            .ok_or_else(|| CoreError::UnknownDocumentType {
                name: name.name().to_string(),
            })
    }
}

// ============================================================================
// Documents
// ============================================================================

/// A field's value inside a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// String value.
    Str(String),
    /// Integer value.
    Int(i64),
    /// Tensor value with its own type.
    Tensor(TensorValue),
}

impl FieldValue {
    /// The tensor type if this is a tensor value.
    pub fn tensor_type(&self) -> Option<&TensorType> {
        match self {
            FieldValue::Tensor(t) => Some(&t.tensor_type),
            _ => None,
        }
    }
}

/// A concrete document: id, type name, field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    doc_type: String,
    fields: BTreeMap<String, FieldValue>,
}

impl Document {
    /// An empty document of the given type.
    pub fn new(id: DocumentId, doc_type: impl Into<String>) -> Self {
        Document {
            id,
            doc_type: doc_type.into(),
            fields: BTreeMap::new(),
        }
    }

    /// The document id.
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// The document type name.
    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    /// Set a field value.
    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) -> &mut Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Read a field value.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Iterate field values in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }
}

// ============================================================================
// Updates
// ============================================================================

/// A single field assignment within an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    /// The field to assign.
    pub field: String,
    /// The new value.
    pub value: FieldValue,
}

/// A partial update of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    id: DocumentId,
    doc_type: String,
    field_updates: Vec<FieldUpdate>,
    create_if_non_existent: bool,
}

impl DocumentUpdate {
    /// An empty update for a document.
    pub fn new(id: DocumentId, doc_type: impl Into<String>) -> Self {
        DocumentUpdate {
            id,
            doc_type: doc_type.into(),
            field_updates: Vec::new(),
            create_if_non_existent: false,
        }
    }

    /// The target document id.
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// The document type name the update was created against.
    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    /// Add a field assignment.
    pub fn add_field_update(&mut self, field: impl Into<String>, value: FieldValue) -> &mut Self {
        self.field_updates.push(FieldUpdate {
            field: field.into(),
            value,
        });
        self
    }

    /// The field assignments in submission order.
    pub fn field_updates(&self) -> &[FieldUpdate] {
        &self.field_updates
    }

    /// Whether a missing target document should be created.
    pub fn create_if_non_existent(&self) -> bool {
        self.create_if_non_existent
    }

    /// Set the create-if-non-existent flag.
    pub fn set_create_if_non_existent(&mut self, create: bool) -> &mut Self {
        self.create_if_non_existent = create;
        self
    }

    /// Apply the assignments to a document in order.
    pub fn apply_to(&self, doc: &mut Document) {
        for fu in &self.field_updates {
            doc.set_field(fu.field.clone(), fu.value.clone());
        }
    }
}
