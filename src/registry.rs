//! Resolving the searchable fields of an advertisement document.
//!
//! The cache does not understand any document format itself. It asks a
//! [`DocumentRegistry`] for the advertisement type of a document and for the values
//! of the fields that type declares as indexed.

use std::{collections::HashMap, fmt::Debug};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};

/// A `(name, value)` pair taken from a document's declared index fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexField {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: String,
}

impl IndexField {
    /// Create a field.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A document could not be parsed.
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum ParseError {
    #[snafu(display("document is not valid JSON"))]
    InvalidDocument { source: serde_json::Error },
    #[snafu(display("document does not declare an advertisement type"))]
    MissingType {},
}

/// Turns raw document bytes into index fields.
pub trait DocumentRegistry: Debug + Send + Sync + 'static {
    /// The advertisement type a document declares.
    fn advertisement_type(&self, document: &[u8]) -> Result<String, ParseError>;

    /// The index fields of a document of the given type.
    ///
    /// Types without declared index fields yield no fields.
    fn index_fields(&self, adv_type: &str, document: &[u8]) -> Result<Vec<IndexField>, ParseError>;

    /// Resolve the type of a document and then its index fields.
    fn resolve(&self, document: &[u8]) -> Result<Vec<IndexField>, ParseError> {
        let adv_type = self.advertisement_type(document)?;
        self.index_fields(&adv_type, document)
    }
}

/// Registry for JSON object documents.
///
/// The advertisement type is read from the `"type"` member. For every field name
/// registered for that type, string members yield their value, numbers and booleans
/// their textual form and arrays one field per scalar element. Other members and
/// missing ones are skipped.
#[derive(Debug, Default, Clone)]
pub struct JsonRegistry {
    types: HashMap<String, Vec<String>>,
}

impl JsonRegistry {
    /// Member holding the advertisement type.
    pub const TYPE_FIELD: &'static str = "type";

    /// Create a registry without any types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the index fields of an advertisement type, replacing earlier ones.
    pub fn register<I, S>(&mut self, adv_type: impl Into<String>, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        self.types.insert(adv_type.into(), fields);
    }

    /// Builder form of [`Self::register`].
    pub fn with_type<I, S>(mut self, adv_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register(adv_type, fields);
        self
    }

    fn parse(document: &[u8]) -> Result<Value, ParseError> {
        serde_json::from_slice(document).context(InvalidDocumentSnafu)
    }

    fn type_of(doc: &Value) -> Result<String, ParseError> {
        doc.get(Self::TYPE_FIELD)
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .context(MissingTypeSnafu)
    }

    fn fields_of(&self, adv_type: &str, doc: &Value) -> Vec<IndexField> {
        let Some(names) = self.types.get(adv_type) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for name in names {
            let values: Vec<String> = match doc.get(name) {
                Some(Value::Array(items)) => items.iter().filter_map(scalar).collect(),
                Some(value) => scalar(value).into_iter().collect(),
                None => Vec::new(),
            };
            for value in values {
                let field = IndexField::new(name.as_str(), value);
                if !out.contains(&field) {
                    out.push(field);
                }
            }
        }
        out
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

impl DocumentRegistry for JsonRegistry {
    fn advertisement_type(&self, document: &[u8]) -> Result<String, ParseError> {
        Self::type_of(&Self::parse(document)?)
    }

    fn index_fields(&self, adv_type: &str, document: &[u8]) -> Result<Vec<IndexField>, ParseError> {
        let doc = Self::parse(document)?;
        Ok(self.fields_of(adv_type, &doc))
    }

    fn resolve(&self, document: &[u8]) -> Result<Vec<IndexField>, ParseError> {
        let doc = Self::parse(document)?;
        let adv_type = Self::type_of(&doc)?;
        Ok(self.fields_of(&adv_type, &doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JsonRegistry {
        JsonRegistry::new()
            .with_type("peer", ["Name", "PID"])
            .with_type("group", ["Name", "GID", "Desc"])
    }

    #[test]
    fn resolves_declared_fields() {
        let doc = br#"{"type": "peer", "Name": "alice", "PID": 42, "Other": "x"}"#;
        let fields = registry().resolve(doc).unwrap();
        let name = IndexField::new("Name", "alice");
        let pid = IndexField::new("PID", "42");
        assert_eq!(fields, [name, pid]);
    }

    #[test]
    fn arrays_and_skipped_values() {
        let doc = br#"{"type": "group", "Name": ["a", "b", "a", {"x": 1}], "GID": null}"#;
        let fields = registry().resolve(doc).unwrap();
        assert_eq!(
            fields,
            vec![IndexField::new("Name", "a"), IndexField::new("Name", "b")]
        );
    }

    #[test]
    fn unknown_type_has_no_fields() {
        let doc = br#"{"type": "pipe", "Name": "p"}"#;
        assert!(registry().resolve(doc).unwrap().is_empty());
        assert_eq!(registry().advertisement_type(doc).unwrap(), "pipe");
    }

    #[test]
    fn parse_failures() {
        assert!(matches!(
            registry().resolve(b"not json"),
            Err(ParseError::InvalidDocument { .. })
        ));
        assert!(matches!(
            registry().resolve(br#"{"Name": "alice"}"#),
            Err(ParseError::MissingType { .. })
        ));
    }
}
