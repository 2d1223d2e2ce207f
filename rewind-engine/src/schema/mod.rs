//! Typed object schema ("describe") metadata.
//!
//! A describe is fetched once per cache generation and never mutated; the
//! cache hands out `Arc<ObjectDescribe>` and replaces entries wholesale.

pub mod cache;

use serde::{Deserialize, Serialize};

pub use cache::{CacheStats, MetadataCache};

/// Primitive type of a field as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Id,
    Reference,
    String,
    Textarea,
    Picklist,
    Multipicklist,
    Email,
    Phone,
    Url,
    Boolean,
    Int,
    Double,
    Currency,
    Percent,
    Date,
    Datetime,
    Time,
    Address,
    Location,
    #[serde(other)]
    Other,
}

impl FieldType {
    /// Compound fields are read-only aggregates of other columns and cannot
    /// round-trip through a flat file.
    pub fn is_compound(&self) -> bool {
        matches!(self, FieldType::Address | FieldType::Location)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Int | FieldType::Double | FieldType::Currency | FieldType::Percent
        )
    }
}

/// Schema of a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescribe {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    pub nullable: bool,

    /// Whether a value may be supplied on insert
    #[serde(default = "default_true")]
    pub createable: bool,

    /// Objects a relationship field may point at (empty otherwise)
    #[serde(default)]
    pub reference_to: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship_name: Option<String>,
}

fn default_true() -> bool {
    true
}

impl FieldDescribe {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            createable: true,
            reference_to: Vec::new(),
            relationship_name: None,
        }
    }

    /// A relationship field pointing at `targets`.
    pub fn reference<I, S>(name: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reference_to: targets.into_iter().map(Into::into).collect(),
            ..Self::new(name, FieldType::Reference)
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.createable = false;
        self
    }

    pub fn is_relationship(&self) -> bool {
        !self.reference_to.is_empty()
    }

    /// Non-nullable relationship: implies an ordering dependency.
    pub fn is_required_relationship(&self) -> bool {
        self.is_relationship() && !self.nullable
    }

    pub fn references(&self, object: &str) -> bool {
        self.reference_to.iter().any(|t| t == object)
    }
}

/// A relationship edge carried by an object's describe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship<'a> {
    pub field: &'a str,
    pub target: &'a str,
    pub required: bool,
}

/// Schema of an object: its ordered fields and outgoing relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDescribe {
    pub name: String,
    pub fields: Vec<FieldDescribe>,
}

impl ObjectDescribe {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescribe>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescribe> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// One entry per (field, referenced object) pair.
    pub fn relationships(&self) -> impl Iterator<Item = Relationship<'_>> {
        self.fields.iter().flat_map(|f| {
            f.reference_to.iter().map(move |target| Relationship {
                field: &f.name,
                target,
                required: !f.nullable,
            })
        })
    }

    /// Fields exported when the caller selects none explicitly.
    pub fn exportable_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| !f.field_type.is_compound())
            .map(|f| f.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> ObjectDescribe {
        ObjectDescribe::new(
            "Contact",
            vec![
                FieldDescribe::new("Id", FieldType::Id).required().read_only(),
                FieldDescribe::new("LastName", FieldType::String).required(),
                FieldDescribe::reference("AccountId", ["Account"]).required(),
                FieldDescribe::reference("OwnerId", ["User", "Group"]),
                FieldDescribe::new("MailingAddress", FieldType::Address).read_only(),
            ],
        )
    }

    #[test]
    fn test_relationships_expand_polymorphic_targets() {
        let describe = contact();
        let rels: Vec<_> = describe.relationships().collect();
        assert_eq!(rels.len(), 3);
        assert_eq!(
            rels[0],
            Relationship { field: "AccountId", target: "Account", required: true }
        );
        assert!(rels[1..].iter().all(|r| r.field == "OwnerId" && !r.required));
    }

    #[test]
    fn test_exportable_fields_skip_compound() {
        let fields = contact().exportable_fields();
        assert_eq!(fields, vec!["Id", "LastName", "AccountId", "OwnerId"]);
    }

    #[test]
    fn test_field_type_deserializes_unknown_as_other() {
        let t: FieldType = serde_json::from_str("\"encryptedstring\"").unwrap();
        assert_eq!(t, FieldType::Other);
        let t: FieldType = serde_json::from_str("\"datetime\"").unwrap();
        assert_eq!(t, FieldType::Datetime);
    }
}
