//! Document snapshots and mutable documents.

use crate::error::{CoreError, CoreResult};
use crate::revision::RevisionId;
use serde_json::Value;

/// A document's property tree.
pub type Properties = serde_json::Map<String, Value>;

/// Longest accepted document ID, in bytes.
pub const MAX_DOC_ID_LEN: usize = 240;

/// How a save reacts when the document changed since it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyControl {
    /// Overwrite whatever revision is current.
    #[default]
    LastWriteWins,
    /// Fail with a conflict error if the document moved on.
    FailOnConflict,
}

/// Checks that a document ID can be stored.
pub fn validate_doc_id(doc_id: &str) -> CoreResult<()> {
    if doc_id.is_empty() {
        return Err(CoreError::invalid_document_id(doc_id, "must not be empty"));
    }
    if doc_id.len() > MAX_DOC_ID_LEN {
        return Err(CoreError::invalid_document_id(
            doc_id,
            format!("longer than {MAX_DOC_ID_LEN} bytes"),
        ));
    }
    if doc_id.chars().any(char::is_control) {
        return Err(CoreError::invalid_document_id(
            doc_id,
            "contains control characters",
        ));
    }
    Ok(())
}

/// An immutable snapshot of a document's current revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: String,
    revision_id: Option<RevisionId>,
    sequence: u64,
    properties: Properties,
    deleted: bool,
}

impl Document {
    /// Builds a snapshot from its parts.
    ///
    /// Used for documents that are not (yet) stored, such as incoming
    /// revisions shown to a replication filter.
    pub fn from_parts(
        id: impl Into<String>,
        revision_id: Option<RevisionId>,
        sequence: u64,
        properties: Properties,
        deleted: bool,
    ) -> Self {
        Self {
            id: id.into(),
            revision_id,
            sequence,
            properties,
            deleted,
        }
    }

    /// Document ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current revision ID.
    pub fn revision_id(&self) -> Option<&RevisionId> {
        self.revision_id.as_ref()
    }

    /// Sequence of the last change.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Property tree.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Looks up a top-level property.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Whether this snapshot is a deletion.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Properties rendered as JSON text.
    pub fn properties_as_json(&self) -> String {
        Value::Object(self.properties.clone()).to_string()
    }

    /// Creates a mutable copy based on this revision.
    pub fn to_mutable(&self) -> MutableDocument {
        MutableDocument {
            id: self.id.clone(),
            base_revision: self.revision_id.clone(),
            sequence: self.sequence,
            properties: self.properties.clone(),
        }
    }
}

/// A document being edited.
///
/// Saving it updates its base revision and sequence in place.
#[derive(Debug, Clone, PartialEq)]
pub struct MutableDocument {
    id: String,
    base_revision: Option<RevisionId>,
    sequence: u64,
    properties: Properties,
}

impl MutableDocument {
    /// Creates an unsaved document with the given ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_revision: None,
            sequence: 0,
            properties: Properties::new(),
        }
    }

    /// Creates an unsaved document with a random ID.
    pub fn with_random_id() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// Document ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Revision this edit is based on.
    pub fn revision_id(&self) -> Option<&RevisionId> {
        self.base_revision.as_ref()
    }

    /// Sequence of the revision this edit is based on (0 if never saved).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Property tree.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Mutable property tree.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Looks up a top-level property.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Sets a top-level property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Removes a top-level property.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    /// Properties rendered as JSON text.
    pub fn properties_as_json(&self) -> String {
        Value::Object(self.properties.clone()).to_string()
    }

    /// Replaces the properties with a JSON object.
    pub fn set_properties_as_json(&mut self, json: &str) -> CoreResult<()> {
        match serde_json::from_str::<Value>(json).map_err(CoreError::codec)? {
            Value::Object(map) => {
                self.properties = map;
                Ok(())
            }
            other => Err(CoreError::Codec(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub(crate) fn mark_saved(&mut self, revision_id: RevisionId, sequence: u64) {
        self.base_revision = Some(revision_id);
        self.sequence = sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_document_is_empty() {
        let doc = MutableDocument::new("foo");
        assert_eq!(doc.id(), "foo");
        assert_eq!(doc.sequence(), 0);
        assert!(doc.revision_id().is_none());
        assert_eq!(doc.properties_as_json(), "{}");
    }

    #[test]
    fn set_and_get() {
        let mut doc = MutableDocument::new("foo");
        doc.set("greeting", "Howdy!").set("n", 3);
        assert_eq!(doc.get("greeting"), Some(&json!("Howdy!")));
        assert_eq!(doc.properties_as_json(), r#"{"greeting":"Howdy!","n":3}"#);
        assert_eq!(doc.remove("n"), Some(json!(3)));
    }

    #[test]
    fn json_round_trip() {
        let mut doc = MutableDocument::new("foo");
        doc.set_properties_as_json(r#"{"a":[1,2],"b":{"c":null}}"#)
            .unwrap();
        assert_eq!(doc.get("a"), Some(&json!([1, 2])));
        assert!(doc.set_properties_as_json("[1,2]").is_err());
        assert!(doc.set_properties_as_json("{nope").is_err());
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(
            MutableDocument::with_random_id().id(),
            MutableDocument::with_random_id().id()
        );
    }

    #[test]
    fn doc_id_validation() {
        assert!(validate_doc_id("foo").is_ok());
        assert!(validate_doc_id("").is_err());
        assert!(validate_doc_id("a\nb").is_err());
        assert!(validate_doc_id(&"x".repeat(MAX_DOC_ID_LEN + 1)).is_err());
    }
}
