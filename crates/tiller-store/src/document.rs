//! The persisted document model.
//!
//! Every managed entity is one `Document`: a stable id, a lifecycle
//! value, a revision counter maintained by the store, and a bag of
//! kind-specific fields. Typed layers above the store serde-convert the
//! field bag into their own snapshot structs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiller_core::Life;

/// Kind-specific document fields.
pub type Fields = serde_json::Map<String, Value>;

/// One entity document in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier, unique within the collection, immutable after
    /// creation.
    pub id: String,
    /// Lifecycle value; only ever advances.
    pub life: Life,
    /// Revision counter: 1 on insert, incremented by the store on every
    /// successful mutating commit. Never reused.
    pub txn_revno: u64,
    /// Kind-specific fields.
    pub fields: Fields,
}

impl Document {
    /// Create a freshly-inserted document: Alive, at revision 1.
    #[must_use]
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            life: Life::Alive,
            txn_revno: 1,
            fields,
        }
    }

    /// Look up one field of the bag.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_document_is_alive_at_revno_one() {
        let mut fields = Fields::new();
        fields.insert("instance_id".into(), Value::Null);
        let doc = Document::new("0", fields);
        assert_eq!(doc.life, Life::Alive);
        assert_eq!(doc.txn_revno, 1);
        assert_eq!(doc.field("instance_id"), Some(&Value::Null));
        assert_eq!(doc.field("missing"), None);
    }
}
