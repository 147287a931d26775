//! Collection definitions and column families.
//!
//! Every managed entity kind lives in its own collection; relation unit
//! settings have a collection of their own. The RocksDB backend maps
//! each collection to a column family and adds one extra family for the
//! named sequence counters.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The document collections managed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Machine documents, keyed by decimal machine id.
    Machines,
    /// Unit documents, keyed by unit name.
    Units,
    /// Application documents (local and remote), keyed by name.
    Applications,
    /// Relation documents, keyed by decimal relation id.
    Relations,
    /// Relation unit settings, keyed by `r#<relation-id>#<unit>`.
    Settings,
}

impl Collection {
    /// The collection's stable name, also its column family name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Machines => "machines",
            Self::Units => "units",
            Self::Applications => "applications",
            Self::Relations => "relations",
            Self::Settings => "settings",
        }
    }

    /// All collections, in a stable order.
    #[must_use]
    pub const fn all() -> [Self; 5] {
        [
            Self::Machines,
            Self::Units,
            Self::Applications,
            Self::Relations,
            Self::Settings,
        ]
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Column family for the named sequence counters.
pub const SEQUENCES_CF: &str = "sequences";

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    let mut families: Vec<_> = Collection::all().iter().map(|c| c.name()).collect();
    families.push(SEQUENCES_CF);
    families
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_distinct() {
        let names = all_column_families();
        for (i, a) in names.iter().enumerate() {
            for b in names.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn sequences_family_included() {
        assert!(all_column_families().contains(&SEQUENCES_CF));
        assert_eq!(all_column_families().len(), 6);
    }
}
