//! Record addressing.

use serde::{Deserialize, Serialize};

/// Address of a record: a logical table, a partition key and a sort key.
///
/// The sort key defaults to the empty string for tables that are flat
/// key-value maps; partitioned tables (the per-order event log) use it to
/// order records within a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: String,
    pub pk: String,
    pub sk: String,
}

impl RecordKey {
    /// Creates a key with an empty sort key.
    pub fn new(table: impl Into<String>, pk: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            pk: pk.into(),
            sk: String::new(),
        }
    }

    /// Creates a key with an explicit sort key.
    pub fn with_sort(
        table: impl Into<String>,
        pk: impl Into<String>,
        sk: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sk.is_empty() {
            write!(f, "{}/{}", self.table, self.pk)
        } else {
            write!(f, "{}/{}/{}", self.table, self.pk, self.sk)
        }
    }
}
