//! Table versions and their schemas.

use crate::object::ObjectId;
use serde::{Deserialize, Serialize};

/// One column of a table schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub ordinal: u32,
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub is_pk: bool,
}

impl TableColumn {
    pub fn new(ordinal: u32, name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            ordinal,
            name: name.into(),
            data_type: data_type.into(),
            is_pk: false,
        }
    }
}

/// A table as of one image: its schema and the ordered objects that
/// materialize it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableVersion {
    pub namespace: String,
    pub repository: String,
    pub image_hash: String,
    pub table_name: String,
    pub schema: Vec<TableColumn>,
    pub objects: Vec<ObjectId>,
}

impl TableVersion {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.schema.iter().find(|c| c.name == name)
    }

    /// Human-readable identifier used in log fields.
    pub fn display_name(&self) -> String {
        format!(
            "{}/{}:{}/{}",
            self.namespace,
            self.repository,
            self.image_hash.get(..12).unwrap_or(&self.image_hash),
            self.table_name
        )
    }
}
