//! Content-addressed object identifiers and object metadata.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Length of the hex digest portion of an object id.
const OBJECT_ID_HEX_LEN: usize = 62;

/// Identifier of an immutable data object: `o` followed by 62 lowercase
/// hex characters of its content hash.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    /// Create from a string, validating format.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        let Some(hex) = id.strip_prefix('o') else {
            return Err(crate::Error::InvalidObjectId(format!(
                "object id must start with 'o': {id}"
            )));
        };
        if hex.len() != OBJECT_ID_HEX_LEN {
            return Err(crate::Error::InvalidObjectId(format!(
                "object id must have {} hex chars, got {}",
                OBJECT_ID_HEX_LEN,
                hex.len()
            )));
        }
        if let Some(c) = hex.chars().find(|c| !matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(crate::Error::InvalidObjectId(format!(
                "invalid character in object id: {c}"
            )));
        }
        Ok(Self(id))
    }

    /// Derive the id of an object from its contents.
    pub fn from_content(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("o{}", &hex[..OBJECT_ID_HEX_LEN]))
    }

    /// Get the id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the object store key for this object.
    pub fn to_object_key(&self) -> String {
        format!("objects/{}", self.0)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl FromStr for ObjectId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", &self.0[..12])
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether an object is a full snapshot or a diff against its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectFormat {
    Snap,
    Diff,
}

impl ObjectFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snap => "SNAP",
            Self::Diff => "DIFF",
        }
    }
}

impl FromStr for ObjectFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "SNAP" => Ok(Self::Snap),
            "DIFF" => Ok(Self::Diff),
            other => Err(crate::Error::InvalidFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ObjectFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive value range of one column inside an object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnRange {
    pub min: serde_json::Value,
    pub max: serde_json::Value,
}

/// Per-column ranges used to prove that an object cannot match a filter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectIndex(pub BTreeMap<String, ColumnRange>);

impl ObjectIndex {
    pub fn range(&self, column: &str) -> Option<&ColumnRange> {
        self.0.get(column)
    }

    pub fn insert(&mut self, column: impl Into<String>, range: ColumnRange) {
        self.0.insert(column.into(), range);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse from the stored JSON form.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Encode into the stored JSON form.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Metadata describing a stored object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub object_id: ObjectId,
    pub format: ObjectFormat,
    /// Namespace that owns the object.
    pub namespace: String,
    pub size_bytes: u64,
    /// Object this diff applies to, if any.
    pub parent_id: Option<ObjectId>,
    #[serde(default)]
    pub index: ObjectIndex,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ObjectMeta {
    /// Metadata for a snapshot object with an empty index.
    pub fn snapshot(object_id: ObjectId, namespace: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            object_id,
            format: ObjectFormat::Snap,
            namespace: namespace.into(),
            size_bytes,
            parent_id: None,
            index: ObjectIndex::default(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_index(mut self, index: ObjectIndex) -> Self {
        self.index = index;
        self
    }
}

/// An external location from which a ready copy of an object can be fetched.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub object_id: ObjectId,
    /// Handler-specific URL of the object.
    pub location: String,
    /// Name of the handler that understands `location`.
    pub protocol: String,
}
