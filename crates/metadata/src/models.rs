//! Database models mapping to the metadata schema.

use crate::error::MetadataResult;
use sqlx::FromRow;
use strata_core::{
    ObjectFormat, ObjectId, ObjectIndex, ObjectLocation, ObjectMeta, TableColumn, TableVersion,
};
use time::OffsetDateTime;

// =============================================================================
// Objects
// =============================================================================

/// Object metadata record.
#[derive(Debug, Clone, FromRow)]
pub struct ObjectRow {
    #[sqlx(try_from = "String")]
    pub object_id: ObjectId,
    pub format: String,
    pub namespace: String,
    pub size_bytes: i64,
    pub parent_id: Option<String>,
    pub index_json: String,
    pub created_at: OffsetDateTime,
}

impl ObjectRow {
    pub fn from_meta(meta: &ObjectMeta) -> MetadataResult<Self> {
        Ok(Self {
            object_id: meta.object_id.clone(),
            format: meta.format.as_str().to_string(),
            namespace: meta.namespace.clone(),
            size_bytes: size_to_db(meta.size_bytes),
            parent_id: meta.parent_id.as_ref().map(|p| p.as_str().to_string()),
            index_json: meta.index.to_json()?,
            created_at: meta.created_at,
        })
    }

    pub fn into_meta(self) -> MetadataResult<ObjectMeta> {
        Ok(ObjectMeta {
            object_id: self.object_id,
            format: self.format.parse::<ObjectFormat>()?,
            namespace: self.namespace,
            size_bytes: size_from_db(self.size_bytes),
            parent_id: self.parent_id.map(ObjectId::new).transpose()?,
            index: ObjectIndex::from_json(&self.index_json)?,
            created_at: self.created_at,
        })
    }
}

/// External location record.
#[derive(Debug, Clone, FromRow)]
pub struct LocationRow {
    #[sqlx(try_from = "String")]
    pub object_id: ObjectId,
    pub location: String,
    pub protocol: String,
}

impl From<LocationRow> for ObjectLocation {
    fn from(row: LocationRow) -> Self {
        ObjectLocation {
            object_id: row.object_id,
            location: row.location,
            protocol: row.protocol,
        }
    }
}

// =============================================================================
// Object cache
// =============================================================================

/// Cache status record.
///
/// `ready = false` means a fetch or upload is in flight and the object's
/// bytes must not be read.
#[derive(Debug, Clone, FromRow)]
pub struct CacheEntryRow {
    #[sqlx(try_from = "String")]
    pub object_id: ObjectId,
    pub ready: bool,
    pub refcount: i64,
    pub last_used: OffsetDateTime,
}

/// Zero-refcount cache entry joined with its object metadata size.
#[derive(Debug, Clone, FromRow)]
pub struct EvictionCandidateRow {
    #[sqlx(try_from = "String")]
    pub object_id: ObjectId,
    pub ready: bool,
    pub last_used: OffsetDateTime,
    /// `None` when the object has no metadata row.
    pub size_bytes: Option<i64>,
}

// =============================================================================
// Tables
// =============================================================================

/// Table version record. Schema and object list are stored as JSON text.
#[derive(Debug, Clone, FromRow)]
pub struct TableRow {
    pub namespace: String,
    pub repository: String,
    pub image_hash: String,
    pub table_name: String,
    pub table_schema: String,
    pub object_ids: String,
}

impl TableRow {
    pub fn from_version(table: &TableVersion) -> MetadataResult<Self> {
        Ok(Self {
            namespace: table.namespace.clone(),
            repository: table.repository.clone(),
            image_hash: table.image_hash.clone(),
            table_name: table.table_name.clone(),
            table_schema: serde_json::to_string(&table.schema)?,
            object_ids: serde_json::to_string(&table.objects)?,
        })
    }

    pub fn into_version(self) -> MetadataResult<TableVersion> {
        let schema: Vec<TableColumn> = serde_json::from_str(&self.table_schema)?;
        let objects = parse_object_list(&self.object_ids)?;
        Ok(TableVersion {
            namespace: self.namespace,
            repository: self.repository,
            image_hash: self.image_hash,
            table_name: self.table_name,
            schema,
            objects,
        })
    }
}

/// Parse a JSON array of object ids as stored in `tables.object_ids`.
pub fn parse_object_list(json: &str) -> MetadataResult<Vec<ObjectId>> {
    Ok(serde_json::from_str(json)?)
}

/// Parse raw id strings read back from the database.
pub fn parse_ids(raw: Vec<String>) -> MetadataResult<Vec<ObjectId>> {
    Ok(raw
        .into_iter()
        .map(ObjectId::new)
        .collect::<strata_core::Result<Vec<_>>>()?)
}

/// Owned id strings for binding.
pub fn id_strings(ids: &[ObjectId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_string()).collect()
}

/// Sizes are `u64` in the domain and `BIGINT` in the database.
pub fn size_to_db(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

pub fn size_from_db(size: i64) -> u64 {
    u64::try_from(size).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_row_round_trips_meta() {
        let parent = ObjectId::from_content(b"parent");
        let mut meta = ObjectMeta::snapshot(ObjectId::from_content(b"child"), "ns", 42);
        meta.format = ObjectFormat::Diff;
        meta.parent_id = Some(parent.clone());

        let row = ObjectRow::from_meta(&meta).unwrap();
        assert_eq!(row.format, "DIFF");
        assert_eq!(row.index_json, "{}");

        let back = row.into_meta().unwrap();
        assert_eq!(back.parent_id, Some(parent));
        assert_eq!(back.size_bytes, 42);
    }

    #[test]
    fn test_table_row_rejects_bad_object_list() {
        let row = TableRow {
            namespace: "ns".to_string(),
            repository: "repo".to_string(),
            image_hash: "abc".to_string(),
            table_name: "t".to_string(),
            table_schema: "[]".to_string(),
            object_ids: r#"["not-an-object"]"#.to_string(),
        };
        assert!(row.into_version().is_err());
    }

    #[test]
    fn test_negative_size_clamps_to_zero() {
        assert_eq!(size_from_db(-5), 0);
        assert_eq!(size_to_db(u64::MAX), i64::MAX);
    }
}
