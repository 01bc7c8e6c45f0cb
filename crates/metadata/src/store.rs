//! Metadata store trait and the SQLite implementation.

use crate::error::MetadataResult;
use crate::repos::{CacheStatusRepo, CacheTransaction, LocationRepo, ObjectRepo, TableRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    ObjectRepo + LocationRepo + TableRepo + CacheStatusRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Open a transaction on the cache tables.
    async fn begin_cache_transaction(&self) -> MetadataResult<Box<dyn CacheTransaction>>;
}

/// SQLite-based metadata store.
///
/// Several processes may open the same database file. Each store holds a
/// single connection; cache transactions take the database write lock as
/// their first statement and wait up to the busy timeout for it.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) a SQLite store.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: u64) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let busy_timeout = Duration::from_secs(busy_timeout_secs);
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            // Queue behind an open cache transaction for as long as another
            // process may hold the write lock.
            .acquire_timeout(busy_timeout.max(Duration::from_secs(30)))
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), busy_timeout_secs, "Opened SQLite metadata store");

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn begin_cache_transaction(&self) -> MetadataResult<Box<dyn CacheTransaction>> {
        let mut tx = self.pool.begin().await?;
        // A write as the first statement makes SQLite take the write lock
        // now, retrying through the busy handler, instead of failing later
        // when a read snapshot would have to be upgraded. The lock is held
        // until commit, so other managers wait at most `busy_timeout`.
        sqlx::query("UPDATE object_cache_occupancy SET total_size = total_size WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(SqliteCacheTx { tx }))
    }
}

/// Cache transaction on a SQLite connection.
pub struct SqliteCacheTx {
    tx: Transaction<'static, Sqlite>,
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::cache::sorted_unique;
    use sqlx::SqliteConnection;
    use sqlx::sqlite::SqliteRow;
    use std::collections::{BTreeSet, HashMap};
    use strata_core::{ObjectId, ObjectLocation, ObjectMeta, TableVersion};
    use time::OffsetDateTime;

    /// SQLite has a limit of ~999 bound parameters per statement.
    const BATCH_SIZE: usize = 900;

    const CACHE_ENTRY_COLUMNS: &str = "object_id, ready, refcount, last_used";
    const OBJECT_COLUMNS: &str =
        "object_id, format, namespace, size_bytes, parent_id, index_json, created_at";

    fn placeholders(n: usize) -> String {
        std::iter::repeat_n("?", n).collect::<Vec<_>>().join(", ")
    }

    /// Run `template` once per batch of ids, with `{ids}` replaced by the
    /// batch's placeholders, and collect the returned id column.
    async fn ids_in(
        conn: &mut SqliteConnection,
        template: &str,
        ids: &[ObjectId],
    ) -> MetadataResult<Vec<ObjectId>> {
        let mut raw = Vec::new();
        for batch in ids.chunks(BATCH_SIZE) {
            let sql = template.replace("{ids}", &placeholders(batch.len()));
            let mut query = sqlx::query_scalar::<_, String>(&sql);
            for id in batch {
                query = query.bind(id.as_str());
            }
            raw.extend(query.fetch_all(&mut *conn).await?);
        }
        let mut ids = parse_ids(raw)?;
        ids.sort();
        Ok(ids)
    }

    async fn rows_in<T>(
        conn: &mut SqliteConnection,
        template: &str,
        ids: &[ObjectId],
    ) -> MetadataResult<Vec<T>>
    where
        T: for<'r> sqlx::FromRow<'r, SqliteRow> + Send + Unpin,
    {
        let mut rows = Vec::new();
        for batch in ids.chunks(BATCH_SIZE) {
            let sql = template.replace("{ids}", &placeholders(batch.len()));
            let mut query = sqlx::query_as::<_, T>(&sql);
            for id in batch {
                query = query.bind(id.as_str());
            }
            rows.extend(query.fetch_all(&mut *conn).await?);
        }
        Ok(rows)
    }

    async fn execute_in(
        conn: &mut SqliteConnection,
        template: &str,
        ids: &[ObjectId],
    ) -> MetadataResult<u64> {
        let mut affected = 0;
        for batch in ids.chunks(BATCH_SIZE) {
            let sql = template.replace("{ids}", &placeholders(batch.len()));
            let mut query = sqlx::query(&sql);
            for id in batch {
                query = query.bind(id.as_str());
            }
            affected += query.execute(&mut *conn).await?.rows_affected();
        }
        Ok(affected)
    }

    async fn upsert_location(
        conn: &mut SqliteConnection,
        location: &ObjectLocation,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO object_locations (object_id, location, protocol)
            VALUES (?, ?, ?)
            ON CONFLICT (object_id, protocol) DO UPDATE
            SET location = excluded.location
            "#,
        )
        .bind(location.object_id.as_str())
        .bind(&location.location)
        .bind(&location.protocol)
        .execute(conn)
        .await?;
        Ok(())
    }

    #[async_trait]
    impl ObjectRepo for SqliteStore {
        async fn upsert_objects(&self, objects: &[ObjectMeta]) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            for meta in objects {
                let row = ObjectRow::from_meta(meta)?;
                sqlx::query(
                    r#"
                    INSERT INTO objects
                        (object_id, format, namespace, size_bytes, parent_id, index_json, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (object_id) DO UPDATE SET
                        format = excluded.format,
                        namespace = excluded.namespace,
                        size_bytes = excluded.size_bytes,
                        parent_id = excluded.parent_id,
                        index_json = excluded.index_json
                    "#,
                )
                .bind(row.object_id.as_str())
                .bind(&row.format)
                .bind(&row.namespace)
                .bind(row.size_bytes)
                .bind(&row.parent_id)
                .bind(&row.index_json)
                .bind(row.created_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn get_object_meta(
            &self,
            ids: &[ObjectId],
        ) -> MetadataResult<HashMap<ObjectId, ObjectMeta>> {
            if ids.is_empty() {
                return Ok(HashMap::new());
            }
            let mut conn = self.pool.acquire().await?;
            let rows: Vec<ObjectRow> = rows_in(
                &mut conn,
                &format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE object_id IN ({{ids}})"),
                &sorted_unique(ids),
            )
            .await?;

            rows.into_iter()
                .map(|row| {
                    let meta = row.into_meta()?;
                    Ok((meta.object_id.clone(), meta))
                })
                .collect()
        }

        async fn list_object_ids(&self) -> MetadataResult<Vec<ObjectId>> {
            let raw: Vec<String> =
                sqlx::query_scalar("SELECT object_id FROM objects ORDER BY object_id")
                    .fetch_all(&self.pool)
                    .await?;
            parse_ids(raw)
        }
    }

    #[async_trait]
    impl LocationRepo for SqliteStore {
        async fn register_object_locations(
            &self,
            locations: &[ObjectLocation],
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            for location in locations {
                upsert_location(&mut tx, location).await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn get_external_object_locations(
            &self,
            ids: &[ObjectId],
        ) -> MetadataResult<Vec<ObjectLocation>> {
            let mut conn = self.pool.acquire().await?;
            let rows: Vec<LocationRow> = rows_in(
                &mut conn,
                "SELECT object_id, location, protocol FROM object_locations \
                 WHERE object_id IN ({ids}) ORDER BY object_id, protocol",
                &sorted_unique(ids),
            )
            .await?;
            Ok(rows.into_iter().map(ObjectLocation::from).collect())
        }
    }

    #[async_trait]
    impl TableRepo for SqliteStore {
        async fn upsert_table(&self, table: &TableVersion) -> MetadataResult<()> {
            let row = TableRow::from_version(table)?;
            sqlx::query(
                r#"
                INSERT INTO tables
                    (namespace, repository, image_hash, table_name, table_schema, object_ids)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (namespace, repository, image_hash, table_name) DO UPDATE SET
                    table_schema = excluded.table_schema,
                    object_ids = excluded.object_ids
                "#,
            )
            .bind(&row.namespace)
            .bind(&row.repository)
            .bind(&row.image_hash)
            .bind(&row.table_name)
            .bind(&row.table_schema)
            .bind(&row.object_ids)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_table(
            &self,
            namespace: &str,
            repository: &str,
            image_hash: &str,
            table_name: &str,
        ) -> MetadataResult<Option<TableVersion>> {
            let row = sqlx::query_as::<_, TableRow>(
                "SELECT * FROM tables WHERE namespace = ? AND repository = ? \
                 AND image_hash = ? AND table_name = ?",
            )
            .bind(namespace)
            .bind(repository)
            .bind(image_hash)
            .bind(table_name)
            .fetch_optional(&self.pool)
            .await?;
            row.map(TableRow::into_version).transpose()
        }

        async fn delete_table(
            &self,
            namespace: &str,
            repository: &str,
            image_hash: &str,
            table_name: &str,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "DELETE FROM tables WHERE namespace = ? AND repository = ? \
                 AND image_hash = ? AND table_name = ?",
            )
            .bind(namespace)
            .bind(repository)
            .bind(image_hash)
            .bind(table_name)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn list_tables(&self) -> MetadataResult<Vec<TableVersion>> {
            let rows = sqlx::query_as::<_, TableRow>(
                "SELECT * FROM tables ORDER BY namespace, repository, image_hash, table_name",
            )
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(TableRow::into_version).collect()
        }
    }

    #[async_trait]
    impl CacheStatusRepo for SqliteStore {
        async fn get_cache_entries(&self, ids: &[ObjectId]) -> MetadataResult<Vec<CacheEntryRow>> {
            let mut conn = self.pool.acquire().await?;
            rows_in(
                &mut conn,
                &format!(
                    "SELECT {CACHE_ENTRY_COLUMNS} FROM object_cache_status \
                     WHERE object_id IN ({{ids}}) ORDER BY object_id"
                ),
                &sorted_unique(ids),
            )
            .await
        }

        async fn list_cache_entries(&self) -> MetadataResult<Vec<CacheEntryRow>> {
            let rows = sqlx::query_as::<_, CacheEntryRow>(&format!(
                "SELECT {CACHE_ENTRY_COLUMNS} FROM object_cache_status ORDER BY object_id"
            ))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_cache_occupancy(&self) -> MetadataResult<i64> {
            let total: Option<i64> =
                sqlx::query_scalar("SELECT total_size FROM object_cache_occupancy WHERE id = 1")
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(total.unwrap_or(0))
        }
    }

    #[async_trait]
    impl CacheTransaction for SqliteCacheTx {
        async fn lock_cache_status(&mut self) -> MetadataResult<()> {
            // The write lock taken when the transaction opened already
            // excludes every other writer.
            Ok(())
        }

        async fn bump_refcounts(
            &mut self,
            ids: &[ObjectId],
            now: OffsetDateTime,
        ) -> MetadataResult<Vec<ObjectId>> {
            let mut raw = Vec::new();
            for batch in sorted_unique(ids).chunks(BATCH_SIZE) {
                let sql = format!(
                    "UPDATE object_cache_status SET refcount = refcount + 1, last_used = ? \
                     WHERE object_id IN ({}) RETURNING object_id",
                    placeholders(batch.len())
                );
                let mut query = sqlx::query_scalar::<_, String>(&sql).bind(now);
                for id in batch {
                    query = query.bind(id.as_str());
                }
                raw.extend(query.fetch_all(&mut *self.tx).await?);
            }
            let mut bumped = parse_ids(raw)?;
            bumped.sort();
            Ok(bumped)
        }

        async fn insert_claim(&mut self, id: &ObjectId, now: OffsetDateTime) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO object_cache_status (object_id, ready, refcount, last_used)
                VALUES (?, 0, 1, ?)
                ON CONFLICT (object_id) DO UPDATE
                SET refcount = refcount + 1, last_used = excluded.last_used
                "#,
            )
            .bind(id.as_str())
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
            Ok(())
        }

        async fn pin_for_upload(
            &mut self,
            id: &ObjectId,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let bumped = sqlx::query(
                "UPDATE object_cache_status SET refcount = refcount + 1, last_used = ? \
                 WHERE object_id = ?",
            )
            .bind(now)
            .bind(id.as_str())
            .execute(&mut *self.tx)
            .await?;
            if bumped.rows_affected() > 0 {
                return Ok(false);
            }

            sqlx::query(
                "INSERT INTO object_cache_status (object_id, ready, refcount, last_used) \
                 VALUES (?, 0, 1, ?)",
            )
            .bind(id.as_str())
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
            Ok(true)
        }

        async fn not_ready(
            &mut self,
            ids: &[ObjectId],
            _lock_rows: bool,
        ) -> MetadataResult<Vec<ObjectId>> {
            ids_in(
                &mut self.tx,
                "SELECT object_id FROM object_cache_status WHERE NOT ready AND object_id IN ({ids})",
                &sorted_unique(ids),
            )
            .await
        }

        async fn lock_entries(&mut self, ids: &[ObjectId]) -> MetadataResult<Vec<CacheEntryRow>> {
            self.cache_entries(ids).await
        }

        async fn cache_entries(&mut self, ids: &[ObjectId]) -> MetadataResult<Vec<CacheEntryRow>> {
            rows_in(
                &mut self.tx,
                &format!(
                    "SELECT {CACHE_ENTRY_COLUMNS} FROM object_cache_status \
                     WHERE object_id IN ({{ids}}) ORDER BY object_id"
                ),
                &sorted_unique(ids),
            )
            .await
        }

        async fn set_ready(&mut self, ids: &[ObjectId], ready: bool) -> MetadataResult<()> {
            execute_in(
                &mut self.tx,
                &format!(
                    "UPDATE object_cache_status SET ready = {} WHERE object_id IN ({{ids}})",
                    i32::from(ready)
                ),
                &sorted_unique(ids),
            )
            .await?;
            Ok(())
        }

        async fn release(&mut self, ids: &[ObjectId]) -> MetadataResult<()> {
            execute_in(
                &mut self.tx,
                "UPDATE object_cache_status SET refcount = refcount - 1 \
                 WHERE refcount > 0 AND object_id IN ({ids})",
                &sorted_unique(ids),
            )
            .await?;
            Ok(())
        }

        async fn delete_entries(&mut self, ids: &[ObjectId]) -> MetadataResult<u64> {
            execute_in(
                &mut self.tx,
                "DELETE FROM object_cache_status WHERE object_id IN ({ids})",
                &sorted_unique(ids),
            )
            .await
        }

        async fn eviction_candidates(&mut self) -> MetadataResult<Vec<EvictionCandidateRow>> {
            let rows = sqlx::query_as::<_, EvictionCandidateRow>(
                r#"
                SELECT c.object_id, c.ready, c.last_used, o.size_bytes
                FROM object_cache_status c
                LEFT JOIN objects o ON o.object_id = c.object_id
                WHERE c.refcount = 0
                ORDER BY c.object_id
                "#,
            )
            .fetch_all(&mut *self.tx)
            .await?;
            Ok(rows)
        }

        async fn ready_entries(&mut self) -> MetadataResult<Vec<ObjectId>> {
            let raw: Vec<String> = sqlx::query_scalar(
                "SELECT object_id FROM object_cache_status WHERE ready ORDER BY object_id",
            )
            .fetch_all(&mut *self.tx)
            .await?;
            parse_ids(raw)
        }

        async fn occupancy(&mut self) -> MetadataResult<i64> {
            let total: Option<i64> =
                sqlx::query_scalar("SELECT total_size FROM object_cache_occupancy WHERE id = 1")
                    .fetch_optional(&mut *self.tx)
                    .await?;
            Ok(total.unwrap_or(0))
        }

        async fn adjust_occupancy(&mut self, delta: i64) -> MetadataResult<()> {
            sqlx::query(
                "UPDATE object_cache_occupancy SET total_size = total_size + ? WHERE id = 1",
            )
            .bind(delta)
            .execute(&mut *self.tx)
            .await?;
            Ok(())
        }

        async fn set_occupancy(&mut self, total: i64) -> MetadataResult<()> {
            sqlx::query("UPDATE object_cache_occupancy SET total_size = ? WHERE id = 1")
                .bind(total)
                .execute(&mut *self.tx)
                .await?;
            Ok(())
        }

        async fn object_sizes(
            &mut self,
            ids: &[ObjectId],
        ) -> MetadataResult<HashMap<ObjectId, u64>> {
            let rows: Vec<(String, i64)> = rows_in(
                &mut self.tx,
                "SELECT object_id, size_bytes FROM objects WHERE object_id IN ({ids})",
                &sorted_unique(ids),
            )
            .await?;
            rows.into_iter()
                .map(|(id, size)| Ok((ObjectId::new(id)?, size_from_db(size))))
                .collect()
        }

        async fn external_locations(
            &mut self,
            ids: &[ObjectId],
        ) -> MetadataResult<Vec<ObjectLocation>> {
            let rows: Vec<LocationRow> = rows_in(
                &mut self.tx,
                "SELECT object_id, location, protocol FROM object_locations \
                 WHERE object_id IN ({ids}) ORDER BY object_id, protocol",
                &sorted_unique(ids),
            )
            .await?;
            Ok(rows.into_iter().map(ObjectLocation::from).collect())
        }

        async fn register_locations(&mut self, locations: &[ObjectLocation]) -> MetadataResult<()> {
            for location in locations {
                upsert_location(&mut self.tx, location).await?;
            }
            Ok(())
        }

        async fn referenced_object_ids(&mut self) -> MetadataResult<BTreeSet<ObjectId>> {
            let lists: Vec<String> = sqlx::query_scalar("SELECT object_ids FROM tables")
                .fetch_all(&mut *self.tx)
                .await?;
            let mut live = BTreeSet::new();
            for list in lists {
                live.extend(parse_object_list(&list)?);
            }
            Ok(live)
        }

        async fn known_object_ids(&mut self) -> MetadataResult<BTreeSet<ObjectId>> {
            let raw: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT object_id FROM objects
                UNION SELECT object_id FROM object_locations
                UNION SELECT object_id FROM object_cache_status
                "#,
            )
            .fetch_all(&mut *self.tx)
            .await?;
            Ok(parse_ids(raw)?.into_iter().collect())
        }

        async fn purge_metadata(
            &mut self,
            ids: &[ObjectId],
            include_cache_status: bool,
        ) -> MetadataResult<u64> {
            let ids = sorted_unique(ids);
            let mut removed = execute_in(
                &mut self.tx,
                "DELETE FROM object_locations WHERE object_id IN ({ids})",
                &ids,
            )
            .await?;
            removed += execute_in(
                &mut self.tx,
                "DELETE FROM objects WHERE object_id IN ({ids})",
                &ids,
            )
            .await?;
            if include_cache_status {
                removed += execute_in(
                    &mut self.tx,
                    "DELETE FROM object_cache_status WHERE object_id IN ({ids})",
                    &ids,
                )
                .await?;
            }
            Ok(removed)
        }

        async fn commit(self: Box<Self>) -> MetadataResult<()> {
            self.tx.commit().await?;
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> MetadataResult<()> {
            self.tx.rollback().await?;
            Ok(())
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Object metadata
CREATE TABLE IF NOT EXISTS objects (
    object_id TEXT PRIMARY KEY,
    format TEXT NOT NULL CHECK (format IN ('SNAP', 'DIFF')),
    namespace TEXT NOT NULL,
    size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
    parent_id TEXT,
    index_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_objects_namespace ON objects(namespace);

-- External locations
CREATE TABLE IF NOT EXISTS object_locations (
    object_id TEXT NOT NULL,
    location TEXT NOT NULL,
    protocol TEXT NOT NULL,
    PRIMARY KEY (object_id, protocol)
);

-- Object cache status
CREATE TABLE IF NOT EXISTS object_cache_status (
    object_id TEXT PRIMARY KEY,
    ready INTEGER NOT NULL DEFAULT 0,
    refcount INTEGER NOT NULL DEFAULT 0 CHECK (refcount >= 0),
    last_used TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_object_cache_status_refcount ON object_cache_status(refcount);

-- Object cache occupancy (single row)
CREATE TABLE IF NOT EXISTS object_cache_occupancy (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    total_size INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO object_cache_occupancy (id, total_size) VALUES (1, 0);

-- Table versions
CREATE TABLE IF NOT EXISTS tables (
    namespace TEXT NOT NULL,
    repository TEXT NOT NULL,
    image_hash TEXT NOT NULL,
    table_name TEXT NOT NULL,
    table_schema TEXT NOT NULL,
    object_ids TEXT NOT NULL,
    PRIMARY KEY (namespace, repository, image_hash, table_name)
);
"#;
