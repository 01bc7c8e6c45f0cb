//! PostgreSQL-based metadata store implementation.

use crate::error::MetadataResult;
use crate::models::*;
use crate::repos::cache::sorted_unique;
use crate::repos::{CacheStatusRepo, CacheTransaction, LocationRepo, ObjectRepo, TableRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres, Transaction};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use strata_core::config::PgSslMode;
use strata_core::{ObjectId, ObjectLocation, ObjectMeta, TableVersion};
use time::OffsetDateTime;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

const CACHE_ENTRY_COLUMNS: &str = "object_id, ready, refcount, last_used";

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// Lets the password come from the environment instead of a URL in a
    /// config file.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn begin_cache_transaction(&self) -> MetadataResult<Box<dyn CacheTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgCacheTx { tx }))
    }
}

#[async_trait]
impl ObjectRepo for PostgresStore {
    async fn upsert_objects(&self, objects: &[ObjectMeta]) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        for meta in objects {
            let row = ObjectRow::from_meta(meta)?;
            sqlx::query(
                r#"
                INSERT INTO objects
                    (object_id, format, namespace, size_bytes, parent_id, index_json, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (object_id) DO UPDATE SET
                    format = EXCLUDED.format,
                    namespace = EXCLUDED.namespace,
                    size_bytes = EXCLUDED.size_bytes,
                    parent_id = EXCLUDED.parent_id,
                    index_json = EXCLUDED.index_json
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
        let rows = sqlx::query_as::<_, ObjectRow>(
            "SELECT object_id, format, namespace, size_bytes, parent_id, index_json, created_at \
             FROM objects WHERE object_id = ANY($1)",
        )
        .bind(id_strings(ids))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let meta = row.into_meta()?;
                Ok((meta.object_id.clone(), meta))
            })
            .collect()
    }

    async fn list_object_ids(&self) -> MetadataResult<Vec<ObjectId>> {
        let raw: Vec<String> = sqlx::query_scalar("SELECT object_id FROM objects ORDER BY object_id")
            .fetch_all(&self.pool)
            .await?;
        parse_ids(raw)
    }
}

async fn upsert_location(
    conn: &mut sqlx::PgConnection,
    location: &ObjectLocation,
) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO object_locations (object_id, location, protocol)
        VALUES ($1, $2, $3)
        ON CONFLICT (object_id, protocol) DO UPDATE
        SET location = EXCLUDED.location
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
impl LocationRepo for PostgresStore {
    async fn register_object_locations(&self, locations: &[ObjectLocation]) -> MetadataResult<()> {
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
        let rows = sqlx::query_as::<_, LocationRow>(
            "SELECT object_id, location, protocol FROM object_locations \
             WHERE object_id = ANY($1) ORDER BY object_id, protocol",
        )
        .bind(id_strings(ids))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ObjectLocation::from).collect())
    }
}

#[async_trait]
impl TableRepo for PostgresStore {
    async fn upsert_table(&self, table: &TableVersion) -> MetadataResult<()> {
        let row = TableRow::from_version(table)?;
        sqlx::query(
            r#"
            INSERT INTO tables
                (namespace, repository, image_hash, table_name, table_schema, object_ids)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (namespace, repository, image_hash, table_name) DO UPDATE SET
                table_schema = EXCLUDED.table_schema,
                object_ids = EXCLUDED.object_ids
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
            "SELECT * FROM tables WHERE namespace = $1 AND repository = $2 \
             AND image_hash = $3 AND table_name = $4",
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
            "DELETE FROM tables WHERE namespace = $1 AND repository = $2 \
             AND image_hash = $3 AND table_name = $4",
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
impl CacheStatusRepo for PostgresStore {
    async fn get_cache_entries(&self, ids: &[ObjectId]) -> MetadataResult<Vec<CacheEntryRow>> {
        let rows = sqlx::query_as::<_, CacheEntryRow>(&format!(
            "SELECT {CACHE_ENTRY_COLUMNS} FROM object_cache_status \
             WHERE object_id = ANY($1) ORDER BY object_id"
        ))
        .bind(id_strings(ids))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
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

/// Cache transaction on a PostgreSQL connection.
///
/// Row locks are always taken in ascending object-id order.
pub struct PgCacheTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CacheTransaction for PgCacheTx {
    async fn lock_cache_status(&mut self) -> MetadataResult<()> {
        sqlx::query("LOCK TABLE object_cache_status IN EXCLUSIVE MODE")
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn bump_refcounts(
        &mut self,
        ids: &[ObjectId],
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<ObjectId>> {
        let raw: Vec<String> = sqlx::query_scalar(
            r#"
            WITH locked AS (
                SELECT object_id FROM object_cache_status
                WHERE object_id = ANY($2)
                ORDER BY object_id
                FOR UPDATE
            )
            UPDATE object_cache_status c
            SET refcount = c.refcount + 1, last_used = $1
            FROM locked
            WHERE c.object_id = locked.object_id
            RETURNING c.object_id
            "#,
        )
        .bind(now)
        .bind(id_strings(&sorted_unique(ids)))
        .fetch_all(&mut *self.tx)
        .await?;
        let mut bumped = parse_ids(raw)?;
        bumped.sort();
        Ok(bumped)
    }

    async fn insert_claim(&mut self, id: &ObjectId, now: OffsetDateTime) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO object_cache_status (object_id, ready, refcount, last_used)
            VALUES ($1, false, 1, $2)
            ON CONFLICT (object_id) DO UPDATE
            SET refcount = object_cache_status.refcount + 1, last_used = EXCLUDED.last_used
            "#,
        )
        .bind(id.as_str())
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn pin_for_upload(&mut self, id: &ObjectId, now: OffsetDateTime) -> MetadataResult<bool> {
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO object_cache_status (object_id, ready, refcount, last_used)
            VALUES ($1, false, 1, $2)
            ON CONFLICT (object_id) DO UPDATE
            SET refcount = object_cache_status.refcount + 1, last_used = EXCLUDED.last_used
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(id.as_str())
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(inserted)
    }

    async fn not_ready(
        &mut self,
        ids: &[ObjectId],
        lock_rows: bool,
    ) -> MetadataResult<Vec<ObjectId>> {
        let sql = if lock_rows {
            "SELECT object_id FROM object_cache_status \
             WHERE NOT ready AND object_id = ANY($1) ORDER BY object_id FOR UPDATE"
        } else {
            "SELECT object_id FROM object_cache_status \
             WHERE NOT ready AND object_id = ANY($1) ORDER BY object_id"
        };
        let raw: Vec<String> = sqlx::query_scalar(sql)
            .bind(id_strings(&sorted_unique(ids)))
            .fetch_all(&mut *self.tx)
            .await?;
        parse_ids(raw)
    }

    async fn lock_entries(&mut self, ids: &[ObjectId]) -> MetadataResult<Vec<CacheEntryRow>> {
        let rows = sqlx::query_as::<_, CacheEntryRow>(&format!(
            "SELECT {CACHE_ENTRY_COLUMNS} FROM object_cache_status \
             WHERE object_id = ANY($1) ORDER BY object_id FOR UPDATE"
        ))
        .bind(id_strings(&sorted_unique(ids)))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn cache_entries(&mut self, ids: &[ObjectId]) -> MetadataResult<Vec<CacheEntryRow>> {
        let rows = sqlx::query_as::<_, CacheEntryRow>(&format!(
            "SELECT {CACHE_ENTRY_COLUMNS} FROM object_cache_status \
             WHERE object_id = ANY($1) ORDER BY object_id"
        ))
        .bind(id_strings(&sorted_unique(ids)))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn set_ready(&mut self, ids: &[ObjectId], ready: bool) -> MetadataResult<()> {
        sqlx::query("UPDATE object_cache_status SET ready = $1 WHERE object_id = ANY($2)")
            .bind(ready)
            .bind(id_strings(&sorted_unique(ids)))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn release(&mut self, ids: &[ObjectId]) -> MetadataResult<()> {
        sqlx::query(
            r#"
            WITH locked AS (
                SELECT object_id FROM object_cache_status
                WHERE object_id = ANY($1) AND refcount > 0
                ORDER BY object_id
                FOR UPDATE
            )
            UPDATE object_cache_status c
            SET refcount = c.refcount - 1
            FROM locked
            WHERE c.object_id = locked.object_id AND c.refcount > 0
            "#,
        )
        .bind(id_strings(&sorted_unique(ids)))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_entries(&mut self, ids: &[ObjectId]) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM object_cache_status WHERE object_id = ANY($1)")
            .bind(id_strings(&sorted_unique(ids)))
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
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
        sqlx::query("UPDATE object_cache_occupancy SET total_size = total_size + $1 WHERE id = 1")
            .bind(delta)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn set_occupancy(&mut self, total: i64) -> MetadataResult<()> {
        sqlx::query("UPDATE object_cache_occupancy SET total_size = $1 WHERE id = 1")
            .bind(total)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn object_sizes(&mut self, ids: &[ObjectId]) -> MetadataResult<HashMap<ObjectId, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT object_id, size_bytes FROM objects WHERE object_id = ANY($1)")
                .bind(id_strings(&sorted_unique(ids)))
                .fetch_all(&mut *self.tx)
                .await?;
        rows.into_iter()
            .map(|(id, size)| Ok((ObjectId::new(id)?, size_from_db(size))))
            .collect()
    }

    async fn external_locations(
        &mut self,
        ids: &[ObjectId],
    ) -> MetadataResult<Vec<ObjectLocation>> {
        let rows = sqlx::query_as::<_, LocationRow>(
            "SELECT object_id, location, protocol FROM object_locations \
             WHERE object_id = ANY($1) ORDER BY object_id, protocol",
        )
        .bind(id_strings(&sorted_unique(ids)))
        .fetch_all(&mut *self.tx)
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
        let ids = id_strings(&sorted_unique(ids));
        let mut removed = sqlx::query("DELETE FROM object_locations WHERE object_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        removed += sqlx::query("DELETE FROM objects WHERE object_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        if include_cache_status {
            removed += sqlx::query("DELETE FROM object_cache_status WHERE object_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *self.tx)
                .await?
                .rows_affected();
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
