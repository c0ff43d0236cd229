//! SQLite-backed metadata store.
//!
//! All carfile/cache/block tables are partitioned by area: the table name
//! carries the normalized area suffix, so one database can serve several
//! areas side by side. The `node` table is deployment-wide.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::nodes::NodeAuth;
use crate::repos::{
    BlockRepo, CacheRepo, CarfileRepo, DownloadRepo, NodeRepo, QuitNodeOutcome,
};
use async_trait::async_trait;
use courier_core::CacheStatus;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    CarfileRepo + CacheRepo + BlockRepo + NodeRepo + DownloadRepo + Send + Sync
{
    /// Create the per-area schema.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// Normalize an area name into a table suffix: lowercased, dashes become
/// underscores. Anything else non-alphanumeric is rejected since the
/// suffix is interpolated into SQL identifiers.
pub fn area_suffix(area: &str) -> MetadataResult<String> {
    let suffix = area.to_lowercase().replace('-', "_");
    if suffix.is_empty()
        || !suffix
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(MetadataError::InvalidArea(area.to_string()));
    }
    Ok(suffix)
}

/// SQLite-based metadata store for one area.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    data_table: String,
    cache_table: String,
    block_table: String,
    download_table: String,
}

impl SqliteStore {
    /// Open (creating if missing) the store at `path` for `area`.
    pub async fn new(path: impl AsRef<Path>, area: &str) -> MetadataResult<Self> {
        let suffix = area_suffix(area)?;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // SQLite permits limited write concurrency; a single connection
        // avoids "database is locked" failures under concurrent handlers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            data_table: format!("data_info_{suffix}"),
            cache_table: format!("cache_info_{suffix}"),
            block_table: format!("block_info_{suffix}"),
            download_table: format!("block_download_info_{suffix}"),
        };
        store.migrate().await?;

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
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    carfile_hash TEXT PRIMARY KEY,
                    carfile_cid TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    need_reliability INTEGER NOT NULL DEFAULT 0,
                    reliability INTEGER NOT NULL DEFAULT 0,
                    total_size INTEGER NOT NULL DEFAULT 0,
                    total_blocks INTEGER NOT NULL DEFAULT 0,
                    cache_count INTEGER NOT NULL DEFAULT 0,
                    nodes INTEGER NOT NULL DEFAULT 0,
                    expired_time TEXT NOT NULL,
                    end_time TEXT
                )",
                self.data_table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    cache_id TEXT PRIMARY KEY,
                    carfile_hash TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    is_root INTEGER NOT NULL DEFAULT 0,
                    done_size INTEGER NOT NULL DEFAULT 0,
                    done_blocks INTEGER NOT NULL DEFAULT 0,
                    total_size INTEGER NOT NULL DEFAULT 0,
                    total_blocks INTEGER NOT NULL DEFAULT 0,
                    reliability INTEGER NOT NULL DEFAULT 0,
                    nodes INTEGER NOT NULL DEFAULT 0,
                    expired_time TEXT NOT NULL,
                    end_time TEXT
                )",
                self.cache_table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_carfile ON {0} (carfile_hash)",
                self.cache_table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    cache_id TEXT NOT NULL,
                    carfile_hash TEXT NOT NULL,
                    cid TEXT NOT NULL,
                    cid_hash TEXT NOT NULL,
                    device_id TEXT NOT NULL DEFAULT '',
                    fid INTEGER NOT NULL DEFAULT 0,
                    size INTEGER NOT NULL DEFAULT 0,
                    reliability INTEGER NOT NULL DEFAULT 0,
                    source TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL DEFAULT 'pending',
                    end_time TEXT
                )",
                self.block_table
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS uq_{0}_cache_cid ON {0} (cache_id, cid_hash)",
                self.block_table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_device ON {0} (device_id)",
                self.block_table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_cid_hash ON {0} (cid_hash)",
                self.block_table
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    device_id TEXT NOT NULL,
                    block_cid TEXT NOT NULL,
                    carfile_cid TEXT NOT NULL,
                    block_size INTEGER NOT NULL DEFAULT 0,
                    speed INTEGER NOT NULL DEFAULT 0,
                    reward INTEGER NOT NULL DEFAULT 0,
                    status INTEGER NOT NULL DEFAULT 0,
                    failed_reason TEXT NOT NULL DEFAULT '',
                    client_ip TEXT NOT NULL DEFAULT '',
                    created_time TEXT NOT NULL,
                    complete_time TEXT
                )",
                self.download_table
            ),
            "CREATE TABLE IF NOT EXISTS node (
                device_id TEXT PRIMARY KEY,
                last_time TEXT NOT NULL,
                geo TEXT NOT NULL DEFAULT '',
                node_type TEXT NOT NULL,
                is_online INTEGER NOT NULL DEFAULT 0,
                address TEXT NOT NULL DEFAULT '',
                server_name TEXT NOT NULL DEFAULT '',
                private_key TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                quitted INTEGER NOT NULL DEFAULT 0
            )"
            .to_string(),
        ];

        for statement in statements {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CarfileRepo for SqliteStore {
    async fn set_carfile_info(&self, info: &CarfileRow) -> MetadataResult<()> {
        let existing = self.get_carfile_info(&info.carfile_hash).await?;

        if existing.is_none() {
            let sql = format!(
                "INSERT INTO {} (carfile_hash, carfile_cid, status, need_reliability, reliability,
                     total_size, total_blocks, cache_count, nodes, expired_time)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                self.data_table
            );
            sqlx::query(&sql)
                .bind(&info.carfile_hash)
                .bind(&info.carfile_cid)
                .bind(&info.status)
                .bind(info.need_reliability)
                .bind(info.reliability)
                .bind(info.total_size)
                .bind(info.total_blocks)
                .bind(info.cache_count)
                .bind(info.nodes)
                .bind(info.expired_time)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        let sql = format!(
            "UPDATE {} SET expired_time = ?, status = ?, total_size = ?, reliability = ?,
                 cache_count = ?, total_blocks = ?, need_reliability = ?
             WHERE carfile_hash = ?",
            self.data_table
        );
        sqlx::query(&sql)
            .bind(info.expired_time)
            .bind(&info.status)
            .bind(info.total_size)
            .bind(info.reliability)
            .bind(info.cache_count)
            .bind(info.total_blocks)
            .bind(info.need_reliability)
            .bind(&info.carfile_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_carfile_info(&self, carfile_hash: &str) -> MetadataResult<Option<CarfileRow>> {
        let sql = format!("SELECT * FROM {} WHERE carfile_hash = ?", self.data_table);
        let row = sqlx::query_as::<_, CarfileRow>(&sql)
            .bind(carfile_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_carfiles(&self, limit: u32) -> MetadataResult<Vec<CarfileRow>> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY expired_time DESC LIMIT ?",
            self.data_table
        );
        let rows = sqlx::query_as::<_, CarfileRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn remove_cache_and_update_data(
        &self,
        cache_id: &str,
        carfile_hash: &str,
        delete_data: bool,
        reliability: i64,
    ) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("DELETE FROM {} WHERE cache_id = ?", self.cache_table);
        sqlx::query(&sql).bind(cache_id).execute(&mut *tx).await?;

        if delete_data {
            let sql = format!("DELETE FROM {} WHERE carfile_hash = ?", self.data_table);
            sqlx::query(&sql)
                .bind(carfile_hash)
                .execute(&mut *tx)
                .await?;
        } else {
            let sql = format!(
                "UPDATE {} SET reliability = ? WHERE carfile_hash = ?",
                self.data_table
            );
            sqlx::query(&sql)
                .bind(reliability)
                .bind(carfile_hash)
                .execute(&mut *tx)
                .await?;
        }

        let sql = format!("DELETE FROM {} WHERE cache_id = ?", self.block_table);
        sqlx::query(&sql).bind(cache_id).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CacheRepo for SqliteStore {
    async fn create_cache(&self, cache: &CacheRow, root_block: &BlockRow) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "INSERT INTO {} (cache_id, carfile_hash, status, is_root, done_size, done_blocks,
                 total_size, total_blocks, reliability, nodes, expired_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.cache_table
        );
        sqlx::query(&sql)
            .bind(&cache.cache_id)
            .bind(&cache.carfile_hash)
            .bind(&cache.status)
            .bind(cache.is_root)
            .bind(cache.done_size)
            .bind(cache.done_blocks)
            .bind(cache.total_size)
            .bind(cache.total_blocks)
            .bind(cache.reliability)
            .bind(cache.nodes)
            .bind(cache.expired_time)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "INSERT INTO {} (id, cache_id, carfile_hash, cid, cid_hash, device_id, fid,
                 size, reliability, source, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.block_table
        );
        sqlx::query(&sql)
            .bind(&root_block.id)
            .bind(&root_block.cache_id)
            .bind(&root_block.carfile_hash)
            .bind(&root_block.cid)
            .bind(&root_block.cid_hash)
            .bind(&root_block.device_id)
            .bind(root_block.fid)
            .bind(root_block.size)
            .bind(root_block.reliability)
            .bind(&root_block.source)
            .bind(&root_block.status)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn save_cacheing_results(
        &self,
        data: Option<&CarfileRow>,
        cache: Option<&CacheRow>,
        block_result: Option<&BlockRow>,
        create_blocks: &[BlockRow],
    ) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(data) = data {
            let sql = format!(
                "UPDATE {} SET total_size = ?, reliability = ?, cache_count = ?, total_blocks = ?
                 WHERE carfile_hash = ?",
                self.data_table
            );
            sqlx::query(&sql)
                .bind(data.total_size)
                .bind(data.reliability)
                .bind(data.cache_count)
                .bind(data.total_blocks)
                .bind(&data.carfile_hash)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(cache) = cache {
            let sql = format!(
                "UPDATE {} SET done_size = ?, done_blocks = ?, reliability = ?, status = ?,
                     total_size = ?, total_blocks = ?
                 WHERE cache_id = ?",
                self.cache_table
            );
            sqlx::query(&sql)
                .bind(cache.done_size)
                .bind(cache.done_blocks)
                .bind(cache.reliability)
                .bind(&cache.status)
                .bind(cache.total_size)
                .bind(cache.total_blocks)
                .bind(&cache.cache_id)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(block) = block_result {
            let sql = format!(
                "UPDATE {} SET status = ?, size = ?, reliability = ?, device_id = ?, end_time = ?
                 WHERE id = ?",
                self.block_table
            );
            sqlx::query(&sql)
                .bind(&block.status)
                .bind(block.size)
                .bind(block.reliability)
                .bind(&block.device_id)
                .bind(OffsetDateTime::now_utc())
                .bind(&block.id)
                .execute(&mut *tx)
                .await?;
        }

        // Newly planned blocks insert; a restore re-plan hits the existing
        // (cache_id, cid_hash) row and refreshes its assignment instead.
        for block in create_blocks {
            let sql = format!(
                "INSERT INTO {} (id, cache_id, carfile_hash, cid, cid_hash, device_id, fid,
                     size, reliability, source, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(cache_id, cid_hash) DO UPDATE SET
                     device_id = excluded.device_id,
                     fid = excluded.fid,
                     size = excluded.size,
                     reliability = excluded.reliability,
                     source = excluded.source,
                     status = excluded.status",
                self.block_table
            );
            sqlx::query(&sql)
                .bind(&block.id)
                .bind(&block.cache_id)
                .bind(&block.carfile_hash)
                .bind(&block.cid)
                .bind(&block.cid_hash)
                .bind(&block.device_id)
                .bind(block.fid)
                .bind(block.size)
                .bind(block.reliability)
                .bind(&block.source)
                .bind(&block.status)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_cache_end_results(
        &self,
        data: &CarfileRow,
        cache: &CacheRow,
    ) -> MetadataResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT COALESCE(SUM(size), 0), COUNT(size) FROM {} WHERE cache_id = ? AND status = ?",
            self.block_table
        );
        let (done_size, done_blocks): (i64, i64) = sqlx::query_as(&sql)
            .bind(&cache.cache_id)
            .bind(CacheStatus::Success.as_str())
            .fetch_one(&mut *tx)
            .await?;

        let sql = format!(
            "UPDATE {} SET total_size = ?, reliability = ?, cache_count = ?, total_blocks = ?,
                 nodes = ?, end_time = ?
             WHERE carfile_hash = ?",
            self.data_table
        );
        sqlx::query(&sql)
            .bind(data.total_size)
            .bind(data.reliability)
            .bind(data.cache_count)
            .bind(data.total_blocks)
            .bind(data.nodes)
            .bind(now)
            .bind(&data.carfile_hash)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "UPDATE {} SET done_size = ?, done_blocks = ?, reliability = ?, status = ?,
                 total_size = ?, total_blocks = ?, nodes = ?, end_time = ?
             WHERE cache_id = ?",
            self.cache_table
        );
        sqlx::query(&sql)
            .bind(done_size)
            .bind(done_blocks)
            .bind(cache.reliability)
            .bind(&cache.status)
            .bind(cache.total_size)
            .bind(cache.total_blocks)
            .bind(cache.nodes)
            .bind(now)
            .bind(&cache.cache_id)
            .execute(&mut *tx)
            .await?;

        if cache.status == CacheStatus::Timeout.as_str() {
            let sql = format!(
                "UPDATE {} SET status = ?, end_time = ? WHERE cache_id = ? AND status IN (?, ?)",
                self.block_table
            );
            sqlx::query(&sql)
                .bind(CacheStatus::Timeout.as_str())
                .bind(now)
                .bind(&cache.cache_id)
                .bind(CacheStatus::Pending.as_str())
                .bind(CacheStatus::Running.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_cache_info(&self, cache_id: &str) -> MetadataResult<Option<CacheRow>> {
        let sql = format!("SELECT * FROM {} WHERE cache_id = ?", self.cache_table);
        let row = sqlx::query_as::<_, CacheRow>(&sql)
            .bind(cache_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_caches_of_carfile(&self, carfile_hash: &str) -> MetadataResult<Vec<CacheRow>> {
        let sql = format!(
            "SELECT * FROM {} WHERE carfile_hash = ? ORDER BY cache_id",
            self.cache_table
        );
        let rows = sqlx::query_as::<_, CacheRow>(&sql)
            .bind(carfile_hash)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn get_expired_caches(&self) -> MetadataResult<Vec<CacheRow>> {
        let sql = format!("SELECT * FROM {} WHERE expired_time <= ?", self.cache_table);
        let rows = sqlx::query_as::<_, CacheRow>(&sql)
            .bind(OffsetDateTime::now_utc())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn reset_cache_expiry(
        &self,
        carfile_hash: &str,
        cache_id: Option<&str>,
        expired_time: OffsetDateTime,
    ) -> MetadataResult<()> {
        match cache_id {
            Some(cache_id) => {
                let sql = format!(
                    "UPDATE {} SET expired_time = ? WHERE carfile_hash = ? AND cache_id = ?",
                    self.cache_table
                );
                sqlx::query(&sql)
                    .bind(expired_time)
                    .bind(carfile_hash)
                    .bind(cache_id)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                let sql = format!(
                    "UPDATE {} SET expired_time = ? WHERE carfile_hash = ?",
                    self.cache_table
                );
                sqlx::query(&sql)
                    .bind(expired_time)
                    .bind(carfile_hash)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn extend_cache_expiry(
        &self,
        carfile_hash: &str,
        cache_id: Option<&str>,
        hours: i64,
    ) -> MetadataResult<()> {
        let caches = self.get_caches_of_carfile(carfile_hash).await?;
        let extension = time::Duration::hours(hours);

        let mut tx = self.pool.begin().await?;
        for cache in caches {
            if cache_id.is_some_and(|id| id != cache.cache_id) {
                continue;
            }
            let sql = format!(
                "UPDATE {} SET expired_time = ? WHERE cache_id = ?",
                self.cache_table
            );
            sqlx::query(&sql)
                .bind(cache.expired_time + extension)
                .bind(&cache.cache_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_min_cache_expiry(&self) -> MetadataResult<Option<OffsetDateTime>> {
        let sql = format!("SELECT MIN(expired_time) FROM {}", self.cache_table);
        let min: Option<OffsetDateTime> = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(min)
    }

    async fn update_cache_info_of_quit_node(
        &self,
        device_id: &str,
    ) -> MetadataResult<QuitNodeOutcome> {
        let sql = format!(
            "SELECT * FROM {} WHERE status = ? AND cache_id IN
                 (SELECT DISTINCT cache_id FROM {} WHERE device_id = ? AND status = ?)",
            self.cache_table, self.block_table
        );
        let caches = sqlx::query_as::<_, CacheRow>(&sql)
            .bind(CacheStatus::Success.as_str())
            .bind(device_id)
            .bind(CacheStatus::Success.as_str())
            .fetch_all(&self.pool)
            .await?;

        if caches.is_empty() {
            return Err(MetadataError::NotFound(format!(
                "no successful caches on device {device_id}"
            )));
        }

        let mut outcome = QuitNodeOutcome {
            cache_count: caches.len(),
            lost_reliability: HashMap::new(),
        };
        for cache in &caches {
            *outcome
                .lost_reliability
                .entry(cache.carfile_hash.clone())
                .or_insert(0) += cache.reliability;
        }

        let mut tx = self.pool.begin().await?;

        let placeholders: Vec<&str> = caches.iter().map(|_| "?").collect();
        let sql = format!(
            "UPDATE {} SET status = ? WHERE cache_id IN ({})",
            self.cache_table,
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql).bind(CacheStatus::Restore.as_str());
        for cache in &caches {
            query = query.bind(&cache.cache_id);
        }
        query.execute(&mut *tx).await?;

        let sql = format!(
            "UPDATE {} SET status = ? WHERE device_id = ? AND status = ?",
            self.block_table
        );
        sqlx::query(&sql)
            .bind(CacheStatus::Restore.as_str())
            .bind(device_id)
            .bind(CacheStatus::Success.as_str())
            .execute(&mut *tx)
            .await?;

        for (carfile_hash, reliability) in &outcome.lost_reliability {
            let sql = format!(
                "UPDATE {} SET reliability = reliability - ? WHERE carfile_hash = ?",
                self.data_table
            );
            sqlx::query(&sql)
                .bind(reliability)
                .bind(carfile_hash)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }
}

#[async_trait]
impl BlockRepo for SqliteStore {
    async fn get_block_info(
        &self,
        cache_id: &str,
        cid_hash: &str,
    ) -> MetadataResult<Option<BlockRow>> {
        let sql = format!(
            "SELECT * FROM {} WHERE cache_id = ? AND cid_hash = ?",
            self.block_table
        );
        let row = sqlx::query_as::<_, BlockRow>(&sql)
            .bind(cache_id)
            .bind(cid_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_undone_blocks(&self, cache_id: &str) -> MetadataResult<HashMap<String, String>> {
        let sql = format!(
            "SELECT cid, id FROM {} WHERE cache_id = ? AND status != ?",
            self.block_table
        );
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .bind(cache_id)
            .bind(CacheStatus::Success.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn get_blocks_with_hash(
        &self,
        cid_hash: &str,
    ) -> MetadataResult<HashMap<String, BlockRow>> {
        let sql = format!(
            "SELECT * FROM {} WHERE cid_hash = ? AND status = ?",
            self.block_table
        );
        let rows = sqlx::query_as::<_, BlockRow>(&sql)
            .bind(cid_hash)
            .bind(CacheStatus::Success.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.carfile_hash.clone(), row))
            .collect())
    }

    async fn get_blocks_with_status(
        &self,
        cache_id: &str,
        status: &str,
    ) -> MetadataResult<Vec<BlockRow>> {
        let sql = format!(
            "SELECT * FROM {} WHERE cache_id = ? AND status = ?",
            self.block_table
        );
        let rows = sqlx::query_as::<_, BlockRow>(&sql)
            .bind(cache_id)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn get_block_count_with_status(
        &self,
        cache_id: &str,
        status: &str,
    ) -> MetadataResult<i64> {
        let sql = format!(
            "SELECT COUNT(id) FROM {} WHERE cache_id = ? AND status = ?",
            self.block_table
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(cache_id)
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn get_nodes_from_data_cache(
        &self,
        carfile_hash: &str,
        cache_id: &str,
    ) -> MetadataResult<(Vec<String>, Vec<String>)> {
        let sql = format!(
            "SELECT DISTINCT device_id FROM {} WHERE carfile_hash = ? AND status = ? AND device_id != ''",
            self.block_table
        );
        let data_nodes: Vec<String> = sqlx::query_scalar(&sql)
            .bind(carfile_hash)
            .bind(CacheStatus::Success.as_str())
            .fetch_all(&self.pool)
            .await?;

        let sql = format!(
            "SELECT DISTINCT device_id FROM {} WHERE cache_id = ? AND status = ? AND device_id != ''",
            self.block_table
        );
        let cache_nodes: Vec<String> = sqlx::query_scalar(&sql)
            .bind(cache_id)
            .bind(CacheStatus::Success.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok((data_nodes, cache_nodes))
    }

    async fn get_nodes_with_block(
        &self,
        cid_hash: &str,
        success_only: bool,
    ) -> MetadataResult<Vec<String>> {
        let rows: Vec<String> = if success_only {
            let sql = format!(
                "SELECT device_id FROM {} WHERE cid_hash = ? AND status = ?",
                self.block_table
            );
            sqlx::query_scalar(&sql)
                .bind(cid_hash)
                .bind(CacheStatus::Success.as_str())
                .fetch_all(&self.pool)
                .await?
        } else {
            let sql = format!("SELECT device_id FROM {} WHERE cid_hash = ?", self.block_table);
            sqlx::query_scalar(&sql)
                .bind(cid_hash)
                .fetch_all(&self.pool)
                .await?
        };
        Ok(rows)
    }

    async fn get_device_block_count(&self, device_id: &str) -> MetadataResult<i64> {
        let sql = format!(
            "SELECT COUNT(id) FROM {} WHERE device_id = ? AND status = ?",
            self.block_table
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(device_id)
            .bind(CacheStatus::Success.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn get_blocks_fid(&self, device_id: &str) -> MetadataResult<BTreeMap<i64, String>> {
        let sql = format!(
            "SELECT fid, cid FROM {} WHERE device_id = ? AND status = ? AND fid > 0",
            self.block_table
        );
        let rows: Vec<(i64, String)> = sqlx::query_as(&sql)
            .bind(device_id)
            .bind(CacheStatus::Success.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn get_blocks_in_fid_range(
        &self,
        device_id: &str,
        start_fid: i64,
        end_fid: i64,
    ) -> MetadataResult<BTreeMap<i64, String>> {
        let sql = format!(
            "SELECT fid, cid FROM {} WHERE device_id = ? AND status = ? AND fid BETWEEN ? AND ?",
            self.block_table
        );
        let rows: Vec<(i64, String)> = sqlx::query_as(&sql)
            .bind(device_id)
            .bind(CacheStatus::Success.as_str())
            .bind(start_fid)
            .bind(end_fid)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn delete_block_records(
        &self,
        device_id: &str,
        cid_hashes: &[String],
    ) -> MetadataResult<HashMap<String, String>> {
        let mut refused = HashMap::new();
        let mut tx = self.pool.begin().await?;

        for cid_hash in cid_hashes {
            let sql = format!(
                "SELECT COUNT(id) FROM {} WHERE device_id = ? AND cid_hash = ? AND status = ?",
                self.block_table
            );
            let success_count: i64 = sqlx::query_scalar(&sql)
                .bind(device_id)
                .bind(cid_hash)
                .bind(CacheStatus::Success.as_str())
                .fetch_one(&mut *tx)
                .await?;

            if success_count > 0 {
                refused.insert(
                    cid_hash.clone(),
                    "block backs a successful cache".to_string(),
                );
                continue;
            }

            let sql = format!(
                "DELETE FROM {} WHERE device_id = ? AND cid_hash = ?",
                self.block_table
            );
            sqlx::query(&sql)
                .bind(device_id)
                .bind(cid_hash)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(refused)
    }
}

#[async_trait]
impl NodeRepo for SqliteStore {
    async fn set_node_info(&self, info: &NodeRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO node (device_id, last_time, geo, node_type, is_online, address,
                 server_name, private_key, url, quitted)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(device_id) DO UPDATE SET
                 last_time = excluded.last_time,
                 geo = excluded.geo,
                 is_online = excluded.is_online,
                 address = excluded.address,
                 server_name = excluded.server_name,
                 url = excluded.url,
                 quitted = excluded.quitted",
        )
        .bind(&info.device_id)
        .bind(info.last_time)
        .bind(&info.geo)
        .bind(&info.node_type)
        .bind(info.is_online)
        .bind(&info.address)
        .bind(&info.server_name)
        .bind(&info.private_key)
        .bind(&info.url)
        .bind(info.quitted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, device_id: &str) -> MetadataResult<Option<NodeRow>> {
        let row = sqlx::query_as::<_, NodeRow>("SELECT * FROM node WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn set_node_offline(
        &self,
        device_id: &str,
        last_time: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE node SET last_time = ?, is_online = 0 WHERE device_id = ?")
            .bind(last_time)
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_all_nodes_offline(&self, server_name: &str) -> MetadataResult<()> {
        sqlx::query("UPDATE node SET is_online = 0 WHERE server_name = ?")
            .bind(server_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_offline_nodes(&self, server_name: &str) -> MetadataResult<Vec<NodeRow>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            "SELECT * FROM node WHERE quitted = 0 AND is_online = 0 AND server_name = ?",
        )
        .bind(server_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_nodes_quit(&self, device_ids: &[String]) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        for device_id in device_ids {
            sqlx::query("UPDATE node SET quitted = 1 WHERE device_id = ?")
                .bind(device_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_node_auth(&self, device_id: &str) -> MetadataResult<NodeAuth> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT url, private_key FROM node WHERE device_id = ?")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await?;

        let (url, private_key) =
            row.ok_or_else(|| MetadataError::NotFound(format!("node {device_id}")))?;
        Ok(NodeAuth {
            device_id: device_id.to_string(),
            url,
            private_key,
        })
    }
}

#[async_trait]
impl DownloadRepo for SqliteStore {
    async fn save_block_download_info(&self, info: &DownloadRow) -> MetadataResult<()> {
        let sql = format!(
            "INSERT INTO {} (id, device_id, block_cid, carfile_cid, block_size, speed, reward,
                 status, failed_reason, client_ip, created_time, complete_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 device_id = excluded.device_id,
                 speed = excluded.speed,
                 reward = excluded.reward,
                 status = excluded.status,
                 failed_reason = excluded.failed_reason,
                 complete_time = excluded.complete_time",
            self.download_table
        );
        sqlx::query(&sql)
            .bind(&info.id)
            .bind(&info.device_id)
            .bind(&info.block_cid)
            .bind(&info.carfile_cid)
            .bind(info.block_size)
            .bind(info.speed)
            .bind(info.reward)
            .bind(info.status)
            .bind(&info.failed_reason)
            .bind(&info.client_ip)
            .bind(info.created_time)
            .bind(info.complete_time)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_block_download_infos(&self, device_id: &str) -> MetadataResult<Vec<DownloadRow>> {
        let since = OffsetDateTime::now_utc() - time::Duration::days(1);
        let sql = format!(
            "SELECT * FROM {} WHERE device_id = ? AND created_time >= ? ORDER BY created_time DESC",
            self.download_table
        );
        let rows = sqlx::query_as::<_, DownloadRow>(&sql)
            .bind(device_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn get_block_download_info_by_id(
        &self,
        id: &str,
    ) -> MetadataResult<Option<DownloadRow>> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", self.download_table);
        let row = sqlx::query_as::<_, DownloadRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn carfile_row(hash: &str) -> CarfileRow {
        CarfileRow {
            carfile_hash: hash.to_string(),
            carfile_cid: format!("cid-{hash}"),
            status: CacheStatus::Running.as_str().to_string(),
            need_reliability: 1,
            reliability: 0,
            total_size: 0,
            total_blocks: 1,
            cache_count: 0,
            nodes: 0,
            expired_time: OffsetDateTime::now_utc() + time::Duration::hours(1),
            end_time: None,
        }
    }

    fn cache_row(cache_id: &str, hash: &str, is_root: bool) -> CacheRow {
        CacheRow {
            cache_id: cache_id.to_string(),
            carfile_hash: hash.to_string(),
            status: CacheStatus::Running.as_str().to_string(),
            is_root,
            done_size: 0,
            done_blocks: 0,
            total_size: 0,
            total_blocks: 1,
            reliability: 0,
            nodes: 0,
            expired_time: OffsetDateTime::now_utc() + time::Duration::hours(1),
            end_time: None,
        }
    }

    fn block_row(id: &str, cache_id: &str, hash: &str, cid_hash: &str, device: &str) -> BlockRow {
        BlockRow {
            id: id.to_string(),
            cache_id: cache_id.to_string(),
            carfile_hash: hash.to_string(),
            cid: format!("cid-{cid_hash}"),
            cid_hash: cid_hash.to_string(),
            device_id: device.to_string(),
            fid: 1,
            size: 0,
            reliability: 0,
            source: String::new(),
            status: CacheStatus::Pending.as_str().to_string(),
            end_time: None,
        }
    }

    async fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let temp = tempdir().unwrap();
        let store = SqliteStore::new(temp.path().join("meta.db"), "cn-gd-test")
            .await
            .unwrap();
        (temp, store)
    }

    #[test]
    fn test_area_suffix_normalization() {
        assert_eq!(area_suffix("CN-GD-Shenzhen").unwrap(), "cn_gd_shenzhen");
        assert!(area_suffix("bad area!").is_err());
        assert!(area_suffix("").is_err());
    }

    #[tokio::test]
    async fn test_carfile_upsert_round_trip() {
        let (_temp, store) = open_store().await;

        let mut info = carfile_row("aa11");
        store.set_carfile_info(&info).await.unwrap();

        info.need_reliability = 3;
        store.set_carfile_info(&info).await.unwrap();

        let row = store.get_carfile_info("aa11").await.unwrap().unwrap();
        assert_eq!(row.need_reliability, 3);
        assert_eq!(row.carfile_cid, "cid-aa11");
    }

    #[tokio::test]
    async fn test_block_rows_unique_per_cache_and_cid() {
        let (_temp, store) = open_store().await;
        store.set_carfile_info(&carfile_row("aa11")).await.unwrap();
        store
            .create_cache(
                &cache_row("aa11_1", "aa11", true),
                &block_row("b-root", "aa11_1", "aa11", "aa11", ""),
            )
            .await
            .unwrap();

        // same (cache_id, cid_hash) planned again: refreshes, no duplicate
        let replanned = block_row("b-root-2", "aa11_1", "aa11", "aa11", "e1");
        store
            .save_cacheing_results(None, None, None, &[replanned])
            .await
            .unwrap();

        let count = store
            .get_block_count_with_status("aa11_1", CacheStatus::Pending.as_str())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let row = store.get_block_info("aa11_1", "aa11").await.unwrap().unwrap();
        assert_eq!(row.id, "b-root");
        assert_eq!(row.device_id, "e1");
    }

    #[tokio::test]
    async fn test_undone_blocks_excludes_success_only() {
        let (_temp, store) = open_store().await;
        store.set_carfile_info(&carfile_row("aa11")).await.unwrap();
        store
            .create_cache(
                &cache_row("aa11_1", "aa11", true),
                &block_row("b-root", "aa11_1", "aa11", "aa11", "e1"),
            )
            .await
            .unwrap();
        store
            .save_cacheing_results(
                None,
                None,
                None,
                &[
                    block_row("b-c1", "aa11_1", "aa11", "cc01", "e1"),
                    block_row("b-c2", "aa11_1", "aa11", "cc02", "e1"),
                ],
            )
            .await
            .unwrap();

        let mut done = block_row("b-c1", "aa11_1", "aa11", "cc01", "e1");
        done.status = CacheStatus::Success.as_str().to_string();
        done.size = 5;
        store
            .save_cacheing_results(None, None, Some(&done), &[])
            .await
            .unwrap();

        let undone = store.get_undone_blocks("aa11_1").await.unwrap();
        assert_eq!(undone.len(), 2);
        assert!(undone.contains_key("cid-aa11"));
        assert!(undone.contains_key("cid-cc02"));
        assert!(!undone.contains_key("cid-cc01"));
    }

    #[tokio::test]
    async fn test_cache_end_timeout_stamps_pending_blocks() {
        let (_temp, store) = open_store().await;
        store.set_carfile_info(&carfile_row("aa11")).await.unwrap();
        store
            .create_cache(
                &cache_row("aa11_1", "aa11", true),
                &block_row("b-root", "aa11_1", "aa11", "aa11", "e1"),
            )
            .await
            .unwrap();

        let mut done = block_row("b-root", "aa11_1", "aa11", "aa11", "e1");
        done.status = CacheStatus::Success.as_str().to_string();
        done.size = 9;
        store
            .save_cacheing_results(
                None,
                None,
                Some(&done),
                &[block_row("b-c1", "aa11_1", "aa11", "cc01", "e1")],
            )
            .await
            .unwrap();

        let mut cache = cache_row("aa11_1", "aa11", true);
        cache.status = CacheStatus::Timeout.as_str().to_string();
        store
            .save_cache_end_results(&carfile_row("aa11"), &cache)
            .await
            .unwrap();

        let timed_out = store
            .get_blocks_with_status("aa11_1", CacheStatus::Timeout.as_str())
            .await
            .unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].cid_hash, "cc01");
        assert!(timed_out[0].end_time.is_some());

        // aggregated from actual block rows
        let row = store.get_cache_info("aa11_1").await.unwrap().unwrap();
        assert_eq!(row.done_blocks, 1);
        assert_eq!(row.done_size, 9);
        assert!(row.end_time.is_some());
    }

    #[tokio::test]
    async fn test_quit_node_flips_to_restore_and_drops_reliability() {
        let (_temp, store) = open_store().await;
        let mut data = carfile_row("aa11");
        data.reliability = 1;
        store.set_carfile_info(&data).await.unwrap();

        let mut cache = cache_row("aa11_1", "aa11", true);
        cache.status = CacheStatus::Success.as_str().to_string();
        cache.reliability = 1;
        let mut root = block_row("b-root", "aa11_1", "aa11", "aa11", "e1");
        root.status = CacheStatus::Success.as_str().to_string();
        store.create_cache(&cache, &root).await.unwrap();

        let outcome = store.update_cache_info_of_quit_node("e1").await.unwrap();
        assert_eq!(outcome.cache_count, 1);
        assert_eq!(outcome.lost_reliability.get("aa11"), Some(&1));

        let cache = store.get_cache_info("aa11_1").await.unwrap().unwrap();
        assert_eq!(cache.status, CacheStatus::Restore.as_str());
        let data = store.get_carfile_info("aa11").await.unwrap().unwrap();
        assert_eq!(data.reliability, 0);

        // unknown device has nothing to repair
        let err = store.update_cache_info_of_quit_node("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_blocks_with_hash_seeds_peer_copies() {
        let (_temp, store) = open_store().await;
        store.set_carfile_info(&carfile_row("aa11")).await.unwrap();
        let mut root = block_row("b-root", "aa11_1", "aa11", "aa11", "c1");
        root.status = CacheStatus::Success.as_str().to_string();
        store
            .create_cache(&cache_row("aa11_1", "aa11", true), &root)
            .await
            .unwrap();

        let found = store.get_blocks_with_hash("aa11").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get("aa11").unwrap().device_id, "c1");

        assert!(store.get_blocks_with_hash("none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_block_records_refuses_success_rows() {
        let (_temp, store) = open_store().await;
        store.set_carfile_info(&carfile_row("aa11")).await.unwrap();
        let mut root = block_row("b-root", "aa11_1", "aa11", "aa11", "e1");
        root.status = CacheStatus::Success.as_str().to_string();
        store
            .create_cache(&cache_row("aa11_1", "aa11", true), &root)
            .await
            .unwrap();
        store
            .save_cacheing_results(
                None,
                None,
                None,
                &[block_row("b-c1", "aa11_1", "aa11", "cc01", "e1")],
            )
            .await
            .unwrap();

        let refused = store
            .delete_block_records("e1", &["aa11".to_string(), "cc01".to_string()])
            .await
            .unwrap();
        assert!(refused.contains_key("aa11"));
        assert!(!refused.contains_key("cc01"));
        assert!(store.get_block_info("aa11_1", "cc01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fid_queries_are_ordered_and_ranged() {
        let (_temp, store) = open_store().await;
        store.set_carfile_info(&carfile_row("aa11")).await.unwrap();
        store
            .create_cache(
                &cache_row("aa11_1", "aa11", true),
                &block_row("b-root", "aa11_1", "aa11", "aa11", "e1"),
            )
            .await
            .unwrap();

        for (i, cid_hash) in ["cc01", "cc02", "cc03"].iter().enumerate() {
            let mut row = block_row(&format!("b-{cid_hash}"), "aa11_1", "aa11", cid_hash, "e1");
            row.fid = i as i64 + 2;
            row.status = CacheStatus::Success.as_str().to_string();
            store
                .save_cacheing_results(None, None, None, &[row])
                .await
                .unwrap();
        }

        let all = store.get_blocks_fid("e1").await.unwrap();
        assert_eq!(all.keys().copied().collect::<Vec<_>>(), vec![2, 3, 4]);

        let ranged = store.get_blocks_in_fid_range("e1", 3, 4).await.unwrap();
        assert_eq!(ranged.len(), 2);
        assert_eq!(ranged.get(&3).unwrap(), "cid-cc02");
    }

    #[tokio::test]
    async fn test_extend_cache_expiry_moves_only_the_target() {
        let (_temp, store) = open_store().await;
        store.set_carfile_info(&carfile_row("aa11")).await.unwrap();
        store
            .create_cache(
                &cache_row("aa11_1", "aa11", true),
                &block_row("b-root", "aa11_1", "aa11", "aa11", ""),
            )
            .await
            .unwrap();
        store
            .create_cache(
                &cache_row("aa11_2", "aa11", false),
                &block_row("b-root-2", "aa11_2", "aa11", "aa11b", ""),
            )
            .await
            .unwrap();

        let before_1 = store.get_cache_info("aa11_1").await.unwrap().unwrap();
        let before_2 = store.get_cache_info("aa11_2").await.unwrap().unwrap();

        store
            .extend_cache_expiry("aa11", Some("aa11_1"), 2)
            .await
            .unwrap();

        let after_1 = store.get_cache_info("aa11_1").await.unwrap().unwrap();
        assert_eq!(
            after_1.expired_time - before_1.expired_time,
            time::Duration::hours(2)
        );
        let after_2 = store.get_cache_info("aa11_2").await.unwrap().unwrap();
        assert_eq!(after_2.expired_time, before_2.expired_time);

        // no cache filter: every cache of the carfile moves
        store.extend_cache_expiry("aa11", None, 1).await.unwrap();
        let moved_2 = store.get_cache_info("aa11_2").await.unwrap().unwrap();
        assert_eq!(
            moved_2.expired_time - before_2.expired_time,
            time::Duration::hours(1)
        );
    }

    #[tokio::test]
    async fn test_node_lifecycle() {
        let (_temp, store) = open_store().await;
        let node = NodeRow {
            device_id: "e1".to_string(),
            last_time: OffsetDateTime::now_utc(),
            geo: "CN-GD".to_string(),
            node_type: "edge".to_string(),
            is_online: true,
            address: "10.0.0.1:1234".to_string(),
            server_name: "test".to_string(),
            private_key: "a2V5".to_string(),
            url: "http://10.0.0.1:3000".to_string(),
            quitted: false,
        };
        store.set_node_info(&node).await.unwrap();

        let auth = store.get_node_auth("e1").await.unwrap();
        assert_eq!(auth.url, "http://10.0.0.1:3000");
        assert_eq!(auth.private_key, "a2V5");

        store
            .set_node_offline("e1", OffsetDateTime::now_utc())
            .await
            .unwrap();
        let offline = store.get_offline_nodes("test").await.unwrap();
        assert_eq!(offline.len(), 1);

        store.set_nodes_quit(&["e1".to_string()]).await.unwrap();
        assert!(store.get_offline_nodes("test").await.unwrap().is_empty());
    }
}
