//! The per-carfile coordinator: folds block results into durable state,
//! decides when an attempt is over, and keeps planning attempts until the
//! carfile reaches its reliability target.

use crate::carfile::SchedulerCtx;
use crate::carfile::attempt::{CacheAttempt, allocate_blocks, dispatch_planned};
use crate::error::SchedulerResult;
use courier_core::rpc::{CacheErrorInfo, CacheResultRequest};
use courier_core::{CacheId, CacheStatus, CidHash};
use courier_metadata::MetadataStore as _;
use courier_metadata::models::{BlockRow, CarfileRow};
use std::collections::HashMap;
use time::OffsetDateTime;

pub struct CarfileRecord {
    pub carfile_cid: String,
    pub carfile_hash: String,
    pub need_reliability: i64,
    pub reliability: i64,
    pub cache_count: i64,
    pub total_size: i64,
    pub total_blocks: i64,
    pub nodes: i64,
    pub expired_at: OffsetDateTime,
    pub attempts: HashMap<String, CacheAttempt>,
}

impl CarfileRecord {
    pub fn new(
        carfile_cid: String,
        carfile_hash: String,
        need_reliability: i64,
        expired_at: OffsetDateTime,
    ) -> Self {
        Self {
            carfile_cid,
            carfile_hash,
            need_reliability,
            reliability: 0,
            cache_count: 0,
            total_size: 0,
            total_blocks: 1,
            nodes: 0,
            expired_at,
            attempts: HashMap::new(),
        }
    }

    /// Rebuild a coordinator from the durable rows.
    pub async fn load(ctx: &SchedulerCtx, carfile_hash: &str) -> SchedulerResult<Option<Self>> {
        let Some(row) = ctx.metadata.get_carfile_info(carfile_hash).await? else {
            return Ok(None);
        };

        let mut record = Self {
            carfile_cid: row.carfile_cid,
            carfile_hash: row.carfile_hash,
            need_reliability: row.need_reliability,
            reliability: row.reliability,
            cache_count: row.cache_count,
            total_size: row.total_size,
            total_blocks: row.total_blocks,
            nodes: row.nodes,
            expired_at: row.expired_time,
            attempts: HashMap::new(),
        };

        for cache in ctx.metadata.get_caches_of_carfile(carfile_hash).await? {
            record
                .attempts
                .insert(cache.cache_id.clone(), CacheAttempt::from_row(&cache));
        }

        Ok(Some(record))
    }

    pub fn exist_root_cache(&self) -> bool {
        self.attempts
            .values()
            .any(|a| a.is_root && a.status == CacheStatus::Success)
    }

    pub fn to_data_row(&self) -> CarfileRow {
        CarfileRow {
            carfile_hash: self.carfile_hash.clone(),
            carfile_cid: self.carfile_cid.clone(),
            status: CacheStatus::Running.as_str().to_string(),
            need_reliability: self.need_reliability,
            reliability: self.reliability,
            total_size: self.total_size,
            total_blocks: self.total_blocks,
            cache_count: self.cache_count,
            nodes: self.nodes,
            expired_time: self.expired_at,
            end_time: None,
        }
    }

    /// Start the next attempt: resume the undone one if any, else plan a
    /// fresh cache starting from the root CID.
    pub async fn dispatch_cache(&mut self, ctx: &SchedulerCtx) -> SchedulerResult<()> {
        self.cache_count += 1;

        if let Some(cache_id) = self.undone_cache_id() {
            self.restart_cache(ctx, &cache_id).await
        } else {
            self.start_new_cache(ctx).await
        }
    }

    /// An unfinished earlier attempt to resume, root-first.
    fn undone_cache_id(&self) -> Option<String> {
        let mut fallback = None;
        for attempt in self.attempts.values() {
            if attempt.status == CacheStatus::Success || attempt.status == CacheStatus::Running {
                continue;
            }
            if attempt.is_root {
                return Some(attempt.cache_id.clone());
            }
            fallback = Some(attempt.cache_id.clone());
        }
        fallback
    }

    async fn start_new_cache(&mut self, ctx: &SchedulerCtx) -> SchedulerResult<()> {
        let is_root = !self.exist_root_cache();
        let hash = CidHash::from_hex(self.carfile_hash.clone());
        let cache_id = CacheId::new(&hash, self.cache_count).as_str().to_string();

        let mut attempt = CacheAttempt::new(
            cache_id.clone(),
            self.carfile_hash.clone(),
            is_root,
            self.expired_at,
        );
        if !is_root {
            // totals were frozen by the successful root cache
            attempt.total_blocks = self.total_blocks;
            attempt.total_size = self.total_size;
        }

        let planned = allocate_blocks(
            ctx,
            &cache_id,
            &self.carfile_hash,
            is_root,
            &[(self.carfile_cid.clone(), None)],
        )
        .await?;
        let root_block = planned
            .first()
            .map(|p| p.row.clone())
            .expect("planning the root cid yields one block");

        attempt.status = CacheStatus::Running;
        ctx.metadata.create_cache(&attempt.to_row(), &root_block).await?;
        ctx.metadata
            .save_cacheing_results(Some(&self.to_data_row()), None, None, &[])
            .await?;

        self.attempts.insert(cache_id.clone(), attempt);

        ctx.live.add_running(
            &self.carfile_hash,
            &cache_id,
            ctx.config.caching.per_block_timeout(),
        );
        tracing::info!(carfile = %self.carfile_cid, cache_id = %cache_id, is_root, "cache attempt planned");

        dispatch_planned(ctx, &cache_id, &self.carfile_hash, &planned).await;
        Ok(())
    }

    async fn restart_cache(&mut self, ctx: &SchedulerCtx, cache_id: &str) -> SchedulerResult<()> {
        let undone = ctx.metadata.get_undone_blocks(cache_id).await?;
        let cids: Vec<(String, Option<String>)> = undone
            .into_iter()
            .map(|(cid, id)| (cid, Some(id)))
            .collect();

        let is_root = self
            .attempts
            .get(cache_id)
            .map(|a| a.is_root)
            .unwrap_or(false);
        let planned = allocate_blocks(ctx, cache_id, &self.carfile_hash, is_root, &cids).await?;
        let rows: Vec<BlockRow> = planned.iter().map(|p| p.row.clone()).collect();

        // rebuild the counters from the rows: blocks flipped to restore
        // (or stamped by a timeout) are no longer done
        let done = ctx
            .metadata
            .get_blocks_with_status(cache_id, CacheStatus::Success.as_str())
            .await?;
        let no_root_yet = !self.exist_root_cache();
        if let Some(attempt) = self.attempts.get_mut(cache_id) {
            attempt.status = CacheStatus::Running;
            attempt.failed_blocks = 0;
            attempt.done_blocks = done.len() as i64;
            attempt.done_size = done.iter().map(|b| b.size).sum();
            if no_root_yet {
                attempt.total_blocks = (done.len() + rows.len()) as i64;
                attempt.total_size = attempt.done_size;
            }
        }
        let cache_row = self
            .attempts
            .get(cache_id)
            .map(|a| a.to_row())
            .expect("restarted attempt is registered");

        ctx.metadata
            .save_cacheing_results(Some(&self.to_data_row()), Some(&cache_row), None, &rows)
            .await?;

        let pending = rows.len().max(1) as u32;
        ctx.live.add_running(
            &self.carfile_hash,
            cache_id,
            ctx.config.caching.per_block_timeout() * pending,
        );
        tracing::info!(carfile = %self.carfile_cid, cache_id = %cache_id, blocks = rows.len(),
            "cache attempt restarted");

        dispatch_planned(ctx, cache_id, &self.carfile_hash, &planned).await;
        Ok(())
    }

    /// Fold one block result into the attempt. Results for a lease no
    /// longer held (a removed or timed-out attempt) are dropped.
    pub async fn handle_result(
        &mut self,
        ctx: &SchedulerCtx,
        req: &CacheResultRequest,
    ) -> SchedulerResult<()> {
        let result = &req.result;

        if ctx.live.lease(&self.carfile_hash).as_deref() != Some(result.cache_id.as_str()) {
            tracing::debug!(cache_id = %result.cache_id, cid = %result.cid,
                "discarding result for a lease no longer held");
            return Ok(());
        }
        let Some(attempt) = self.attempts.get(&result.cache_id) else {
            return Ok(());
        };
        if attempt.status.is_terminal() {
            return Ok(());
        }

        let hash = CidHash::from_cid_str(&result.cid)?;
        let Some(block_row) = ctx
            .metadata
            .get_block_info(&result.cache_id, hash.as_str())
            .await?
        else {
            tracing::debug!(cache_id = %result.cache_id, cid = %result.cid, "result for unknown block");
            return Ok(());
        };
        if block_row.status == CacheStatus::Success.as_str()
            || block_row.status == CacheStatus::Failed.as_str()
        {
            return Ok(());
        }

        if result.is_ok {
            self.fold_success(ctx, req, &block_row).await?;
        } else {
            self.fold_failure(ctx, req, &block_row).await?;
        }

        let pending = ctx
            .metadata
            .get_block_count_with_status(&result.cache_id, CacheStatus::Pending.as_str())
            .await?;

        if pending == 0 {
            self.attempt_done(ctx, &result.cache_id).await?;
        } else {
            ctx.live.refresh_lease(
                &self.carfile_hash,
                &result.cache_id,
                ctx.config.caching.per_block_timeout() * pending.max(1) as u32,
            );
        }

        Ok(())
    }

    async fn fold_success(
        &mut self,
        ctx: &SchedulerCtx,
        req: &CacheResultRequest,
        block_row: &BlockRow,
    ) -> SchedulerResult<()> {
        let result = &req.result;
        let cache_id = result.cache_id.clone();

        let mut update = block_row.clone();
        update.status = CacheStatus::Success.as_str().to_string();
        update.size = result.block_size as i64;
        update.reliability = 1;
        update.device_id = req.device_id.clone();

        // frontier expansion: links not yet part of this attempt
        let mut new_cids: Vec<(String, Option<String>)> = Vec::new();
        for link in &result.links {
            let link_hash = CidHash::from_cid_str(link)?;
            if new_cids.iter().any(|(cid, _)| cid == link) {
                continue;
            }
            if ctx
                .metadata
                .get_block_info(&cache_id, link_hash.as_str())
                .await?
                .is_none()
            {
                new_cids.push((link.clone(), None));
            }
        }

        let is_root_attempt = self
            .attempts
            .get(&cache_id)
            .map(|a| a.is_root)
            .unwrap_or(false);
        let planned =
            allocate_blocks(ctx, &cache_id, &self.carfile_hash, is_root_attempt, &new_cids).await?;
        let rows: Vec<BlockRow> = planned.iter().map(|p| p.row.clone()).collect();

        let no_root_yet = !self.exist_root_cache();
        let attempt = self
            .attempts
            .get_mut(&cache_id)
            .expect("attempt checked by caller");
        attempt.done_blocks += 1;
        attempt.done_size += result.block_size as i64;
        if no_root_yet {
            // totals are discovered while the first replication walks the
            // DAG; the first successful root cache freezes them
            attempt.total_blocks += new_cids.len() as i64;
            attempt.total_size += result.block_size as i64;
            self.total_blocks = attempt.total_blocks;
            self.total_size = attempt.total_size;
        }
        let cache_row = attempt.to_row();

        ctx.metadata
            .save_cacheing_results(
                Some(&self.to_data_row()),
                Some(&cache_row),
                Some(&update),
                &rows,
            )
            .await?;

        ctx.live
            .apply_cache_transfer(&req.device_id, &block_row.source, result.block_size as i64);

        dispatch_planned(ctx, &cache_id, &self.carfile_hash, &planned).await;
        Ok(())
    }

    async fn fold_failure(
        &mut self,
        ctx: &SchedulerCtx,
        req: &CacheResultRequest,
        block_row: &BlockRow,
    ) -> SchedulerResult<()> {
        let result = &req.result;

        let mut update = block_row.clone();
        update.status = CacheStatus::Failed.as_str().to_string();
        update.device_id = req.device_id.clone();

        let attempt = self
            .attempts
            .get_mut(&result.cache_id)
            .expect("attempt checked by caller");
        attempt.failed_blocks += 1;
        let cache_row = attempt.to_row();

        ctx.metadata
            .save_cacheing_results(None, Some(&cache_row), Some(&update), &[])
            .await?;

        ctx.live.save_cache_errors(
            &result.cache_id,
            &[CacheErrorInfo {
                cid: result.cid.clone(),
                device_id: req.device_id.clone(),
                msg: result.msg.clone(),
                time: OffsetDateTime::now_utc(),
            }],
            false,
        );
        Ok(())
    }

    /// All blocks terminal: settle the attempt's final status.
    async fn attempt_done(&mut self, ctx: &SchedulerCtx, cache_id: &str) -> SchedulerResult<()> {
        let failed = ctx
            .metadata
            .get_block_count_with_status(cache_id, CacheStatus::Failed.as_str())
            .await?;

        let weight = self.attempt_reliability(ctx, cache_id).await?;
        let attempt = self
            .attempts
            .get_mut(cache_id)
            .expect("attempt checked by caller");
        if failed > 0 {
            attempt.status = CacheStatus::Failed;
            attempt.reliability = 0;
        } else {
            attempt.status = CacheStatus::Success;
            attempt.reliability = weight;
        }

        self.cache_end(ctx, cache_id, true).await
    }

    /// Reliability contributed by a successful attempt: the minimum
    /// node-type weight across the devices that served it.
    async fn attempt_reliability(
        &self,
        ctx: &SchedulerCtx,
        cache_id: &str,
    ) -> SchedulerResult<i64> {
        let (_, cache_nodes) = ctx
            .metadata
            .get_nodes_from_data_cache(&self.carfile_hash, cache_id)
            .await?;

        let weight = cache_nodes
            .iter()
            .filter_map(|device_id| ctx.registry.get(device_id))
            .map(|node| ctx.config.weights.for_node_type(node.node_type))
            .min()
            .unwrap_or(1);
        Ok(weight.max(0))
    }

    /// Terminate an attempt, persist the summary, and keep going while
    /// the carfile still needs replication.
    pub async fn cache_end(
        &mut self,
        ctx: &SchedulerCtx,
        cache_id: &str,
        is_continue: bool,
    ) -> SchedulerResult<()> {
        let (data_nodes, cache_nodes) = ctx
            .metadata
            .get_nodes_from_data_cache(&self.carfile_hash, cache_id)
            .await?;

        let attempt_row = {
            let attempt = self
                .attempts
                .get_mut(cache_id)
                .expect("ending a registered attempt");
            if attempt.status == CacheStatus::Success {
                self.reliability += attempt.reliability;
                ctx.live.incr_carfile_success_count();
            }
            attempt.nodes = cache_nodes.len() as i64;
            attempt.to_row()
        };
        if !data_nodes.is_empty() {
            self.nodes = data_nodes.len() as i64;
        }

        ctx.metadata
            .save_cache_end_results(&self.to_data_row(), &attempt_row)
            .await?;
        ctx.live.remove_running(&self.carfile_hash, cache_id);

        let status = attempt_row.status.clone();
        tracing::info!(carfile = %self.carfile_cid, cache_id = %cache_id, status = %status,
            reliability = self.reliability, need = self.need_reliability, "cache attempt ended");

        if !is_continue {
            return Ok(());
        }
        if self.cache_count > self.need_reliability {
            tracing::info!(carfile = %self.carfile_cid, cache_count = self.cache_count,
                "cache count reached need reliability, stopping");
            return Ok(());
        }
        if self.reliability >= self.need_reliability {
            tracing::info!(carfile = %self.carfile_cid, "reliability is enough, stopping");
            return Ok(());
        }

        self.dispatch_cache(ctx).await
    }

    /// The lease lapsed: the attempt is over, pending blocks and all.
    pub async fn force_timeout(&mut self, ctx: &SchedulerCtx, cache_id: &str) -> SchedulerResult<()> {
        let Some(attempt) = self.attempts.get_mut(cache_id) else {
            ctx.live.remove_running(&self.carfile_hash, cache_id);
            return Ok(());
        };
        if attempt.status.is_terminal() {
            ctx.live.remove_running(&self.carfile_hash, cache_id);
            return Ok(());
        }

        attempt.status = CacheStatus::Timeout;
        attempt.reliability = 0;
        tracing::warn!(carfile = %self.carfile_cid, cache_id = %cache_id, "cache attempt timed out");

        self.cache_end(ctx, cache_id, true).await
    }

    /// Whether a fresh admission still has work to do, given current
    /// durable state.
    pub fn needs_caching(&self) -> bool {
        self.reliability < self.need_reliability
    }
}
