//! The carfile manager: admission, the per-area dispatch loop, result
//! workers, the timeout watcher, the expiry sweeper and node-quit repair.

use crate::carfile::SchedulerCtx;
use crate::carfile::record::CarfileRecord;
use crate::dispatcher::NodeDispatcher as _;
use crate::error::{SchedulerError, SchedulerResult};
use crate::live::WaitingTask;
use courier_core::rpc::CacheResultRequest;
use courier_core::{CacheStatus, CidHash};
use courier_metadata::MetadataStore as _;
use courier_metadata::models::{CacheRow, CarfileRow};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;

const DISPATCH_INTERVAL: Duration = Duration::from_millis(500);
const TIMEOUT_WATCH_INTERVAL: Duration = Duration::from_millis(500);
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const RESULT_WORKERS: usize = 4;

pub struct CarfileManager {
    ctx: Arc<SchedulerCtx>,
    records: Mutex<HashMap<String, Arc<AsyncMutex<CarfileRecord>>>>,
}

impl CarfileManager {
    pub fn new(ctx: Arc<SchedulerCtx>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the background loops. Handles are detached; they live as
    /// long as the process.
    pub fn run(self: &Arc<Self>) {
        for _ in 0..RESULT_WORKERS {
            let manager = self.clone();
            tokio::spawn(async move {
                loop {
                    let result = manager.ctx.live.next_result().await;
                    manager.on_cache_result(result).await;
                }
            });
        }

        {
            let manager = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(DISPATCH_INTERVAL);
                loop {
                    tick.tick().await;
                    manager.dispatch_waiting().await;
                }
            });
        }

        {
            let manager = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(TIMEOUT_WATCH_INTERVAL);
                loop {
                    tick.tick().await;
                    manager.check_timeouts().await;
                }
            });
        }

        {
            let manager = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
                loop {
                    tick.tick().await;
                    if let Err(e) = manager.remove_expired_caches().await {
                        tracing::error!(error = %e, "expiry sweep failed");
                    }
                    manager.ctx.live.sweep();
                }
            });
        }
    }

    /// Admit a carfile for caching: upsert the durable row (raising the
    /// target or extending expiry for re-admissions) and queue it.
    pub async fn cache_carfile(
        &self,
        cid: &str,
        reliability: i64,
        expired_at: OffsetDateTime,
    ) -> SchedulerResult<()> {
        let hash = CidHash::from_cid_str(cid)?;

        let row = match self.ctx.metadata.get_carfile_info(hash.as_str()).await? {
            Some(mut existing) => {
                existing.need_reliability = existing.need_reliability.max(reliability);
                existing.expired_time = existing.expired_time.max(expired_at);
                existing
            }
            None => CarfileRow {
                carfile_hash: hash.as_str().to_string(),
                carfile_cid: cid.to_string(),
                status: CacheStatus::Running.as_str().to_string(),
                need_reliability: reliability,
                reliability: 0,
                total_size: 0,
                total_blocks: 1,
                cache_count: 0,
                nodes: 0,
                expired_time: expired_at,
                end_time: None,
            },
        };
        self.ctx.metadata.set_carfile_info(&row).await?;

        self.ctx.live.push_waiting(WaitingTask {
            carfile_cid: cid.to_string(),
            carfile_hash: hash.as_str().to_string(),
            need_reliability: row.need_reliability,
            expired_at: row.expired_time,
        });
        tracing::info!(carfile = %cid, need_reliability = row.need_reliability, "carfile admitted");
        Ok(())
    }

    /// Promote waiting tasks into running attempts while slots remain.
    pub async fn dispatch_waiting(&self) {
        while self.ctx.live.running_count() < self.ctx.config.caching.max_running_attempts {
            let Some(task) = self.ctx.live.pop_waiting() else {
                return;
            };
            if let Err(e) = self.start_task(&task).await {
                tracing::error!(carfile = %task.carfile_cid, error = %e, "starting cache task failed");
            }
        }
    }

    async fn start_task(&self, task: &WaitingTask) -> SchedulerResult<()> {
        // two admissions of one hash collapse onto the live coordinator
        if self.ctx.live.lease(&task.carfile_hash).is_some() {
            tracing::debug!(carfile = %task.carfile_cid, "already running, admission collapsed");
            return Ok(());
        }

        let record = self.get_or_load_record(task).await?;
        let mut record = record.lock().await;

        // re-admissions may have raised the target while we were queued
        if let Some(row) = self.ctx.metadata.get_carfile_info(&task.carfile_hash).await? {
            record.need_reliability = row.need_reliability;
            record.expired_at = row.expired_time;
            record.reliability = row.reliability;
            record.cache_count = row.cache_count;
        }

        if !record.needs_caching() {
            tracing::info!(carfile = %task.carfile_cid, "reliability already met, nothing to do");
            return Ok(());
        }
        if record.cache_count > record.need_reliability {
            tracing::info!(carfile = %task.carfile_cid, cache_count = record.cache_count,
                "cache count reached need reliability, not planning");
            return Ok(());
        }

        record.dispatch_cache(&self.ctx).await
    }

    async fn get_or_load_record(
        &self,
        task: &WaitingTask,
    ) -> SchedulerResult<Arc<AsyncMutex<CarfileRecord>>> {
        if let Some(record) = self.records.lock().unwrap().get(&task.carfile_hash) {
            return Ok(record.clone());
        }

        let record = match CarfileRecord::load(&self.ctx, &task.carfile_hash).await? {
            Some(record) => record,
            None => CarfileRecord::new(
                task.carfile_cid.clone(),
                task.carfile_hash.clone(),
                task.need_reliability,
                task.expired_at,
            ),
        };

        let record = Arc::new(AsyncMutex::new(record));
        self.records
            .lock()
            .unwrap()
            .insert(task.carfile_hash.clone(), record.clone());
        Ok(record)
    }

    fn record(&self, carfile_hash: &str) -> Option<Arc<AsyncMutex<CarfileRecord>>> {
        self.records.lock().unwrap().get(carfile_hash).cloned()
    }

    /// Route one queued result to its coordinator.
    pub async fn on_cache_result(&self, req: CacheResultRequest) {
        let Some(record) = self.record(&req.result.carfile_hash) else {
            tracing::debug!(carfile_hash = %req.result.carfile_hash, "result for unknown carfile");
            return;
        };

        let mut record = record.lock().await;
        if let Err(e) = record.handle_result(&self.ctx, &req).await {
            tracing::error!(carfile = %record.carfile_cid, cid = %req.result.cid, error = %e,
                "folding cache result failed");
        }
    }

    /// Force-terminate attempts whose lease lapsed.
    pub async fn check_timeouts(&self) {
        for task in self.ctx.live.expired_running() {
            let Some(record) = self.record(&task.carfile_hash) else {
                self.ctx.live.remove_running(&task.carfile_hash, &task.cache_id);
                continue;
            };
            let mut record = record.lock().await;
            if let Err(e) = record.force_timeout(&self.ctx, &task.cache_id).await {
                tracing::error!(carfile = %record.carfile_cid, cache_id = %task.cache_id,
                    error = %e, "timeout termination failed");
            }
        }
    }

    /// Drop caches whose expiry passed: tell holder nodes to delete the
    /// blocks, then remove the rows.
    pub async fn remove_expired_caches(&self) -> SchedulerResult<()> {
        for cache in self.ctx.metadata.get_expired_caches().await? {
            tracing::info!(cache_id = %cache.cache_id, carfile_hash = %cache.carfile_hash,
                "removing expired cache");
            if let Err(e) = self.drop_cache(&cache).await {
                tracing::error!(cache_id = %cache.cache_id, error = %e, "removing cache failed");
            }
        }
        Ok(())
    }

    async fn drop_cache(&self, cache: &CacheRow) -> SchedulerResult<()> {
        let blocks = self
            .ctx
            .metadata
            .get_blocks_with_status(&cache.cache_id, CacheStatus::Success.as_str())
            .await?;

        let mut per_device: HashMap<String, Vec<String>> = HashMap::new();
        for block in blocks {
            per_device.entry(block.device_id).or_default().push(block.cid);
        }

        for (device_id, cids) in per_device {
            let Some(node) = self.ctx.registry.get(&device_id) else {
                continue;
            };
            if let Err(e) = self.ctx.dispatcher.delete_blocks(&node.rpc_url, cids).await {
                tracing::warn!(device_id = %device_id, error = %e, "delete blocks on node failed");
            }
        }

        let remaining = self
            .ctx
            .metadata
            .get_caches_of_carfile(&cache.carfile_hash)
            .await?
            .len();
        let delete_data = remaining <= 1;

        let reliability_delta = if cache.status == CacheStatus::Success.as_str() {
            cache.reliability
        } else {
            0
        };
        let new_reliability = self
            .ctx
            .metadata
            .get_carfile_info(&cache.carfile_hash)
            .await?
            .map(|row| (row.reliability - reliability_delta).max(0))
            .unwrap_or(0);

        self.ctx
            .metadata
            .remove_cache_and_update_data(
                &cache.cache_id,
                &cache.carfile_hash,
                delete_data,
                new_reliability,
            )
            .await?;

        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get(&cache.carfile_hash) {
            if let Ok(mut record) = record.try_lock() {
                record.attempts.remove(&cache.cache_id);
                record.reliability = new_reliability;
            }
            if delete_data {
                records.remove(&cache.carfile_hash);
            }
        }
        self.ctx.live.remove_running(&cache.carfile_hash, &cache.cache_id);
        Ok(())
    }

    /// Remove a carfile outright: every cache, every block, on every
    /// holder node.
    pub async fn remove_carfile(&self, cid: &str) -> SchedulerResult<()> {
        let hash = CidHash::from_cid_str(cid)?;
        let caches = self.ctx.metadata.get_caches_of_carfile(hash.as_str()).await?;
        if caches.is_empty() {
            return Err(SchedulerError::Metadata(
                courier_metadata::MetadataError::NotFound(format!("carfile {cid}")),
            ));
        }

        self.ctx.live.remove_waiting(hash.as_str());
        for cache in caches {
            self.drop_cache(&cache).await?;
        }
        self.records.lock().unwrap().remove(hash.as_str());
        tracing::info!(carfile = %cid, "carfile removed");
        Ok(())
    }

    /// A device left for good: flip its successful caches to restore and
    /// re-admit every carfile whose reliability fell below target.
    pub async fn node_quit(&self, device_id: &str) -> SchedulerResult<()> {
        self.ctx.registry.remove(device_id);
        self.ctx
            .metadata
            .set_nodes_quit(&[device_id.to_string()])
            .await?;

        let outcome = match self.ctx.metadata.update_cache_info_of_quit_node(device_id).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_not_found() => {
                tracing::debug!(device_id = %device_id, "quit node held no successful caches");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        tracing::warn!(device_id = %device_id, caches = outcome.cache_count,
            carfiles = outcome.lost_reliability.len(), "node quit, repairing reliability");

        for carfile_hash in outcome.lost_reliability.keys() {
            // drop the stale coordinator so the restart loads fresh rows
            self.records.lock().unwrap().remove(carfile_hash);

            let Some(row) = self.ctx.metadata.get_carfile_info(carfile_hash).await? else {
                continue;
            };
            if row.reliability < row.need_reliability {
                self.cache_carfile(&row.carfile_cid, row.need_reliability, row.expired_time)
                    .await?;
            }
        }
        Ok(())
    }

    /// Snapshot of one carfile's durable state, for the operator surface.
    pub async fn carfile_info(
        &self,
        cid: &str,
    ) -> SchedulerResult<(CarfileRow, Vec<CacheRow>)> {
        let hash = CidHash::from_cid_str(cid)?;
        let row = self
            .ctx
            .metadata
            .get_carfile_info(hash.as_str())
            .await?
            .ok_or_else(|| {
                SchedulerError::Metadata(courier_metadata::MetadataError::NotFound(format!(
                    "carfile {cid}"
                )))
            })?;
        let caches = self.ctx.metadata.get_caches_of_carfile(hash.as_str()).await?;
        Ok((row, caches))
    }

    pub fn ctx(&self) -> &Arc<SchedulerCtx> {
        &self.ctx
    }
}
