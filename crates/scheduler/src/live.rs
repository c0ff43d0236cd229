//! The live (ephemeral) coordination state.
//!
//! Holds everything the scheduler must see with low latency and can
//! afford to lose on restart: the waiting/running task queues, per-device
//! counters, FID allocation, recent cache errors, user download records
//! and the durable result queue. Multi-step transitions are single
//! methods under one lock, so they commit fully or not at all. Keys carry
//! TTLs; a lease's expiry is the authoritative "attempt timed out"
//! signal.

use courier_core::rpc::{CacheErrorInfo, CacheResultRequest};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One entry of the running task list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataTask {
    pub carfile_hash: String,
    pub cache_id: String,
}

/// One admitted cache request waiting for a running slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WaitingTask {
    pub carfile_cid: String,
    pub carfile_hash: String,
    pub need_reliability: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub expired_at: OffsetDateTime,
}

/// Live per-device counters.
#[derive(Clone, Debug, Default)]
pub struct NodeCounters {
    pub disk_usage: f64,
    pub block_count: i64,
    pub total_download: i64,
    pub total_upload: i64,
    pub download_count: i64,
    pub online_minutes: f64,
    pub longitude: f64,
    pub latitude: f64,
}

/// A pending end-user download, kept until the grant times out.
#[derive(Clone, Debug)]
pub struct DownloadRecord {
    pub sn: i64,
    pub device_id: String,
    pub block_cid: String,
    pub carfile_cid: String,
    pub client_ip: String,
    pub created: OffsetDateTime,
}

struct Expiring<T> {
    value: T,
    deadline: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            deadline: Instant::now() + ttl,
        }
    }

    fn live(&self) -> bool {
        Instant::now() < self.deadline
    }
}

#[derive(Default)]
struct Inner {
    waiting: VecDeque<WaitingTask>,
    running: Vec<DataTask>,
    leases: HashMap<String, Expiring<String>>,
    counters: HashMap<String, NodeCounters>,
    fids: HashMap<String, i64>,
    cache_errors: HashMap<String, Expiring<Vec<CacheErrorInfo>>>,
    downloads: HashMap<i64, Expiring<DownloadRecord>>,
    download_sn: i64,
    results: VecDeque<CacheResultRequest>,
    carfile_success_count: i64,
}

pub struct LiveStore {
    inner: Mutex<Inner>,
    result_notify: Notify,
    cache_error_ttl: Duration,
}

impl LiveStore {
    pub fn new(cache_error_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            result_notify: Notify::new(),
            cache_error_ttl,
        }
    }

    // ----- waiting list -----

    pub fn push_waiting(&self, task: WaitingTask) {
        self.inner.lock().unwrap().waiting.push_back(task);
    }

    pub fn pop_waiting(&self) -> Option<WaitingTask> {
        self.inner.lock().unwrap().waiting.pop_front()
    }

    pub fn remove_waiting(&self, carfile_hash: &str) {
        self.inner
            .lock()
            .unwrap()
            .waiting
            .retain(|t| t.carfile_hash != carfile_hash);
    }

    pub fn waiting_len(&self) -> usize {
        self.inner.lock().unwrap().waiting.len()
    }

    // ----- running tasks and leases -----

    /// Record a running attempt: the list entry and its lease, together.
    pub fn add_running(&self, carfile_hash: &str, cache_id: &str, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.running.retain(|t| t.carfile_hash != carfile_hash);
        inner.running.push(DataTask {
            carfile_hash: carfile_hash.to_string(),
            cache_id: cache_id.to_string(),
        });
        inner.leases.insert(
            carfile_hash.to_string(),
            Expiring::new(cache_id.to_string(), ttl),
        );
    }

    /// Reset the lease TTL of a running attempt.
    pub fn refresh_lease(&self, carfile_hash: &str, cache_id: &str, ttl: Duration) {
        self.inner.lock().unwrap().leases.insert(
            carfile_hash.to_string(),
            Expiring::new(cache_id.to_string(), ttl),
        );
    }

    /// The cache id of the live lease for a carfile, if it has not
    /// expired.
    pub fn lease(&self, carfile_hash: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .leases
            .get(carfile_hash)
            .filter(|lease| lease.live())
            .map(|lease| lease.value.clone())
    }

    pub fn lease_ttl(&self, carfile_hash: &str) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        inner
            .leases
            .get(carfile_hash)
            .filter(|lease| lease.live())
            .map(|lease| lease.deadline - Instant::now())
    }

    /// Remove a finished attempt from the running state, lease included.
    pub fn remove_running(&self, carfile_hash: &str, cache_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .running
            .retain(|t| !(t.carfile_hash == carfile_hash && t.cache_id == cache_id));
        inner.leases.remove(carfile_hash);
    }

    pub fn running_tasks(&self) -> Vec<DataTask> {
        self.inner.lock().unwrap().running.clone()
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().unwrap().running.len()
    }

    /// Running entries whose lease has lapsed: the timed-out attempts.
    pub fn expired_running(&self) -> Vec<DataTask> {
        let inner = self.inner.lock().unwrap();
        inner
            .running
            .iter()
            .filter(|task| {
                inner
                    .leases
                    .get(&task.carfile_hash)
                    .is_none_or(|lease| !lease.live())
            })
            .cloned()
            .collect()
    }

    // ----- FID allocation -----

    /// Reserve a contiguous FID range for a device; returns
    /// `(first, last)` inclusive.
    pub fn next_fid_range(&self, device_id: &str, count: i64) -> (i64, i64) {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.fids.entry(device_id.to_string()).or_insert(0);
        *counter += count;
        (*counter - count + 1, *counter)
    }

    // ----- per-device counters -----

    pub fn update_node_counters(&self, device_id: &str, update: impl FnOnce(&mut NodeCounters)) {
        let mut inner = self.inner.lock().unwrap();
        update(inner.counters.entry(device_id.to_string()).or_default());
    }

    pub fn node_counters(&self, device_id: &str) -> Option<NodeCounters> {
        self.inner.lock().unwrap().counters.get(device_id).cloned()
    }

    /// Account one cached block: downloaded bytes on the target and, when
    /// it came from a peer, uploaded bytes on the source.
    pub fn apply_cache_transfer(&self, to_device: &str, from_device: &str, size: i64) {
        let mut inner = self.inner.lock().unwrap();
        {
            let to = inner.counters.entry(to_device.to_string()).or_default();
            to.block_count += 1;
            to.total_download += size;
        }
        if !from_device.is_empty() {
            let from = inner.counters.entry(from_device.to_string()).or_default();
            from.download_count += 1;
            from.total_upload += size;
        }
    }

    // ----- cache errors -----

    pub fn save_cache_errors(&self, cache_id: &str, errors: &[CacheErrorInfo], clean: bool) {
        let mut inner = self.inner.lock().unwrap();
        let ttl = self.cache_error_ttl;
        let entry = inner
            .cache_errors
            .entry(cache_id.to_string())
            .and_modify(|e| {
                if clean || !e.live() {
                    e.value.clear();
                }
            })
            .or_insert_with(|| Expiring::new(Vec::new(), ttl));
        entry.value.extend(errors.iter().cloned());
        entry.deadline = Instant::now() + ttl;
    }

    pub fn cache_errors(&self, cache_id: &str) -> Vec<CacheErrorInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .cache_errors
            .get(cache_id)
            .filter(|e| e.live())
            .map(|e| e.value.clone())
            .unwrap_or_default()
    }

    // ----- user download records -----

    pub fn next_download_sn(&self) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.download_sn += 1;
        inner.download_sn
    }

    pub fn set_download_record(&self, record: DownloadRecord, ttl: Duration) {
        self.inner
            .lock()
            .unwrap()
            .downloads
            .insert(record.sn, Expiring::new(record, ttl));
    }

    pub fn download_record(&self, sn: i64) -> Option<DownloadRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .downloads
            .get(&sn)
            .filter(|e| e.live())
            .map(|e| e.value.clone())
    }

    pub fn remove_download_record(&self, sn: i64) {
        self.inner.lock().unwrap().downloads.remove(&sn);
    }

    // ----- result queue -----

    pub fn push_result(&self, result: CacheResultRequest) {
        self.inner.lock().unwrap().results.push_back(result);
        self.result_notify.notify_one();
    }

    pub fn pop_result(&self) -> Option<CacheResultRequest> {
        self.inner.lock().unwrap().results.pop_front()
    }

    pub fn result_len(&self) -> usize {
        self.inner.lock().unwrap().results.len()
    }

    /// Await the next queued result.
    pub async fn next_result(&self) -> CacheResultRequest {
        loop {
            if let Some(result) = self.pop_result() {
                return result;
            }
            self.result_notify.notified().await;
        }
    }

    // ----- base counters and sweeping -----

    pub fn incr_carfile_success_count(&self) {
        self.inner.lock().unwrap().carfile_success_count += 1;
    }

    pub fn carfile_success_count(&self) -> i64 {
        self.inner.lock().unwrap().carfile_success_count
    }

    /// Drop expired error sets and download records.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.cache_errors.retain(|_, e| e.live());
        inner.downloads.retain(|_, e| e.live());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LiveStore {
        LiveStore::new(Duration::from_secs(3600))
    }

    fn task(hash: &str) -> WaitingTask {
        WaitingTask {
            carfile_cid: format!("cid-{hash}"),
            carfile_hash: hash.to_string(),
            need_reliability: 1,
            expired_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn test_waiting_list_is_fifo() {
        let live = store();
        live.push_waiting(task("aa"));
        live.push_waiting(task("bb"));

        assert_eq!(live.pop_waiting().unwrap().carfile_hash, "aa");
        assert_eq!(live.pop_waiting().unwrap().carfile_hash, "bb");
        assert!(live.pop_waiting().is_none());
    }

    #[tokio::test]
    async fn test_lease_expiry_is_the_timeout_signal() {
        tokio::time::pause();
        let live = store();
        live.add_running("aa", "aa_1", Duration::from_secs(5));

        assert_eq!(live.lease("aa").as_deref(), Some("aa_1"));
        assert!(live.expired_running().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(live.lease("aa"), None);
        let expired = live.expired_running();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].cache_id, "aa_1");

        live.remove_running("aa", "aa_1");
        assert!(live.expired_running().is_empty());
        assert_eq!(live.running_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_lease_extends_deadline() {
        tokio::time::pause();
        let live = store();
        live.add_running("aa", "aa_1", Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(4)).await;
        live.refresh_lease("aa", "aa_1", Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(live.lease("aa").as_deref(), Some("aa_1"));
    }

    #[tokio::test]
    async fn test_fid_ranges_are_contiguous_and_monotonic() {
        let live = store();
        assert_eq!(live.next_fid_range("e1", 3), (1, 3));
        assert_eq!(live.next_fid_range("e1", 2), (4, 5));
        // another device has its own counter
        assert_eq!(live.next_fid_range("e2", 1), (1, 1));
    }

    #[tokio::test]
    async fn test_cache_transfer_counters() {
        let live = store();
        live.apply_cache_transfer("edge", "candidate", 100);
        live.apply_cache_transfer("edge", "", 50);

        let edge = live.node_counters("edge").unwrap();
        assert_eq!(edge.block_count, 2);
        assert_eq!(edge.total_download, 150);

        let candidate = live.node_counters("candidate").unwrap();
        assert_eq!(candidate.total_upload, 100);
        assert_eq!(candidate.download_count, 1);
    }

    #[tokio::test]
    async fn test_result_queue_wakes_consumer() {
        let live = std::sync::Arc::new(store());
        let consumer = {
            let live = live.clone();
            tokio::spawn(async move { live.next_result().await })
        };

        let result = CacheResultRequest {
            device_id: "e1".to_string(),
            result: courier_core::rpc::CacheResult {
                cid: "bafyfoo".to_string(),
                is_ok: true,
                msg: String::new(),
                links: Vec::new(),
                block_size: 1,
                links_size: 0,
                carfile_hash: "aa".to_string(),
                cache_id: "aa_1".to_string(),
            },
        };
        live.push_result(result);

        let received = consumer.await.unwrap();
        assert_eq!(received.device_id, "e1");
    }

    #[tokio::test]
    async fn test_cache_errors_expire() {
        tokio::time::pause();
        let live = LiveStore::new(Duration::from_secs(10));
        let error = CacheErrorInfo {
            cid: "bafyfoo".to_string(),
            device_id: "e1".to_string(),
            msg: "boom".to_string(),
            time: OffsetDateTime::now_utc(),
        };
        live.save_cache_errors("aa_1", &[error], false);
        assert_eq!(live.cache_errors("aa_1").len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(live.cache_errors("aa_1").is_empty());
        live.sweep();
    }
}
