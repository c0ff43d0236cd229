//! Node application state shared across handlers.

use crate::device::Device;
use crate::index::CidFidIndex;
use crate::pipeline::Pipeline;
use crate::scheduler_client::SchedulerApi;
use courier_blockstore::BlockStore;
use courier_core::rpc::UserDownloadResult;
use courier_signer::DownloadVerifier;
use std::sync::{Arc, RwLock};

/// Shared node state.
#[derive(Clone)]
pub struct NodeState {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<dyn BlockStore>,
    pub index: Arc<CidFidIndex>,
    pub device: Arc<Device>,
    pub scheduler: Arc<dyn SchedulerApi>,
    /// Verifying key for download grants; loaded from the scheduler after
    /// registration.
    pub verifier: Arc<RwLock<Option<DownloadVerifier>>>,
}

impl NodeState {
    pub fn new(
        pipeline: Arc<Pipeline>,
        store: Arc<dyn BlockStore>,
        index: Arc<CidFidIndex>,
        device: Arc<Device>,
        scheduler: Arc<dyn SchedulerApi>,
    ) -> Self {
        Self {
            pipeline,
            store,
            index,
            device,
            scheduler,
            verifier: Arc::new(RwLock::new(None)),
        }
    }

    pub fn set_verifier(&self, verifier: DownloadVerifier) {
        *self.verifier.write().unwrap() = Some(verifier);
    }

    /// Fire-and-forget outcome report for one user download.
    pub fn report_download(&self, result: UserDownloadResult) {
        let scheduler = self.scheduler.clone();
        let device_id = self.device.device_id.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.user_download_result(&device_id, result).await {
                tracing::error!(error = %e, "reporting user download failed");
            }
        });
    }
}
