//! Carfile cache orchestration: the shared context, the per-carfile
//! coordinator and the manager that drives them.

pub mod attempt;
pub mod manager;
pub mod record;

pub use attempt::{CacheAttempt, PlannedBlock};
pub use manager::CarfileManager;
pub use record::CarfileRecord;

use crate::dispatcher::NodeDispatcher;
use crate::live::LiveStore;
use crate::nodes::NodeRegistry;
use courier_core::config::SchedulerConfig;
use courier_metadata::MetadataStore;
use std::sync::Arc;

/// Everything the orchestration code needs, threaded through explicitly
/// instead of process globals.
pub struct SchedulerCtx {
    pub metadata: Arc<dyn MetadataStore>,
    pub live: Arc<LiveStore>,
    pub registry: Arc<NodeRegistry>,
    pub dispatcher: Arc<dyn NodeDispatcher>,
    pub config: SchedulerConfig,
}
