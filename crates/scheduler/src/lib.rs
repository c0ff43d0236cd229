//! Courier scheduler daemon: the caching orchestration engine.
//!
//! The scheduler turns "cache this carfile with reliability R" requests
//! into per-node block placements, tracks their progress through a durable
//! repository and a live in-memory store, and repairs replication when
//! nodes fail or quit.

pub mod carfile;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod live;
pub mod nodes;
pub mod routes;
pub mod state;

pub use carfile::{CacheAttempt, CarfileManager, CarfileRecord, SchedulerCtx};
pub use dispatcher::{NodeClient, NodeDispatcher};
pub use error::{ApiError, ApiResult, SchedulerError, SchedulerResult};
pub use live::{DataTask, DownloadRecord, LiveStore, NodeCounters, WaitingTask};
pub use nodes::{NodeHandle, NodeRegistry};
pub use routes::create_router;
pub use state::AppState;
