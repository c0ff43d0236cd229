//! Courier node daemon: the per-node block caching pipeline, the node RPC
//! surface and the end-user download edge.

pub mod device;
pub mod download;
pub mod error;
pub mod handlers;
pub mod index;
pub mod loader;
pub mod pipeline;
pub mod queue;
pub mod routes;
pub mod scheduler_client;
pub mod state;

pub use device::Device;
pub use error::{ApiError, ApiResult, NodeError, NodeResult};
pub use index::CidFidIndex;
pub use loader::{BlockLoader, FetchedBlock, GatewayLoader, PeerLoader};
pub use pipeline::Pipeline;
pub use queue::{CarfileQueue, DelayedPlacement};
pub use routes::create_router;
pub use scheduler_client::{SchedulerApi, SchedulerClient};
pub use state::NodeState;
