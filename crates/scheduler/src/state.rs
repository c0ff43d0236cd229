//! Scheduler application state shared across handlers.

use crate::carfile::{CarfileManager, SchedulerCtx};
use std::sync::Arc;

/// Shared scheduler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<CarfileManager>,
}

impl AppState {
    pub fn new(manager: Arc<CarfileManager>) -> Self {
        Self { manager }
    }

    pub fn ctx(&self) -> &Arc<SchedulerCtx> {
        self.manager.ctx()
    }
}
