//! Shared handler state.

use std::sync::Arc;

use flowslide_core::context::CoreContext;
use flowslide_core::deployment::DeploymentService;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<CoreContext>,
}

impl AppState {
    pub fn deployment(&self) -> Arc<DeploymentService> {
        Arc::clone(&self.core.deployment)
    }
}
