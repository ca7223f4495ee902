//! Application context shared by every component.

use std::sync::Arc;

use crate::config::Config;
use crate::runtime::ContainerRuntime;
use crate::scheduler::Scheduler;

/// Built once at startup and handed to every component.
pub struct AppContext {
    pub config: Arc<Config>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub scheduler: Scheduler,
}

impl AppContext {
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config: Arc::new(config),
            runtime,
            scheduler: Scheduler::new(),
        }
    }
}
