//! Plugin registry and the built-in plugins.
//!
//! Plugins run in registration order; there are no priorities. The built-in
//! order matters: ports are claimed before volumes are translated, and env
//! templating runs in the late phase so it sees every early injection.

mod env_template;
mod image_puller;
mod ports;
mod random_ports;
mod static_volumes;
mod volumes_from;

use std::sync::Arc;

pub use env_template::{EnvTemplate, TemplateFacts, render_env};
pub use image_puller::{ImagePuller, PullReport, pull_set_images};
pub use ports::StaticPorts;
pub use random_ports::{RandomPorts, pick_port};
pub use static_volumes::{StaticVolumes, VolumeMount, translate_volume};
pub use volumes_from::VolumesFrom;

use crate::context::AppContext;
use crate::error::HookError;
use crate::hooks::{HookPipeline, Plugin};

/// Ordered set of plugins wired into the controller.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in plugins in their fixed order.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RandomPorts));
        registry.register(Arc::new(StaticVolumes));
        registry.register(Arc::new(StaticPorts));
        registry.register(Arc::new(VolumesFrom));
        registry.register(Arc::new(EnvTemplate));
        registry.register(Arc::new(ImagePuller));
        registry
    }

    /// Append a plugin. It runs after every plugin registered before it.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        tracing::debug!("Registered plugin {}", plugin.name());
        self.plugins.push(plugin);
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Initialize every plugin in order. The first failure is fatal.
    ///
    /// If one fails, the plugins initialized before it are deinitialized in
    /// reverse order and the error is returned.
    pub async fn init_all(&self, ctx: &Arc<AppContext>) -> Result<(), HookError> {
        for (index, plugin) in self.plugins.iter().enumerate() {
            if let Err(e) = plugin.init(ctx).await {
                tracing::error!("Plugin {} failed to initialize: {}", plugin.name(), e);
                for done in self.plugins[..index].iter().rev() {
                    done.deinit(ctx).await;
                    tracing::debug!("Deinitialized plugin {}", done.name());
                }
                return Err(e);
            }
            tracing::debug!("Initialized plugin {}", plugin.name());
        }
        Ok(())
    }

    /// Deinitialize every plugin in reverse order.
    pub async fn deinit_all(&self, ctx: &Arc<AppContext>) {
        for plugin in self.plugins.iter().rev() {
            plugin.deinit(ctx).await;
            tracing::debug!("Deinitialized plugin {}", plugin.name());
        }
    }

    /// A hook pipeline over the registered plugins.
    pub fn pipeline(&self) -> HookPipeline {
        HookPipeline::new(self.plugins.clone())
    }
}
