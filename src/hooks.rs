//! Two-phase mutation pipeline applied to every creation request.
//!
//! ```text
//!   CreationRequest::from_set(set)
//!            │
//!            ▼
//!   ┌──────────────────────────────┐
//!   │ early: plugin 1 → 2 → … → n  │   raw values (ports, binds, volumes-from)
//!   └──────────────────────────────┘
//!            │  all early hooks succeeded
//!            ▼
//!   ┌──────────────────────────────┐
//!   │ late:  plugin 1 → 2 → … → n  │   values that read finalized state (env templating)
//!   └──────────────────────────────┘
//!            │
//!            ▼
//!     runtime.create + start
//! ```
//!
//! Each hook is awaited before the next one starts, so a later hook sees every
//! mutation made by earlier ones. The first error stops the pipeline; a
//! [`HookError::Abort`] cancels the current attempt only.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ContainerSet;
use crate::context::AppContext;
use crate::error::HookError;
use crate::runtime::CreationRequest;

/// An extension wired into the controller.
///
/// All methods default to no-ops, so a plugin only implements the phases it
/// cares about.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable name used in logs and errors.
    fn name(&self) -> &str;

    /// Called once at startup. May spawn scheduled tasks on the context.
    async fn init(&self, _ctx: &Arc<AppContext>) -> Result<(), HookError> {
        Ok(())
    }

    /// Called once at shutdown, in reverse registration order.
    async fn deinit(&self, _ctx: &Arc<AppContext>) {}

    /// Early phase: inject raw values into the request.
    async fn early(
        &self,
        _ctx: &AppContext,
        _set: &ContainerSet,
        _request: &mut CreationRequest,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Late phase: runs after every early hook has succeeded.
    async fn late(
        &self,
        _ctx: &AppContext,
        _set: &ContainerSet,
        _request: &mut CreationRequest,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Which half of the pipeline is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Early,
    Late,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Early => write!(f, "early"),
            Self::Late => write!(f, "late"),
        }
    }
}

/// Ordered hooks, fixed at construction.
#[derive(Clone, Default)]
pub struct HookPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl HookPipeline {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    /// Plugin names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Run every early hook, then every late hook, stopping at the first error.
    pub async fn run(
        &self,
        ctx: &AppContext,
        set: &ContainerSet,
        request: &mut CreationRequest,
    ) -> Result<(), HookError> {
        self.run_phase(Phase::Early, ctx, set, request).await?;
        self.run_phase(Phase::Late, ctx, set, request).await
    }

    async fn run_phase(
        &self,
        phase: Phase,
        ctx: &AppContext,
        set: &ContainerSet,
        request: &mut CreationRequest,
    ) -> Result<(), HookError> {
        for plugin in &self.plugins {
            let result = match phase {
                Phase::Early => plugin.early(ctx, set, request).await,
                Phase::Late => plugin.late(ctx, set, request).await,
            };
            if let Err(e) = result {
                tracing::debug!(
                    set = %set.id,
                    plugin = plugin.name(),
                    %phase,
                    "Hook stopped the pipeline: {}",
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }
}
