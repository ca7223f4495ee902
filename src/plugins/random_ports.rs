//! Random host port injection.

use std::collections::HashSet;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::config::ContainerSet;
use crate::context::AppContext;
use crate::error::HookError;
use crate::hooks::Plugin;
use crate::runtime::{ContainerFilter, CreationRequest};

const NAME: &str = "random-ports";

/// Pick a free port in `min..=max` uniformly at random.
pub fn pick_port(min: u16, max: u16, used: &HashSet<u16>) -> Option<u16> {
    let free: Vec<u16> = (min..=max).filter(|p| !used.contains(p)).collect();
    free.choose(&mut rand::thread_rng()).copied()
}

/// Publishes one free host port per name in `random_ports` and exposes it to
/// the container as `NAME=<port>`.
pub struct RandomPorts;

#[async_trait]
impl Plugin for RandomPorts {
    fn name(&self) -> &str {
        NAME
    }

    async fn early(
        &self,
        ctx: &AppContext,
        set: &ContainerSet,
        request: &mut CreationRequest,
    ) -> Result<(), HookError> {
        if set.random_ports.is_empty() {
            return Ok(());
        }

        let running = ctx
            .runtime
            .list_containers(&ContainerFilter::managed())
            .await
            .map_err(|source| HookError::Runtime {
                plugin: NAME.to_string(),
                source,
            })?;
        let mut used: HashSet<u16> = running
            .iter()
            .flat_map(|c| c.host_ports.iter().copied())
            .chain(request.host_ports())
            .collect();

        let (min, max) = (ctx.config.min_port, ctx.config.max_port);
        for name in &set.random_ports {
            let port = pick_port(min, max, &used).ok_or_else(|| {
                HookError::abort(NAME, format!("no free port in {min}-{max} for {name}"))
            })?;
            used.insert(port);
            request.publish(port, port);
            request.set_env(name, port);
            tracing::debug!(set = %set.id, "Assigned random port {}={}", name, port);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::runtime::ContainerStatus;
    use crate::testing::{FakeRuntime, container, test_context_with};

    fn narrow_config(min: u16, max: u16) -> Config {
        Config {
            min_port: min,
            max_port: max,
            ..Config::default()
        }
    }

    #[test]
    fn test_pick_port_skips_used() {
        let used = HashSet::from([100, 101]);
        assert_eq!(pick_port(100, 102, &used), Some(102));
        assert_eq!(pick_port(100, 101, &used), None);
    }

    #[tokio::test]
    async fn test_avoids_ports_of_running_containers() {
        let runtime = Arc::new(FakeRuntime::new());
        let mut busy = container("a", "web", ContainerStatus::Running);
        busy.host_ports = vec![20000, 20001];
        runtime.insert_container(busy);
        let ctx = test_context_with(narrow_config(20000, 20002), runtime);

        let mut set = ContainerSet::defaults("web");
        set.random_ports = vec!["PORT".to_string()];
        let mut request = CreationRequest::from_set(&set);

        RandomPorts.early(&ctx, &set, &mut request).await.unwrap();

        assert_eq!(request.env_value("PORT"), Some("20002"));
        assert_eq!(request.port_bindings["20002/tcp"], 20002);
    }

    #[tokio::test]
    async fn test_exhausted_range_aborts() {
        let runtime = Arc::new(FakeRuntime::new());
        let ctx = test_context_with(narrow_config(30000, 30000), runtime);

        let mut set = ContainerSet::defaults("web");
        set.random_ports = vec!["HTTP".to_string(), "ADMIN".to_string()];
        let mut request = CreationRequest::from_set(&set);

        let err = RandomPorts.early(&ctx, &set, &mut request).await.unwrap_err();
        assert!(err.is_abort());
    }
}
