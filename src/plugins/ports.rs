//! Static port bindings.

use async_trait::async_trait;

use crate::config::ContainerSet;
use crate::context::AppContext;
use crate::error::HookError;
use crate::hooks::Plugin;
use crate::runtime::CreationRequest;

const NAME: &str = "ports";

/// Translates `ports` entries. `host:container` publishes the container port
/// on the host port; a bare `container` port is exposed without a binding.
/// The container part may carry a protocol suffix (`53/udp`); tcp is implied.
pub struct StaticPorts;

fn container_port_key(raw: &str) -> Option<String> {
    let (port, proto) = raw.split_once('/').unwrap_or((raw, "tcp"));
    let port: u16 = port.trim().parse().ok()?;
    match proto {
        "tcp" | "udp" | "sctp" => Some(format!("{port}/{proto}")),
        _ => None,
    }
}

#[async_trait]
impl Plugin for StaticPorts {
    fn name(&self) -> &str {
        NAME
    }

    async fn early(
        &self,
        _ctx: &AppContext,
        set: &ContainerSet,
        request: &mut CreationRequest,
    ) -> Result<(), HookError> {
        let invalid = |entry: &str| HookError::failed(NAME, format!("invalid port entry '{entry}'"));

        for entry in set.ports.iter().map(String::as_str) {
            match entry.rsplit_once(':') {
                Some((host, container)) => {
                    let host: u16 = host.trim().parse().map_err(|_| invalid(entry))?;
                    let key = container_port_key(container).ok_or_else(|| invalid(entry))?;
                    request.port_bindings.insert(key, host);
                }
                None => {
                    let key = container_port_key(entry).ok_or_else(|| invalid(entry))?;
                    if !request.exposed_ports.contains(&key) {
                        request.exposed_ports.push(key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{FakeRuntime, test_context};

    #[tokio::test]
    async fn test_bindings_and_exposed_ports() {
        let ctx = test_context(Arc::new(FakeRuntime::new()));
        let mut set = ContainerSet::defaults("dns");
        set.ports = vec!["8080:80".into(), "53/udp".into(), "5353:53/udp".into()];
        let mut request = CreationRequest::from_set(&set);

        StaticPorts.early(&ctx, &set, &mut request).await.unwrap();

        assert_eq!(request.port_bindings["80/tcp"], 8080);
        assert_eq!(request.port_bindings["53/udp"], 5353);
        assert_eq!(request.exposed_ports, vec!["53/udp"]);
    }

    #[tokio::test]
    async fn test_rejects_garbage() {
        let ctx = test_context(Arc::new(FakeRuntime::new()));
        let mut set = ContainerSet::defaults("web");
        set.ports = vec!["http:80".into()];
        let mut request = CreationRequest::from_set(&set);

        assert!(StaticPorts.early(&ctx, &set, &mut request).await.is_err());
    }
}
