//! `{{TOKEN}}` substitution in env values.
//!
//! Entries are rewritten one at a time in list order. A token resolves to a
//! host fact when one exists, otherwise to the current value of the env entry
//! with that key. Earlier entries are therefore seen already rewritten and
//! later ones raw. Substituted text is never scanned again, and unknown tokens
//! stay as written.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::{Captures, Regex};

use crate::config::ContainerSet;
use crate::context::AppContext;
use crate::error::HookError;
use crate::hooks::Plugin;
use crate::runtime::CreationRequest;

const NAME: &str = "env-template";

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(\w+)\}\}").expect("token pattern is valid"));

/// Dynamic facts available to templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateFacts {
    values: HashMap<String, String>,
}

impl TemplateFacts {
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Collect facts from the runtime host and the request. The host name is
    /// only resolved to an address when `resolve_ip` is set.
    pub async fn gather(
        ctx: &AppContext,
        request: &CreationRequest,
        resolve_ip: bool,
    ) -> Result<Self, HookError> {
        let info = ctx.runtime.info().await.map_err(|source| HookError::Runtime {
            plugin: NAME.to_string(),
            source,
        })?;

        let mut facts = Self::default();
        let hostname = info
            .name
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|h| !h.is_empty());
        if let Some(hostname) = hostname {
            if resolve_ip && let Some(ip) = lookup_ip(&hostname).await {
                facts.insert("IP", ip.to_string());
            }
            facts.insert("HOSTNAME", hostname);
        }

        let optional = [
            ("DOCKER_VERSION", info.server_version),
            ("DOCKER_ARCH", info.architecture),
            ("HTTP_PROXY", info.http_proxy),
            ("HTTPS_PROXY", info.https_proxy),
            ("NO_PROXY", info.no_proxy),
            ("CONTAINER_NAME", request.name.clone()),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                facts.insert(key, value);
            }
        }
        Ok(facts)
    }
}

/// First address `hostname` resolves to, preferring IPv4.
async fn lookup_ip(hostname: &str) -> Option<IpAddr> {
    match tokio::net::lookup_host((hostname, 0)).await {
        Ok(addrs) => {
            let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            addrs
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
        }
        Err(e) => {
            tracing::debug!("Could not resolve {}: {}", hostname, e);
            None
        }
    }
}

fn lookup_env<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter().find_map(|entry| {
        entry
            .split_once('=')
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v)
    })
}

/// Rewrite every `KEY=VALUE` entry of `env` in a single ordered pass.
pub fn render_env(env: &mut [String], facts: &TemplateFacts) {
    for i in 0..env.len() {
        let current: &[String] = env;
        let Some((key, value)) = current[i].split_once('=') else {
            continue;
        };
        if !TOKEN.is_match(value) {
            continue;
        }

        let rendered = TOKEN.replace_all(value, |caps: &Captures| {
            let token = &caps[1];
            facts
                .get(token)
                .or_else(|| lookup_env(current, token))
                .map(str::to_string)
                .unwrap_or_else(|| caps[0].to_string())
        });
        let entry = format!("{key}={rendered}");
        env[i] = entry;
    }
}

/// Late hook substituting templates in the request env.
pub struct EnvTemplate;

#[async_trait]
impl Plugin for EnvTemplate {
    fn name(&self) -> &str {
        NAME
    }

    async fn late(
        &self,
        ctx: &AppContext,
        set: &ContainerSet,
        request: &mut CreationRequest,
    ) -> Result<(), HookError> {
        if !request.env.iter().any(|e| TOKEN.is_match(e)) {
            return Ok(());
        }
        let wants_ip = request.env.iter().any(|e| e.contains("{{IP}}"));
        let facts = TemplateFacts::gather(ctx, request, wants_ip).await?;
        render_env(&mut request.env, &facts);
        tracing::trace!(set = %set.id, "Rendered env templates");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::runtime::RuntimeInfo;
    use crate::testing::{FakeRuntime, test_context};

    fn env(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|e| e.to_string()).collect()
    }

    fn host_facts() -> TemplateFacts {
        let mut facts = TemplateFacts::default();
        facts.insert("HOSTNAME", "node-1");
        facts
    }

    #[test]
    fn test_substitutes_facts_and_earlier_entries() {
        let mut entries = env(&["A=x", "B={{A}}-{{HOSTNAME}}"]);
        render_env(&mut entries, &host_facts());
        assert_eq!(entries, env(&["A=x", "B=x-node-1"]));
    }

    #[test]
    fn test_single_pass_is_order_dependent() {
        let mut entries = env(&["A=x", "B={{A}}", "C={{B}}", "D={{E}}", "E={{A}}"]);
        render_env(&mut entries, &TemplateFacts::default());
        // C sees B already rewritten, D sees E before it was rewritten.
        assert_eq!(
            entries,
            env(&["A=x", "B=x", "C=x", "D={{A}}", "E=x"])
        );
    }

    #[test]
    fn test_unknown_tokens_are_left_verbatim() {
        let mut entries = env(&["URL=http://{{NOPE}}:{{PORT}}", "PORT=8080"]);
        render_env(&mut entries, &TemplateFacts::default());
        assert_eq!(entries[0], "URL=http://{{NOPE}}:8080");
    }

    #[tokio::test]
    async fn test_late_hook_uses_runtime_facts() {
        let runtime = FakeRuntime::new().with_info(RuntimeInfo {
            name: Some("localhost".to_string()),
            server_version: Some("27.1.1".to_string()),
            architecture: Some("aarch64".to_string()),
            ..Default::default()
        });
        let ctx = test_context(Arc::new(runtime));
        let mut set = ContainerSet::defaults("web");
        set.name = Some("web-main".to_string());
        set.env = env(&[
            "UA=docker/{{DOCKER_VERSION}} ({{DOCKER_ARCH}})",
            "SELF={{CONTAINER_NAME}}@{{HOSTNAME}}",
        ]);
        let mut request = CreationRequest::from_set(&set);

        EnvTemplate.late(&ctx, &set, &mut request).await.unwrap();

        assert_eq!(request.env_value("UA"), Some("docker/27.1.1 (aarch64)"));
        assert_eq!(request.env_value("SELF"), Some("web-main@localhost"));
    }
}
