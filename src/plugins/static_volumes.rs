//! Static bind-mount translation.

use std::path::Path;

use async_trait::async_trait;

use crate::config::ContainerSet;
use crate::context::AppContext;
use crate::error::HookError;
use crate::hooks::Plugin;
use crate::runtime::CreationRequest;

const NAME: &str = "static-volumes";

/// How one `volumes` entry is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeMount {
    /// `host:container[:mode]` or `volume:container[:mode]`, passed as a bind.
    Bind(String),
    /// A bare absolute container path; the runtime creates an anonymous volume.
    Anonymous(String),
}

/// Turn one `volumes` entry into a runtime mount.
///
/// Host paths that start with `.` or contain `/` are paths; relative ones are
/// resolved against `base_dir`. Anything else is a named volume and passes
/// through unchanged. A lone absolute path is an anonymous volume. Returns
/// `None` for anything else.
pub fn translate_volume(entry: &str, base_dir: &Path) -> Option<VolumeMount> {
    let Some((host, rest)) = entry.split_once(':') else {
        return entry
            .starts_with('/')
            .then(|| VolumeMount::Anonymous(entry.to_string()));
    };
    if host.is_empty() || rest.is_empty() {
        return None;
    }

    let is_path = host.starts_with('.') || host.contains('/') || host.starts_with('~');
    if !is_path {
        return Some(VolumeMount::Bind(entry.to_string()));
    }

    let host_path = Path::new(host);
    let resolved = if host_path.is_absolute() {
        host_path.to_path_buf()
    } else if let Some(stripped) = host.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        Path::new(&home).join(stripped)
    } else {
        base_dir.join(host_path)
    };
    Some(VolumeMount::Bind(format!("{}:{}", resolved.display(), rest)))
}

/// Adds the set's `volumes` to the request's binds and anonymous volumes.
pub struct StaticVolumes;

#[async_trait]
impl Plugin for StaticVolumes {
    fn name(&self) -> &str {
        NAME
    }

    async fn early(
        &self,
        ctx: &AppContext,
        set: &ContainerSet,
        request: &mut CreationRequest,
    ) -> Result<(), HookError> {
        for entry in &set.volumes {
            match translate_volume(entry, &ctx.config.base_dir) {
                Some(VolumeMount::Bind(bind)) => request.binds.push(bind),
                Some(VolumeMount::Anonymous(path)) => request.volumes.push(path),
                None => {
                    return Err(HookError::failed(
                        NAME,
                        format!("volume '{entry}' is not host:container[:mode] or /path"),
                    ));
                }
            }
        }
        Ok(())
    }
}
