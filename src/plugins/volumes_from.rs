//! Cross-set volume sharing.

use async_trait::async_trait;

use crate::config::ContainerSet;
use crate::context::AppContext;
use crate::error::HookError;
use crate::hooks::Plugin;
use crate::reconciler::newest_in_group;
use crate::runtime::CreationRequest;

const NAME: &str = "volumes-from";

/// Mounts the volumes of the newest container of each `volumesFrom` group.
///
/// The container id goes into `volumes_from`; its named volumes are also
/// mirrored as explicit `name:destination` binds so the new container keeps
/// them even after that container is collected.
pub struct VolumesFrom;

#[async_trait]
impl Plugin for VolumesFrom {
    fn name(&self) -> &str {
        NAME
    }

    async fn early(
        &self,
        ctx: &AppContext,
        set: &ContainerSet,
        request: &mut CreationRequest,
    ) -> Result<(), HookError> {
        for group in &set.volumes_from {
            let source = newest_in_group(ctx.runtime.as_ref(), group)
                .await
                .map_err(|source| HookError::Runtime {
                    plugin: NAME.to_string(),
                    source,
                })?
                .ok_or_else(|| {
                    HookError::abort(NAME, format!("no container for volumes-from group {group}"))
                })?;

            tracing::debug!(
                set = %set.id,
                group = %group,
                container = %source.short_id(),
                "Mounting volumes from newest group member"
            );

            for mount in &source.mounts {
                if let Some(name) = &mount.name {
                    let bind = format!("{}:{}", name, mount.destination);
                    if !request.binds.contains(&bind) {
                        request.binds.push(bind);
                    }
                }
            }
            request.volumes_from.push(source.id);
        }
        Ok(())
    }
}
