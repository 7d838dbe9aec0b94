use super::error::{self, Result};
use models::component::ControlPlaneComponent;
use models::config::InternalMasterConfiguration;

use k8s_openapi::api::core::v1::Pod;
use snafu::{ensure, OptionExt, ResultExt};
use std::fs;
use std::path::Path;

#[cfg(test)]
use mockall::mock;

/// Produces the upgraded static pod manifest for a component.
pub trait ManifestRenderer: Send + Sync {
    /// Renders the upgraded manifest for `component` from its `live` manifest into `output`.
    fn render(
        &self,
        component: ControlPlaneComponent,
        config: &InternalMasterConfiguration,
        live: &Path,
        output: &Path,
    ) -> Result<()>;
}

#[cfg(test)]
mock! {
    /// A Mock ManifestRenderer for use in tests.
    pub ManifestRenderer {}
    impl ManifestRenderer for ManifestRenderer {
        fn render(
            &self,
            component: ControlPlaneComponent,
            config: &InternalMasterConfiguration,
            live: &Path,
            output: &Path,
        ) -> Result<()>;
    }
}

/// Renders by rewriting the component container's image in the live manifest.
///
/// Everything else about the pod (flags, mounts, probes) carries over unchanged.
#[derive(Clone, Debug, Default)]
pub struct ImageRewriteRenderer;

impl ManifestRenderer for ImageRewriteRenderer {
    fn render(
        &self,
        component: ControlPlaneComponent,
        config: &InternalMasterConfiguration,
        live: &Path,
        output: &Path,
    ) -> Result<()> {
        let yaml = fs::read_to_string(live).context(error::ReadManifestSnafu {
            component,
            path: live,
        })?;
        let mut pod: Pod = serde_yaml::from_str(&yaml).context(error::DecodeManifestSnafu {
            component,
            path: live,
        })?;

        let image = component.image(&config.image_repository, &config.kubernetes_version);
        let spec = pod
            .spec
            .as_mut()
            .context(error::MissingPodSpecSnafu { component })?;
        // Static pods carry one container named after the component; fall back to the only container.
        let single_container = spec.containers.len() == 1;
        let mut rewritten = 0;
        for container in spec.containers.iter_mut() {
            if container.name == component.name() || single_container {
                container.image = Some(image.clone());
                rewritten += 1;
            }
        }
        ensure!(rewritten > 0, error::MissingContainerSnafu { component });

        let rendered =
            serde_yaml::to_string(&pod).context(error::EncodeManifestSnafu { component })?;
        fs::write(output, rendered).context(error::WriteManifestSnafu {
            component,
            path: output,
        })
    }
}
