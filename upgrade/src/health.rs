//! Pre-upgrade cluster health checks.
//!
//! Checks run strictly in order and the first failure aborts the pass.
use models::cluster::{daemonset_unhealthy_reason, not_ready_node_names, ClusterClient};
use models::component::{ControlPlaneComponent, CONTROL_PLANE_COMPONENTS};

use snafu::{ensure, ResultExt};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{event, instrument, Level};

/// How the control plane components are run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HostingType {
    /// Components run as DaemonSets managed by the cluster itself.
    SelfHosted,
    /// Components run as kubelet static pods defined by manifest files on the master.
    StaticPod,
}

impl fmt::Display for HostingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfHosted => write!(f, "self-hosted"),
            Self::StaticPod => write!(f, "static pod-hosted"),
        }
    }
}

/// One named health check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HealthCheck {
    ApiServerHealth,
    NodesReady,
    SelfHostedControlPlane,
    StaticPodManifests,
}

impl HealthCheck {
    pub fn description(&self) -> &'static str {
        match self {
            Self::ApiServerHealth => "API Server health",
            Self::NodesReady => "Node health",
            Self::SelfHostedControlPlane => "Control plane DaemonSet health",
            Self::StaticPodManifests => "Static Pod manifests exist on disk",
        }
    }

    pub fn ok_message(&self) -> &'static str {
        match self {
            Self::ApiServerHealth => "Healthy",
            Self::NodesReady => "All Nodes are healthy",
            Self::SelfHostedControlPlane => "All control plane DaemonSets are healthy",
            Self::StaticPodManifests => "All required Static Pod manifests exist on disk",
        }
    }

    pub fn fail_message(&self) -> &'static str {
        match self {
            Self::ApiServerHealth => "The API Server is unhealthy",
            Self::NodesReady => "There are NotReady Nodes in the cluster",
            Self::SelfHostedControlPlane => "The control plane DaemonSets are not healthy",
            Self::StaticPodManifests => "Some Static Pod manifests are missing",
        }
    }
}

/// Checks that apply regardless of how the control plane is hosted, in the order they run.
pub const GENERIC_CHECKS: [HealthCheck; 2] = [HealthCheck::ApiServerHealth, HealthCheck::NodesReady];

impl HostingType {
    /// The check that runs after the generic checks for this hosting type.
    pub fn health_check(&self) -> HealthCheck {
        match self {
            Self::SelfHosted => HealthCheck::SelfHostedControlPlane,
            Self::StaticPod => HealthCheck::StaticPodManifests,
        }
    }
}

pub struct ClusterHealthChecker<'a, T: ClusterClient> {
    cluster_client: &'a T,
    manifests_dir: PathBuf,
}

impl<'a, T: ClusterClient> ClusterHealthChecker<'a, T> {
    pub fn new<P: AsRef<Path>>(cluster_client: &'a T, manifests_dir: P) -> Self {
        ClusterHealthChecker {
            cluster_client,
            manifests_dir: manifests_dir.as_ref().to_path_buf(),
        }
    }

    /// Runs every health check in order, failing on the first one that does not pass.
    ///
    /// Returns the detected hosting type of the control plane.
    #[instrument(skip(self), err)]
    pub async fn verify_cluster_health(&self) -> Result<HostingType> {
        event!(Level::INFO, "Making sure the cluster is healthy.");

        for check in GENERIC_CHECKS {
            self.run_check(check).await?;
        }
        let hosting_type = self.detect_hosting_type().await?;
        event!(Level::INFO, %hosting_type, "Detected control plane hosting type.");
        self.run_check(hosting_type.health_check()).await?;
        Ok(hosting_type)
    }

    async fn run_check(&self, check: HealthCheck) -> Result<()> {
        let result = match check {
            HealthCheck::ApiServerHealth => self.check_api_server_health().await,
            HealthCheck::NodesReady => self.check_nodes_ready().await,
            HealthCheck::SelfHostedControlPlane => self.check_self_hosted_control_plane().await,
            HealthCheck::StaticPodManifests => self.check_static_pod_manifests(),
        };
        result?;
        event!(
            Level::INFO,
            check = check.description(),
            "{}",
            check.ok_message()
        );
        Ok(())
    }

    /// A control plane is self-hosted if any of its component DaemonSets exist.
    async fn detect_hosting_type(&self) -> Result<HostingType> {
        for component in CONTROL_PLANE_COMPONENTS {
            let daemonset = self
                .cluster_client
                .get_daemonset(&component.self_hosted_name())
                .await
                .context(health_error::ClusterSnafu {
                    check: HealthCheck::SelfHostedControlPlane,
                })?;
            if daemonset.is_some() {
                return Ok(HostingType::SelfHosted);
            }
        }
        Ok(HostingType::StaticPod)
    }

    async fn check_api_server_health(&self) -> Result<()> {
        let status = self
            .cluster_client
            .api_server_health()
            .await
            .context(health_error::ClusterSnafu {
                check: HealthCheck::ApiServerHealth,
            })?;
        ensure!(status == 200, health_error::ApiServerUnhealthySnafu { status });
        Ok(())
    }

    async fn check_nodes_ready(&self) -> Result<()> {
        let nodes = self
            .cluster_client
            .list_nodes()
            .await
            .context(health_error::ClusterSnafu {
                check: HealthCheck::NodesReady,
            })?;
        let not_ready = not_ready_node_names(&nodes);
        ensure!(
            not_ready.is_empty(),
            health_error::NodesNotReadySnafu {
                nodes: not_ready.join(", ")
            }
        );
        Ok(())
    }

    async fn check_self_hosted_control_plane(&self) -> Result<()> {
        let mut unhealthy = Vec::new();
        for component in CONTROL_PLANE_COMPONENTS {
            if let Some(reason) = self.daemonset_problem(component).await? {
                unhealthy.push(format!("{}: {}", component.self_hosted_name(), reason));
            }
        }

        ensure!(
            unhealthy.len() < CONTROL_PLANE_COMPONENTS.len(),
            health_error::NotSelfHostedSnafu
        );
        ensure!(
            unhealthy.is_empty(),
            health_error::ControlPlaneDaemonSetsUnhealthySnafu {
                details: unhealthy.join("; ")
            }
        );
        Ok(())
    }

    async fn daemonset_problem(&self, component: ControlPlaneComponent) -> Result<Option<String>> {
        let name = component.self_hosted_name();
        let daemonset = self
            .cluster_client
            .get_daemonset(&name)
            .await
            .context(health_error::ClusterSnafu {
                check: HealthCheck::SelfHostedControlPlane,
            })?;

        Ok(match daemonset {
            None => Some("not found".to_string()),
            Some(daemonset) => match daemonset.status {
                None => Some("no status reported".to_string()),
                Some(status) => daemonset_unhealthy_reason(&status),
            },
        })
    }

    fn check_static_pod_manifests(&self) -> Result<()> {
        let missing: Vec<String> = CONTROL_PLANE_COMPONENTS
            .iter()
            .map(|component| self.manifests_dir.join(component.manifest_file_name()))
            .filter(|path| !path.exists())
            .map(|path| path.display().to_string())
            .collect();
        ensure!(
            missing.is_empty(),
            health_error::MissingManifestsSnafu {
                paths: missing.join(", ")
            }
        );
        Ok(())
    }
}

type Result<T> = std::result::Result<T, health_error::Error>;

pub mod health_error {
    use super::HealthCheck;
    use models::cluster::ClusterClientError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display(
            "[{}] {}; unable to query the cluster: '{}'",
            check.description(),
            check.fail_message(),
            source
        ))]
        Cluster {
            check: HealthCheck,
            source: ClusterClientError,
        },

        #[snafu(display(
            "[{}] {}; /healthz didn't return \"ok\" (status {})",
            HealthCheck::ApiServerHealth.description(),
            HealthCheck::ApiServerHealth.fail_message(),
            status
        ))]
        ApiServerUnhealthy { status: u16 },

        #[snafu(display(
            "[{}] {}: {}",
            HealthCheck::NodesReady.description(),
            HealthCheck::NodesReady.fail_message(),
            nodes
        ))]
        NodesNotReady { nodes: String },

        #[snafu(display(
            "[{}] {}; none of them are healthy, so this control plane is not actually self-hosted",
            HealthCheck::SelfHostedControlPlane.description(),
            HealthCheck::SelfHostedControlPlane.fail_message()
        ))]
        NotSelfHosted,

        #[snafu(display(
            "[{}] {}: {}",
            HealthCheck::SelfHostedControlPlane.description(),
            HealthCheck::SelfHostedControlPlane.fail_message(),
            details
        ))]
        ControlPlaneDaemonSetsUnhealthy { details: String },

        #[snafu(display(
            "[{}] {} ({}); an upgrade of a static pod-hosted cluster must run on a master node",
            HealthCheck::StaticPodManifests.description(),
            HealthCheck::StaticPodManifests.fail_message(),
            paths
        ))]
        MissingManifests { paths: String },
    }
}
