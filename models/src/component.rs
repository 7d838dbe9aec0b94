use crate::constants::{LABEL_COMPONENT, LABEL_K8S_APP, PREPULL_PREFIX, SELF_HOSTED_PREFIX};

use serde::{Deserialize, Serialize};
use std::fmt;

/// A control-plane component managed by kubeadm.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlPlaneComponent {
    KubeApiServer,
    KubeControllerManager,
    KubeScheduler,
}

/// The canonical, ordered list of control-plane components.
///
/// Pre-pulling, health checking and the static pod upgrade all iterate this list, and upgrades
/// are always applied in this order.
pub const CONTROL_PLANE_COMPONENTS: [ControlPlaneComponent; 3] = [
    ControlPlaneComponent::KubeApiServer,
    ControlPlaneComponent::KubeControllerManager,
    ControlPlaneComponent::KubeScheduler,
];

impl ControlPlaneComponent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::KubeApiServer => "kube-apiserver",
            Self::KubeControllerManager => "kube-controller-manager",
            Self::KubeScheduler => "kube-scheduler",
        }
    }

    /// File name of the component's static pod manifest.
    pub fn manifest_file_name(&self) -> String {
        format!("{}.yaml", self.name())
    }

    /// Name of the DaemonSet used to pre-pull this component's image.
    pub fn prepull_name(&self) -> String {
        format!("{}{}", PREPULL_PREFIX, self.name())
    }

    /// Label selector matching the pods of this component's pre-pull DaemonSet.
    pub fn prepull_label_selector(&self) -> String {
        format!("{}={}", LABEL_K8S_APP, self.prepull_name())
    }

    /// Name of the DaemonSet running this component in a self-hosted control plane.
    pub fn self_hosted_name(&self) -> String {
        format!("{}{}", SELF_HOSTED_PREFIX, self.name())
    }

    /// Label selector matching this component's (static or self-hosted) pods.
    pub fn label_selector(&self) -> String {
        format!("{}={}", LABEL_COMPONENT, self.name())
    }

    /// The kubelet names mirror pods `<component>-<node name>`.
    pub fn mirror_pod_name(&self, node_name: &str) -> String {
        format!("{}-{}", self.name(), node_name)
    }

    /// Fully qualified image for this component at the given version.
    pub fn image(&self, image_repository: &str, version: &str) -> String {
        format!("{}/{}-amd64:{}", image_repository, self.name(), version)
    }
}

impl fmt::Display for ControlPlaneComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
