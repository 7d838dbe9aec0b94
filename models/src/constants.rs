/// Helper macro to avoid retyping the base domain-like name of kubeadm objects when creating further
/// string constants from it. When given no parameters, this returns the base domain-like name. When
/// given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! kubeadm_domain {
    () => {
        "kubeadm.kubernetes.io"
    };
    ($s:literal) => {
        concat!(kubeadm_domain!(), "/", $s)
    };
}

/// All control-plane objects touched by an upgrade live in the system namespace.
pub const NAMESPACE: &str = "kube-system";
pub const KUBEADM: &str = "kubeadm";

/// Version of this tool. Upgrades to targets newer than this are subject to skew policy.
pub const TOOL_VERSION: &str = "v1.8.1";
/// The oldest control-plane version that may be upgraded to.
pub const MINIMUM_CONTROL_PLANE_VERSION: &str = "v1.7.0";

// Label keys
pub const LABEL_COMPONENT: &str = "component";
pub const LABEL_K8S_APP: &str = "k8s-app";
pub const LABEL_NODE_ROLE_MASTER: &str = "node-role.kubernetes.io/master";
pub const LABEL_UPGRADE_PHASE: &str = kubeadm_domain!("upgrade-phase");

// Annotation set by the kubelet on mirror pods; its value is the hash of the static pod manifest.
pub const ANNOTATION_CONFIG_MIRROR: &str = "kubernetes.io/config.mirror";

// Standard tags https://kubernetes.io/docs/concepts/overview/working-with-objects/common-labels/
pub const APP_NAME: &str = "app.kubernetes.io/name";
pub const APP_COMPONENT: &str = "app.kubernetes.io/component";
pub const APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

// Cluster-stored configuration
pub const KUBEADM_CONFIG_MAP: &str = "kubeadm-config";
pub const KUBEADM_CONFIG_MAP_KEY: &str = "MasterConfiguration";

// Static pod manifests
pub const DEFAULT_MANIFESTS_DIR: &str = "/etc/kubernetes/manifests";
pub const DEFAULT_KUBECONFIG_PATH: &str = "/etc/kubernetes/admin.conf";
pub const DEFAULT_IMAGE_REPOSITORY: &str = "gcr.io/google_containers";
pub const DEFAULT_KUBERNETES_VERSION: &str = "stable-1.8";
pub const DEFAULT_API_BIND_PORT: i32 = 6443;

// Prefixes for objects created on behalf of an upgrade.
pub const PREPULL_PREFIX: &str = "upgrade-prepull-";
pub const SELF_HOSTED_PREFIX: &str = "self-hosted-";

// API server health endpoint.
pub const API_SERVER_HEALTH_ROUTE: &str = "/healthz";
