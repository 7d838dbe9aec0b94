mod client;
mod error;

pub use self::client::*;
pub use self::error::Error as ClusterClientError;

use k8s_openapi::api::apps::v1::DaemonSetStatus;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

/// Returns true if the node reports the `Ready` condition as `True`.
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

/// Returns the names of every node that does not report `Ready`.
pub fn not_ready_node_names(nodes: &[Node]) -> Vec<String> {
    nodes
        .iter()
        .filter(|node| !is_node_ready(node))
        .map(|node| node.name_any())
        .collect()
}

pub fn is_pod_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_ref().map(|s| s == "Running"))
        .unwrap_or(false)
}

/// Describes why a DaemonSet status is unhealthy, or `None` if it is healthy.
///
/// A healthy DaemonSet has scheduled every desired pod and has at least one pod available and ready.
pub fn daemonset_unhealthy_reason(status: &DaemonSetStatus) -> Option<String> {
    if status.current_number_scheduled != status.desired_number_scheduled {
        return Some(format!(
            "current number scheduled ({}) does not match desired number scheduled ({})",
            status.current_number_scheduled, status.desired_number_scheduled
        ));
    }
    if status.number_available.unwrap_or(0) <= 0 {
        return Some("no available pods".to_string());
    }
    if status.number_ready <= 0 {
        return Some("no ready pods".to_string());
    }
    None
}

/// Builds a node named `name` whose `Ready` condition has status `ready`.
#[cfg(any(test, feature = "mockall"))]
pub fn fake_node(name: &str, ready: &str) -> Node {
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use kube::api::ObjectMeta;

    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: ready.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
