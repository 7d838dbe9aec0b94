use crate::component::ControlPlaneComponent;
use crate::constants::{
    APP_COMPONENT, APP_MANAGED_BY, APP_NAME, KUBEADM, LABEL_K8S_APP, LABEL_NODE_ROLE_MASTER,
    LABEL_UPGRADE_PHASE, NAMESPACE,
};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use maplit::btreemap;

const PREPULL_PHASE: &str = "prepull";

/// Defines the DaemonSet that forces every master node to pull `image` for the given component.
///
/// The container only sleeps; once a pod is running the image is present on the node and the
/// DaemonSet can be deleted.
pub fn prepull_daemonset(component: ControlPlaneComponent, image: String) -> DaemonSet {
    let name = component.prepull_name();
    let labels = btreemap! {
        APP_NAME => name.as_str(),
        APP_COMPONENT => component.name(),
        APP_MANAGED_BY => KUBEADM,
        LABEL_UPGRADE_PHASE => PREPULL_PHASE,
    }
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    DaemonSet {
        metadata: ObjectMeta {
            labels: Some(labels),
            name: Some(name.clone()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(btreemap! { LABEL_K8S_APP.to_string() => name.clone() }),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(btreemap! { LABEL_K8S_APP.to_string() => name }),
                    namespace: Some(NAMESPACE.to_string()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: component.name().to_string(),
                        image: Some(image),
                        command: Some(vec!["/bin/sleep".to_string(), "3600".to_string()]),
                        ..Default::default()
                    }],
                    node_selector: Some(btreemap! {
                        LABEL_NODE_ROLE_MASTER.to_string() => String::new(),
                    }),
                    tolerations: Some(vec![Toleration {
                        key: Some(LABEL_NODE_ROLE_MASTER.to_string()),
                        effect: Some("NoSchedule".to_string()),
                        ..Default::default()
                    }]),
                    termination_grace_period_seconds: Some(0),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prepull_daemonset() {
        let image = "gcr.io/google_containers/kube-scheduler-amd64:v1.8.1".to_string();
        let ds = prepull_daemonset(ControlPlaneComponent::KubeScheduler, image.clone());

        assert_eq!(
            ds.metadata.name.as_deref(),
            Some("upgrade-prepull-kube-scheduler")
        );
        assert_eq!(ds.metadata.namespace.as_deref(), Some(NAMESPACE));

        let spec = ds.spec.unwrap();
        let selector = spec.selector.match_labels.unwrap();
        let template_labels = spec.template.metadata.unwrap().labels.unwrap();
        // The selector must match the template or the API server rejects the DaemonSet.
        assert_eq!(selector, template_labels);
        assert_eq!(
            selector.get(LABEL_K8S_APP).map(String::as_str),
            Some("upgrade-prepull-kube-scheduler")
        );

        let pod_spec = spec.template.spec.unwrap();
        assert_eq!(pod_spec.containers.len(), 1);
        assert_eq!(pod_spec.containers[0].image.as_ref(), Some(&image));
        assert!(pod_spec
            .node_selector
            .unwrap()
            .contains_key(LABEL_NODE_ROLE_MASTER));
    }
}
