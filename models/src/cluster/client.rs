use super::error::{self, Result};
use crate::component::ControlPlaneComponent;
use crate::constants::{
    ANNOTATION_CONFIG_MIRROR, API_SERVER_HEALTH_ROUTE, KUBEADM_CONFIG_MAP, NAMESPACE,
};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt};
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[cfg(feature = "mockall")]
use mockall::mock;

#[async_trait]
/// A trait providing the narrow slice of the Kubernetes API that a control-plane upgrade needs. This is
/// provided as a trait in order to allow mocks to be used for testing purposes.
pub trait ClusterClient: Clone + Sized + Send + Sync {
    /// Performs a GET against the API server health endpoint and returns the HTTP status code.
    async fn api_server_health(&self) -> Result<u16>;
    /// Returns the API server's reported git version, e.g. `v1.7.3`.
    async fn server_version(&self) -> Result<String>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    /// Fetches a DaemonSet in the system namespace, returning `None` if it does not exist.
    async fn get_daemonset(&self, name: &str) -> Result<Option<DaemonSet>>;
    /// Creates a DaemonSet in the system namespace, replacing it if it already exists.
    async fn create_or_update_daemonset(&self, daemonset: &DaemonSet) -> Result<()>;
    /// Deletes a DaemonSet and its pods in the foreground. Deleting an absent DaemonSet succeeds.
    async fn delete_daemonset(&self, name: &str) -> Result<()>;
    /// Fetches the cluster-stored kubeadm configuration record.
    async fn get_config_map(&self) -> Result<Option<ConfigMap>>;
    /// Creates or replaces the cluster-stored kubeadm configuration record.
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;
    /// Lists pods in the system namespace that match a label selector.
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>>;
    /// Returns the manifest hash the kubelet reports on a component's mirror pod, if the mirror pod exists.
    async fn get_static_pod_hash(
        &self,
        node_name: &str,
        component: ControlPlaneComponent,
    ) -> Result<Option<String>>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock ClusterClient for use in tests.
    pub ClusterClient {}
    #[async_trait]
    impl ClusterClient for ClusterClient {
        async fn api_server_health(&self) -> Result<u16>;
        async fn server_version(&self) -> Result<String>;
        async fn list_nodes(&self) -> Result<Vec<Node>>;
        async fn get_daemonset(&self, name: &str) -> Result<Option<DaemonSet>>;
        async fn create_or_update_daemonset(&self, daemonset: &DaemonSet) -> Result<()>;
        async fn delete_daemonset(&self, name: &str) -> Result<()>;
        async fn get_config_map(&self) -> Result<Option<ConfigMap>>;
        async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;
        async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>>;
        async fn get_static_pod_hash(
            &self,
            node_name: &str,
            component: ControlPlaneComponent,
        ) -> Result<Option<String>>;
    }

    impl Clone for ClusterClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> ClusterClient for Arc<T>
where
    T: ClusterClient,
{
    async fn api_server_health(&self) -> Result<u16> {
        (**self).api_server_health().await
    }

    async fn server_version(&self) -> Result<String> {
        (**self).server_version().await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        (**self).list_nodes().await
    }

    async fn get_daemonset(&self, name: &str) -> Result<Option<DaemonSet>> {
        (**self).get_daemonset(name).await
    }

    async fn create_or_update_daemonset(&self, daemonset: &DaemonSet) -> Result<()> {
        (**self).create_or_update_daemonset(daemonset).await
    }

    async fn delete_daemonset(&self, name: &str) -> Result<()> {
        (**self).delete_daemonset(name).await
    }

    async fn get_config_map(&self) -> Result<Option<ConfigMap>> {
        (**self).get_config_map().await
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        (**self).apply_config_map(config_map).await
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        (**self).list_pods(label_selector).await
    }

    async fn get_static_pod_hash(
        &self,
        node_name: &str,
        component: ControlPlaneComponent,
    ) -> Result<Option<String>> {
        (**self).get_static_pod_hash(node_name, component).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `ClusterClient` trait. This implementation will almost
/// certainly be used in any case that isn't a unit test.
pub struct K8SClusterClient {
    k8s_client: kube::client::Client,
}

impl K8SClusterClient {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8SClusterClient { k8s_client }
    }

    fn daemonsets(&self) -> Api<DaemonSet> {
        Api::namespaced(self.k8s_client.clone(), NAMESPACE)
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.k8s_client.clone(), NAMESPACE)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.k8s_client.clone(), NAMESPACE)
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

#[async_trait]
impl ClusterClient for K8SClusterClient {
    #[instrument(skip(self), err)]
    async fn api_server_health(&self) -> Result<u16> {
        let request = http::Request::get(API_SERVER_HEALTH_ROUTE)
            .body(Vec::new())
            .context(error::BuildRequestSnafu {
                route: API_SERVER_HEALTH_ROUTE,
            })?;

        // `request_text` only succeeds on a 2xx response; API errors carry the status code.
        match self.k8s_client.request_text(request).await {
            Ok(body) => {
                event!(Level::DEBUG, %body, "API server health endpoint responded.");
                Ok(200)
            }
            Err(kube::Error::Api(response)) => Ok(response.code),
            Err(err) => Err(err).context(error::ApiServerHealthSnafu),
        }
    }

    #[instrument(skip(self), err)]
    async fn server_version(&self) -> Result<String> {
        let info = self
            .k8s_client
            .apiserver_version()
            .await
            .context(error::ServerVersionSnafu)?;
        Ok(info.git_version)
    }

    #[instrument(skip(self), err)]
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        let node_list = nodes
            .list(&ListParams::default())
            .await
            .context(error::ListNodesSnafu)?;
        Ok(node_list.items)
    }

    #[instrument(skip(self), err)]
    async fn get_daemonset(&self, name: &str) -> Result<Option<DaemonSet>> {
        self.daemonsets()
            .get_opt(name)
            .await
            .context(error::GetDaemonSetSnafu { name })
    }

    #[instrument(skip(self, daemonset), fields(name = ?daemonset.metadata.name), err)]
    async fn create_or_update_daemonset(&self, daemonset: &DaemonSet) -> Result<()> {
        let name = daemonset
            .metadata
            .name
            .clone()
            .context(error::DaemonSetWithoutNameSnafu)?;
        let api = self.daemonsets();

        match api.create(&PostParams::default(), daemonset).await {
            Ok(_) => Ok(()),
            Err(err) if is_status(&err, 409) => {
                event!(
                    Level::DEBUG,
                    %name,
                    "DaemonSet already exists, replacing it."
                );
                api.replace(&name, &PostParams::default(), daemonset)
                    .await
                    .context(error::UpdateDaemonSetSnafu { name: name.clone() })?;
                Ok(())
            }
            Err(err) => Err(err).context(error::CreateDaemonSetSnafu { name }),
        }
    }

    #[instrument(skip(self), err)]
    async fn delete_daemonset(&self, name: &str) -> Result<()> {
        match self
            .daemonsets()
            .delete(name, &DeleteParams::foreground())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_status(&err, 404) => Ok(()),
            Err(err) => Err(err).context(error::DeleteDaemonSetSnafu { name }),
        }
    }

    #[instrument(skip(self), err)]
    async fn get_config_map(&self) -> Result<Option<ConfigMap>> {
        self.config_maps()
            .get_opt(KUBEADM_CONFIG_MAP)
            .await
            .context(error::GetConfigMapSnafu {
                name: KUBEADM_CONFIG_MAP,
            })
    }

    #[instrument(skip(self, config_map), err)]
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let api = self.config_maps();
        let name = config_map.name_any();

        match api.create(&PostParams::default(), config_map).await {
            Ok(_) => Ok(()),
            Err(err) if is_status(&err, 409) => {
                api.replace(&name, &PostParams::default(), config_map)
                    .await
                    .context(error::WriteConfigMapSnafu { name: name.clone() })?;
                Ok(())
            }
            Err(err) => Err(err).context(error::WriteConfigMapSnafu { name }),
        }
    }

    #[instrument(skip(self), err)]
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let pod_list = self
            .pods()
            .list(&ListParams::default().labels(label_selector))
            .await
            .context(error::ListPodsSnafu {
                selector: label_selector,
            })?;
        Ok(pod_list.items)
    }

    #[instrument(skip(self), err)]
    async fn get_static_pod_hash(
        &self,
        node_name: &str,
        component: ControlPlaneComponent,
    ) -> Result<Option<String>> {
        let name = component.mirror_pod_name(node_name);
        let mirror_pod = self
            .pods()
            .get_opt(&name)
            .await
            .context(error::GetMirrorPodSnafu { name: name.clone() })?;

        Ok(mirror_pod.and_then(|pod| pod.annotations().get(ANNOTATION_CONFIG_MIRROR).cloned()))
    }
}
