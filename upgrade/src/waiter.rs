use models::cluster::{is_pod_running, ClusterClient, ClusterClientError};
use models::component::ControlPlaneComponent;

use async_trait::async_trait;
use snafu::ResultExt;
use std::future::Future;
use std::time::Duration;
use tracing::{event, instrument, Level};

#[cfg(test)]
use mockall::mock;

/// How long to wait for each control-plane component to come back after its manifest changes.
pub const DEFAULT_STATIC_POD_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Blocks until the cluster reaches some observable state.
#[async_trait]
pub trait Waiter: Send + Sync {
    /// Waits until at least one pod matching the label selector is running.
    async fn wait_for_pods_with_label(&self, label_selector: &str) -> Result<()>;
    /// Reads the current manifest hash of a component's mirror pod without waiting.
    async fn static_pod_hash(
        &self,
        node_name: &str,
        component: ControlPlaneComponent,
    ) -> Result<Option<String>>;
    /// Waits until a component's mirror pod reports a manifest hash different from `previous_hash`.
    async fn wait_for_static_pod_hash_change(
        &self,
        node_name: &str,
        component: ControlPlaneComponent,
        previous_hash: Option<String>,
    ) -> Result<()>;
}

#[cfg(test)]
mock! {
    /// A Mock Waiter for use in tests.
    pub Waiter {}
    #[async_trait]
    impl Waiter for Waiter {
        async fn wait_for_pods_with_label(&self, label_selector: &str) -> Result<()>;
        async fn static_pod_hash(
            &self,
            node_name: &str,
            component: ControlPlaneComponent,
        ) -> Result<Option<String>>;
        async fn wait_for_static_pod_hash_change(
            &self,
            node_name: &str,
            component: ControlPlaneComponent,
            previous_hash: Option<String>,
        ) -> Result<()>;
    }
}

/// A `Waiter` that polls the cluster at a fixed interval.
///
/// With no timeout set, waits poll until the condition holds.
#[derive(Clone)]
pub struct KubeWaiter<T: ClusterClient> {
    cluster_client: T,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl<T: ClusterClient> KubeWaiter<T> {
    pub fn new(cluster_client: T, timeout: Option<Duration>) -> Self {
        KubeWaiter {
            cluster_client,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Polls `condition` until it returns true. Errors from the cluster are treated as "not yet".
    async fn poll_until<F, Fut>(&self, description: String, mut condition: F) -> Result<()>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = std::result::Result<bool, ClusterClientError>> + Send,
    {
        let poll = async {
            loop {
                match condition().await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(err) => event!(
                        Level::DEBUG,
                        error = %err,
                        condition = %description,
                        "Error while polling, will retry."
                    ),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, poll).await.map_err(|_| {
                waiter_error::Error::Timeout {
                    condition: description.clone(),
                    timeout,
                }
            }),
            None => {
                poll.await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<T: ClusterClient> Waiter for KubeWaiter<T> {
    #[instrument(skip(self), err)]
    async fn wait_for_pods_with_label(&self, label_selector: &str) -> Result<()> {
        self.poll_until(
            format!("a running pod matching '{}'", label_selector),
            || async move {
                let pods = self.cluster_client.list_pods(label_selector).await?;
                Ok(pods.iter().any(is_pod_running))
            },
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn static_pod_hash(
        &self,
        node_name: &str,
        component: ControlPlaneComponent,
    ) -> Result<Option<String>> {
        self.cluster_client
            .get_static_pod_hash(node_name, component)
            .await
            .context(waiter_error::StaticPodHashSnafu {
                component,
                node_name,
            })
    }

    #[instrument(skip(self), err)]
    async fn wait_for_static_pod_hash_change(
        &self,
        node_name: &str,
        component: ControlPlaneComponent,
        previous_hash: Option<String>,
    ) -> Result<()> {
        let previous_hash = &previous_hash;
        self.poll_until(
            format!("the {} mirror pod hash to change", component),
            || async move {
                let hash = self
                    .cluster_client
                    .get_static_pod_hash(node_name, component)
                    .await?;
                Ok(hash.is_some() && &hash != previous_hash)
            },
        )
        .await
    }
}

type Result<T> = std::result::Result<T, waiter_error::Error>;

pub mod waiter_error {
    use models::cluster::ClusterClientError;
    use models::component::ControlPlaneComponent;
    use snafu::Snafu;
    use std::time::Duration;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Timed out after {:?} waiting for {}", timeout, condition))]
        Timeout { condition: String, timeout: Duration },

        #[snafu(display(
            "Unable to read the {} static pod hash on node '{}': '{}'",
            component,
            node_name,
            source
        ))]
        StaticPodHash {
            component: ControlPlaneComponent,
            node_name: String,
            source: ClusterClientError,
        },
    }
}
