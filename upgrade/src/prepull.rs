//! Pre-pulls control-plane images on every master before any manifest is touched.
//!
//! Each component gets an ephemeral DaemonSet whose only purpose is to make the container runtime pull
//! the target image. The DaemonSets are created in order, waited on concurrently, and each one is
//! deleted as soon as its pods run.
use crate::waiter::Waiter;
use models::cluster::ClusterClient;
use models::component::{ControlPlaneComponent, CONTROL_PLANE_COMPONENTS};
use models::prepull::prepull_daemonset;

use async_trait::async_trait;
use snafu::ResultExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{event, instrument, Level};

pub const DEFAULT_PREPULL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// What happens to pre-pull DaemonSets that have not completed when the timeout fires.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TimeoutCleanupPolicy {
    /// Leave them in the cluster for the operator to inspect and remove.
    #[default]
    Leave,
    /// Delete them before reporting the timeout.
    Delete,
}

/// The per-component create/wait/delete steps of a pre-pull cycle.
#[async_trait]
pub trait Prepuller: Send + Sync {
    /// Creates (or updates) the resource that pulls `image` for `component`.
    async fn create_func(&self, component: ControlPlaneComponent, image: &str) -> Result<()>;
    /// Blocks until the component's image is present; this has no timeout of its own.
    async fn wait_func(&self, component: ControlPlaneComponent) -> Result<()>;
    /// Removes the component's pre-pull resource.
    async fn delete_func(&self, component: ControlPlaneComponent) -> Result<()>;
}

/// A `Prepuller` that uses DaemonSets restricted to master nodes.
pub struct DaemonSetPrepuller<T: ClusterClient, W: Waiter> {
    cluster_client: T,
    // Must not have a timeout; the pre-pull cycle has one global timeout.
    waiter: W,
}

impl<T: ClusterClient, W: Waiter> DaemonSetPrepuller<T, W> {
    pub fn new(cluster_client: T, waiter: W) -> Self {
        DaemonSetPrepuller {
            cluster_client,
            waiter,
        }
    }
}

#[async_trait]
impl<T: ClusterClient, W: Waiter> Prepuller for DaemonSetPrepuller<T, W> {
    #[instrument(skip(self), err)]
    async fn create_func(&self, component: ControlPlaneComponent, image: &str) -> Result<()> {
        let daemonset = prepull_daemonset(component, image.to_string());
        self.cluster_client
            .create_or_update_daemonset(&daemonset)
            .await
            .context(prepull_error::CreateSnafu { component })
    }

    #[instrument(skip(self), err)]
    async fn wait_func(&self, component: ControlPlaneComponent) -> Result<()> {
        self.waiter
            .wait_for_pods_with_label(&component.prepull_label_selector())
            .await
            .context(prepull_error::WaitSnafu { component })
    }

    #[instrument(skip(self), err)]
    async fn delete_func(&self, component: ControlPlaneComponent) -> Result<()> {
        self.cluster_client
            .delete_daemonset(&component.prepull_name())
            .await
            .context(prepull_error::DeleteSnafu { component })
    }
}

/// Pre-pulls the images for every control-plane component at `version`, failing if they are not all
/// present within `timeout`.
///
/// Components that complete are cleaned up immediately. On timeout, outstanding components are
/// handled according to `cleanup_policy`.
#[instrument(skip(prepuller), err)]
pub async fn prepull_images_in_parallel<P: Prepuller + 'static>(
    prepuller: Arc<P>,
    image_repository: &str,
    version: &str,
    timeout: Duration,
    cleanup_policy: TimeoutCleanupPolicy,
) -> Result<()> {
    for component in CONTROL_PLANE_COMPONENTS {
        let image = component.image(image_repository, version);
        if let Err(err) = prepuller.create_func(component, &image).await {
            // A missing image for one component shouldn't keep the others from pre-pulling.
            event!(Level::WARN, %component, error = %err, "Unable to start pre-pulling image.");
        } else {
            event!(Level::INFO, %component, %image, "Started pre-pulling image.");
        }
    }

    let (tx, mut rx) = mpsc::channel(CONTROL_PLANE_COMPONENTS.len());
    let waits: Vec<JoinHandle<()>> = CONTROL_PLANE_COMPONENTS
        .iter()
        .map(|&component| {
            let prepuller = prepuller.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match prepuller.wait_func(component).await {
                    // The collector only stops listening once it has given up on every task.
                    Ok(()) => {
                        let _ = tx.send(component).await;
                    }
                    // The component stays outstanding; the global timeout still governs.
                    Err(err) => {
                        event!(Level::WARN, %component, error = %err, "Pre-pull wait ended without a running pod.");
                    }
                }
            })
        })
        .collect();
    drop(tx);

    let mut outstanding: BTreeSet<ControlPlaneComponent> =
        CONTROL_PLANE_COMPONENTS.iter().copied().collect();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while !outstanding.is_empty() {
        tokio::select! {
            biased;

            Some(component) = rx.recv() => {
                if let Err(err) = completed(prepuller.as_ref(), &mut outstanding, component).await {
                    abort_all(&waits);
                    return Err(err);
                }
            }
            _ = &mut deadline => {
                abort_all(&waits);
                // Completions that queued up behind a slow delete still count as completed.
                while let Ok(component) = rx.try_recv() {
                    if let Err(err) = completed(prepuller.as_ref(), &mut outstanding, component).await {
                        event!(Level::WARN, %component, error = %err, "Unable to clean up after timeout.");
                    }
                }
                return Err(timed_out(prepuller.as_ref(), outstanding, timeout, cleanup_policy).await);
            }
        }
    }

    event!(Level::INFO, "Successfully pre-pulled all control plane images.");
    Ok(())
}

async fn completed<P: Prepuller>(
    prepuller: &P,
    outstanding: &mut BTreeSet<ControlPlaneComponent>,
    component: ControlPlaneComponent,
) -> Result<()> {
    outstanding.remove(&component);
    event!(Level::INFO, %component, "Image pre-pulled.");
    prepuller.delete_func(component).await
}

fn abort_all(waits: &[JoinHandle<()>]) {
    for wait in waits {
        wait.abort();
    }
}

async fn timed_out<P: Prepuller>(
    prepuller: &P,
    outstanding: BTreeSet<ControlPlaneComponent>,
    timeout: Duration,
    cleanup_policy: TimeoutCleanupPolicy,
) -> prepull_error::Error {
    let outstanding: Vec<ControlPlaneComponent> = outstanding.into_iter().collect();
    match cleanup_policy {
        TimeoutCleanupPolicy::Leave => {
            let names: Vec<String> = outstanding.iter().map(|c| c.prepull_name()).collect();
            event!(
                Level::WARN,
                daemonsets = ?names,
                "Leaving pre-pull DaemonSets in place for inspection; delete them manually."
            );
        }
        TimeoutCleanupPolicy::Delete => {
            for component in &outstanding {
                if let Err(err) = prepuller.delete_func(*component).await {
                    event!(Level::WARN, %component, error = %err, "Unable to clean up after timeout.");
                }
            }
        }
    }
    prepull_error::Error::Timeout {
        timeout,
        outstanding: outstanding
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    }
}

type Result<T> = std::result::Result<T, prepull_error::Error>;

pub mod prepull_error {
    use crate::waiter::waiter_error;
    use models::cluster::ClusterClientError;
    use models::component::ControlPlaneComponent;
    use snafu::Snafu;
    use std::time::Duration;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to create the {} pre-pull DaemonSet: '{}'", component, source))]
        Create {
            component: ControlPlaneComponent,
            source: ClusterClientError,
        },

        #[snafu(display("Unable to wait for the {} image to be pre-pulled: '{}'", component, source))]
        Wait {
            component: ControlPlaneComponent,
            source: waiter_error::Error,
        },

        #[snafu(display("Unable to delete the {} pre-pull DaemonSet: '{}'", component, source))]
        Delete {
            component: ControlPlaneComponent,
            source: ClusterClientError,
        },

        #[snafu(display(
            "The pre-pull operation timed out after {:?}; still waiting on: {}",
            timeout,
            outstanding
        ))]
        Timeout {
            timeout: Duration,
            outstanding: String,
        },
    }
}
