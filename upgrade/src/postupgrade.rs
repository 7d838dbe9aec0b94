use models::cluster::ClusterClient;
use models::config::InternalMasterConfiguration;

use async_trait::async_trait;
use snafu::{ensure, ResultExt};
use tracing::{event, instrument, Level};

#[cfg(test)]
use mockall::mock;

/// Work that runs once every control-plane component has been upgraded.
#[async_trait]
pub trait PostUpgradeTask: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, config: &InternalMasterConfiguration) -> Result<()>;
}

#[cfg(test)]
mock! {
    /// A Mock PostUpgradeTask for use in tests.
    pub PostUpgradeTask {}
    #[async_trait]
    impl PostUpgradeTask for PostUpgradeTask {
        fn name(&self) -> &str;
        async fn run(&self, config: &InternalMasterConfiguration) -> Result<()>;
    }
}

/// Stores the configuration the cluster was upgraded with, so later upgrades can find it.
pub struct UploadConfiguration<T: ClusterClient> {
    cluster_client: T,
}

impl<T: ClusterClient> UploadConfiguration<T> {
    pub fn new(cluster_client: T) -> Self {
        UploadConfiguration { cluster_client }
    }
}

#[async_trait]
impl<T: ClusterClient> PostUpgradeTask for UploadConfiguration<T> {
    fn name(&self) -> &str {
        "upload-config"
    }

    #[instrument(skip(self, config), err)]
    async fn run(&self, config: &InternalMasterConfiguration) -> Result<()> {
        let config_map = config
            .to_config_map()
            .context(postupgrade_error::EncodeConfigSnafu)?;
        self.cluster_client
            .apply_config_map(&config_map)
            .await
            .context(postupgrade_error::UploadConfigSnafu)
    }
}

/// Runs every task in order. A failing task does not stop the others; all failures are reported
/// together.
#[instrument(skip(tasks, config), err)]
pub async fn run_post_upgrade_tasks(
    tasks: &[Box<dyn PostUpgradeTask>],
    config: &InternalMasterConfiguration,
) -> Result<()> {
    let mut failures = Vec::new();
    for task in tasks {
        event!(Level::INFO, task = task.name(), "Running post-upgrade task.");
        if let Err(err) = task.run(config).await {
            event!(Level::ERROR, task = task.name(), error = %err, "Post-upgrade task failed.");
            failures.push(format!("{}: {}", task.name(), err));
        }
    }

    ensure!(
        failures.is_empty(),
        postupgrade_error::TasksFailedSnafu {
            failures: failures.join("; ")
        }
    );
    Ok(())
}

type Result<T> = std::result::Result<T, postupgrade_error::Error>;

pub mod postupgrade_error {
    use models::cluster::ClusterClientError;
    use models::config::config_error;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to encode the cluster configuration: '{}'", source))]
        EncodeConfig { source: config_error::Error },

        #[snafu(display("Unable to upload the cluster configuration: '{}'", source))]
        UploadConfig { source: ClusterClientError },

        #[snafu(display("Post-upgrade tasks failed: {}", failures))]
        TasksFailed { failures: String },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::cluster::MockClusterClient;
    use models::config::MasterConfiguration;
    use models::constants::{KUBEADM_CONFIG_MAP, KUBEADM_CONFIG_MAP_KEY};
    use std::sync::Arc;

    fn config() -> InternalMasterConfiguration {
        let mut config = MasterConfiguration::default().to_internal();
        config.kubernetes_version = "v1.7.5".to_string();
        config.node_name = "master-0".to_string();
        config
    }

    #[tokio::test]
    async fn test_upload_configuration() {
        let mut cluster_client = MockClusterClient::new();
        cluster_client
            .expect_apply_config_map()
            .times(1)
            .returning(|config_map| {
                assert_eq!(config_map.metadata.name.as_deref(), Some(KUBEADM_CONFIG_MAP));
                let stored = &config_map.data.as_ref().unwrap()[KUBEADM_CONFIG_MAP_KEY];
                let uploaded = MasterConfiguration::from_yaml(stored).unwrap();
                assert_eq!(uploaded.kubernetes_version.as_deref(), Some("v1.7.5"));
                Ok(())
            });

        UploadConfiguration::new(Arc::new(cluster_client))
            .run(&config())
            .await
            .unwrap();
    }

    fn task(name: &'static str, succeed: bool) -> Box<dyn PostUpgradeTask> {
        let mut task = MockPostUpgradeTask::new();
        task.expect_name().return_const(name.to_string());
        task.expect_run().times(1).returning(move |_| {
            if succeed {
                Ok(())
            } else {
                Err(postupgrade_error::Error::TasksFailed {
                    failures: "boom".to_string(),
                })
            }
        });
        Box::new(task)
    }

    #[tokio::test]
    async fn test_all_tasks_run_despite_failures() {
        let tasks = vec![
            task("first", false),
            task("second", true),
            task("third", false),
        ];

        let result = run_post_upgrade_tasks(&tasks, &config()).await;
        match result {
            Err(postupgrade_error::Error::TasksFailed { failures }) => {
                assert!(failures.contains("first"));
                assert!(!failures.contains("second"));
                assert!(failures.contains("third"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_tasks_succeeds() {
        assert!(run_post_upgrade_tasks(&[], &config()).await.is_ok());
    }
}
